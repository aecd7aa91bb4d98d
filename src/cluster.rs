//! Pool membership port
//!
//! Leader election and failed-target knowledge live in the pool service;
//! the engine only consults them. Aggregation runs exclusively on parity
//! shards whose target is the elected leader at the current map version,
//! and a stripe is never committed while one of its peer parity targets is
//! failed in the pool map.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layout::ShardObjectId;

/// Network location of one shard: engine rank plus target index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ShardLocation {
    pub rank: u32,
    pub target: u32,
}

impl ShardLocation {
    pub fn new(rank: u32, target: u32) -> Self {
        Self { rank, target }
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank{}/tgt{}", self.rank, self.target)
    }
}

/// Port onto the pool map and leader election.
pub trait Membership: Send + Sync {
    /// Current pool map version.
    fn map_version(&self) -> u32;

    /// True if the local target leads aggregation for this shard at the
    /// given map version.
    fn is_leader(&self, oid: &ShardObjectId, map_version: u32) -> Result<bool>;

    /// True if the target at `location` is failed in the current pool map.
    fn is_failed(&self, location: &ShardLocation) -> bool;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        assert_eq!(ShardLocation::new(2, 7).to_string(), "rank2/tgt7");
    }
}
