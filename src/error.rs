//! Error types for the stripe aggregation engine

use thiserror::Error;

use crate::cluster::ShardLocation;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while aggregating erasure-coded stripes
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Extent store reported a concurrency-control conflict; the caller
    /// must restart the traversal from fresh anchors
    #[error("extent store needs transaction refresh")]
    NeedsRefresh,

    /// Extent store operation failed
    #[error("extent store {op} failed: {reason}")]
    Store { op: &'static str, reason: String },

    /// Cross-shard object fetch failed
    #[error("object fetch from shard {shard} failed: {reason}")]
    ObjectFetch { shard: u32, reason: String },

    /// A peer parity target is marked failed in the current pool map
    #[error("peer parity target {peer} is failed in pool map version {map_version}")]
    PeerUnavailable { peer: ShardLocation, map_version: u32 },

    /// Peer RPC returned a failure status
    #[error("peer {peer} rejected {rpc} for stripe {stripe}: {reason}")]
    PeerRejected {
        peer: ShardLocation,
        rpc: &'static str,
        stripe: u64,
        reason: String,
    },

    /// Peer transport failed before a reply was received
    #[error("transport to peer {peer} failed: {reason}")]
    Transport { peer: ShardLocation, reason: String },

    /// Invalid EC class parameters
    #[error("invalid EC class: {0}")]
    InvalidClass(String),

    /// Parity codec failure
    #[error("parity codec error: {0}")]
    Codec(String),

    /// Offloaded work was lost before completing
    #[error("offload worker dropped its completion handle")]
    OffloadLost,

    /// Aggregation invariant violated; indicates a programming error
    #[error("aggregation invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// True if the error demands a full traversal restart rather than a
    /// per-stripe retry.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Error::NeedsRefresh)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_refresh_classification() {
        assert!(Error::NeedsRefresh.needs_refresh());
        assert!(!Error::Codec("bad matrix".into()).needs_refresh());
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::PeerRejected {
            peer: ShardLocation::new(3, 1),
            rpc: "forward_parity",
            stripe: 42,
            reason: "stale map".into(),
        };
        let text = err.to_string();
        assert!(text.contains("stripe 42"));
        assert!(text.contains("forward_parity"));
    }
}
