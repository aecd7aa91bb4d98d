//! Peer parity transport
//!
//! After a stripe is classified and its parity computed, the leader ships
//! the outcome to the other parity shards of the object so every parity
//! target converges on the same stripe state:
//!
//! - [`ParityForwardRequest`] carries one freshly computed parity cell and
//!   the list of replica footprints the peer must remove. With
//!   `parity: None` it degrades to a removal-only round, used when only
//!   hold-over extents need to be purged from peers.
//! - [`ReplicateRequest`] is the hole path: the peer writes the shipped
//!   ranges back as plain replicas and removes its parity for the stripe,
//!   reverting the stripe to replicas-only.
//!
//! Requests are self-contained wire types; the transport owns connection
//! management and bulk transfer of the payload bytes.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cluster::ShardLocation;
use crate::error::Result;
use crate::layout::{ContainerId, Epoch, EpochRange, Extent, Key, PoolId, ShardObjectId};

// =============================================================================
// Wire types
// =============================================================================

/// One replica footprint a peer must remove, with the epoch it was written
/// at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub recx: Extent,
    pub epoch: Epoch,
}

/// Ship one parity cell and/or a removal list to a peer parity shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParityForwardRequest {
    pub pool: PoolId,
    pub container: ContainerId,

    /// Object id rewritten to the peer's shard.
    pub oid: ShardObjectId,

    pub dkey: Key,
    pub akey: Key,

    /// `[pass lo, stripe hi_epoch]`; bounds the peer's removals.
    pub epoch_range: EpochRange,

    pub stripe: u64,
    pub map_version: u32,
    pub record_size: usize,

    /// The peer's parity cell for this stripe. `None` makes this a
    /// removal-only request.
    pub parity: Option<Bytes>,

    /// Replica footprints to remove on the peer.
    pub removals: Vec<RemovalRecord>,
}

/// Re-replicate valid stripe ranges on a peer parity shard and drop its
/// parity for the stripe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub pool: PoolId,
    pub container: ContainerId,

    /// Object id rewritten to the peer's shard.
    pub oid: ShardObjectId,

    pub dkey: Key,
    pub akey: Key,

    pub stripe: u64,

    /// Epoch the replicas are written at; also the upper removal bound for
    /// the peer's parity.
    pub epoch: Epoch,

    /// Lower removal bound for the peer's parity.
    pub epoch_lo: Epoch,

    pub map_version: u32,
    pub record_size: usize,

    /// Valid ranges of the stripe, packed in recx order in `data`.
    pub recxs: Vec<Extent>,
    pub data: Bytes,
}

// =============================================================================
// Transport port
// =============================================================================

/// Port onto the RPC layer connecting peer parity shards.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver a parity-forward request and wait for the peer's status.
    async fn forward_parity(
        &self,
        peer: ShardLocation,
        request: ParityForwardRequest,
    ) -> Result<()>;

    /// Deliver a re-replicate request and wait for the peer's status.
    async fn replicate(&self, peer: ShardLocation, request: ReplicateRequest) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ObjectId;

    #[test]
    fn test_removal_only_request_has_no_payload() {
        let req = ParityForwardRequest {
            pool: PoolId(1),
            container: ContainerId(2),
            oid: ShardObjectId::new(ObjectId(3), 5),
            dkey: Key::from("dk"),
            akey: Key::from("ak"),
            epoch_range: EpochRange::new(1, 9),
            stripe: 0,
            map_version: 1,
            record_size: 8,
            parity: None,
            removals: vec![RemovalRecord {
                recx: Extent::new(0, 8),
                epoch: 9,
            }],
        };
        assert!(req.parity.is_none());
        assert_eq!(req.removals.len(), 1);
    }
}
