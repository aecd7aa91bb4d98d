//! Object client port
//!
//! Cross-shard reads go through the object client rather than the local
//! store: old data cells at the parity epoch, complementary cells for a
//! recalculation, and valid ranges for hole re-replication all live on the
//! data shards of the object. The client resolves the object layout, which
//! is also where the engine learns the network locations of its peer parity
//! shards.

use async_trait::async_trait;

use crate::cluster::ShardLocation;
use crate::error::Result;
use crate::layout::{Epoch, Extent, Key, ObjectId};

/// Port onto the object layer of the store cluster.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Open an object for cross-shard access.
    async fn open(&self, oid: ObjectId) -> Result<Box<dyn ObjectHandle>>;
}

/// An open object. Dropped handles release their resources.
#[async_trait]
pub trait ObjectHandle: Send + Sync {
    /// Shard locations indexed by shard id, one entry per shard in
    /// `[0, K + P)` of each group.
    fn layout(&self) -> Result<Vec<ShardLocation>>;

    /// Read `recxs` of one akey as of `epoch` into `buf`, packed in recx
    /// order. With `peer_shard` set the read is directed at that specific
    /// shard (used to pull peer parity cells); otherwise the client gathers
    /// from the data shards.
    #[allow(clippy::too_many_arguments)]
    async fn fetch(
        &self,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        record_size: usize,
        buf: &mut [u8],
        peer_shard: Option<u32>,
    ) -> Result<()>;
}
