//! Extent store port
//!
//! The versioned, log-structured record store underneath the engine. The
//! engine walks it in (object, dkey, akey, recx) order through a visitor,
//! fetches and updates record ranges, and removes replica footprints after
//! a stripe has been secured as parity.
//!
//! The store owns transaction discipline: a traversal that races a
//! distributed transaction surfaces [`Error::NeedsRefresh`], and the driver
//! restarts from fresh anchors. The store also owns checksum verification;
//! the engine only threads the container's `checksums_enabled` flag through
//! fetch and update calls.

use async_trait::async_trait;

use crate::error::Result;
use crate::layout::{ContainerId, EcClass, Epoch, EpochRange, Extent, Key, PoolId, ShardObjectId};

// =============================================================================
// Container handle
// =============================================================================

/// An open container on the local target.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub pool: PoolId,
    pub container: ContainerId,

    /// Per-container checksum policy; when set, fetched data is verified and
    /// written parity carries computed checksums.
    pub checksums_enabled: bool,
}

// =============================================================================
// Iteration
// =============================================================================

/// Parameters driving one traversal.
#[derive(Debug, Clone, Default)]
pub struct IterParam {
    /// Only extents whose epoch lies in this range are visible.
    pub epoch_range: Option<EpochRange>,

    /// Restrict to a single object (nested iteration).
    pub object: Option<ShardObjectId>,

    /// Restrict to a single dkey (nested iteration).
    pub dkey: Option<Key>,

    /// Restrict to a single akey (nested iteration).
    pub akey: Option<Key>,

    /// Restrict recx entries to this index range; used by the parity probe
    /// to query the reserved parity extent of one stripe.
    pub recx_filter: Option<Extent>,
}

/// One record extent as yielded by the recx iterator.
#[derive(Debug, Clone)]
pub struct RecxEntry {
    /// Visible portion of the extent.
    pub recx: Extent,

    /// Footprint the extent was originally written with; removal targets
    /// this range, never the trimmed visible one.
    pub orig_recx: Extent,

    pub epoch: Epoch,

    /// Punched-hole extent: occupies index space, carries no data.
    pub is_hole: bool,

    /// Record size of the enclosing array akey, in bytes.
    pub record_size: usize,

    /// The extent carries a checksum descriptor and must be verified by the
    /// store before its bytes are used.
    pub has_checksum: bool,
}

/// Child kind of an akey node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AkeyKind {
    /// Array of fixed-size records; the only kind the engine aggregates.
    Array,
    /// Single-value akey; always skipped.
    Single,
}

/// One node of the traversal, handed to the visitor in tree order.
#[derive(Debug, Clone)]
pub enum IterItem {
    Object { oid: ShardObjectId },
    DKey { key: Key },
    AKey { key: Key, kind: AkeyKind },
    Recx { entry: RecxEntry },
}

/// Visitor verdict for a pre-order callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Descend into this subtree.
    Continue,
    /// Skip this subtree and move to its sibling.
    Skip,
    /// Unwind the whole traversal cleanly (cooperative abort).
    Abort,
}

/// Callbacks invoked around every traversal node.
///
/// `pre` runs before a subtree is entered and may skip it; `post` runs after
/// the subtree completes and may abort the traversal (used for cooperative
/// yield bookkeeping).
#[async_trait]
pub trait IterVisitor: Send {
    async fn pre(&mut self, item: &IterItem) -> Result<Decision>;

    async fn post(&mut self, item: &IterItem) -> Result<Decision>;
}

// =============================================================================
// Store port
// =============================================================================

/// Port onto the local versioned extent store.
#[async_trait]
pub trait ExtentStore: Send + Sync {
    /// Walk the container in (object, dkey, akey, recx) order, visible
    /// extents only, bounded by `param.epoch_range`. Parity extents are not
    /// yielded unless `param.recx_filter` addresses the parity index range.
    async fn iterate(
        &self,
        container: &ContainerHandle,
        param: &IterParam,
        visitor: &mut (dyn IterVisitor + '_),
    ) -> Result<()>;

    /// Read `recxs` of one akey as of `epoch` into `buf`, packed in recx
    /// order. Records never written read back as zeros.
    #[allow(clippy::too_many_arguments)]
    async fn fetch(
        &self,
        container: &ContainerHandle,
        oid: ShardObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        record_size: usize,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Write `recxs` of one akey at `epoch` from `data`, packed in recx
    /// order.
    #[allow(clippy::too_many_arguments)]
    async fn update(
        &self,
        container: &ContainerHandle,
        oid: ShardObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        record_size: usize,
        data: &[u8],
    ) -> Result<()>;

    /// Remove every extent of one akey overlapping `recx` whose epoch lies
    /// in `epr`. Removing an empty range is a no-op, not an error.
    #[allow(clippy::too_many_arguments)]
    async fn range_remove(
        &self,
        container: &ContainerHandle,
        oid: ShardObjectId,
        epr: EpochRange,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) -> Result<()>;

    /// EC class attributes of an object, or `None` for non-EC classes.
    fn oclass_attrs(&self, oid: &ShardObjectId) -> Option<EcClass>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_param_default_is_unfiltered() {
        let param = IterParam::default();
        assert!(param.epoch_range.is_none());
        assert!(param.object.is_none());
        assert!(param.recx_filter.is_none());
    }

    #[test]
    fn test_decision_is_copy() {
        let d = Decision::Skip;
        let e = d;
        assert_eq!(d, e);
    }
}
