//! In-memory store cluster
//!
//! A self-contained implementation of every port the engine consumes,
//! backed by plain maps. One [`MemTarget`] plays the local extent store of
//! a parity target; a [`MemCluster`] wires several targets together with a
//! logical object view for cross-shard reads, a loopback peer transport,
//! and a controllable pool map.
//!
//! Fixture simplifications, none of which the engine can observe through
//! its ports:
//!
//! - extents are returned as written; tests write non-overlapping ranges,
//!   so visibility trimming never has work to do
//! - cross-shard fetches read a flat logical view of the object instead of
//!   re-deriving cell placement
//! - checksum descriptors are never attached

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::client::{ObjectClient, ObjectHandle};
use crate::cluster::{Membership, ShardLocation};
use crate::error::{Error, Result};
use crate::layout::{EcClass, Epoch, EpochRange, Extent, Key, ObjectId, ShardObjectId};
use crate::rpc::{ParityForwardRequest, PeerTransport, ReplicateRequest};
use crate::store::{
    AkeyKind, ContainerHandle, Decision, ExtentStore, IterItem, IterParam, IterVisitor, RecxEntry,
};

// =============================================================================
// Target store
// =============================================================================

/// One stored extent, with its payload.
#[derive(Debug, Clone)]
pub struct MemExtent {
    pub recx: Extent,
    pub orig_recx: Extent,
    pub epoch: Epoch,
    pub is_hole: bool,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct AkeyTree {
    kind: AkeyKind,
    record_size: usize,
    extents: Vec<MemExtent>,
}

type ObjectTree = BTreeMap<Key, BTreeMap<Key, AkeyTree>>;

/// In-memory versioned extent store for a single target.
pub struct MemTarget {
    objects: Mutex<BTreeMap<ShardObjectId, ObjectTree>>,
    classes: Arc<DashMap<ObjectId, EcClass>>,

    /// Pending needs-refresh trips; each `iterate` consumes one.
    refresh_trips: AtomicU32,
}

impl MemTarget {
    fn new(classes: Arc<DashMap<ObjectId, EcClass>>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            classes,
            refresh_trips: AtomicU32::new(0),
        }
    }

    /// Make the next `n` traversals fail with a refresh request.
    pub fn trip_refresh(&self, n: u32) {
        self.refresh_trips.store(n, Ordering::SeqCst);
    }

    /// Write one extent of data.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        oid: ShardObjectId,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
        epoch: Epoch,
        record_size: usize,
        data: &[u8],
    ) {
        assert_eq!(data.len(), recx.len as usize * record_size);
        self.insert(
            oid,
            dkey,
            akey,
            record_size,
            MemExtent {
                recx,
                orig_recx: recx,
                epoch,
                is_hole: false,
                bytes: data.to_vec(),
            },
        );
    }

    /// Punch a hole extent.
    pub fn punch(
        &self,
        oid: ShardObjectId,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
        epoch: Epoch,
        record_size: usize,
    ) {
        self.insert(
            oid,
            dkey,
            akey,
            record_size,
            MemExtent {
                recx,
                orig_recx: recx,
                epoch,
                is_hole: true,
                bytes: Vec::new(),
            },
        );
    }

    /// Register a single-value akey (skipped by aggregation).
    pub fn put_single(&self, oid: ShardObjectId, dkey: &Key, akey: &Key) {
        let mut objects = self.objects.lock();
        objects
            .entry(oid)
            .or_default()
            .entry(dkey.clone())
            .or_default()
            .insert(
                akey.clone(),
                AkeyTree {
                    kind: AkeyKind::Single,
                    record_size: 1,
                    extents: Vec::new(),
                },
            );
    }

    /// Snapshot of (recx, epoch, is_hole) for assertions.
    pub fn extents(&self, oid: ShardObjectId, dkey: &Key, akey: &Key) -> Vec<(Extent, Epoch, bool)> {
        let objects = self.objects.lock();
        objects
            .get(&oid)
            .and_then(|o| o.get(dkey))
            .and_then(|d| d.get(akey))
            .map(|t| {
                t.extents
                    .iter()
                    .map(|e| (e.recx, e.epoch, e.is_hole))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Data-space extents only.
    pub fn data_extents(
        &self,
        oid: ShardObjectId,
        dkey: &Key,
        akey: &Key,
    ) -> Vec<(Extent, Epoch, bool)> {
        self.extents(oid, dkey, akey)
            .into_iter()
            .filter(|(r, _, _)| !r.is_parity())
            .collect()
    }

    /// Parity-space extents only.
    pub fn parity_extents(
        &self,
        oid: ShardObjectId,
        dkey: &Key,
        akey: &Key,
    ) -> Vec<(Extent, Epoch, bool)> {
        self.extents(oid, dkey, akey)
            .into_iter()
            .filter(|(r, _, _)| r.is_parity())
            .collect()
    }

    /// Read a range as of an epoch; unwritten records come back zeroed.
    pub fn read(
        &self,
        oid: ShardObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
        record_size: usize,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; recx.len as usize * record_size];
        let objects = self.objects.lock();
        if let Some(tree) = objects.get(&oid).and_then(|o| o.get(dkey)).and_then(|d| d.get(akey)) {
            read_range(tree, recx, epoch, record_size, &mut buf);
        }
        buf
    }

    fn insert(
        &self,
        oid: ShardObjectId,
        dkey: &Key,
        akey: &Key,
        record_size: usize,
        extent: MemExtent,
    ) {
        let mut objects = self.objects.lock();
        let tree = objects
            .entry(oid)
            .or_default()
            .entry(dkey.clone())
            .or_default()
            .entry(akey.clone())
            .or_insert_with(|| AkeyTree {
                kind: AkeyKind::Array,
                record_size,
                extents: Vec::new(),
            });
        tree.record_size = record_size;
        tree.extents.push(extent);
        tree.extents.sort_by_key(|e| (e.recx.start, e.epoch));
    }

    #[allow(clippy::too_many_arguments)]
    fn write_packed(
        &self,
        oid: ShardObjectId,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        epoch: Epoch,
        record_size: usize,
        data: &[u8],
    ) -> Result<()> {
        let total: usize = recxs.iter().map(|r| r.len as usize * record_size).sum();
        if data.len() < total {
            return Err(Error::Store {
                op: "update",
                reason: format!("payload {} bytes, extents need {}", data.len(), total),
            });
        }
        let mut off = 0;
        for recx in recxs {
            let n = recx.len as usize * record_size;
            self.write(oid, dkey, akey, *recx, epoch, record_size, &data[off..off + n]);
            off += n;
        }
        Ok(())
    }

    fn remove_range(
        &self,
        oid: ShardObjectId,
        epr: EpochRange,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) {
        let mut objects = self.objects.lock();
        let Some(tree) = objects
            .get_mut(&oid)
            .and_then(|o| o.get_mut(dkey))
            .and_then(|d| d.get_mut(akey))
        else {
            return;
        };
        let record_size = tree.record_size;
        let mut kept = Vec::with_capacity(tree.extents.len());
        for ext in tree.extents.drain(..) {
            if !epr.contains(ext.epoch) || !ext.recx.overlaps(&recx) {
                kept.push(ext);
                continue;
            }
            // trim the removed middle, keeping untouched edges
            if ext.recx.start < recx.start {
                let left = Extent::new(ext.recx.start, recx.start - ext.recx.start);
                let bytes = if ext.is_hole {
                    Vec::new()
                } else {
                    ext.bytes[..left.len as usize * record_size].to_vec()
                };
                kept.push(MemExtent {
                    recx: left,
                    orig_recx: ext.orig_recx,
                    epoch: ext.epoch,
                    is_hole: ext.is_hole,
                    bytes,
                });
            }
            if ext.recx.end() > recx.end() {
                let right = Extent::new(recx.end(), ext.recx.end() - recx.end());
                let skip = (right.start - ext.recx.start) as usize * record_size;
                let bytes = if ext.is_hole {
                    Vec::new()
                } else {
                    ext.bytes[skip..].to_vec()
                };
                kept.push(MemExtent {
                    recx: right,
                    orig_recx: ext.orig_recx,
                    epoch: ext.epoch,
                    is_hole: ext.is_hole,
                    bytes,
                });
            }
        }
        tree.extents = kept;
    }
}

/// Fill `out` with the content of `recx` as of `epoch`: per record, the
/// highest-epoch non-future extent wins; holes and unwritten records read
/// as zeros.
fn read_range(tree: &AkeyTree, recx: Extent, epoch: Epoch, record_size: usize, out: &mut [u8]) {
    for rec in 0..recx.len {
        let index = recx.start + rec;
        let mut best: Option<&MemExtent> = None;
        for ext in &tree.extents {
            if ext.epoch > epoch {
                continue;
            }
            if index < ext.recx.start || index >= ext.recx.end() {
                continue;
            }
            if best.is_none_or(|b| ext.epoch >= b.epoch) {
                best = Some(ext);
            }
        }
        let dst = &mut out[rec as usize * record_size..(rec as usize + 1) * record_size];
        match best {
            Some(ext) if !ext.is_hole => {
                let src = (index - ext.recx.start) as usize * record_size;
                dst.copy_from_slice(&ext.bytes[src..src + record_size]);
            }
            _ => dst.fill(0),
        }
    }
}

// =============================================================================
// ExtentStore port
// =============================================================================

/// Result of delivering one visitor callback.
enum Flow {
    Descend,
    Sibling,
    Stop,
}

async fn deliver_pre(visitor: &mut (dyn IterVisitor + '_), item: &IterItem) -> Result<Flow> {
    Ok(match visitor.pre(item).await? {
        Decision::Continue => Flow::Descend,
        Decision::Skip => Flow::Sibling,
        Decision::Abort => Flow::Stop,
    })
}

async fn deliver_post(visitor: &mut (dyn IterVisitor + '_), item: &IterItem) -> Result<Flow> {
    Ok(match visitor.post(item).await? {
        Decision::Abort => Flow::Stop,
        _ => Flow::Descend,
    })
}

#[async_trait]
impl ExtentStore for MemTarget {
    async fn iterate(
        &self,
        _container: &ContainerHandle,
        param: &IterParam,
        visitor: &mut (dyn IterVisitor + '_),
    ) -> Result<()> {
        if self
            .refresh_trips
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(Error::NeedsRefresh);
        }

        let oids: Vec<ShardObjectId> = {
            let objects = self.objects.lock();
            objects
                .keys()
                .filter(|oid| param.object.is_none_or(|f| f == **oid))
                .copied()
                .collect()
        };

        for oid in oids {
            match deliver_pre(visitor, &IterItem::Object { oid }).await? {
                Flow::Sibling => continue,
                Flow::Stop => return Ok(()),
                Flow::Descend => {}
            }

            let dkeys: Vec<Key> = {
                let objects = self.objects.lock();
                objects
                    .get(&oid)
                    .map(|o| {
                        o.keys()
                            .filter(|k| param.dkey.as_ref().is_none_or(|f| f == *k))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };

            for dkey in dkeys {
                match deliver_pre(visitor, &IterItem::DKey { key: dkey.clone() }).await? {
                    Flow::Sibling => continue,
                    Flow::Stop => return Ok(()),
                    Flow::Descend => {}
                }

                let akeys: Vec<(Key, AkeyKind)> = {
                    let objects = self.objects.lock();
                    objects
                        .get(&oid)
                        .and_then(|o| o.get(&dkey))
                        .map(|d| {
                            d.iter()
                                .filter(|(k, _)| param.akey.as_ref().is_none_or(|f| f == *k))
                                .map(|(k, t)| (k.clone(), t.kind))
                                .collect()
                        })
                        .unwrap_or_default()
                };

                for (akey, kind) in akeys {
                    let item = IterItem::AKey {
                        key: akey.clone(),
                        kind,
                    };
                    match deliver_pre(visitor, &item).await? {
                        Flow::Sibling => continue,
                        Flow::Stop => return Ok(()),
                        Flow::Descend => {}
                    }

                    let entries: Vec<RecxEntry> = {
                        let objects = self.objects.lock();
                        objects
                            .get(&oid)
                            .and_then(|o| o.get(&dkey))
                            .and_then(|d| d.get(&akey))
                            .map(|tree| {
                                let mut entries: Vec<RecxEntry> = tree
                                    .extents
                                    .iter()
                                    .filter(|e| match param.recx_filter {
                                        Some(filter) => e.recx.overlaps(&filter),
                                        // outer iteration never yields parity
                                        None => {
                                            !e.recx.is_parity()
                                                && param
                                                    .epoch_range
                                                    .is_none_or(|r| r.contains(e.epoch))
                                        }
                                    })
                                    // visible-extents mode: an extent fully
                                    // overwritten at a higher epoch is not
                                    // yielded
                                    .filter(|e| {
                                        !tree.extents.iter().any(|f| {
                                            f.epoch > e.epoch && f.recx.contains(&e.recx)
                                        })
                                    })
                                    .map(|e| RecxEntry {
                                        recx: e.recx,
                                        orig_recx: e.orig_recx,
                                        epoch: e.epoch,
                                        is_hole: e.is_hole,
                                        record_size: tree.record_size,
                                        has_checksum: false,
                                    })
                                    .collect();
                                entries.sort_by_key(|e| (e.recx.start, e.epoch));
                                entries
                            })
                            .unwrap_or_default()
                    };

                    for entry in entries {
                        let item = IterItem::Recx { entry };
                        match deliver_pre(visitor, &item).await? {
                            Flow::Stop => return Ok(()),
                            _ => {}
                        }
                        if let Flow::Stop = deliver_post(visitor, &item).await? {
                            return Ok(());
                        }
                    }

                    if let Flow::Stop = deliver_post(visitor, &item).await? {
                        return Ok(());
                    }
                }

                if let Flow::Stop =
                    deliver_post(visitor, &IterItem::DKey { key: dkey.clone() }).await?
                {
                    return Ok(());
                }
            }

            if let Flow::Stop = deliver_post(visitor, &IterItem::Object { oid }).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn fetch(
        &self,
        _container: &ContainerHandle,
        oid: ShardObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        record_size: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let total: usize = recxs.iter().map(|r| r.len as usize * record_size).sum();
        if buf.len() < total {
            return Err(Error::Store {
                op: "fetch",
                reason: format!("buffer {} bytes, extents need {}", buf.len(), total),
            });
        }
        let objects = self.objects.lock();
        let tree = objects.get(&oid).and_then(|o| o.get(dkey)).and_then(|d| d.get(akey));
        let mut off = 0;
        for recx in recxs {
            let n = recx.len as usize * record_size;
            let out = &mut buf[off..off + n];
            match tree {
                Some(tree) => read_range(tree, *recx, epoch, record_size, out),
                None => out.fill(0),
            }
            off += n;
        }
        Ok(())
    }

    async fn update(
        &self,
        _container: &ContainerHandle,
        oid: ShardObjectId,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        record_size: usize,
        data: &[u8],
    ) -> Result<()> {
        self.write_packed(oid, dkey, akey, recxs, epoch, record_size, data)
    }

    async fn range_remove(
        &self,
        _container: &ContainerHandle,
        oid: ShardObjectId,
        epr: EpochRange,
        dkey: &Key,
        akey: &Key,
        recx: Extent,
    ) -> Result<()> {
        self.remove_range(oid, epr, dkey, akey, recx);
        Ok(())
    }

    fn oclass_attrs(&self, oid: &ShardObjectId) -> Option<EcClass> {
        self.classes.get(&oid.object).map(|c| *c)
    }
}

// =============================================================================
// Cluster
// =============================================================================

struct ClusterInner {
    classes: Arc<DashMap<ObjectId, EcClass>>,
    logical: Arc<MemTarget>,
    targets: Mutex<HashMap<u32, Arc<MemTarget>>>,
    locations: Mutex<HashMap<u32, ShardLocation>>,
    by_location: Mutex<HashMap<ShardLocation, u32>>,
    failed: Mutex<HashSet<ShardLocation>>,
    not_led: Mutex<HashSet<ObjectId>>,
    map_version: AtomicU32,
}

/// A handful of parity targets, a logical object view, and a loopback peer
/// transport, wired for driving the engine end to end.
#[derive(Clone)]
pub struct MemCluster {
    inner: Arc<ClusterInner>,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCluster {
    pub fn new() -> Self {
        let classes: Arc<DashMap<ObjectId, EcClass>> = Arc::new(DashMap::new());
        Self {
            inner: Arc::new(ClusterInner {
                logical: Arc::new(MemTarget::new(classes.clone())),
                classes,
                targets: Mutex::new(HashMap::new()),
                locations: Mutex::new(HashMap::new()),
                by_location: Mutex::new(HashMap::new()),
                failed: Mutex::new(HashSet::new()),
                not_led: Mutex::new(HashSet::new()),
                map_version: AtomicU32::new(1),
            }),
        }
    }

    pub fn register_class(&self, oid: ObjectId, class: EcClass) {
        self.inner.classes.insert(oid, class);
    }

    /// Register a parity target for `shard` at `location`; returns its
    /// local store.
    pub fn add_target(&self, shard: u32, location: ShardLocation) -> Arc<MemTarget> {
        let target = Arc::new(MemTarget::new(self.inner.classes.clone()));
        self.inner.targets.lock().insert(shard, target.clone());
        self.inner.locations.lock().insert(shard, location);
        self.inner.by_location.lock().insert(location, shard);
        target
    }

    pub fn target(&self, shard: u32) -> Option<Arc<MemTarget>> {
        self.inner.targets.lock().get(&shard).cloned()
    }

    /// Client-visible object content, fed to cross-shard fetches. Objects
    /// are keyed at shard 0.
    pub fn logical(&self) -> Arc<MemTarget> {
        self.inner.logical.clone()
    }

    pub fn mark_failed(&self, location: ShardLocation) {
        self.inner.failed.lock().insert(location);
        self.inner.map_version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_not_led(&self, oid: ObjectId) {
        self.inner.not_led.lock().insert(oid);
    }

    fn target_at(&self, location: &ShardLocation) -> Result<Arc<MemTarget>> {
        let shard = self
            .inner
            .by_location
            .lock()
            .get(location)
            .copied()
            .ok_or_else(|| Error::Transport {
                peer: *location,
                reason: "no target registered at location".into(),
            })?;
        self.target(shard).ok_or_else(|| Error::Transport {
            peer: *location,
            reason: format!("shard {shard} has no store"),
        })
    }

    fn class_of(&self, oid: ObjectId) -> Result<EcClass> {
        self.inner
            .classes
            .get(&oid)
            .map(|c| *c)
            .ok_or_else(|| Error::InvalidClass(format!("object {:x} has no EC class", oid.0)))
    }
}

impl Membership for MemCluster {
    fn map_version(&self) -> u32 {
        self.inner.map_version.load(Ordering::SeqCst)
    }

    fn is_leader(&self, oid: &ShardObjectId, _map_version: u32) -> Result<bool> {
        Ok(!self.inner.not_led.lock().contains(&oid.object))
    }

    fn is_failed(&self, location: &ShardLocation) -> bool {
        self.inner.failed.lock().contains(location)
    }
}

// =============================================================================
// Object client
// =============================================================================

struct MemObjectHandle {
    cluster: MemCluster,
    oid: ObjectId,
}

#[async_trait]
impl ObjectClient for MemCluster {
    async fn open(&self, oid: ObjectId) -> Result<Box<dyn ObjectHandle>> {
        Ok(Box::new(MemObjectHandle {
            cluster: self.clone(),
            oid,
        }))
    }
}

#[async_trait]
impl ObjectHandle for MemObjectHandle {
    fn layout(&self) -> Result<Vec<ShardLocation>> {
        let locations = self.cluster.inner.locations.lock();
        let max = locations.keys().max().copied().unwrap_or(0);
        let mut layout = vec![ShardLocation::default(); max as usize + 1];
        for (shard, loc) in locations.iter() {
            layout[*shard as usize] = *loc;
        }
        Ok(layout)
    }

    async fn fetch(
        &self,
        epoch: Epoch,
        dkey: &Key,
        akey: &Key,
        recxs: &[Extent],
        record_size: usize,
        buf: &mut [u8],
        peer_shard: Option<u32>,
    ) -> Result<()> {
        let container = ContainerHandle {
            pool: crate::layout::PoolId(0),
            container: crate::layout::ContainerId(0),
            checksums_enabled: false,
        };
        match peer_shard {
            Some(shard) => {
                let target = self.cluster.target(shard).ok_or(Error::ObjectFetch {
                    shard,
                    reason: "no such shard".into(),
                })?;
                target
                    .fetch(
                        &container,
                        ShardObjectId::new(self.oid, shard),
                        epoch,
                        dkey,
                        akey,
                        recxs,
                        record_size,
                        buf,
                    )
                    .await
            }
            None => {
                self.cluster
                    .inner
                    .logical
                    .fetch(
                        &container,
                        ShardObjectId::new(self.oid, 0),
                        epoch,
                        dkey,
                        akey,
                        recxs,
                        record_size,
                        buf,
                    )
                    .await
            }
        }
    }
}

// =============================================================================
// Loopback peer transport
// =============================================================================

#[async_trait]
impl PeerTransport for MemCluster {
    async fn forward_parity(
        &self,
        peer: ShardLocation,
        request: ParityForwardRequest,
    ) -> Result<()> {
        let target = self.target_at(&peer)?;
        let class = self.class_of(request.oid.object)?;

        if let Some(parity) = &request.parity {
            target.write(
                request.oid,
                &request.dkey,
                &request.akey,
                class.parity_extent(request.stripe),
                request.epoch_range.hi,
                request.record_size,
                parity,
            );
        }

        if request.removals.is_empty() {
            // contained stripe: sweep the whole data range, whether or not
            // a parity cell rode along (the drop branch ships none)
            target.remove_range(
                request.oid,
                request.epoch_range,
                &request.dkey,
                &request.akey,
                class.stripe_extent(request.stripe),
            );
        } else {
            for removal in &request.removals {
                target.remove_range(
                    request.oid,
                    EpochRange::at(removal.epoch),
                    &request.dkey,
                    &request.akey,
                    removal.recx,
                );
            }
        }
        Ok(())
    }

    async fn replicate(&self, peer: ShardLocation, request: ReplicateRequest) -> Result<()> {
        let target = self.target_at(&peer)?;
        let class = self.class_of(request.oid.object)?;

        target.write_packed(
            request.oid,
            &request.dkey,
            &request.akey,
            &request.recxs,
            request.epoch,
            request.record_size,
            &request.data,
        )?;
        target.remove_range(
            request.oid,
            EpochRange::new(request.epoch_lo, request.epoch),
            &request.dkey,
            &request.akey,
            class.parity_extent(request.stripe),
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> ContainerHandle {
        ContainerHandle {
            pool: crate::layout::PoolId(0),
            container: crate::layout::ContainerId(0),
            checksums_enabled: false,
        }
    }

    fn oid() -> ShardObjectId {
        ShardObjectId::new(ObjectId(1), 2)
    }

    #[tokio::test]
    async fn test_write_then_fetch() {
        let cluster = MemCluster::new();
        let target = cluster.add_target(2, ShardLocation::new(0, 2));
        let (dkey, akey) = (Key::from("d"), Key::from("a"));

        target.write(oid(), &dkey, &akey, Extent::new(0, 4), 5, 2, &[1, 1, 2, 2, 3, 3, 4, 4]);

        let mut buf = vec![0u8; 8];
        target
            .fetch(&container(), oid(), 9, &dkey, &akey, &[Extent::new(0, 4)], 2, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, vec![1, 1, 2, 2, 3, 3, 4, 4]);

        // fetch below the write epoch sees nothing
        target
            .fetch(&container(), oid(), 4, &dkey, &akey, &[Extent::new(0, 4)], 2, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, vec![0u8; 8]);
    }

    #[tokio::test]
    async fn test_newest_epoch_wins_per_record() {
        let cluster = MemCluster::new();
        let target = cluster.add_target(2, ShardLocation::new(0, 2));
        let (dkey, akey) = (Key::from("d"), Key::from("a"));

        target.write(oid(), &dkey, &akey, Extent::new(0, 4), 5, 1, &[1, 2, 3, 4]);
        target.write(oid(), &dkey, &akey, Extent::new(1, 2), 7, 1, &[8, 9]);

        let mut buf = vec![0u8; 4];
        target
            .fetch(&container(), oid(), 9, &dkey, &akey, &[Extent::new(0, 4)], 1, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, vec![1, 8, 9, 4]);
    }

    #[tokio::test]
    async fn test_range_remove_trims_edges() {
        let cluster = MemCluster::new();
        let target = cluster.add_target(2, ShardLocation::new(0, 2));
        let (dkey, akey) = (Key::from("d"), Key::from("a"));

        target.write(oid(), &dkey, &akey, Extent::new(0, 8), 5, 1, &[1, 2, 3, 4, 5, 6, 7, 8]);
        target
            .range_remove(&container(), oid(), EpochRange::at(5), &dkey, &akey, Extent::new(2, 4))
            .await
            .unwrap();

        let exts = target.data_extents(oid(), &dkey, &akey);
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0].0, Extent::new(0, 2));
        assert_eq!(exts[1].0, Extent::new(6, 2));

        let mut buf = vec![0u8; 8];
        target
            .fetch(&container(), oid(), 9, &dkey, &akey, &[Extent::new(0, 8)], 1, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, vec![1, 2, 0, 0, 0, 0, 7, 8]);
    }

    #[tokio::test]
    async fn test_remove_outside_epoch_range_is_noop() {
        let cluster = MemCluster::new();
        let target = cluster.add_target(2, ShardLocation::new(0, 2));
        let (dkey, akey) = (Key::from("d"), Key::from("a"));

        target.write(oid(), &dkey, &akey, Extent::new(0, 4), 9, 1, &[1, 2, 3, 4]);
        target
            .range_remove(&container(), oid(), EpochRange::new(0, 8), &dkey, &akey, Extent::new(0, 4))
            .await
            .unwrap();
        assert_eq!(target.data_extents(oid(), &dkey, &akey).len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_trip_fires_once() {
        let cluster = MemCluster::new();
        let target = cluster.add_target(2, ShardLocation::new(0, 2));
        target.trip_refresh(1);

        struct Nop;
        #[async_trait]
        impl IterVisitor for Nop {
            async fn pre(&mut self, _item: &IterItem) -> Result<Decision> {
                Ok(Decision::Continue)
            }
            async fn post(&mut self, _item: &IterItem) -> Result<Decision> {
                Ok(Decision::Continue)
            }
        }

        let param = IterParam::default();
        let err = target.iterate(&container(), &param, &mut Nop).await.unwrap_err();
        assert!(err.needs_refresh());
        target.iterate(&container(), &param, &mut Nop).await.unwrap();
    }
}
