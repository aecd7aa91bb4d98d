//! Per-stripe reconciliation
//!
//! Once the assembler closes a stripe, exactly one of six actions runs:
//!
//! | condition | action |
//! |---|---|
//! | parity newer than every replica | drop replicas, keep parity |
//! | replicas fill the stripe, all newer | encode fresh parity |
//! | no parity, partial replicas | leave everything in place |
//! | parity older, holes present | re-replicate, drop parity |
//! | parity older, majority/full/stale cells | recalculate parity |
//! | parity older, minority cells touched | incremental parity update |
//!
//! Ordering is what makes a crash safe: peers are brought forward before
//! the local store commits, the local parity write precedes replica
//! removal, and a failure anywhere aborts the stripe with nothing removed.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::client::{ObjectClient, ObjectHandle};
use crate::cluster::{Membership, ShardLocation};
use crate::codec::{xor_diff, StripeBuffers, StripeCodec};
use crate::error::{Error, Result};
use crate::layout::{EcClass, Epoch, EpochRange, Extent, Key, ParityExtent, ShardObjectId};
use crate::offload::offload;
use crate::rpc::{ParityForwardRequest, PeerTransport, RemovalRecord, ReplicateRequest};
use crate::store::{
    ContainerHandle, Decision, ExtentStore, IterItem, IterParam, IterVisitor,
};
use crate::stripe::{missing_cells, StripeTracker};

// =============================================================================
// Context
// =============================================================================

/// Borrowed view of the engine's collaborators for one stripe.
pub(crate) struct StripeCtx<'a> {
    pub store: &'a dyn ExtentStore,
    pub client: &'a dyn ObjectClient,
    pub transport: &'a dyn PeerTransport,
    pub membership: &'a dyn Membership,
    pub container: &'a ContainerHandle,
    pub range: EpochRange,
}

// =============================================================================
// Per-object pass state
// =============================================================================

/// Aggregation state for the object currently under iteration.
pub(crate) struct ObjectPass {
    pub oid: ShardObjectId,
    pub class: EcClass,
    pub pidx: usize,
    pub codec: Arc<StripeCodec>,

    pub dkey: Key,
    pub akey: Key,
    pub tracker: StripeTracker,

    /// Result of the parity probe for the stripe being processed.
    pub parity: Option<ParityExtent>,

    bufs: StripeBuffers,
    object: Option<Box<dyn ObjectHandle>>,
    peer_locs: Vec<ShardLocation>,
}

impl ObjectPass {
    pub fn new(oid: ShardObjectId, class: EcClass) -> Result<Self> {
        let codec = Arc::new(StripeCodec::new(&class)?);
        Ok(Self {
            oid,
            pidx: class.parity_index(oid.shard),
            tracker: StripeTracker::new(class),
            class,
            codec,
            dkey: Key::default(),
            akey: Key::default(),
            parity: None,
            bufs: StripeBuffers::default(),
            object: None,
            peer_locs: Vec::new(),
        })
    }

    #[inline]
    fn cell_bytes(&self) -> usize {
        self.class.cell_bytes(self.tracker.record_size())
    }

    /// Open the object handle and resolve peer parity shard locations from
    /// the layout; done once per object.
    async fn ensure_object(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        if self.object.is_some() {
            return Ok(());
        }
        let handle = ctx.client.open(self.oid.object).await?;
        let layout = handle.layout()?;
        self.peer_locs = (0..self.class.p)
            .map(|peer| {
                let shard = self.class.peer_shard(self.oid.shard, peer) as usize;
                layout.get(shard).copied().ok_or_else(|| {
                    Error::Invariant(format!("layout has no shard {shard} for {}", self.oid))
                })
            })
            .collect::<Result<_>>()?;
        self.object = Some(handle);
        Ok(())
    }

    // =========================================================================
    // Parity probe
    // =========================================================================

    /// Query the reserved parity index range of the current stripe.
    async fn probe_parity(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        struct Probe<'v> {
            slot: &'v mut Option<ParityExtent>,
            expected: Extent,
        }

        #[async_trait]
        impl IterVisitor for Probe<'_> {
            async fn pre(&mut self, item: &IterItem) -> Result<Decision> {
                if let IterItem::Recx { entry } = item {
                    if entry.recx.start != self.expected.start {
                        return Err(Error::Invariant(format!(
                            "parity probe found {} where {} was reserved",
                            entry.recx, self.expected
                        )));
                    }
                    if self.slot.is_some() {
                        return Err(Error::Invariant(format!(
                            "multiple parity extents at {}",
                            self.expected
                        )));
                    }
                    *self.slot = Some(ParityExtent {
                        recx: entry.recx,
                        epoch: entry.epoch,
                    });
                }
                Ok(Decision::Continue)
            }

            async fn post(&mut self, _item: &IterItem) -> Result<Decision> {
                Ok(Decision::Continue)
            }
        }

        self.parity = None;
        let expected = self.class.parity_extent(self.tracker.stripe());
        let param = IterParam {
            epoch_range: None,
            object: Some(self.oid),
            dkey: Some(self.dkey.clone()),
            akey: Some(self.akey.clone()),
            recx_filter: Some(expected),
        };
        let mut probe = Probe {
            slot: &mut self.parity,
            expected,
        };
        ctx.store.iterate(ctx.container, &param, &mut probe).await?;
        debug!(
            oid = %self.oid,
            stripe = self.tracker.stripe(),
            parity_epoch = ?self.parity.map(|p| p.epoch),
            "parity probe"
        );
        Ok(())
    }

    // =========================================================================
    // Stripe pipeline
    // =========================================================================

    /// Process the assembled stripe: probe parity, pick the action, secure
    /// peers, commit locally, then retire the extents (handling carry-over
    /// into the next stripe).
    pub async fn process_stripe(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        let rc = self.process_stripe_inner(ctx).await;
        self.tracker.clear_extents();
        rc
    }

    async fn process_stripe_inner(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        self.probe_parity(ctx).await?;
        let parity_epoch = self.parity.map(|p| p.epoch);
        let hi_epoch = self.tracker.hi_epoch();

        let mut update_local_store = true;
        let mut write_parity = true;
        let mut fill_holes = false;
        let mut rc: Result<()> = Ok(());

        if parity_epoch.is_some_and(|pe| pe >= hi_epoch) {
            // parity supersedes every replica: drop the replicas
            write_parity = false;
        } else if self.tracker.stripe_full(parity_epoch) {
            rc = self.encode_local_parity(ctx).await;
        } else if parity_epoch.is_none() {
            // partial stripe with no parity: nothing to reconcile
            update_local_store = false;
        } else if self.tracker.has_holes() {
            fill_holes = true;
        } else {
            rc = self.process_partial_stripe(ctx).await;
        }

        if rc.is_ok() && fill_holes {
            rc = self.process_holes(ctx).await;
        } else if rc.is_ok() && update_local_store {
            if self.class.p > 1 {
                rc = self.peer_update(ctx, write_parity).await;
                if let Err(ref e) = rc {
                    error!(oid = %self.oid, stripe = self.tracker.stripe(), error = %e,
                           "peer update failed");
                }
            }
            if rc.is_ok() {
                rc = self.update_local(ctx, write_parity).await;
                if let Err(ref e) = rc {
                    error!(oid = %self.oid, stripe = self.tracker.stripe(), error = %e,
                           "local commit failed");
                }
            }
        }

        if rc.is_ok() && self.tracker.has_purgeable_holdovers() {
            if self.class.p > 1 && !update_local_store {
                // nothing shipped for this stripe, but peers still hold the
                // hold-over footprints: removal-only round
                rc = self.peer_update(ctx, false).await;
            }
            if rc.is_ok() {
                rc = self.remove_holdovers(ctx).await;
            }
        }
        rc
    }

    // =========================================================================
    // Branch: full-stripe encode
    // =========================================================================

    /// Replicas fill the stripe: fetch it locally and encode fresh parity.
    async fn encode_local_parity(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        let rsize = self.tracker.record_size();
        let cell_bytes = self.cell_bytes();
        let (k, p) = (self.class.k, self.class.p);
        self.bufs.prepare(&self.class, rsize);

        let recx = self.class.stripe_extent(self.tracker.stripe());
        let stripe_bytes = recx.len as usize * rsize;
        ctx.store
            .fetch(
                ctx.container,
                self.oid,
                self.tracker.hi_epoch(),
                &self.dkey,
                &self.akey,
                &[recx],
                rsize,
                &mut self.bufs.data[..stripe_bytes],
            )
            .await?;

        let codec = self.codec.clone();
        let mut bufs = std::mem::take(&mut self.bufs);
        let (bufs, rc) = offload(move || {
            let StripeBuffers { data, parity, .. } = &mut bufs;
            let cells: Vec<&[u8]> = (0..k)
                .map(|i| &data[i * cell_bytes..(i + 1) * cell_bytes])
                .collect();
            let rc = codec.encode(cell_bytes, &cells, &mut parity[..p * cell_bytes]);
            (bufs, rc)
        })
        .wait()
        .await?;
        self.bufs = bufs;
        rc
    }

    // =========================================================================
    // Branch: partial update / recalculation
    // =========================================================================

    /// Parity exists and newer partial replicas touch some cells, no holes:
    /// either update the parity incrementally or recalculate it from the
    /// whole stripe.
    async fn process_partial_stripe(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        let parity_epoch = self
            .parity
            .map(|p| p.epoch)
            .ok_or_else(|| Error::Invariant("partial update without parity".into()))?;
        let map = self.tracker.count_cells(parity_epoch);
        let (k, p) = (self.class.k, self.class.p);

        let recalc =
            map.full_count >= k / 2 || map.touched_count == k || map.has_old_replicas;
        let (local_mask, local_count) = if recalc {
            (map.full, map.full_count)
        } else {
            (map.touched, map.touched_count)
        };
        debug!(
            oid = %self.oid,
            stripe = self.tracker.stripe(),
            touched = map.touched_count,
            full = map.full_count,
            stale = map.has_old_replicas,
            recalc,
            "partial stripe"
        );

        let rsize = self.tracker.record_size();
        let cell_bytes = self.cell_bytes();
        self.bufs.prepare(&self.class, rsize);

        // Local cells land densely in the data buffer: the replicated cells
        // for an update, the fully replicated cells for a recalc.
        if local_count > 0 {
            let recxs = self.cell_recxs(local_mask);
            ctx.store
                .fetch(
                    ctx.container,
                    self.oid,
                    self.tracker.hi_epoch(),
                    &self.dkey,
                    &self.akey,
                    &recxs,
                    rsize,
                    &mut self.bufs.data[..local_count * cell_bytes],
                )
                .await?;
        }
        if !recalc {
            // current parity cell joins the parity buffer at our own slot
            let precx = self.class.parity_extent(self.tracker.stripe());
            let slot = self.pidx * cell_bytes..(self.pidx + 1) * cell_bytes;
            ctx.store
                .fetch(
                    ctx.container,
                    self.oid,
                    self.tracker.hi_epoch(),
                    &self.dkey,
                    &self.akey,
                    &[precx],
                    rsize,
                    &mut self.bufs.parity[slot],
                )
                .await?;
        }

        // Remote cells: for a recalc, everything not fully local at the
        // stripe's epoch; for an update, the old content of the touched
        // cells at the parity epoch.
        let (remote_mask, remote_count) = if recalc {
            let missing = missing_cells(&map, k);
            (missing, k - map.full_count)
        } else {
            (map.touched, map.touched_count)
        };
        let remote_epoch = if recalc { self.tracker.hi_epoch() } else { parity_epoch };

        self.ensure_object(ctx).await?;
        if remote_count > 0 {
            let recxs = self.cell_recxs(remote_mask);
            let object = self
                .object
                .as_ref()
                .ok_or_else(|| Error::Invariant("object handle missing after open".into()))?;
            object
                .fetch(
                    remote_epoch,
                    &self.dkey,
                    &self.akey,
                    &recxs,
                    rsize,
                    &mut self.bufs.odata[..remote_count * cell_bytes],
                    None,
                )
                .await?;
        }

        if p > 1 && !recalc {
            self.fetch_peer_parity(parity_epoch).await?;
        }

        // Pure codec work from here; gaps are resolved before the offload
        // so the worker never touches the tracker.
        let codec = self.codec.clone();
        let mut bufs = std::mem::take(&mut self.bufs);
        let rc = if recalc {
            let (bufs_back, rc) = offload(move || {
                let StripeBuffers { data, odata, parity, .. } = &mut bufs;
                let mut cells: Vec<&[u8]> = Vec::with_capacity(k);
                let (mut remote, mut local) = (0usize, 0usize);
                for cell in 0..k {
                    if remote_mask & (1 << cell) != 0 {
                        cells.push(&odata[remote * cell_bytes..(remote + 1) * cell_bytes]);
                        remote += 1;
                    } else {
                        cells.push(&data[local * cell_bytes..(local + 1) * cell_bytes]);
                        local += 1;
                    }
                }
                let rc = codec.encode(cell_bytes, &cells, &mut parity[..p * cell_bytes]);
                (bufs, rc)
            })
            .wait()
            .await?;
            self.bufs = bufs_back;
            rc
        } else {
            let touched: Vec<(usize, Vec<(u64, u64)>)> = (0..k)
                .filter(|cell| map.touched & (1 << cell) != 0)
                .map(|cell| (cell, self.tracker.stale_gaps_in_cell(cell, parity_epoch)))
                .collect();
            let (bufs_back, rc) = offload(move || {
                let StripeBuffers { data, odata, parity, diff } = &mut bufs;
                let mut rc = Ok(());
                for (dense, (cell, gaps)) in touched.iter().enumerate() {
                    let old = &odata[dense * cell_bytes..(dense + 1) * cell_bytes];
                    let new = &data[dense * cell_bytes..(dense + 1) * cell_bytes];
                    xor_diff(old, new, &mut diff[..cell_bytes]);
                    // holes within the cell must not perturb the parity
                    for &(off, len) in gaps {
                        let (off, len) = (off as usize * rsize, len as usize * rsize);
                        diff[off..off + len].fill(0);
                    }
                    rc = codec.update(cell_bytes, *cell, &diff[..cell_bytes],
                                      &mut parity[..p * cell_bytes]);
                    if rc.is_err() {
                        break;
                    }
                }
                (bufs, rc)
            })
            .wait()
            .await?;
            self.bufs = bufs_back;
            rc
        };
        rc
    }

    /// Absolute cell extents of the current stripe for every set bit.
    fn cell_recxs(&self, mask: u64) -> Vec<Extent> {
        let ss = self.class.stripe_start(self.tracker.stripe());
        let len = self.class.cell_records;
        (0..self.class.k)
            .filter(|cell| mask & (1 << cell) != 0)
            .map(|cell| Extent::new(ss + cell as u64 * len, len))
            .collect()
    }

    /// Pull the other parity shards' cells at the parity epoch into their
    /// slots of the parity buffer.
    async fn fetch_peer_parity(&mut self, parity_epoch: Epoch) -> Result<()> {
        let cell_bytes = self.cell_bytes();
        let precx = self.class.parity_extent(self.tracker.stripe());
        let rsize = self.tracker.record_size();
        let object = self
            .object
            .as_ref()
            .ok_or_else(|| Error::Invariant("object handle missing after open".into()))?;
        for peer in 0..self.class.p {
            if peer == self.pidx {
                continue;
            }
            let shard = self.class.peer_shard(self.oid.shard, peer);
            object
                .fetch(
                    parity_epoch,
                    &self.dkey,
                    &self.akey,
                    &[precx],
                    rsize,
                    &mut self.bufs.parity[peer * cell_bytes..(peer + 1) * cell_bytes],
                    Some(shard),
                )
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Branch: hole re-replication
    // =========================================================================

    /// Newer holes invalidate the parity: pull the stripe's valid ranges
    /// from the data shards, write them back as replicas locally and on
    /// every peer parity shard, and drop the parity everywhere.
    async fn process_holes(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        let parity_epoch = self
            .parity
            .map(|p| p.epoch)
            .ok_or_else(|| Error::Invariant("hole branch without parity".into()))?;
        let (recxs, total, valid_hole) = self.tracker.replicate_ranges(parity_epoch);
        if !valid_hole {
            return Ok(());
        }

        let rsize = self.tracker.record_size();
        let hi_epoch = self.tracker.hi_epoch();
        self.bufs.prepare(&self.class, rsize);
        let total_bytes = total as usize * rsize;

        self.ensure_object(ctx).await?;
        if !recxs.is_empty() {
            let object = self
                .object
                .as_ref()
                .ok_or_else(|| Error::Invariant("object handle missing after open".into()))?;
            object
                .fetch(
                    hi_epoch,
                    &self.dkey,
                    &self.akey,
                    &recxs,
                    rsize,
                    &mut self.bufs.data[..total_bytes],
                    None,
                )
                .await?;
        }

        // peers first, so a crash cannot leave a peer ahead of us
        if self.class.p > 1 {
            let data = Bytes::copy_from_slice(&self.bufs.data[..total_bytes]);
            for peer in 0..self.class.p {
                if peer == self.pidx {
                    continue;
                }
                let location = self.peer_locs[peer];
                if ctx.membership.is_failed(&location) {
                    return Err(Error::PeerUnavailable {
                        peer: location,
                        map_version: ctx.membership.map_version(),
                    });
                }
                let request = ReplicateRequest {
                    pool: ctx.container.pool,
                    container: ctx.container.container,
                    oid: self
                        .oid
                        .with_shard(self.class.peer_shard(self.oid.shard, peer)),
                    dkey: self.dkey.clone(),
                    akey: self.akey.clone(),
                    stripe: self.tracker.stripe(),
                    epoch: hi_epoch,
                    epoch_lo: ctx.range.lo,
                    map_version: ctx.membership.map_version(),
                    record_size: rsize,
                    recxs: recxs.clone(),
                    data: data.clone(),
                };
                ctx.transport.replicate(location, request).await?;
            }
        }

        if !recxs.is_empty() {
            ctx.store
                .update(
                    ctx.container,
                    self.oid,
                    hi_epoch,
                    &self.dkey,
                    &self.akey,
                    &recxs,
                    rsize,
                    &self.bufs.data[..total_bytes],
                )
                .await?;
        }
        // stale parity goes away; the stripe is replicas-only again
        ctx.store
            .range_remove(
                ctx.container,
                self.oid,
                EpochRange::new(ctx.range.lo, hi_epoch),
                &self.dkey,
                &self.akey,
                self.class.parity_extent(self.tracker.stripe()),
            )
            .await
    }

    // =========================================================================
    // Peer coordination
    // =========================================================================

    /// Ship the stripe outcome to every peer parity shard: the peer's
    /// parity cell when one was computed, plus the replica footprints it
    /// must remove. With `write_parity == false` this is a removal-only
    /// round.
    async fn peer_update(&mut self, ctx: &StripeCtx<'_>, write_parity: bool) -> Result<()> {
        self.ensure_object(ctx).await?;
        let map_version = ctx.membership.map_version();

        // a failed peer aborts the stripe before anything is shipped
        for peer in 0..self.class.p {
            if peer == self.pidx {
                continue;
            }
            let location = self.peer_locs[peer];
            if ctx.membership.is_failed(&location) {
                return Err(Error::PeerUnavailable {
                    peer: location,
                    map_version,
                });
            }
        }

        let removals: Vec<RemovalRecord> =
            if !self.tracker.holdovers().is_empty() || !self.tracker.contained() {
                self.tracker
                    .extents()
                    .iter()
                    .chain(
                        self.tracker
                            .holdovers()
                            .iter()
                            .filter(|h| !h.carried)
                            .map(|h| &h.extent),
                    )
                    .map(|e| RemovalRecord {
                        recx: e.orig_recx,
                        epoch: e.epoch,
                    })
                    .collect()
            } else {
                // contained stripe: the peer removes the whole stripe range
                Vec::new()
            };

        let cell_bytes = self.cell_bytes();
        for peer in 0..self.class.p {
            if peer == self.pidx {
                continue;
            }
            let location = self.peer_locs[peer];
            let request = ParityForwardRequest {
                pool: ctx.container.pool,
                container: ctx.container.container,
                oid: self
                    .oid
                    .with_shard(self.class.peer_shard(self.oid.shard, peer)),
                dkey: self.dkey.clone(),
                akey: self.akey.clone(),
                epoch_range: EpochRange::new(ctx.range.lo, self.tracker.hi_epoch()),
                stripe: self.tracker.stripe(),
                map_version,
                record_size: self.tracker.record_size(),
                parity: write_parity.then(|| {
                    Bytes::copy_from_slice(self.bufs.parity_cell(cell_bytes, peer))
                }),
                removals: removals.clone(),
            };
            ctx.transport.forward_parity(location, request).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Local commit
    // =========================================================================

    /// Write the local parity cell (when computed) and remove the replicas
    /// the stripe has secured.
    async fn update_local(&mut self, ctx: &StripeCtx<'_>, write_parity: bool) -> Result<()> {
        let rsize = self.tracker.record_size();
        let hi_epoch = self.tracker.hi_epoch();
        let stripe = self.tracker.stripe();

        if write_parity {
            let precx = self.class.parity_extent(stripe);
            let cell_bytes = self.cell_bytes();
            ctx.store
                .update(
                    ctx.container,
                    self.oid,
                    hi_epoch,
                    &self.dkey,
                    &self.akey,
                    &[precx],
                    rsize,
                    self.bufs.parity_cell(cell_bytes, self.pidx),
                )
                .await?;
        }

        if self.tracker.holdovers().is_empty() && self.tracker.contained() {
            // one sweep for the whole stripe, bounded by the pass window
            ctx.store
                .range_remove(
                    ctx.container,
                    self.oid,
                    ctx.range,
                    &self.dkey,
                    &self.akey,
                    self.class.stripe_extent(stripe),
                )
                .await
        } else {
            let stripe_end = self.class.stripe_start(stripe + 1);
            let mut first_err = None;
            for ext in self.tracker.extents() {
                if ext.orig_recx.end() > stripe_end {
                    continue;
                }
                if let Err(e) = ctx
                    .store
                    .range_remove(
                        ctx.container,
                        self.oid,
                        EpochRange::at(ext.epoch),
                        &self.dkey,
                        &self.akey,
                        ext.orig_recx,
                    )
                    .await
                {
                    error!(oid = %self.oid, recx = %ext.orig_recx, error = %e,
                           "replica removal failed");
                    first_err.get_or_insert(e);
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    /// Remove hold-over footprints whose visible data has been secured by
    /// the stripes already processed. Carried footprints wait for their
    /// suffix stripe's committer.
    pub(crate) async fn remove_holdovers(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        let mut first_err = None;
        for ext in self
            .tracker
            .holdovers()
            .iter()
            .filter(|h| !h.carried)
            .map(|h| &h.extent)
        {
            if let Err(e) = ctx
                .store
                .range_remove(
                    ctx.container,
                    self.oid,
                    EpochRange::at(ext.epoch),
                    &self.dkey,
                    &self.akey,
                    ext.orig_recx,
                )
                .await
            {
                warn!(oid = %self.oid, recx = %ext.orig_recx, error = %e,
                      "hold-over removal failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Removal-only peer round used at akey end; public to the driver.
    pub(crate) async fn peer_removal_round(&mut self, ctx: &StripeCtx<'_>) -> Result<()> {
        self.peer_update(ctx, false).await
    }
}
