//! Aggregation driver
//!
//! Walks the extent store in (object, dkey, akey, recx) order and feeds the
//! stripe assembler, flushing a stripe through the reconciliation pipeline
//! whenever the iterator crosses a stripe boundary or finishes an akey.
//!
//! Objects that are not erasure-coded, not parity shards, or not led by
//! this target are skipped whole. The driver yields cooperatively every
//! `credits_max` entries and after each akey flush; the yield callback
//! returning `true` unwinds the traversal cleanly at the next boundary.
//!
//! Per-stripe failures are logged and do not stop the pass, but they pin
//! the container watermark so the next run retries the same stripes. A
//! store-level refresh request restarts the whole traversal from fresh
//! anchors.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ObjectClient;
use crate::cluster::Membership;
use crate::error::{Error, Result};
use crate::layout::{EpochRange, Key, ShardObjectId};
use crate::process::{ObjectPass, StripeCtx};
use crate::rpc::PeerTransport;
use crate::store::{
    AkeyKind, ContainerHandle, Decision, ExtentStore, IterItem, IterParam, IterVisitor, RecxEntry,
};
use crate::watermark::WatermarkRegistry;

// =============================================================================
// Configuration
// =============================================================================

/// Tuning knobs for the aggregation driver.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Iterator entries between cooperative yields.
    pub credits_max: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { credits_max: 256 }
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct AggregateSummary {
    /// Stripes that went through the pipeline successfully.
    pub stripes_processed: u64,

    /// Stripes aborted by per-stripe errors; they stay replicated and the
    /// watermark does not move.
    pub stripes_failed: u64,

    /// The yield callback requested an abort and the pass unwound early.
    pub aborted: bool,

    /// The container watermark advanced to the top of the window.
    pub watermark_advanced: bool,
}

// =============================================================================
// Aggregator
// =============================================================================

/// The erasure-coded aggregation engine for one storage target.
pub struct Aggregator {
    store: Arc<dyn ExtentStore>,
    client: Arc<dyn ObjectClient>,
    transport: Arc<dyn PeerTransport>,
    membership: Arc<dyn Membership>,
    watermarks: Arc<WatermarkRegistry>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn ExtentStore>,
        client: Arc<dyn ObjectClient>,
        transport: Arc<dyn PeerTransport>,
        membership: Arc<dyn Membership>,
        watermarks: Arc<WatermarkRegistry>,
    ) -> Self {
        Self::with_config(
            store,
            client,
            transport,
            membership,
            watermarks,
            AggregatorConfig::default(),
        )
    }

    pub fn with_config(
        store: Arc<dyn ExtentStore>,
        client: Arc<dyn ObjectClient>,
        transport: Arc<dyn PeerTransport>,
        membership: Arc<dyn Membership>,
        watermarks: Arc<WatermarkRegistry>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            client,
            transport,
            membership,
            watermarks,
            config,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn watermarks(&self) -> &WatermarkRegistry {
        &self.watermarks
    }

    /// Aggregate every led EC object of the container over `[range.lo,
    /// range.hi]`.
    ///
    /// `yield_fn` is invoked at cooperative yield points; returning `true`
    /// unwinds the pass cleanly at the next stripe boundary. With
    /// `is_current` set, a fully successful pass advances the container's
    /// last-aggregated-epoch watermark to `range.hi`.
    #[instrument(skip(self, container, yield_fn),
                 fields(container = ?container.container, range = %range))]
    pub async fn aggregate(
        &self,
        container: &ContainerHandle,
        range: EpochRange,
        mut yield_fn: impl FnMut() -> bool + Send,
        is_current: bool,
    ) -> Result<AggregateSummary> {
        let param = IterParam {
            epoch_range: Some(range),
            ..Default::default()
        };

        let mut summary = loop {
            let mut visitor = AggVisitor {
                agg: self,
                container,
                range,
                yield_fn: &mut yield_fn,
                pass: None,
                credits: 0,
                summary: AggregateSummary::default(),
            };
            match self.store.iterate(container, &param, &mut visitor).await {
                Ok(()) => break visitor.summary,
                Err(e) if e.needs_refresh() => {
                    debug!("traversal raced a transaction; restarting from fresh anchors");
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        if is_current && !summary.aborted && summary.stripes_failed == 0 {
            self.watermarks.advance(container.container, range.hi);
            summary.watermark_advanced = true;
        }
        info!(
            processed = summary.stripes_processed,
            failed = summary.stripes_failed,
            aborted = summary.aborted,
            "aggregation pass finished"
        );
        Ok(summary)
    }
}

// =============================================================================
// Traversal visitor
// =============================================================================

struct AggVisitor<'a> {
    agg: &'a Aggregator,
    container: &'a ContainerHandle,
    range: EpochRange,
    yield_fn: &'a mut (dyn FnMut() -> bool + Send),
    pass: Option<ObjectPass>,
    credits: u32,
    summary: AggregateSummary,
}

/// Errors that must unwind the traversal instead of aborting one stripe.
fn is_fatal(e: &Error) -> bool {
    e.needs_refresh() || matches!(e, Error::Invariant(_))
}

/// Built from copied references so the visitor's own state stays free for
/// mutable borrows while a stripe is in flight.
fn stripe_ctx<'a>(
    agg: &'a Aggregator,
    container: &'a ContainerHandle,
    range: EpochRange,
) -> StripeCtx<'a> {
    StripeCtx {
        store: agg.store.as_ref(),
        client: agg.client.as_ref(),
        transport: agg.transport.as_ref(),
        membership: agg.membership.as_ref(),
        container,
        range,
    }
}

impl AggVisitor<'_> {
    fn pre_object(&mut self, oid: &ShardObjectId) -> Result<Decision> {
        if let Some(pass) = &self.pass {
            // resumed anchors can replay the object we already hold
            if pass.oid == *oid {
                return Ok(Decision::Skip);
            }
        }
        let Some(class) = self.agg.store.oclass_attrs(oid) else {
            return Ok(Decision::Skip);
        };
        if !class.is_parity_shard(oid.shard) {
            return Ok(Decision::Skip);
        }
        let map_version = self.agg.membership.map_version();
        match self.agg.membership.is_leader(oid, map_version) {
            Ok(true) => {}
            Ok(false) => return Ok(Decision::Skip),
            Err(e) => {
                warn!(oid = %oid, error = %e, "leader check failed; skipping object");
                return Ok(Decision::Skip);
            }
        }
        debug!(oid = %oid, k = class.k, p = class.p, "aggregating object");
        self.pass = Some(ObjectPass::new(*oid, class)?);
        Ok(Decision::Continue)
    }

    fn pre_dkey(&mut self, key: &Key) -> Decision {
        let Some(pass) = self.pass.as_mut() else {
            return Decision::Skip;
        };
        if pass.dkey == *key {
            Decision::Skip
        } else {
            pass.dkey = key.clone();
            Decision::Continue
        }
    }

    fn pre_akey(&mut self, key: &Key, kind: AkeyKind) -> Decision {
        if kind == AkeyKind::Single {
            return Decision::Skip;
        }
        let Some(pass) = self.pass.as_mut() else {
            return Decision::Skip;
        };
        if pass.akey == *key {
            Decision::Skip
        } else {
            pass.akey = key.clone();
            pass.tracker.reset();
            pass.parity = None;
            Decision::Continue
        }
    }

    async fn pre_recx(&mut self, entry: &RecxEntry) -> Result<Decision> {
        if entry.recx.is_parity() {
            return Err(Error::Invariant(format!(
                "outer iteration yielded parity extent {}",
                entry.recx
            )));
        }
        let sctx = stripe_ctx(self.agg, self.container, self.range);
        let Some(pass) = self.pass.as_mut() else {
            return Ok(Decision::Skip);
        };

        let this_stripe = pass.tracker.stripe_of(entry.recx.start);
        if this_stripe != pass.tracker.stripe() {
            if !pass.tracker.is_empty() {
                let prev = pass.tracker.stripe();
                match pass.process_stripe(&sctx).await {
                    Ok(()) => self.summary.stripes_processed += 1,
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        // stripe stays replicated; retried by the next pass
                        error!(oid = %pass.oid, stripe = prev, error = %e,
                               "stripe processing failed");
                        self.summary.stripes_failed += 1;
                    }
                }
                if prev < pass.tracker.stripe() && pass.tracker.stripe() < this_stripe {
                    // a carry-over seeded a stripe the iterator has already
                    // moved past; flush it on its own
                    let held = pass.tracker.stripe();
                    match pass.process_stripe(&sctx).await {
                        Ok(()) => self.summary.stripes_processed += 1,
                        Err(e) if is_fatal(&e) => return Err(e),
                        Err(e) => {
                            error!(oid = %pass.oid, stripe = held, error = %e,
                                   "held-over stripe processing failed");
                            self.summary.stripes_failed += 1;
                        }
                    }
                }
            }
            pass.tracker.set_stripe(this_stripe);
        }

        if entry.has_checksum {
            // verified data goes through the store's checksum path, not
            // this pass
            return Ok(Decision::Skip);
        }
        pass.tracker.push(entry);
        Ok(Decision::Continue)
    }

    async fn post_akey(&mut self) -> Result<Decision> {
        let sctx = stripe_ctx(self.agg, self.container, self.range);
        let Some(pass) = self.pass.as_mut() else {
            return Ok(Decision::Continue);
        };
        if pass.tracker.is_empty() {
            return Ok(Decision::Continue);
        }

        let prev = pass.tracker.stripe();
        match pass.process_stripe(&sctx).await {
            Ok(()) => self.summary.stripes_processed += 1,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                error!(oid = %pass.oid, stripe = prev, error = %e,
                       "stripe processing failed at akey end");
                self.summary.stripes_failed += 1;
            }
        }
        if prev < pass.tracker.stripe() {
            let held = pass.tracker.stripe();
            match pass.process_stripe(&sctx).await {
                Ok(()) => self.summary.stripes_processed += 1,
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    error!(oid = %pass.oid, stripe = held, error = %e,
                           "held-over stripe processing failed at akey end");
                    self.summary.stripes_failed += 1;
                }
            }
        }

        // footprints reaching past the last populated stripe: peers drop
        // them through a removal-only round, then the local store follows
        if pass.tracker.has_purgeable_holdovers() {
            let mut rc: Result<()> = Ok(());
            if pass.class.p > 1 {
                rc = pass.peer_removal_round(&sctx).await;
            }
            match rc {
                Ok(()) => {
                    if let Err(e) = pass.remove_holdovers(&sctx).await {
                        if is_fatal(&e) {
                            return Err(e);
                        }
                        warn!(oid = %pass.oid, error = %e, "hold-over removal failed");
                        self.summary.stripes_failed += 1;
                    }
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(oid = %pass.oid, error = %e, "hold-over peer round failed");
                    self.summary.stripes_failed += 1;
                }
            }
        }

        pass.tracker.reset();

        // akey flush is a natural yield point
        if (self.yield_fn)() {
            self.summary.aborted = true;
            return Ok(Decision::Abort);
        }
        Ok(Decision::Continue)
    }
}

#[async_trait]
impl IterVisitor for AggVisitor<'_> {
    async fn pre(&mut self, item: &IterItem) -> Result<Decision> {
        match item {
            IterItem::Object { oid } => self.pre_object(oid),
            IterItem::DKey { key } => Ok(self.pre_dkey(key)),
            IterItem::AKey { key, kind } => Ok(self.pre_akey(key, *kind)),
            IterItem::Recx { entry } => self.pre_recx(entry).await,
        }
    }

    async fn post(&mut self, item: &IterItem) -> Result<Decision> {
        if let IterItem::AKey { .. } = item {
            if self.post_akey().await? == Decision::Abort {
                return Ok(Decision::Abort);
            }
        }

        self.credits += 1;
        if self.credits > self.agg.config.credits_max {
            self.credits = 0;
            if (self.yield_fn)() {
                debug!("aggregation aborted by yield callback");
                self.summary.aborted = true;
                return Ok(Decision::Abort);
            }
        }
        Ok(Decision::Continue)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        assert_eq!(AggregatorConfig::default().credits_max, 256);
    }

    #[test]
    fn test_summary_default_is_clean() {
        let s = AggregateSummary::default();
        assert_eq!(s.stripes_processed, 0);
        assert_eq!(s.stripes_failed, 0);
        assert!(!s.aborted);
        assert!(!s.watermark_advanced);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(is_fatal(&Error::NeedsRefresh));
        assert!(is_fatal(&Error::Invariant("x".into())));
        assert!(!is_fatal(&Error::Codec("x".into())));
    }
}
