//! End-to-end aggregation tests
//!
//! Drives the engine against an in-memory loopback cluster: one target
//! plays the leading parity shard, the others receive peer traffic, and a
//! logical object view answers cross-shard fetches.

use std::sync::Arc;

use stripemend::cluster::ShardLocation;
use stripemend::codec::StripeCodec;
use stripemend::layout::{Epoch, Extent, Key, ObjectId, ShardObjectId};
use stripemend::memory::{MemCluster, MemTarget};
use stripemend::{
    AggregateSummary, Aggregator, AggregatorConfig, ContainerHandle, ContainerId, EcClass,
    EpochRange, PoolId, WatermarkRegistry,
};

const RSIZE: usize = 8;

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    cluster: MemCluster,
    engine: Aggregator,
    container: ContainerHandle,
    class: EcClass,
    object: ObjectId,
    local_shard: u32,
    local: Arc<MemTarget>,
    watermarks: Arc<WatermarkRegistry>,
    dkey: Key,
    akey: Key,
}

impl Fixture {
    /// One object of class (k, p, l); the engine runs on the first parity
    /// shard.
    fn new(k: usize, p: usize, l: u64) -> Self {
        Self::with_config(k, p, l, AggregatorConfig::default())
    }

    fn with_config(k: usize, p: usize, l: u64, config: AggregatorConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let cluster = MemCluster::new();
        let class = EcClass::new(k, p, l).expect("valid class");
        let object = ObjectId(0xec0b);
        cluster.register_class(object, class);
        for shard in 0..(k + p) as u32 {
            cluster.add_target(shard, ShardLocation::new(0, shard));
        }
        let local_shard = k as u32;
        let local = cluster.target(local_shard).expect("local target");
        let watermarks = Arc::new(WatermarkRegistry::new());
        let engine = Aggregator::with_config(
            local.clone(),
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            watermarks.clone(),
            config,
        );
        Self {
            cluster,
            engine,
            container: ContainerHandle {
                pool: PoolId(1),
                container: ContainerId(2),
                checksums_enabled: false,
            },
            class,
            object,
            local_shard,
            local,
            watermarks,
            dkey: Key::from("dkey-0"),
            akey: Key::from("akey-0"),
        }
    }

    fn oid(&self) -> ShardObjectId {
        ShardObjectId::new(self.object, self.local_shard)
    }

    fn oid_at(&self, shard: u32) -> ShardObjectId {
        ShardObjectId::new(self.object, shard)
    }

    fn logical_oid(&self) -> ShardObjectId {
        ShardObjectId::new(self.object, 0)
    }

    /// Write the same extent into the logical object view and the given
    /// parity targets, the state a replicated partial write leaves behind.
    fn seed_replica(&self, recx: Extent, epoch: Epoch, data: &[u8], shards: &[u32]) {
        self.cluster.logical().write(
            self.logical_oid(),
            &self.dkey,
            &self.akey,
            recx,
            epoch,
            RSIZE,
            data,
        );
        for &shard in shards {
            self.cluster.target(shard).expect("target").write(
                self.oid_at(shard),
                &self.dkey,
                &self.akey,
                recx,
                epoch,
                RSIZE,
                data,
            );
        }
    }

    /// Seed consistent parity for a stripe on every parity target.
    fn seed_parity(&self, stripe: u64, epoch: Epoch, stripe_data: &[u8]) {
        let codec = StripeCodec::new(&self.class).expect("codec");
        let cell_bytes = self.class.cell_bytes(RSIZE);
        let cells: Vec<&[u8]> = stripe_data.chunks(cell_bytes).collect();
        let mut parity = vec![0u8; self.class.p * cell_bytes];
        codec
            .encode(cell_bytes, &cells, &mut parity)
            .expect("encode");
        for pidx in 0..self.class.p {
            let shard = (self.class.k + pidx) as u32;
            self.cluster.target(shard).expect("target").write(
                self.oid_at(shard),
                &self.dkey,
                &self.akey,
                self.class.parity_extent(stripe),
                epoch,
                RSIZE,
                &parity[pidx * cell_bytes..(pidx + 1) * cell_bytes],
            );
        }
    }

    /// Parity every target must converge to for the logical stripe content
    /// at `epoch`.
    fn expected_parity(&self, stripe: u64, epoch: Epoch) -> Vec<u8> {
        let codec = StripeCodec::new(&self.class).expect("codec");
        let cell_bytes = self.class.cell_bytes(RSIZE);
        let stripe_data = self.cluster.logical().read(
            self.logical_oid(),
            epoch,
            &self.dkey,
            &self.akey,
            self.class.stripe_extent(stripe),
            RSIZE,
        );
        let cells: Vec<&[u8]> = stripe_data.chunks(cell_bytes).collect();
        let mut parity = vec![0u8; self.class.p * cell_bytes];
        codec
            .encode(cell_bytes, &cells, &mut parity)
            .expect("encode");
        parity
    }

    async fn run(&self, lo: Epoch, hi: Epoch) -> AggregateSummary {
        self.engine
            .aggregate(&self.container, EpochRange::new(lo, hi), || false, true)
            .await
            .expect("aggregate")
    }

    fn local_data(&self) -> Vec<(Extent, Epoch, bool)> {
        self.local.data_extents(self.oid(), &self.dkey, &self.akey)
    }

    fn local_parity(&self) -> Vec<(Extent, Epoch, bool)> {
        self.local
            .parity_extents(self.oid(), &self.dkey, &self.akey)
    }

    fn read_parity_cell(&self, shard: u32, stripe: u64, epoch: Epoch) -> Vec<u8> {
        self.cluster.target(shard).expect("target").read(
            self.oid_at(shard),
            epoch,
            &self.dkey,
            &self.akey,
            self.class.parity_extent(stripe),
            RSIZE,
        )
    }
}

fn pattern(records: u64, seed: u8) -> Vec<u8> {
    (0..records as usize * RSIZE)
        .map(|i| seed.wrapping_add(i as u8))
        .collect()
}

// =============================================================================
// Boundary scenarios
// =============================================================================

/// Full stripe of fresh replicas, no prior parity: parity is encoded and
/// the replicas are removed. For P = 1 the parity cell is the XOR of the
/// data cells.
#[tokio::test]
async fn full_stripe_encodes_parity_and_drops_replicas() {
    let f = Fixture::new(2, 1, 4);
    let d0 = pattern(4, 1);
    let d1 = pattern(4, 101);
    f.seed_replica(Extent::new(0, 4), 5, &d0, &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &d1, &[2]);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(summary.stripes_failed, 0);
    assert!(summary.watermark_advanced);

    let parity = f.local_parity();
    assert_eq!(parity.len(), 1);
    assert_eq!(parity[0].0, f.class.parity_extent(0));
    assert_eq!(parity[0].1, 5);

    let bytes = f.read_parity_cell(2, 0, 5);
    let xor: Vec<u8> = d0.iter().zip(&d1).map(|(a, b)| a ^ b).collect();
    assert_eq!(bytes.len(), 32);
    assert_eq!(bytes, xor);

    assert!(f.local_data().is_empty());
}

/// Minority of cells touched above existing parity: incremental update,
/// with the updated peer cell shipped to the other parity shard.
#[tokio::test]
async fn partial_write_updates_parity_incrementally() {
    let f = Fixture::new(4, 2, 4);
    let old = pattern(16, 7);
    f.cluster.logical().write(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 16),
        5,
        RSIZE,
        &old,
    );
    f.seed_parity(0, 5, &old);

    // overwrite records [2, 4): one touched cell, none full
    let fresh = pattern(2, 201);
    f.seed_replica(Extent::new(2, 2), 7, &fresh, &[4, 5]);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(summary.stripes_failed, 0);

    let expected = f.expected_parity(0, 7);
    let cell_bytes = f.class.cell_bytes(RSIZE);
    assert_eq!(f.read_parity_cell(4, 0, 7).as_slice(), &expected[..cell_bytes]);
    assert_eq!(f.read_parity_cell(5, 0, 7).as_slice(), &expected[cell_bytes..]);

    // updated parity written at the stripe's high epoch, shadowing the old
    let newest = f
        .local_parity()
        .into_iter()
        .max_by_key(|(_, epoch, _)| *epoch)
        .expect("parity present");
    assert_eq!(newest.0, f.class.parity_extent(0));
    assert_eq!(newest.1, 7);

    // replicas removed on the leader and on the peer
    assert!(f.local_data().is_empty());
    assert!(f
        .cluster
        .target(5)
        .unwrap()
        .data_extents(f.oid_at(5), &f.dkey, &f.akey)
        .is_empty());
}

/// Majority of cells fully replicated above the parity: recalculation from
/// the whole stripe, pulling the complementary cell from the data shards.
#[tokio::test]
async fn majority_rewrite_recalculates_parity() {
    let f = Fixture::new(4, 2, 4);
    let old = pattern(16, 11);
    f.cluster.logical().write(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 16),
        5,
        RSIZE,
        &old,
    );
    f.seed_parity(0, 5, &old);

    // full cells 0, 1, 2 rewritten at epoch 7: 3 of 4 >= K/2
    let fresh = pattern(12, 47);
    f.seed_replica(Extent::new(0, 12), 7, &fresh, &[4, 5]);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(summary.stripes_failed, 0);

    let expected = f.expected_parity(0, 7);
    let cell_bytes = f.class.cell_bytes(RSIZE);
    assert_eq!(f.read_parity_cell(4, 0, 7).as_slice(), &expected[..cell_bytes]);
    assert_eq!(f.read_parity_cell(5, 0, 7).as_slice(), &expected[cell_bytes..]);
    let newest = f
        .local_parity()
        .into_iter()
        .max_by_key(|(_, epoch, _)| *epoch)
        .expect("parity present");
    assert_eq!(newest.1, 7);
    assert!(f.local_data().is_empty());
}

/// Replica older than the parity: dropped without touching the parity.
#[tokio::test]
async fn stale_replica_is_dropped_under_newer_parity() {
    let f = Fixture::new(2, 1, 4);
    let old = pattern(8, 3);
    f.cluster.logical().write(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 8),
        10,
        RSIZE,
        &old,
    );
    f.seed_parity(0, 10, &old);
    let before = f.read_parity_cell(2, 0, 10);

    let stale = pattern(4, 77);
    f.seed_replica(Extent::new(0, 4), 5, &stale, &[2]);

    let summary = f.run(0, 20).await;
    assert_eq!(summary.stripes_processed, 1);

    assert!(f.local_data().is_empty());
    let parity = f.local_parity();
    assert_eq!(parity.len(), 1);
    assert_eq!(parity[0].1, 10);
    assert_eq!(f.read_parity_cell(2, 0, 10), before);
}

/// With P > 1 the drop branch must reach the peers too: the removal round
/// carries no parity cell, and the peer still sweeps the contained stripe.
#[tokio::test]
async fn stale_replica_drop_reaches_peers() {
    let f = Fixture::new(4, 2, 4);
    let old = pattern(16, 13);
    f.cluster.logical().write(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 16),
        10,
        RSIZE,
        &old,
    );
    f.seed_parity(0, 10, &old);

    let stale = pattern(4, 77);
    f.seed_replica(Extent::new(0, 4), 5, &stale, &[4, 5]);

    let summary = f.run(0, 20).await;
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(summary.stripes_failed, 0);

    for shard in [4u32, 5] {
        let target = f.cluster.target(shard).unwrap();
        let data = target.data_extents(f.oid_at(shard), &f.dkey, &f.akey);
        assert!(data.is_empty(), "shard {shard} kept stale replicas: {data:?}");

        // parity untouched on both shards
        let parity = target.parity_extents(f.oid_at(shard), &f.dkey, &f.akey);
        assert_eq!(parity.len(), 1);
        assert_eq!(parity[0].1, 10);
    }
}

/// A hole above the parity reverts the stripe to replicas: valid ranges
/// are pulled from the data shards, written locally and on the peer, and
/// the parity is removed everywhere.
#[tokio::test]
async fn hole_reverts_stripe_to_replicas() {
    let f = Fixture::new(2, 2, 4);
    let old = pattern(8, 21);
    f.cluster.logical().write(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 8),
        5,
        RSIZE,
        &old,
    );
    f.seed_parity(0, 5, &old);

    // punch [0, 4) at epoch 7 on the parity targets and the logical view
    for shard in [2u32, 3] {
        f.cluster.target(shard).unwrap().punch(
            f.oid_at(shard),
            &f.dkey,
            &f.akey,
            Extent::new(0, 4),
            7,
            RSIZE,
        );
    }
    f.cluster.logical().punch(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 4),
        7,
        RSIZE,
    );

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(summary.stripes_failed, 0);

    // parity gone on both parity shards
    assert!(f.local_parity().is_empty());
    assert!(f
        .cluster
        .target(3)
        .unwrap()
        .parity_extents(f.oid_at(3), &f.dkey, &f.akey)
        .is_empty());

    // the valid range [4, 8) was re-replicated at the hole's epoch
    for shard in [2u32, 3] {
        let target = f.cluster.target(shard).unwrap();
        let data = target.data_extents(f.oid_at(shard), &f.dkey, &f.akey);
        assert!(
            data.contains(&(Extent::new(4, 4), 7, false)),
            "shard {shard} missing re-replicated range: {data:?}"
        );
        // the hole record itself stays
        assert!(data.contains(&(Extent::new(0, 4), 7, true)));
        let bytes = target.read(
            f.oid_at(shard),
            7,
            &f.dkey,
            &f.akey,
            Extent::new(4, 4),
            RSIZE,
        );
        assert_eq!(bytes.as_slice(), &old[4 * RSIZE..]);
    }
}

/// An extent crossing the stripe boundary: the prefix is encoded with
/// stripe 0, the suffix seeds stripe 1, and the footprint survives as a
/// hold-over until the suffix stripe is secured.
#[tokio::test]
async fn crossing_extent_carries_over() {
    let f = Fixture::new(2, 1, 4);
    let data = pattern(10, 33);
    f.seed_replica(Extent::new(0, 10), 5, &data, &[2]);

    let summary = f.run(0, 10).await;
    // stripe 0 (full encode) and stripe 1 (no-op) both processed
    assert_eq!(summary.stripes_processed, 2);
    assert_eq!(summary.stripes_failed, 0);

    // stripe 0 parity present and correct
    let parity = f.local_parity();
    assert_eq!(parity.len(), 1);
    assert_eq!(parity[0].0, f.class.parity_extent(0));
    assert_eq!(parity[0].1, 5);
    let xor: Vec<u8> = data[..4 * RSIZE]
        .iter()
        .zip(&data[4 * RSIZE..8 * RSIZE])
        .map(|(a, b)| a ^ b)
        .collect();
    assert_eq!(f.read_parity_cell(2, 0, 5), xor);

    // the replica footprint [0, 10) remains: its suffix [8, 10) belongs to
    // stripe 1, which has no parity yet
    let data_exts = f.local_data();
    assert_eq!(data_exts, vec![(Extent::new(0, 10), 5, false)]);
}

// =============================================================================
// Properties
// =============================================================================

/// Running the same window twice leaves the same persistent state.
#[tokio::test]
async fn aggregation_is_idempotent() {
    let f = Fixture::new(2, 1, 4);
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &pattern(4, 101), &[2]);

    f.run(0, 10).await;
    let data_once = f.local_data();
    let parity_once = f.local_parity();
    let bytes_once = f.read_parity_cell(2, 0, 5);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_failed, 0);
    assert_eq!(f.local_data(), data_once);
    assert_eq!(f.local_parity(), parity_once);
    assert_eq!(f.read_parity_cell(2, 0, 5), bytes_once);
}

/// A failed peer aborts the stripe: nothing is removed, no parity is
/// written, and the watermark stays put.
#[tokio::test]
async fn failed_peer_aborts_stripe_without_commit() {
    let f = Fixture::new(4, 2, 4);
    let old = pattern(16, 9);
    f.cluster.logical().write(
        f.logical_oid(),
        &f.dkey,
        &f.akey,
        Extent::new(0, 16),
        5,
        RSIZE,
        &old,
    );
    f.seed_parity(0, 5, &old);
    f.seed_replica(Extent::new(2, 2), 7, &pattern(2, 55), &[4, 5]);

    f.cluster.mark_failed(ShardLocation::new(0, 5));

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_failed, 1);
    assert!(!summary.watermark_advanced);
    assert_eq!(f.watermarks.last_aggregated(f.container.container), None);

    // replica retained, parity still at the old epoch
    assert_eq!(f.local_data().len(), 1);
    let parity = f.local_parity();
    assert_eq!(parity.len(), 1);
    assert_eq!(parity[0].1, 5);
}

/// The watermark only reflects fully successful, current passes.
#[tokio::test]
async fn watermark_advances_on_success() {
    let f = Fixture::new(2, 1, 4);
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &pattern(4, 2), &[2]);

    let summary = f.run(0, 9).await;
    assert!(summary.watermark_advanced);
    assert_eq!(f.watermarks.last_aggregated(f.container.container), Some(9));

    // a later, wider pass moves it forward
    f.run(0, 15).await;
    assert_eq!(
        f.watermarks.last_aggregated(f.container.container),
        Some(15)
    );
}

/// The yield callback requesting an abort unwinds the pass before any
/// stripe commits.
#[tokio::test]
async fn yield_abort_unwinds_cleanly() {
    let f = Fixture::with_config(2, 1, 4, AggregatorConfig { credits_max: 0 });
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &pattern(4, 2), &[2]);

    let summary = f
        .engine
        .aggregate(&f.container, EpochRange::new(0, 10), || true, true)
        .await
        .expect("aggregate");
    assert!(summary.aborted);
    assert!(!summary.watermark_advanced);
    assert_eq!(summary.stripes_processed, 0);

    // nothing committed
    assert!(f.local_parity().is_empty());
    assert_eq!(f.local_data().len(), 2);
}

/// Objects this target does not lead are skipped whole.
#[tokio::test]
async fn non_led_objects_are_skipped() {
    let f = Fixture::new(2, 1, 4);
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &pattern(4, 2), &[2]);
    f.cluster.set_not_led(f.object);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 0);
    assert_eq!(f.local_data().len(), 2);
    assert!(f.local_parity().is_empty());
}

/// Data-shard objects never enter the pipeline even if they show up in the
/// local store.
#[tokio::test]
async fn data_shard_objects_are_skipped() {
    let f = Fixture::new(2, 1, 4);
    let oid = f.oid_at(1); // shard 1 of a 2+1 class is a data shard
    f.local
        .write(oid, &f.dkey, &f.akey, Extent::new(0, 8), 5, RSIZE, &pattern(8, 4));

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 0);
    assert_eq!(f.local.data_extents(oid, &f.dkey, &f.akey).len(), 1);
}

/// Single-value akeys are skipped.
#[tokio::test]
async fn single_value_akeys_are_skipped() {
    let f = Fixture::new(2, 1, 4);
    f.local.put_single(f.oid(), &f.dkey, &Key::from("sv"));
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &pattern(4, 2), &[2]);

    let summary = f.run(0, 10).await;
    // the array akey still aggregates
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(f.local_parity().len(), 1);
}

/// A needs-refresh report restarts the traversal and the pass still
/// completes.
#[tokio::test]
async fn refresh_restarts_traversal() {
    let f = Fixture::new(2, 1, 4);
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[2]);
    f.seed_replica(Extent::new(4, 4), 5, &pattern(4, 2), &[2]);
    f.local.trip_refresh(1);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 1);
    assert!(summary.watermark_advanced);
    assert!(f.local_data().is_empty());
    assert_eq!(f.local_parity().len(), 1);
}

/// No parity and a partial stripe: branch 3 leaves the replicas alone.
#[tokio::test]
async fn partial_stripe_without_parity_is_left_alone() {
    let f = Fixture::new(4, 2, 4);
    f.seed_replica(Extent::new(0, 4), 5, &pattern(4, 1), &[4, 5]);

    let summary = f.run(0, 10).await;
    assert_eq!(summary.stripes_processed, 1);
    assert_eq!(summary.stripes_failed, 0);
    assert_eq!(f.local_data().len(), 1);
    assert!(f.local_parity().is_empty());
}
