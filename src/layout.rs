//! Object layout primitives: EC class geometry, record extents, epochs
//!
//! Every address in this crate is a record index inside one (object, dkey,
//! akey) array. Data records live in the low half of the index space; parity
//! for stripe `s` is stored at `PARITY_FLAG | (s * L)` with length `L`, where
//! `PARITY_FLAG` is the high bit of the index space.
//!
//! ```text
//!            stripe 0                stripe 1
//!  ┌───────┬───────┬───────┐ ┌───────┬───────┬───────┐
//!  │cell 0 │cell 1 │cell 2 │ │cell 0 │cell 1 │cell 2 │   data index space
//!  └───────┴───────┴───────┘ └───────┴───────┴───────┘
//!  0       L       2L      3L=K·L
//!
//!  PARITY_FLAG|0        PARITY_FLAG|L
//!  ┌───────┐            ┌───────┐
//!  │ P(s0) │            │ P(s1) │                        parity index space
//!  └───────┘            └───────┘
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version number assigned to each write, totally ordered.
pub type Epoch = u64;

/// High bit of the record index space, reserved for parity extents.
pub const PARITY_FLAG: u64 = 1 << 63;

/// Largest supported K.
pub const MAX_DATA_CELLS: usize = 48;

/// Largest supported P.
pub const MAX_PARITY_CELLS: usize = 8;

// =============================================================================
// Identities
// =============================================================================

/// Pool identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u128);

/// Container identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u128);

/// Object identity, without the shard component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u128);

/// One shard of an object as placed on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardObjectId {
    pub object: ObjectId,
    pub shard: u32,
}

impl ShardObjectId {
    pub fn new(object: ObjectId, shard: u32) -> Self {
        Self { object, shard }
    }

    /// Same object, different shard.
    pub fn with_shard(self, shard: u32) -> Self {
        Self { shard, ..self }
    }
}

impl fmt::Display for ShardObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}.{}", self.object.0, self.shard)
    }
}

/// A distribution or attribute key. Cheap to clone; compared by bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Key(pub Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

// =============================================================================
// Extents and epochs
// =============================================================================

/// A record extent: `[start, start + len)` within one akey's array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last record.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// True for extents in the parity-reserved index range.
    #[inline]
    pub fn is_parity(&self) -> bool {
        self.start & PARITY_FLAG != 0
    }

    /// True if `other` is fully inside this extent.
    pub fn contains(&self, other: &Extent) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_parity() {
            write!(f, "P[{:#x}, +{})", self.start, self.len)
        } else {
            write!(f, "[{}, {})", self.start, self.end())
        }
    }
}

/// Inclusive epoch range bounding one aggregation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRange {
    pub lo: Epoch,
    pub hi: Epoch,
}

impl EpochRange {
    pub fn new(lo: Epoch, hi: Epoch) -> Self {
        Self { lo, hi }
    }

    /// Degenerate range covering a single epoch.
    pub fn at(epoch: Epoch) -> Self {
        Self { lo: epoch, hi: epoch }
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        epoch >= self.lo && epoch <= self.hi
    }
}

impl fmt::Display for EpochRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

/// The parity extent found for one stripe by the parity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityExtent {
    pub recx: Extent,
    pub epoch: Epoch,
}

// =============================================================================
// EC class
// =============================================================================

/// Erasure-code class parameters, constant per object class.
///
/// `k` data cells and `p` parity cells per stripe, `cell_records` records per
/// cell. A stripe spans `k * cell_records` records of the data index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcClass {
    /// Number of data cells (K)
    pub k: usize,

    /// Number of parity cells (P)
    pub p: usize,

    /// Records per cell (L)
    pub cell_records: u64,
}

impl EcClass {
    pub fn new(k: usize, p: usize, cell_records: u64) -> Result<Self> {
        if k == 0 || k > MAX_DATA_CELLS {
            return Err(Error::InvalidClass(format!(
                "data cells must be in [1, {}], got {}",
                MAX_DATA_CELLS, k
            )));
        }
        if p == 0 || p > MAX_PARITY_CELLS {
            return Err(Error::InvalidClass(format!(
                "parity cells must be in [1, {}], got {}",
                MAX_PARITY_CELLS, p
            )));
        }
        if k + p > 255 {
            return Err(Error::InvalidClass(
                "total cells (k + p) must be <= 255 for GF(2^8)".into(),
            ));
        }
        if cell_records == 0 {
            return Err(Error::InvalidClass("cell_records must be > 0".into()));
        }
        Ok(Self { k, p, cell_records })
    }

    /// Stripe width in records.
    #[inline]
    pub fn stripe_records(&self) -> u64 {
        self.k as u64 * self.cell_records
    }

    /// Cell width in bytes for a given record size.
    #[inline]
    pub fn cell_bytes(&self, record_size: usize) -> usize {
        self.cell_records as usize * record_size
    }

    /// Ordinal of the stripe containing a data record index.
    #[inline]
    pub fn stripe_of(&self, index: u64) -> u64 {
        index / self.stripe_records()
    }

    /// First data record of a stripe.
    #[inline]
    pub fn stripe_start(&self, stripe: u64) -> u64 {
        stripe * self.stripe_records()
    }

    /// Full data extent of a stripe.
    pub fn stripe_extent(&self, stripe: u64) -> Extent {
        Extent::new(self.stripe_start(stripe), self.stripe_records())
    }

    /// Reserved parity extent of a stripe on any parity shard.
    pub fn parity_extent(&self, stripe: u64) -> Extent {
        Extent::new(PARITY_FLAG | (stripe * self.cell_records), self.cell_records)
    }

    /// True if this object class shard index addresses a parity shard.
    pub fn is_parity_shard(&self, shard: u32) -> bool {
        let idx = shard as usize % (self.k + self.p);
        idx >= self.k
    }

    /// Parity index in `[0, p)` for a parity shard.
    ///
    /// Panics if the shard is a data shard; callers gate on
    /// [`EcClass::is_parity_shard`] first.
    pub fn parity_index(&self, shard: u32) -> usize {
        let idx = shard as usize % (self.k + self.p);
        debug_assert!(idx >= self.k, "shard {} is not a parity shard", shard);
        (idx - self.k) % self.p
    }

    /// Shard id of peer parity index `peer` for the object owning `shard`.
    pub fn peer_shard(&self, shard: u32, peer: usize) -> u32 {
        let group = shard as usize / (self.k + self.p) * (self.k + self.p);
        (group + self.k + peer) as u32
    }

    /// Number of records of `recx` that fall inside its own starting stripe.
    pub fn in_stripe(&self, recx: &Extent) -> u64 {
        let stripe_end = self.stripe_start(self.stripe_of(recx.start) + 1);
        if recx.end() > stripe_end {
            stripe_end - recx.start
        } else {
            recx.len
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
