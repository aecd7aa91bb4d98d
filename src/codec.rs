//! Stripe parity codec
//!
//! Systematic Reed-Solomon over GF(2^8) with a Vandermonde generator, the
//! same construction storage targets across the cluster derive from the EC
//! class, so independently computed parity is byte-identical everywhere.
//! The first parity row is all-ones: for P = 1 the parity cell is the plain
//! XOR of the data cells.
//!
//! Three primitives cover every aggregation branch:
//!
//! - **full encode**: `P[i] = sum_j coef[i][j] * D[j]` over whole cells,
//!   used when replicas fill the stripe or parity is recalculated.
//! - **XOR diff**: `diff = old ^ new`, byte-wise.
//! - **incremental update**: `P'[i] = P[i] ^ coef[i][j] * diff` for one
//!   touched cell `j`, used for minority-cell partial updates.
//!
//! Cell buffers for a whole object pass live in [`StripeBuffers`]; they are
//! grown monotonically and reused across stripes.

use reed_solomon_erasure::{galois_8, Field};

use crate::error::{Error, Result};
use crate::layout::EcClass;

// =============================================================================
// Codec
// =============================================================================

/// Parity encoder for one EC class.
#[derive(Debug, Clone)]
pub struct StripeCodec {
    k: usize,
    p: usize,

    /// Parity rows of the generator matrix, row-major `p x k`.
    coefficients: Vec<u8>,
}

impl StripeCodec {
    /// Build the codec for an EC class.
    pub fn new(class: &EcClass) -> Result<Self> {
        let (k, p) = (class.k, class.p);
        if k + p > 255 {
            return Err(Error::Codec(format!(
                "k + p = {} exceeds GF(2^8) limit",
                k + p
            )));
        }

        // Vandermonde parity rows: row i is gen^0, gen^1, ... with
        // gen = 2^i, so row 0 is all ones.
        let mut coefficients = vec![0u8; p * k];
        let mut gen: u8 = 1;
        for row in coefficients.chunks_exact_mut(k) {
            let mut c: u8 = 1;
            for slot in row.iter_mut() {
                *slot = c;
                c = galois_8::Field::mul(c, gen);
            }
            gen = galois_8::Field::mul(gen, 2);
        }

        Ok(Self { k, p, coefficients })
    }

    #[inline]
    pub fn data_cells(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn parity_cells(&self) -> usize {
        self.p
    }

    /// Generator coefficient applied to data cell `cell` for parity row
    /// `row`.
    #[inline]
    pub fn coefficient(&self, row: usize, cell: usize) -> u8 {
        self.coefficients[row * self.k + cell]
    }

    /// Encode `p` parity cells from `k` data cells.
    ///
    /// `data` holds the cells in stripe order; every slice and every parity
    /// cell must be exactly `cell_bytes` long.
    pub fn encode(&self, cell_bytes: usize, data: &[&[u8]], parity: &mut [u8]) -> Result<()> {
        if data.len() != self.k {
            return Err(Error::Codec(format!(
                "expected {} data cells, got {}",
                self.k,
                data.len()
            )));
        }
        if parity.len() != self.p * cell_bytes {
            return Err(Error::Codec(format!(
                "parity buffer is {} bytes, expected {}",
                parity.len(),
                self.p * cell_bytes
            )));
        }
        for (j, cell) in data.iter().enumerate() {
            if cell.len() != cell_bytes {
                return Err(Error::Codec(format!(
                    "data cell {} is {} bytes, expected {}",
                    j,
                    cell.len(),
                    cell_bytes
                )));
            }
        }

        for (row, out) in parity.chunks_exact_mut(cell_bytes).enumerate() {
            galois_8::Field::mul_slice(self.coefficient(row, 0), data[0], out);
            for (j, cell) in data.iter().enumerate().skip(1) {
                galois_8::Field::mul_slice_add(self.coefficient(row, j), cell, out);
            }
        }
        Ok(())
    }

    /// Fold the diff of one data cell into all parity cells in place.
    pub fn update(
        &self,
        cell_bytes: usize,
        cell: usize,
        diff: &[u8],
        parity: &mut [u8],
    ) -> Result<()> {
        if cell >= self.k {
            return Err(Error::Codec(format!(
                "cell index {} out of range (k = {})",
                cell, self.k
            )));
        }
        if diff.len() != cell_bytes || parity.len() != self.p * cell_bytes {
            return Err(Error::Codec("update buffer size mismatch".into()));
        }

        for (row, out) in parity.chunks_exact_mut(cell_bytes).enumerate() {
            galois_8::Field::mul_slice_add(self.coefficient(row, cell), diff, out);
        }
        Ok(())
    }
}

/// Byte-wise `diff = old ^ new`.
pub fn xor_diff(old: &[u8], new: &[u8], diff: &mut [u8]) {
    debug_assert_eq!(old.len(), new.len());
    debug_assert_eq!(old.len(), diff.len());
    for ((d, o), n) in diff.iter_mut().zip(old).zip(new) {
        *d = o ^ n;
    }
}

// =============================================================================
// Stripe buffers
// =============================================================================

/// Scratch buffers for one akey pass: new data cells, old data cells, parity
/// cells, and a single diff cell. Grown monotonically, reused across
/// stripes.
#[derive(Debug, Default)]
pub struct StripeBuffers {
    pub data: Vec<u8>,
    pub odata: Vec<u8>,
    pub parity: Vec<u8>,
    pub diff: Vec<u8>,
}

impl StripeBuffers {
    /// Size (and zero) the buffers for one stripe of the given class and
    /// record size.
    pub fn prepare(&mut self, class: &EcClass, record_size: usize) {
        let cell = class.cell_bytes(record_size);
        let data_len = cell * class.k;
        let parity_len = cell * class.p;

        for (buf, len) in [
            (&mut self.data, data_len),
            (&mut self.odata, data_len),
            (&mut self.parity, parity_len),
            (&mut self.diff, cell),
        ] {
            if buf.len() < len {
                buf.resize(len, 0);
            }
            buf[..len].fill(0);
        }
    }

    /// The `idx`-th cell of the data buffer.
    pub fn data_cell(&self, cell_bytes: usize, idx: usize) -> &[u8] {
        &self.data[idx * cell_bytes..(idx + 1) * cell_bytes]
    }

    /// The `idx`-th cell of the old-data buffer.
    pub fn odata_cell(&self, cell_bytes: usize, idx: usize) -> &[u8] {
        &self.odata[idx * cell_bytes..(idx + 1) * cell_bytes]
    }

    /// The `idx`-th parity cell.
    pub fn parity_cell(&self, cell_bytes: usize, idx: usize) -> &[u8] {
        &self.parity[idx * cell_bytes..(idx + 1) * cell_bytes]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(k: usize, p: usize) -> StripeCodec {
        let class = EcClass::new(k, p, 4).unwrap();
        StripeCodec::new(&class).unwrap()
    }

    #[test]
    fn test_first_parity_row_is_xor() {
        let codec = codec(2, 1);
        let a = [0x12u8, 0x34, 0x56, 0x78];
        let b = [0xab_u8, 0xcd, 0xef, 0x01];
        let mut parity = vec![0u8; 4];
        codec
            .encode(4, &[a.as_slice(), b.as_slice()], &mut parity)
            .unwrap();
        let xor: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();
        assert_eq!(parity, xor);
    }

    #[test]
    fn test_parity_rows_differ() {
        let codec = codec(4, 2);
        let cells: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i + 1; 8]).collect();
        let refs: Vec<&[u8]> = cells.iter().map(|c| c.as_slice()).collect();
        let mut parity = vec![0u8; 16];
        codec.encode(8, &refs, &mut parity).unwrap();
        assert_ne!(&parity[..8], &parity[8..]);
    }

    #[test]
    fn test_update_matches_reencode() {
        let codec = codec(4, 2);
        let cell = 8usize;

        let old_cells: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i * 3 + 1; cell]).collect();
        let mut new_cells = old_cells.clone();
        new_cells[2] = vec![0x5a; cell];

        let old_refs: Vec<&[u8]> = old_cells.iter().map(|c| c.as_slice()).collect();
        let new_refs: Vec<&[u8]> = new_cells.iter().map(|c| c.as_slice()).collect();

        let mut parity = vec![0u8; 2 * cell];
        codec.encode(cell, &old_refs, &mut parity).unwrap();

        let mut diff = vec![0u8; cell];
        xor_diff(&old_cells[2], &new_cells[2], &mut diff);
        codec.update(cell, 2, &diff, &mut parity).unwrap();

        let mut expected = vec![0u8; 2 * cell];
        codec.encode(cell, &new_refs, &mut expected).unwrap();
        assert_eq!(parity, expected);
    }

    #[test]
    fn test_encode_rejects_bad_shapes() {
        let codec = codec(2, 1);
        let a = [0u8; 4];
        let mut parity = vec![0u8; 4];
        assert!(codec.encode(4, &[a.as_slice()], &mut parity).is_err());
        assert!(codec
            .encode(4, &[a.as_slice(), &a[..2]], &mut parity)
            .is_err());
        let mut short = vec![0u8; 2];
        assert!(codec
            .encode(4, &[a.as_slice(), a.as_slice()], &mut short)
            .is_err());
        assert!(codec.update(4, 7, &a, &mut parity).is_err());
    }

    #[test]
    fn test_buffers_grow_and_zero() {
        let class = EcClass::new(2, 1, 4).unwrap();
        let mut bufs = StripeBuffers::default();
        bufs.prepare(&class, 8);
        assert!(bufs.data.len() >= 64);
        bufs.data[0] = 0xff;
        bufs.prepare(&class, 8);
        assert_eq!(bufs.data[0], 0);
    }

    // =========================================================================
    // Properties
    // =========================================================================

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn cells_strategy(k: usize, cell: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
            prop::collection::vec(prop::collection::vec(any::<u8>(), cell..=cell), k..=k)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Incremental updates over any subset of cells agree with a
            /// fresh encode of the final stripe.
            #[test]
            fn prop_update_equals_reencode(
                k in 2usize..=6,
                p in 1usize..=3,
                seed in any::<u8>(),
            ) {
                let cell = 16usize;
                let class = EcClass::new(k, p, cell as u64).unwrap();
                let codec = StripeCodec::new(&class).unwrap();

                let old: Vec<Vec<u8>> =
                    (0..k).map(|i| vec![seed.wrapping_add(i as u8); cell]).collect();
                let mut new = old.clone();
                // touch every other cell
                for (i, c) in new.iter_mut().enumerate() {
                    if i % 2 == 0 {
                        c.fill(seed.wrapping_mul(7).wrapping_add(i as u8));
                    }
                }

                let old_refs: Vec<&[u8]> = old.iter().map(|c| c.as_slice()).collect();
                let new_refs: Vec<&[u8]> = new.iter().map(|c| c.as_slice()).collect();

                let mut parity = vec![0u8; p * cell];
                codec.encode(cell, &old_refs, &mut parity).unwrap();

                let mut diff = vec![0u8; cell];
                for i in (0..k).step_by(2) {
                    xor_diff(&old[i], &new[i], &mut diff);
                    codec.update(cell, i, &diff, &mut parity).unwrap();
                }

                let mut expected = vec![0u8; p * cell];
                codec.encode(cell, &new_refs, &mut expected).unwrap();
                prop_assert_eq!(parity, expected);
            }

            /// Encoding is deterministic: same class, same data, same parity.
            #[test]
            fn prop_encode_deterministic(data in cells_strategy(3, 8)) {
                let class = EcClass::new(3, 2, 8).unwrap();
                let a = StripeCodec::new(&class).unwrap();
                let b = StripeCodec::new(&class).unwrap();
                let refs: Vec<&[u8]> = data.iter().map(|c| c.as_slice()).collect();
                let mut pa = vec![0u8; 16];
                let mut pb = vec![0u8; 16];
                a.encode(8, &refs, &mut pa).unwrap();
                b.encode(8, &refs, &mut pb).unwrap();
                prop_assert_eq!(pa, pb);
            }
        }
    }
}
