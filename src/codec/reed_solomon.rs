//! Vandermonde/Cauchy Reed–Solomon codec over GF(2^16) (spec §4 component
//! 4, §4.5, §8 "L3 recoverability").
//!
//! `k = m = G` (data shards == parity shards == group size). The generator
//! matrix guarantees every k x k submatrix of the stacked `[I_k; M]` matrix
//! is invertible, so any k surviving shards out of the 2k total (data +
//! parity) are sufficient to reconstruct everything.

use super::galois::{gf_inverse, gf_mul, region_multiply_w16, region_xor, single_divide_into_one};
use crate::error::{EngineError, EngineResult};

/// The k x k Vandermonde-like generator matrix (spec §4.5).
#[derive(Debug, Clone)]
pub struct Generator {
    k: usize,
    matrix: Vec<u16>,
}

impl Generator {
    /// Build the generator for `k` data shards / `k` parity shards.
    pub fn new(k: usize) -> Self {
        let mut matrix = vec![0u16; k * k];
        for i in 0..k {
            for j in 0..k {
                matrix[i * k + j] = single_divide_into_one((i ^ (k + j)) as u16);
            }
        }
        Generator { k, matrix }
    }

    fn row(&self, i: usize) -> &[u16] {
        &self.matrix[i * self.k..(i + 1) * self.k]
    }

    /// Number of data (and parity) shards this generator was built for.
    pub fn k(&self) -> usize {
        self.k
    }
}

fn validate_blocks(generator: &Generator, data_blocks: &[Vec<u8>]) -> EngineResult<usize> {
    let k = generator.k();
    if data_blocks.len() != k {
        return Err(EngineError::ConfigInvalid(format!(
            "expected {k} data blocks, got {}",
            data_blocks.len()
        )));
    }
    let block_size = data_blocks[0].len();
    if data_blocks.iter().any(|b| b.len() != block_size) {
        return Err(EngineError::ConfigInvalid(
            "all data blocks must share one padded block size".into(),
        ));
    }
    Ok(block_size)
}

/// Compute a single parity row (`generator.row(row_index)`'s dot product
/// with `data_blocks`), the unit of work a single group member performs
/// per block in the distributed L3 encode (spec §4.5: "for each of the k
/// other ranks' blocks it accumulates into its parity block").
pub fn encode_row(
    generator: &Generator,
    row_index: usize,
    data_blocks: &[Vec<u8>],
) -> EngineResult<Vec<u8>> {
    let block_size = validate_blocks(generator, data_blocks)?;
    let row = generator.row(row_index);
    let mut parity = vec![0u8; block_size];
    for (i, data) in data_blocks.iter().enumerate() {
        let coeff = row[i];
        if coeff == 0 {
            continue;
        } else if coeff == 1 {
            region_xor(&mut parity, data);
        } else {
            region_multiply_w16(data, coeff, &mut parity, true);
        }
    }
    Ok(parity)
}

/// Encode `data_blocks` (exactly `generator.k()` equally sized blocks) into
/// `generator.k()` parity blocks, using XOR when a coefficient is 1 and a
/// GF(2^16) region multiply otherwise (spec §4.5 encode step). Used for
/// local (single-process) encode/decode and to re-derive missing parity
/// after an L3 decode.
pub fn encode_blocks(generator: &Generator, data_blocks: &[Vec<u8>]) -> EngineResult<Vec<Vec<u8>>> {
    let k = generator.k();
    validate_blocks(generator, data_blocks)?;
    (0..k).map(|r| encode_row(generator, r, data_blocks)).collect()
}

/// A square matrix over GF(2^16), used for Gauss-Jordan inversion of the
/// survivor selection matrix during decode.
struct Matrix {
    n: usize,
    data: Vec<u16>,
}

impl Matrix {
    fn from_rows(rows: Vec<Vec<u16>>) -> Self {
        let n = rows.len();
        let mut data = Vec::with_capacity(n * n);
        for row in rows {
            debug_assert_eq!(row.len(), n);
            data.extend(row);
        }
        Matrix { n, data }
    }

    fn get(&self, r: usize, c: usize) -> u16 {
        self.data[r * self.n + c]
    }

    /// Gauss-Jordan inversion over GF(2^16); `None` if singular.
    fn invert(&self) -> Option<Matrix> {
        let n = self.n;
        let mut a = self.data.clone();
        let mut inv = vec![0u16; n * n];
        for i in 0..n {
            inv[i * n + i] = 1;
        }

        for col in 0..n {
            let pivot = (col..n).find(|&row| a[row * n + col] != 0)?;
            if pivot != col {
                for k in 0..n {
                    a.swap(col * n + k, pivot * n + k);
                    inv.swap(col * n + k, pivot * n + k);
                }
            }
            let pivot_inv = gf_inverse(a[col * n + col]);
            for k in 0..n {
                a[col * n + k] = gf_mul(a[col * n + k], pivot_inv);
                inv[col * n + k] = gf_mul(inv[col * n + k], pivot_inv);
            }
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = a[row * n + col];
                if factor == 0 {
                    continue;
                }
                for k in 0..n {
                    a[row * n + k] ^= gf_mul(factor, a[col * n + k]);
                    inv[row * n + k] ^= gf_mul(factor, inv[col * n + k]);
                }
            }
        }
        Some(Matrix { n, data: inv })
    }
}

/// Reconstruct erased shards in `shards` (length `2k`: data shards
/// `0..k`, parity shards `k..2k`), given at least `k` of them are
/// `Some`. Recovers missing data shards by inverting the survivor
/// selection matrix, then re-derives any missing parity shards from the
/// now-complete data (spec §4.5 decode, §8 "L3 recoverability").
pub fn decode(generator: &Generator, shards: &mut [Option<Vec<u8>>]) -> EngineResult<()> {
    let k = generator.k();
    if shards.len() != 2 * k {
        return Err(EngineError::ConfigInvalid(format!(
            "expected {} shards (k data + k parity), got {}",
            2 * k,
            shards.len()
        )));
    }

    let erased: Vec<usize> = shards
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.is_none().then_some(i))
        .collect();
    if erased.is_empty() {
        return Ok(());
    }
    if erased.len() > k {
        return Err(EngineError::GroupUnrecoverable {
            level: 3,
            reason: format!("{} erasures exceed tolerance k={k}", erased.len()),
        });
    }

    let block_size = shards
        .iter()
        .find_map(|s| s.as_ref().map(Vec::len))
        .ok_or_else(|| EngineError::GroupUnrecoverable {
            level: 3,
            reason: "no surviving shards".into(),
        })?;

    let survivors: Vec<usize> = (0..2 * k).filter(|&i| shards[i].is_some()).take(k).collect();
    if survivors.len() < k {
        return Err(EngineError::GroupUnrecoverable {
            level: 3,
            reason: "fewer than k surviving shards".into(),
        });
    }

    let selection_rows: Vec<Vec<u16>> = survivors
        .iter()
        .map(|&i| full_matrix_row(generator, i))
        .collect();
    let inverse = Matrix::from_rows(selection_rows).invert().ok_or_else(|| {
        EngineError::GroupUnrecoverable {
            level: 3,
            reason: "survivor set does not span a non-singular submatrix".into(),
        }
    })?;

    let mut data_blocks = vec![vec![0u8; block_size]; k];
    for (j, data_block) in data_blocks.iter_mut().enumerate() {
        for (col, &survivor_idx) in survivors.iter().enumerate() {
            let coeff = inverse.get(j, col);
            if coeff == 0 {
                continue;
            }
            let y = shards[survivor_idx].as_ref().expect("survivor index has data");
            if coeff == 1 {
                region_xor(data_block, y);
            } else {
                region_multiply_w16(y, coeff, data_block, true);
            }
        }
    }

    for &e in &erased {
        if e < k {
            shards[e] = Some(data_blocks[e].clone());
        }
    }

    if erased.iter().any(|&e| e >= k) {
        let parity = encode_blocks(generator, &data_blocks)?;
        for &e in &erased {
            if e >= k {
                shards[e] = Some(parity[e - k].clone());
            }
        }
    }

    Ok(())
}

/// Row `i` of the conceptual `2k x k` matrix `[I_k; M]`: identity for
/// `i < k` (a surviving data shard is itself), the generator's row for
/// `i >= k` (a surviving parity shard is a linear combination of data).
fn full_matrix_row(generator: &Generator, i: usize) -> Vec<u16> {
    let k = generator.k();
    if i < k {
        let mut row = vec![0u16; k];
        row[i] = 1;
        row
    } else {
        generator.row(i - k).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blocks(k: usize, block_size: usize, seed: u8) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| {
                (0..block_size)
                    .map(|b| (seed.wrapping_add(i as u8).wrapping_mul(31)).wrapping_add(b as u8))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn encode_then_decode_with_no_erasures_is_identity() {
        let k = 4;
        let gen = Generator::new(k);
        let data = blocks(k, 8, 1);
        let parity = encode_blocks(&gen, &data).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            data.iter().cloned().map(Some).chain(parity.iter().cloned().map(Some)).collect();
        decode(&gen, &mut shards).unwrap();
        for (i, d) in data.iter().enumerate() {
            assert_eq!(shards[i].as_ref().unwrap(), d);
        }
    }

    #[test]
    fn recovers_from_k_erasures_scattered_across_data_and_parity() {
        let k = 5;
        let gen = Generator::new(k);
        let data = blocks(k, 16, 7);
        let parity = encode_blocks(&gen, &data).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            data.iter().cloned().map(Some).chain(parity.iter().cloned().map(Some)).collect();

        // Erase two data shards and three parity shards (k = 5 total).
        for idx in [1, 3, k, k + 2, k + 4] {
            shards[idx] = None;
        }
        decode(&gen, &mut shards).unwrap();
        for (i, d) in data.iter().enumerate() {
            assert_eq!(shards[i].as_ref().unwrap(), d, "data shard {i} mismatch");
        }
        let recomputed = encode_blocks(&gen, &data).unwrap();
        for (i, p) in recomputed.iter().enumerate() {
            assert_eq!(shards[k + i].as_ref().unwrap(), p, "parity shard {i} mismatch");
        }
    }

    #[test]
    fn more_than_k_erasures_is_unrecoverable() {
        let k = 3;
        let gen = Generator::new(k);
        let data = blocks(k, 8, 3);
        let parity = encode_blocks(&gen, &data).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> =
            data.iter().cloned().map(Some).chain(parity.iter().cloned().map(Some)).collect();
        for idx in [0, 1, k, k + 1] {
            shards[idx] = None;
        }
        let err = decode(&gen, &mut shards).unwrap_err();
        assert!(matches!(err, EngineError::GroupUnrecoverable { level: 3, .. }));
    }

    proptest! {
        #[test]
        fn any_k_survivors_out_of_2k_recover_the_data(
            k in 2usize..6,
            seed in any::<u8>(),
            erase_pattern in prop::collection::vec(any::<bool>(), 2..12),
        ) {
            let gen = Generator::new(k);
            let data = blocks(k, 8, seed);
            let parity = encode_blocks(&gen, &data).unwrap();
            let mut shards: Vec<Option<Vec<u8>>> =
                data.iter().cloned().map(Some).chain(parity.iter().cloned().map(Some)).collect();

            // Erase up to k positions deterministically from the pattern.
            let mut erase_count = 0;
            for i in 0..2 * k {
                let want_erase = erase_pattern.get(i).copied().unwrap_or(false);
                if want_erase && erase_count < k {
                    shards[i] = None;
                    erase_count += 1;
                }
            }
            decode(&gen, &mut shards).unwrap();
            for (i, d) in data.iter().enumerate() {
                prop_assert_eq!(shards[i].as_ref().unwrap(), d);
            }
        }
    }
}
