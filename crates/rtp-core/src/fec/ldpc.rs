//! LDPC-Staircase erasure code.
//!
//! Repair symbols form a staircase: each parity symbol is the XOR of a
//! sparse selection of source symbols and the previous parity symbol. The
//! sparse selection is derived from a deterministic generator seeded by the
//! block geometry, so encoder and decoder build identical matrices from the
//! `(source_block_length, block_length)` fields alone.
//!
//! Unlike Reed-Solomon this code is not maximum distance separable: with
//! pathological loss patterns decoding may fail even when `k` symbols
//! survive. Decoding runs full Gaussian elimination over GF(2), which
//! recovers whenever the surviving equations have full rank.

use crate::error::{Error, Result};

/// Ones per source column of the sparse part of the parity-check matrix.
const N1: usize = 3;

/// LDPC-Staircase block codec for fixed `(k, r)` geometry.
pub struct Codec {
    n_source: usize,
    n_repair: usize,
    /// `rows[j]` lists the source symbol indices participating in parity `j`.
    rows: Vec<Vec<usize>>,
}

/// Multiplicative congruential generator used to spread source columns over
/// parity rows. Parameters follow the minimal standard generator.
struct Prng(u64);

impl Prng {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(16807) % 0x7fff_ffff;
        (self.0 % bound as u64) as usize
    }
}

impl Codec {
    /// Create a codec for `k` source and `r` repair symbols per block.
    pub fn new(n_source: usize, n_repair: usize) -> Result<Self> {
        if n_source == 0 || n_repair == 0 {
            return Err(Error::InvalidArgument(format!(
                "ldpc: unsupported block geometry: k={n_source} r={n_repair}"
            )));
        }

        let mut rows = vec![Vec::new(); n_repair];
        let mut prng = Prng(n_source as u64 * 131 + n_repair as u64 + 1);

        for col in 0..n_source {
            let mut placed = 0;
            while placed < N1.min(n_repair) {
                let row = prng.next(n_repair);
                if !rows[row].contains(&col) {
                    rows[row].push(col);
                    placed += 1;
                }
            }
        }

        Ok(Codec {
            n_source,
            n_repair,
            rows,
        })
    }

    /// Compute repair symbols for a full set of source symbols.
    pub fn encode(&self, source: &[&[u8]]) -> Vec<Vec<u8>> {
        assert_eq!(source.len(), self.n_source, "ldpc: bad source symbol count");
        let symbol_len = source[0].len();

        let mut repair: Vec<Vec<u8>> = Vec::with_capacity(self.n_repair);
        for j in 0..self.n_repair {
            let mut out = vec![0u8; symbol_len];
            for &col in &self.rows[j] {
                xor_into(&mut out, source[col]);
            }
            if j > 0 {
                let prev = repair[j - 1].clone();
                xor_into(&mut out, &prev);
            }
            repair.push(out);
        }
        repair
    }

    /// Reconstruct missing source symbols in place.
    ///
    /// `symbols` holds all `k + r` block positions. Fails if the surviving
    /// equations do not determine every missing source symbol.
    pub fn decode(&self, symbols: &mut [Option<Vec<u8>>]) -> Result<()> {
        assert_eq!(
            symbols.len(),
            self.n_source + self.n_repair,
            "ldpc: bad block size"
        );

        let missing: Vec<usize> = symbols
            .iter()
            .enumerate()
            .filter_map(|(i, s)| if s.is_none() { Some(i) } else { None })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let symbol_len = symbols
            .iter()
            .flatten()
            .map(|s| s.len())
            .next()
            .ok_or_else(|| Error::ProtocolError("ldpc: empty block".to_string()))?;

        let unknown_of = |index: usize| missing.iter().position(|&m| m == index);

        // One equation per parity row: XOR of participating source symbols,
        // this parity, and the previous parity is zero.
        let mut equations: Vec<(Vec<bool>, Vec<u8>)> = Vec::with_capacity(self.n_repair);
        for j in 0..self.n_repair {
            let mut unknowns = vec![false; missing.len()];
            let mut rhs = vec![0u8; symbol_len];

            let involve = |index: usize,
                               unknowns: &mut Vec<bool>,
                               rhs: &mut Vec<u8>| {
                match unknown_of(index) {
                    Some(u) => unknowns[u] = !unknowns[u],
                    None => xor_into(rhs, symbols[index].as_ref().unwrap()),
                }
            };

            for &col in &self.rows[j] {
                involve(col, &mut unknowns, &mut rhs);
            }
            involve(self.n_source + j, &mut unknowns, &mut rhs);
            if j > 0 {
                involve(self.n_source + j - 1, &mut unknowns, &mut rhs);
            }

            equations.push((unknowns, rhs));
        }

        // Gaussian elimination over GF(2).
        let mut solved: Vec<Option<Vec<u8>>> = vec![None; missing.len()];
        let mut used = vec![false; equations.len()];

        for u in 0..missing.len() {
            let pivot = match (0..equations.len())
                .find(|&e| !used[e] && equations[e].0[u])
            {
                Some(p) => p,
                None => continue,
            };
            used[pivot] = true;

            let (pivot_unknowns, pivot_rhs) = equations[pivot].clone();
            for (e, (unknowns, rhs)) in equations.iter_mut().enumerate() {
                if e != pivot && unknowns[u] {
                    for (a, b) in unknowns.iter_mut().zip(pivot_unknowns.iter()) {
                        *a ^= b;
                    }
                    xor_into(rhs, &pivot_rhs);
                }
            }
        }

        for (e, (unknowns, rhs)) in equations.iter().enumerate() {
            if !used[e] {
                continue;
            }
            let mut vars = unknowns.iter().enumerate().filter(|(_, &x)| x);
            if let (Some((u, _)), None) = (vars.next(), vars.next()) {
                solved[u] = Some(rhs.clone());
            }
        }

        for (u, &index) in missing.iter().enumerate() {
            if index >= self.n_source {
                continue;
            }
            match solved[u].take() {
                Some(value) => symbols[index] = Some(value),
                None => {
                    return Err(Error::ProtocolError(format!(
                        "ldpc: source symbol not recoverable: esi={index}"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn xor_into(out: &mut [u8], other: &[u8]) {
    for (o, &b) in out.iter_mut().zip(other.iter()) {
        *o ^= b;
    }
}
