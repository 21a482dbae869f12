//! Reed-Solomon erasure code over GF(2^8).
//!
//! The block is viewed as `k` symbols holding the values of a degree `< k`
//! polynomial at field points `0..k`; repair symbols are the polynomial's
//! values at points `k..k+r`. Any `k` surviving points interpolate the
//! polynomial back, so the code tolerates any `r` erasures per block.

use crate::error::{Error, Result};

/// GF(2^8) arithmetic tables for the AES-independent polynomial `0x11d`.
struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

impl GfTables {
    fn build() -> Self {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];

        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11d;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }

        GfTables { exp, log }
    }

    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
    }

    fn div(&self, a: u8, b: u8) -> u8 {
        debug_assert!(b != 0, "rs8m: division by zero in GF(256)");
        if a == 0 {
            return 0;
        }
        self.exp[255 + self.log[a as usize] as usize - self.log[b as usize] as usize]
    }
}

/// Reed-Solomon block codec for fixed `(k, r)` geometry.
pub struct Codec {
    gf: GfTables,
    n_source: usize,
    n_repair: usize,
    /// Lagrange coefficients for evaluating the source polynomial at each
    /// repair point, precomputed at construction.
    encode_matrix: Vec<Vec<u8>>,
}

impl Codec {
    /// Create a codec for `k` source and `r` repair symbols per block.
    pub fn new(n_source: usize, n_repair: usize) -> Result<Self> {
        if n_source == 0 || n_source + n_repair > 255 {
            return Err(Error::InvalidArgument(format!(
                "rs8m: unsupported block geometry: k={n_source} r={n_repair}"
            )));
        }

        let gf = GfTables::build();

        let points: Vec<u8> = (0..n_source as u8).collect();
        let mut encode_matrix = Vec::with_capacity(n_repair);
        for p in 0..n_repair {
            let x = (n_source + p) as u8;
            encode_matrix.push(lagrange_row(&gf, &points, x));
        }

        Ok(Codec {
            gf,
            n_source,
            n_repair,
            encode_matrix,
        })
    }

    /// Compute repair symbols for a full set of source symbols.
    ///
    /// All source symbols must have the same length; repair symbols come out
    /// with that length.
    pub fn encode(&self, source: &[&[u8]]) -> Vec<Vec<u8>> {
        assert_eq!(source.len(), self.n_source, "rs8m: bad source symbol count");
        let symbol_len = source[0].len();
        debug_assert!(source.iter().all(|s| s.len() == symbol_len));

        let mut repair = vec![vec![0u8; symbol_len]; self.n_repair];
        for (p, out) in repair.iter_mut().enumerate() {
            let coeffs = &self.encode_matrix[p];
            for (i, sym) in source.iter().enumerate() {
                let c = coeffs[i];
                if c == 0 {
                    continue;
                }
                for (o, &b) in out.iter_mut().zip(sym.iter()) {
                    *o ^= self.gf.mul(c, b);
                }
            }
        }
        repair
    }

    /// Reconstruct missing source symbols in place.
    ///
    /// `symbols` holds all `k + r` block positions; at least `k` must be
    /// present. Only the first `k` (source) entries are filled in.
    pub fn decode(&self, symbols: &mut [Option<Vec<u8>>]) -> Result<()> {
        assert_eq!(
            symbols.len(),
            self.n_source + self.n_repair,
            "rs8m: bad block size"
        );

        let present: Vec<usize> = symbols
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .take(self.n_source)
            .collect();

        if present.len() < self.n_source {
            return Err(Error::ProtocolError(format!(
                "rs8m: not enough symbols to decode: have={} need={}",
                present.len(),
                self.n_source
            )));
        }

        let points: Vec<u8> = present.iter().map(|&i| i as u8).collect();
        let symbol_len = symbols[present[0]].as_ref().unwrap().len();

        for miss in 0..self.n_source {
            if symbols[miss].is_some() {
                continue;
            }

            let coeffs = lagrange_row(&self.gf, &points, miss as u8);
            let mut out = vec![0u8; symbol_len];
            for (c, &src_index) in coeffs.iter().zip(present.iter()) {
                if *c == 0 {
                    continue;
                }
                let sym = symbols[src_index].as_ref().unwrap();
                for (o, &b) in out.iter_mut().zip(sym.iter()) {
                    *o ^= self.gf.mul(*c, b);
                }
            }
            symbols[miss] = Some(out);
        }

        Ok(())
    }
}

/// Lagrange basis coefficients for interpolating from `points` to `x`.
///
/// `row[i]` is the weight of the symbol at `points[i]` in the value at `x`.
fn lagrange_row(gf: &GfTables, points: &[u8], x: u8) -> Vec<u8> {
    let mut row = Vec::with_capacity(points.len());
    for (i, &xi) in points.iter().enumerate() {
        if xi == x {
            // Interpolating onto an available point: identity.
            row.clear();
            row.resize(points.len(), 0);
            row[i] = 1;
            return row;
        }

        let mut num = 1u8;
        let mut den = 1u8;
        for (j, &xj) in points.iter().enumerate() {
            if j == i {
                continue;
            }
            // In GF(2^8) subtraction is XOR.
            num = gf.mul(num, x ^ xj);
            den = gf.mul(den, xi ^ xj);
        }
        row.push(gf.div(num, den));
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_symbols(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|j| (i * 37 + j * 11 + 5) as u8).collect())
            .collect()
    }

    fn run_recovery(k: usize, r: usize, lost: &[usize]) {
        let codec = Codec::new(k, r).unwrap();
        let source = make_symbols(k, 32);
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let repair = codec.encode(&refs);

        let mut symbols: Vec<Option<Vec<u8>>> = source
            .iter()
            .cloned()
            .map(Some)
            .chain(repair.into_iter().map(Some))
            .collect();
        for &i in lost {
            symbols[i] = None;
        }

        codec.decode(&mut symbols).unwrap();
        for i in 0..k {
            assert_eq!(symbols[i].as_ref().unwrap(), &source[i], "symbol {i}");
        }
    }

    #[test]
    fn test_recovers_single_loss() {
        run_recovery(10, 3, &[4]);
    }

    #[test]
    fn test_recovers_max_losses() {
        run_recovery(10, 3, &[0, 5, 9]);
    }

    #[test]
    fn test_recovers_with_lost_repair() {
        // Two source symbols and one repair symbol lost; still k present.
        run_recovery(10, 3, &[1, 2, 11]);
    }

    #[test]
    fn test_fails_beyond_capacity() {
        let codec = Codec::new(4, 2).unwrap();
        let source = make_symbols(4, 8);
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let repair = codec.encode(&refs);

        let mut symbols: Vec<Option<Vec<u8>>> = source
            .into_iter()
            .map(Some)
            .chain(repair.into_iter().map(Some))
            .collect();
        symbols[0] = None;
        symbols[1] = None;
        symbols[4] = None;

        assert!(codec.decode(&mut symbols).is_err());
    }

    #[test]
    fn test_rejects_oversized_block() {
        assert!(Codec::new(200, 100).is_err());
        assert!(Codec::new(0, 1).is_err());
    }
}
