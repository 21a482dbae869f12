//! Scheme dispatch for block codecs.

use super::{ldpc, rs8m, FecScheme};
use crate::error::{Error, Result};

/// A block erasure codec of one of the supported schemes.
///
/// The schemes differ only in their arithmetic; the interface is identical,
/// so the dispatch is a plain enum rather than a trait object.
pub enum BlockCodec {
    /// Reed-Solomon over GF(2^8).
    Rs8m(rs8m::Codec),
    /// LDPC-Staircase.
    Ldpc(ldpc::Codec),
}

impl BlockCodec {
    /// Create a codec for the given scheme and block geometry.
    pub fn new(scheme: FecScheme, n_source: usize, n_repair: usize) -> Result<Self> {
        match scheme {
            FecScheme::None => Err(Error::InvalidArgument(
                "fec codec: scheme is none".to_string(),
            )),
            FecScheme::Rs8m => Ok(BlockCodec::Rs8m(rs8m::Codec::new(n_source, n_repair)?)),
            FecScheme::LdpcStaircase => {
                Ok(BlockCodec::Ldpc(ldpc::Codec::new(n_source, n_repair)?))
            }
        }
    }

    /// Scheme implemented by this codec.
    pub fn scheme(&self) -> FecScheme {
        match self {
            BlockCodec::Rs8m(_) => FecScheme::Rs8m,
            BlockCodec::Ldpc(_) => FecScheme::LdpcStaircase,
        }
    }

    /// Compute repair symbols for a full block of source symbols.
    pub fn encode(&self, source: &[&[u8]]) -> Vec<Vec<u8>> {
        match self {
            BlockCodec::Rs8m(codec) => codec.encode(source),
            BlockCodec::Ldpc(codec) => codec.encode(source),
        }
    }

    /// Reconstruct missing source symbols in place.
    pub fn decode(&self, symbols: &mut [Option<Vec<u8>>]) -> Result<()> {
        match self {
            BlockCodec::Rs8m(codec) => codec.decode(symbols),
            BlockCodec::Ldpc(codec) => codec.decode(symbols),
        }
    }
}

/// Pack packet bytes into a fixed-size symbol: a 2-byte length prefix
/// followed by the bytes, zero-padded to `symbol_len`.
///
/// Source packets within a block may differ slightly in size (e.g. a padded
/// tail packet); the prefix lets the decoder restore the exact original
/// bytes.
pub fn pack_symbol(data: &[u8], symbol_len: usize) -> Vec<u8> {
    debug_assert!(data.len() + 2 <= symbol_len);
    debug_assert!(data.len() <= u16::MAX as usize);

    let mut symbol = vec![0u8; symbol_len];
    symbol[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
    symbol[2..2 + data.len()].copy_from_slice(data);
    symbol
}

/// Extract original packet bytes from a symbol produced by [`pack_symbol`].
pub fn unpack_symbol(symbol: &[u8]) -> Result<&[u8]> {
    if symbol.len() < 2 {
        return Err(Error::ProtocolError("fec: symbol too short".to_string()));
    }
    let len = u16::from_be_bytes([symbol[0], symbol[1]]) as usize;
    if 2 + len > symbol.len() {
        return Err(Error::ProtocolError(format!(
            "fec: bad symbol length prefix: len={len} symbol={}",
            symbol.len()
        )));
    }
    Ok(&symbol[2..2 + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_round_trip() {
        let symbol = pack_symbol(b"hello", 16);
        assert_eq!(symbol.len(), 16);
        assert_eq!(unpack_symbol(&symbol).unwrap(), b"hello");
    }

    #[test]
    fn test_unpack_rejects_corrupt_prefix() {
        let mut symbol = pack_symbol(b"hello", 16);
        symbol[0] = 0xff;
        assert!(unpack_symbol(&symbol).is_err());
    }

    #[test]
    fn test_codec_dispatch() {
        let codec = BlockCodec::new(FecScheme::Rs8m, 4, 2).unwrap();
        assert_eq!(codec.scheme(), FecScheme::Rs8m);

        let codec = BlockCodec::new(FecScheme::LdpcStaircase, 4, 2).unwrap();
        assert_eq!(codec.scheme(), FecScheme::LdpcStaircase);

        assert!(BlockCodec::new(FecScheme::None, 4, 2).is_err());
    }
}
