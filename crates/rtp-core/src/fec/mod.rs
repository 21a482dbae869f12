//! Block-oriented forward error correction.
//!
//! A FEC stream groups consecutive source packets into blocks of `k` symbols
//! and derives `r` repair symbols per block. Any `k` of the `k + r` symbols
//! recover the block (exactly, for Reed-Solomon; with high probability, for
//! LDPC-Staircase). Symbols travel as RTP packets whose payload starts with
//! a scheme-specific payload id carrying the block coordinates.

mod codec;
mod ldpc;
mod reader;
mod rs8m;
mod writer;

pub use codec::BlockCodec;
pub use reader::{BlockReader, FecReaderConfig};
pub use writer::{BlockWriter, FecWriterConfig};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::Fec;

/// Erasure coding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FecScheme {
    /// FEC disabled.
    #[default]
    None,
    /// Reed-Solomon over GF(2^8), maximum distance separable.
    Rs8m,
    /// LDPC-Staircase, sparse XOR code.
    LdpcStaircase,
}

impl FecScheme {
    /// Scheme name for logs and URIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FecScheme::None => "none",
            FecScheme::Rs8m => "rs8m",
            FecScheme::LdpcStaircase => "ldpc",
        }
    }
}

impl std::fmt::Display for FecScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTP payload type used for RS8M repair packets.
pub const PAYLOAD_TYPE_RS8M_REPAIR: u8 = 123;

/// RTP payload type used for LDPC-Staircase repair packets.
pub const PAYLOAD_TYPE_LDPC_REPAIR: u8 = 124;

/// Size in bytes of the payload id prefix for a scheme.
pub fn payload_id_size(scheme: FecScheme) -> usize {
    match scheme {
        FecScheme::None => 0,
        FecScheme::Rs8m | FecScheme::LdpcStaircase => 8,
    }
}

/// Serialize the payload id of a FEC view.
///
/// Both schemes carry the same four fields; their byte order differs, which
/// keeps streams of different schemes mutually unparsable.
pub fn compose_payload_id(fec: &Fec, buf: &mut BytesMut) {
    match fec.scheme {
        FecScheme::None => {}
        FecScheme::Rs8m => {
            buf.put_u16(fec.source_block_number);
            buf.put_u16(fec.encoding_symbol_id);
            buf.put_u16(fec.source_block_length as u16);
            buf.put_u16(fec.block_length as u16);
        }
        FecScheme::LdpcStaircase => {
            buf.put_u16(fec.encoding_symbol_id);
            buf.put_u16(fec.source_block_number);
            buf.put_u16(fec.source_block_length as u16);
            buf.put_u16(fec.block_length as u16);
        }
    }
}

/// Parse the payload id prefix from an RTP payload.
///
/// Returns the FEC view and the payload remainder after the prefix.
pub fn parse_payload_id(scheme: FecScheme, payload: Bytes) -> Result<(Fec, Bytes)> {
    let size = payload_id_size(scheme);
    if payload.len() < size {
        return Err(Error::ProtocolError(format!(
            "fec: payload shorter than payload id: size={} scheme={scheme}",
            payload.len()
        )));
    }

    let word = |i: usize| u16::from_be_bytes([payload[i], payload[i + 1]]);

    let (sbn, esi) = match scheme {
        FecScheme::None => {
            return Ok((Fec::default(), payload));
        }
        FecScheme::Rs8m => (word(0), word(2)),
        FecScheme::LdpcStaircase => (word(2), word(0)),
    };
    let sblen = word(4) as usize;
    let blen = word(6) as usize;

    if sblen == 0 || blen < sblen {
        return Err(Error::ProtocolError(format!(
            "fec: bad block lengths: sblen={sblen} blen={blen}"
        )));
    }

    let rest = payload.slice(size..);
    Ok((
        Fec {
            scheme,
            encoding_symbol_id: esi,
            source_block_number: sbn,
            source_block_length: sblen,
            block_length: blen,
            payload: rest.clone(),
        },
        rest,
    ))
}
