//! Packet-domain core for the rstream media toolkit.
//!
//! This crate implements everything that deals with packets rather than
//! audio frames: the packet model with its UDP/RTP/FEC/RTCP views, the RTP
//! wire format, sorted jitter queues and routing, stream filters (validator,
//! populator, timestamp injection), payload format handlers, block erasure
//! codecs (Reed-Solomon 8m and LDPC-Staircase), and the RTCP control session.
//!
//! Audio-frame processing lives in `rstream-media-core`; pipeline assembly
//! and scheduling live in `rstream-pipeline-core`.

pub mod error;
pub mod fec;
pub mod format;
pub mod packet;
pub mod populator;
pub mod rtcp;
pub mod timestamps;
pub mod units;
pub mod validator;
pub mod wire;

pub use error::{Error, Result};
pub use packet::{Packet, PacketFlags, PacketReader, PacketWriter};

/// RTP synchronization source identifier (SSRC).
pub type SourceId = u32;

/// RTP sequence number.
pub type Seqnum = u16;

/// RTP timestamp, in samples-per-channel units of the stream clock rate.
pub type RtpTimestamp = u32;

/// FEC source block number.
pub type BlockNum = u16;

/// Nanosecond timestamp or duration.
///
/// Wall-clock ("Unix") timestamps and monotonic durations share this alias;
/// which clock a value belongs to is part of each API's contract.
pub type Nanoseconds = i64;

/// Nanoseconds in one second.
pub const SECOND: Nanoseconds = 1_000_000_000;

/// Nanoseconds in one millisecond.
pub const MILLISECOND: Nanoseconds = 1_000_000;

/// Nanoseconds in one microsecond.
pub const MICROSECOND: Nanoseconds = 1_000;
