//! Packet model.
//!
//! A [`Packet`] is a set of parsed *views* over one immutable byte slice.
//! Parsing pipelines (receiver) fill views from the bytes; composition
//! pipelines (sender) fill views first and serialize them at the end, setting
//! the `COMPOSED` flag to mark the byte slice as authoritative.
//!
//! Packets are passed by value between pipeline stages. The underlying bytes
//! are reference-counted by [`Bytes`], so cloning a packet (e.g. into the FEC
//! window while the jitter queue still holds it) is cheap and does not copy
//! payload data.

mod delayed;
mod interleaver;
pub mod queue;
mod router;

pub use delayed::DelayedReader;
pub use interleaver::Interleaver;
pub use queue::SortedQueue;
pub use router::Router;

use std::cmp::Ordering;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::fec::FecScheme;
use crate::units;
use crate::{BlockNum, Nanoseconds, RtpTimestamp, Seqnum, SourceId};

/// Packet flags.
///
/// A small bitset describing which views are present and how the packet is
/// classified by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Packet contains a UDP view.
    pub const UDP: PacketFlags = PacketFlags(1 << 0);
    /// Packet contains an RTP view.
    pub const RTP: PacketFlags = PacketFlags(1 << 1);
    /// Packet contains a FEC view.
    pub const FEC: PacketFlags = PacketFlags(1 << 2);
    /// Packet contains an RTCP compound view.
    pub const RTCP: PacketFlags = PacketFlags(1 << 3);
    /// Packet carries encoded audio samples.
    pub const AUDIO: PacketFlags = PacketFlags(1 << 4);
    /// Packet carries repair (parity) FEC symbols.
    pub const REPAIR: PacketFlags = PacketFlags(1 << 5);
    /// Packet carries a control message.
    pub const CONTROL: PacketFlags = PacketFlags(1 << 6);
    /// Packet byte slice is authoritative (views already serialized).
    pub const COMPOSED: PacketFlags = PacketFlags(1 << 7);
    /// Packet was reconstructed by the FEC decoder.
    pub const RESTORED: PacketFlags = PacketFlags(1 << 8);

    /// Empty flag set.
    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    /// True if all bits of `other` are set in `self`.
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    pub fn union(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: PacketFlags) {
        self.0 |= rhs.0;
    }
}

/// UDP view: transport addresses of the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Udp {
    /// Source address of the datagram.
    pub src_addr: SocketAddr,
    /// Destination address of the datagram.
    pub dst_addr: SocketAddr,
}

/// RTP view: parsed or to-be-composed RTP fields.
#[derive(Debug, Clone, Default)]
pub struct Rtp {
    /// Stream identifier (SSRC). Seqnums and timestamps are numbered
    /// independently within each stream.
    pub source: SourceId,

    /// Sequence number, wrapping.
    pub seqnum: Seqnum,

    /// Timestamp of the first sample in the packet, in stream clock units.
    pub timestamp: RtpTimestamp,

    /// Packet duration in the same units as `timestamp`.
    ///
    /// Not carried on the wire; derived by the populator from the payload.
    pub duration: RtpTimestamp,

    /// Wall-clock time when the first sample was captured, nanoseconds since
    /// Unix epoch. Zero means unknown.
    pub capture_timestamp: Nanoseconds,

    /// Marker bit.
    pub marker: bool,

    /// Payload type.
    pub payload_type: u8,

    /// Serialized header bytes (empty until parsed or composed).
    pub header: Bytes,

    /// Payload bytes, excluding header and padding.
    pub payload: Bytes,

    /// Number of padding bytes after the payload.
    pub padding: usize,
}

impl Rtp {
    /// Determine stream order relative to another RTP view: modular seqnum
    /// order first, modular timestamp order as tie-break.
    pub fn compare(&self, other: &Rtp) -> Ordering {
        if self.seqnum != other.seqnum {
            return if units::seqnum_lt(self.seqnum, other.seqnum) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        if self.timestamp != other.timestamp {
            return if units::timestamp_lt(self.timestamp, other.timestamp) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        Ordering::Equal
    }
}

/// FEC view: block coding fields carried in the payload prefix.
#[derive(Debug, Clone, Default)]
pub struct Fec {
    /// Erasure coding scheme of the stream this symbol belongs to.
    pub scheme: FecScheme,

    /// Position of this symbol inside its block. Source symbols occupy
    /// `0..source_block_length`, repair symbols the rest.
    pub encoding_symbol_id: u16,

    /// Number of the block this symbol belongs to, wrapping.
    pub source_block_number: BlockNum,

    /// Number of source symbols in the block.
    pub source_block_length: usize,

    /// Total number of symbols in the block, source plus repair.
    pub block_length: usize,

    /// Symbol payload.
    pub payload: Bytes,
}

impl Fec {
    fn compare(&self, other: &Fec) -> Ordering {
        if self.source_block_number != other.source_block_number {
            return if units::blknum_lt(self.source_block_number, other.source_block_number)
            {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        self.encoding_symbol_id.cmp(&other.encoding_symbol_id)
    }
}

/// RTCP view: an unparsed compound packet.
#[derive(Debug, Clone, Default)]
pub struct Rtcp {
    /// Compound packet bytes.
    pub data: Bytes,
}

/// A network packet with zero or more parsed views.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    flags: PacketFlags,

    /// UDP view, if present.
    pub udp: Option<Udp>,
    /// RTP view, if present.
    pub rtp: Option<Rtp>,
    /// FEC view, if present.
    pub fec: Option<Fec>,
    /// RTCP view, if present.
    pub rtcp: Option<Rtcp>,

    data: Bytes,
}

impl Packet {
    /// Create an empty packet with no views.
    pub fn new() -> Self {
        Packet::default()
    }

    /// Add flags to the packet.
    pub fn add_flags(&mut self, flags: PacketFlags) {
        self.flags |= flags;
    }

    /// Check that all given flags are set.
    pub fn has_flags(&self, flags: PacketFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Get the flag set.
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Get the serialized packet bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Set the serialized packet bytes.
    pub fn set_data(&mut self, data: Bytes) {
        self.data = data;
    }

    /// Stream identifier of the packet, or zero for packet types that do not
    /// carry one.
    pub fn source(&self) -> SourceId {
        match &self.rtp {
            Some(rtp) => rtp.source,
            None => 0,
        }
    }

    /// Timestamp of the first sample in the packet.
    pub fn begin(&self) -> RtpTimestamp {
        match &self.rtp {
            Some(rtp) => rtp.timestamp,
            None => 0,
        }
    }

    /// Timestamp just past the last sample in the packet.
    pub fn end(&self) -> RtpTimestamp {
        match &self.rtp {
            Some(rtp) => rtp.timestamp.wrapping_add(rtp.duration),
            None => 0,
        }
    }

    /// Determine packet order.
    ///
    /// RTP packets order by modular seqnum, then modular timestamp. Packets
    /// with only a FEC view order by block number, then symbol id.
    pub fn compare(&self, other: &Packet) -> Ordering {
        match (&self.rtp, &other.rtp) {
            (Some(a), Some(b)) => a.compare(b),
            _ => match (&self.fec, &other.fec) {
                (Some(a), Some(b)) => a.compare(b),
                _ => Ordering::Equal,
            },
        }
    }
}

/// Packet stream source.
///
/// `read_packet` returns the next packet of the stream, or `None` when the
/// stream is currently drained. Stream filters return `None` both when empty
/// and when the next packet was rejected; rejections are logged and counted
/// by the filter itself.
pub trait PacketReader {
    /// Read the next packet.
    fn read_packet(&mut self) -> Option<Packet>;
}

/// Packet stream sink.
pub trait PacketWriter {
    /// Write a packet to the stream.
    fn write_packet(&mut self, packet: Packet);
}

impl<T: PacketReader + ?Sized> PacketReader for &mut T {
    fn read_packet(&mut self) -> Option<Packet> {
        (**self).read_packet()
    }
}

impl<T: PacketWriter + ?Sized> PacketWriter for &mut T {
    fn write_packet(&mut self, packet: Packet) {
        (**self).write_packet(packet)
    }
}

impl<T: PacketReader + ?Sized> PacketReader for Box<T> {
    fn read_packet(&mut self) -> Option<Packet> {
        (**self).read_packet()
    }
}

impl<T: PacketWriter + ?Sized> PacketWriter for Box<T> {
    fn write_packet(&mut self, packet: Packet) {
        (**self).write_packet(packet)
    }
}

// Shared pipeline stages: both sides of a queue (or any stage accessed from
// two threads) are held behind `Arc<Mutex<_>>`; the lock scope is one call.
impl<T: PacketReader> PacketReader for std::sync::Arc<std::sync::Mutex<T>> {
    fn read_packet(&mut self) -> Option<Packet> {
        self.lock().unwrap().read_packet()
    }
}

impl<T: PacketWriter> PacketWriter for std::sync::Arc<std::sync::Mutex<T>> {
    fn write_packet(&mut self, packet: Packet) {
        self.lock().unwrap().write_packet(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seqnum: Seqnum, timestamp: RtpTimestamp) -> Packet {
        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            seqnum,
            timestamp,
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP);
        packet
    }

    #[test]
    fn test_flags() {
        let mut packet = Packet::new();
        assert!(!packet.has_flags(PacketFlags::RTP));

        packet.add_flags(PacketFlags::RTP | PacketFlags::AUDIO);
        assert!(packet.has_flags(PacketFlags::RTP));
        assert!(packet.has_flags(PacketFlags::RTP | PacketFlags::AUDIO));
        assert!(!packet.has_flags(PacketFlags::REPAIR));
    }

    #[test]
    fn test_compare_by_seqnum() {
        let a = rtp_packet(10, 100);
        let b = rtp_packet(11, 200);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
    }

    #[test]
    fn test_compare_wraparound() {
        let a = rtp_packet(65535, 100);
        let b = rtp_packet(0, 200);
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn test_compare_timestamp_tiebreak() {
        let a = rtp_packet(5, 100);
        let b = rtp_packet(5, 200);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(a.compare(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_begin_end() {
        let mut packet = rtp_packet(1, u32::MAX - 10);
        packet.rtp.as_mut().unwrap().duration = 20;
        assert_eq!(packet.begin(), u32::MAX - 10);
        assert_eq!(packet.end(), 9);
    }
}
