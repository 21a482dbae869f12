//! Derived-field population for validated packets.

use crate::format::Format;
use crate::packet::{Packet, PacketReader};

/// Fills the RTP `duration` field of packets that lack it.
///
/// Duration is not carried on the wire; it is derived from the payload byte
/// count of the stream's format. Restored FEC packets and freshly parsed
/// packets both pass through here before reaching timestamp handling.
pub struct Populator<R> {
    reader: R,
    format: Format,
}

impl<R: PacketReader> Populator<R> {
    /// Create a populator for streams of the given format.
    pub fn new(reader: R, format: Format) -> Self {
        Populator { reader, format }
    }
}

impl<R: PacketReader> PacketReader for Populator<R> {
    fn read_packet(&mut self) -> Option<Packet> {
        let mut packet = self.reader.read_packet()?;

        if let Some(rtp) = packet.rtp.as_mut() {
            if rtp.duration == 0 {
                rtp.duration =
                    (rtp.payload.len() / (2 * self.format.channels as usize)) as u32;
            }
        }

        Some(packet)
    }
}
