//! Pseudo-random packet interleaving.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::{Packet, PacketWriter};

/// Reorders outgoing packets within a fixed window.
///
/// Spreading consecutive packets over the wire makes burst losses land in
/// different FEC blocks, which raises the chance that each block stays
/// recoverable. The window size is normally the FEC block length (source
/// plus repair packets).
pub struct Interleaver<W> {
    writer: W,
    window: Vec<Packet>,
    order: Vec<usize>,
    window_size: usize,
}

impl<W: PacketWriter> Interleaver<W> {
    /// Create an interleaver with the given window size.
    pub fn new(writer: W, window_size: usize) -> Self {
        assert!(window_size > 0, "interleaver: window size must be non-zero");

        // The permutation is fixed per interleaver instance; a deterministic
        // seed keeps send patterns reproducible in tests.
        let mut order: Vec<usize> = (0..window_size).collect();
        let mut rng = StdRng::seed_from_u64(window_size as u64);
        order.shuffle(&mut rng);

        debug!(window_size, "interleaver: initializing");

        Interleaver {
            writer,
            window: Vec::with_capacity(window_size),
            order,
            window_size,
        }
    }

    /// Emit buffered packets in arrival order without reordering.
    pub fn flush(&mut self) {
        for packet in self.window.drain(..) {
            self.writer.write_packet(packet);
        }
    }
}

impl<W: PacketWriter> PacketWriter for Interleaver<W> {
    fn write_packet(&mut self, packet: Packet) {
        self.window.push(packet);

        if self.window.len() == self.window_size {
            let mut window: Vec<Option<Packet>> =
                self.window.drain(..).map(Some).collect();
            for &index in &self.order {
                if let Some(packet) = window[index].take() {
                    self.writer.write_packet(packet);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketFlags, Rtp};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u16>>>);

    impl PacketWriter for Capture {
        fn write_packet(&mut self, packet: Packet) {
            self.0.lock().unwrap().push(packet.rtp.unwrap().seqnum);
        }
    }

    fn rtp_packet(seqnum: u16) -> Packet {
        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            seqnum,
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP);
        packet
    }

    #[test]
    fn test_reorders_within_window() {
        let capture = Capture::default();
        let mut interleaver = Interleaver::new(capture.clone(), 5);

        for sn in 0..10u16 {
            interleaver.write_packet(rtp_packet(sn));
        }

        let sent = capture.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 10);

        // Every packet is sent exactly once.
        let mut sorted = sent.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());

        // Both windows use the same permutation.
        let shifted: Vec<u16> = sent[..5].iter().map(|sn| sn + 5).collect();
        assert_eq!(&sent[5..], &shifted[..]);
    }

    #[test]
    fn test_flush_partial_window() {
        let capture = Capture::default();
        let mut interleaver = Interleaver::new(capture.clone(), 5);

        for sn in 0..3u16 {
            interleaver.write_packet(rtp_packet(sn));
        }
        assert!(capture.0.lock().unwrap().is_empty());

        interleaver.flush();
        assert_eq!(*capture.0.lock().unwrap(), vec![0, 1, 2]);
    }
}
