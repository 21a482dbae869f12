//! Packetizer: frames to RTP packets.

use rand::Rng;
use rstream_rtp_core::format::FrameEncoder;
use rstream_rtp_core::packet::{Packet, PacketFlags, PacketWriter, Rtp};
use rstream_rtp_core::{Nanoseconds, RtpTimestamp, Seqnum, SourceId};
use tracing::debug;

use crate::frame::{Frame, FrameWriter};
use crate::sample::SampleSpec;

/// Accumulates written frames and emits fixed-length RTP packets.
///
/// Stream identity (SSRC), the initial seqnum and the initial timestamp are
/// randomized at construction. Seqnums advance by one per packet and
/// timestamps by the packet duration; the capture timestamp of the first
/// sample of each packet is carried from the written frames.
pub struct Packetizer<W> {
    writer: W,
    encoder: Box<dyn FrameEncoder>,
    spec: SampleSpec,

    samples_per_packet: u32,
    payload_type: u8,

    source: SourceId,
    seqnum: Seqnum,
    timestamp: RtpTimestamp,
    capture_ts: Nanoseconds,

    /// Samples per channel already encoded into the open packet.
    packet_pos: u32,
    packet_open: bool,
    /// Capture timestamp of the open packet's first sample.
    packet_cts: Nanoseconds,

    n_packets: u64,
}

impl<W: PacketWriter> Packetizer<W> {
    /// Create a packetizer emitting packets of `packet_length` duration.
    pub fn new(
        writer: W,
        encoder: Box<dyn FrameEncoder>,
        spec: SampleSpec,
        packet_length: Nanoseconds,
        payload_type: u8,
    ) -> crate::Result<Self> {
        let samples_per_packet = spec.ns_to_rtp_timestamp(packet_length);
        if samples_per_packet <= 0 {
            return Err(crate::Error::InvalidArgument(format!(
                "packetizer: bad packet length: {packet_length}ns"
            )));
        }

        let mut rng = rand::thread_rng();
        let source = rng.gen();
        let seqnum = rng.gen();
        let timestamp = rng.gen();

        debug!(
            channels = spec.num_channels(),
            samples_per_packet, source, "packetizer: initializing"
        );

        Ok(Packetizer {
            writer,
            encoder,
            spec,
            samples_per_packet: samples_per_packet as u32,
            payload_type,
            source,
            seqnum,
            timestamp,
            capture_ts: 0,
            packet_pos: 0,
            packet_open: false,
            packet_cts: 0,
            n_packets: 0,
        })
    }

    /// SSRC of the emitted stream.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Number of packets emitted.
    pub fn num_packets(&self) -> u64 {
        self.n_packets
    }

    /// Emit the open packet even if it is short; the encoder pads the
    /// remainder with zero samples.
    pub fn flush(&mut self) {
        if self.packet_open {
            self.end_packet();
        }
    }

    fn begin_packet(&mut self) {
        self.encoder.begin(self.samples_per_packet as usize);
        self.packet_open = true;
        self.packet_cts = self.capture_ts;
        self.packet_pos = 0;
    }

    fn end_packet(&mut self) {
        let payload = self.encoder.end();

        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            source: self.source,
            seqnum: self.seqnum,
            timestamp: self.timestamp,
            duration: self.packet_pos,
            capture_timestamp: self.packet_cts,
            payload_type: self.payload_type,
            payload,
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP | PacketFlags::AUDIO);

        self.writer.write_packet(packet);
        self.n_packets += 1;

        self.seqnum = self.seqnum.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.packet_pos);
        self.packet_open = false;
        self.packet_pos = 0;
    }
}

impl<W: PacketWriter> FrameWriter for Packetizer<W> {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        assert!(
            frame.num_samples() % self.spec.num_channels() == 0,
            "packetizer: unexpected frame size"
        );

        let n_chans = self.spec.num_channels();
        let mut buf = frame.samples();
        let mut buf_samples = (buf.len() / n_chans) as u32;
        self.capture_ts = frame.capture_timestamp();

        while buf_samples != 0 {
            if !self.packet_open {
                self.begin_packet();
            }

            let n_requested = buf_samples.min(self.samples_per_packet - self.packet_pos);
            let n_encoded = self
                .encoder
                .write(&buf[..n_requested as usize * n_chans]);
            debug_assert_eq!(n_encoded as u32, n_requested);

            buf = &buf[n_encoded * n_chans..];
            buf_samples -= n_encoded as u32;

            self.packet_pos += n_encoded as u32;
            if self.capture_ts != 0 {
                self.capture_ts += self.spec.samples_per_chan_to_ns(n_encoded);
            }

            if self.packet_pos == self.samples_per_packet {
                self.end_packet();
            }
        }
    }
}
