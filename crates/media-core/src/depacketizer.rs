//! Depacketizer: packets to a continuous sample stream.

use std::f64::consts::PI;

use rstream_rtp_core::format::FrameDecoder;
use rstream_rtp_core::packet::PacketReader;
use rstream_rtp_core::{units, Nanoseconds, RtpTimestamp};
use tracing::debug;

use crate::frame::{Frame, FrameFlags, FrameReader};
use crate::sample::SampleSpec;
use crate::Sample;

/// Collected while producing one frame.
#[derive(Default)]
struct FrameInfo {
    /// Samples (all channels) taken from decoded packets.
    n_decoded_samples: usize,
    /// Packets discarded as late during this read.
    n_dropped_packets: u64,
    /// Capture timestamp of the first sample, when known.
    capture_ts: Nanoseconds,
}

/// Reads validated source packets and produces a gapless sample stream.
///
/// Gaps between packets are filled with silence (or an audible beep when
/// enabled); late packets are dropped. Consecutive output frames cover a
/// contiguous range of RTP timestamps modulo `2^32`.
pub struct Depacketizer<R> {
    reader: R,
    decoder: Box<dyn FrameDecoder>,
    spec: SampleSpec,
    beep: bool,

    /// Next RTP sample index to be emitted.
    timestamp: RtpTimestamp,
    first_packet: bool,
    has_packet: bool,

    next_capture_ts: Nanoseconds,
    valid_capture_ts: bool,

    /// Silence emitted before the very first packet.
    zero_samples: u64,
    /// Silence emitted in place of lost audio.
    missing_samples: u64,
    /// Samples decoded from packets.
    packet_samples: u64,
    n_dropped: u64,
}

impl<R: PacketReader> Depacketizer<R> {
    /// Create a depacketizer decoding with `decoder`.
    pub fn new(reader: R, decoder: Box<dyn FrameDecoder>, spec: SampleSpec, beep: bool) -> Self {
        debug!(channels = spec.num_channels(), "depacketizer: initializing");

        Depacketizer {
            reader,
            decoder,
            spec,
            beep,
            timestamp: 0,
            first_packet: true,
            has_packet: false,
            next_capture_ts: 0,
            valid_capture_ts: false,
            zero_samples: 0,
            missing_samples: 0,
            packet_samples: 0,
            n_dropped: 0,
        }
    }

    /// True once the first packet was consumed.
    pub fn is_started(&self) -> bool {
        !self.first_packet
    }

    /// RTP timestamp the next emitted sample will have, or zero before the
    /// stream started. This is the head position of the packet pipeline.
    pub fn next_timestamp(&self) -> RtpTimestamp {
        if self.first_packet {
            0
        } else {
            self.timestamp
        }
    }

    /// Ratio of lost samples to all stream samples seen so far.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.missing_samples + self.packet_samples;
        if total == 0 {
            0.0
        } else {
            self.missing_samples as f64 / total as f64
        }
    }

    fn read_frame_inner(&mut self, frame: &mut Frame<'_>) {
        assert!(
            frame.num_samples() % self.spec.num_channels() == 0,
            "depacketizer: unexpected frame size"
        );

        let mut info = FrameInfo::default();

        let mut pos = 0;
        let end = frame.num_samples();
        while pos < end {
            pos = self.read_samples(frame.samples_mut(), pos, end, &mut info);
        }

        self.set_frame_props(frame, &info);
    }

    fn read_samples(
        &mut self,
        buf: &mut [Sample],
        pos: usize,
        end: usize,
        info: &mut FrameInfo,
    ) -> usize {
        self.update_packet(info);

        if !self.has_packet {
            // No packets at all: the whole remainder is missing.
            let n_samples = end - pos;
            if info.capture_ts == 0 && self.valid_capture_ts {
                info.capture_ts = self.next_capture_ts;
            }
            if self.valid_capture_ts {
                self.next_capture_ts += self
                    .spec
                    .samples_overall_to_ns(n_samples)
                    .unwrap_or_default();
            }
            return self.read_missing_samples(buf, pos, end);
        }

        let mut pos = pos;
        let next_timestamp = self.decoder.position();

        if self.timestamp != next_timestamp {
            debug_assert!(units::timestamp_lt(self.timestamp, next_timestamp));

            let mis_samples = self.spec.num_channels()
                * units::timestamp_diff(next_timestamp, self.timestamp) as usize;
            let n_samples = mis_samples.min(end - pos);

            pos = self.read_missing_samples(buf, pos, pos + n_samples);

            if info.capture_ts == 0 && self.valid_capture_ts {
                info.capture_ts = self.next_capture_ts
                    - self
                        .spec
                        .samples_overall_to_ns(mis_samples)
                        .unwrap_or_default();
            }
        }

        if pos < end {
            let new_pos = self.read_packet_samples(buf, pos, end);
            let n_samples = new_pos - pos;

            info.n_decoded_samples += n_samples;
            if n_samples != 0 && info.capture_ts == 0 && self.valid_capture_ts {
                info.capture_ts = self.next_capture_ts;
            }
            if self.valid_capture_ts {
                self.next_capture_ts += self
                    .spec
                    .samples_overall_to_ns(n_samples)
                    .unwrap_or_default();
            }

            pos = new_pos;
        }

        pos
    }

    fn read_packet_samples(&mut self, buf: &mut [Sample], pos: usize, end: usize) -> usize {
        let requested = (end - pos) / self.spec.num_channels();
        let decoded = self.decoder.read(&mut buf[pos..end]);

        self.timestamp = self.timestamp.wrapping_add(decoded as u32);
        self.packet_samples += decoded as u64;

        if decoded < requested {
            self.decoder.end();
            self.has_packet = false;
        }

        pos + decoded * self.spec.num_channels()
    }

    fn read_missing_samples(&mut self, buf: &mut [Sample], pos: usize, end: usize) -> usize {
        let n_per_chan = (end - pos) / self.spec.num_channels();

        if self.beep {
            let rate = self.spec.sample_rate() as f64;
            for (n, sample) in buf[pos..end].iter_mut().enumerate() {
                *sample = (2.0 * PI / rate * 880.0 * n as f64).sin() as Sample;
            }
        } else {
            buf[pos..end].fill(0.0);
        }

        self.timestamp = self.timestamp.wrapping_add(n_per_chan as u32);

        if self.first_packet {
            self.zero_samples += n_per_chan as u64;
        } else {
            self.missing_samples += n_per_chan as u64;
        }

        end
    }

    /// Fetch the next usable packet into the decoder, dropping late ones.
    fn update_packet(&mut self, info: &mut FrameInfo) {
        if self.has_packet {
            return;
        }

        let mut n_dropped = 0u64;
        let mut pkt_capture_ts = 0;

        loop {
            let packet = match self.reader.read_packet() {
                Some(packet) => packet,
                None => break,
            };

            let rtp = packet
                .rtp
                .as_ref()
                .expect("depacketizer: unexpected non-rtp packet");

            self.decoder.begin(rtp.timestamp, rtp.payload.clone());
            pkt_capture_ts = rtp.capture_timestamp;

            let pkt_timestamp = self.decoder.position();

            if self.first_packet {
                debug!(
                    zero_samples = self.zero_samples,
                    "depacketizer: got first packet"
                );
                self.timestamp = pkt_timestamp;
                self.first_packet = false;
                self.has_packet = true;
                break;
            }

            let pkt_end = pkt_timestamp.wrapping_add(self.decoder.available());
            if units::timestamp_lt(self.timestamp, pkt_end) {
                self.has_packet = true;
                break;
            }

            debug!(
                ts = self.timestamp,
                pkt_ts = pkt_timestamp,
                "depacketizer: dropping late packet"
            );
            n_dropped += 1;
            self.decoder.end();
        }

        if n_dropped != 0 {
            info.n_dropped_packets += n_dropped;
            self.n_dropped += n_dropped;
        }

        if !self.has_packet {
            return;
        }

        self.next_capture_ts = pkt_capture_ts;
        if !self.valid_capture_ts && self.next_capture_ts != 0 {
            self.valid_capture_ts = true;
        }

        // The packet may start before the stream position when a late packet
        // still overlaps it; skip the overlap.
        let pkt_timestamp = self.decoder.position();
        if units::timestamp_lt(pkt_timestamp, self.timestamp) {
            let diff = units::timestamp_diff(self.timestamp, pkt_timestamp) as u32;
            if self.valid_capture_ts {
                self.next_capture_ts +=
                    self.spec.samples_per_chan_to_ns(diff as usize);
            }
            let shifted = self.decoder.shift(diff);
            debug_assert!(shifted == diff, "depacketizer: can't shift packet");
        }
    }

    fn set_frame_props(&self, frame: &mut Frame<'_>, info: &FrameInfo) {
        let mut flags = FrameFlags::empty();

        if info.n_decoded_samples != 0 {
            flags |= FrameFlags::NONBLANK;
        }
        if info.n_decoded_samples < frame.num_samples() {
            flags |= FrameFlags::INCOMPLETE;
        }
        if info.n_dropped_packets != 0 {
            flags |= FrameFlags::DROPS;
        }

        frame.set_flags(flags);

        // A first packet in the middle of the frame can push the computed
        // timestamp before the Unix epoch; never emit a negative one.
        if info.capture_ts > 0 {
            frame.set_capture_timestamp(info.capture_ts);
        }
    }
}

impl<R: PacketReader> FrameReader for Depacketizer<R> {
    fn read_frame(&mut self, frame: &mut Frame<'_>) -> bool {
        self.read_frame_inner(frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSet, MASK_STEREO};
    use rstream_rtp_core::format::{Format, PAYLOAD_TYPE_L16_STEREO};
    use rstream_rtp_core::packet::queue::{shared_queue, SharedQueue};
    use rstream_rtp_core::packet::{Packet, PacketFlags, PacketWriter, Rtp};

    const CHANS: usize = 2;

    fn format() -> Format {
        Format {
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            clock_rate: 44100,
            channels: CHANS as u32,
        }
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(44100, ChannelSet::surround(MASK_STEREO).unwrap()).unwrap()
    }

    fn make_packet(seqnum: u16, timestamp: u32, n_samples: usize, value: f32) -> Packet {
        let mut encoder = format().new_encoder();
        encoder.begin(n_samples);
        let samples = vec![value; n_samples * CHANS];
        encoder.write(&samples);
        let payload = encoder.end();

        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            source: 1,
            seqnum,
            timestamp,
            duration: n_samples as u32,
            payload_type: PAYLOAD_TYPE_L16_STEREO,
            payload,
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP | PacketFlags::AUDIO);
        packet
    }

    fn depacketizer(queue: &SharedQueue) -> Depacketizer<SharedQueue> {
        Depacketizer::new(queue.clone(), format().new_decoder(), spec(), false)
    }

    fn read(d: &mut Depacketizer<SharedQueue>, n_samples: usize) -> (Vec<f32>, FrameFlags) {
        let mut buf = vec![0.0f32; n_samples * CHANS];
        let mut frame = Frame::new(&mut buf);
        assert!(d.read_frame(&mut frame));
        let flags = frame.flags();
        (buf, flags)
    }

    #[test]
    fn test_contiguous_stream() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        queue.clone().write_packet(make_packet(0, 1000, 100, 0.5));
        queue.clone().write_packet(make_packet(1, 1100, 100, 0.5));

        let (samples, flags) = read(&mut d, 200);
        assert!(samples.iter().all(|&s| (s - 0.5).abs() < 1e-3));
        assert!(flags.contains(FrameFlags::NONBLANK));
        assert!(!flags.contains(FrameFlags::INCOMPLETE));
        assert_eq!(d.next_timestamp(), 1200);
    }

    #[test]
    fn test_gap_filled_with_silence() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        queue.clone().write_packet(make_packet(0, 1000, 100, 0.5));
        // Packet 1 lost; packet 2 covers 1200..1300.
        queue.clone().write_packet(make_packet(2, 1200, 100, 0.5));

        let (samples, flags) = read(&mut d, 300);
        // First 100 frames decoded, next 100 silent, last 100 decoded.
        assert!(samples[..200].iter().all(|&s| (s - 0.5).abs() < 1e-3));
        assert!(samples[200..400].iter().all(|&s| s == 0.0));
        assert!(samples[400..].iter().all(|&s| (s - 0.5).abs() < 1e-3));

        assert!(flags.contains(FrameFlags::NONBLANK));
        assert!(flags.contains(FrameFlags::INCOMPLETE));
        assert_eq!(d.next_timestamp(), 1300);
    }

    #[test]
    fn test_empty_reader_produces_silence() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        let (samples, flags) = read(&mut d, 50);
        assert!(samples.iter().all(|&s| s == 0.0));
        assert!(!flags.contains(FrameFlags::NONBLANK));
        assert!(flags.contains(FrameFlags::INCOMPLETE));
        assert!(!d.is_started());
    }

    #[test]
    fn test_late_packet_dropped() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        queue.clone().write_packet(make_packet(0, 1000, 100, 0.5));
        let _ = read(&mut d, 400);
        assert_eq!(d.next_timestamp(), 1400);

        // Entirely before the stream position by now.
        queue.clone().write_packet(make_packet(1, 1100, 100, 0.9));
        queue.clone().write_packet(make_packet(5, 1500, 100, 0.7));

        let (samples, flags) = read(&mut d, 300);
        assert!(flags.contains(FrameFlags::DROPS));
        // 100 silent frames, then packet 5.
        assert!(samples[..200].iter().all(|&s| s == 0.0));
        assert!(samples[200..400].iter().all(|&s| (s - 0.7).abs() < 1e-3));
    }

    #[test]
    fn test_overlapping_packet_shifted() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        queue.clone().write_packet(make_packet(0, 1000, 100, 0.5));
        let _ = read(&mut d, 300);
        assert_eq!(d.next_timestamp(), 1300);

        // Covers 1250..1350: overlaps the already-emitted range.
        queue.clone().write_packet(make_packet(3, 1250, 100, 0.7));
        let (samples, _) = read(&mut d, 100);
        // Only the 1300..1350 half is used.
        assert!(samples[..100].iter().all(|&s| (s - 0.7).abs() < 1e-3));
        assert!(samples[100..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_timestamp_continuity_across_wraparound() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        let start = u32::MAX - 49;
        queue.clone().write_packet(make_packet(0, start, 100, 0.5));

        let (_, _) = read(&mut d, 100);
        assert_eq!(d.next_timestamp(), start.wrapping_add(100));

        let (_, _) = read(&mut d, 100);
        assert_eq!(d.next_timestamp(), start.wrapping_add(200));
    }

    #[test]
    fn test_gap_accounting() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        queue.clone().write_packet(make_packet(0, 0, 100, 0.5));
        let _ = read(&mut d, 100);

        queue.clone().write_packet(make_packet(2, 200, 100, 0.5));
        let _ = read(&mut d, 200);

        // 100 of 300 stream samples were missing.
        assert!((d.loss_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_capture_timestamp_propagation() {
        let queue = shared_queue(0);
        let mut d = depacketizer(&queue);

        let base_cts = 1_000_000_000_000;
        let mut packet = make_packet(0, 1000, 100, 0.5);
        packet.rtp.as_mut().unwrap().capture_timestamp = base_cts;
        queue.clone().write_packet(packet);

        let mut buf = vec![0.0f32; 100 * CHANS];
        let mut frame = Frame::new(&mut buf);
        d.read_frame(&mut frame);
        assert_eq!(frame.capture_timestamp(), base_cts);
    }
}
