//! Mapping between RTP timestamps and wall-clock capture time.
//!
//! The receiver learns the sender's `(capture time, rtp timestamp)` anchor
//! from RTCP sender reports and projects it onto every packet
//! ([`TimestampInjector`]). The sender records the same anchor from its own
//! outgoing packets so the RTCP session can build sender reports
//! ([`TimestampExtractor`]).

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::packet::{Packet, PacketReader, PacketWriter};
use crate::units;
use crate::{Nanoseconds, RtpTimestamp};

fn rtp_delta_to_ns(delta: i32, clock_rate: u32) -> Nanoseconds {
    (delta as f64 / clock_rate as f64 * crate::SECOND as f64).round() as Nanoseconds
}

fn ns_to_rtp_delta(delta: Nanoseconds, clock_rate: u32) -> i32 {
    (delta as f64 / crate::SECOND as f64 * clock_rate as f64).round() as i32
}

#[derive(Default)]
struct Mapping {
    anchor: Option<(Nanoseconds, RtpTimestamp)>,
    n_drops: u64,
}

/// Shared handle for feeding mapping updates into a [`TimestampInjector`]
/// buried inside a packet chain. The RTCP session holds the handle; the
/// injector holds the other end.
#[derive(Clone, Default)]
pub struct MappingUpdater {
    mapping: Arc<Mutex<Mapping>>,
}

impl MappingUpdater {
    /// Install a new `(capture time, rtp timestamp)` anchor.
    ///
    /// Non-positive capture times are ignored and counted.
    pub fn update_mapping(&self, capture_ts: Nanoseconds, rtp_ts: RtpTimestamp) {
        let mut mapping = self.mapping.lock().unwrap();

        if capture_ts <= 0 {
            trace!("timestamp injector: dropping mapping with non-positive time");
            mapping.n_drops += 1;
            return;
        }

        debug!(capture_ts, rtp_ts, "timestamp injector: received mapping");
        mapping.anchor = Some((capture_ts, rtp_ts));
    }

    /// Number of ignored mapping updates.
    pub fn num_dropped_mappings(&self) -> u64 {
        self.mapping.lock().unwrap().n_drops
    }
}

/// Fills packet capture timestamps from an RTCP-provided mapping.
pub struct TimestampInjector<R> {
    reader: R,
    clock_rate: u32,
    mapping: MappingUpdater,
}

impl<R: PacketReader> TimestampInjector<R> {
    /// Create an injector for a stream with the given clock rate.
    pub fn new(reader: R, clock_rate: u32) -> Self {
        TimestampInjector {
            reader,
            clock_rate,
            mapping: MappingUpdater::default(),
        }
    }

    /// Handle for installing mapping updates from outside the chain.
    pub fn mapping_updater(&self) -> MappingUpdater {
        self.mapping.clone()
    }
}

impl<R: PacketReader> PacketReader for TimestampInjector<R> {
    fn read_packet(&mut self) -> Option<Packet> {
        let mut packet = self.reader.read_packet()?;

        let rtp = packet
            .rtp
            .as_mut()
            .expect("timestamp injector: non-rtp packet in stream");

        assert!(
            rtp.capture_timestamp == 0,
            "timestamp injector: unexpected non-zero capture timestamp in packet"
        );

        if let Some((capture_ts, rtp_ts)) = self.mapping.mapping.lock().unwrap().anchor {
            let delta = units::timestamp_diff(rtp.timestamp, rtp_ts);
            rtp.capture_timestamp = capture_ts + rtp_delta_to_ns(delta, self.clock_rate);
        }

        Some(packet)
    }
}

/// Records the capture-time anchor of an outgoing packet stream.
pub struct TimestampExtractor<W> {
    writer: W,
    clock_rate: u32,
    mapping: Option<(Nanoseconds, RtpTimestamp)>,
}

impl<W: PacketWriter> TimestampExtractor<W> {
    /// Create an extractor for a stream with the given clock rate.
    pub fn new(writer: W, clock_rate: u32) -> Self {
        TimestampExtractor {
            writer,
            clock_rate,
            mapping: None,
        }
    }

    /// True once at least one packet with a capture timestamp passed through.
    pub fn has_mapping(&self) -> bool {
        self.mapping.is_some()
    }

    /// Project the recorded anchor onto an arbitrary wall-clock time,
    /// producing the RTP timestamp that corresponds to it.
    pub fn mapping_at(&self, time: Nanoseconds) -> Option<RtpTimestamp> {
        let (capture_ts, rtp_ts) = self.mapping?;
        let delta = ns_to_rtp_delta(time - capture_ts, self.clock_rate);
        Some(rtp_ts.wrapping_add(delta as u32))
    }
}

impl<W: PacketWriter> PacketWriter for TimestampExtractor<W> {
    fn write_packet(&mut self, packet: Packet) {
        if let Some(rtp) = &packet.rtp {
            if rtp.capture_timestamp > 0 {
                self.mapping = Some((rtp.capture_timestamp, rtp.timestamp));
            }
        }
        self.writer.write_packet(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::queue::{shared_queue, SharedQueue};
    use crate::packet::{PacketFlags, Rtp};

    const RATE: u32 = 44100;

    fn rtp_packet(seqnum: u16, timestamp: u32, cts: i64) -> Packet {
        let mut packet = Packet::new();
        packet.rtp = Some(Rtp {
            seqnum,
            timestamp,
            capture_timestamp: cts,
            ..Default::default()
        });
        packet.add_flags(PacketFlags::RTP);
        packet
    }

    #[test]
    fn test_injects_capture_timestamp() {
        let queue = shared_queue(0);
        let mut injector = TimestampInjector::new(queue.clone(), RATE);
        let updater = injector.mapping_updater();

        queue.clone().write_packet(rtp_packet(0, 1000, 0));
        let packet = injector.read_packet().unwrap();
        assert_eq!(packet.rtp.unwrap().capture_timestamp, 0);

        let base_cts = 1_000_000_000;
        updater.update_mapping(base_cts, 1000);

        // One second of samples later.
        queue.clone().write_packet(rtp_packet(1, 1000 + RATE, 0));
        let packet = injector.read_packet().unwrap();
        assert_eq!(
            packet.rtp.unwrap().capture_timestamp,
            base_cts + crate::SECOND
        );
    }

    #[test]
    fn test_ignores_bad_mapping() {
        let queue: SharedQueue = shared_queue(0);
        let mut injector = TimestampInjector::new(queue.clone(), RATE);
        let updater = injector.mapping_updater();

        updater.update_mapping(0, 100);
        updater.update_mapping(-7, 100);
        assert_eq!(updater.num_dropped_mappings(), 2);

        queue.clone().write_packet(rtp_packet(0, 100, 0));
        let packet = injector.read_packet().unwrap();
        assert_eq!(packet.rtp.unwrap().capture_timestamp, 0);
    }

    #[test]
    fn test_extractor_projects_mapping() {
        let queue = shared_queue(0);
        let mut extractor = TimestampExtractor::new(queue.clone(), RATE);
        assert!(!extractor.has_mapping());
        assert!(extractor.mapping_at(123).is_none());

        let base_cts = 5_000_000_000;
        extractor.write_packet(rtp_packet(0, 7000, base_cts));
        assert!(extractor.has_mapping());

        let rtp_ts = extractor.mapping_at(base_cts + crate::SECOND / 2).unwrap();
        assert_eq!(rtp_ts, 7000 + RATE / 2);
    }
}
