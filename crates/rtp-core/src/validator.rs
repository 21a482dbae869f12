//! Inter-packet stream validation.

use tracing::debug;

use crate::packet::{Packet, PacketReader, Rtp};
use crate::units;
use crate::Nanoseconds;

/// Validator parameters.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum allowed seqnum distance between consecutive packets.
    pub max_sn_jump: usize,

    /// Maximum allowed timestamp distance between consecutive packets,
    /// nanoseconds.
    pub max_ts_jump: Nanoseconds,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_sn_jump: 100,
            max_ts_jump: crate::SECOND,
        }
    }
}

/// Stateful filter rejecting implausible packets of one session's stream.
///
/// A packet is dropped when, relative to the previous accepted packet, its
/// stream id or payload type changed, its seqnum or timestamp jumped too far
/// (in either direction, modular), its capture timestamp is negative, or its
/// capture timestamp reverted to zero after being established.
///
/// The "previous" slot advances only with packets that are strictly greater
/// in stream order, so replays and reordered duplicates can not move it
/// backwards.
pub struct Validator<R> {
    reader: R,
    config: ValidatorConfig,
    clock_rate: u32,
    prev: Option<Rtp>,
    n_dropped: u64,
}

impl<R: PacketReader> Validator<R> {
    /// Create a validator for a stream with the given clock rate.
    pub fn new(reader: R, config: ValidatorConfig, clock_rate: u32) -> Self {
        Validator {
            reader,
            config,
            clock_rate,
            prev: None,
            n_dropped: 0,
        }
    }

    /// Number of packets rejected so far.
    pub fn num_dropped(&self) -> u64 {
        self.n_dropped
    }

    fn validate(&self, prev: &Rtp, next: &Rtp) -> bool {
        if prev.source != next.source {
            debug!(
                prev = prev.source,
                next = next.source,
                "rtp validator: source id jump"
            );
            return false;
        }

        if prev.payload_type != next.payload_type {
            debug!(
                prev = prev.payload_type,
                next = next.payload_type,
                "rtp validator: payload type jump"
            );
            return false;
        }

        let sn_dist = units::seqnum_diff(next.seqnum, prev.seqnum).unsigned_abs();
        if sn_dist as usize > self.config.max_sn_jump {
            debug!(
                prev = prev.seqnum,
                next = next.seqnum,
                dist = sn_dist,
                "rtp validator: too long seqnum jump"
            );
            return false;
        }

        let ts_dist = units::timestamp_diff(next.timestamp, prev.timestamp).unsigned_abs();
        let ts_dist_ns =
            (ts_dist as f64 / self.clock_rate as f64 * crate::SECOND as f64) as Nanoseconds;
        if ts_dist_ns > self.config.max_ts_jump {
            debug!(
                prev = prev.timestamp,
                next = next.timestamp,
                dist = ts_dist,
                "rtp validator: too long timestamp jump"
            );
            return false;
        }

        if next.capture_timestamp < 0 {
            debug!(
                cts = next.capture_timestamp,
                "rtp validator: negative capture timestamp"
            );
            return false;
        }

        if next.capture_timestamp == 0 && prev.capture_timestamp != 0 {
            debug!("rtp validator: zero capture timestamp after non-zero");
            return false;
        }

        true
    }
}

impl<R: PacketReader> PacketReader for Validator<R> {
    fn read_packet(&mut self) -> Option<Packet> {
        let packet = self.reader.read_packet()?;

        let Some(rtp) = packet.rtp.clone() else {
            debug!("rtp validator: dropping non-rtp packet");
            self.n_dropped += 1;
            return None;
        };

        if let Some(prev) = &self.prev {
            if !self.validate(prev, &rtp) {
                self.n_dropped += 1;
                return None;
            }

            match prev.compare(&rtp) {
                std::cmp::Ordering::Less => self.prev = Some(rtp),
                std::cmp::Ordering::Equal => {
                    // Replay of the previously accepted packet.
                    debug!(seqnum = rtp.seqnum, "rtp validator: dropping replayed packet");
                    self.n_dropped += 1;
                    return None;
                }
                std::cmp::Ordering::Greater => {}
            }
        } else {
            self.prev = Some(rtp);
        }

        Some(packet)
    }
}
