//! Modular arithmetic over wrapping RTP units.
//!
//! Sequence numbers, RTP timestamps, and FEC block numbers are fixed-width
//! counters that wrap around. Ordering and distance between two values are
//! therefore defined modulo the counter width: `a` precedes `b` when the
//! signed distance from `a` to `b` is positive.

use crate::{BlockNum, RtpTimestamp, Seqnum};

/// Signed distance from `prev` to `next` modulo `2^16`.
pub fn seqnum_diff(next: Seqnum, prev: Seqnum) -> i16 {
    next.wrapping_sub(prev) as i16
}

/// True if `a` precedes `b` in modular sequence-number order.
pub fn seqnum_lt(a: Seqnum, b: Seqnum) -> bool {
    seqnum_diff(b, a) > 0
}

/// True if `a` precedes or equals `b` in modular sequence-number order.
pub fn seqnum_le(a: Seqnum, b: Seqnum) -> bool {
    a == b || seqnum_lt(a, b)
}

/// Signed distance from `prev` to `next` modulo `2^32`.
pub fn timestamp_diff(next: RtpTimestamp, prev: RtpTimestamp) -> i32 {
    next.wrapping_sub(prev) as i32
}

/// True if `a` precedes `b` in modular timestamp order.
pub fn timestamp_lt(a: RtpTimestamp, b: RtpTimestamp) -> bool {
    timestamp_diff(b, a) > 0
}

/// True if `a` precedes or equals `b` in modular timestamp order.
pub fn timestamp_le(a: RtpTimestamp, b: RtpTimestamp) -> bool {
    a == b || timestamp_lt(a, b)
}

/// Signed distance from `prev` to `next` modulo `2^16`.
pub fn blknum_diff(next: BlockNum, prev: BlockNum) -> i16 {
    next.wrapping_sub(prev) as i16
}

/// True if `a` precedes `b` in modular block-number order.
pub fn blknum_lt(a: BlockNum, b: BlockNum) -> bool {
    blknum_diff(b, a) > 0
}
