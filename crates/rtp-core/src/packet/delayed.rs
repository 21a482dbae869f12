//! Initial latency gate for a packet stream.

use tracing::debug;

use super::{Packet, PacketReader, SortedQueue};
use crate::units;
use crate::RtpTimestamp;

/// Withholds a packet stream until enough of it is buffered.
///
/// Until the gate opens, packets read from the inner reader are accumulated
/// in a private queue and `read_packet` returns `None`. Once the buffered
/// stream spans at least `delay` timestamp units, packets that fell entirely
/// behind the delay window are discarded, the remainder is released in
/// order, and the reader becomes transparent.
pub struct DelayedReader<R> {
    reader: R,
    queue: SortedQueue,
    delay: RtpTimestamp,
    started: bool,
}

impl<R: PacketReader> DelayedReader<R> {
    /// Create a gate that opens after `delay` timestamp units are buffered.
    pub fn new(reader: R, delay: RtpTimestamp) -> Self {
        DelayedReader {
            reader,
            queue: SortedQueue::new(0),
            delay,
            started: false,
        }
    }

    fn fetch_packets(&mut self) {
        while let Some(packet) = self.reader.read_packet() {
            self.queue.push(packet);
        }
    }

    fn queue_span(&self) -> RtpTimestamp {
        let (first, last) = match (self.queue.peek(), self.queue.latest()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0,
        };
        let span = units::timestamp_diff(last.end(), first.begin());
        if span > 0 {
            span as RtpTimestamp
        } else {
            0
        }
    }

    /// Discard queued packets further than `delay` behind the queue tail.
    ///
    /// The inner reader may have buffered much more than the delay before
    /// the first read (e.g. a receiver that started late); only the last
    /// `delay` worth of the stream is played.
    fn trim_backlog(&mut self) {
        let mut n_trimmed = 0u64;
        while self.queue_span() > self.delay {
            self.queue.pop();
            n_trimmed += 1;
        }

        if n_trimmed != 0 {
            debug!(n_trimmed, "delayed reader: trimmed backlog beyond delay");
        }
    }
}

impl<R: PacketReader> PacketReader for DelayedReader<R> {
    fn read_packet(&mut self) -> Option<Packet> {
        if !self.started {
            self.fetch_packets();

            let span = self.queue_span();
            if span < self.delay {
                return None;
            }

            debug!(
                span,
                delay = self.delay,
                packets = self.queue.len(),
                "delayed reader: opening gate"
            );
            self.trim_backlog();
            self.started = true;
        }

        if let Some(packet) = self.queue.pop() {
            return Some(packet);
        }
        self.reader.read_packet()
    }
}
