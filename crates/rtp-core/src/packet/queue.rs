//! Sorted jitter queue.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{Packet, PacketReader, PacketWriter};

/// Packet queue ordered by stream position.
///
/// Packets may be written in arbitrary arrival order; reading always yields
/// them in modular-ascending order (see [`Packet::compare`]). Duplicates and
/// packets at or before the last popped position are dropped. When a maximum
/// size is configured, overflow evicts the oldest (smallest) packet.
pub struct SortedQueue {
    packets: VecDeque<Packet>,
    last_popped: Option<Packet>,
    latest: Option<Packet>,
    max_size: usize,
    dropped: u64,
}

impl SortedQueue {
    /// Create a queue. `max_size` of zero means unlimited.
    pub fn new(max_size: usize) -> Self {
        SortedQueue {
            packets: VecDeque::new(),
            last_popped: None,
            latest: None,
            max_size,
            dropped: 0,
        }
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True if no packets are queued.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of packets dropped due to duplication, lateness, or overflow.
    pub fn num_dropped(&self) -> u64 {
        self.dropped
    }

    /// The smallest queued packet, without removing it.
    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// The most advanced packet ever written, kept even after it is popped.
    ///
    /// Used by the latency monitor to measure the queue tail position.
    pub fn latest(&self) -> Option<&Packet> {
        self.latest.as_ref()
    }

    /// Iterate queued packets in stream order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Pop the smallest queued packet.
    pub fn pop(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.last_popped = Some(packet.clone());
        Some(packet)
    }

    /// Insert a packet at its ordered position.
    pub fn push(&mut self, packet: Packet) {
        if let Some(last) = &self.last_popped {
            if packet.compare(last) != Ordering::Greater {
                debug!("sorted queue: dropping late packet");
                self.dropped += 1;
                return;
            }
        }

        match &self.latest {
            Some(latest) if latest.compare(&packet) != Ordering::Less => {}
            _ => self.latest = Some(packet.clone()),
        }

        // Arrival order is usually close to stream order, so search for the
        // insertion point from the tail.
        let mut pos = self.packets.len();
        while pos > 0 {
            match self.packets[pos - 1].compare(&packet) {
                Ordering::Less => break,
                Ordering::Equal => {
                    debug!("sorted queue: dropping duplicate packet");
                    self.dropped += 1;
                    return;
                }
                Ordering::Greater => pos -= 1,
            }
        }
        self.packets.insert(pos, packet);

        if self.max_size != 0 && self.packets.len() > self.max_size {
            debug!("sorted queue: overflow, dropping oldest packet");
            self.packets.pop_front();
            self.dropped += 1;
        }
    }
}

impl PacketWriter for SortedQueue {
    fn write_packet(&mut self, packet: Packet) {
        self.push(packet);
    }
}

impl PacketReader for SortedQueue {
    fn read_packet(&mut self) -> Option<Packet> {
        self.pop()
    }
}

/// Shared handle to a sorted queue.
///
/// The receiver pipeline routes packets into a queue from the network side
/// while the frame side drains it; both sides hold this handle.
pub type SharedQueue = Arc<Mutex<SortedQueue>>;

/// Create a shared queue. `max_size` of zero means unlimited.
pub fn shared_queue(max_size: usize) -> SharedQueue {
    Arc::new(Mutex::new(SortedQueue::new(max_size)))
}
