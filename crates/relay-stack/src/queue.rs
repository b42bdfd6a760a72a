//! Bounded outbound packet queue.
//!
//! FIFO buffer between the stack and the host's write loop. Enqueue past
//! capacity fails immediately (backpressure); retrieval is peek-then-pop
//! so an undersized caller buffer never loses the head packet.

use crate::packet::Packet;
use parking_lot::Mutex;
use relay_common::{RelayError, RelayResult, Timestamp};
use std::collections::VecDeque;

/// One queued packet plus its enqueue timestamp.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// The packet awaiting delivery to the host.
    pub packet: Packet,
    /// When it was enqueued.
    pub enqueued_at: Timestamp,
}

/// Fixed-capacity FIFO of outbound packets.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<QueuedPacket>>,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Enqueue a packet. Fails with [`RelayError::QueueFull`] at capacity
    /// without growing the queue.
    pub fn push(&self, packet: Packet, now: Timestamp) -> RelayResult<()> {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return Err(RelayError::QueueFull);
        }
        q.push_back(QueuedPacket {
            packet,
            enqueued_at: now,
        });
        Ok(())
    }

    /// Copy the head packet into `buf` and dequeue it.
    ///
    /// - `Ok(None)`: queue empty ("no data", not an error).
    /// - `Err(BufferTooSmall)`: `buf` cannot hold the head packet; the
    ///   packet stays queued and the same bytes are retrievable on retry.
    /// - `Ok(Some(n))`: `n` bytes written, packet dequeued. At-most-once
    ///   delivery.
    pub fn copy_head_into(&self, buf: &mut [u8]) -> RelayResult<Option<usize>> {
        let mut q = self.inner.lock();
        let head_len = match q.front() {
            Some(entry) => entry.packet.len(),
            None => return Ok(None),
        };
        if head_len > buf.len() {
            return Err(RelayError::BufferTooSmall {
                needed: head_len,
                provided: buf.len(),
            });
        }
        // Head is guaranteed present and sized; pop and copy.
        if let Some(entry) = q.pop_front() {
            buf[..head_len].copy_from_slice(entry.packet.as_bytes());
        }
        Ok(Some(head_len))
    }

    /// Drop packets enqueued longer than `horizon_ns` ago, returning them
    /// for auditing.
    pub fn drop_older_than(&self, horizon_ns: u64, now: Timestamp) -> Vec<QueuedPacket> {
        let mut q = self.inner.lock();
        let mut dropped = Vec::new();
        while let Some(front) = q.front() {
            if front.enqueued_at.nanos_until(now) > horizon_ns {
                if let Some(entry) = q.pop_front() {
                    dropped.push(entry);
                }
            } else {
                // FIFO order means the rest is younger.
                break;
            }
        }
        dropped
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard everything. Used on shutdown/re-init.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
