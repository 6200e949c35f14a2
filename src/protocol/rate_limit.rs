//! Per-connection, per-packet rate limiting.
//!
//! Every packet with a non-zero `rate_limit` gets a counter that is reset at
//! each window boundary. Receivers close the connection on the first packet
//! over the cap; senders park the payload in a [`DeferredQueue`] and retry
//! after the next reset.

use std::collections::{BTreeMap, VecDeque};

use crate::protocol::registry::PacketRegistry;

/// Counters indexed by packet key.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    caps: Vec<u32>,
    counts: Vec<u32>,
}

impl RateLimiter {
    /// Caps taken from each packet's schema.
    pub fn new(registry: &PacketRegistry) -> Self {
        let caps: Vec<u32> = registry
            .iter()
            .map(|(_, packet)| packet.schema().rate_limit())
            .collect();
        let counts = vec![0; caps.len()];
        Self { caps, counts }
    }

    /// A limiter that never limits (rate window 0).
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn cap(&self, key: u8) -> u32 {
        index(key)
            .and_then(|i| self.caps.get(i))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_limited(&self, key: u8) -> bool {
        self.cap(key) > 0
    }

    /// Count one packet. `false` once the count exceeds the cap.
    pub fn hit(&mut self, key: u8) -> bool {
        let Some(i) = index(key).filter(|&i| i < self.caps.len()) else {
            return true;
        };
        let cap = self.caps[i];
        if cap == 0 {
            return true;
        }
        self.counts[i] = self.counts[i].saturating_add(1);
        self.counts[i] <= cap
    }

    /// Packets still allowed for `key` in the current window.
    pub fn remaining(&self, key: u8) -> Option<u32> {
        let i = index(key).filter(|&i| i < self.caps.len())?;
        let cap = self.caps[i];
        (cap > 0).then(|| cap.saturating_sub(self.counts[i]))
    }

    pub fn count(&self, key: u8) -> u32 {
        index(key)
            .and_then(|i| self.counts.get(i))
            .copied()
            .unwrap_or(0)
    }

    /// Window boundary: every counter back to zero.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|count| *count = 0);
    }
}

fn index(key: u8) -> Option<usize> {
    (key as usize).checked_sub(1)
}

/// Encoded payloads held back by the send-side limiter, FIFO per key.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    queues: BTreeMap<u8, VecDeque<Vec<u8>>>,
    max_per_key: usize,
}

impl DeferredQueue {
    /// `max_per_key == 0` means unbounded.
    pub fn new(max_per_key: usize) -> Self {
        Self {
            queues: BTreeMap::new(),
            max_per_key,
        }
    }

    /// Whether `key` has payloads waiting; later sends must queue behind them.
    pub fn is_waiting(&self, key: u8) -> bool {
        self.queues.get(&key).is_some_and(|queue| !queue.is_empty())
    }

    /// Queue a payload. Returns it back when the queue is full.
    pub fn push(&mut self, key: u8, payload: Vec<u8>) -> Result<(), Vec<u8>> {
        let queue = self.queues.entry(key).or_default();
        if self.max_per_key > 0 && queue.len() >= self.max_per_key {
            return Err(payload);
        }
        queue.push_back(payload);
        Ok(())
    }

    pub fn len(&self, key: u8) -> usize {
        self.queues.get(&key).map_or(0, VecDeque::len)
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Pop, in submission order and key order, every payload the limiter
    /// admits after a reset. The rest stays queued.
    pub fn drain_admitted(&mut self, limiter: &mut RateLimiter) -> Vec<(u8, Vec<u8>)> {
        let mut released = Vec::new();
        for (&key, queue) in self.queues.iter_mut() {
            while !queue.is_empty() {
                if limiter.remaining(key).is_some_and(|left| left == 0) {
                    break;
                }
                limiter.hit(key);
                if let Some(payload) = queue.pop_front() {
                    released.push((key, payload));
                }
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        released
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
