//! In-process transport and a manually advanced scheduler.
//!
//! Both types are cheap handles over shared state: give one clone to a
//! connection and keep another to inspect what it sent or to move time
//! forward. Nothing here spawns threads or touches a clock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{CloseCode, ProtocolError, Result};
use crate::transport::{Scheduler, TimerHandle, TimerKind, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Wire {
    sent: VecDeque<Vec<u8>>,
    closed: Option<(CloseCode, String)>,
}

/// Records every message a connection sends.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    wire: Arc<Mutex<Wire>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far, oldest first.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        lock(&self.wire).sent.drain(..).collect()
    }

    pub fn sent_len(&self) -> usize {
        lock(&self.wire).sent.len()
    }

    /// Code and reason, once the connection closed its side.
    pub fn closed(&self) -> Option<(CloseCode, String)> {
        lock(&self.wire).closed.clone()
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        lock(&self.wire).closed.as_ref().map(|(code, _)| *code)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        let mut wire = lock(&self.wire);
        if wire.closed.is_some() {
            return Err(ProtocolError::ConnectionClosed);
        }
        wire.sent.push_back(bytes);
        Ok(())
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        let mut wire = lock(&self.wire);
        if wire.closed.is_none() {
            wire.closed = Some((code, reason.to_string()));
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: TimerKind,
    due: Duration,
    interval: Option<Duration>,
}

#[derive(Debug, Default)]
struct Clock {
    now: Duration,
    next_handle: u64,
    timers: BTreeMap<TimerHandle, Entry>,
}

/// Scheduler whose time only moves when [`advance`](Self::advance) is called.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<Clock>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed virtual time
    pub fn now(&self) -> Duration {
        lock(&self.clock).now
    }

    /// Timers still scheduled
    pub fn active(&self) -> usize {
        lock(&self.clock).timers.len()
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        lock(&self.clock).timers.values().any(|entry| entry.kind == kind)
    }

    /// Move time forward and return every timer firing in that span, in
    /// firing order. Repeating timers may fire several times.
    pub fn advance(&self, by: Duration) -> Vec<TimerKind> {
        let mut clock = lock(&self.clock);
        let target = clock.now + by;
        let mut fired = Vec::new();
        loop {
            let next = clock
                .timers
                .iter()
                .filter(|(_, entry)| entry.due <= target)
                .min_by_key(|(handle, entry)| (entry.due, **handle))
                .map(|(handle, entry)| (*handle, *entry));
            let Some((handle, entry)) = next else {
                break;
            };
            clock.now = entry.due;
            fired.push(entry.kind);
            match entry.interval {
                Some(interval) => {
                    if let Some(timer) = clock.timers.get_mut(&handle) {
                        timer.due += interval;
                    }
                }
                None => {
                    clock.timers.remove(&handle);
                }
            }
        }
        clock.now = target;
        fired
    }

    fn insert(&mut self, kind: TimerKind, delay: Duration, interval: Option<Duration>) -> TimerHandle {
        let mut clock = lock(&self.clock);
        clock.next_handle += 1;
        let handle = TimerHandle(clock.next_handle);
        let due = clock.now + delay;
        clock.timers.insert(
            handle,
            Entry {
                kind,
                due,
                interval,
            },
        );
        handle
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(&mut self, kind: TimerKind, interval: Duration) -> TimerHandle {
        let interval = interval.max(Duration::from_millis(1));
        self.insert(kind, interval, Some(interval))
    }

    fn schedule_once(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        self.insert(kind, delay, None)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        lock(&self.clock).timers.remove(&handle);
    }
}
