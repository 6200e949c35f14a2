//! # Transport Layer
//!
//! Boundaries between the protocol engine and the outside world.
//!
//! The engine never performs I/O itself. It writes whole messages through a
//! [`Transport`], asks a [`Scheduler`] for timers, and is told when bytes
//! arrive or a timer fires. Anything that can move discrete byte messages
//! (a WebSocket, a framed TCP stream, an in-process channel) can carry it.
//!
//! ## Implementations
//! - **Memory**: in-process queues and a manually advanced clock, for
//!   deterministic embedding and tests
//! - **Framed**: tokio driver using length-delimited frames over any
//!   `AsyncRead + AsyncWrite` stream

use std::time::Duration;

use crate::error::{CloseCode, Result};

pub mod framed;
pub mod memory;

/// Message-oriented, bidirectional byte transport owned by one connection.
pub trait Transport: Send {
    /// Write one complete message.
    fn send(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Close the underlying connection with a code and reason.
    fn close(&mut self, code: CloseCode, reason: &str);
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Reset rate-limit counters and drain deferred sends
    RateReset,
    /// Flush the batch accumulator of the packet with this key
    BatchFlush(u8),
    /// Give up on a handshake that has not completed
    HandshakeExpiry,
}

/// Opaque id of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Connection-scoped timer registration.
///
/// When a timer fires the embedder calls `on_timer(kind)` on the
/// connection that scheduled it.
pub trait Scheduler: Send {
    fn schedule_repeating(&mut self, kind: TimerKind, interval: Duration) -> TimerHandle;

    fn schedule_once(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle;

    /// Cancelling an unknown or already fired handle is a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        (**self).send(bytes)
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        (**self).close(code, reason)
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Box<S> {
    fn schedule_repeating(&mut self, kind: TimerKind, interval: Duration) -> TimerHandle {
        (**self).schedule_repeating(kind, interval)
    }

    fn schedule_once(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        (**self).schedule_once(kind, delay)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        (**self).cancel(handle)
    }
}
