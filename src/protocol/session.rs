//! Per-connection engine shared by clients and servers.
//!
//! A session owns the transport, the timers, the rate limiters, the
//! deferral queue and the batch accumulators of one connection. Everything
//! runs on the caller's thread: one inbound message is decoded, gated and
//! dispatched completely before the call returns.
//!
//! ## Wire Format
//! ```text
//! ordinary: [key(1)] [payload]
//! batched:  [key(1)] ([len(varint)] [fragment])*
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::core::value::Value;
use crate::error::{constants, CloseCode, ProtocolError, Result};
use crate::protocol::batcher::{unravel_batch, Batcher};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::ConnectionState;
use crate::protocol::rate_limit::{DeferredQueue, RateLimiter};
use crate::protocol::registry::PacketRegistry;
use crate::transport::{Scheduler, TimerHandle, TimerKind, Transport};
use crate::utils::metrics::global_metrics;

/// Anything a driver can feed inbound events into.
pub trait Endpoint: Send {
    fn on_message(&mut self, bytes: &[u8]);

    fn on_timer(&mut self, kind: TimerKind);

    /// The remote side (or the transport) closed the connection.
    fn on_transport_close(&mut self, code: CloseCode, reason: &str);

    fn state(&self) -> ConnectionState;

    fn send(&mut self, tag: &str, values: &[Value]) -> Result<()>;

    fn close_with(&mut self, code: CloseCode, reason: &str);

    /// Route an error to the connection's error callback.
    fn report(&mut self, err: &ProtocolError);
}

pub(crate) struct Session<T, S> {
    pub(crate) state: ConnectionState,
    transport: T,
    scheduler: S,
    outbound: Arc<PacketRegistry>,
    inbound: Arc<PacketRegistry>,
    send_limiter: RateLimiter,
    recv_limiter: RateLimiter,
    deferred: DeferredQueue,
    batchers: BTreeMap<u8, Batcher>,
    timers: Vec<TimerHandle>,
    pub(crate) dispatcher: Dispatcher,
}

impl<T: Transport, S: Scheduler> Session<T, S> {
    pub(crate) fn new(transport: T, scheduler: S, max_deferred: usize) -> Self {
        global_metrics().connection_established();
        Self {
            state: ConnectionState::Connecting,
            transport,
            scheduler,
            outbound: Arc::new(PacketRegistry::new()),
            inbound: Arc::new(PacketRegistry::new()),
            send_limiter: RateLimiter::unlimited(),
            recv_limiter: RateLimiter::unlimited(),
            deferred: DeferredQueue::new(max_deferred),
            batchers: BTreeMap::new(),
            timers: Vec::new(),
            dispatcher: Dispatcher::new(),
        }
    }

    pub(crate) fn outbound(&self) -> &Arc<PacketRegistry> {
        &self.outbound
    }

    pub(crate) fn inbound(&self) -> &Arc<PacketRegistry> {
        &self.inbound
    }

    /// Install the negotiated registries and arm the recurring timers.
    /// The caller moves the state to `Ready`.
    pub(crate) fn activate(
        &mut self,
        outbound: Arc<PacketRegistry>,
        inbound: Arc<PacketRegistry>,
        rate_window: Option<Duration>,
    ) {
        if let Some(window) = rate_window {
            self.send_limiter = RateLimiter::new(&outbound);
            self.recv_limiter = RateLimiter::new(&inbound);
            let handle = self.scheduler.schedule_repeating(TimerKind::RateReset, window);
            self.timers.push(handle);
        }

        for (key, packet) in outbound.iter() {
            let schema = packet.schema();
            if schema.is_batched() {
                self.batchers
                    .insert(key, Batcher::new(key, schema.max_batch_size()));
                let interval = Duration::from_millis(u64::from(schema.batching_ms()));
                let handle = self
                    .scheduler
                    .schedule_repeating(TimerKind::BatchFlush(key), interval);
                self.timers.push(handle);
            }
        }

        self.outbound = outbound;
        self.inbound = inbound;
    }

    pub(crate) fn schedule_once(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        let handle = self.scheduler.schedule_once(kind, delay);
        self.timers.push(handle);
        handle
    }

    pub(crate) fn cancel_timer(&mut self, handle: TimerHandle) {
        self.scheduler.cancel(handle);
        self.timers.retain(|&h| h != handle);
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Closed => Err(ProtocolError::ConnectionClosed),
            _ => Err(ProtocolError::NotReady),
        }
    }

    /// Encode and send one packet. Arity and type errors surface here,
    /// before anything reaches the transport.
    pub(crate) fn send(&mut self, tag: &str, values: &[Value]) -> Result<()> {
        self.ensure_ready()?;
        let key = self.outbound.get_key(tag)?;
        let packet = Arc::clone(self.outbound.packet_by_key(key)?);
        if !packet.is_enabled() {
            return Err(ProtocolError::PacketDisabled(tag.to_string()));
        }
        let payload = packet.encode(values)?;
        self.send_encoded(key, payload)
    }

    /// Rate-limit gate for an already encoded payload.
    pub(crate) fn send_encoded(&mut self, key: u8, payload: Vec<u8>) -> Result<()> {
        self.ensure_ready()?;
        if self.deferred.is_waiting(key) || !self.send_limiter.hit(key) {
            if self.deferred.push(key, payload).is_err() {
                let tag = self.outbound.get_tag(key)?;
                return Err(ProtocolError::QueueFull(tag.to_string()));
            }
            global_metrics().packet_deferred();
            debug!(key, queued = self.deferred.len(key), "Send deferred by rate limit");
            return Ok(());
        }
        self.emit(key, payload)
    }

    fn emit(&mut self, key: u8, payload: Vec<u8>) -> Result<()> {
        global_metrics().packet_sent();
        if let Some(batcher) = self.batchers.get_mut(&key) {
            if let Some(message) = batcher.batch_packet(&payload)? {
                global_metrics().batch_flushed();
                self.write(message)?;
            }
            return Ok(());
        }
        let mut message = Vec::with_capacity(payload.len() + 1);
        message.push(key);
        message.extend_from_slice(&payload);
        self.write(message)
    }

    pub(crate) fn write(&mut self, message: Vec<u8>) -> Result<()> {
        let len = message.len() as u64;
        self.transport.send(message)?;
        global_metrics().message_sent(len);
        Ok(())
    }

    /// Tag of the packet an inbound message carries.
    pub(crate) fn inbound_tag(&self, bytes: &[u8]) -> Result<&str> {
        let key = bytes
            .first()
            .copied()
            .ok_or(ProtocolError::Decode(constants::ERR_UNEXPECTED_END))?;
        self.inbound.get_tag(key)
    }

    /// Decode, gate and dispatch one ordinary or batched message.
    ///
    /// Every fragment is counted and decoded before any listener runs, so a
    /// bad message dispatches nothing.
    pub(crate) fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        global_metrics().message_received(bytes.len() as u64);
        let (&key, body) = bytes
            .split_first()
            .ok_or(ProtocolError::Decode(constants::ERR_UNEXPECTED_END))?;
        let packet = Arc::clone(self.inbound.packet_by_key(key)?);
        let tag = packet.tag();
        if !packet.is_enabled() {
            return Err(ProtocolError::PacketDisabled(tag.to_string()));
        }

        let schema = packet.schema();
        let fragments = if schema.is_batched() {
            unravel_batch(tag, body, schema.max_batch_size())?
        } else {
            vec![body]
        };

        for _ in &fragments {
            if !self.recv_limiter.hit(key) {
                global_metrics().rate_limit_hit();
                return Err(ProtocolError::RateLimited(tag.to_string()));
            }
        }

        let decoded = fragments
            .iter()
            .map(|fragment| packet.decode(fragment))
            .collect::<Result<Vec<_>>>()?;

        trace!(tag = %tag, count = decoded.len(), "Dispatching packet");
        for values in decoded {
            global_metrics().packet_received();
            let args = schema.into_arguments(values);
            self.dispatcher.dispatch(tag, &args);
        }
        Ok(())
    }

    /// Recurring timers. One-shot expiry is handled by the role.
    pub(crate) fn on_timer(&mut self, kind: TimerKind) {
        if self.state != ConnectionState::Ready {
            return;
        }
        let result = match kind {
            TimerKind::RateReset => self.reset_window(),
            TimerKind::BatchFlush(key) => self.flush_batch(key),
            TimerKind::HandshakeExpiry => Ok(()),
        };
        if let Err(e) = result {
            self.dispatcher.report(&e);
        }
    }

    fn reset_window(&mut self) -> Result<()> {
        self.send_limiter.reset();
        self.recv_limiter.reset();
        let released = self.deferred.drain_admitted(&mut self.send_limiter);
        if !released.is_empty() {
            debug!(count = released.len(), "Releasing deferred sends");
        }
        for (key, payload) in released {
            self.emit(key, payload)?;
        }
        Ok(())
    }

    fn flush_batch(&mut self, key: u8) -> Result<()> {
        let Some(message) = self.batchers.get_mut(&key).and_then(Batcher::flush) else {
            return Ok(());
        };
        global_metrics().batch_flushed();
        self.write(message)
    }

    pub(crate) fn deferred_len(&self, key: u8) -> usize {
        self.deferred.len(key)
    }

    pub(crate) fn batched_len(&self, key: u8) -> usize {
        self.batchers.get(&key).map_or(0, Batcher::len)
    }

    /// Close because of `err`, using its close code.
    pub(crate) fn fail(&mut self, err: ProtocolError) {
        let code = err.close_code();
        if matches!(
            code,
            CloseCode::MalformedPayload
                | CloseCode::RateLimitExceeded
                | CloseCode::HandshakeRequired
                | CloseCode::HandshakeDuplicate
        ) {
            global_metrics().abuse_close();
        }
        warn!(error = %err, code = %code, "Closing connection");
        self.close(code, &err.to_string());
    }

    /// Close from this side: stop timers, drop queues, tell the transport.
    pub(crate) fn close(&mut self, code: CloseCode, reason: &str) {
        if self.teardown() {
            self.transport.close(code, reason);
            self.dispatcher.fire_close(code, reason);
        }
    }

    /// The transport is already gone.
    pub(crate) fn closed_by_peer(&mut self, code: CloseCode, reason: &str) {
        if self.teardown() {
            debug!(code = %code, reason, "Connection closed by peer");
            self.dispatcher.fire_close(code, reason);
        }
    }

    fn teardown(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        for handle in std::mem::take(&mut self.timers) {
            self.scheduler.cancel(handle);
        }
        self.batchers.values_mut().for_each(Batcher::clear);
        self.deferred.clear();
        self.dispatcher.clear();
        global_metrics().connection_closed();
        true
    }
}
