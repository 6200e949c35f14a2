//! Client side of a connection.
//!
//! `Connecting → AwaitingSchema → Ready → Closed`. The first inbound message
//! is always the server's handshake; the client learns both registries and
//! the rate window from it and never hard-codes packet definitions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::value::Value;
use crate::error::{constants, CloseCode, ProtocolError, Result};
use crate::protocol::handshake::{outdated_reason, parse_handshake, ConnectionState};
use crate::protocol::registry::PacketRegistry;
use crate::protocol::session::{Endpoint, Session};
use crate::transport::{Scheduler, TimerHandle, TimerKind, Transport};
use crate::utils::metrics::global_metrics;

pub struct ClientConnection<T, S> {
    session: Session<T, S>,
    config: ClientConfig,
    expiry: Option<TimerHandle>,
    rate_window: Option<Duration>,
}

impl<T: Transport, S: Scheduler> ClientConnection<T, S> {
    pub fn new(transport: T, scheduler: S, config: ClientConfig) -> Self {
        let session = Session::new(transport, scheduler, config.max_deferred);
        Self {
            session,
            config,
            expiry: None,
            rate_window: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn is_ready(&self) -> bool {
        self.session.state == ConnectionState::Ready
    }

    /// Packets this client may send. Empty before the handshake.
    pub fn client_packets(&self) -> &Arc<PacketRegistry> {
        self.session.outbound()
    }

    /// Packets this client may receive. Empty before the handshake.
    pub fn server_packets(&self) -> &Arc<PacketRegistry> {
        self.session.inbound()
    }

    /// Negotiated rate window; `None` when rate limiting is off or the
    /// handshake has not happened yet.
    pub fn rate_window(&self) -> Option<Duration> {
        self.rate_window
    }

    /// The transport is open; start waiting for the schema.
    pub fn on_open(&mut self) {
        if self.session.state != ConnectionState::Connecting {
            return;
        }
        self.begin_awaiting();
    }

    fn begin_awaiting(&mut self) {
        global_metrics().handshake_attempt();
        self.session.state = ConnectionState::AwaitingSchema;
        self.expiry = Some(
            self.session
                .schedule_once(TimerKind::HandshakeExpiry, self.config.connect_timeout),
        );
        debug!(timeout_ms = self.config.connect_timeout.as_millis() as u64, "Awaiting schema");
    }

    #[instrument(skip_all, fields(len = bytes.len()))]
    fn complete_handshake(&mut self, bytes: &[u8]) {
        if let Some(handle) = self.expiry.take() {
            self.session.cancel_timer(handle);
        }

        let handshake = match parse_handshake(bytes) {
            Ok(handshake) => handshake,
            Err(e) => {
                global_metrics().handshake_failed();
                let reason = match &e {
                    ProtocolError::VersionMismatch { local, remote } => {
                        outdated_reason(*local, *remote, true).to_string()
                    }
                    other => other.to_string(),
                };
                warn!(error = %e, "Handshake rejected");
                self.session.close(e.close_code(), &reason);
                return;
            }
        };

        let window = (handshake.rate_window_secs > 0)
            .then(|| Duration::from_secs(u64::from(handshake.rate_window_secs)));
        self.rate_window = window;
        let inbound = Arc::new(handshake.server);
        self.session
            .activate(Arc::new(handshake.client), Arc::clone(&inbound), window);
        self.session.dispatcher.drain_pending(&inbound);
        self.session.state = ConnectionState::Ready;
        global_metrics().handshake_success();
        info!(
            client_packets = self.session.outbound().len(),
            server_packets = inbound.len(),
            rate_window_secs = handshake.rate_window_secs,
            "Client ready"
        );
        self.session.dispatcher.fire_ready();
    }

    /// Register a listener. Before the handshake the tag cannot be checked
    /// yet, so the listener waits in a queue; unknown tags are reported to
    /// the error callback when the schema arrives.
    pub fn on<F>(&mut self, tag: &str, listener: F) -> Result<()>
    where
        F: FnMut(&[Value]) -> Result<()> + Send + 'static,
    {
        match self.session.state {
            ConnectionState::Ready => {
                let inbound = Arc::clone(self.session.inbound());
                self.session.dispatcher.register(&inbound, tag, listener)
            }
            ConnectionState::Closed => Err(ProtocolError::ConnectionClosed),
            _ => {
                self.session.dispatcher.defer(tag, listener);
                Ok(())
            }
        }
    }

    /// Run `callback` once the connection is ready (immediately if it
    /// already is).
    pub fn on_ready<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_ready() {
            callback();
        } else {
            self.session.dispatcher.on_ready(callback);
        }
    }

    pub fn on_close<F>(&mut self, callback: F)
    where
        F: FnMut(CloseCode, &str) + Send + 'static,
    {
        self.session.dispatcher.on_close(callback);
    }

    pub fn on_error<F>(&mut self, callback: F)
    where
        F: FnMut(&ProtocolError) + Send + 'static,
    {
        self.session.dispatcher.on_error(callback);
    }

    /// Send a packet. Fails with `NotReady` before the handshake.
    pub fn send(&mut self, tag: &str, values: &[Value]) -> Result<()> {
        self.session.send(tag, values)
    }

    /// Payloads of `tag` held back by the rate limiter.
    pub fn deferred_len(&self, tag: &str) -> Result<usize> {
        let key = self.session.outbound().get_key(tag)?;
        Ok(self.session.deferred_len(key))
    }

    /// Payloads of `tag` waiting for the next batch flush.
    pub fn batched_len(&self, tag: &str) -> Result<usize> {
        let key = self.session.outbound().get_key(tag)?;
        Ok(self.session.batched_len(key))
    }

    pub fn close(&mut self) {
        self.session.close(CloseCode::Normal, "");
    }

    pub fn close_with(&mut self, code: CloseCode, reason: &str) {
        self.session.close(code, reason);
    }
}

impl<T: Transport, S: Scheduler> Endpoint for ClientConnection<T, S> {
    fn on_message(&mut self, bytes: &[u8]) {
        match self.session.state {
            ConnectionState::Connecting => {
                // Data before the open notification still means the socket is up
                self.begin_awaiting();
                self.complete_handshake(bytes);
            }
            ConnectionState::AwaitingSchema => self.complete_handshake(bytes),
            ConnectionState::Ready => {
                if let Err(e) = self.session.receive(bytes) {
                    self.session.fail(e);
                }
            }
            ConnectionState::Closed => debug!("Message after close ignored"),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::HandshakeExpiry => {
                self.expiry = None;
                if matches!(
                    self.session.state,
                    ConnectionState::Connecting | ConnectionState::AwaitingSchema
                ) {
                    global_metrics().handshake_failed();
                    self.session
                        .close(CloseCode::HandshakeTimeout, constants::ERR_HANDSHAKE_TIMEOUT);
                }
            }
            other => self.session.on_timer(other),
        }
    }

    fn on_transport_close(&mut self, code: CloseCode, reason: &str) {
        self.session.closed_by_peer(code, reason);
    }

    fn state(&self) -> ConnectionState {
        self.session.state
    }

    fn send(&mut self, tag: &str, values: &[Value]) -> Result<()> {
        self.session.send(tag, values)
    }

    fn close_with(&mut self, code: CloseCode, reason: &str) {
        self.session.close(code, reason);
    }

    fn report(&mut self, err: &ProtocolError) {
        self.session.dispatcher.report(err);
    }
}
