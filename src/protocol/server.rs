//! Server side: one [`ServerConnection`] per accepted client, and a
//! [`ServerHub`] that owns many of them and broadcasts.
//!
//! A server connection sends the handshake on accept and is `Ready` at
//! once. If the definition names a handshake packet, the client's first
//! packet must be that one, it may arrive only once, and it must arrive
//! before `handshake_timeout`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::core::value::Value;
use crate::error::{constants, CloseCode, ProtocolError, Result};
use crate::protocol::definition::ProtocolDefinition;
use crate::protocol::handshake::ConnectionState;
use crate::protocol::session::{Endpoint, Session};
use crate::transport::{Scheduler, TimerHandle, TimerKind, Transport};
use crate::utils::metrics::global_metrics;

pub struct ServerConnection<T, S> {
    session: Session<T, S>,
    definition: Arc<ProtocolDefinition>,
    handshake_received: bool,
    expiry: Option<TimerHandle>,
}

impl<T: Transport, S: Scheduler> ServerConnection<T, S> {
    /// Send the handshake and start serving.
    #[instrument(skip_all)]
    pub fn accept(definition: Arc<ProtocolDefinition>, transport: T, scheduler: S) -> Result<Self> {
        let mut session = Session::new(transport, scheduler, 0);
        global_metrics().handshake_attempt();
        if let Err(e) = session.write(definition.handshake_message().to_vec()) {
            global_metrics().handshake_failed();
            session.close(CloseCode::Normal, &e.to_string());
            return Err(e);
        }

        session.activate(
            Arc::clone(definition.server_packets()),
            Arc::clone(definition.client_packets()),
            definition.rate_window(),
        );
        session.state = ConnectionState::Ready;

        let expiry = definition
            .handshake_packet()
            .map(|_| session.schedule_once(TimerKind::HandshakeExpiry, definition.handshake_timeout()));
        if expiry.is_none() {
            global_metrics().handshake_success();
        }
        debug!(requires_handshake_packet = expiry.is_some(), "Connection accepted");

        Ok(Self {
            session,
            definition,
            handshake_received: false,
            expiry,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn is_ready(&self) -> bool {
        self.session.state == ConnectionState::Ready
    }

    pub fn definition(&self) -> &Arc<ProtocolDefinition> {
        &self.definition
    }

    /// Whether the required handshake packet has arrived (always true when
    /// none is configured).
    pub fn handshake_received(&self) -> bool {
        self.handshake_received || self.definition.handshake_packet().is_none()
    }

    /// Register a listener for a client packet.
    pub fn on<F>(&mut self, tag: &str, listener: F) -> Result<()>
    where
        F: FnMut(&[Value]) -> Result<()> + Send + 'static,
    {
        if self.session.state == ConnectionState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        let inbound = Arc::clone(self.definition.client_packets());
        self.session.dispatcher.register(&inbound, tag, listener)
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

    pub fn send(&mut self, tag: &str, values: &[Value]) -> Result<()> {
        self.session.send(tag, values)
    }

    pub(crate) fn send_encoded(&mut self, key: u8, payload: Vec<u8>) -> Result<()> {
        self.session.send_encoded(key, payload)
    }

    pub(crate) fn report(&mut self, err: &ProtocolError) {
        self.session.dispatcher.report(err);
    }

    pub fn deferred_len(&self, tag: &str) -> Result<usize> {
        let key = self.definition.server_packets().get_key(tag)?;
        Ok(self.session.deferred_len(key))
    }

    pub fn batched_len(&self, tag: &str) -> Result<usize> {
        let key = self.definition.server_packets().get_key(tag)?;
        Ok(self.session.batched_len(key))
    }

    pub fn close(&mut self) {
        self.session.close(CloseCode::Normal, "");
    }

    pub fn close_with(&mut self, code: CloseCode, reason: &str) {
        self.session.close(code, reason);
    }

    /// Enforce the mandatory-first packet rule.
    fn check_handshake_packet(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(required) = self.definition.handshake_packet() else {
            return Ok(());
        };
        let is_required = self.session.inbound_tag(bytes)? == required;
        match (self.handshake_received, is_required) {
            (false, true) => {
                self.handshake_received = true;
                if let Some(handle) = self.expiry.take() {
                    self.session.cancel_timer(handle);
                }
                global_metrics().handshake_success();
                Ok(())
            }
            (false, false) => {
                global_metrics().handshake_failed();
                Err(ProtocolError::HandshakeRequired)
            }
            (true, true) => Err(ProtocolError::HandshakeDuplicate),
            (true, false) => Ok(()),
        }
    }
}

impl<T: Transport, S: Scheduler> Endpoint for ServerConnection<T, S> {
    fn on_message(&mut self, bytes: &[u8]) {
        if self.session.state != ConnectionState::Ready {
            debug!(state = %self.session.state, "Message ignored");
            return;
        }
        let result = self
            .check_handshake_packet(bytes)
            .and_then(|()| self.session.receive(bytes));
        if let Err(e) = result {
            self.session.fail(e);
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::HandshakeExpiry => {
                self.expiry = None;
                if !self.handshake_received && self.session.state == ConnectionState::Ready {
                    global_metrics().handshake_failed();
                    warn!("Handshake packet not received in time");
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

/// Identifies one connection inside a [`ServerHub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Owns every server connection of one protocol definition.
pub struct ServerHub<T, S> {
    definition: Arc<ProtocolDefinition>,
    connections: BTreeMap<ConnectionId, ServerConnection<T, S>>,
    next_id: u64,
}

impl<T: Transport, S: Scheduler> ServerHub<T, S> {
    pub fn new(definition: Arc<ProtocolDefinition>) -> Self {
        Self {
            definition,
            connections: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn definition(&self) -> &Arc<ProtocolDefinition> {
        &self.definition
    }

    /// Accept a new connection, subject to `max_connections` (closed
    /// connections still count until pruned).
    pub fn accept(&mut self, transport: T, scheduler: S) -> Result<ConnectionId> {
        let limit = self.definition.config().max_connections;
        if self.connections.len() >= limit {
            warn!(limit, "Connection limit reached");
            return Err(ProtocolError::ConnectionLimit(limit));
        }
        let connection = ServerConnection::accept(Arc::clone(&self.definition), transport, scheduler)?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(id, connection);
        info!(connection = %id, active = self.connections.len(), "Client connected");
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ServerConnection<T, S>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ServerConnection<T, S>> {
        self.connections.get_mut(&id)
    }

    pub fn on_message(&mut self, id: ConnectionId, bytes: &[u8]) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.on_message(bytes);
        }
    }

    pub fn on_timer(&mut self, id: ConnectionId, kind: TimerKind) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.on_timer(kind);
        }
    }

    pub fn on_transport_close(&mut self, id: ConnectionId, code: CloseCode, reason: &str) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.on_transport_close(code, reason);
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ServerConnection<T, S>> {
        self.connections.remove(&id)
    }

    /// Drop closed connections. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, connection| connection.state() != ConnectionState::Closed);
        before - self.connections.len()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    /// Send to every ready connection. Returns how many accepted it.
    pub fn broadcast(&mut self, tag: &str, values: &[Value]) -> Result<usize> {
        self.broadcast_filtered(tag, |_, _| true, values)
    }

    /// Send to every ready connection `predicate` selects.
    ///
    /// The payload is encoded once, so schema errors are returned before
    /// any connection is touched. Per-connection failures (queue full, dead
    /// transport) go to that connection's error callback.
    pub fn broadcast_filtered<P>(&mut self, tag: &str, mut predicate: P, values: &[Value]) -> Result<usize>
    where
        P: FnMut(ConnectionId, &ServerConnection<T, S>) -> bool,
    {
        let registry = self.definition.server_packets();
        let key = registry.get_key(tag)?;
        let packet = registry.packet_by_key(key)?;
        if !packet.is_enabled() {
            return Err(ProtocolError::PacketDisabled(tag.to_string()));
        }
        let payload = packet.encode(values)?;

        let mut delivered = 0;
        for (&id, connection) in self.connections.iter_mut() {
            if !connection.is_ready() || !predicate(id, connection) {
                continue;
            }
            match connection.send_encoded(key, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection = %id, error = %e, "Broadcast send failed");
                    connection.report(&e);
                }
            }
        }
        debug!(tag, delivered, "Broadcast");
        Ok(delivered)
    }
}
