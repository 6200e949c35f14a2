//! Tokio driver for byte-stream transports.
//!
//! Runs one connection on a task: frames arrive through a
//! [`LengthDelimitedCodec`], timers are tokio tasks that post their
//! [`TimerKind`] back to the connection, and application code talks to the
//! connection through a [`ConnectionHandle`].
//!
//! ## Frame Format
//! ```text
//! [len(u32 BE)] [message]
//! ```
//! A message whose first byte is `0x00` (never a packet key) is a close
//! notice: `[0x00] [code(u16 BE)] [reason UTF-8]`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::value::Value;
use crate::error::{constants, CloseCode, ProtocolError, Result};
use crate::protocol::client::ClientConnection;
use crate::protocol::definition::ProtocolDefinition;
use crate::protocol::handshake::ConnectionState;
use crate::protocol::server::ServerConnection;
use crate::protocol::session::Endpoint;
use crate::transport::{Scheduler, TimerHandle, TimerKind, Transport};

/// Largest frame accepted from the wire
pub const MAX_FRAME_LEN: usize = 1 << 20;

const CLOSE_MARKER: u8 = 0x00;

/// Client connection driven by [`drive`]
pub type FramedClient = ClientConnection<ChannelTransport, TokioScheduler>;

/// Server connection driven by [`drive`]
pub type FramedServer = ServerConnection<ChannelTransport, TokioScheduler>;

#[derive(Debug)]
enum Outgoing {
    Frame(Bytes),
    Close(CloseCode, String),
}

/// Transport that queues frames for the driver task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outgoing::Frame(Bytes::from(bytes)))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        let _ = self.tx.send(Outgoing::Close(code, reason.to_string()));
    }
}

/// Scheduler backed by tokio timer tasks.
#[derive(Debug)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerKind>,
    tasks: HashMap<TimerHandle, JoinHandle<()>>,
    next_handle: u64,
}

impl TokioScheduler {
    fn spawn<F>(&mut self, task: F) -> TimerHandle
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|_, join| !join.is_finished());
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.tasks.insert(handle, tokio::spawn(task));
        handle
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&mut self, kind: TimerKind, interval: Duration) -> TimerHandle {
        let tx = self.tx.clone();
        let period = interval.max(Duration::from_millis(1));
        self.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if tx.send(kind).is_err() {
                    break;
                }
            }
        })
    }

    fn schedule_once(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        let tx = self.tx.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(kind);
        })
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Requests from application code to a driven connection.
#[derive(Debug)]
enum Command {
    Send {
        tag: String,
        values: Vec<Value>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Close(CloseCode, String),
}

/// Cloneable handle for talking to a connection owned by a driver task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    /// Send and wait for the connection to accept or reject the packet.
    pub async fn send(&self, tag: &str, values: Vec<Value>) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.tx
            .send(Command::Send {
                tag: tag.to_string(),
                values,
                reply: Some(reply),
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        result.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Fire-and-forget send, usable from inside listeners. Failures go to
    /// the connection's error callback.
    pub fn post(&self, tag: &str, values: Vec<Value>) -> Result<()> {
        self.tx
            .send(Command::Send {
                tag: tag.to_string(),
                values,
                reply: None,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn close(&self, code: CloseCode, reason: &str) {
        let _ = self.tx.send(Command::Close(code, reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving ends a driver needs, created alongside the transport and
/// scheduler by [`channels`].
pub struct DriverChannels {
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    timers: UnboundedReceiverStream<TimerKind>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// A transport, scheduler and handle wired to one [`DriverChannels`].
pub fn channels() -> (ChannelTransport, TokioScheduler, ConnectionHandle, DriverChannels) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    (
        ChannelTransport { tx: out_tx },
        TokioScheduler {
            tx: timer_tx,
            tasks: HashMap::new(),
            next_handle: 0,
        },
        ConnectionHandle { tx: cmd_tx },
        DriverChannels {
            outgoing: out_rx,
            timers: UnboundedReceiverStream::new(timer_rx),
            commands: cmd_rx,
        },
    )
}

fn close_frame(code: CloseCode, reason: &str) -> Bytes {
    let mut frame = BytesMut::with_capacity(3 + reason.len());
    frame.put_u8(CLOSE_MARKER);
    frame.put_u16(code.as_u16());
    frame.put_slice(reason.as_bytes());
    frame.freeze()
}

fn parse_close(frame: &[u8]) -> (CloseCode, String) {
    let code = frame
        .get(1..3)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .and_then(CloseCode::from_u16)
        .unwrap_or(CloseCode::Normal);
    let reason = frame
        .get(3..)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    (code, reason)
}

/// Run `endpoint` over `io` until either side closes. Returns the close code.
pub async fn drive<IO, E>(io: IO, endpoint: &mut E, channels: DriverChannels) -> Result<CloseCode>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    E: Endpoint,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    let mut framed = Framed::new(io, codec);
    let DriverChannels {
        mut outgoing,
        mut timers,
        mut commands,
    } = channels;

    loop {
        // Flush whatever the last event produced before waiting again
        let mut wrote = false;
        while let Ok(out) = outgoing.try_recv() {
            match out {
                Outgoing::Frame(frame) => {
                    framed.feed(frame).await?;
                    wrote = true;
                }
                Outgoing::Close(code, reason) => {
                    framed.feed(close_frame(code, &reason)).await?;
                    SinkExt::<Bytes>::close(&mut framed).await?;
                    debug!(code = %code, reason = %reason, "Connection closed locally");
                    return Ok(code);
                }
            }
        }
        if wrote {
            SinkExt::<Bytes>::flush(&mut framed).await?;
        }
        if endpoint.state() == ConnectionState::Closed {
            return Ok(CloseCode::Normal);
        }

        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(frame)) if frame.first() == Some(&CLOSE_MARKER) => {
                    let (code, reason) = parse_close(&frame);
                    endpoint.on_transport_close(code, &reason);
                    return Ok(code);
                }
                Some(Ok(frame)) => endpoint.on_message(&frame),
                Some(Err(e)) => {
                    endpoint.on_transport_close(CloseCode::Normal, &e.to_string());
                    return Err(e.into());
                }
                None => {
                    endpoint.on_transport_close(CloseCode::Normal, constants::ERR_CONNECTION_CLOSED);
                    return Ok(CloseCode::Normal);
                }
            },
            Some(kind) = timers.next() => endpoint.on_timer(kind),
            Some(command) = commands.recv() => match command {
                Command::Send { tag, values, reply } => {
                    let result = endpoint.send(&tag, &values);
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                endpoint.report(&e);
                            }
                        }
                    }
                }
                Command::Close(code, reason) => endpoint.close_with(code, &reason),
            },
        }
    }
}

/// Start a client over an established stream. `setup` registers listeners
/// and callbacks before the handshake arrives.
pub fn spawn_client<IO, F>(
    io: IO,
    config: ClientConfig,
    setup: F,
) -> Result<(ConnectionHandle, JoinHandle<Result<CloseCode>>)>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(&mut FramedClient, ConnectionHandle) -> Result<()>,
{
    let (transport, scheduler, handle, channels) = channels();
    let mut client = ClientConnection::new(transport, scheduler, config);
    setup(&mut client, handle.clone())?;
    let task = tokio::spawn(async move {
        client.on_open();
        drive(io, &mut client, channels).await
    });
    Ok((handle, task))
}

/// Connect over TCP and start a client.
#[instrument(skip_all)]
pub async fn connect<A, F>(
    addr: A,
    config: ClientConfig,
    setup: F,
) -> Result<(ConnectionHandle, JoinHandle<Result<CloseCode>>)>
where
    A: ToSocketAddrs,
    F: FnOnce(&mut FramedClient, ConnectionHandle) -> Result<()>,
{
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::TransportError("connect timed out".to_string()))??;
    stream.set_nodelay(true)?;
    spawn_client(stream, config, setup)
}

/// Accept one connection over `io` and serve it to completion.
pub async fn serve_connection<IO, F>(
    io: IO,
    definition: Arc<ProtocolDefinition>,
    setup: F,
) -> Result<CloseCode>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&mut FramedServer, ConnectionHandle) -> Result<()>,
{
    let (transport, scheduler, handle, channels) = channels();
    let mut connection = ServerConnection::accept(definition, transport, scheduler)?;
    setup(&mut connection, handle)?;
    drive(io, &mut connection, channels).await
}

/// TCP accept loop with graceful shutdown. Each connection runs on its own
/// task; `setup` is called once per connection. Connections still open at
/// shutdown are aborted, so none outlives the server.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve<F>(
    listener: TcpListener,
    definition: Arc<ProtocolDefinition>,
    setup: F,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()>
where
    F: Fn(&mut FramedServer, ConnectionHandle) -> Result<()> + Send + Sync + 'static,
{
    let setup = Arc::new(setup);
    let mut connections = JoinSet::new();
    let limit = definition.config().max_connections;
    info!("Listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(active = connections.len(), "Shutting down server");
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                return Ok(());
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                if connections.len() >= limit {
                    warn!(peer = %peer, limit, "Connection limit reached, rejecting");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let definition = Arc::clone(&definition);
                let setup = Arc::clone(&setup);
                connections.spawn(async move {
                    debug!(peer = %peer, "Serving connection");
                    match serve_connection(stream, definition, |c, h| (*setup)(c, h)).await {
                        Ok(code) => debug!(peer = %peer, code = %code, "Connection finished"),
                        Err(e) => warn!(peer = %peer, error = %e, "Connection failed"),
                    }
                });
            }
        }
    }
}
