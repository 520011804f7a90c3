//! Channel-backed TCP connection handles
//!
//! A [`Connection`] never exposes its socket. The socket lives inside a
//! spawned I/O task; the handle talks to it through an mpsc command channel
//! and observes it through an mpsc [`ConnectionEvent`] receiver. Higher
//! layers (the pack manager, the cache client) drain that receiver from
//! their own polling context, so socket callbacks can never mutate their
//! state from the I/O task.
//!
//! Lifecycle rules:
//!
//! - Handles are created only through [`Connection::connect`] (active,
//!   client role) or [`Listener::accept`] (passive, server role).
//! - A failed or timed-out connect surfaces as a [`ConnectionEvent::Closed`]
//!   carrying the error message; the handle itself is always returned.
//! - [`Connection::reconnect`] tears down the current I/O task and spawns a
//!   fresh one over a new socket. A half-closed channel is never reused.
//! - [`Connection::disconnect`] awaits the I/O task's completion, so no
//!   event is produced after it returns.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::framing::{read_frame, write_frame};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Options for establishing an outbound connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// How long to wait for the TCP connect before reporting
    /// [`ConnectionEvent::Closed`].
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Events delivered by a connection's I/O task.
///
/// Events arrive in channel order; within one connection, received packets
/// preserve TCP send order. After a `Closed` event the task has terminated
/// and no further events follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The channel is open; sends will be written to the socket.
    Opened,
    /// One complete frame payload arrived from the peer.
    PacketReceived(Bytes),
    /// The packet queued with this id has been written and flushed.
    PacketDelivered(u64),
    /// The channel is gone: connect failure, timeout, peer close, or I/O
    /// error. The reason is a human-readable message for logs and pack
    /// error states.
    Closed { reason: String },
}

enum Command {
    Send { id: u64, payload: Bytes },
    Shutdown,
}

/// Handle to one logical TCP channel.
pub struct Connection {
    endpoint: Endpoint,
    cmd_tx: UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
    next_packet_id: u64,
}

impl Connection {
    /// Actively connect to `endpoint`. The returned receiver yields
    /// [`ConnectionEvent::Opened`] once the socket is up, or
    /// [`ConnectionEvent::Closed`] if the connect fails or times out.
    pub fn connect(
        endpoint: Endpoint,
        options: ConnectOptions,
    ) -> (Self, UnboundedReceiver<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            connect_task(task_endpoint, options, cmd_rx, event_tx).await;
        });

        (
            Self {
                endpoint,
                cmd_tx,
                task: Some(task),
                next_packet_id: 0,
            },
            event_rx,
        )
    }

    /// Wrap an already-accepted socket (server role). Emits
    /// [`ConnectionEvent::Opened`] immediately.
    fn from_stream(stream: TcpStream, peer: Endpoint) -> (Self, UnboundedReceiver<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let _ = event_tx.send(ConnectionEvent::Opened);
            channel_loop(stream, cmd_rx, event_tx).await;
        });

        (
            Self {
                endpoint: peer,
                cmd_tx,
                task: Some(task),
                next_packet_id: 0,
            },
            event_rx,
        )
    }

    /// The remote endpoint this handle is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queue one frame for sending. Frames are written FIFO; delivery is
    /// confirmed asynchronously via [`ConnectionEvent::PacketDelivered`]
    /// with the returned id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the I/O task has already terminated.
    pub fn send(&mut self, payload: Bytes) -> Result<u64> {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        self.cmd_tx
            .send(Command::Send { id, payload })
            .map_err(|_| Error::Closed)?;
        Ok(id)
    }

    /// Tear down the channel and wait for the I/O task to finish.
    ///
    /// Blocking by design: once this returns, the event receiver will yield
    /// only events that were queued before teardown, never new ones, so the
    /// owner can be dropped safely.
    pub async fn disconnect(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("connection to {} torn down", self.endpoint);
    }

    /// Abandon the current channel and establish a fresh one to the same
    /// endpoint. The old I/O task is aborted; its socket is never reused.
    pub fn reconnect(&mut self, options: ConnectOptions) -> UnboundedReceiver<ConnectionEvent> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task_endpoint = self.endpoint.clone();
        let task = tokio::spawn(async move {
            connect_task(task_endpoint, options, cmd_rx, event_tx).await;
        });

        self.cmd_tx = cmd_tx;
        self.task = Some(task);
        event_rx
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A handle dropped without disconnect() must not leak its task.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn connect_task(
    endpoint: Endpoint,
    options: ConnectOptions,
    cmd_rx: UnboundedReceiver<Command>,
    event_tx: UnboundedSender<ConnectionEvent>,
) {
    let address = endpoint.address();
    debug!("connecting to {address}");

    let stream = match timeout(options.connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = event_tx.send(ConnectionEvent::Closed {
                reason: format!("connect to {address} failed: {e}"),
            });
            return;
        }
        Err(_) => {
            let _ = event_tx.send(ConnectionEvent::Closed {
                reason: format!(
                    "connect to {address} timed out after {} ms",
                    options.connect_timeout.as_millis()
                ),
            });
            return;
        }
    };

    let _ = event_tx.send(ConnectionEvent::Opened);
    channel_loop(stream, cmd_rx, event_tx).await;
}

async fn channel_loop(
    stream: TcpStream,
    cmd_rx: UnboundedReceiver<Command>,
    event_tx: UnboundedSender<ConnectionEvent>,
) {
    let (reader, writer) = stream.into_split();
    // Reads get their own task: a frame read must never be cancelled
    // halfway through, or the length prefix falls out of sync.
    let closed = Arc::new(AtomicBool::new(false));
    let read_task = tokio::spawn(read_loop(reader, event_tx.clone(), Arc::clone(&closed)));
    write_loop(writer, cmd_rx, event_tx, closed).await;
    read_task.abort();
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    event_tx: UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                trace!("received {} byte frame", payload.len());
                if event_tx.send(ConnectionEvent::PacketReceived(payload)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                close_once(&event_tx, &closed, "closed by remote peer".to_string());
                return;
            }
            Err(e) => {
                close_once(&event_tx, &closed, format!("receive failed: {e}"));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut cmd_rx: UnboundedReceiver<Command>,
    event_tx: UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Send { id, payload } => {
                if let Err(e) = write_frame(&mut writer, &payload).await {
                    close_once(&event_tx, &closed, format!("send failed: {e}"));
                    return;
                }
                let _ = event_tx.send(ConnectionEvent::PacketDelivered(id));
            }
            // Orderly local shutdown emits no Closed event: the owner
            // asked for it and is awaiting the join handle.
            Command::Shutdown => {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

/// At most one `Closed` event per channel, whichever half fails first.
fn close_once(event_tx: &UnboundedSender<ConnectionEvent>, closed: &AtomicBool, reason: String) {
    if !closed.swap(true, Ordering::SeqCst) {
        let _ = event_tx.send(ConnectionEvent::Closed { reason });
    }
}

/// Passive (server role) side of the transport: accepts sockets and wraps
/// each one in a [`Connection`] with its own event receiver.
pub struct Listener {
    inner: tokio::net::TcpListener,
}

impl Listener {
    /// Bind a listening socket on `endpoint`.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(endpoint.address()).await?;
        debug!("listening on {}", endpoint);
        Ok(Self { inner })
    }

    /// The locally bound endpoint, with the OS-assigned port resolved.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        let addr = self.inner.local_addr()?;
        Ok(Endpoint::new(addr.ip().to_string(), addr.port()))
    }

    /// Wait for one inbound connection.
    pub async fn accept(&self) -> Result<(Connection, UnboundedReceiver<ConnectionEvent>)> {
        let (stream, peer) = self.inner.accept().await?;
        let peer = Endpoint::new(peer.ip().to_string(), peer.port());
        debug!("accepted connection from {peer}");
        Ok(Connection::from_stream(stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair() -> (
        Connection,
        UnboundedReceiver<ConnectionEvent>,
        Connection,
        UnboundedReceiver<ConnectionEvent>,
    ) {
        let listener = Listener::bind(&Endpoint::new("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (client, mut client_events) = Connection::connect(endpoint, ConnectOptions::default());
        let (server, server_events) = accept.await.unwrap();

        assert_eq!(client_events.recv().await.unwrap(), ConnectionEvent::Opened);
        (client, client_events, server, server_events)
    }

    #[tokio::test]
    async fn test_send_receive_in_order() {
        let (mut client, mut client_events, _server, mut server_events) = loopback_pair().await;
        assert_eq!(server_events.recv().await.unwrap(), ConnectionEvent::Opened);

        let first = client.send(Bytes::from_static(b"first")).unwrap();
        let second = client.send(Bytes::from_static(b"second")).unwrap();
        assert_eq!(
            client_events.recv().await.unwrap(),
            ConnectionEvent::PacketDelivered(first)
        );
        assert_eq!(
            client_events.recv().await.unwrap(),
            ConnectionEvent::PacketDelivered(second)
        );

        assert_eq!(
            server_events.recv().await.unwrap(),
            ConnectionEvent::PacketReceived(Bytes::from_static(b"first"))
        );
        assert_eq!(
            server_events.recv().await.unwrap(),
            ConnectionEvent::PacketReceived(Bytes::from_static(b"second"))
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_quiescent() {
        let (mut client, _client_events, _server, mut server_events) = loopback_pair().await;
        assert_eq!(server_events.recv().await.unwrap(), ConnectionEvent::Opened);

        client.disconnect().await;

        // The peer observes the close.
        loop {
            match server_events.recv().await {
                Some(ConnectionEvent::Closed { .. }) | None => break,
                Some(_) => {}
            }
        }

        // After disconnect the handle refuses further sends.
        assert!(matches!(
            client.send(Bytes::from_static(b"late")),
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_closed() {
        // Bind then drop to find a port with nothing listening on it.
        let listener = Listener::bind(&Endpoint::new("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        drop(listener);

        let (_conn, mut events) = Connection::connect(endpoint, ConnectOptions::default());
        match events.recv().await.unwrap() {
            ConnectionEvent::Closed { reason } => assert!(!reason.is_empty()),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_uses_fresh_channel() {
        let listener = Listener::bind(&Endpoint::new("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let server = tokio::spawn(async move {
            // Accept twice: original connect, then the reconnect.
            let first = listener.accept().await.unwrap();
            let second = listener.accept().await.unwrap();
            (first, second)
        });

        let (mut client, mut events) = Connection::connect(endpoint, ConnectOptions::default());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Opened);

        let mut events = client.reconnect(ConnectOptions::default());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Opened);

        client.send(Bytes::from_static(b"after reconnect")).unwrap();
        let (_, (_, mut second_events)) = server.await.unwrap();
        assert_eq!(second_events.recv().await.unwrap(), ConnectionEvent::Opened);
        assert_eq!(
            second_events.recv().await.unwrap(),
            ConnectionEvent::PacketReceived(Bytes::from_static(b"after reconnect"))
        );
    }
}
