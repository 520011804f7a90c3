//! Cache protocol client
//!
//! Wraps one [`Connection`] and speaks GET/PUT/STATUS over it. Requests
//! carry a per-client monotonically increasing `seq`; replies are matched
//! by that id, so a reply to an abandoned request is simply skipped. The
//! client does not retry; callers decide whether a failed round-trip is
//! worth reconnecting for.

use crate::error::{Error, Result};
use depot_net::{ConnectOptions, Connection, ConnectionEvent, Endpoint};
use depot_wire::{Archive, CacheKey, CacheRequest, CacheResponse, CachedItemValue};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Options for a [`CacheClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect: ConnectOptions,
    /// How long one round-trip may take before it fails.
    pub response_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Server load snapshot from a STATUS round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub entry_count: u64,
    pub total_size: u64,
    pub capacity: u64,
}

/// Connection-backed client for the depot cache protocol.
pub struct CacheClient {
    connection: Connection,
    events: UnboundedReceiver<ConnectionEvent>,
    next_seq: u64,
    response_timeout: Duration,
}

impl CacheClient {
    /// Connect to a cache server and wait for the channel to open.
    pub async fn connect(endpoint: Endpoint, options: ClientOptions) -> Result<Self> {
        let (connection, mut events) = Connection::connect(endpoint, options.connect);
        match events.recv().await {
            Some(ConnectionEvent::Opened) => {}
            Some(ConnectionEvent::Closed { reason }) => {
                return Err(Error::ConnectionClosed { reason });
            }
            _ => return Err(Error::connection_closed("connection task ended")),
        }
        debug!("cache client connected to {}", connection.endpoint());
        Ok(Self {
            connection,
            events,
            next_seq: 0,
            response_timeout: options.response_timeout,
        })
    }

    /// Fetch a value by fingerprint. A miss returns `Ok(None)`.
    pub async fn get(&mut self, key: CacheKey) -> Result<Option<CachedItemValue>> {
        match self.round_trip(CacheRequest::Get { key }).await? {
            CacheResponse::Get { found: true, value } => Ok(value),
            CacheResponse::Get { found: false, .. } => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    /// Store a value under a fingerprint. Returns whether the server
    /// accepted it.
    pub async fn put(&mut self, key: CacheKey, value: CachedItemValue) -> Result<bool> {
        match self.round_trip(CacheRequest::Put { key, value }).await? {
            CacheResponse::Put { accepted } => Ok(accepted),
            other => Err(unexpected(&other)),
        }
    }

    /// Query server entry count, resident size, and capacity.
    pub async fn status(&mut self) -> Result<StoreStatus> {
        match self.round_trip(CacheRequest::Status).await? {
            CacheResponse::Status {
                entry_count,
                total_size,
                capacity,
            } => Ok(StoreStatus {
                entry_count,
                total_size,
                capacity,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Tear down the connection, guaranteeing no further events.
    pub async fn disconnect(mut self) {
        self.connection.disconnect().await;
    }

    async fn round_trip(&mut self, request: CacheRequest) -> Result<CacheResponse> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.connection.send(request.to_archive(seq).encode())?;

        let deadline = self.response_timeout;
        let wait = timeout(deadline, async {
            loop {
                match self.events.recv().await {
                    Some(ConnectionEvent::PacketReceived(frame)) => {
                        let archive = Archive::decode(&frame)?;
                        let (reply_seq, response) = CacheResponse::from_archive(&archive)?;
                        if reply_seq == seq {
                            return Ok(response);
                        }
                        // Reply to a request we no longer wait for.
                        warn!("dropping stale reply seq {reply_seq}, waiting for {seq}");
                    }
                    Some(ConnectionEvent::Closed { reason }) => {
                        return Err(Error::ConnectionClosed { reason });
                    }
                    Some(ConnectionEvent::Opened | ConnectionEvent::PacketDelivered(_)) => {}
                    None => return Err(Error::connection_closed("connection task ended")),
                }
            }
        });

        match wait.await {
            Ok(result) => result,
            Err(_) => Err(Error::ResponseTimeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }
}

fn unexpected(response: &CacheResponse) -> Error {
    Error::connection_closed(format!("response kind does not match request: {response:?}"))
}
