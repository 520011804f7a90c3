//! Transport layer for the depot asset cache.
//!
//! Provides three building blocks for the higher protocol layers:
//!
//! - [`Endpoint`]: an immutable `host:port` address value type used for both
//!   listening sockets and remote peers.
//! - [`framing`]: `[u32 length][payload]` frame I/O over any async stream.
//! - [`Connection`] / [`Listener`]: channel-backed wrappers around one TCP
//!   socket. All socket I/O runs on a spawned task; the owner receives
//!   [`ConnectionEvent`]s over an mpsc receiver and never touches the socket
//!   directly. This keeps I/O callbacks off the caller's thread and makes
//!   teardown quiescent: after [`Connection::disconnect`] returns, no further
//!   events are delivered.
//!
//! This layer performs no retries. Reconnect policy belongs to the callers
//! (the cache client and the pack manager).

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod framing;

pub use connection::{ConnectOptions, Connection, ConnectionEvent, Listener};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use framing::{MAX_FRAME_LEN, read_frame, write_frame};
