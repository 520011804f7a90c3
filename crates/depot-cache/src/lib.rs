//! Server-side cache store and the TCP cache endpoints for depot.
//!
//! [`CacheStore`] is the single authoritative fingerprint → value table:
//! bounded total size, least-recently-accessed eviction with a
//! deterministic insertion-order tie-break, pinning for in-flight fetches,
//! and a JSON index plus sharded blob directory so the cache survives
//! restarts.
//!
//! [`serve`] runs the store behind the depot wire protocol (one accept
//! loop, one task per connection, one mutex around the store).
//! [`CacheClient`] is the matching connection-backed client used by build
//! tooling and editors to push and pull artifacts.

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod store;

pub use client::{CacheClient, ClientOptions, StoreStatus};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use server::serve;
pub use store::CacheStore;
