//! Wire format for the depot cache protocol.
//!
//! The payload of every frame on a cache connection is an [`Archive`]: a
//! self-describing, nested key/typed-value structure. New fields can be
//! added to any message without breaking older readers, because readers
//! look fields up by name and ignore keys they do not know.
//!
//! On top of the raw archive this crate defines the cache vocabulary:
//!
//! - [`CacheKey`]: 16-byte content fingerprint (MD5 digest), independent of
//!   any filename.
//! - [`CachedItemValue`]: one build artifact's ordered file set with
//!   per-file checksums.
//! - [`CacheRequest`] / [`CacheResponse`]: GET/PUT/STATUS messages with a
//!   `seq` correlation id so replies can be matched on a connection with
//!   multiple requests in flight.

pub mod archive;
pub mod error;
pub mod item;
pub mod key;
pub mod message;

pub use archive::{Archive, Value};
pub use error::{Error, Result};
pub use item::{CachedItemValue, ItemFile};
pub use key::CacheKey;
pub use message::{CacheRequest, CacheResponse};
