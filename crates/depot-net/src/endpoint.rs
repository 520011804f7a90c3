//! Endpoint address value type

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `host:port` pair identifying a listening socket or a remote peer.
///
/// Immutable once constructed. Distinct connections to the same endpoint
/// share the same `Endpoint` value; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form suitable for `TcpStream::connect` / `TcpListener::bind`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_endpoint(s, "missing `:port` suffix"))?;
        if host.is_empty() {
            return Err(Error::invalid_endpoint(s, "empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::invalid_endpoint(s, format!("invalid port `{port}`")))?;
        Ok(Self::new(host, port))
    }
}
