//! Connect handshake messages for the stateful bus transport.
//!
//! The client publishes a JSON [`ConnectRequest`] to the server's connect
//! subject with a fresh inbox as reply subject. The server answers with a
//! [`ConnectReply`] whose payload is three space-separated tokens:
//!
//! ```text
//! <heartbeat listen subject> <heartbeat reply subject> <interval millis>
//! ```
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use frugal_core::transport::{ConnectReply, ConnectRequest};
//!
//! let request = ConnectRequest::new().encode().unwrap();
//! assert_eq!(&request[..], br#"{"version":0}"#);
//!
//! let reply = ConnectReply::parse(b"hb.listen hb.reply 2000").unwrap();
//! assert_eq!(reply.heartbeat_interval, Some(Duration::from_secs(2)));
//! ```

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{FrugalError, Result};

/// Handshake protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Handshake request sent by a connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Protocol version, always [`PROTOCOL_VERSION`].
    pub version: u8,
}

impl ConnectRequest {
    /// Create a request for the current protocol version.
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }

    /// Serialize to JSON.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse and validate a request.
    ///
    /// # Errors
    ///
    /// `Json` for malformed input, `Protocol` for an unsupported version.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let request: ConnectRequest = serde_json::from_slice(payload)?;
        if request.version != PROTOCOL_VERSION {
            return Err(FrugalError::Protocol(format!(
                "unsupported connection protocol version {}",
                request.version
            )));
        }
        Ok(request)
    }
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Heartbeat contract returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    /// Subject the client receives heartbeats on.
    pub heartbeat_listen: String,
    /// Subject the client answers heartbeats on.
    pub heartbeat_reply: String,
    /// Heartbeat interval; `None` disables heartbeating.
    pub heartbeat_interval: Option<Duration>,
}

impl ConnectReply {
    /// Parse a reply payload.
    ///
    /// # Errors
    ///
    /// `Protocol` unless the payload is exactly three tokens with a numeric
    /// interval.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| FrugalError::Protocol(format!("connect reply is not UTF-8: {}", e)))?;
        let tokens: Vec<&str> = text.split(' ').collect();
        if tokens.len() != 3 {
            return Err(FrugalError::Protocol(format!(
                "invalid connect reply: expected 3 tokens, got {}",
                tokens.len()
            )));
        }
        let interval_ms: i64 = tokens[2].parse().map_err(|_| {
            FrugalError::Protocol(format!("invalid heartbeat interval {:?}", tokens[2]))
        })?;
        Ok(Self {
            heartbeat_listen: tokens[0].to_string(),
            heartbeat_reply: tokens[1].to_string(),
            heartbeat_interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms as u64)),
        })
    }

    /// Serialize to the three-token payload.
    pub fn encode(&self) -> Bytes {
        let interval_ms = self
            .heartbeat_interval
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Bytes::from(format!(
            "{} {} {}",
            self.heartbeat_listen, self.heartbeat_reply, interval_ms
        ))
    }
}
