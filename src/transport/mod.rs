//! Transport module - moving framed calls over a backend.
//!
//! Provides:
//! - [`Transport`] - lifecycle, registry injection and buffered writes
//! - [`BusTransport`] - stateful message-bus transport with handshake and
//!   heartbeats
//! - [`HttpTransport`] - one request/response exchange per flush
//! - [`scope`] - connectionless publish/subscribe
//! - [`MessageBus`] and [`MemoryBus`] - the bus abstraction and an in-process
//!   implementation
//! - `NatsBus` - the bus over a NATS connection (feature `nats`)

mod buffer;
mod bus;
mod bus_transport;
mod dispatch;
mod handshake;
mod http;
#[cfg(feature = "nats")]
mod nats;
pub mod scope;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{FrugalError, Result};
use crate::registry::Registry;

pub use bus::{BusMessage, BusSubscription, MemoryBus, MessageBus, DEFAULT_MAX_PAYLOAD};
pub use bus_transport::{
    BusTransport, BusTransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_MISSED_HEARTBEATS,
    DISCONNECT, FRUGAL_PREFIX, HEARTBEAT_GRACE_DIVISOR,
};
pub use handshake::{ConnectReply, ConnectRequest, PROTOCOL_VERSION};
#[cfg(feature = "nats")]
pub use nats::NatsBus;
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use http::{
    HttpClient, HttpResponse, HttpTransport, HttpTransportBuilder, FRUGAL_CONTENT_TYPE,
    PAYLOAD_LIMIT_HEADER,
};

/// Why a transport closed: `None` for a requested close, `Some(cause)` when
/// it went down on its own.
pub type CloseCause = Option<Arc<FrugalError>>;

/// Bidirectional carrier of framed calls.
///
/// A transport owns one [`Registry`] at a time and feeds it every inbound
/// frame body in arrival order from a single dispatch task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the transport is open.
    fn is_open(&self) -> bool;

    /// Open the transport.
    ///
    /// # Errors
    ///
    /// `NotOpen` if the backend is not connected, `AlreadyOpen` if the
    /// transport is already open.
    async fn open(&self) -> Result<()>;

    /// Close the transport. Idempotent; release failures are logged.
    async fn close(&self) -> Result<()>;

    /// Replace the registry inbound frames are handed to.
    fn set_registry(&self, registry: Arc<dyn Registry>);

    /// Set the queueing delay above which frame processing is reported as
    /// overloaded.
    fn set_high_watermark(&self, watermark: Duration);

    /// Buffer outgoing bytes (a full frame, length prefix included).
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Send the buffered bytes.
    async fn flush(&self) -> Result<()>;

    /// Subscribe to close events.
    fn closed(&self) -> broadcast::Receiver<CloseCause>;
}

const CLOSE_CHANNEL_CAPACITY: usize = 16;

/// Broadcasts close events to every subscriber.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    tx: broadcast::Sender<CloseCause>,
}

impl CloseNotifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CLOSE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future close events.
    pub fn subscribe(&self) -> broadcast::Receiver<CloseCause> {
        self.tx.subscribe()
    }

    /// Publish a close event.
    pub fn notify(&self, cause: CloseCause) {
        match &cause {
            None => tracing::debug!("transport closed"),
            Some(e) => tracing::warn!(error = %e, "transport closed uncleanly"),
        }
        // No subscribers is fine.
        let _ = self.tx.send(cause);
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}
