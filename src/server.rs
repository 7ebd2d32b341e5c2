//! Bus server - accepts stateful client connections.
//!
//! The server listens on a connect subject. For every valid connect request
//! it:
//! 1. Allocates a listen inbox and a pair of heartbeat subjects
//! 2. Opens a server-side [`BusTransport`] feeding a [`ServerRegistry`]
//! 3. Replies to the client's inbox with the heartbeat contract, using the
//!    listen inbox as reply subject
//! 4. Publishes heartbeats and closes the connection once the client stops
//!    answering
//!
//! # Configuration
//!
//! - Heartbeat interval: time between heartbeats, zero disables them
//!   (default: 5s)
//! - Max missed heartbeats: unanswered heartbeats before closing (default: 3)
//! - High watermark: see [`Watermark`](crate::watermark::Watermark)
//!   (default: 5s)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frugal_core::{BaseProcessor, BusServer, ServerConfig};
//! use frugal_core::transport::MemoryBus;
//!
//! # async fn example() -> frugal_core::Result<()> {
//! let mut processor = BaseProcessor::new("calc");
//! processor.register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) });
//!
//! let server = BusServer::new(
//!     Arc::new(MemoryBus::new()),
//!     "calc.connect",
//!     Arc::new(processor),
//!     ServerConfig::default(),
//! );
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{FrugalError, Result};
use crate::processor::Processor;
use crate::registry::ServerRegistry;
use crate::transport::{
    BusMessage, BusSubscription, BusTransport, CloseCause, ConnectReply, ConnectRequest,
    MessageBus, Transport, DEFAULT_MAX_MISSED_HEARTBEATS, FRUGAL_PREFIX,
};
use crate::watermark::DEFAULT_HIGH_WATERMARK;

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for [`BusServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Time between heartbeats. Zero disables heartbeating.
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeats before a connection is closed.
    pub max_missed_heartbeats: u32,
    /// Queueing delay above which processing is reported as overloaded.
    pub high_watermark: Duration,
}

impl ServerConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the missed heartbeat limit (minimum 1).
    pub fn with_max_missed_heartbeats(mut self, max: u32) -> Self {
        self.max_missed_heartbeats = max.max(1);
        self
    }

    pub fn with_high_watermark(mut self, watermark: Duration) -> Self {
        self.high_watermark = watermark;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }
}

struct Connection {
    transport: Arc<BusTransport>,
    token: CancellationToken,
}

struct Running {
    connect_sub_id: u64,
    token: CancellationToken,
}

struct Shared {
    bus: Arc<dyn MessageBus>,
    processor: Arc<dyn Processor>,
    config: ServerConfig,
    connections: DashMap<String, Connection>,
}

/// Accepts client connections on a connect subject and serves them with one
/// processor.
pub struct BusServer {
    subject: String,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl BusServer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        subject: impl Into<String>,
        processor: Arc<dyn Processor>,
        config: ServerConfig,
    ) -> Self {
        Self {
            subject: subject.into(),
            shared: Arc::new(Shared {
                bus,
                processor,
                config,
                connections: DashMap::new(),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start accepting connections.
    ///
    /// # Errors
    ///
    /// `AlreadyOpen` if running, `NotOpen` if the bus is not connected.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(FrugalError::AlreadyOpen("server already running".to_string()));
        }
        if !self.shared.bus.is_connected() {
            return Err(FrugalError::NotOpen("bus not connected".to_string()));
        }

        let sub = self.shared.bus.subscribe(&self.subject).await?;
        let token = CancellationToken::new();
        *running = Some(Running {
            connect_sub_id: sub.id(),
            token: token.clone(),
        });
        tokio::spawn(accept_loop(self.shared.clone(), sub, token));
        tracing::info!(subject = %self.subject, "bus server started");
        Ok(())
    }

    /// Stop accepting connections and close every open one.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running.token.cancel();
        if let Err(e) = self.shared.bus.unsubscribe(running.connect_sub_id).await {
            tracing::warn!(error = %e, subject = %self.subject, "failed to unsubscribe connect subject");
        }

        let listen_subjects: Vec<String> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for listen in listen_subjects {
            if let Some((_, connection)) = self.shared.connections.remove(&listen) {
                connection.token.cancel();
                if let Err(e) = connection.transport.close().await {
                    tracing::warn!(error = %e, listen = %listen, "failed to close connection");
                }
            }
        }
        tracing::info!(subject = %self.subject, "bus server stopped");
        Ok(())
    }
}

async fn accept_loop(shared: Arc<Shared>, mut sub: BusSubscription, token: CancellationToken) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = sub.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = accept(&shared, msg, &token).await {
            tracing::warn!(error = %e, "rejected connection");
        }
    }
}

fn new_subject(bus: &dyn MessageBus) -> String {
    format!("{}{}", FRUGAL_PREFIX, bus.new_inbox())
}

async fn accept(shared: &Arc<Shared>, msg: BusMessage, server_token: &CancellationToken) -> Result<()> {
    ConnectRequest::decode(&msg.payload)?;
    let client_inbox = msg
        .reply
        .filter(|r| !r.is_empty())
        .ok_or_else(|| FrugalError::Protocol("connect request without reply subject".to_string()))?;

    let bus = shared.bus.as_ref();
    let listen = new_subject(bus);
    let heartbeat_listen = new_subject(bus);
    let heartbeat_reply = new_subject(bus);

    let transport = Arc::new(BusTransport::server(
        shared.bus.clone(),
        listen.clone(),
        client_inbox.clone(),
    ));
    transport.set_registry(Arc::new(ServerRegistry::new(shared.processor.clone())));
    transport.set_high_watermark(shared.config.high_watermark);
    transport.open().await?;

    let interval = shared.config.heartbeat_interval;
    let heartbeat_sub = if interval.is_zero() {
        None
    } else {
        match shared.bus.subscribe(&heartbeat_reply).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        }
    };

    let token = server_token.child_token();
    let closed = transport.closed();
    shared.connections.insert(
        listen.clone(),
        Connection {
            transport: transport.clone(),
            token: token.clone(),
        },
    );

    let contract = ConnectReply {
        heartbeat_listen: heartbeat_listen.clone(),
        heartbeat_reply,
        heartbeat_interval: (!interval.is_zero()).then_some(interval),
    };
    if let Err(e) = shared
        .bus
        .publish(&client_inbox, Some(&listen), contract.encode())
        .await
    {
        shared.connections.remove(&listen);
        if let Some(sub) = &heartbeat_sub {
            let _ = shared.bus.unsubscribe(sub.id()).await;
        }
        let _ = transport.close().await;
        return Err(e);
    }

    tokio::spawn(supervise(
        shared.clone(),
        listen.clone(),
        transport,
        closed,
        heartbeat_sub.map(|sub| (sub, heartbeat_listen)),
        token,
    ));
    tracing::debug!(listen = %listen, client = %client_inbox, "accepted connection");
    Ok(())
}

/// Watch one connection: send heartbeats, close it when the client stops
/// answering, and forget it once its transport closes.
async fn supervise(
    shared: Arc<Shared>,
    listen: String,
    transport: Arc<BusTransport>,
    mut closed: broadcast::Receiver<CloseCause>,
    heartbeat: Option<(BusSubscription, String)>,
    token: CancellationToken,
) {
    match heartbeat {
        Some((mut replies, heartbeat_listen)) => {
            let reply_sub_id = replies.id();
            let interval = shared.config.heartbeat_interval;
            let max_missed = shared.config.max_missed_heartbeats.max(1);
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            let mut answered = true;
            let mut missed = 0u32;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = closed.recv() => break,
                    reply = replies.next() => match reply {
                        Some(_) => answered = true,
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if answered {
                            missed = 0;
                        } else {
                            missed += 1;
                            tracing::warn!(listen = %listen, missed, max_missed, "client missed heartbeat");
                            if missed >= max_missed {
                                if let Err(e) = transport.close().await {
                                    tracing::warn!(error = %e, "failed to close connection");
                                }
                                break;
                            }
                        }
                        answered = false;
                        if let Err(e) = shared.bus.publish(&heartbeat_listen, None, Bytes::new()).await {
                            tracing::warn!(error = %e, "failed to send heartbeat");
                        }
                    }
                }
            }
            if let Err(e) = shared.bus.unsubscribe(reply_sub_id).await {
                tracing::warn!(error = %e, "failed to unsubscribe heartbeat replies");
            }
        }
        None => {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = closed.recv() => {}
            }
        }
    }

    shared.connections.remove(&listen);
    tracing::debug!(listen = %listen, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::BaseProcessor;
    use crate::transport::MemoryBus;

    const WAIT: Duration = Duration::from_secs(2);

    fn server(bus: &MemoryBus, config: ServerConfig) -> BusServer {
        BusServer::new(
            Arc::new(bus.clone()),
            "svc.connect",
            Arc::new(BaseProcessor::new("svc")),
            config,
        )
    }

    async fn connect(bus: &MemoryBus) -> (BusSubscription, BusMessage) {
        let mut inbox = bus.subscribe("frugal.test-inbox").await.unwrap();
        bus.publish(
            "svc.connect",
            Some("frugal.test-inbox"),
            ConnectRequest::new().encode().unwrap(),
        )
        .await
        .unwrap();
        let reply = tokio::time::timeout(WAIT, inbox.next())
            .await
            .unwrap()
            .unwrap();
        (inbox, reply)
    }

    async fn wait_for_connections(server: &BusServer, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while server.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connect_reply_carries_contract() {
        let bus = MemoryBus::new();
        let server = server(&bus, ServerConfig::default());
        server.start().await.unwrap();

        let (_inbox, reply) = connect(&bus).await;

        let contract = ConnectReply::parse(&reply.payload).unwrap();
        assert_eq!(contract.heartbeat_interval, Some(DEFAULT_HEARTBEAT_INTERVAL));
        assert!(contract.heartbeat_listen.starts_with(FRUGAL_PREFIX));
        let listen = reply.reply.unwrap();
        assert!(bus.has_subscriber(&listen));
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_heartbeats() {
        let bus = MemoryBus::new();
        let server = server(&bus, ServerConfig::default().with_heartbeat_interval(Duration::ZERO));
        server.start().await.unwrap();

        let (_inbox, reply) = connect(&bus).await;
        let contract = ConnectReply::parse(&reply.payload).unwrap();
        assert_eq!(contract.heartbeat_interval, None);
    }

    #[tokio::test]
    async fn test_bad_requests_rejected() {
        let bus = MemoryBus::new();
        let server = server(&bus, ServerConfig::default());
        server.start().await.unwrap();

        bus.publish("svc.connect", Some("frugal.x"), Bytes::from_static(b"{\"version\":3}"))
            .await
            .unwrap();
        bus.publish("svc.connect", None, ConnectRequest::new().encode().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_removes_connection() {
        let bus = MemoryBus::new();
        let server = server(&bus, ServerConfig::default());
        server.start().await.unwrap();
        let (_inbox, reply) = connect(&bus).await;

        bus.publish(&reply.reply.unwrap(), Some(crate::transport::DISCONNECT), Bytes::new())
            .await
            .unwrap();

        wait_for_connections(&server, 0).await;
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let bus = MemoryBus::new();
        let config = ServerConfig::default()
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_max_missed_heartbeats(2);
        let server = server(&bus, config);
        server.start().await.unwrap();

        let (mut inbox, _reply) = connect(&bus).await;
        wait_for_connections(&server, 0).await;

        // the server says goodbye on the client's inbox
        let goodbye = tokio::time::timeout(WAIT, inbox.next()).await.unwrap().unwrap();
        assert_eq!(goodbye.reply.as_deref(), Some(crate::transport::DISCONNECT));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let bus = MemoryBus::new();
        let server = server(&bus, ServerConfig::default());
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(FrugalError::AlreadyOpen(_))));

        let (_inbox, _reply) = connect(&bus).await;
        server.stop().await.unwrap();

        assert!(!server.is_running().await);
        assert_eq!(server.connection_count(), 0);
        assert!(!bus.has_subscriber("svc.connect"));
    }

    #[tokio::test]
    async fn test_start_requires_connected_bus() {
        let bus = MemoryBus::new();
        bus.disconnect();
        let server = server(&bus, ServerConfig::default());
        assert!(matches!(server.start().await, Err(FrugalError::NotOpen(_))));
    }
}
