//! Stateful message-bus transport.
//!
//! A client-side transport connects with a handshake: it publishes a
//! [`ConnectRequest`] to the server's connect subject and waits for a
//! [`ConnectReply`] carrying the heartbeat contract. The reply's subject
//! becomes the listen subject and its reply field the write subject. A
//! server-side transport is given both subjects directly.
//!
//! ```text
//!            Closed ──open()──► Handshaking ──reply──► Open
//!              ▲                    │                   │
//!              └──── timeout/error ─┘     close() / missed heartbeats /
//!              └──────────────────────────  remote DISCONNECT ────────┘
//! ```
//!
//! While open, one listener task feeds bus messages through a
//! [`FrameBuffer`] into the dispatch task, and (client side, when the server
//! asked for it) one heartbeat task answers heartbeats and closes the
//! transport after too many are missed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::buffer::OutputBuffer;
use super::bus::{BusSubscription, MessageBus};
use super::dispatch::{spawn_dispatcher, DispatchHandle, DispatchState, Responder};
use super::handshake::{ConnectReply, ConnectRequest};
use super::{CloseCause, CloseNotifier, Transport};
use crate::error::{FrugalError, Result};
use crate::protocol::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
use crate::registry::Registry;

/// Prefix of every subject the runtime creates.
pub const FRUGAL_PREFIX: &str = "frugal.";

/// Reply marker of the empty message announcing a graceful close.
pub const DISCONNECT: &str = "DISCONNECT";

/// Default bound on the connect handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of consecutive missed heartbeats tolerated.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// With a single allowed miss, the deadline is extended by
/// `interval / HEARTBEAT_GRACE_DIVISOR`.
pub const HEARTBEAT_GRACE_DIVISOR: u32 = 4;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a client-side [`BusTransport`].
#[derive(Debug, Clone)]
pub struct BusTransportConfig {
    /// How long to wait for the handshake reply.
    pub connect_timeout: Duration,
    /// Consecutive missed heartbeats before the transport closes itself.
    pub max_missed_heartbeats: u32,
}

impl BusTransportConfig {
    /// Set the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the missed-heartbeat limit (at least 1).
    pub fn with_max_missed_heartbeats(mut self, max: u32) -> Self {
        self.max_missed_heartbeats = max.max(1);
        self
    }
}

impl Default for BusTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

/// Time allowed between heartbeats before one counts as missed.
pub(crate) fn heartbeat_deadline(interval: Duration, max_missed: u32) -> Duration {
    if max_missed == 1 {
        interval + interval / HEARTBEAT_GRACE_DIVISOR
    } else {
        interval
    }
}

enum Role {
    Client { connect_subject: String },
    Server { listen: String, write: String },
}

struct Session {
    listen_subject: String,
    write_subject: String,
    listen_sub_id: u64,
    heartbeat_sub_id: Option<u64>,
    token: CancellationToken,
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    role: Role,
    config: BusTransportConfig,
    open: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    output: OutputBuffer,
    dispatch: Arc<DispatchState>,
    notifier: CloseNotifier,
}

/// Point-to-point transport over a [`MessageBus`].
pub struct BusTransport {
    inner: Arc<Inner>,
}

impl BusTransport {
    /// Client-side transport connecting through `connect_subject`.
    pub fn client(bus: Arc<dyn MessageBus>, connect_subject: impl Into<String>) -> Self {
        Self::client_with_config(bus, connect_subject, BusTransportConfig::default())
    }

    /// Client-side transport with custom configuration.
    pub fn client_with_config(
        bus: Arc<dyn MessageBus>,
        connect_subject: impl Into<String>,
        config: BusTransportConfig,
    ) -> Self {
        Self::build(
            bus,
            Role::Client {
                connect_subject: connect_subject.into(),
            },
            config,
        )
    }

    /// Server-side transport on already negotiated subjects.
    pub fn server(
        bus: Arc<dyn MessageBus>,
        listen: impl Into<String>,
        write: impl Into<String>,
    ) -> Self {
        Self::build(
            bus,
            Role::Server {
                listen: listen.into(),
                write: write.into(),
            },
            BusTransportConfig::default(),
        )
    }

    fn build(bus: Arc<dyn MessageBus>, role: Role, config: BusTransportConfig) -> Self {
        let limit = bus.max_payload();
        Self {
            inner: Arc::new(Inner {
                bus,
                role,
                config,
                open: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
                output: OutputBuffer::new(limit),
                dispatch: Arc::new(DispatchState::new()),
                notifier: CloseNotifier::new(),
            }),
        }
    }

    /// Subject inbound frames arrive on, while open.
    pub fn listen_subject(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.listen_subject.clone())
    }

    /// Subject outbound frames are published to, while open.
    pub fn write_subject(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|s| s.write_subject.clone())
    }

    /// Frames that waited longer than the high watermark.
    pub fn overload_count(&self) -> u64 {
        self.inner.dispatch.overload_count()
    }
}

impl Inner {
    /// Publish the connect request and wait for the heartbeat contract.
    ///
    /// Returns the inbox subscription (the listen subject), the write
    /// subject and the contract.
    async fn handshake(
        &self,
        connect_subject: &str,
    ) -> Result<(BusSubscription, String, ConnectReply)> {
        let inbox = format!("{}{}", FRUGAL_PREFIX, self.bus.new_inbox());
        let mut sub = self.bus.subscribe(&inbox).await?;

        let result: Result<(String, ConnectReply)> = async {
            let request = ConnectRequest::new().encode()?;
            self.bus
                .publish(connect_subject, Some(&inbox), request)
                .await?;
            let msg = match tokio::time::timeout(self.config.connect_timeout, sub.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    return Err(FrugalError::NotOpen(
                        "handshake subscription closed".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(FrugalError::Timeout(format!(
                        "no handshake reply on {} within {:?}",
                        connect_subject, self.config.connect_timeout
                    )))
                }
            };
            let write_subject = msg.reply.filter(|r| !r.is_empty()).ok_or_else(|| {
                FrugalError::Protocol("no reply subject on connection".to_string())
            })?;
            let contract = ConnectReply::parse(&msg.payload)?;
            Ok((write_subject, contract))
        }
        .await;

        match result {
            Ok((write_subject, contract)) => Ok((sub, write_subject, contract)),
            Err(e) => {
                if let Err(unsub) = self.bus.unsubscribe(sub.id()).await {
                    tracing::warn!(error = %unsub, "failed to unsubscribe handshake inbox");
                }
                Err(e)
            }
        }
    }

    /// Tear the session down. Every step is attempted regardless of the
    /// others; failures are logged.
    async fn close_with(&self, cause: CloseCause) {
        let _guard = self.lifecycle.lock().await;
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = self
                .bus
                .publish(&session.write_subject, Some(DISCONNECT), Bytes::new())
                .await
            {
                tracing::warn!(error = %e, subject = %session.write_subject, "failed to send disconnect");
            }
            session.token.cancel();
            if let Some(id) = session.heartbeat_sub_id {
                if let Err(e) = self.bus.unsubscribe(id).await {
                    tracing::warn!(error = %e, "failed to unsubscribe heartbeat");
                }
            }
            if let Err(e) = self.bus.unsubscribe(session.listen_sub_id).await {
                tracing::warn!(error = %e, subject = %session.listen_subject, "failed to unsubscribe listen subject");
            }
            if let Err(e) = self.bus.flush(CLOSE_FLUSH_TIMEOUT).await {
                tracing::warn!(error = %e, "failed to flush bus on close");
            }
        }

        self.output.clear();
        if let Some(registry) = self.dispatch.registry() {
            registry.close();
        }
        self.notifier.notify(cause);
    }

    async fn remote_disconnect(&self) {
        match self.role {
            Role::Server { .. } => {
                tracing::debug!("client disconnected");
                self.close_with(None).await;
            }
            Role::Client { .. } => {
                tracing::error!("server unexpectedly disconnected");
                let cause = FrugalError::Transport("server disconnected".to_string());
                self.close_with(Some(Arc::new(cause))).await;
            }
        }
    }
}

async fn listen_loop(
    inner: Arc<Inner>,
    mut sub: BusSubscription,
    dispatch: DispatchHandle,
    token: CancellationToken,
) {
    let mut frames = FrameBuffer::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE);
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = sub.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if msg.payload.is_empty() && msg.reply.as_deref() == Some(DISCONNECT) {
            inner.remote_disconnect().await;
            break;
        }

        match frames.push(&msg.payload) {
            Ok(bodies) => {
                for body in bodies {
                    if !dispatch.send(body).await {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, subject = %msg.subject, "discarding malformed frame data"),
        }
    }
}

async fn heartbeat_loop(
    inner: Arc<Inner>,
    mut sub: BusSubscription,
    reply_subject: String,
    interval: Duration,
    token: CancellationToken,
) {
    let max_missed = inner.config.max_missed_heartbeats.max(1);
    let deadline = heartbeat_deadline(interval, max_missed);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            msg = sub.next() => match msg {
                Some(_) => {
                    missed = 0;
                    if let Err(e) = inner.bus.publish(&reply_subject, None, Bytes::new()).await {
                        tracing::warn!(error = %e, "failed to answer heartbeat");
                    }
                }
                None => return,
            },
            _ = tokio::time::sleep(deadline) => {
                missed += 1;
                tracing::warn!(missed, max_missed, "missed heartbeat");
                if missed >= max_missed {
                    let cause = FrugalError::Timeout(format!("missed {} heartbeats", missed));
                    inner.close_with(Some(Arc::new(cause))).await;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        if inner.open.load(Ordering::Acquire) {
            return Err(FrugalError::AlreadyOpen(
                "bus transport already open".to_string(),
            ));
        }
        if !inner.bus.is_connected() {
            return Err(FrugalError::NotOpen("bus not connected".to_string()));
        }

        let (listen_sub, write_subject, contract) = match &inner.role {
            Role::Client { connect_subject } => {
                let (sub, write, contract) = inner.handshake(connect_subject).await?;
                (sub, write, Some(contract))
            }
            Role::Server { listen, write } => {
                if listen.is_empty() || write.is_empty() {
                    return Err(FrugalError::NotOpen(
                        "listen and write subjects must be set".to_string(),
                    ));
                }
                (inner.bus.subscribe(listen).await?, write.clone(), None)
            }
        };
        let listen_subject = listen_sub.subject().to_string();
        let listen_sub_id = listen_sub.id();
        let token = CancellationToken::new();

        let mut heartbeat_sub_id = None;
        if let Some(ConnectReply {
            heartbeat_listen,
            heartbeat_reply,
            heartbeat_interval: Some(interval),
        }) = contract
        {
            let hb_sub = match inner.bus.subscribe(&heartbeat_listen).await {
                Ok(sub) => sub,
                Err(e) => {
                    if let Err(unsub) = inner.bus.unsubscribe(listen_sub_id).await {
                        tracing::warn!(error = %unsub, "failed to unsubscribe listen subject");
                    }
                    return Err(e);
                }
            };
            heartbeat_sub_id = Some(hb_sub.id());
            tokio::spawn(heartbeat_loop(
                inner.clone(),
                hb_sub,
                heartbeat_reply,
                interval,
                token.clone(),
            ));
        }

        let bus = inner.bus.clone();
        let reply_subject = write_subject.clone();
        let responder: Responder = Arc::new(move |reply: Bytes| {
            let bus = bus.clone();
            let subject = reply_subject.clone();
            Box::pin(async move { bus.publish(&subject, None, reply).await })
        });
        let (handle, _task) = spawn_dispatcher(inner.dispatch.clone(), responder, token.clone());
        tokio::spawn(listen_loop(inner.clone(), listen_sub, handle, token.clone()));

        tracing::debug!(listen = %listen_subject, write = %write_subject, "bus transport open");
        *inner.session.lock() = Some(Session {
            listen_subject,
            write_subject,
            listen_sub_id,
            heartbeat_sub_id,
            token,
        });
        inner.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close_with(None).await;
        Ok(())
    }

    fn set_registry(&self, registry: Arc<dyn Registry>) {
        self.inner.dispatch.set_registry(registry);
    }

    fn set_high_watermark(&self, watermark: Duration) {
        self.inner.dispatch.set_high_watermark(watermark);
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(FrugalError::NotOpen("bus transport not open".to_string()));
        }
        self.inner.output.write(data)
    }

    async fn flush(&self) -> Result<()> {
        if !self.is_open() {
            return Err(FrugalError::NotOpen("bus transport not open".to_string()));
        }
        let data = self.inner.output.take();
        if data.is_empty() {
            return Ok(());
        }
        let limit = self.inner.output.limit();
        if data.len() > limit {
            return Err(FrugalError::MessageSize(format!(
                "buffer size {} exceeds limit {}",
                data.len(),
                limit
            )));
        }
        let subject = self
            .write_subject()
            .ok_or_else(|| FrugalError::NotOpen("bus transport not open".to_string()))?;
        self.inner.bus.publish(&subject, None, data).await
    }

    fn closed(&self) -> broadcast::Receiver<CloseCause> {
        self.inner.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::prepend_frame_size;
    use crate::transport::MemoryBus;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(2);

    /// Answer one handshake on "connect" with `payload`.
    async fn fake_server(bus: MemoryBus, payload: &'static str, reply: Option<&'static str>) -> JoinHandle<()> {
        let mut sub = bus.subscribe("connect").await.unwrap();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                let inbox = msg.reply.unwrap();
                bus.publish(&inbox, reply, Bytes::from_static(payload.as_bytes()))
                    .await
                    .unwrap();
            }
        })
    }

    fn client(bus: &MemoryBus) -> BusTransport {
        BusTransport::client_with_config(
            Arc::new(bus.clone()),
            "connect",
            BusTransportConfig::default().with_connect_timeout(Duration::from_millis(200)),
        )
    }

    #[test]
    fn test_heartbeat_deadline_grace() {
        let interval = Duration::from_millis(400);
        assert_eq!(heartbeat_deadline(interval, 3), interval);
        assert_eq!(heartbeat_deadline(interval, 1), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_handshake_assigns_subjects() {
        let bus = MemoryBus::new();
        fake_server(bus.clone(), "hb.l hb.r 0", Some("server.listen")).await;
        let transport = client(&bus);

        transport.open().await.unwrap();

        assert!(transport.is_open());
        assert_eq!(transport.write_subject().as_deref(), Some("server.listen"));
        assert!(transport
            .listen_subject()
            .unwrap()
            .starts_with("frugal._INBOX."));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let bus = MemoryBus::new();
        let transport = client(&bus);

        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, FrugalError::Timeout(_)));
        assert!(!transport.is_open());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_requires_reply_subject() {
        let bus = MemoryBus::new();
        fake_server(bus.clone(), "hb.l hb.r 0", None).await;

        let err = client(&bus).open().await.unwrap_err();
        assert!(matches!(err, FrugalError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_payload() {
        let bus = MemoryBus::new();
        fake_server(bus.clone(), "hb.l 1000", Some("server.listen")).await;

        let err = client(&bus).open().await.unwrap_err();
        assert!(matches!(err, FrugalError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_open_state_errors() {
        let bus = MemoryBus::new();
        bus.disconnect();
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        assert!(matches!(
            transport.open().await,
            Err(FrugalError::NotOpen(_))
        ));

        bus.reconnect();
        transport.open().await.unwrap();
        assert!(matches!(
            transport.open().await,
            Err(FrugalError::AlreadyOpen(_))
        ));

        let empty = BusTransport::server(Arc::new(bus.clone()), "", "out");
        assert!(matches!(empty.open().await, Err(FrugalError::NotOpen(_))));
    }

    #[tokio::test]
    async fn test_write_overflow_clears_buffer() {
        let bus = MemoryBus::with_max_payload(16);
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        transport.open().await.unwrap();
        let before = bus.published_count();

        transport.write(&[0u8; 10]).unwrap();
        let err = transport.write(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, FrugalError::MessageSize(_)));

        transport.flush().await.unwrap();
        assert_eq!(bus.published_count(), before);
    }

    #[tokio::test]
    async fn test_flush_publishes_once() {
        let bus = MemoryBus::new();
        let mut out = bus.subscribe("out").await.unwrap();
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        transport.open().await.unwrap();

        transport.write(b"ab").unwrap();
        transport.write(b"cd").unwrap();
        transport.flush().await.unwrap();
        transport.flush().await.unwrap();

        let msg = out.next().await.unwrap();
        assert_eq!(&msg.payload[..], b"abcd");
        assert!(tokio::time::timeout(Duration::from_millis(50), out.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_write_and_flush_require_open() {
        let bus = MemoryBus::new();
        let transport = BusTransport::server(Arc::new(bus), "in", "out");
        assert!(matches!(transport.write(b"x"), Err(FrugalError::NotOpen(_))));
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let bus = MemoryBus::new();
        let mut out = bus.subscribe("out").await.unwrap();
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        transport.open().await.unwrap();
        let mut closed = transport.closed();
        assert_eq!(bus.subscription_count(), 2);

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let msg = out.next().await.unwrap();
        assert_eq!(msg.reply.as_deref(), Some(DISCONNECT));
        assert!(msg.payload.is_empty());
        assert_eq!(bus.subscription_count(), 1);
        assert!(closed.recv().await.unwrap().is_none());
        assert!(closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_survives_bus_failure() {
        let bus = MemoryBus::new();
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        transport.open().await.unwrap();
        let mut closed = transport.closed();

        bus.disconnect();
        transport.close().await.unwrap();

        assert!(!transport.is_open());
        assert_eq!(bus.subscription_count(), 0);
        assert!(closed.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_disconnect_server_side_is_clean() {
        let bus = MemoryBus::new();
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        transport.open().await.unwrap();
        let mut closed = transport.closed();

        bus.publish("in", Some(DISCONNECT), Bytes::new()).await.unwrap();

        let cause = tokio::time::timeout(WAIT, closed.recv()).await.unwrap().unwrap();
        assert!(cause.is_none());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_remote_disconnect_client_side_is_unclean() {
        let bus = MemoryBus::new();
        fake_server(bus.clone(), "hb.l hb.r 0", Some("server.listen")).await;
        let transport = client(&bus);
        transport.open().await.unwrap();
        let mut closed = transport.closed();

        let inbox = transport.listen_subject().unwrap();
        bus.publish(&inbox, Some(DISCONNECT), Bytes::new()).await.unwrap();

        let cause = tokio::time::timeout(WAIT, closed.recv()).await.unwrap().unwrap();
        assert!(matches!(cause.as_deref(), Some(FrugalError::Transport(_))));
    }

    #[tokio::test]
    async fn test_missed_heartbeats_close_uncleanly() {
        let bus = MemoryBus::new();
        fake_server(bus.clone(), "hb.l hb.r 30", Some("server.listen")).await;
        let transport = BusTransport::client_with_config(
            Arc::new(bus.clone()),
            "connect",
            BusTransportConfig::default().with_max_missed_heartbeats(2),
        );
        transport.open().await.unwrap();
        let mut closed = transport.closed();

        let cause = tokio::time::timeout(WAIT, closed.recv()).await.unwrap().unwrap();
        assert!(matches!(cause.as_deref(), Some(FrugalError::Timeout(_))));
        assert!(!transport.is_open());
        // only the fake server's connect subscription is left
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_answered() {
        let bus = MemoryBus::new();
        fake_server(bus.clone(), "hb.l hb.r 1000", Some("server.listen")).await;
        let mut replies = bus.subscribe("hb.r").await.unwrap();
        let transport = client(&bus);
        transport.open().await.unwrap();

        bus.publish("hb.l", None, Bytes::new()).await.unwrap();

        let reply = tokio::time::timeout(WAIT, replies.next()).await.unwrap().unwrap();
        assert!(reply.payload.is_empty());
        assert!(transport.is_open());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_registry() {
        use crate::registry::ClientRegistry;

        let bus = MemoryBus::new();
        let transport = BusTransport::server(Arc::new(bus.clone()), "in", "out");
        let registry = Arc::new(ClientRegistry::new());
        transport.set_registry(registry.clone());
        transport.open().await.unwrap();

        let mut headers = crate::protocol::Headers::new();
        headers.insert("_opid".to_string(), "77".to_string());
        let wire = crate::protocol::build_frame(&headers, b"late").unwrap();
        // split one frame over two messages
        bus.publish("in", None, wire.slice(..6)).await.unwrap();
        bus.publish("in", None, wire.slice(6..)).await.unwrap();
        bus.publish("in", None, prepend_frame_size(b"").unwrap()).await.unwrap();

        tokio::time::timeout(WAIT, async {
            while registry.dropped_frames() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.dropped_frames(), 1);
    }
}
