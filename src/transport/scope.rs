//! Connectionless publish/subscribe over a message bus.
//!
//! Publishers send one framed message per call to `frugal.<topic>`; there is
//! no response and no correlation id. Subscribers validate and strip the
//! length prefix of every message and hand the frame body to a registry,
//! usually a [`ScopeRegistry`] that decodes the context for a callback.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use frugal_core::CallContext;
//! use frugal_core::transport::MemoryBus;
//! use frugal_core::transport::scope::{
//!     subscribe, BusPublisherTransport, BusSubscriberTransport, ScopeCallback, ScopePublisher,
//! };
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = Arc::new(MemoryBus::new());
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let callback: ScopeCallback = Arc::new(move |_ctx, payload: Bytes| {
//!     let _ = tx.send(payload);
//!     Ok(())
//! });
//! let subscription = subscribe(Arc::new(BusSubscriberTransport::new(bus.clone())), "events", callback)
//!     .await
//!     .unwrap();
//!
//! let publisher = ScopePublisher::new(Arc::new(BusPublisherTransport::new(bus)));
//! publisher.open().await.unwrap();
//! publisher.publish(&CallContext::new(), "events", b"hello").await.unwrap();
//!
//! assert_eq!(&rx.recv().await.unwrap()[..], b"hello");
//! subscription.unsubscribe().await.unwrap();
//! # });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::bus::{BusSubscription, MessageBus};
use super::bus_transport::FRUGAL_PREFIX;
use crate::context::CallContext;
use crate::error::{FrugalError, Result};
use crate::protocol::{build_frame, strip_frame_prefix, Frame};
use crate::registry::Registry;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Bus subject for a topic.
pub fn topic_subject(topic: &str) -> String {
    format!("{}{}", FRUGAL_PREFIX, topic)
}

/// Sends framed messages to topics.
#[async_trait]
pub trait PublisherTransport: Send + Sync {
    /// Whether the publisher is open.
    fn is_open(&self) -> bool;

    /// Open the publisher. `NotOpen` if the backend is not connected.
    async fn open(&self) -> Result<()>;

    /// Close the publisher. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Largest message accepted; non-positive means unlimited.
    fn publish_size_limit(&self) -> i64;

    /// Publish one framed message to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Receives framed messages from one topic.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    /// Start delivering messages on `topic` to `registry`.
    async fn subscribe(&self, topic: &str, registry: Arc<dyn Registry>) -> Result<()>;

    /// Stop delivering. No-op when not subscribed.
    async fn unsubscribe(&self) -> Result<()>;

    /// Whether a subscription is active.
    fn is_subscribed(&self) -> bool;
}

/// [`PublisherTransport`] publishing to `frugal.<topic>` subjects.
pub struct BusPublisherTransport {
    bus: Arc<dyn MessageBus>,
    open: AtomicBool,
}

impl BusPublisherTransport {
    /// Create a closed publisher on `bus`.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PublisherTransport for BusPublisherTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.bus.is_connected()
    }

    async fn open(&self) -> Result<()> {
        if !self.bus.is_connected() {
            return Err(FrugalError::NotOpen("bus not connected".to_string()));
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.bus.flush(CLOSE_FLUSH_TIMEOUT).await {
            tracing::warn!(error = %e, "failed to flush bus on publisher close");
        }
        Ok(())
    }

    fn publish_size_limit(&self) -> i64 {
        self.bus.max_payload() as i64
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(FrugalError::NotOpen("publisher not open".to_string()));
        }
        let limit = self.publish_size_limit();
        if limit > 0 && payload.len() as i64 > limit {
            return Err(FrugalError::MessageSize(format!(
                "message of {} bytes exceeds publish limit {}",
                payload.len(),
                limit
            )));
        }
        self.bus.publish(&topic_subject(topic), None, payload).await
    }
}

struct ActiveSubscription {
    sub_id: u64,
    token: CancellationToken,
}

/// [`SubscriberTransport`] reading from a `frugal.<topic>` subject.
pub struct BusSubscriberTransport {
    bus: Arc<dyn MessageBus>,
    active: tokio::sync::Mutex<Option<ActiveSubscription>>,
    subscribed: AtomicBool,
}

impl BusSubscriberTransport {
    /// Create an idle subscriber on `bus`.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            active: tokio::sync::Mutex::new(None),
            subscribed: AtomicBool::new(false),
        }
    }
}

async fn subscriber_loop(
    mut sub: BusSubscription,
    registry: Arc<dyn Registry>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = sub.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let body = match strip_frame_prefix(msg.payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, subject = %msg.subject, "discarding invalid message");
                continue;
            }
        };
        if let Err(e) = registry.execute(body).await {
            tracing::warn!(error = %e, subject = %msg.subject, "failed to process message");
        }
    }
}

#[async_trait]
impl SubscriberTransport for BusSubscriberTransport {
    async fn subscribe(&self, topic: &str, registry: Arc<dyn Registry>) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(FrugalError::AlreadyOpen(
                "subscriber already subscribed".to_string(),
            ));
        }
        if !self.bus.is_connected() {
            return Err(FrugalError::NotOpen("bus not connected".to_string()));
        }

        let sub = self.bus.subscribe(&topic_subject(topic)).await?;
        let token = CancellationToken::new();
        *active = Some(ActiveSubscription {
            sub_id: sub.id(),
            token: token.clone(),
        });
        tokio::spawn(subscriber_loop(sub, registry, token));
        self.subscribed.store(true, Ordering::Release);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(current) = active.take() else {
            return Ok(());
        };
        self.subscribed.store(false, Ordering::Release);
        current.token.cancel();
        if let Err(e) = self.bus.unsubscribe(current.sub_id).await {
            tracing::warn!(error = %e, "failed to unsubscribe topic");
        }
        Ok(())
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire) && self.bus.is_connected()
    }
}

/// Callback receiving each published message with its decoded context.
pub type ScopeCallback = Arc<dyn Fn(CallContext, Bytes) -> Result<()> + Send + Sync>;

/// Registry decoding scope messages for a [`ScopeCallback`].
pub struct ScopeRegistry {
    callback: ScopeCallback,
}

impl ScopeRegistry {
    /// Wrap a callback.
    pub fn new(callback: ScopeCallback) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl Registry for ScopeRegistry {
    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>> {
        let frame = Frame::decode(frame)?;
        let ctx = CallContext::from_request_headers(frame.headers);
        (self.callback)(ctx, frame.payload)?;
        Ok(None)
    }

    fn close(&self) {}
}

/// Frames calls and publishes them to topics.
pub struct ScopePublisher {
    transport: Arc<dyn PublisherTransport>,
}

impl ScopePublisher {
    /// Wrap a publisher transport.
    pub fn new(transport: Arc<dyn PublisherTransport>) -> Self {
        Self { transport }
    }

    /// Open the underlying transport.
    pub async fn open(&self) -> Result<()> {
        self.transport.open().await
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    /// Publish `payload` with the context's request headers.
    pub async fn publish(&self, ctx: &CallContext, topic: &str, payload: &[u8]) -> Result<()> {
        let frame = build_frame(ctx.request_headers(), payload)?;
        self.transport.publish(topic, frame).await
    }
}

/// An active topic subscription.
pub struct Subscription {
    topic: String,
    transport: Arc<dyn SubscriberTransport>,
}

impl Subscription {
    /// Subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether messages are still being delivered.
    pub fn is_active(&self) -> bool {
        self.transport.is_subscribed()
    }

    /// Stop receiving messages.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.transport.unsubscribe().await
    }
}

/// Subscribe `callback` to `topic` through `transport`.
pub async fn subscribe(
    transport: Arc<dyn SubscriberTransport>,
    topic: &str,
    callback: ScopeCallback,
) -> Result<Subscription> {
    transport
        .subscribe(topic, Arc::new(ScopeRegistry::new(callback)))
        .await?;
    Ok(Subscription {
        topic: topic.to_string(),
        transport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::prepend_frame_size;
    use crate::transport::MemoryBus;
    use tokio::sync::mpsc;

    fn channel_callback() -> (ScopeCallback, mpsc::UnboundedReceiver<(CallContext, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ScopeCallback = Arc::new(move |ctx, payload| {
            let _ = tx.send((ctx, payload));
            Ok(())
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_publish_uses_prefixed_subject() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("frugal.news").await.unwrap();
        let publisher = BusPublisherTransport::new(Arc::new(bus.clone()));
        publisher.open().await.unwrap();

        publisher
            .publish("news", Bytes::from_static(b"framed"))
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(&msg.payload[..], b"framed");
        assert!(msg.reply.is_none());
    }

    #[tokio::test]
    async fn test_publish_requires_open() {
        let publisher = BusPublisherTransport::new(Arc::new(MemoryBus::new()));
        assert!(matches!(
            publisher.publish("t", Bytes::new()).await,
            Err(FrugalError::NotOpen(_))
        ));

        let bus = MemoryBus::new();
        bus.disconnect();
        let publisher = BusPublisherTransport::new(Arc::new(bus));
        assert!(matches!(
            publisher.open().await,
            Err(FrugalError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_size_limit() {
        let bus = MemoryBus::with_max_payload(8);
        let publisher = BusPublisherTransport::new(Arc::new(bus.clone()));
        publisher.open().await.unwrap();

        assert_eq!(publisher.publish_size_limit(), 8);
        let err = publisher
            .publish("t", Bytes::from_static(b"123456789"))
            .await
            .unwrap_err();
        assert!(matches!(err, FrugalError::MessageSize(_)));
        assert_eq!(bus.published_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_delivers_context_and_payload() {
        let bus = Arc::new(MemoryBus::new());
        let (callback, mut rx) = channel_callback();
        let subscription = subscribe(
            Arc::new(BusSubscriberTransport::new(bus.clone())),
            "t",
            callback,
        )
        .await
        .unwrap();
        assert!(subscription.is_active());
        assert_eq!(subscription.topic(), "t");

        let publisher = ScopePublisher::new(Arc::new(BusPublisherTransport::new(bus)));
        publisher.open().await.unwrap();
        let ctx = CallContext::with_correlation_id("cid-7");
        publisher.publish(&ctx, "t", b"event").await.unwrap();

        let (received, payload) = rx.recv().await.unwrap();
        assert_eq!(received.correlation_id(), "cid-7");
        assert_eq!(received.op_id(), 0);
        assert_eq!(&payload[..], b"event");
    }

    #[tokio::test]
    async fn test_subscriber_skips_bad_length_prefix() {
        let bus = MemoryBus::new();
        let (callback, mut rx) = channel_callback();
        let transport = BusSubscriberTransport::new(Arc::new(bus.clone()));
        transport
            .subscribe("t", Arc::new(ScopeRegistry::new(callback)))
            .await
            .unwrap();

        let mut bad = prepend_frame_size(b"xx").unwrap().to_vec();
        bad.push(0);
        bus.publish("frugal.t", None, Bytes::from(bad)).await.unwrap();
        let good = build_frame(&crate::protocol::Headers::new(), b"ok").unwrap();
        bus.publish("frugal.t", None, good).await.unwrap();

        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(&payload[..], b"ok");
    }

    #[tokio::test]
    async fn test_double_subscribe_and_unsubscribe() {
        let bus = MemoryBus::new();
        let transport = BusSubscriberTransport::new(Arc::new(bus.clone()));
        let (callback, _rx) = channel_callback();
        let registry: Arc<dyn Registry> = Arc::new(ScopeRegistry::new(callback));

        transport.subscribe("t", registry.clone()).await.unwrap();
        assert!(matches!(
            transport.subscribe("t", registry).await,
            Err(FrugalError::AlreadyOpen(_))
        ));

        transport.unsubscribe().await.unwrap();
        transport.unsubscribe().await.unwrap();
        assert!(!transport.is_subscribed());
        assert_eq!(bus.subscription_count(), 0);
    }
}
