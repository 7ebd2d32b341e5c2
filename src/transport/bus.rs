//! Message bus abstraction.
//!
//! [`MessageBus`] is the subject-based publish/subscribe connection the bus
//! transports run on: publish with an optional reply subject, subscribe and
//! unsubscribe, and flush. [`MemoryBus`] delivers messages in-process and is
//! what the tests and single-process deployments use.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use frugal_core::transport::{MemoryBus, MessageBus};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = MemoryBus::new();
//! let mut sub = bus.subscribe("greetings").await.unwrap();
//! bus.publish("greetings", Some("inbox"), Bytes::from_static(b"hi")).await.unwrap();
//!
//! let msg = sub.next().await.unwrap();
//! assert_eq!(msg.reply.as_deref(), Some("inbox"));
//! # });
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{FrugalError, Result};

/// Default largest message a bus accepts (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// A message delivered on a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Reply subject, if the publisher set one.
    pub reply: Option<String>,
    /// Message body.
    pub payload: Bytes,
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct BusSubscription {
    id: u64,
    subject: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusSubscription {
    /// Wrap a receiver delivering messages for `subject`.
    pub fn new(id: u64, subject: String, receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            id,
            subject,
            receiver,
        }
    }

    /// Subscription id, used to unsubscribe.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribed subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once unsubscribed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Subject-based publish/subscribe connection.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Whether the connection is up.
    fn is_connected(&self) -> bool;

    /// Largest payload the connection accepts.
    fn max_payload(&self) -> usize;

    /// A fresh, unique reply subject.
    fn new_inbox(&self) -> String;

    /// Publish one message.
    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()>;

    /// Subscribe to a subject.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription>;

    /// Cancel a subscription.
    async fn unsubscribe(&self, id: u64) -> Result<()>;

    /// Wait until published messages have been handed off, bounded by
    /// `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}

type SubscriberMap = HashMap<u64, (String, mpsc::UnboundedSender<BusMessage>)>;

struct MemoryBusInner {
    subscriptions: Mutex<SubscriberMap>,
    next_id: AtomicU64,
    connected: AtomicBool,
    max_payload: usize,
    published: AtomicU64,
}

/// In-process [`MessageBus`]. Clones share the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl MemoryBus {
    /// Create a connected bus with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a connected bus with a custom payload limit.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(MemoryBusInner {
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                max_payload,
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate losing the connection. Existing subscriptions stay
    /// registered but no longer receive anything.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    /// Restore the connection.
    pub fn reconnect(&self) {
        self.inner.connected.store(true, Ordering::Release);
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Whether anyone is subscribed to `subject`.
    pub fn has_subscriber(&self, subject: &str) -> bool {
        self.inner
            .subscriptions
            .lock()
            .values()
            .any(|(s, _)| s == subject)
    }

    /// Number of messages accepted for delivery.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FrugalError::NotOpen("bus connection is closed".to_string()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn max_payload(&self) -> usize {
        self.inner.max_payload
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }

    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;
        if payload.len() > self.inner.max_payload {
            return Err(FrugalError::MessageSize(format!(
                "message of {} bytes exceeds bus limit {}",
                payload.len(),
                self.inner.max_payload
            )));
        }

        let targets: Vec<_> = self
            .inner
            .subscriptions
            .lock()
            .values()
            .filter(|(s, _)| s == subject)
            .map(|(_, tx)| tx.clone())
            .collect();

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let msg = BusMessage {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };
        for tx in targets {
            // Receiver may already be gone.
            let _ = tx.send(msg.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        self.ensure_connected()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscriptions
            .lock()
            .insert(id, (subject.to_string(), tx));
        Ok(BusSubscription::new(id, subject.to_string(), rx))
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.inner.subscriptions.lock().remove(&id);
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        self.ensure_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("s").await.unwrap();
        let mut b = bus.subscribe("s").await.unwrap();
        let mut other = bus.subscribe("t").await.unwrap();

        bus.publish("s", None, Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(&a.next().await.unwrap().payload[..], b"x");
        assert_eq!(&b.next().await.unwrap().payload[..], b"x");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("s").await.unwrap();

        bus.unsubscribe(sub.id()).await.unwrap();
        assert!(sub.next().await.is_none());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_bus_rejects() {
        let bus = MemoryBus::new();
        bus.disconnect();

        assert!(matches!(
            bus.publish("s", None, Bytes::new()).await,
            Err(FrugalError::NotOpen(_))
        ));
        assert!(bus.subscribe("s").await.is_err());
        assert!(bus.flush(Duration::from_secs(1)).await.is_err());

        bus.reconnect();
        assert!(bus.publish("s", None, Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_max_payload_enforced() {
        let bus = MemoryBus::with_max_payload(4);
        let err = bus
            .publish("s", None, Bytes::from_static(b"12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, FrugalError::MessageSize(_)));
    }

    #[test]
    fn test_inboxes_are_unique() {
        let bus = MemoryBus::new();
        assert_ne!(bus.new_inbox(), bus.new_inbox());
    }
}
