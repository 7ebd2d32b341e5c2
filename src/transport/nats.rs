//! NATS-backed message bus.
//!
//! [`NatsBus`] runs the bus transports, [`BusServer`](crate::BusServer) and
//! the scope transports on a real NATS connection. Each subscription gets a
//! forwarding task that moves messages from the NATS subscriber into the
//! [`BusSubscription`] channel until it is unsubscribed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frugal_core::transport::{BusTransport, NatsBus, Transport};
//!
//! # async fn example() -> frugal_core::Result<()> {
//! let bus = Arc::new(NatsBus::connect("nats://127.0.0.1:4222").await?);
//! let transport = BusTransport::client(bus, "calc.connect");
//! transport.open().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_nats::connection::State;
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bus::{BusMessage, BusSubscription, MessageBus};
use crate::error::{FrugalError, Result};

/// [`MessageBus`] over an `async-nats` client.
pub struct NatsBus {
    client: Client,
    subscriptions: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
}

impl NatsBus {
    /// Connect to the NATS server at `url`.
    ///
    /// # Errors
    ///
    /// `NotOpen` if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.map_err(|e| {
            FrugalError::NotOpen(format!("failed to connect to nats at {}: {}", url, e))
        })?;
        Ok(Self::from_client(client))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// The underlying NATS client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FrugalError::NotOpen("nats connection is down".to_string()))
        }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    fn max_payload(&self) -> usize {
        self.client.server_info().max_payload
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;
        let limit = self.max_payload();
        if payload.len() > limit {
            return Err(FrugalError::MessageSize(format!(
                "message of {} bytes exceeds nats max payload {}",
                payload.len(),
                limit
            )));
        }

        let result = match reply {
            Some(reply) => {
                self.client
                    .publish_with_reply(subject.to_string(), reply.to_string(), payload)
                    .await
            }
            None => self.client.publish(subject.to_string(), payload).await,
        };
        result.map_err(|e| FrugalError::Transport(format!("publish to {} failed: {}", subject, e)))
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription> {
        self.ensure_connected()?;
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| {
                FrugalError::Transport(format!("subscribe to {} failed: {}", subject, e))
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.subscriptions.insert(id, token.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    msg = subscriber.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let msg = BusMessage {
                    subject: msg.subject.to_string(),
                    reply: msg.reply.map(|r| r.to_string()),
                    payload: msg.payload,
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                tracing::debug!(error = %e, "nats unsubscribe failed");
            }
        });

        Ok(BusSubscription::new(id, subject.to_string(), rx))
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        if let Some((_, token)) = self.subscriptions.remove(&id) {
            token.cancel();
        }
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.client.flush())
            .await
            .map_err(|_| {
                FrugalError::Timeout(format!("nats flush took longer than {}ms", timeout.as_millis()))
            })?
            .map_err(|e| FrugalError::Transport(format!("nats flush failed: {}", e)))
    }
}
