//! Dedicated dispatch task feeding inbound frames to the registry.
//!
//! ```text
//! Listener ─► mpsc::Sender<Inbound> ─► Dispatch Task ─► Registry::execute
//!                                              │
//!                                              └─► Responder (two-way replies)
//! ```
//!
//! One task per transport keeps frames in arrival order. The registry is
//! looked up per frame, so swapping it takes effect for the next frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FrugalError, Result};
use crate::registry::Registry;
use crate::watermark::Watermark;

/// Channel capacity between a listener and its dispatch task.
pub(crate) const DEFAULT_DISPATCH_CAPACITY: usize = 1024;

/// Writes a framed reply produced by the registry back to the peer.
pub(crate) type Responder = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registry slot and watermark of one transport.
pub(crate) struct DispatchState {
    registry: RwLock<Option<Arc<dyn Registry>>>,
    watermark: Watermark,
}

impl DispatchState {
    pub(crate) fn new() -> Self {
        Self {
            registry: RwLock::new(None),
            watermark: Watermark::default(),
        }
    }

    pub(crate) fn set_registry(&self, registry: Arc<dyn Registry>) {
        *self.registry.write() = Some(registry);
    }

    pub(crate) fn registry(&self) -> Option<Arc<dyn Registry>> {
        self.registry.read().clone()
    }

    pub(crate) fn set_high_watermark(&self, watermark: Duration) {
        self.watermark.set(watermark);
    }

    pub(crate) fn overload_count(&self) -> u64 {
        self.watermark.overload_count()
    }

    /// Hand one frame body to the current registry.
    pub(crate) async fn dispatch(&self, body: Bytes, arrived: Instant) -> Result<Option<Bytes>> {
        self.watermark.check(arrived);
        let registry = self
            .registry()
            .ok_or_else(|| FrugalError::NotOpen("no registry set on transport".to_string()))?;
        registry.execute(body).await
    }
}

/// A frame body stamped with its arrival time.
struct Inbound {
    body: Bytes,
    arrived: Instant,
}

/// Sending side of a dispatch task.
#[derive(Clone)]
pub(crate) struct DispatchHandle {
    tx: mpsc::Sender<Inbound>,
}

impl DispatchHandle {
    /// Queue a frame body. Returns `false` once the dispatch task is gone.
    pub(crate) async fn send(&self, body: Bytes) -> bool {
        let inbound = Inbound {
            body,
            arrived: Instant::now(),
        };
        self.tx.send(inbound).await.is_ok()
    }
}

/// Spawn the dispatch task. It stops when `token` is cancelled or every
/// handle is dropped.
pub(crate) fn spawn_dispatcher(
    state: Arc<DispatchState>,
    responder: Responder,
    token: CancellationToken,
) -> (DispatchHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(DEFAULT_DISPATCH_CAPACITY);
    let task = tokio::spawn(dispatch_loop(rx, state, responder, token));
    (DispatchHandle { tx }, task)
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Inbound>,
    state: Arc<DispatchState>,
    responder: Responder,
    token: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            inbound = rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        match state.dispatch(inbound.body, inbound.arrived).await {
            Ok(Some(reply)) => {
                if let Err(e) = responder(reply).await {
                    tracing::warn!(error = %e, "failed to write reply");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to process frame"),
        }
    }
    tracing::trace!("dispatch task stopped");
}
