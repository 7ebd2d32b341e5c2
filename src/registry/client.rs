//! Client registry - multiplexes concurrent calls over one transport.
//!
//! Every registered call gets a fresh op id from an atomic counter. Entries
//! live in a sharded [`DashMap`] so concurrent callers never contend on a
//! single lock. Inbound responses are routed by their `_opid` header.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::Registry;
use crate::context::{CallContext, OP_ID_HEADER};
use crate::error::{FrugalError, Result};
use crate::protocol::Frame;

/// Callback invoked with the decoded response frame of a call.
pub type ResponseCallback = Arc<dyn Fn(Frame) -> Result<()> + Send + Sync>;

struct Entry {
    callback: ResponseCallback,
    token: CancellationToken,
}

/// Registry of in-flight client calls.
pub struct ClientRegistry {
    handlers: DashMap<u64, Entry>,
    next_op_id: Arc<AtomicU64>,
    dropped_frames: AtomicU64,
}

impl ClientRegistry {
    /// Create a registry with its own op id counter.
    pub fn new() -> Self {
        Self::with_counter(Arc::new(AtomicU64::new(0)))
    }

    /// Create a registry drawing op ids from a shared counter.
    pub fn with_counter(counter: Arc<AtomicU64>) -> Self {
        Self {
            handlers: DashMap::new(),
            next_op_id: counter,
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Register a call.
    ///
    /// Assigns the next op id to `ctx` (and its `_opid` header) and stores the
    /// callback. The returned token is cancelled when the registry closes.
    ///
    /// # Errors
    ///
    /// `ContextAlreadyRegistered` if the context's current op id is still
    /// registered.
    pub fn register(
        &self,
        ctx: &mut CallContext,
        callback: ResponseCallback,
    ) -> Result<CancellationToken> {
        let current = ctx.op_id();
        if current != 0 && self.handlers.contains_key(&current) {
            return Err(FrugalError::ContextAlreadyRegistered(current));
        }

        let op_id = self.next_op_id.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CancellationToken::new();
        ctx.set_op_id(op_id);
        self.handlers.insert(
            op_id,
            Entry {
                callback,
                token: token.clone(),
            },
        );
        Ok(token)
    }

    /// Remove the context's entry. No-op if it is not registered.
    pub fn unregister(&self, ctx: &CallContext) {
        let op_id = ctx.op_id();
        if op_id != 0 {
            self.handlers.remove(&op_id);
        }
    }

    /// Number of calls currently registered.
    pub fn pending(&self) -> usize {
        self.handlers.len()
    }

    /// Number of responses dropped because no call was registered for them.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        let raw = frame.header(OP_ID_HEADER).ok_or_else(|| {
            FrugalError::Protocol(format!("frame missing {} header", OP_ID_HEADER))
        })?;
        let op_id: u64 = raw.parse().map_err(|_| {
            FrugalError::Protocol(format!("invalid {} header: {:?}", OP_ID_HEADER, raw))
        })?;

        // Clone out so the shard lock is released before the callback runs.
        let callback = match self.handlers.get(&op_id) {
            Some(entry) => entry.callback.clone(),
            None => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(op_id, "dropping response for unregistered call");
                return Ok(());
            }
        };
        callback(frame)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for ClientRegistry {
    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>> {
        let frame = Frame::decode(frame)?;
        self.dispatch(frame)?;
        Ok(None)
    }

    fn close(&self) {
        // Cancel and remove under the same shard lock, so a concurrent
        // register is either interrupted here or left registered.
        self.handlers.retain(|_, entry| {
            entry.token.cancel();
            false
        });
    }
}
