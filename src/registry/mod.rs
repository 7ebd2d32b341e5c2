//! Registries - routing of inbound frame bodies.
//!
//! A transport owns exactly one [`Registry`] at a time and hands it every
//! inbound frame body in arrival order:
//! - [`ClientRegistry`] correlates responses with pending calls by `_opid`
//! - [`ServerRegistry`] runs a [`Processor`](crate::Processor) and frames the
//!   reply for two-way calls

mod client;
mod server;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use client::{ClientRegistry, ResponseCallback};
pub use server::ServerRegistry;

/// Destination for inbound frame bodies.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Handle one frame body (header block followed by payload).
    ///
    /// Returns a complete wire frame to write back, if any.
    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>>;

    /// Release all pending state.
    fn close(&self);
}
