//! # frugal-core
//!
//! Runtime for framed RPC and pub/sub over pluggable transports.
//!
//! Calls travel as frames: a 4-byte big-endian length, a versioned header
//! block and an opaque payload. Clients correlate responses with pending
//! calls through the `_opid` header; servers answer every call that carries
//! one.
//!
//! ## Architecture
//!
//! - **Protocol**: header block codec, frames and byte-stream reassembly
//! - **Registries**: [`ClientRegistry`] for pending calls, [`ServerRegistry`]
//!   running a [`Processor`]
//! - **Transports**: stateful bus transport with handshake and heartbeats,
//!   HTTP, and connectionless publish/subscribe
//! - **Monitor**: reopens transports that go down on their own
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use frugal_core::transport::{BusTransport, MemoryBus, Transport};
//! use frugal_core::{BaseProcessor, BusServer, CallContext, ClientRegistry, FrugalClient, ServerConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = Arc::new(MemoryBus::new());
//!
//! let mut processor = BaseProcessor::new("calc");
//! processor.register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) });
//! let server = BusServer::new(bus.clone(), "calc.connect", Arc::new(processor), ServerConfig::default());
//! server.start().await.unwrap();
//!
//! let transport = Arc::new(BusTransport::client(bus, "calc.connect"));
//! transport.open().await.unwrap();
//! let client = FrugalClient::new("calc", transport, Arc::new(ClientRegistry::new()));
//!
//! let mut ctx = CallContext::new();
//! let sum: i64 = client.invoke(&mut ctx, "add", &(20, 22)).await.unwrap();
//! assert_eq!(sum, 42);
//! # });
//! ```

pub mod codec;
pub mod context;
pub mod error;
pub mod middleware;
pub mod monitor;
pub mod processor;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod watermark;

mod client;
mod server;

pub use client::{ClientMiddleware, FrugalClient};
pub use context::CallContext;
pub use error::{FrugalError, Result};
pub use processor::{BaseProcessor, Processor};
pub use registry::{ClientRegistry, Registry, ServerRegistry};
pub use server::{BusServer, ServerConfig, DEFAULT_HEARTBEAT_INTERVAL};
