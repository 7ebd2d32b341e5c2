//! Client side of a service: framed calls over a transport.
//!
//! [`FrugalClient`] registers every two-way call with a [`ClientRegistry`],
//! writes the framed request and waits for whichever comes first:
//! 1. The correlated response frame
//! 2. Registry close (`Interrupted`)
//! 3. The context's `_timeout` (`Timeout`)
//!
//! Typed calls go through [`FrugalClient::invoke`], which encodes
//! `(method, args)` with MsgPack, runs the middleware chain and decodes the
//! [`ReplyEnvelope`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frugal_core::{CallContext, ClientRegistry, FrugalClient};
//! use frugal_core::transport::{BusTransport, MemoryBus, Transport};
//!
//! # async fn example() -> frugal_core::Result<()> {
//! let bus = Arc::new(MemoryBus::new());
//! let transport = Arc::new(BusTransport::client(bus, "calc.connect"));
//! transport.open().await?;
//!
//! let client = FrugalClient::new("calc", transport, Arc::new(ClientRegistry::new()));
//! let mut ctx = CallContext::new();
//! let sum: i64 = client.invoke(&mut ctx, "add", &(2, 3)).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::{MsgPackCodec, ReplyEnvelope};
use crate::context::{CallContext, OP_ID_HEADER};
use crate::error::{FrugalError, Result};
use crate::middleware::{compose_middleware, InvocationHandler, Method, ServiceMiddleware};
use crate::protocol::{build_frame, Frame};
use crate::registry::{ClientRegistry, ResponseCallback};
use crate::transport::Transport;

/// Middleware over client calls: `(context, encoded call)` in, response
/// frame out.
pub type ClientMiddleware = ServiceMiddleware<(CallContext, Bytes), Frame>;

/// Transport, registry and the lock serializing writes on them.
struct Channel {
    transport: Arc<dyn Transport>,
    registry: Arc<ClientRegistry>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Channel {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.transport.write(frame)?;
        self.transport.flush().await
    }

    async fn request(&self, ctx: &mut CallContext, payload: &[u8]) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let callback: ResponseCallback = Arc::new(move |frame| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(frame);
            }
            Ok(())
        });

        let token = self.registry.register(ctx, callback)?;
        let result = self.exchange(ctx, payload, rx, token).await;
        self.registry.unregister(ctx);
        ctx.clear_op_id();

        let frame = result?;
        ctx.set_response_headers(frame.headers.clone());
        Ok(frame)
    }

    async fn exchange(
        &self,
        ctx: &CallContext,
        payload: &[u8],
        rx: oneshot::Receiver<Frame>,
        token: CancellationToken,
    ) -> Result<Frame> {
        let frame = build_frame(ctx.request_headers(), payload)?;

        // The deadline and the close token cover the send too: HTTP does the
        // whole round trip inside flush.
        let timeout = ctx.timeout();
        let round_trip = async {
            self.send(&frame).await?;
            rx.await.map_err(|_| FrugalError::Interrupted)
        };
        tokio::select! {
            biased;
            result = tokio::time::timeout(timeout, round_trip) => match result {
                Ok(reply) => reply,
                Err(_) => Err(FrugalError::Timeout(format!(
                    "call {} got no response within {}ms",
                    ctx.correlation_id(),
                    timeout.as_millis()
                ))),
            },
            _ = token.cancelled() => Err(FrugalError::Interrupted),
        }
    }

    async fn oneway(&self, ctx: &CallContext, payload: &[u8]) -> Result<()> {
        let mut headers = ctx.request_headers().clone();
        headers.remove(OP_ID_HEADER);
        let frame = build_frame(&headers, payload)?;
        self.send(&frame).await
    }
}

/// Issues calls to one service over a transport.
///
/// Calls may be made concurrently from many tasks; writes to the transport
/// are serialized internally.
pub struct FrugalClient {
    service: String,
    channel: Arc<Channel>,
    middleware: Vec<ClientMiddleware>,
}

impl FrugalClient {
    /// Create a client for `service`. Installs `registry` on the transport.
    pub fn new(
        service: impl Into<String>,
        transport: Arc<dyn Transport>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        transport.set_registry(registry.clone());
        Self {
            service: service.into(),
            channel: Arc::new(Channel {
                transport,
                registry,
                write_lock: tokio::sync::Mutex::new(()),
            }),
            middleware: Vec::new(),
        }
    }

    /// Append a middleware around typed calls. Earlier middleware runs
    /// first.
    pub fn with_middleware(mut self, middleware: ClientMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.channel.transport
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.channel.registry
    }

    /// Send a raw two-way call and wait for its response frame.
    ///
    /// The response headers are copied into `ctx`. The context is
    /// unregistered whatever the outcome, so it can be reused.
    ///
    /// # Errors
    ///
    /// `ContextAlreadyRegistered` if `ctx` is in flight elsewhere,
    /// `Interrupted` if the registry closes first, `Timeout` after the
    /// context's timeout, or any write/flush error of the transport.
    pub async fn request(&self, ctx: &mut CallContext, payload: &[u8]) -> Result<Frame> {
        self.channel.request(ctx, payload).await
    }

    /// Send a raw one-way call. No `_opid` is sent and nothing is awaited.
    pub async fn oneway(&self, ctx: &CallContext, payload: &[u8]) -> Result<()> {
        self.channel.oneway(ctx, payload).await
    }

    /// Call `method` with typed arguments and decode the typed result.
    ///
    /// Application errors raised by the remote handler surface as
    /// [`FrugalError::Application`].
    pub async fn invoke<Req, Resp>(
        &self,
        ctx: &mut CallContext,
        method: &str,
        args: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = Bytes::from(MsgPackCodec::encode_call(method, args)?);

        let channel = self.channel.clone();
        let inner: InvocationHandler<(CallContext, Bytes), Frame> =
            Arc::new(move |_method, (mut ctx, payload): (CallContext, Bytes)| {
                let channel = channel.clone();
                Box::pin(async move { channel.request(&mut ctx, &payload).await })
            });
        let chain = compose_middleware(inner, &self.middleware);

        let method = Method::new(self.service.as_str(), method);
        let frame = chain(method, (ctx.clone(), payload)).await?;
        ctx.set_response_headers(frame.headers.clone());

        let envelope: ReplyEnvelope<Resp> = MsgPackCodec::decode(frame.payload())?;
        envelope.into_result()
    }

    /// Call `method` one-way with typed arguments.
    pub async fn invoke_oneway<Req: Serialize>(
        &self,
        ctx: &CallContext,
        method: &str,
        args: &Req,
    ) -> Result<()> {
        let payload = MsgPackCodec::encode_call(method, args)?;
        self.channel.oneway(ctx, &payload).await
    }
}
