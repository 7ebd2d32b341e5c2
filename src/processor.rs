//! Server-side call processing.
//!
//! A [`Processor`] turns the payload of one inbound call into the payload of
//! its reply. [`BaseProcessor`] is the typed implementation: it reads the
//! method name from the MsgPack-encoded `(method, args)` call, runs the
//! registered handler through the middleware chain and encodes the result as
//! a [`ReplyEnvelope`].
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use frugal_core::codec::{MsgPackCodec, ReplyEnvelope};
//! use frugal_core::{BaseProcessor, CallContext, Processor};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut processor = BaseProcessor::new("calc");
//! processor.register("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) });
//!
//! let call = MsgPackCodec::encode_call("add", &(2, 3)).unwrap();
//! let mut ctx = CallContext::new();
//! let reply = processor.process(&mut ctx, Bytes::from(call)).await.unwrap();
//!
//! let envelope: ReplyEnvelope<i64> = MsgPackCodec::decode(&reply).unwrap();
//! assert_eq!(envelope, ReplyEnvelope::Success(5));
//! # });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{MsgPackCodec, ReplyEnvelope};
use crate::context::CallContext;
use crate::error::{FrugalError, Result};
use crate::middleware::{compose_middleware, InvocationHandler, Method, ServiceMiddleware};

/// Produces the reply payload for one inbound call.
///
/// Implementations may set response headers on `ctx`; they are framed into
/// the reply.
pub trait Processor: Send + Sync + 'static {
    fn process<'a>(&'a self, ctx: &'a mut CallContext, payload: Bytes)
        -> BoxFuture<'a, Result<Bytes>>;
}

/// Middleware over raw processor calls: `(context, encoded call)` in,
/// encoded reply out.
pub type ProcessorMiddleware = ServiceMiddleware<(CallContext, Bytes), Bytes>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle an encoded `(method, args)` call, returning the encoded reply.
    fn call(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// Wrapper that decodes call arguments and encodes the handler's result.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (Fut, R)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        let args: T = match MsgPackCodec::decode_call_args(&payload) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(ctx, args);
        Box::pin(async move {
            let value = fut.await?;
            let reply = MsgPackCodec::encode(&ReplyEnvelope::Success(value))?;
            Ok(Bytes::from(reply))
        })
    }
}

/// Processor mapping method names to typed handlers.
///
/// Handler failures and unknown methods are answered with a
/// [`ReplyEnvelope::ApplicationError`] so the caller sees them; only a call
/// whose method name cannot be read fails the processor itself.
pub struct BaseProcessor {
    service: String,
    handlers: HashMap<String, Arc<dyn Handler>>,
    middleware: Vec<ProcessorMiddleware>,
}

impl BaseProcessor {
    /// Create an empty processor for `service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handlers: HashMap::new(),
            middleware: Vec::new(),
        }
    }

    /// Service name used in middleware [`Method`]s.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register a handler taking `(CallContext, T)` and returning `R`.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub fn register<F, T, R, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.handlers
            .insert(name.to_string(), Arc::new(TypedHandler::new(handler)));
        self
    }

    /// Append a middleware. Earlier middleware runs first.
    pub fn add_middleware(&mut self, middleware: ProcessorMiddleware) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    /// Whether a handler is registered for `name`.
    pub fn has_method(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    async fn invoke(&self, ctx: &CallContext, payload: Bytes) -> Result<Bytes> {
        let name = MsgPackCodec::decode_method_name(&payload)?;
        let Some(handler) = self.handlers.get(&name).cloned() else {
            tracing::warn!(service = %self.service, method = %name, "call to unknown method");
            return application_error(format!("unknown method: {}", name));
        };

        let inner: InvocationHandler<(CallContext, Bytes), Bytes> =
            Arc::new(move |_method, (ctx, payload)| handler.call(ctx, payload));
        let chain = compose_middleware(inner, &self.middleware);
        let method = Method::new(self.service.as_str(), name);

        match chain(method.clone(), (ctx.clone(), payload)).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::debug!(%method, error = %e, "handler failed");
                let message = match e {
                    FrugalError::Application(message) => message,
                    other => other.to_string(),
                };
                application_error(message)
            }
        }
    }
}

fn application_error(message: String) -> Result<Bytes> {
    let reply = MsgPackCodec::encode(&ReplyEnvelope::<()>::ApplicationError(message))?;
    Ok(Bytes::from(reply))
}

impl Processor for BaseProcessor {
    fn process<'a>(
        &'a self,
        ctx: &'a mut CallContext,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move { self.invoke(ctx, payload).await })
    }
}
