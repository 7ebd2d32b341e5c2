//! Middleware chain wrapping service calls.
//!
//! An [`InvocationHandler`] is the innermost call; a [`ServiceMiddleware`]
//! takes a handler and returns a new one wrapping it. Chains are assembled
//! with [`compose_middleware`]: for `[a, b]`, `a` sees the call first, then
//! `b`, then the handler, and results travel back through `b` then `a`.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frugal_core::middleware::{compose_middleware, logging_middleware, InvocationHandler, Method};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let double: InvocationHandler<u32, u32> =
//!     Arc::new(|_method, n| Box::pin(async move { Ok(n * 2) }));
//! let chain = compose_middleware(double, &[logging_middleware()]);
//!
//! let result = chain(Method::new("math", "double"), 21).await.unwrap();
//! assert_eq!(result, 42);
//! # });
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use crate::error::Result;

/// Identifies the service method being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method {
    service: String,
    name: String,
}

impl Method {
    /// Create a method descriptor.
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
        }
    }

    /// Service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

/// A callable service method.
pub type InvocationHandler<Req, Resp> =
    Arc<dyn Fn(Method, Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync>;

/// Wraps a handler in cross-cutting behavior.
pub type ServiceMiddleware<Req, Resp> =
    Arc<dyn Fn(InvocationHandler<Req, Resp>) -> InvocationHandler<Req, Resp> + Send + Sync>;

/// Wrap `handler` in `middleware`, first element outermost.
///
/// An empty slice returns the handler unchanged.
pub fn compose_middleware<Req, Resp>(
    handler: InvocationHandler<Req, Resp>,
    middleware: &[ServiceMiddleware<Req, Resp>],
) -> InvocationHandler<Req, Resp> {
    middleware
        .iter()
        .rev()
        .fold(handler, |next, wrap| wrap(next))
}

/// Trace every call with its latency and outcome.
pub fn logging_middleware<Req, Resp>() -> ServiceMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Arc::new(
        |next: InvocationHandler<Req, Resp>| -> InvocationHandler<Req, Resp> {
            Arc::new(
                move |method: Method, req: Req| -> BoxFuture<'static, Result<Resp>> {
                    let next = next.clone();
                    Box::pin(async move {
                        let start = Instant::now();
                        let result = next(method.clone(), req).await;
                        let elapsed_ms = start.elapsed().as_millis() as u64;
                        match &result {
                            Ok(_) => tracing::debug!(%method, elapsed_ms, "call completed"),
                            Err(e) => tracing::warn!(%method, elapsed_ms, error = %e, "call failed"),
                        }
                        result
                    })
                },
            )
        },
    )
}

/// Retry failed calls up to `max_attempts` times in total, sleeping `delay`
/// between attempts.
///
/// Errors that are not retryable (see
/// [`FrugalError::is_retryable`](crate::FrugalError::is_retryable)) end the
/// loop at once. The last error is returned when attempts run out.
pub fn retry_middleware<Req, Resp>(max_attempts: u32, delay: Duration) -> ServiceMiddleware<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    let max_attempts = max_attempts.max(1);
    Arc::new(
        move |next: InvocationHandler<Req, Resp>| -> InvocationHandler<Req, Resp> {
            Arc::new(
                move |method: Method, req: Req| -> BoxFuture<'static, Result<Resp>> {
                    let next = next.clone();
                    Box::pin(async move {
                        let mut attempt = 1;
                        loop {
                            match next(method.clone(), req.clone()).await {
                                Ok(resp) => return Ok(resp),
                                Err(e) if attempt < max_attempts && e.is_retryable() => {
                                    tracing::warn!(
                                        %method,
                                        attempt,
                                        max_attempts,
                                        error = %e,
                                        "retrying call"
                                    );
                                    attempt += 1;
                                    tokio::time::sleep(delay).await;
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    })
                },
            )
        },
    )
}
