//! Per-call context carried across the wire.
//!
//! A [`CallContext`] holds the registry-assigned op id, the request headers
//! sent with a call and the response headers read back from the reply.
//! Three header keys are reserved:
//! - `_opid` - op id used by the client registry to correlate responses
//! - `_cid` - caller-visible correlation id
//! - `_timeout` - per-call timeout in milliseconds
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use frugal_core::CallContext;
//!
//! let mut ctx = CallContext::with_correlation_id("abc");
//! ctx.set_request_header("user", "alice");
//! ctx.set_timeout(Duration::from_millis(250));
//!
//! assert_eq!(ctx.correlation_id(), "abc");
//! assert_eq!(ctx.request_header("_timeout"), Some("250"));
//! assert_eq!(ctx.op_id(), 0);
//! ```

use std::time::Duration;

use crate::protocol::Headers;

/// Header carrying the registry op id.
pub const OP_ID_HEADER: &str = "_opid";

/// Header carrying the correlation id.
pub const CID_HEADER: &str = "_cid";

/// Header carrying the call timeout in milliseconds.
pub const TIMEOUT_HEADER: &str = "_timeout";

/// Timeout applied when `_timeout` is absent or unparsable.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Context for a single call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    op_id: u64,
    request_headers: Headers,
    response_headers: Headers,
}

impl CallContext {
    /// Create a context with a random correlation id.
    pub fn new() -> Self {
        Self::with_correlation_id(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a context with the given correlation id.
    pub fn with_correlation_id(cid: impl Into<String>) -> Self {
        let mut request_headers = Headers::new();
        request_headers.insert(CID_HEADER.to_string(), cid.into());
        request_headers.insert(
            TIMEOUT_HEADER.to_string(),
            DEFAULT_CALL_TIMEOUT.as_millis().to_string(),
        );
        Self {
            op_id: 0,
            request_headers,
            response_headers: Headers::new(),
        }
    }

    /// Rebuild a context from decoded request headers (server side).
    ///
    /// A missing `_cid` is replaced by a fresh one; an unparsable `_opid`
    /// leaves the op id at 0.
    pub fn from_request_headers(mut headers: Headers) -> Self {
        let op_id = headers
            .get(OP_ID_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if !headers.contains_key(CID_HEADER) {
            headers.insert(
                CID_HEADER.to_string(),
                uuid::Uuid::new_v4().simple().to_string(),
            );
        }
        Self {
            op_id,
            request_headers: headers,
            response_headers: Headers::new(),
        }
    }

    /// Registry-assigned op id, 0 until registered.
    #[inline]
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    /// Assign the op id and mirror it into the `_opid` request header.
    pub(crate) fn set_op_id(&mut self, op_id: u64) {
        self.op_id = op_id;
        self.request_headers
            .insert(OP_ID_HEADER.to_string(), op_id.to_string());
    }

    /// Forget the op id. The context may then be registered again.
    pub(crate) fn clear_op_id(&mut self) {
        self.op_id = 0;
        self.request_headers.remove(OP_ID_HEADER);
    }

    /// Correlation id for this call.
    pub fn correlation_id(&self) -> &str {
        self.request_headers
            .get(CID_HEADER)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Per-call timeout from the `_timeout` header.
    pub fn timeout(&self) -> Duration {
        self.request_headers
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    /// Set the per-call timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_headers
            .insert(TIMEOUT_HEADER.to_string(), timeout.as_millis().to_string());
        self
    }

    /// Set a request header.
    pub fn set_request_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.request_headers.insert(key.into(), value.into());
        self
    }

    /// Get a request header.
    pub fn request_header(&self, key: &str) -> Option<&str> {
        self.request_headers.get(key).map(String::as_str)
    }

    /// All request headers, reserved keys included.
    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    /// Set a response header.
    pub fn set_response_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.response_headers.insert(key.into(), value.into());
        self
    }

    /// Get a response header.
    pub fn response_header(&self, key: &str) -> Option<&str> {
        self.response_headers.get(key).map(String::as_str)
    }

    /// All response headers.
    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// Replace the response headers with those decoded from a reply.
    pub fn set_response_headers(&mut self, headers: Headers) {
        self.response_headers = headers;
    }

    /// Response headers for a reply to this context: the caller's headers
    /// plus the request's `_opid` and `_cid`.
    pub(crate) fn reply_headers(&self) -> Headers {
        let mut headers = self.response_headers.clone();
        for key in [OP_ID_HEADER, CID_HEADER] {
            if let Some(value) = self.request_headers.get(key) {
                headers.insert(key.to_string(), value.clone());
            }
        }
        headers
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}
