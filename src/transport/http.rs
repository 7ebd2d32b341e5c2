//! HTTP transport - one POST per flushed frame.
//!
//! The request body is the base64 encoding of the buffered frame (length
//! prefix included). The response body is base64 too and carries either a
//! reply frame or, for one-way calls, a bare zero length prefix.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use frugal_core::transport::{HttpClient, HttpResponse, HttpTransportBuilder, Transport};
//! use frugal_core::Result;
//!
//! struct Accepting;
//!
//! #[async_trait]
//! impl HttpClient for Accepting {
//!     async fn post(&self, _url: &str, _headers: &[(&str, String)], _body: String) -> Result<HttpResponse> {
//!         // base64 of a zero length prefix: a one-way acknowledgement
//!         Ok(HttpResponse { status: 200, body: Bytes::from_static(b"AAAAAA==") })
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let transport = HttpTransportBuilder::new("http://localhost/frugal", Arc::new(Accepting))
//!     .with_request_size_limit(1024)
//!     .build();
//! transport.write(&[0, 0, 0, 1, 7]).unwrap();
//! transport.flush().await.unwrap();
//! # });
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::buffer::OutputBuffer;
use super::dispatch::DispatchState;
use super::{CloseCause, CloseNotifier, Transport};
use crate::error::{FrugalError, Result};
use crate::protocol::{read_frame_size, FRAME_PREFIX_SIZE};
use crate::registry::Registry;

/// Content type of frugal request and response bodies.
pub const FRUGAL_CONTENT_TYPE: &str = "application/x-frugal";

/// Request header announcing the largest response the client accepts.
pub const PAYLOAD_LIMIT_HEADER: &str = "x-frugal-payload-limit";

const STATUS_OK: u16 = 200;
const STATUS_PAYLOAD_TOO_LARGE: u16 = 413;

/// Status and raw body of an HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Point-to-point HTTP client used by [`HttpTransport`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST `body` to `url` with the given headers.
    async fn post(&self, url: &str, headers: &[(&str, String)], body: String)
        -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestClient {
    /// Create a client with reqwest defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already configured reqwest client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: String,
    ) -> Result<HttpResponse> {
        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| FrugalError::Transport(format!("http request failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| FrugalError::Transport(format!("failed to read http response: {}", e)))?;
        Ok(HttpResponse { status, body })
    }
}

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
    url: String,
    client: Arc<dyn HttpClient>,
    request_size_limit: usize,
    response_size_limit: usize,
}

impl HttpTransportBuilder {
    /// Start a builder for `url` with unlimited request and response sizes.
    pub fn new(url: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        Self {
            url: url.into(),
            client,
            request_size_limit: 0,
            response_size_limit: 0,
        }
    }

    /// Start a builder using a default [`ReqwestClient`].
    #[cfg(feature = "reqwest")]
    pub fn with_reqwest(url: impl Into<String>) -> Self {
        Self::new(url, Arc::new(ReqwestClient::new()))
    }

    /// Largest request frame, prefix included. 0 means unlimited.
    pub fn with_request_size_limit(mut self, limit: usize) -> Self {
        self.request_size_limit = limit;
        self
    }

    /// Largest response frame accepted. 0 means unlimited.
    pub fn with_response_size_limit(mut self, limit: usize) -> Self {
        self.response_size_limit = limit;
        self
    }

    pub fn build(self) -> HttpTransport {
        HttpTransport {
            url: self.url,
            client: self.client,
            output: OutputBuffer::new(self.request_size_limit),
            response_size_limit: self.response_size_limit,
            dispatch: DispatchState::new(),
            notifier: CloseNotifier::new(),
        }
    }
}

/// Stateless request/response transport.
///
/// Replies are handed to the registry inline during `flush`, so a call's
/// response is dispatched before `flush` returns.
pub struct HttpTransport {
    url: String,
    client: Arc<dyn HttpClient>,
    output: OutputBuffer,
    response_size_limit: usize,
    dispatch: DispatchState,
    notifier: CloseNotifier,
}

impl HttpTransport {
    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Frames processed later than the high watermark allows.
    pub fn overload_count(&self) -> u64 {
        self.dispatch.overload_count()
    }

    fn request_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("content-type", FRUGAL_CONTENT_TYPE.to_string()),
            ("content-transfer-encoding", "base64".to_string()),
            ("accept", FRUGAL_CONTENT_TYPE.to_string()),
        ];
        if self.response_size_limit > 0 {
            headers.push((PAYLOAD_LIMIT_HEADER, self.response_size_limit.to_string()));
        }
        headers
    }

    /// Validate a decoded response and return the frame body, or `None` for
    /// a one-way acknowledgement.
    fn response_frame(&self, decoded: Vec<u8>) -> Result<Option<Bytes>> {
        let declared = read_frame_size(&decoded).ok_or_else(|| {
            FrugalError::Transport(format!(
                "http response of {} bytes is missing its frame size",
                decoded.len()
            ))
        })?;
        let remaining = decoded.len() - FRAME_PREFIX_SIZE;
        if declared != remaining {
            return Err(FrugalError::Transport(format!(
                "http response frame size {} does not match body size {}",
                declared, remaining
            )));
        }
        if declared == 0 {
            return Ok(None);
        }
        if self.response_size_limit > 0 && declared > self.response_size_limit {
            return Err(FrugalError::MessageSize(format!(
                "response frame of {} bytes exceeds limit {}",
                declared, self.response_size_limit
            )));
        }
        Ok(Some(Bytes::from(decoded).slice(FRAME_PREFIX_SIZE..)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn is_open(&self) -> bool {
        true
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.notifier.notify(None);
        Ok(())
    }

    fn set_registry(&self, registry: Arc<dyn Registry>) {
        self.dispatch.set_registry(registry);
    }

    fn set_high_watermark(&self, watermark: Duration) {
        self.dispatch.set_high_watermark(watermark);
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.output.write(data)
    }

    async fn flush(&self) -> Result<()> {
        let frame = self.output.take();
        if frame.is_empty() {
            return Ok(());
        }

        let body = STANDARD.encode(&frame);
        let headers = self.request_headers();
        let response = self.client.post(&self.url, &headers, body).await?;

        match response.status {
            STATUS_OK => {}
            STATUS_PAYLOAD_TOO_LARGE => {
                return Err(FrugalError::MessageSize(format!(
                    "request of {} bytes rejected by server as too large",
                    frame.len()
                )))
            }
            status => {
                return Err(FrugalError::Transport(format!(
                    "http request failed with status {}",
                    status
                )))
            }
        }

        let decoded = STANDARD.decode(&response.body)?;
        match self.response_frame(decoded)? {
            Some(body) => {
                let arrived = Instant::now();
                self.dispatch.dispatch(body, arrived).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn closed(&self) -> broadcast::Receiver<CloseCause> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::prepend_frame_size;
    use parking_lot::Mutex;

    struct Request {
        headers: Vec<(String, String)>,
        body: String,
    }

    struct FakeClient {
        status: u16,
        body: Bytes,
        requests: Mutex<Vec<Request>>,
    }

    impl FakeClient {
        fn replying(status: u16, raw: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: Bytes::from(STANDARD.encode(raw)),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn post(
            &self,
            _url: &str,
            headers: &[(&str, String)],
            body: String,
        ) -> Result<HttpResponse> {
            self.requests.lock().push(Request {
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                body,
            });
            Ok(HttpResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    struct Capture {
        frames: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Registry for Capture {
        async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>> {
            self.frames.lock().push(frame);
            Ok(None)
        }

        fn close(&self) {}
    }

    fn capture() -> Arc<Capture> {
        Arc::new(Capture {
            frames: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_empty_flush_makes_no_request() {
        let client = FakeClient::replying(200, &[0, 0, 0, 0]);
        let transport = HttpTransportBuilder::new("http://x", client.clone()).build();

        transport.flush().await.unwrap();
        assert!(client.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_request_body_and_headers() {
        let client = FakeClient::replying(200, &[0, 0, 0, 0]);
        let transport = HttpTransportBuilder::new("http://x", client.clone())
            .with_response_size_limit(2048)
            .build();

        let frame = prepend_frame_size(b"call").unwrap();
        transport.write(&frame).unwrap();
        transport.flush().await.unwrap();

        let requests = client.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(STANDARD.decode(&requests[0].body).unwrap(), frame.to_vec());
        let header = |name: &str| {
            requests[0]
                .headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("content-type").as_deref(), Some(FRUGAL_CONTENT_TYPE));
        assert_eq!(header("content-transfer-encoding").as_deref(), Some("base64"));
        assert_eq!(header("accept").as_deref(), Some(FRUGAL_CONTENT_TYPE));
        assert_eq!(header(PAYLOAD_LIMIT_HEADER).as_deref(), Some("2048"));
    }

    #[tokio::test]
    async fn test_no_limit_header_without_response_limit() {
        let client = FakeClient::replying(200, &[0, 0, 0, 0]);
        let transport = HttpTransportBuilder::new("http://x", client.clone()).build();

        transport.write(b"abcd").unwrap();
        transport.flush().await.unwrap();

        let requests = client.requests.lock();
        assert!(requests[0].headers.iter().all(|(k, _)| k != PAYLOAD_LIMIT_HEADER));
    }

    #[tokio::test]
    async fn test_request_limit() {
        let client = FakeClient::replying(200, &[0, 0, 0, 0]);
        let transport = HttpTransportBuilder::new("http://x", client)
            .with_request_size_limit(4)
            .build();

        assert!(matches!(
            transport.write(b"12345"),
            Err(FrugalError::MessageSize(_))
        ));
    }

    #[tokio::test]
    async fn test_response_dispatched_to_registry() {
        let client = FakeClient::replying(200, &prepend_frame_size(b"reply").unwrap());
        let transport = HttpTransportBuilder::new("http://x", client).build();
        let registry = capture();
        transport.set_registry(registry.clone());

        transport.write(b"data").unwrap();
        transport.flush().await.unwrap();

        assert_eq!(&registry.frames.lock()[0][..], b"reply");
    }

    #[tokio::test]
    async fn test_oneway_response_not_dispatched() {
        let client = FakeClient::replying(200, &[0, 0, 0, 0]);
        let transport = HttpTransportBuilder::new("http://x", client).build();
        let registry = capture();
        transport.set_registry(registry.clone());

        transport.write(b"data").unwrap();
        transport.flush().await.unwrap();

        assert!(registry.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_status_errors() {
        let transport =
            HttpTransportBuilder::new("http://x", FakeClient::replying(413, b"")).build();
        transport.write(b"data").unwrap();
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::MessageSize(_))
        ));

        let transport =
            HttpTransportBuilder::new("http://x", FakeClient::replying(500, b"")).build();
        transport.write(b"data").unwrap();
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_responses() {
        let transport =
            HttpTransportBuilder::new("http://x", FakeClient::replying(200, &[0, 0])).build();
        transport.write(b"data").unwrap();
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::Transport(_))
        ));

        let transport =
            HttpTransportBuilder::new("http://x", FakeClient::replying(200, &[0, 0, 0, 9, 1]))
                .build();
        transport.write(b"data").unwrap();
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_size_with_trailing_bytes_rejected() {
        let client = FakeClient::replying(200, &[0, 0, 0, 0, 0xAA, 0xBB]);
        let transport = HttpTransportBuilder::new("http://x", client).build();
        let registry = capture();
        transport.set_registry(registry.clone());

        transport.write(b"data").unwrap();
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::Transport(_))
        ));
        assert!(registry.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_response_limit() {
        let client = FakeClient::replying(200, &prepend_frame_size(b"too long").unwrap());
        let transport = HttpTransportBuilder::new("http://x", client)
            .with_response_size_limit(4)
            .build();
        let registry = capture();
        transport.set_registry(registry.clone());

        transport.write(b"data").unwrap();
        assert!(matches!(
            transport.flush().await,
            Err(FrugalError::MessageSize(_))
        ));
        assert!(registry.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_always_open() {
        let transport =
            HttpTransportBuilder::new("http://x", FakeClient::replying(200, b"")).build();
        assert!(transport.is_open());
        transport.open().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_open());
    }
}
