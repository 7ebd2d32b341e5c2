//! Server registry - runs a processor for every inbound call.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::Registry;
use crate::context::{CallContext, OP_ID_HEADER};
use crate::error::Result;
use crate::processor::Processor;
use crate::protocol::{build_frame, Frame};

/// Registry handing each inbound call to a [`Processor`].
///
/// A call without an `_opid` header is one-way: its result is never written
/// back and processor errors are only logged. Two-way calls are answered
/// with a frame carrying the response headers, the request's `_opid` and
/// `_cid`, and the processor's reply payload.
pub struct ServerRegistry {
    processor: Arc<dyn Processor>,
}

impl ServerRegistry {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Registry for ServerRegistry {
    async fn execute(&self, frame: Bytes) -> Result<Option<Bytes>> {
        let frame = Frame::decode(frame)?;
        let oneway = !frame.headers.contains_key(OP_ID_HEADER);
        let mut ctx = CallContext::from_request_headers(frame.headers);

        let result = self.processor.process(&mut ctx, frame.payload).await;
        if oneway {
            if let Err(e) = result {
                tracing::warn!(cid = %ctx.correlation_id(), error = %e, "one-way call failed");
            }
            return Ok(None);
        }

        let reply = result?;
        Ok(Some(build_frame(&ctx.reply_headers(), &reply)?))
    }

    fn close(&self) {}
}
