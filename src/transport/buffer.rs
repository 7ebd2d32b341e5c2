//! Bounded write buffer shared by the buffered transports.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::{FrugalError, Result};

/// Accumulates writes until flush. A limit of 0 means unbounded.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    buf: Mutex<BytesMut>,
    limit: usize,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: Mutex::new(BytesMut::new()),
            limit,
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Append `data`. On overflow the buffer is reset and `MessageSize`
    /// returned.
    pub(crate) fn write(&self, data: &[u8]) -> Result<()> {
        let mut buf = self.buf.lock();
        if self.limit > 0 && buf.len() + data.len() > self.limit {
            let attempted = buf.len() + data.len();
            buf.clear();
            return Err(FrugalError::MessageSize(format!(
                "buffer size {} exceeds limit {}",
                attempted, self.limit
            )));
        }
        buf.extend_from_slice(data);
        Ok(())
    }

    /// Take everything buffered so far, leaving the buffer empty.
    pub(crate) fn take(&self) -> Bytes {
        self.buf.lock().split().freeze()
    }

    pub(crate) fn clear(&self) {
        self.buf.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.lock().len()
    }
}
