//! Frame buffer for reassembling frames from partial deliveries.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForPrefix`: Need at least 4 bytes
//! - `WaitingForBody`: Prefix parsed, need N more body bytes
//!
//! Zero-length frames mark one-way calls with nothing to dispatch and are
//! consumed without being yielded.
//!
//! # Example
//!
//! ```
//! use frugal_core::protocol::{build_frame, FrameBuffer, Headers};
//!
//! let wire = build_frame(&Headers::new(), b"hello").unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&wire[..3]).unwrap().is_empty());
//! let bodies = buffer.push(&wire[3..]).unwrap();
//! assert_eq!(bodies.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::frame::{read_frame_size, FRAME_PREFIX_SIZE};
use crate::error::{FrugalError, Result};

/// Default upper bound on a single frame body (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 4-byte length prefix.
    WaitingForPrefix,
    /// Prefix parsed, waiting for body bytes.
    WaitingForBody { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frame
/// bodies.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForPrefix,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame bodies.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `MessageSize` if a declared frame exceeds the limit. The
    /// buffer is cleared in that case since the stream can no longer be
    /// trusted.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(body)) => bodies.push(body),
                Ok(None) => break,
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }
        Ok(bodies)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let size = match read_frame_size(&self.buffer) {
                        Some(size) => size,
                        None => return Ok(None),
                    };
                    if size > self.max_frame_size {
                        return Err(FrugalError::MessageSize(format!(
                            "frame size {} exceeds maximum {}",
                            size, self.max_frame_size
                        )));
                    }
                    let _ = self.buffer.split_to(FRAME_PREFIX_SIZE);
                    if size == 0 {
                        continue;
                    }
                    self.state = State::WaitingForBody { remaining: size };
                }
                State::WaitingForBody { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForPrefix;
                    return Ok(Some(body));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
