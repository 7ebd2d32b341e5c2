//! Frame struct and framing helpers.
//!
//! A frame on the wire is a 4-byte Big Endian length prefix followed by the
//! frame body: a header block and then the serialized payload. Transports
//! strip the prefix; registries see only the body.
//!
//! # Example
//!
//! ```
//! use frugal_core::protocol::{build_frame, strip_frame_prefix, Frame, Headers};
//! use bytes::Bytes;
//!
//! let mut headers = Headers::new();
//! headers.insert("_opid".to_string(), "7".to_string());
//! let wire = build_frame(&headers, b"hello").unwrap();
//!
//! let body = strip_frame_prefix(wire).unwrap();
//! let frame = Frame::decode(body).unwrap();
//! assert_eq!(frame.header("_opid"), Some("7"));
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::headers::{decode_frame_headers, encode_headers, Headers};
use crate::error::{FrugalError, Result};

/// Size of the frame length prefix.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// A decoded frame body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Decoded header block.
    pub headers: Headers,
    /// Serialized message following the header block (zero-copy).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from headers and payload.
    pub fn new(headers: Headers, payload: Bytes) -> Self {
        Self { headers, payload }
    }

    /// Decode a frame body (no length prefix).
    pub fn decode(body: Bytes) -> Result<Self> {
        let (headers, offset) = decode_frame_headers(&body)?;
        Ok(Self {
            headers,
            payload: body.slice(offset..),
        })
    }

    /// Look up a header value.
    #[inline]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode as a full wire frame, length prefix included.
    pub fn encode(&self) -> Result<Bytes> {
        build_frame(&self.headers, &self.payload)
    }
}

/// Build a complete wire frame: `[len][header block][payload]`.
pub fn build_frame(headers: &Headers, payload: &[u8]) -> Result<Bytes> {
    let block = encode_headers(headers)?;
    let body_len = block.len() + payload.len();
    let prefix = frame_size_prefix(body_len)?;

    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + body_len);
    buf.put_u32(prefix);
    buf.extend_from_slice(&block);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Read the length prefix at the start of `buf`, if present.
#[inline]
pub fn read_frame_size(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
}

/// Length prefix for a body of `body_len` bytes.
fn frame_size_prefix(body_len: usize) -> Result<u32> {
    u32::try_from(body_len).map_err(|_| {
        FrugalError::MessageSize(format!(
            "frame body of {} bytes does not fit the length prefix",
            body_len
        ))
    })
}

/// Prepend a length prefix to an already encoded frame body.
pub fn prepend_frame_size(body: &[u8]) -> Result<Bytes> {
    let prefix = frame_size_prefix(body.len())?;
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + body.len());
    buf.put_u32(prefix);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Validate that a message holds exactly one frame and return its body.
///
/// Used by message-oriented transports where one message is one frame.
pub fn strip_frame_prefix(message: Bytes) -> Result<Bytes> {
    let declared = read_frame_size(&message).ok_or_else(|| {
        FrugalError::Protocol(format!(
            "invalid frame size {}: missing length prefix",
            message.len()
        ))
    })?;
    let actual = message.len() - FRAME_PREFIX_SIZE;
    if declared != actual {
        return Err(FrugalError::Protocol(format!(
            "frame length {} does not match message body of {} bytes",
            declared, actual
        )));
    }
    Ok(message.slice(FRAME_PREFIX_SIZE..))
}
