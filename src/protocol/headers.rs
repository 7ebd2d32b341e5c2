//! Header block encoding and decoding.
//!
//! A header block carries per-call context as a flat string map:
//! ```text
//! ┌─────────┬──────────┬──────────────────────────────────────────────┐
//! │ Version │ Size     │ Entries (repeated)                           │
//! │ 1 byte  │ 4 bytes  │ key len (4) │ key │ value len (4) │ value    │
//! │ 0x00    │ uint32 BE│ uint32 BE   │utf8 │ uint32 BE     │ utf8     │
//! └─────────┴──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! `Size` is the exact byte length of the entries. All lengths are Big Endian
//! and must fit a signed 32-bit int.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrugalError, Result};

/// The only defined header block version.
pub const HEADER_VERSION_V0: u8 = 0x00;

/// Version byte + size field.
pub const HEADER_PREAMBLE_SIZE: usize = 5;

/// Largest length representable in a header length field.
pub const MAX_HEADER_FIELD_LEN: usize = i32::MAX as usize;

/// Per-call header map.
pub type Headers = HashMap<String, String>;

/// Encode a header map into a version 0 header block.
///
/// # Example
///
/// ```
/// use frugal_core::protocol::{decode_headers, encode_headers, Headers};
///
/// let mut headers = Headers::new();
/// headers.insert("_opid".to_string(), "1".to_string());
/// let block = encode_headers(&headers).unwrap();
/// assert_eq!(block.len(), 5 + 8 + 5 + 1);
/// assert_eq!(decode_headers(&block).unwrap(), headers);
/// ```
pub fn encode_headers(headers: &Headers) -> Result<Bytes> {
    let mut size: usize = 0;
    for (key, value) in headers {
        if key.len() > MAX_HEADER_FIELD_LEN || value.len() > MAX_HEADER_FIELD_LEN {
            return Err(FrugalError::Protocol(format!(
                "header entry for key of {} bytes exceeds the length field",
                key.len()
            )));
        }
        size = size.saturating_add(8 + key.len() + value.len());
    }
    if size > MAX_HEADER_FIELD_LEN {
        return Err(FrugalError::Protocol(format!(
            "header block size {} exceeds maximum {}",
            size, MAX_HEADER_FIELD_LEN
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_PREAMBLE_SIZE + size);
    buf.put_u8(HEADER_VERSION_V0);
    buf.put_u32(size as u32);
    for (key, value) in headers {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    Ok(buf.freeze())
}

/// Decode a header block.
///
/// The declared size must fit in the buffer; bytes after the block are
/// ignored.
pub fn decode_headers(buf: &[u8]) -> Result<Headers> {
    let end = read_preamble(buf)?;
    read_pairs(buf, HEADER_PREAMBLE_SIZE, end)
}

/// Decode the header block at the start of a frame body.
///
/// Bytes after the block are the serialized message and are ignored.
pub fn decode_headers_from_frame(frame: &[u8]) -> Result<Headers> {
    decode_frame_headers(frame).map(|(headers, _)| headers)
}

/// Decode the header block at the start of a frame body and return it
/// together with the offset of the payload that follows it.
pub fn decode_frame_headers(frame: &[u8]) -> Result<(Headers, usize)> {
    if frame.len() < HEADER_PREAMBLE_SIZE {
        return Err(FrugalError::Protocol(format!(
            "invalid frame size {}",
            frame.len()
        )));
    }
    let end = read_preamble(frame)?;
    let headers = read_pairs(frame, HEADER_PREAMBLE_SIZE, end)?;
    Ok((headers, end))
}

/// Validate version and size, returning the end offset of the block.
fn read_preamble(buf: &[u8]) -> Result<usize> {
    if buf.len() < HEADER_PREAMBLE_SIZE {
        return Err(FrugalError::Protocol(format!(
            "header block too short: {} bytes",
            buf.len()
        )));
    }
    if buf[0] != HEADER_VERSION_V0 {
        return Err(FrugalError::Protocol(format!(
            "unsupported header version {}",
            buf[0]
        )));
    }
    let size = read_len(buf, 1)?;
    let available = buf.len() - HEADER_PREAMBLE_SIZE;
    if size > available {
        return Err(FrugalError::Protocol(format!(
            "header size {} exceeds available {} bytes",
            size, available
        )));
    }
    Ok(HEADER_PREAMBLE_SIZE + size)
}

fn read_pairs(buf: &[u8], start: usize, end: usize) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut i = start;
    while i < end {
        let (key, next) = read_field(buf, i, end, "name")?;
        let (value, next) = read_field(buf, next, end, "value")?;
        headers.insert(key, value);
        i = next;
    }
    Ok(headers)
}

/// Read one length-prefixed UTF-8 field, bounded by `end`.
fn read_field(buf: &[u8], i: usize, end: usize, what: &str) -> Result<(String, usize)> {
    if end - i < 4 {
        return Err(FrugalError::Protocol(format!(
            "truncated protocol header {} length",
            what
        )));
    }
    let len = read_len(buf, i)?;
    let start = i + 4;
    if len > end - start {
        return Err(FrugalError::Protocol(format!(
            "invalid protocol header {} size: {}",
            what, len
        )));
    }
    let field = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| FrugalError::Protocol(format!("header {} is not UTF-8: {}", what, e)))?;
    Ok((field.to_string(), start + len))
}

fn read_len(buf: &[u8], i: usize) -> Result<usize> {
    let len = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    if len as usize > MAX_HEADER_FIELD_LEN {
        return Err(FrugalError::Protocol(format!(
            "header length {} exceeds maximum {}",
            len, MAX_HEADER_FIELD_LEN
        )));
    }
    Ok(len as usize)
}
