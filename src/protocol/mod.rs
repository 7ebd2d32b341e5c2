//! Protocol module - header blocks, framing, and frame reassembly.
//!
//! This module implements the wire format shared by every transport:
//! - versioned header block encoding/decoding
//! - 4-byte length-prefixed frames
//! - frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod headers;

pub use frame::{
    build_frame, prepend_frame_size, read_frame_size, strip_frame_prefix, Frame,
    FRAME_PREFIX_SIZE,
};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use headers::{
    decode_frame_headers, decode_headers, decode_headers_from_frame, encode_headers, Headers,
    HEADER_PREAMBLE_SIZE, HEADER_VERSION_V0, MAX_HEADER_FIELD_LEN,
};
