//! Codec module - serialization of typed call payloads.
//!
//! The registries and transports only move opaque bytes. Typed helpers
//! ([`FrugalClient::invoke`](crate::FrugalClient::invoke) and
//! [`BaseProcessor`](crate::BaseProcessor)) encode arguments and replies with
//! [`MsgPackCodec`].
//!
//! # Example
//!
//! ```
//! use frugal_core::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::{MsgPackCodec, ReplyEnvelope};
