//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map) so peers can
//! decode by field name instead of position.
//!
//! A typed call is encoded as the tuple `(method, args)` and its reply as a
//! [`ReplyEnvelope`], which carries either the result or an application error
//! message.
//!
//! # Example
//!
//! ```
//! use frugal_core::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Ping {
//!     seq: u32,
//! }
//!
//! let call = MsgPackCodec::encode_call("ping", &Ping { seq: 1 }).unwrap();
//! assert_eq!(MsgPackCodec::decode_method_name(&call).unwrap(), "ping");
//!
//! let args: Ping = MsgPackCodec::decode_call_args(&call).unwrap();
//! assert_eq!(args, Ping { seq: 1 });
//! ```

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};

use crate::error::{FrugalError, Result};

/// Reply to a typed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyEnvelope<T> {
    /// The handler returned a value.
    Success(T),
    /// The handler failed; the message is surfaced to the caller.
    ApplicationError(String),
}

impl<T> ReplyEnvelope<T> {
    /// Convert into a result, mapping application errors to
    /// [`FrugalError::Application`].
    pub fn into_result(self) -> Result<T> {
        match self {
            ReplyEnvelope::Success(value) => Ok(value),
            ReplyEnvelope::ApplicationError(message) => Err(FrugalError::Application(message)),
        }
    }
}

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a typed call as `(method, args)`.
    pub fn encode_call<T: Serialize>(method: &str, args: &T) -> Result<Vec<u8>> {
        Self::encode(&(method, args))
    }

    /// Read only the method name of an encoded call.
    pub fn decode_method_name(bytes: &[u8]) -> Result<String> {
        let (method, _): (String, IgnoredAny) = Self::decode(bytes)?;
        Ok(method)
    }

    /// Decode the arguments of an encoded call.
    pub fn decode_call_args<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let (_, args): (IgnoredAny, T) = Self::decode(bytes)?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();

        // fixmap with 3 elements, not fixarray
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_call_envelope() {
        let call = MsgPackCodec::encode_call("add", &(2i32, 3i32)).unwrap();

        // (method, args) is a 2-element array
        assert_eq!(call[0], 0x92);
        assert_eq!(MsgPackCodec::decode_method_name(&call).unwrap(), "add");
        let args: (i32, i32) = MsgPackCodec::decode_call_args(&call).unwrap();
        assert_eq!(args, (2, 3));
    }

    #[test]
    fn test_decode_method_name_rejects_garbage() {
        assert!(MsgPackCodec::decode_method_name(b"\xc0").is_err());
    }

    #[test]
    fn test_reply_envelope_success() {
        let reply = ReplyEnvelope::Success(7u64);
        let encoded = MsgPackCodec::encode(&reply).unwrap();
        let decoded: ReplyEnvelope<u64> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.into_result().unwrap(), 7);
    }

    #[test]
    fn test_reply_envelope_error_decodes_for_any_type() {
        let reply: ReplyEnvelope<()> = ReplyEnvelope::ApplicationError("boom".to_string());
        let encoded = MsgPackCodec::encode(&reply).unwrap();

        let decoded: ReplyEnvelope<TestStruct> = MsgPackCodec::decode(&encoded).unwrap();
        match decoded.into_result() {
            Err(FrugalError::Application(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }
}
