//! Payload codecs.
//!
//! A codec turns application values into frame payloads and back. It never
//! sees frame metadata.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

/// Codec failure on a specific value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(msg) => RpcError::Encode(msg),
            CodecError::Decode(msg) => RpcError::Decode(msg),
        }
    }
}

/// Encodes and decodes application values to and from payload bytes.
///
/// Implementations must be deterministic and must report malformed input
/// as an error rather than panicking.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Short identifier, used in logs.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>;
}

/// JSON payloads via `serde_json`.
///
/// An empty payload decodes as `null`, so `()` and `Option<T>` can be read
/// from a bare terminator frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        let payload = if payload.is_empty() {
            b"null".as_slice()
        } else {
            payload
        };
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
