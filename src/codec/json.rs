//! JSON codec using `serde_json`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Code, Result, RpcError};

/// JSON codec for text payloads.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| RpcError::new(Code::Internal, format!("json encode: {e}")))
    }

    /// Decode JSON bytes into a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| RpcError::new(Code::InvalidArgument, format!("json decode: {e}")))
    }
}
