//! MessagePack codec using `rmp-serde`.
//!
//! Uses `to_vec_named` so structs serialize as maps with field names.
//! Positional (array) encoding would break cross-language peers that
//! decode into keyed objects, and it makes payloads fragile under
//! field reordering.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Code, Result, RpcError};

/// MessagePack codec for binary payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MessagePack bytes (struct-as-map format).
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value)
            .map_err(|e| RpcError::new(Code::Internal, format!("msgpack encode: {e}")))
    }

    /// Decode MessagePack bytes into a value.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| RpcError::new(Code::InvalidArgument, format!("msgpack decode: {e}")))
    }
}
