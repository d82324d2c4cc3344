//! Codec module - serialization/deserialization for payload messages.
//!
//! Two codecs are always registered:
//!
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde` (binary, the
//!   default for bare gRPC content types)
//! - [`JsonCodec`] - JSON via `serde_json` (text)
//!
//! # Design
//!
//! The concrete codecs are marker structs with static methods; the
//! copyable [`Codec`] enum dispatches between them at runtime based on
//! the negotiated content-type suffix. Streaming conns carry a `Codec`
//! value and the typed facades encode/decode at the boundary, so the
//! frame layer only ever moves opaque bytes.

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Content-type suffix of the MessagePack codec.
pub const CODEC_NAME_MSGPACK: &str = "msgpack";

/// Content-type suffix of the JSON codec.
pub const CODEC_NAME_JSON: &str = "json";

/// A payload codec, selected per-request by content-type suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// MessagePack (binary).
    MsgPack,
    /// JSON (text).
    Json,
}

impl Codec {
    /// The content-type suffix this codec is registered under.
    pub fn name(self) -> &'static str {
        match self {
            Codec::MsgPack => CODEC_NAME_MSGPACK,
            Codec::Json => CODEC_NAME_JSON,
        }
    }

    /// Encode a message.
    pub fn encode<T: Serialize>(self, message: &T) -> Result<Vec<u8>> {
        match self {
            Codec::MsgPack => MsgPackCodec::encode(message),
            Codec::Json => JsonCodec::encode(message),
        }
    }

    /// Decode a message.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::MsgPack => MsgPackCodec::decode(bytes),
            Codec::Json => JsonCodec::decode(bytes),
        }
    }
}

/// Immutable view of the registered codecs, shared by all protocol
/// adapters of one handler.
#[derive(Debug, Clone)]
pub struct ReadOnlyCodecs {
    by_name: Arc<HashMap<String, Codec>>,
}

impl ReadOnlyCodecs {
    pub(crate) fn new(codecs: &HashMap<String, Codec>) -> Self {
        Self {
            by_name: Arc::new(codecs.clone()),
        }
    }

    /// Look up a codec by content-type suffix.
    pub fn get(&self, name: &str) -> Option<Codec> {
        self.by_name.get(name).copied()
    }

    /// Registered suffixes, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(|s| s.as_str())
    }
}
