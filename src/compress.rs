//! Message compression pools.
//!
//! The standard compressor is zstd; additional algorithms register
//! through handler options. Decompression output is capped by the
//! handler's receive limit so a small compressed frame cannot expand
//! into an unbounded allocation.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::error::{Code, Result, RpcError};

/// Name of the always-registered compressor.
pub const COMPRESSION_ZSTD: &str = "zstd";

/// zstd compression level applied to responses.
const ZSTD_LEVEL: i32 = 3;

/// A compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Zstandard.
    Zstd,
}

impl Compression {
    /// The encoding token sent in `*-encoding` headers.
    pub fn name(self) -> &'static str {
        match self {
            Compression::Zstd => COMPRESSION_ZSTD,
        }
    }

    /// Compress a payload.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Zstd => zstd::bulk::compress(data, ZSTD_LEVEL)
                .map_err(|e| RpcError::new(Code::Internal, format!("zstd compress: {e}"))),
        }
    }

    /// Decompress a payload, failing once the output exceeds `limit`
    /// bytes (0 = unlimited).
    pub fn decompress(self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        match self {
            Compression::Zstd => decompress_zstd_with_limit(data, limit),
        }
    }
}

fn decompress_zstd_with_limit(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|e| RpcError::new(Code::InvalidArgument, format!("zstd decoder: {e}")))?;
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder
            .read(&mut buf)
            .map_err(|e| RpcError::new(Code::InvalidArgument, format!("zstd decompress: {e}")))?;
        if n == 0 {
            break;
        }
        if limit > 0 && out.len() + n > limit {
            return Err(RpcError::new(
                Code::ResourceExhausted,
                format!("decompressed message exceeds limit of {limit} bytes"),
            ));
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Immutable view of the registered compression pools, shared by all
/// protocol adapters of one handler.
///
/// Registration order is preserved for accept-encoding priorities.
#[derive(Debug, Clone)]
pub struct ReadOnlyCompressionPools {
    pools: Arc<HashMap<String, Compression>>,
    names: Arc<Vec<String>>,
}

impl ReadOnlyCompressionPools {
    pub(crate) fn new(pools: &HashMap<String, Compression>, names: &[String]) -> Self {
        Self {
            pools: Arc::new(pools.clone()),
            names: Arc::new(names.to_vec()),
        }
    }

    /// Look up a pool by encoding token. `identity` and the empty
    /// token mean no compression.
    pub fn get(&self, name: &str) -> Option<Compression> {
        self.pools.get(name).copied()
    }

    /// Whether the token names a registered pool or the identity
    /// encoding.
    pub fn contains(&self, name: &str) -> bool {
        name.is_empty() || name == "identity" || self.pools.contains_key(name)
    }

    /// Registered encoding tokens in registration order, joined for an
    /// accept-encoding style header.
    pub fn comma_separated_names(&self) -> String {
        self.names.join(", ")
    }

    /// Pick the first registered pool named in a comma-separated
    /// accept-encoding header value.
    pub fn negotiate(&self, accept: &str) -> Option<Compression> {
        for token in accept.split(',') {
            let token = token.trim();
            // Strip any quality weight.
            let token = token.split(';').next().unwrap_or(token).trim();
            if let Some(pool) = self.pools.get(token) {
                return Some(*pool);
            }
        }
        None
    }
}
