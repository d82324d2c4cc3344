//! Per-handler configuration assembly.
//!
//! A handler's configuration starts from stamped-in defaults (both
//! payload codecs, the standard compressor, gRPC and gRPC-Web enabled,
//! a fresh buffer pool), then applies the user's options in order, and
//! finally freezes into the ordered protocol-adapter list. Codecs and
//! compression pools reach the adapters as read-only views so nothing
//! can mutate after construction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::codec::{Codec, ReadOnlyCodecs, CODEC_NAME_JSON, CODEC_NAME_MSGPACK};
use crate::compress::{Compression, ReadOnlyCompressionPools, COMPRESSION_ZSTD};
use crate::envelope::{Spec, StreamType};
use crate::interceptor::Interceptor;
use crate::protocol::{
    extract_rpc_path, ConnectHandler, GrpcHandler, ProtocolHandler, ProtocolHandlerParams,
};

/// Fluent options accepted by every handler constructor.
///
/// Setters are applied to the configuration in call order.
#[derive(Default)]
pub struct HandlerOptions {
    codecs: Vec<(String, Codec)>,
    compressions: Vec<Compression>,
    compress_min_bytes: Option<usize>,
    interceptor: Option<Arc<dyn Interceptor>>,
    grpc: Option<bool>,
    grpc_web: Option<bool>,
    read_max_bytes: Option<usize>,
    send_max_bytes: Option<usize>,
    buffer_pool: Option<Arc<BufferPool>>,
}

impl HandlerOptions {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec under a content-type suffix, replacing any
    /// codec already registered under it.
    pub fn with_codec(mut self, suffix: impl Into<String>, codec: Codec) -> Self {
        self.codecs.push((suffix.into(), codec));
        self
    }

    /// Register an additional compression pool. Registration order
    /// sets accept-encoding priority.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compressions.push(compression);
        self
    }

    /// Only compress response messages of at least `min` bytes.
    pub fn with_compress_min_bytes(mut self, min: usize) -> Self {
        self.compress_min_bytes = Some(min);
        self
    }

    /// Wrap the handler with an interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Enable or disable the gRPC adapter (enabled by default).
    pub fn with_grpc(mut self, enabled: bool) -> Self {
        self.grpc = Some(enabled);
        self
    }

    /// Enable or disable the gRPC-Web adapter (enabled by default).
    pub fn with_grpc_web(mut self, enabled: bool) -> Self {
        self.grpc_web = Some(enabled);
        self
    }

    /// Cap the size of received messages (0 = unlimited).
    pub fn with_read_max_bytes(mut self, max: usize) -> Self {
        self.read_max_bytes = Some(max);
        self
    }

    /// Cap the size of sent messages (0 = unlimited).
    pub fn with_send_max_bytes(mut self, max: usize) -> Self {
        self.send_max_bytes = Some(max);
        self
    }

    /// Share a buffer pool across handlers instead of allocating a
    /// fresh one.
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }
}

/// The frozen per-handler configuration.
pub(crate) struct HandlerConfig {
    pub procedure: String,
    pub codecs: HashMap<String, Codec>,
    pub compression_pools: HashMap<String, Compression>,
    pub compression_names: Vec<String>,
    pub compress_min_bytes: usize,
    pub interceptor: Option<Arc<dyn Interceptor>>,
    pub handle_grpc: bool,
    pub handle_grpc_web: bool,
    pub buffer_pool: Arc<BufferPool>,
    pub read_max_bytes: usize,
    pub send_max_bytes: usize,
}

impl HandlerConfig {
    pub(crate) fn new(procedure: &str, options: HandlerOptions) -> Self {
        let mut codecs = HashMap::new();
        codecs.insert(CODEC_NAME_MSGPACK.to_string(), Codec::MsgPack);
        codecs.insert(CODEC_NAME_JSON.to_string(), Codec::Json);

        let mut compression_pools = HashMap::new();
        let mut compression_names = Vec::new();
        compression_pools.insert(COMPRESSION_ZSTD.to_string(), Compression::Zstd);
        compression_names.push(COMPRESSION_ZSTD.to_string());

        let mut config = Self {
            procedure: extract_rpc_path(procedure),
            codecs,
            compression_pools,
            compression_names,
            compress_min_bytes: 0,
            interceptor: None,
            handle_grpc: true,
            handle_grpc_web: true,
            buffer_pool: Arc::new(BufferPool::new()),
            read_max_bytes: 0,
            send_max_bytes: 0,
        };

        for (suffix, codec) in options.codecs {
            config.codecs.insert(suffix, codec);
        }
        for compression in options.compressions {
            let name = compression.name().to_string();
            if config.compression_pools.insert(name.clone(), compression).is_none() {
                config.compression_names.push(name);
            }
        }
        if let Some(min) = options.compress_min_bytes {
            config.compress_min_bytes = min;
        }
        if let Some(interceptor) = options.interceptor {
            config.interceptor = Some(interceptor);
        }
        if let Some(enabled) = options.grpc {
            config.handle_grpc = enabled;
        }
        if let Some(enabled) = options.grpc_web {
            config.handle_grpc_web = enabled;
        }
        if let Some(max) = options.read_max_bytes {
            config.read_max_bytes = max;
        }
        if let Some(max) = options.send_max_bytes {
            config.send_max_bytes = max;
        }
        if let Some(pool) = options.buffer_pool {
            config.buffer_pool = pool;
        }
        config
    }

    pub(crate) fn new_spec(&self, stream_type: StreamType) -> Spec {
        Spec {
            stream_type,
            procedure: self.procedure.clone(),
            is_client: false,
        }
    }

    /// Freeze the configuration into the ordered adapter list: the
    /// native protocol first, then gRPC, then gRPC-Web.
    pub(crate) fn new_protocol_handlers(
        &self,
        stream_type: StreamType,
    ) -> Vec<Arc<dyn ProtocolHandler>> {
        let codecs = ReadOnlyCodecs::new(&self.codecs);
        let compression_pools =
            ReadOnlyCompressionPools::new(&self.compression_pools, &self.compression_names);
        let params = ProtocolHandlerParams {
            spec: self.new_spec(stream_type),
            codecs,
            compression_pools,
            compress_min_bytes: self.compress_min_bytes,
            buffer_pool: self.buffer_pool.clone(),
            read_max_bytes: self.read_max_bytes,
            send_max_bytes: self.send_max_bytes,
        };

        let mut handlers: Vec<Arc<dyn ProtocolHandler>> =
            vec![Arc::new(ConnectHandler::new(params.clone()))];
        if self.handle_grpc {
            handlers.push(Arc::new(GrpcHandler::new(false, params.clone())));
        }
        if self.handle_grpc_web {
            handlers.push(Arc::new(GrpcHandler::new(true, params)));
        }
        handlers
    }
}
