//! Protocol adapters and the contract they satisfy.
//!
//! The dispatcher is agnostic to the wire protocol: it selects an
//! adapter by content type and only speaks the [`ProtocolHandler`]
//! contract. Three adapters ship with the crate - the native
//! Connect-style protocol, gRPC, and gRPC-Web - all seeded with the
//! same per-handler parameters so behavior is uniform across
//! protocols.

mod connect;
pub(crate) mod frame;
mod grpc;

pub(crate) use connect::ConnectHandler;
pub(crate) use grpc::GrpcHandler;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use crate::buffer::BufferPool;
use crate::codec::ReadOnlyCodecs;
use crate::compress::ReadOnlyCompressionPools;
use crate::conn::{BoxFuture, HandlerConnCloser};
use crate::context::{CallContext, CancelGuard};
use crate::envelope::{Peer, Spec};
use crate::error::{Result, RpcError};
use crate::transport::{RemoteAddr, ResponseWriter, ServerRequest};

/// The contract a wire-protocol adapter must satisfy.
pub trait ProtocolHandler: Send + Sync {
    /// The canonical content types this adapter accepts.
    fn content_types(&self) -> &HashSet<String>;

    /// Inspect the protocol's deadline header and derive a cancellable
    /// context bounded by it.
    ///
    /// A malformed header value is reported in the error slot; the
    /// dispatcher still synthesizes a response. Any returned
    /// [`CancelGuard`] is held by the dispatcher for the whole
    /// exchange so the derivation is always released.
    fn set_timeout(
        &self,
        ctx: &CallContext,
        headers: &HeaderMap,
    ) -> (CallContext, Option<CancelGuard>, Option<RpcError>);

    /// Construct a stream over the response writer and request.
    ///
    /// Returns `None` when the adapter has already written a failure
    /// response (typically an unsupported compression encoding);
    /// otherwise the conn owns writer access for the remainder of the
    /// exchange.
    fn new_conn<'a>(
        &'a self,
        writer: &'a mut dyn ResponseWriter,
        request: ServerRequest,
    ) -> BoxFuture<'a, Option<Box<dyn HandlerConnCloser + 'a>>>;
}

/// Per-handler state seeded identically into every protocol adapter.
#[derive(Clone)]
pub(crate) struct ProtocolHandlerParams {
    pub spec: Spec,
    pub codecs: ReadOnlyCodecs,
    pub compression_pools: ReadOnlyCompressionPools,
    pub compress_min_bytes: usize,
    pub buffer_pool: Arc<BufferPool>,
    pub read_max_bytes: usize,
    pub send_max_bytes: usize,
}

/// Canonicalize a content-type value: lowercase the primary type and
/// subtype, preserve any parameters as-is.
pub fn canonicalize_content_type(content_type: &str) -> String {
    match content_type.find(';') {
        None => content_type.trim().to_ascii_lowercase(),
        Some(at) => {
            let (media_type, params) = content_type.split_at(at);
            format!("{}{}", media_type.trim().to_ascii_lowercase(), params)
        }
    }
}

/// Normalize a user-supplied URL path to the canonical
/// `/package.Service/Method` form: the trailing two non-empty
/// segments, prefixed with a slash.
///
/// Used both as the mount path on HTTP routers and as
/// `Spec::procedure`.
pub fn extract_rpc_path(raw: &str) -> String {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 => "/".to_string(),
        1 => format!("/{}", segments[0]),
        n => format!("/{}/{}", segments[n - 2], segments[n - 1]),
    }
}

/// All content types supported by a handler's adapters, sorted, for
/// the `Accept-Post` header.
pub(crate) fn sorted_accept_post(handlers: &[Arc<dyn ProtocolHandler>]) -> String {
    let mut types: Vec<&str> = handlers
        .iter()
        .flat_map(|h| h.content_types().iter().map(|s| s.as_str()))
        .collect();
    types.sort_unstable();
    types.dedup();
    types.join(", ")
}

/// The client's address from the request extensions, empty if the
/// hosting server did not record one.
pub(crate) fn peer_from_request(request: &ServerRequest) -> Peer {
    match request.extensions().get::<RemoteAddr>() {
        Some(RemoteAddr(addr)) => Peer {
            addr: addr.to_string(),
        },
        None => Peer::default(),
    }
}

/// Shared tail of every adapter's `set_timeout`: turn a parsed
/// timeout into a derived context, keeping the original context when
/// the header was malformed.
fn apply_timeout(
    ctx: &CallContext,
    parsed: Result<Option<Duration>>,
) -> (CallContext, Option<CancelGuard>, Option<RpcError>) {
    match parsed {
        Ok(None) => (ctx.clone(), None, None),
        Ok(Some(timeout)) => {
            let (derived, guard) = ctx.with_timeout(timeout);
            (derived, Some(guard), None)
        }
        Err(err) => (ctx.clone(), None, Some(err)),
    }
}
