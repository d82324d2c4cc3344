//! Handler module - the server-side dispatcher for one procedure.
//!
//! A [`Handler`] is created by one of four typed constructors and then
//! serves many concurrent requests. Dispatch walks the fixed pipeline:
//! validate method and HTTP version, pick a protocol adapter by
//! content type, extract the protocol's timeout header, build a
//! streaming conn over the request/response bodies, run the generic
//! implementation, and close the conn exactly once with its terminal
//! status. Errors never surface to the hosting server; the response
//! writer is the only user-visible channel.

mod config;
mod typed;

pub use config::HandlerOptions;
pub use typed::{
    BidiStream, BidiStreamHandler, ClientStream, ClientStreamHandler, ServerStream,
    ServerStreamHandler,
};

use std::future::Future;
use std::sync::Arc;

use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderName, HeaderValue, Method, StatusCode, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conn::StreamingHandlerConn;
use crate::context::CallContext;
use crate::envelope::{Request, Response, Spec, StreamType};
use crate::error::Result;
use crate::interceptor::StreamingHandlerFn;
use crate::protocol::{canonicalize_content_type, sorted_accept_post, ProtocolHandler};
use crate::transport::{ResponseWriter, ServerRequest};

use config::HandlerConfig;

static ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");

/// The server-side implementation of a single RPC.
///
/// Immutable after construction; one instance serves many concurrent
/// requests. Mount it on a router under [`Handler::procedure`].
pub struct Handler {
    spec: Spec,
    implementation: StreamingHandlerFn,
    protocol_handlers: Vec<Arc<dyn ProtocolHandler>>,
    accept_post: String,
}

impl Handler {
    /// Construct a handler for a request-response procedure.
    pub fn unary<Req, Res, F, Fut>(procedure: &str, unary: F, options: HandlerOptions) -> Handler
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(CallContext, Request<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Res>>> + Send + 'static,
    {
        let config = HandlerConfig::new(procedure, options);
        let implementation =
            typed::unary_implementation::<Req, Res, F, Fut>(unary, config.interceptor.clone());
        Self::from_parts(config, StreamType::Unary, implementation, false)
    }

    /// Construct a handler for a client-streaming procedure.
    pub fn client_stream<H>(procedure: &str, handler: H, options: HandlerOptions) -> Handler
    where
        H: ClientStreamHandler,
    {
        let config = HandlerConfig::new(procedure, options);
        let implementation = typed::client_stream_implementation(handler);
        Self::from_parts(config, StreamType::Client, implementation, true)
    }

    /// Construct a handler for a server-streaming procedure.
    pub fn server_stream<H>(procedure: &str, handler: H, options: HandlerOptions) -> Handler
    where
        H: ServerStreamHandler,
    {
        let config = HandlerConfig::new(procedure, options);
        let implementation = typed::server_stream_implementation(handler);
        Self::from_parts(config, StreamType::Server, implementation, true)
    }

    /// Construct a handler for a bidirectional-streaming procedure.
    pub fn bidi_stream<H>(procedure: &str, handler: H, options: HandlerOptions) -> Handler
    where
        H: BidiStreamHandler,
    {
        let config = HandlerConfig::new(procedure, options);
        let implementation = typed::bidi_stream_implementation(handler);
        Self::from_parts(config, StreamType::Bidi, implementation, true)
    }

    fn from_parts(
        config: HandlerConfig,
        stream_type: StreamType,
        mut implementation: StreamingHandlerFn,
        wrap_streaming: bool,
    ) -> Handler {
        if wrap_streaming {
            if let Some(interceptor) = &config.interceptor {
                implementation = interceptor.wrap_streaming_handler(implementation);
            }
        }
        let protocol_handlers = config.new_protocol_handlers(stream_type);
        Handler {
            spec: config.new_spec(stream_type),
            implementation,
            accept_post: sorted_accept_post(&protocol_handlers),
            protocol_handlers,
        }
    }

    /// The normalized procedure path, for mounting on an HTTP router.
    pub fn procedure(&self) -> &str {
        &self.spec.procedure
    }

    /// A description of the RPC this handler serves.
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Serve one HTTP request.
    ///
    /// The hosting server may place a [`CallContext`] and a
    /// [`crate::transport::RemoteAddr`] in the request extensions;
    /// both default to empty values otherwise.
    pub async fn serve(&self, writer: &mut dyn ResponseWriter, mut request: ServerRequest) {
        // Full-duplex procedures need an HTTP version that multiplexes
        // request and response bodies.
        if self.spec.stream_type.is_bidi() && request.version() < Version::HTTP_2 {
            let _ = writer
                .write_head(StatusCode::HTTP_VERSION_NOT_SUPPORTED)
                .await;
            return;
        }

        // Every supported protocol is POST-only.
        if request.method() != Method::POST {
            writer
                .header_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            let _ = writer.write_head(StatusCode::METHOD_NOT_ALLOWED).await;
            return;
        }

        // Find our implementation of the RPC protocol in use.
        let content_type = canonicalize_content_type(
            request
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default(),
        );
        let protocol = self
            .protocol_handlers
            .iter()
            .find(|handler| handler.content_types().contains(&content_type));
        let Some(protocol) = protocol else {
            if let Ok(value) = HeaderValue::from_str(&self.accept_post) {
                writer.header_mut().insert(ACCEPT_POST.clone(), value);
            }
            let _ = writer.write_head(StatusCode::UNSUPPORTED_MEDIA_TYPE).await;
            return;
        };

        // Downstream adapters see the canonical content type.
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            request.headers_mut().insert(CONTENT_TYPE, value);
        }

        let ctx = request
            .extensions()
            .get::<CallContext>()
            .cloned()
            .unwrap_or_default();
        let (derived, guard, timeout_err) = protocol.set_timeout(&ctx, request.headers());
        // Hold the guard for the whole exchange so the derivation is
        // released on every exit path.
        let _guard = guard;
        let ctx = if timeout_err.is_some() { ctx } else { derived };
        request.extensions_mut().insert(ctx.clone());

        let Some(mut conn) = protocol.new_conn(writer, request).await else {
            // The adapter already wrote a failure response, usually
            // because the client chose an unknown compression.
            return;
        };
        if let Some(err) = timeout_err {
            let _ = conn.close(Some(err)).await;
            return;
        }
        let result = {
            let stream: &mut dyn StreamingHandlerConn = &mut *conn;
            (*self.implementation)(ctx, stream).await
        };
        let _ = conn.close(result.err()).await;
    }
}
