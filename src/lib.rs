//! # webwire
//!
//! A slim RPC framework layered on HTTP. Handlers built with this
//! crate speak three wire protocols behind one streaming-connection
//! abstraction - webwire's native Connect-style protocol, gRPC, and
//! gRPC-Web - negotiated per request by content type. Payloads are
//! serde values encoded with MessagePack (binary) or JSON (text).
//!
//! ## Architecture
//!
//! - **Dispatch** ([`Handler`]): validates the request, selects a
//!   protocol adapter, applies the protocol's timeout header, builds a
//!   streaming conn over the HTTP body pair, runs the typed
//!   implementation, and closes the conn with its terminal status.
//! - **Conn layer** ([`StreamingHandlerConn`] / [`StreamingClientConn`]):
//!   the uniform bidirectional channel contracts; conns move encoded
//!   messages, typed facades encode and decode at the boundary.
//! - **Transport seam** ([`transport::ResponseWriter`]): the crate
//!   embeds no HTTP server; any hyper/h2/axum front end bridges in.
//!
//! ## Example
//!
//! ```ignore
//! use webwire::{Handler, HandlerOptions, Request, Response};
//!
//! let handler = Handler::unary(
//!     "/acme.foo.v1.FooService/Double",
//!     |_ctx, request: Request<u64>| async move {
//!         Ok(Response::new(request.msg * 2))
//!     },
//!     HandlerOptions::new(),
//! );
//! // Mount `handler` on a router under handler.procedure() and feed
//! // it requests via Handler::serve.
//! ```

pub mod buffer;
pub mod codec;
pub mod compress;
pub mod protocol;
pub mod transport;

mod conn;
mod context;
mod envelope;
mod error;
mod handler;
mod interceptor;

pub use codec::Codec;
pub use compress::Compression;
pub use conn::{
    receive_unary_response, BoxFuture, HandlerConnCloser, HttpClient, StreamingClientConn,
    StreamingHandlerConn,
};
pub use context::{CallContext, CancelGuard};
pub use envelope::{AnyRequest, AnyResponse, Peer, Request, Response, Spec, StreamType};
pub use error::{Code, Result, RpcError};
pub use handler::{
    BidiStream, BidiStreamHandler, ClientStream, ClientStreamHandler, Handler, HandlerOptions,
    ServerStream, ServerStreamHandler,
};
pub use interceptor::{Interceptor, StreamingHandlerFn, UnaryFn};
