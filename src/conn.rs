//! Streaming-connection contracts.
//!
//! A streaming conn is one RPC viewed as a bidirectional channel of
//! encoded messages over an HTTP body pair. Handler-side conns are
//! built by a protocol adapter and handed to the generic streaming
//! implementation; client-side conns are the mirror image and exist in
//! this crate as a contract plus the [`receive_unary_response`]
//! helper.
//!
//! Conns move encoded payloads as [`Bytes`] and expose the negotiated
//! [`Codec`]; the typed facades in [`crate::handler`] encode and
//! decode at the boundary.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::MutexGuard;
use serde::de::DeserializeOwned;

use crate::codec::Codec;
use crate::envelope::{Peer, Response, Spec};
use crate::error::{Code, Result, RpcError};
use crate::transport::RequestBody;

/// Boxed future used by the object-safe conn traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The server's view of one RPC as a bidirectional message exchange.
///
/// Response headers are committed to the wire by the first call to
/// `send`; header mutations after that point are silently dropped.
/// Trailers may be mutated until the handler returns. `receive`
/// resolves to `Ok(None)` once the request stream is exhausted.
///
/// Implementations are not required to be safe for concurrent use;
/// a handler drives `receive` and `send` from one task.
pub trait StreamingHandlerConn: Send {
    /// A description of this RPC. Never blocks.
    fn spec(&self) -> &Spec;

    /// The other party to this RPC. Never blocks.
    fn peer(&self) -> &Peer;

    /// The payload codec negotiated from the request content type.
    fn codec(&self) -> Codec;

    /// The request headers, readable at any time.
    fn request_header(&self) -> &HeaderMap;

    /// Receive the next encoded message, or `Ok(None)` at end of
    /// stream. May suspend while reading body bytes.
    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>>;

    /// Send one encoded message. The first send commits the response
    /// headers. May suspend while writing body bytes.
    fn send(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>>;

    /// The response headers. Mutations are observable on the wire only
    /// until the first send.
    fn response_header(&mut self) -> &mut HeaderMap;

    /// The response trailers. Mutable until the exchange closes.
    fn response_trailer(&mut self) -> &mut HeaderMap;
}

/// A [`StreamingHandlerConn`] that the dispatcher can terminate.
///
/// `close` is the single choke point where the protocol commits
/// trailers and, when `error` is set, encodes its code and message per
/// the wire rules. It is invoked exactly once per successfully
/// constructed conn; its own error return is informational.
pub trait HandlerConnCloser: StreamingHandlerConn {
    /// Terminate the exchange with the implementation's terminal
    /// status.
    fn close(&mut self, error: Option<RpcError>) -> BoxFuture<'_, Result<()>>;
}

/// The client's view of one RPC as a bidirectional message exchange.
///
/// Request headers are committed by the first call to `send`. Once the
/// server finishes sending, `receive` resolves to `Ok(None)`.
///
/// To support bidirectional RPCs, implementations must support limited
/// concurrent use: `spec`, `peer`, and `codec` are safe against
/// everything; the send group (`send`, `request_header`,
/// `close_request`) may race among themselves but must be safe against
/// the receive group (`receive`, `response_header`,
/// `response_trailer`, `close_response`), and vice versa. The two
/// groups form the two half-duplexes of a duplex channel.
pub trait StreamingClientConn: Send + Sync {
    /// A description of this RPC. Safe to call concurrently with all
    /// other methods.
    fn spec(&self) -> &Spec;

    /// The other party to this RPC. Safe to call concurrently with all
    /// other methods.
    fn peer(&self) -> &Peer;

    /// The payload codec in use. Safe to call concurrently with all
    /// other methods.
    fn codec(&self) -> Codec;

    /// Send one encoded message; the first send commits the request
    /// headers.
    fn send(&self, message: Bytes) -> BoxFuture<'_, Result<()>>;

    /// The request headers, mutable until committed by the first send.
    fn request_header(&self) -> MutexGuard<'_, HeaderMap>;

    /// Half-close the request direction.
    fn close_request(&self) -> BoxFuture<'_, Result<()>>;

    /// Receive the next encoded message, or `Ok(None)` once the server
    /// is done sending.
    fn receive(&self) -> BoxFuture<'_, Result<Option<Bytes>>>;

    /// The response headers received from the server.
    fn response_header(&self) -> MutexGuard<'_, HeaderMap>;

    /// The response trailers; fully populated only after the stream is
    /// drained.
    fn response_trailer(&self) -> MutexGuard<'_, HeaderMap>;

    /// Release the response direction.
    fn close_response(&self) -> BoxFuture<'_, Result<()>>;
}

/// Extract exactly one message plus trailers from a client conn.
///
/// The second receive is what lets the underlying protocol observe the
/// trailer frames or headers that follow the payload, so the returned
/// response carries a fully populated trailer map. Streams with more
/// than one message are rejected.
pub async fn receive_unary_response<T: DeserializeOwned>(
    conn: &dyn StreamingClientConn,
) -> Result<Response<T>> {
    let Some(first) = conn.receive().await? else {
        return Err(RpcError::new(Code::Unknown, "unary stream has no messages"));
    };
    let msg: T = conn.codec().decode(&first)?;
    match conn.receive().await {
        Ok(Some(_)) => Err(RpcError::new(
            Code::Unknown,
            "unary stream has multiple messages",
        )),
        Ok(None) => Ok(Response::with_metadata(
            msg,
            conn.response_header().clone(),
            conn.response_trailer().clone(),
        )),
        Err(err) => Err(RpcError::new(Code::Unknown, err.to_string())),
    }
}

/// The interface webwire expects HTTP clients to implement: given a
/// request, produce a response or fail. Any HTTP client can be adapted
/// to this.
pub trait HttpClient: Send + Sync {
    /// Execute one HTTP request.
    fn execute(
        &self,
        request: http::Request<Bytes>,
    ) -> BoxFuture<'_, std::result::Result<http::Response<RequestBody>, RpcError>>;
}
