//! Typed adapters between user implementations and the generic
//! streaming-connection contract.
//!
//! Unary handlers are plain async closures; the three streaming shapes
//! are service traits so their implementations can borrow the typed
//! stream facades. Each adapter routes through the same
//! [`StreamingHandlerFn`] shape, so the dispatcher and interceptors
//! never see the difference.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conn::{BoxFuture, StreamingHandlerConn};
use crate::context::CallContext;
use crate::envelope::{merge_headers, AnyResponse, Peer, Request, Response, Spec};
use crate::error::{Code, Result, RpcError};
use crate::interceptor::{Interceptor, StreamingHandlerFn, UnaryFn};

/// The handler's view of a client-streaming request body.
pub struct ClientStream<'a, Req> {
    conn: &'a mut dyn StreamingHandlerConn,
    _marker: PhantomData<fn() -> Req>,
}

impl<'a, Req: DeserializeOwned> ClientStream<'a, Req> {
    pub(crate) fn new(conn: &'a mut dyn StreamingHandlerConn) -> Self {
        Self {
            conn,
            _marker: PhantomData,
        }
    }

    /// A description of this RPC.
    pub fn spec(&self) -> &Spec {
        self.conn.spec()
    }

    /// The other party to this RPC.
    pub fn peer(&self) -> &Peer {
        self.conn.peer()
    }

    /// The request headers.
    pub fn request_header(&self) -> &HeaderMap {
        self.conn.request_header()
    }

    /// Receive the next request message, or `Ok(None)` once the client
    /// is done sending.
    pub async fn receive(&mut self) -> Result<Option<Req>> {
        match self.conn.receive().await? {
            Some(payload) => Ok(Some(self.conn.codec().decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn into_conn(self) -> &'a mut dyn StreamingHandlerConn {
        self.conn
    }
}

/// The handler's view of a server-streaming response.
pub struct ServerStream<'a, Res> {
    conn: &'a mut dyn StreamingHandlerConn,
    _marker: PhantomData<fn(Res)>,
}

impl<'a, Res: Serialize> ServerStream<'a, Res> {
    pub(crate) fn new(conn: &'a mut dyn StreamingHandlerConn) -> Self {
        Self {
            conn,
            _marker: PhantomData,
        }
    }

    /// The response headers; mutations after the first send are
    /// silently dropped.
    pub fn response_header(&mut self) -> &mut HeaderMap {
        self.conn.response_header()
    }

    /// The response trailers, mutable until the handler returns.
    pub fn response_trailer(&mut self) -> &mut HeaderMap {
        self.conn.response_trailer()
    }

    /// Send one response message. The first send commits the response
    /// headers.
    pub async fn send(&mut self, message: &Res) -> Result<()> {
        let payload = self.conn.codec().encode(message)?;
        self.conn.send(Bytes::from(payload)).await
    }
}

/// The handler's view of a bidirectional exchange.
pub struct BidiStream<'a, Req, Res> {
    conn: &'a mut dyn StreamingHandlerConn,
    _marker: PhantomData<fn(Res) -> Req>,
}

impl<'a, Req: DeserializeOwned, Res: Serialize> BidiStream<'a, Req, Res> {
    pub(crate) fn new(conn: &'a mut dyn StreamingHandlerConn) -> Self {
        Self {
            conn,
            _marker: PhantomData,
        }
    }

    /// A description of this RPC.
    pub fn spec(&self) -> &Spec {
        self.conn.spec()
    }

    /// The other party to this RPC.
    pub fn peer(&self) -> &Peer {
        self.conn.peer()
    }

    /// The request headers.
    pub fn request_header(&self) -> &HeaderMap {
        self.conn.request_header()
    }

    /// The response headers; mutations after the first send are
    /// silently dropped.
    pub fn response_header(&mut self) -> &mut HeaderMap {
        self.conn.response_header()
    }

    /// The response trailers, mutable until the handler returns.
    pub fn response_trailer(&mut self) -> &mut HeaderMap {
        self.conn.response_trailer()
    }

    /// Receive the next request message, or `Ok(None)` once the client
    /// is done sending.
    pub async fn receive(&mut self) -> Result<Option<Req>> {
        match self.conn.receive().await? {
            Some(payload) => Ok(Some(self.conn.codec().decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Send one response message. The first send commits the response
    /// headers.
    pub async fn send(&mut self, message: &Res) -> Result<()> {
        let payload = self.conn.codec().encode(message)?;
        self.conn.send(Bytes::from(payload)).await
    }
}

/// A client-streaming procedure implementation.
#[async_trait]
pub trait ClientStreamHandler: Send + Sync + 'static {
    /// The request message type.
    type Request: DeserializeOwned + Send;
    /// The response message type.
    type Response: Serialize + Send;

    /// Consume the request stream and produce the single response.
    async fn handle(
        &self,
        ctx: CallContext,
        stream: &mut ClientStream<'_, Self::Request>,
    ) -> Result<Response<Self::Response>>;
}

/// A server-streaming procedure implementation.
#[async_trait]
pub trait ServerStreamHandler: Send + Sync + 'static {
    /// The request message type.
    type Request: DeserializeOwned + Send;
    /// The response message type.
    type Response: Serialize + Send;

    /// Handle the single request, sending any number of responses.
    async fn handle(
        &self,
        ctx: CallContext,
        request: Request<Self::Request>,
        stream: &mut ServerStream<'_, Self::Response>,
    ) -> Result<()>;
}

/// A bidirectional-streaming procedure implementation.
#[async_trait]
pub trait BidiStreamHandler: Send + Sync + 'static {
    /// The request message type.
    type Request: DeserializeOwned + Send;
    /// The response message type.
    type Response: Serialize + Send;

    /// Drive both directions of the exchange.
    async fn handle(
        &self,
        ctx: CallContext,
        stream: &mut BidiStream<'_, Self::Request, Self::Response>,
    ) -> Result<()>;
}

fn streaming_fn<F>(f: F) -> StreamingHandlerFn
where
    F: for<'a> Fn(CallContext, &'a mut dyn StreamingHandlerConn) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn receive_request_message<Req: DeserializeOwned + Send>(
    conn: &mut dyn StreamingHandlerConn,
) -> BoxFuture<'_, Result<Request<Req>>> {
    Box::pin(async move {
        let Some(payload) = conn.receive().await? else {
            return Err(RpcError::new(
                Code::InvalidArgument,
                "missing request message",
            ));
        };
        let msg: Req = conn.codec().decode(&payload)?;
        Ok(Request::for_handler(
            msg,
            conn.spec().clone(),
            conn.peer().clone(),
            conn.request_header().clone(),
        ))
    })
}

/// Build the streaming implementation for a unary procedure: read one
/// message, run the (possibly intercepted) unary function, merge its
/// metadata, send its message.
pub(crate) fn unary_implementation<Req, Res, F, Fut>(
    unary: F,
    interceptor: Option<Arc<dyn Interceptor>>,
) -> StreamingHandlerFn
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(CallContext, Request<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Res>>> + Send + 'static,
{
    let unary = Arc::new(unary);
    let untyped: UnaryFn = Arc::new(move |ctx, request| {
        let unary = unary.clone();
        Box::pin(async move {
            if let Some(err) = ctx.error() {
                return Err(err);
            }
            // Only a misbehaving interceptor can substitute the
            // envelope type.
            let request = request
                .into_any()
                .downcast::<Request<Req>>()
                .map_err(|_| RpcError::new(Code::Internal, "unexpected handler request type"))?;
            let response = (*unary)(ctx, *request).await?;
            Ok(Box::new(response) as Box<dyn AnyResponse>)
        })
    });
    let untyped = match &interceptor {
        Some(interceptor) => interceptor.wrap_unary(untyped),
        None => untyped,
    };

    streaming_fn(move |ctx, conn: &mut dyn StreamingHandlerConn| {
        let untyped = untyped.clone();
        let fut: BoxFuture<'_, Result<()>> = Box::pin(async move {
            let request = receive_request_message::<Req>(conn).await?;
            let response = (*untyped)(ctx, Box::new(request)).await?;
            let response = response
                .into_any()
                .downcast::<Response<Res>>()
                .map_err(|_| RpcError::new(Code::Internal, "unexpected handler response type"))?;
            merge_headers(conn.response_header(), &response.header);
            merge_headers(conn.response_trailer(), &response.trailer);
            let payload = conn.codec().encode(&response.msg)?;
            conn.send(Bytes::from(payload)).await
        });
        fut
    })
}

/// Build the streaming implementation for a client-streaming
/// procedure.
pub(crate) fn client_stream_implementation<H>(handler: H) -> StreamingHandlerFn
where
    H: ClientStreamHandler,
{
    let handler = Arc::new(handler);
    streaming_fn(move |ctx, conn: &mut dyn StreamingHandlerConn| {
        let handler = handler.clone();
        let fut: BoxFuture<'_, Result<()>> = Box::pin(async move {
            let mut stream = ClientStream::new(conn);
            let response = handler.handle(ctx, &mut stream).await?;
            let conn = stream.into_conn();
            merge_headers(conn.response_header(), &response.header);
            merge_headers(conn.response_trailer(), &response.trailer);
            let payload = conn.codec().encode(&response.msg)?;
            conn.send(Bytes::from(payload)).await
        });
        fut
    })
}

/// Build the streaming implementation for a server-streaming
/// procedure: read the single request, then hand the send side to the
/// implementation.
pub(crate) fn server_stream_implementation<H>(handler: H) -> StreamingHandlerFn
where
    H: ServerStreamHandler,
{
    let handler = Arc::new(handler);
    streaming_fn(move |ctx, conn: &mut dyn StreamingHandlerConn| {
        let handler = handler.clone();
        let fut: BoxFuture<'_, Result<()>> = Box::pin(async move {
            let request = receive_request_message::<H::Request>(conn).await?;
            let mut stream = ServerStream::new(conn);
            handler.handle(ctx, request, &mut stream).await
        });
        fut
    })
}

/// Build the streaming implementation for a bidirectional procedure.
pub(crate) fn bidi_stream_implementation<H>(handler: H) -> StreamingHandlerFn
where
    H: BidiStreamHandler,
{
    let handler = Arc::new(handler);
    streaming_fn(move |ctx, conn: &mut dyn StreamingHandlerConn| {
        let handler = handler.clone();
        let fut: BoxFuture<'_, Result<()>> = Box::pin(async move {
            let mut stream = BidiStream::new(conn);
            handler.handle(ctx, &mut stream).await
        });
        fut
    })
}
