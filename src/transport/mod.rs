//! Transport seam between the dispatcher and a hosting HTTP server.
//!
//! The framework does not embed an HTTP server. Instead it reads the
//! request body through a boxed [`tokio::io::AsyncRead`] and writes
//! the response through the [`ResponseWriter`] trait, so any
//! hyper/h2/axum front end can bridge in with a few lines of glue.
//!
//! Two implementations ship with the crate:
//!
//! - [`RecordingResponseWriter`] buffers everything in memory, for
//!   tests and for exercising handlers without a server.
//! - [`ChannelResponseWriter`] forwards [`ResponsePart`]s through an
//!   mpsc channel that a server task drains into the real connection.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::conn::BoxFuture;

/// The readable request body handed to protocol adapters.
pub type RequestBody = Box<dyn AsyncRead + Send + Unpin>;

/// An inbound HTTP request as seen by the dispatcher.
pub type ServerRequest = http::Request<RequestBody>;

/// Wrap in-memory bytes as a [`RequestBody`].
pub fn memory_body(data: impl Into<Bytes>) -> RequestBody {
    Box::new(std::io::Cursor::new(data.into()))
}

/// The client's socket address, stored in the request's extensions by
/// the hosting server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// Write side of one HTTP exchange.
///
/// Headers accumulate in [`ResponseWriter::header_mut`] until
/// [`ResponseWriter::write_head`] commits them together with the
/// status line. Mutations after the commit are not observable on the
/// wire. Trailers are committed atomically by
/// [`ResponseWriter::write_trailers`].
pub trait ResponseWriter: Send {
    /// The response headers, mutable until the head is written.
    fn header_mut(&mut self) -> &mut HeaderMap;

    /// Commit the status line and accumulated headers.
    fn write_head(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>>;

    /// Write a chunk of body data.
    fn write(&mut self, data: Bytes) -> BoxFuture<'_, io::Result<()>>;

    /// Commit the HTTP trailers and end the response.
    fn write_trailers(&mut self, trailers: HeaderMap) -> BoxFuture<'_, io::Result<()>>;
}

/// An in-memory [`ResponseWriter`] that records the full exchange.
#[derive(Debug, Default)]
pub struct RecordingResponseWriter {
    headers: HeaderMap,
    committed: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
    trailers: Option<HeaderMap>,
}

impl RecordingResponseWriter {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed status, if the head was written.
    pub fn status(&self) -> Option<StatusCode> {
        self.committed.as_ref().map(|(status, _)| *status)
    }

    /// The headers as committed with the head. Empty if the head was
    /// never written.
    pub fn headers(&self) -> HeaderMap {
        self.committed
            .as_ref()
            .map(|(_, headers)| headers.clone())
            .unwrap_or_default()
    }

    /// Everything written to the body so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The committed trailers, if any.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }
}

impl ResponseWriter for RecordingResponseWriter {
    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.committed.is_none() {
                self.committed = Some((status, self.headers.clone()));
            }
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.body.extend_from_slice(&data);
            Ok(())
        })
    }

    fn write_trailers(&mut self, trailers: HeaderMap) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.trailers = Some(trailers);
            Ok(())
        })
    }
}

/// One piece of a streamed response.
#[derive(Debug)]
pub enum ResponsePart {
    /// Status line plus the headers committed with it.
    Head {
        /// The response status.
        status: StatusCode,
        /// Headers committed together with the status.
        headers: HeaderMap,
    },
    /// A chunk of body data.
    Data(Bytes),
    /// The trailers ending the response.
    Trailers(HeaderMap),
}

/// A [`ResponseWriter`] that forwards response parts through a bounded
/// channel. The hosting server drains the receiver into the real
/// connection, applying its own flow control.
#[derive(Debug)]
pub struct ChannelResponseWriter {
    headers: HeaderMap,
    tx: mpsc::Sender<ResponsePart>,
}

impl ChannelResponseWriter {
    /// Create a writer and the receiver a server task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ResponsePart>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                headers: HeaderMap::new(),
                tx,
            },
            rx,
        )
    }

    async fn forward(&self, part: ResponsePart) -> io::Result<()> {
        self.tx
            .send(part)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response receiver dropped"))
    }
}

impl ResponseWriter for ChannelResponseWriter {
    fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let headers = std::mem::take(&mut self.headers);
            self.forward(ResponsePart::Head { status, headers }).await
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move { self.forward(ResponsePart::Data(data)).await })
    }

    fn write_trailers(&mut self, trailers: HeaderMap) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move { self.forward(ResponsePart::Trailers(trailers)).await })
    }
}
