//! Typed request/response envelopes and RPC descriptors.
//!
//! [`Request`] and [`Response`] wrap a payload message together with
//! the metadata the framework populates: headers, trailers, the
//! [`Spec`] describing the call site, and the [`Peer`] on the other
//! end. The non-generic [`AnyRequest`]/[`AnyResponse`] facades exist
//! for unary interceptors; they are sealed so the framework can grow
//! their method sets without breaking user code.

use std::any::Any;

use http::HeaderMap;

/// Whether the client, server, neither, or both sides stream.
///
/// The discriminants encode two independent bits: bit 0 for "client
/// streams", bit 1 for "server streams".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamType {
    /// One request message, one response message.
    Unary = 0b00,
    /// Many request messages, one response message.
    Client = 0b01,
    /// One request message, many response messages.
    Server = 0b10,
    /// Both sides stream; requires full-duplex transport.
    Bidi = 0b11,
}

impl StreamType {
    /// Whether the client sends more than one message.
    #[inline]
    pub fn client_streams(self) -> bool {
        (self as u8) & 0b01 != 0
    }

    /// Whether the server sends more than one message.
    #[inline]
    pub fn server_streams(self) -> bool {
        (self as u8) & 0b10 != 0
    }

    /// Whether both sides stream.
    #[inline]
    pub fn is_bidi(self) -> bool {
        self == StreamType::Bidi
    }
}

/// A description of a client call or a handler invocation.
///
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    /// The stream shape of the procedure.
    pub stream_type: StreamType,
    /// Normalized procedure path, for example `/acme.foo.v1.FooService/Bar`.
    pub procedure: String,
    /// True when observed from the client side of the call.
    pub is_client: bool,
}

/// The other party to an RPC, as an opaque address string.
///
/// Server-side this is the client's `ip:port`; client-side it is the
/// host or `host:port` from the target URL. Empty when the address
/// could not be determined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peer {
    /// Opaque address string.
    pub addr: String,
}

impl Peer {
    /// Extract the peer from a target URL. Returns an empty peer if
    /// the URL has no recognizable authority.
    pub fn from_url(url: &str) -> Peer {
        let Some(rest) = url.split_once("://").map(|(_, rest)| rest) else {
            return Peer::default();
        };
        let host = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        Peer {
            addr: host.to_string(),
        }
    }
}

/// A typed request envelope.
///
/// `spec`, `peer`, and the header map are populated by the framework
/// for handler-side requests; user-constructed requests carry only the
/// message until sent.
#[derive(Debug)]
pub struct Request<T> {
    /// The payload message.
    pub msg: T,

    pub(crate) spec: Spec,
    pub(crate) peer: Peer,
    pub(crate) header: HeaderMap,
}

impl<T> Request<T> {
    /// Wrap a message in a request envelope.
    pub fn new(msg: T) -> Self {
        Self {
            msg,
            spec: Spec {
                stream_type: StreamType::Unary,
                procedure: String::new(),
                is_client: true,
            },
            peer: Peer::default(),
            header: HeaderMap::new(),
        }
    }

    pub(crate) fn for_handler(msg: T, spec: Spec, peer: Peer, header: HeaderMap) -> Self {
        Self {
            msg,
            spec,
            peer,
            header,
        }
    }

    /// A description of this RPC.
    #[inline]
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// The other party to this RPC.
    #[inline]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The HTTP headers of this request.
    #[inline]
    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    /// Mutable access to the HTTP headers of this request.
    #[inline]
    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }
}

/// A typed response envelope carrying headers and trailers alongside
/// the message.
#[derive(Debug)]
pub struct Response<T> {
    /// The payload message.
    pub msg: T,

    pub(crate) header: HeaderMap,
    pub(crate) trailer: HeaderMap,
}

impl<T> Response<T> {
    /// Wrap a message in a response envelope.
    pub fn new(msg: T) -> Self {
        Self {
            msg,
            header: HeaderMap::new(),
            trailer: HeaderMap::new(),
        }
    }

    pub(crate) fn with_metadata(msg: T, header: HeaderMap, trailer: HeaderMap) -> Self {
        Self {
            msg,
            header,
            trailer,
        }
    }

    /// The HTTP headers of this response.
    #[inline]
    pub fn header(&self) -> &HeaderMap {
        &self.header
    }

    /// Mutable access to the HTTP headers of this response.
    #[inline]
    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    /// The trailers of this response. Depending on the protocol these
    /// reach the wire as HTTP trailers or an in-body metadata block.
    #[inline]
    pub fn trailer(&self) -> &HeaderMap {
        &self.trailer
    }

    /// Mutable access to the trailers of this response.
    #[inline]
    pub fn trailer_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailer
    }
}

mod sealed {
    /// Only envelope types defined in this crate may implement the
    /// `Any*` facades.
    pub trait Sealed {}

    impl<T: Send + 'static> Sealed for super::Request<T> {}
    impl<T: Send + 'static> Sealed for super::Response<T> {}
}

/// The common method set of every [`Request`], regardless of type
/// parameter. Used by unary interceptors.
pub trait AnyRequest: sealed::Sealed + Send {
    /// A description of this RPC.
    fn spec(&self) -> &Spec;
    /// The other party to this RPC.
    fn peer(&self) -> &Peer;
    /// The HTTP headers of this request.
    fn header(&self) -> &HeaderMap;
    /// Recover the concrete `Request<T>` for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Send + 'static> AnyRequest for Request<T> {
    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// The common method set of every [`Response`], regardless of type
/// parameter. Used by unary interceptors.
pub trait AnyResponse: sealed::Sealed + Send {
    /// The HTTP headers of this response.
    fn header(&self) -> &HeaderMap;
    /// The trailers of this response.
    fn trailer(&self) -> &HeaderMap;
    /// Recover the concrete `Response<T>` for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Send + 'static> AnyResponse for Response<T> {
    fn header(&self) -> &HeaderMap {
        &self.header
    }

    fn trailer(&self) -> &HeaderMap {
        &self.trailer
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Append every entry of `src` to `dst`, preserving values already
/// present under the same name.
pub(crate) fn merge_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src.iter() {
        dst.append(name.clone(), value.clone());
    }
}
