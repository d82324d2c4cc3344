//! End-to-end dispatch tests.
//!
//! Each test drives a [`Handler`] through `serve` with an in-memory
//! request body and a recording response writer, then asserts on the
//! exact bytes and headers that would reach the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, Method, Version};
use serde::{Deserialize, Serialize};

use webwire::transport::{memory_body, RecordingResponseWriter, ServerRequest};
use webwire::{
    BidiStream, BidiStreamHandler, CallContext, ClientStream, ClientStreamHandler, Codec,
    Handler, HandlerOptions, Request, Response, Result, RpcError, ServerStream,
    ServerStreamHandler,
};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
struct Num {
    x: i64,
}

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_END_STREAM: u8 = 0b10;
const FLAG_TRAILERS: u8 = 0x80;

fn post(path: &str, content_type: &str, body: Vec<u8>) -> ServerRequest {
    http::Request::builder()
        .method(Method::POST)
        .uri(path)
        .version(Version::HTTP_2)
        .header("content-type", content_type)
        .body(memory_body(body))
        .unwrap()
}

fn envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![flags];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn parse_envelopes(body: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        assert!(rest.len() >= 5, "truncated envelope prefix");
        let flags = rest[0];
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        assert!(rest.len() >= 5 + len, "truncated envelope payload");
        out.push((flags, rest[5..5 + len].to_vec()));
        rest = &rest[5 + len..];
    }
    out
}

fn double_handler() -> Handler {
    Handler::unary(
        "/acme.Foo/Bar",
        |_ctx: CallContext, request: Request<Num>| async move {
            Ok(Response::new(Num {
                x: request.msg.x * 2,
            }))
        },
        HandlerOptions::new(),
    )
}

struct CountDown;

#[async_trait]
impl ServerStreamHandler for CountDown {
    type Request = Num;
    type Response = Num;

    async fn handle(
        &self,
        _ctx: CallContext,
        request: Request<Num>,
        stream: &mut ServerStream<'_, Num>,
    ) -> Result<()> {
        for i in 0..request.msg.x {
            stream.send(&Num { x: i }).await?;
        }
        Ok(())
    }
}

struct Sum;

#[async_trait]
impl ClientStreamHandler for Sum {
    type Request = Num;
    type Response = Num;

    async fn handle(
        &self,
        _ctx: CallContext,
        stream: &mut ClientStream<'_, Num>,
    ) -> Result<Response<Num>> {
        let mut total = 0;
        while let Some(msg) = stream.receive().await? {
            total += msg.x;
        }
        Ok(Response::new(Num { x: total }))
    }
}

struct EchoBidi;

#[async_trait]
impl BidiStreamHandler for EchoBidi {
    type Request = Num;
    type Response = Num;

    async fn handle(
        &self,
        _ctx: CallContext,
        stream: &mut BidiStream<'_, Num, Num>,
    ) -> Result<()> {
        while let Some(msg) = stream.receive().await? {
            stream.send(&msg).await?;
        }
        Ok(())
    }
}

/// A unary request over the native protocol's binary codec echoes the
/// doubled payload with a 200.
#[tokio::test]
async fn test_connect_unary_msgpack_round_trip() {
    let handler = double_handler();
    let body = Codec::MsgPack.encode(&Num { x: 1 }).unwrap();
    let mut writer = RecordingResponseWriter::new();
    handler
        .serve(&mut writer, post("/acme.Foo/Bar", "application/msgpack", body))
        .await;

    assert_eq!(writer.status().unwrap(), 200);
    assert_eq!(
        writer.headers().get("content-type").unwrap(),
        "application/msgpack"
    );
    let echoed: Num = Codec::MsgPack.decode(writer.body()).unwrap();
    assert_eq!(echoed, Num { x: 2 });
    assert!(writer.trailers().is_none());
}

/// A malformed timeout header fails the RPC before the user function
/// runs, with a parse-related code in the protocol's error slot.
#[tokio::test]
async fn test_malformed_timeout_skips_implementation() {
    let invoked = Arc::new(AtomicBool::new(false));
    let observed = invoked.clone();
    let handler = Handler::unary(
        "/acme.Foo/Bar",
        move |_ctx: CallContext, request: Request<Num>| {
            let observed = observed.clone();
            async move {
                observed.store(true, Ordering::SeqCst);
                Ok(Response::new(request.msg))
            }
        },
        HandlerOptions::new(),
    );

    let body = Codec::MsgPack.encode(&Num { x: 1 }).unwrap();
    let mut request = post("/acme.Foo/Bar", "application/msgpack", body);
    request
        .headers_mut()
        .insert("connect-timeout-ms", "-1ms".parse().unwrap());

    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(writer.status().unwrap(), 400);
    let error: serde_json::Value = serde_json::from_slice(writer.body()).unwrap();
    assert_eq!(error["code"], "invalid_argument");
}

/// Bidirectional procedures require HTTP/2.
#[tokio::test]
async fn test_bidi_rejects_http_11() {
    let handler = Handler::bidi_stream("/acme.Foo/Bidi", EchoBidi, HandlerOptions::new());
    let mut request = post("/acme.Foo/Bidi", "application/connect+json", Vec::new());
    *request.version_mut() = Version::HTTP_11;

    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;
    assert_eq!(writer.status().unwrap(), 505);
}

/// Unary procedures are served over HTTP/1.1 without the version gate.
#[tokio::test]
async fn test_unary_allows_http_11() {
    let handler = double_handler();
    let body = Codec::Json.encode(&Num { x: 4 }).unwrap();
    let mut request = post("/acme.Foo/Bar", "application/json", body);
    *request.version_mut() = Version::HTTP_11;

    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;
    assert_eq!(writer.status().unwrap(), 200);
    let echoed: Num = Codec::Json.decode(writer.body()).unwrap();
    assert_eq!(echoed, Num { x: 8 });
}

/// Non-POST methods get 405 with `Allow: POST`.
#[tokio::test]
async fn test_method_gating() {
    let handler = double_handler();
    for method in [Method::GET, Method::PUT, Method::DELETE, Method::PATCH] {
        let request = http::Request::builder()
            .method(method.clone())
            .uri("/acme.Foo/Bar")
            .version(Version::HTTP_2)
            .header("content-type", "application/msgpack")
            .body(memory_body(Vec::new()))
            .unwrap();
        let mut writer = RecordingResponseWriter::new();
        handler.serve(&mut writer, request).await;
        assert_eq!(writer.status().unwrap(), 405, "method {method}");
        assert_eq!(writer.headers().get("allow").unwrap(), "POST");
        assert!(writer.body().is_empty());
    }
}

/// An unknown content type yields 415 with a sorted `Accept-Post`.
#[tokio::test]
async fn test_unknown_content_type() {
    let handler = double_handler();
    let request = post("/acme.Foo/Bar", "application/unknown", Vec::new());
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 415);
    assert_eq!(
        writer.headers().get("accept-post").unwrap(),
        "application/grpc, application/grpc+json, application/grpc+msgpack, \
         application/grpc-web, application/grpc-web+json, application/grpc-web+msgpack, \
         application/json, application/msgpack"
    );
}

/// Content-type matching tolerates case and surrounding whitespace.
#[tokio::test]
async fn test_content_type_canonicalization_routes() {
    let handler = double_handler();
    let body = Codec::Json.encode(&Num { x: 3 }).unwrap();
    let request = post("/acme.Foo/Bar", " Application/JSON ", body);
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;
    assert_eq!(writer.status().unwrap(), 200);
    let echoed: Num = Codec::Json.decode(writer.body()).unwrap();
    assert_eq!(echoed, Num { x: 6 });
}

/// A gRPC unary exchange: enveloped both ways, status in HTTP
/// trailers.
#[tokio::test]
async fn test_grpc_unary_round_trip() {
    let handler = double_handler();
    let message = Codec::MsgPack.encode(&Num { x: 21 }).unwrap();
    let request = post("/acme.Foo/Bar", "application/grpc", envelope(0, &message));
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 200);
    assert_eq!(
        writer.headers().get("content-type").unwrap(),
        "application/grpc"
    );
    let envelopes = parse_envelopes(writer.body());
    assert_eq!(envelopes.len(), 1);
    let echoed: Num = Codec::MsgPack.decode(&envelopes[0].1).unwrap();
    assert_eq!(echoed, Num { x: 42 });
    let trailers = writer.trailers().unwrap();
    assert_eq!(trailers.get("grpc-status").unwrap(), "0");
}

/// gRPC-Web carries the status block as a final 0x80 envelope instead
/// of HTTP trailers.
#[tokio::test]
async fn test_grpc_web_trailer_frame() {
    let handler = double_handler();
    let message = Codec::Json.encode(&Num { x: 5 }).unwrap();
    let request = post(
        "/acme.Foo/Bar",
        "application/grpc-web+json",
        envelope(0, &message),
    );
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 200);
    assert!(writer.trailers().is_none());
    let envelopes = parse_envelopes(writer.body());
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[1].0, FLAG_TRAILERS);
    let block = String::from_utf8(envelopes[1].1.clone()).unwrap();
    assert!(block.contains("grpc-status: 0\r\n"));
}

/// A malformed `grpc-timeout` terminates the RPC through the gRPC
/// error slot.
#[tokio::test]
async fn test_grpc_malformed_timeout() {
    let handler = double_handler();
    let mut request = post("/acme.Foo/Bar", "application/grpc", Vec::new());
    request
        .headers_mut()
        .insert("grpc-timeout", "abc".parse().unwrap());
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 200);
    let trailers = writer.trailers().unwrap();
    assert_eq!(trailers.get("grpc-status").unwrap(), "3");
}

/// A server-streaming RPC sends each message as its own envelope and
/// terminates with an empty-trailer end-of-stream frame.
#[tokio::test]
async fn test_connect_server_stream() {
    let handler = Handler::server_stream("/acme.Foo/Count", CountDown, HandlerOptions::new());
    let message = Codec::Json.encode(&Num { x: 3 }).unwrap();
    let request = post(
        "/acme.Foo/Count",
        "application/connect+json",
        envelope(0, &message),
    );
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 200);
    assert_eq!(
        writer.headers().get("content-type").unwrap(),
        "application/connect+json"
    );
    let envelopes = parse_envelopes(writer.body());
    assert_eq!(envelopes.len(), 4);
    for (i, (flags, payload)) in envelopes[..3].iter().enumerate() {
        assert_eq!(*flags, 0);
        let msg: Num = Codec::Json.decode(payload).unwrap();
        assert_eq!(msg, Num { x: i as i64 });
    }
    let (flags, payload) = &envelopes[3];
    assert_eq!(*flags, FLAG_END_STREAM);
    let end: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert!(end.get("error").is_none());
    assert_eq!(end["metadata"], serde_json::json!({}));
}

/// A client-streaming RPC consumes every request envelope before the
/// single response.
#[tokio::test]
async fn test_connect_client_stream() {
    let handler = Handler::client_stream("/acme.Foo/Sum", Sum, HandlerOptions::new());
    let mut body = Vec::new();
    for x in [1, 2, 3] {
        body.extend_from_slice(&envelope(0, &Codec::Json.encode(&Num { x }).unwrap()));
    }
    let request = post("/acme.Foo/Sum", "application/connect+json", body);
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    let envelopes = parse_envelopes(writer.body());
    assert_eq!(envelopes.len(), 2);
    let total: Num = Codec::Json.decode(&envelopes[0].1).unwrap();
    assert_eq!(total, Num { x: 6 });
    assert_eq!(envelopes[1].0, FLAG_END_STREAM);
}

/// A bidi RPC over HTTP/2 echoes every message.
#[tokio::test]
async fn test_connect_bidi_echo() {
    let handler = Handler::bidi_stream("/acme.Foo/Bidi", EchoBidi, HandlerOptions::new());
    let mut body = Vec::new();
    for x in [7, 9] {
        body.extend_from_slice(&envelope(0, &Codec::Json.encode(&Num { x }).unwrap()));
    }
    let request = post("/acme.Foo/Bidi", "application/connect+json", body);
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    let envelopes = parse_envelopes(writer.body());
    assert_eq!(envelopes.len(), 3);
    let first: Num = Codec::Json.decode(&envelopes[0].1).unwrap();
    let second: Num = Codec::Json.decode(&envelopes[1].1).unwrap();
    assert_eq!((first, second), (Num { x: 7 }, Num { x: 9 }));
    assert_eq!(envelopes[2].0, FLAG_END_STREAM);
}

/// A handler error reaches the end-of-stream frame; nothing is closed
/// twice.
#[tokio::test]
async fn test_stream_error_lands_in_end_frame() {
    struct Failing;

    #[async_trait]
    impl ServerStreamHandler for Failing {
        type Request = Num;
        type Response = Num;

        async fn handle(
            &self,
            _ctx: CallContext,
            _request: Request<Num>,
            stream: &mut ServerStream<'_, Num>,
        ) -> Result<()> {
            stream.send(&Num { x: 0 }).await?;
            Err(RpcError::new(webwire::Code::ResourceExhausted, "quota"))
        }
    }

    let handler = Handler::server_stream("/acme.Foo/Count", Failing, HandlerOptions::new());
    let message = Codec::Json.encode(&Num { x: 1 }).unwrap();
    let request = post(
        "/acme.Foo/Count",
        "application/connect+json",
        envelope(0, &message),
    );
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    let envelopes = parse_envelopes(writer.body());
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[1].0, FLAG_END_STREAM);
    let end: serde_json::Value = serde_json::from_slice(&envelopes[1].1).unwrap();
    assert_eq!(end["error"]["code"], "resource_exhausted");
    assert_eq!(end["error"]["message"], "quota");
}

/// Response-header mutations after the first send never reach the
/// wire; trailers stay mutable until the handler returns.
#[tokio::test]
async fn test_header_commit_on_first_send() {
    struct LateMutator;

    #[async_trait]
    impl ServerStreamHandler for LateMutator {
        type Request = Num;
        type Response = Num;

        async fn handle(
            &self,
            _ctx: CallContext,
            _request: Request<Num>,
            stream: &mut ServerStream<'_, Num>,
        ) -> Result<()> {
            stream
                .response_header()
                .insert("x-early", "yes".parse().unwrap());
            stream.send(&Num { x: 0 }).await?;
            stream
                .response_header()
                .insert("x-late", "no".parse().unwrap());
            stream
                .response_trailer()
                .insert("x-trailer", "kept".parse().unwrap());
            Ok(())
        }
    }

    let handler = Handler::server_stream("/acme.Foo/Count", LateMutator, HandlerOptions::new());
    let message = Codec::Json.encode(&Num { x: 1 }).unwrap();
    let request = post(
        "/acme.Foo/Count",
        "application/connect+json",
        envelope(0, &message),
    );
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    let headers = writer.headers();
    assert_eq!(headers.get("x-early").unwrap(), "yes");
    assert!(!headers.contains_key("x-late"));

    let envelopes = parse_envelopes(writer.body());
    let end: serde_json::Value = serde_json::from_slice(&envelopes.last().unwrap().1).unwrap();
    assert_eq!(end["metadata"]["x-trailer"][0], "kept");
}

/// Unary trailers surface as `trailer-` prefixed headers on the native
/// protocol.
#[tokio::test]
async fn test_connect_unary_trailer_headers() {
    let handler = Handler::unary(
        "/acme.Foo/Bar",
        |_ctx: CallContext, request: Request<Num>| async move {
            let mut response = Response::new(request.msg);
            response
                .trailer_mut()
                .insert("x-checksum", "abc".parse().unwrap());
            Ok(response)
        },
        HandlerOptions::new(),
    );
    let body = Codec::Json.encode(&Num { x: 1 }).unwrap();
    let request = post("/acme.Foo/Bar", "application/json", body);
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.headers().get("trailer-x-checksum").unwrap(), "abc");
}

/// An unregistered request encoding is rejected before the
/// implementation runs, listing the supported algorithms.
#[tokio::test]
async fn test_unknown_compression_rejected() {
    let invoked = Arc::new(AtomicBool::new(false));
    let observed = invoked.clone();
    let handler = Handler::unary(
        "/acme.Foo/Bar",
        move |_ctx: CallContext, request: Request<Num>| {
            let observed = observed.clone();
            async move {
                observed.store(true, Ordering::SeqCst);
                Ok(Response::new(request.msg))
            }
        },
        HandlerOptions::new(),
    );

    let body = Codec::Json.encode(&Num { x: 1 }).unwrap();
    let mut request = post("/acme.Foo/Bar", "application/json", body);
    request
        .headers_mut()
        .insert("content-encoding", "br".parse().unwrap());
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(writer.status().unwrap(), 501);
    assert_eq!(writer.headers().get("accept-encoding").unwrap(), "zstd");
    let error: serde_json::Value = serde_json::from_slice(writer.body()).unwrap();
    assert_eq!(error["code"], "unimplemented");
}

/// Compressed requests and responses round-trip when the encoding is
/// negotiated.
#[tokio::test]
async fn test_zstd_round_trip() {
    let handler = Handler::unary(
        "/acme.Foo/Bar",
        |_ctx: CallContext, request: Request<Num>| async move {
            Ok(Response::new(request.msg))
        },
        HandlerOptions::new(),
    );

    let plain = Codec::Json.encode(&Num { x: 11 }).unwrap();
    let compressed = webwire::Compression::Zstd.compress(&plain).unwrap();
    let mut request = post("/acme.Foo/Bar", "application/json", compressed);
    request
        .headers_mut()
        .insert("content-encoding", "zstd".parse().unwrap());
    request
        .headers_mut()
        .insert("accept-encoding", "zstd".parse().unwrap());

    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 200);
    assert_eq!(writer.headers().get("content-encoding").unwrap(), "zstd");
    let restored = webwire::Compression::Zstd.decompress(writer.body(), 0).unwrap();
    let echoed: Num = Codec::Json.decode(&restored).unwrap();
    assert_eq!(echoed, Num { x: 11 });
}

/// A valid timeout header gives the implementation a deadline-bearing
/// context.
#[tokio::test]
async fn test_timeout_header_sets_deadline() {
    let saw_deadline = Arc::new(AtomicBool::new(false));
    let observed = saw_deadline.clone();
    let handler = Handler::unary(
        "/acme.Foo/Bar",
        move |ctx: CallContext, request: Request<Num>| {
            let observed = observed.clone();
            async move {
                observed.store(ctx.deadline().is_some(), Ordering::SeqCst);
                Ok(Response::new(request.msg))
            }
        },
        HandlerOptions::new(),
    );

    let body = Codec::Json.encode(&Num { x: 1 }).unwrap();
    let mut request = post("/acme.Foo/Bar", "application/json", body);
    request
        .headers_mut()
        .insert("connect-timeout-ms", "10000".parse().unwrap());
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    assert_eq!(writer.status().unwrap(), 200);
    assert!(saw_deadline.load(Ordering::SeqCst));
}

/// Scenario S6: a stream carrying two messages fails
/// `receive_unary_response` with code Unknown.
#[tokio::test]
async fn test_receive_unary_response_multiple_messages() {
    use bytes::Bytes;
    use parking_lot::{Mutex, MutexGuard};
    use webwire::{BoxFuture, Peer, Spec, StreamType, StreamingClientConn};

    struct TwoMessageConn {
        spec: Spec,
        peer: Peer,
        remaining: Mutex<Vec<Bytes>>,
        request_header: Mutex<HeaderMap>,
        response_header: Mutex<HeaderMap>,
        response_trailer: Mutex<HeaderMap>,
    }

    impl StreamingClientConn for TwoMessageConn {
        fn spec(&self) -> &Spec {
            &self.spec
        }

        fn peer(&self) -> &Peer {
            &self.peer
        }

        fn codec(&self) -> Codec {
            Codec::Json
        }

        fn send(&self, _message: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn request_header(&self) -> MutexGuard<'_, HeaderMap> {
            self.request_header.lock()
        }

        fn close_request(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn receive(&self) -> BoxFuture<'_, Result<Option<Bytes>>> {
            Box::pin(async {
                let mut remaining = self.remaining.lock();
                if remaining.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(remaining.remove(0)))
                }
            })
        }

        fn response_header(&self) -> MutexGuard<'_, HeaderMap> {
            self.response_header.lock()
        }

        fn response_trailer(&self) -> MutexGuard<'_, HeaderMap> {
            self.response_trailer.lock()
        }

        fn close_response(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    let message = Bytes::from(Codec::Json.encode(&Num { x: 1 }).unwrap());
    let conn = TwoMessageConn {
        spec: Spec {
            stream_type: StreamType::Unary,
            procedure: "/acme.Foo/Bar".to_string(),
            is_client: true,
        },
        peer: Peer::default(),
        remaining: Mutex::new(vec![message.clone(), message]),
        request_header: Mutex::new(HeaderMap::new()),
        response_header: Mutex::new(HeaderMap::new()),
        response_trailer: Mutex::new(HeaderMap::new()),
    };

    let err = webwire::receive_unary_response::<Num>(&conn)
        .await
        .unwrap_err();
    assert_eq!(err.code(), webwire::Code::Unknown);
    assert_eq!(err.message(), "unary stream has multiple messages");
}

/// Compressed streaming envelopes are flagged and decompress on
/// receive.
#[tokio::test]
async fn test_compressed_stream_envelope() {
    let handler = Handler::client_stream("/acme.Foo/Sum", Sum, HandlerOptions::new());
    let plain = Codec::Json.encode(&Num { x: 40 }).unwrap();
    let compressed = webwire::Compression::Zstd.compress(&plain).unwrap();
    let mut body = envelope(FLAG_COMPRESSED, &compressed);
    body.extend_from_slice(&envelope(0, &Codec::Json.encode(&Num { x: 2 }).unwrap()));

    let mut request = post("/acme.Foo/Sum", "application/connect+json", body);
    request
        .headers_mut()
        .insert("connect-content-encoding", "zstd".parse().unwrap());
    let mut writer = RecordingResponseWriter::new();
    handler.serve(&mut writer, request).await;

    let envelopes = parse_envelopes(writer.body());
    let total: Num = Codec::Json.decode(&envelopes[0].1).unwrap();
    assert_eq!(total, Num { x: 42 });
}
