//! The gRPC and gRPC-Web protocol adapters.
//!
//! Both directions are enveloped. The terminal status travels as
//! `grpc-status`/`grpc-message` trailers: real HTTP trailers for gRPC
//! over HTTP/2, or a final 0x80-flagged envelope of `key: value` lines
//! for gRPC-Web. One adapter type serves both, switched by the `web`
//! flag, so their behavior cannot drift apart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::buffer::BufferPool;
use crate::codec::{Codec, CODEC_NAME_MSGPACK};
use crate::compress::Compression;
use crate::conn::{BoxFuture, HandlerConnCloser, StreamingHandlerConn};
use crate::context::{CallContext, CancelGuard};
use crate::envelope::{merge_headers, Peer, Spec};
use crate::error::{Code, Result, RpcError};
use crate::protocol::frame::{encode_envelope, FrameReader, FLAG_COMPRESSED, FLAG_TRAILERS};
use crate::protocol::{apply_timeout, peer_from_request, ProtocolHandler, ProtocolHandlerParams};
use crate::transport::{ResponseWriter, ServerRequest};

const HEADER_TIMEOUT: &str = "grpc-timeout";
const HEADER_ENCODING: &str = "grpc-encoding";
const HEADER_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
const HEADER_STATUS: &str = "grpc-status";
const HEADER_MESSAGE: &str = "grpc-message";

/// Percent-encode a `grpc-message` value: everything outside the
/// printable ASCII range, plus `%` itself, becomes `%XX`.
fn percent_encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7E).contains(&byte) && byte != b'%' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Build the terminal trailer block for one exchange.
fn status_trailers(error: Option<&RpcError>, user_trailer: &HeaderMap) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    merge_headers(&mut trailers, user_trailer);
    match error {
        None => {
            trailers.insert(HEADER_STATUS, HeaderValue::from_static("0"));
        }
        Some(err) => {
            if let Ok(value) = HeaderValue::from_str(&err.code().as_u32().to_string()) {
                trailers.insert(HEADER_STATUS, value);
            }
            if !err.message().is_empty() {
                if let Ok(value) = HeaderValue::from_str(&percent_encode_message(err.message())) {
                    trailers.insert(HEADER_MESSAGE, value);
                }
            }
        }
    }
    trailers
}

/// Serialize a trailer map as the gRPC-Web in-body block.
fn web_trailer_block(trailers: &HeaderMap) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in trailers.iter() {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    block
}

fn context_error(ctx: &CallContext) -> RpcError {
    ctx.error()
        .unwrap_or_else(|| RpcError::new(Code::Canceled, "canceled"))
}

/// Handler-side adapter for gRPC (`web: false`) and gRPC-Web
/// (`web: true`).
pub(crate) struct GrpcHandler {
    web: bool,
    params: ProtocolHandlerParams,
    content_types: HashSet<String>,
}

impl GrpcHandler {
    pub(crate) fn new(web: bool, params: ProtocolHandlerParams) -> Self {
        let bare = if web {
            "application/grpc-web"
        } else {
            "application/grpc"
        };
        let mut content_types: HashSet<String> = params
            .codecs
            .names()
            .map(|name| format!("{bare}+{name}"))
            .collect();
        content_types.insert(bare.to_string());
        Self {
            web,
            params,
            content_types,
        }
    }

    fn codec_for(&self, content_type: &str) -> Option<Codec> {
        let bare = if self.web {
            "application/grpc-web"
        } else {
            "application/grpc"
        };
        let rest = content_type.strip_prefix(bare)?;
        match rest.strip_prefix('+') {
            // The bare content type implies the binary codec.
            None if rest.is_empty() => self.params.codecs.get(CODEC_NAME_MSGPACK),
            Some(name) => self.params.codecs.get(name),
            None => None,
        }
    }

    /// Reject an unknown request encoding with a trailers-only
    /// response.
    async fn reject_unknown_encoding(
        &self,
        writer: &mut dyn ResponseWriter,
        content_type: HeaderValue,
        token: &str,
    ) {
        let err = RpcError::new(
            Code::Unimplemented,
            format!(
                "unknown compression {token:?}: supported encodings are {}",
                self.params.compression_pools.comma_separated_names()
            ),
        );
        let result: std::io::Result<()> = async {
            let names = self.params.compression_pools.comma_separated_names();
            let headers = writer.header_mut();
            headers.insert(CONTENT_TYPE, content_type);
            if let Ok(value) = HeaderValue::from_str(&names) {
                headers.insert(HEADER_ACCEPT_ENCODING, value);
            }
            writer.write_head(StatusCode::OK).await?;
            let trailers = status_trailers(Some(&err), &HeaderMap::new());
            if self.web {
                let block = web_trailer_block(&trailers);
                let envelope = encode_envelope(&self.params.buffer_pool, FLAG_TRAILERS, &block);
                writer.write(envelope).await?;
            } else {
                writer.write_trailers(trailers).await?;
            }
            Ok(())
        }
        .await;
        if let Err(io_err) = result {
            tracing::debug!(error = %io_err, "failed to write encoding rejection");
        }
    }
}

impl ProtocolHandler for GrpcHandler {
    fn content_types(&self) -> &HashSet<String> {
        &self.content_types
    }

    fn set_timeout(
        &self,
        ctx: &CallContext,
        headers: &HeaderMap,
    ) -> (CallContext, Option<CancelGuard>, Option<RpcError>) {
        let parsed = match headers.get(HEADER_TIMEOUT).and_then(|v| v.to_str().ok()) {
            None => Ok(None),
            Some(value) => parse_grpc_timeout(value).map(Some),
        };
        apply_timeout(ctx, parsed)
    }

    fn new_conn<'a>(
        &'a self,
        writer: &'a mut dyn ResponseWriter,
        request: ServerRequest,
    ) -> BoxFuture<'a, Option<Box<dyn HandlerConnCloser + 'a>>> {
        Box::pin(async move {
            let peer = peer_from_request(&request);
            let (parts, body) = request.into_parts();
            let ctx = parts
                .extensions
                .get::<CallContext>()
                .cloned()
                .unwrap_or_default();

            let content_type_value = parts
                .headers
                .get(CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/grpc"));
            let content_type = content_type_value.to_str().unwrap_or_default().to_string();
            let Some(codec) = self.codec_for(&content_type) else {
                tracing::error!(%content_type, "no codec for negotiated content type");
                return None;
            };

            let token = parts
                .headers
                .get(HEADER_ENCODING)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            let request_compression = if token.is_empty() || token == "identity" {
                None
            } else {
                match self.params.compression_pools.get(&token) {
                    Some(pool) => Some(pool),
                    None => {
                        self.reject_unknown_encoding(writer, content_type_value, &token)
                            .await;
                        return None;
                    }
                }
            };

            let response_compression = parts
                .headers
                .get(HEADER_ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .and_then(|accept| self.params.compression_pools.negotiate(accept));

            let reader = FrameReader::new(
                body,
                self.params.buffer_pool.clone(),
                self.params.read_max_bytes,
            );
            let conn = GrpcConn {
                web: self.web,
                spec: self.params.spec.clone(),
                peer,
                codec,
                ctx,
                content_type: content_type_value,
                request_header: parts.headers,
                reader,
                request_compression,
                writer,
                response_header: HeaderMap::new(),
                response_trailer: HeaderMap::new(),
                response_compression,
                compress_min_bytes: self.params.compress_min_bytes,
                read_max_bytes: self.params.read_max_bytes,
                send_max_bytes: self.params.send_max_bytes,
                accept_encoding: self.params.compression_pools.comma_separated_names(),
                pool: self.params.buffer_pool.clone(),
                committed: false,
            };
            Some(Box::new(conn) as Box<dyn HandlerConnCloser + 'a>)
        })
    }
}

/// Parse a `grpc-timeout` value: one to eight ASCII digits followed by
/// a unit letter.
fn parse_grpc_timeout(value: &str) -> Result<Duration> {
    let malformed = || {
        RpcError::new(
            Code::InvalidArgument,
            format!("protocol error: invalid timeout {value:?}"),
        )
    };
    if value.len() < 2 || value.len() > 9 {
        return Err(malformed());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let amount: u64 = digits.parse().map_err(|_| malformed())?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return Err(malformed()),
    };
    Ok(duration)
}

/// One gRPC or gRPC-Web exchange.
struct GrpcConn<'a> {
    web: bool,
    spec: Spec,
    peer: Peer,
    codec: Codec,
    ctx: CallContext,
    content_type: HeaderValue,
    request_header: HeaderMap,
    reader: FrameReader,
    request_compression: Option<Compression>,
    writer: &'a mut dyn ResponseWriter,
    response_header: HeaderMap,
    response_trailer: HeaderMap,
    response_compression: Option<Compression>,
    compress_min_bytes: usize,
    read_max_bytes: usize,
    send_max_bytes: usize,
    accept_encoding: String,
    pool: Arc<BufferPool>,
    committed: bool,
}

impl GrpcConn<'_> {
    async fn commit_head(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        let response_header = std::mem::take(&mut self.response_header);
        let content_type = self.content_type.clone();
        let accept_encoding = HeaderValue::from_str(&self.accept_encoding).ok();
        let encoding = self
            .response_compression
            .map(|c| HeaderValue::from_static(c.name()));
        let headers = self.writer.header_mut();
        merge_headers(headers, &response_header);
        headers.insert(CONTENT_TYPE, content_type);
        if let Some(value) = accept_encoding {
            headers.insert(HEADER_ACCEPT_ENCODING, value);
        }
        if let Some(value) = encoding {
            headers.insert(HEADER_ENCODING, value);
        }
        self.writer.write_head(StatusCode::OK).await?;
        Ok(())
    }
}

impl StreamingHandlerConn for GrpcConn<'_> {
    fn spec(&self) -> &Spec {
        &self.spec
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn codec(&self) -> Codec {
        self.codec
    }

    fn request_header(&self) -> &HeaderMap {
        &self.request_header
    }

    fn receive(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            let ctx = self.ctx.clone();
            let envelope = tokio::select! {
                result = self.reader.next_envelope() => result?,
                _ = ctx.cancelled() => return Err(context_error(&ctx)),
            };
            match envelope {
                None => Ok(None),
                Some(envelope) => {
                    if envelope.flags & FLAG_TRAILERS != 0 {
                        return Err(RpcError::new(
                            Code::Unknown,
                            "protocol error: unexpected trailer frame from client",
                        ));
                    }
                    if envelope.is_compressed() {
                        let Some(compression) = self.request_compression else {
                            return Err(RpcError::new(
                                Code::InvalidArgument,
                                "protocol error: compressed envelope without grpc-encoding",
                            ));
                        };
                        let payload = compression
                            .decompress(&envelope.payload, self.read_max_bytes)?;
                        return Ok(Some(Bytes::from(payload)));
                    }
                    Ok(Some(envelope.payload))
                }
            }
        })
    }

    fn send(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.send_max_bytes > 0 && message.len() > self.send_max_bytes {
                return Err(RpcError::new(
                    Code::ResourceExhausted,
                    format!(
                        "message size {} exceeds limit of {} bytes",
                        message.len(),
                        self.send_max_bytes
                    ),
                ));
            }
            self.commit_head().await?;
            let mut payload = message;
            let mut flags = 0;
            if let Some(compression) = self.response_compression {
                if payload.len() >= self.compress_min_bytes {
                    payload = Bytes::from(compression.compress(&payload)?);
                    flags |= FLAG_COMPRESSED;
                }
            }
            let envelope = encode_envelope(&self.pool, flags, &payload);
            self.writer.write(envelope).await?;
            Ok(())
        })
    }

    fn response_header(&mut self) -> &mut HeaderMap {
        &mut self.response_header
    }

    fn response_trailer(&mut self) -> &mut HeaderMap {
        &mut self.response_trailer
    }
}

impl HandlerConnCloser for GrpcConn<'_> {
    fn close(&mut self, error: Option<RpcError>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.commit_head().await?;
            let user_trailer = std::mem::take(&mut self.response_trailer);
            let trailers = status_trailers(error.as_ref(), &user_trailer);
            if self.web {
                let block = web_trailer_block(&trailers);
                let envelope = encode_envelope(&self.pool, FLAG_TRAILERS, &block);
                self.writer.write(envelope).await?;
            } else {
                self.writer.write_trailers(trailers).await?;
            }
            match error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}
