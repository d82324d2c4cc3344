//! The native Connect-style protocol adapter.
//!
//! Unary RPCs put the bare encoded message in the request/response
//! bodies; errors become a JSON body with a mapped HTTP status, and
//! response trailers travel as `trailer-` prefixed headers. Streaming
//! RPCs use enveloped messages and terminate with an end-of-stream
//! frame (flag 0x02) whose JSON payload carries the optional error and
//! the trailer metadata.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::buffer::BufferPool;
use crate::codec::Codec;
use crate::compress::Compression;
use crate::conn::{BoxFuture, HandlerConnCloser, StreamingHandlerConn};
use crate::context::{CallContext, CancelGuard};
use crate::envelope::{merge_headers, Peer, Spec, StreamType};
use crate::error::{Code, Result, RpcError};
use crate::protocol::frame::{encode_envelope, FrameReader, FLAG_COMPRESSED, FLAG_END_STREAM};
use crate::protocol::{apply_timeout, peer_from_request, ProtocolHandler, ProtocolHandlerParams};
use crate::transport::{ResponseWriter, ServerRequest};

const HEADER_TIMEOUT: &str = "connect-timeout-ms";
const HEADER_UNARY_ENCODING: &str = "content-encoding";
const HEADER_UNARY_ACCEPT_ENCODING: &str = "accept-encoding";
const HEADER_STREAM_ENCODING: &str = "connect-content-encoding";
const HEADER_STREAM_ACCEPT_ENCODING: &str = "connect-accept-encoding";

const UNARY_PREFIX: &str = "application/";
const STREAM_PREFIX: &str = "application/connect+";

/// Map a status code to the Connect protocol's HTTP status.
fn connect_http_status(code: Code) -> StatusCode {
    match code {
        Code::Canceled => StatusCode::REQUEST_TIMEOUT,
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

fn unary_content_type(codec: Codec) -> HeaderValue {
    match codec {
        Codec::MsgPack => HeaderValue::from_static("application/msgpack"),
        Codec::Json => HeaderValue::from_static("application/json"),
    }
}

fn stream_content_type(codec: Codec) -> HeaderValue {
    match codec {
        Codec::MsgPack => HeaderValue::from_static("application/connect+msgpack"),
        Codec::Json => HeaderValue::from_static("application/connect+json"),
    }
}

/// Serialize an error for the Connect wire: snake-case code, message,
/// optional details.
fn error_value(err: &RpcError) -> serde_json::Value {
    let mut value = serde_json::json!({ "code": err.code().name() });
    if !err.message().is_empty() {
        value["message"] = serde_json::Value::String(err.message().to_string());
    }
    if !err.details().is_empty() {
        value["details"] = serde_json::Value::Array(err.details().to_vec());
    }
    value
}

/// Serialize the end-of-stream frame payload: optional error plus the
/// trailer metadata as a multimap.
fn end_stream_value(err: Option<&RpcError>, trailer: &HeaderMap) -> serde_json::Value {
    let mut metadata = serde_json::Map::new();
    for name in trailer.keys() {
        let values: Vec<serde_json::Value> = trailer
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| serde_json::Value::String(v.to_string()))
            .collect();
        metadata.insert(name.as_str().to_string(), serde_json::Value::Array(values));
    }
    let mut value = serde_json::json!({ "metadata": serde_json::Value::Object(metadata) });
    if let Some(err) = err {
        value["error"] = error_value(err);
    }
    value
}

/// Copy response trailers into the header map with the unary protocol's
/// `trailer-` prefix.
fn merge_prefixed_trailers(headers: &mut HeaderMap, trailer: &HeaderMap) {
    for (name, value) in trailer.iter() {
        match HeaderName::from_bytes(format!("trailer-{name}").as_bytes()) {
            Ok(prefixed) => {
                headers.append(prefixed, value.clone());
            }
            Err(_) => tracing::warn!(name = %name, "dropping unencodable trailer"),
        }
    }
}

fn context_error(ctx: &CallContext) -> RpcError {
    ctx.error()
        .unwrap_or_else(|| RpcError::new(Code::Canceled, "canceled"))
}

/// Handler-side adapter for the Connect protocol.
pub(crate) struct ConnectHandler {
    params: ProtocolHandlerParams,
    content_types: HashSet<String>,
}

impl ConnectHandler {
    pub(crate) fn new(params: ProtocolHandlerParams) -> Self {
        let streaming = params.spec.stream_type != StreamType::Unary;
        let prefix = if streaming { STREAM_PREFIX } else { UNARY_PREFIX };
        let content_types = params
            .codecs
            .names()
            .map(|name| format!("{prefix}{name}"))
            .collect();
        Self {
            params,
            content_types,
        }
    }

    fn streaming(&self) -> bool {
        self.params.spec.stream_type != StreamType::Unary
    }

    fn codec_for(&self, content_type: &str) -> Option<Codec> {
        let prefix = if self.streaming() { STREAM_PREFIX } else { UNARY_PREFIX };
        let name = content_type.strip_prefix(prefix)?;
        self.params.codecs.get(name)
    }

    /// Reject a request whose compression encoding is not registered.
    /// The unary shape gets an error body; the streaming shape gets a
    /// 200 with an end-of-stream error frame.
    async fn reject_unknown_encoding(
        &self,
        writer: &mut dyn ResponseWriter,
        codec: Codec,
        token: &str,
    ) {
        let err = RpcError::new(
            Code::Unimplemented,
            format!(
                "unknown compression {token:?}: supported encodings are {}",
                self.params.compression_pools.comma_separated_names()
            ),
        );
        let names = self.params.compression_pools.comma_separated_names();
        let result: std::io::Result<()> = async {
            if self.streaming() {
                let headers = writer.header_mut();
                headers.insert(CONTENT_TYPE, stream_content_type(codec));
                if let Ok(value) = HeaderValue::from_str(&names) {
                    headers.insert(HEADER_STREAM_ACCEPT_ENCODING, value);
                }
                writer.write_head(StatusCode::OK).await?;
                let end = end_stream_value(Some(&err), &HeaderMap::new());
                let payload = end.to_string();
                let envelope =
                    encode_envelope(&self.params.buffer_pool, FLAG_END_STREAM, payload.as_bytes());
                writer.write(envelope).await?;
            } else {
                let headers = writer.header_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                if let Ok(value) = HeaderValue::from_str(&names) {
                    headers.insert(HEADER_UNARY_ACCEPT_ENCODING, value);
                }
                writer.write_head(connect_http_status(err.code())).await?;
                writer.write(Bytes::from(error_value(&err).to_string())).await?;
            }
            Ok(())
        }
        .await;
        if let Err(io_err) = result {
            tracing::debug!(error = %io_err, "failed to write encoding rejection");
        }
    }
}

impl ProtocolHandler for ConnectHandler {
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
            Some(value) => {
                if value.is_empty()
                    || value.len() > 10
                    || !value.bytes().all(|b| b.is_ascii_digit())
                {
                    Err(RpcError::new(
                        Code::InvalidArgument,
                        format!("protocol error: invalid timeout {value:?}"),
                    ))
                } else {
                    // Guaranteed to fit: at most ten ASCII digits.
                    Ok(value.parse::<u64>().ok().map(Duration::from_millis))
                }
            }
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

            let content_type = parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let Some(codec) = self.codec_for(content_type) else {
                // The dispatcher only routes here on a content-type
                // match, so a missing codec is a registry mismatch.
                tracing::error!(%content_type, "no codec for negotiated content type");
                return None;
            };

            let encoding_header = if self.streaming() {
                HEADER_STREAM_ENCODING
            } else {
                HEADER_UNARY_ENCODING
            };
            let token = parts
                .headers
                .get(encoding_header)
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
                        self.reject_unknown_encoding(writer, codec, &token).await;
                        return None;
                    }
                }
            };

            let accept_header = if self.streaming() {
                HEADER_STREAM_ACCEPT_ENCODING
            } else {
                HEADER_UNARY_ACCEPT_ENCODING
            };
            let response_compression = parts
                .headers
                .get(accept_header)
                .and_then(|v| v.to_str().ok())
                .and_then(|accept| self.params.compression_pools.negotiate(accept));

            let reader = FrameReader::new(
                body,
                self.params.buffer_pool.clone(),
                self.params.read_max_bytes,
            );
            let conn = ConnectConn {
                streaming: self.streaming(),
                spec: self.params.spec.clone(),
                peer,
                codec,
                ctx,
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
                pool: self.params.buffer_pool.clone(),
                received: false,
                committed: false,
            };
            Some(Box::new(conn) as Box<dyn HandlerConnCloser + 'a>)
        })
    }
}

/// One Connect exchange. The unary and streaming shapes share state
/// and differ in how messages and errors reach the body.
struct ConnectConn<'a> {
    streaming: bool,
    spec: Spec,
    peer: Peer,
    codec: Codec,
    ctx: CallContext,
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
    pool: Arc<BufferPool>,
    received: bool,
    committed: bool,
}

impl ConnectConn<'_> {
    /// Commit the response head. Header-map mutations after this point
    /// are silently dropped.
    async fn commit_head(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        let content_type = if self.streaming {
            stream_content_type(self.codec)
        } else {
            unary_content_type(self.codec)
        };
        let response_header = std::mem::take(&mut self.response_header);
        let headers = self.writer.header_mut();
        merge_headers(headers, &response_header);
        headers.insert(CONTENT_TYPE, content_type);
        if self.streaming {
            if let Some(compression) = self.response_compression {
                headers.insert(
                    HEADER_STREAM_ENCODING,
                    HeaderValue::from_static(compression.name()),
                );
            }
        } else {
            // Unary trailers travel as prefixed headers and must be
            // known before the head is written.
            let trailer = std::mem::take(&mut self.response_trailer);
            merge_prefixed_trailers(headers, &trailer);
        }
        self.writer.write_head(StatusCode::OK).await?;
        Ok(())
    }

    fn check_send_limit(&self, size: usize) -> Result<()> {
        if self.send_max_bytes > 0 && size > self.send_max_bytes {
            return Err(RpcError::new(
                Code::ResourceExhausted,
                format!(
                    "message size {size} exceeds limit of {} bytes",
                    self.send_max_bytes
                ),
            ));
        }
        Ok(())
    }

    fn decompress_request(&self, payload: Bytes) -> Result<Bytes> {
        match self.request_compression {
            Some(compression) => Ok(Bytes::from(
                compression.decompress(&payload, self.read_max_bytes)?,
            )),
            None => Ok(payload),
        }
    }
}

impl StreamingHandlerConn for ConnectConn<'_> {
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
            if self.streaming {
                let envelope = tokio::select! {
                    result = self.reader.next_envelope() => result?,
                    _ = ctx.cancelled() => return Err(context_error(&ctx)),
                };
                match envelope {
                    None => Ok(None),
                    Some(envelope) => {
                        if envelope.flags & FLAG_END_STREAM != 0 {
                            return Err(RpcError::new(
                                Code::Unknown,
                                "protocol error: unexpected end-of-stream frame from client",
                            ));
                        }
                        if envelope.is_compressed() {
                            if self.request_compression.is_none() {
                                return Err(RpcError::new(
                                    Code::InvalidArgument,
                                    "protocol error: compressed envelope without declared encoding",
                                ));
                            }
                            return Ok(Some(self.decompress_request(envelope.payload)?));
                        }
                        Ok(Some(envelope.payload))
                    }
                }
            } else {
                // The unary request is the whole body; a second
                // receive observes end of stream.
                if self.received {
                    return Ok(None);
                }
                self.received = true;
                let body = tokio::select! {
                    result = self.reader.read_to_end() => result?,
                    _ = ctx.cancelled() => return Err(context_error(&ctx)),
                };
                Ok(Some(self.decompress_request(body)?))
            }
        })
    }

    fn send(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_send_limit(message.len())?;
            let mut payload = message;
            let mut compressed = false;
            if let Some(compression) = self.response_compression {
                if payload.len() >= self.compress_min_bytes {
                    payload = Bytes::from(compression.compress(&payload)?);
                    compressed = true;
                    if !self.streaming {
                        self.response_header.insert(
                            HEADER_UNARY_ENCODING,
                            HeaderValue::from_static(compression.name()),
                        );
                    }
                }
            }
            self.commit_head().await?;
            if self.streaming {
                let flags = if compressed { FLAG_COMPRESSED } else { 0 };
                let envelope = encode_envelope(&self.pool, flags, &payload);
                self.writer.write(envelope).await?;
            } else {
                self.writer.write(payload).await?;
            }
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

impl HandlerConnCloser for ConnectConn<'_> {
    fn close(&mut self, error: Option<RpcError>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.streaming {
                self.commit_head().await?;
                let trailer = std::mem::take(&mut self.response_trailer);
                let end = end_stream_value(error.as_ref(), &trailer);
                let envelope =
                    encode_envelope(&self.pool, FLAG_END_STREAM, end.to_string().as_bytes());
                self.writer.write(envelope).await?;
                match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            } else {
                match error {
                    None => {
                        self.commit_head().await?;
                        Ok(())
                    }
                    Some(err) => {
                        if self.committed {
                            // The head is on the wire; the error can
                            // no longer be encoded for this exchange.
                            tracing::warn!(
                                procedure = %self.spec.procedure,
                                error = %err,
                                "error after unary response was committed",
                            );
                            return Err(err);
                        }
                        self.committed = true;
                        let response_header = std::mem::take(&mut self.response_header);
                        let trailer = std::mem::take(&mut self.response_trailer);
                        let headers = self.writer.header_mut();
                        merge_headers(headers, &response_header);
                        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                        merge_prefixed_trailers(headers, &trailer);
                        self.writer.write_head(connect_http_status(err.code())).await?;
                        self.writer
                            .write(Bytes::from(error_value(&err).to_string()))
                            .await?;
                        Err(err)
                    }
                }
            }
        })
    }
}
