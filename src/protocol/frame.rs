//! Envelope framing shared by the streaming wire protocols.
//!
//! Each streamed message rides in an envelope with a 5-byte prefix:
//! ```text
//! ┌────────┬───────────────┬─────────────┐
//! │ Flags  │ Length        │ Payload     │
//! │ 1 byte │ 4 bytes u32 BE│ N bytes     │
//! └────────┴───────────────┴─────────────┘
//! ```
//! Flag bit 0 marks a compressed payload. The Connect streaming
//! protocol uses bit 1 for its end-of-stream frame; gRPC-Web uses bit
//! 7 for its in-body trailer frame.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use crate::buffer::BufferPool;
use crate::error::{Code, Result, RpcError};
use crate::transport::RequestBody;

/// Payload is compressed with the negotiated algorithm.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Connect streaming end-of-stream frame.
pub const FLAG_END_STREAM: u8 = 0b0000_0010;

/// gRPC-Web in-body trailer frame.
pub const FLAG_TRAILERS: u8 = 0b1000_0000;

/// Size of the envelope prefix (flag byte + length).
pub const ENVELOPE_PREFIX_SIZE: usize = 5;

/// One framed message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Flag byte.
    pub flags: u8,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Envelope {
    /// Whether the payload is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Encode an envelope into a single buffer borrowed from the pool.
pub fn encode_envelope(pool: &BufferPool, flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = pool.acquire();
    buf.reserve(ENVELOPE_PREFIX_SIZE + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    let encoded = buf.split().freeze();
    pool.release(buf);
    encoded
}

/// Incremental envelope reader over a request body.
///
/// Accumulates partial reads in a pooled buffer and extracts complete
/// envelopes; oversized payloads fail before they are buffered in
/// full.
pub struct FrameReader {
    body: RequestBody,
    buffer: BytesMut,
    pool: Arc<BufferPool>,
    read_max_bytes: usize,
    eof: bool,
}

impl FrameReader {
    /// Create a reader over `body`. `read_max_bytes` caps individual
    /// payloads (0 = unlimited).
    pub fn new(body: RequestBody, pool: Arc<BufferPool>, read_max_bytes: usize) -> Self {
        let buffer = pool.acquire();
        Self {
            body,
            buffer,
            pool,
            read_max_bytes,
            eof: false,
        }
    }

    /// Read the next complete envelope, or `Ok(None)` at a clean end
    /// of stream.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.try_extract()? {
                return Ok(Some(envelope));
            }
            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::new(
                    Code::Unknown,
                    "protocol error: incomplete envelope at end of stream",
                ));
            }
            let n = self.body.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }

    fn try_extract(&mut self) -> Result<Option<Envelope>> {
        if self.buffer.len() < ENVELOPE_PREFIX_SIZE {
            return Ok(None);
        }
        let flags = self.buffer[0];
        let length = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if self.read_max_bytes > 0 && length > self.read_max_bytes {
            return Err(RpcError::new(
                Code::ResourceExhausted,
                format!(
                    "message size {length} exceeds limit of {} bytes",
                    self.read_max_bytes
                ),
            ));
        }
        if self.buffer.len() < ENVELOPE_PREFIX_SIZE + length {
            return Ok(None);
        }
        self.buffer.advance(ENVELOPE_PREFIX_SIZE);
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some(Envelope { flags, payload }))
    }

    /// Read the remainder of the body as one unframed message (the
    /// Connect unary shape), enforcing the payload cap.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        while !self.eof {
            if self.read_max_bytes > 0 && self.buffer.len() > self.read_max_bytes {
                return Err(RpcError::new(
                    Code::ResourceExhausted,
                    format!(
                        "message size exceeds limit of {} bytes",
                        self.read_max_bytes
                    ),
                ));
            }
            let n = self.body.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.eof = true;
            }
        }
        if self.read_max_bytes > 0 && self.buffer.len() > self.read_max_bytes {
            return Err(RpcError::new(
                Code::ResourceExhausted,
                format!("message size exceeds limit of {} bytes", self.read_max_bytes),
            ));
        }
        Ok(self.buffer.split().freeze())
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}
