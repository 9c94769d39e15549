// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Length-prefixed frame codec and the framed connection used by both ends.
//!
//! ```text
//! ┌───────────────┬──────────────────────────────┐
//! │ len: u32 (BE) │ JSON-encoded Message (len B) │
//! └───────────────┴──────────────────────────────┘
//! ```

use super::Message;
use crate::error::{ReplicationError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body. Larger frames are a codec fault.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Most a partial frame reserves ahead; larger bodies grow the buffer as
/// bytes arrive.
const READ_CHUNK: usize = 8 * 1024;

/// Byte stream a connection runs over (plain TCP or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Append one encoded frame to `dst`.
pub fn encode_frame(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ReplicationError::Codec(format!(
            "{} frame of {} bytes exceeds limit of {}",
            message.kind(),
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    dst.reserve(LEN_PREFIX + body.len());
    dst.put_u32(body.len() as u32);
    dst.put_slice(&body);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
/// buffer is left untouched in that case. A complete frame is consumed even
/// if its body fails to decode.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Message>> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ReplicationError::Codec(format!(
            "frame length {} exceeds limit of {}",
            len, MAX_FRAME_BYTES
        )));
    }
    if src.len() < LEN_PREFIX + len {
        src.reserve((LEN_PREFIX + len - src.len()).min(READ_CHUNK));
        return Ok(None);
    }

    src.advance(LEN_PREFIX);
    let body = src.split_to(len);
    let message = serde_json::from_slice(&body)?;
    Ok(Some(message))
}

/// A message-oriented connection over a byte stream.
///
/// Reads are cancel-safe: partially received frames stay buffered.
/// The connection is closed when dropped.
pub struct FramedConnection {
    stream: BoxedStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    peer: String,
}

impl FramedConnection {
    pub fn new(stream: BoxedStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            peer: peer.into(),
        }
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Encode and write one message, then flush.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.write_buf.clear();
        encode_frame(message, &mut self.write_buf)?;
        self.stream
            .write_all(&self.write_buf)
            .await
            .map_err(|e| ReplicationError::io("write_frame", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ReplicationError::io("flush", e))
    }

    /// Read the next message.
    pub async fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = decode_frame(&mut self.read_buf)? {
                return Ok(message);
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| ReplicationError::io("read_frame", e))?;
            if n == 0 {
                let detail = if self.read_buf.is_empty() {
                    "connection closed by peer"
                } else {
                    "connection closed mid-frame"
                };
                return Err(ReplicationError::io_msg("read_frame", detail));
            }
        }
    }

    /// Graceful close (TLS close_notify / TCP FIN). Errors are ignored.
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
