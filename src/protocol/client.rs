// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client side of the protocol over a single connection.

use super::{Capabilities, FramedConnection, HandshakeResponse, Message, SeqnoRange};
use crate::error::{ReplicationError, Result};
use crate::event::ReplicatedEvent;
use std::time::Duration;
use tracing::trace;

/// Reads from one server connection. Every read is bounded by `read_timeout`;
/// heartbeats reset it and are otherwise invisible to callers.
pub struct ProtocolClient {
    conn: FramedConnection,
    read_timeout: Duration,
}

impl ProtocolClient {
    pub fn new(conn: FramedConnection, read_timeout: Duration) -> Self {
        Self { conn, read_timeout }
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn set_read_timeout(&mut self, read_timeout: Duration) {
        self.read_timeout = read_timeout;
    }

    async fn recv(&mut self, operation: &str) -> Result<Message> {
        match tokio::time::timeout(self.read_timeout, self.conn.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::timeout(operation, self.read_timeout)),
        }
    }

    /// Read the server's capabilities (first frame of every connection).
    pub async fn read_capabilities(&mut self) -> Result<Capabilities> {
        match self.recv("read_capabilities").await? {
            Message::Handshake(capabilities) => Ok(capabilities),
            other => Err(ReplicationError::Protocol(format!(
                "expected handshake, received {}",
                other.kind()
            ))),
        }
    }

    /// Send the handshake response and wait for the verdict.
    pub async fn complete_handshake(&mut self, response: HandshakeResponse) -> Result<SeqnoRange> {
        self.conn.send(&Message::HandshakeResponse(response)).await?;
        match self.recv("read_handshake_reply").await? {
            Message::Ok(range) => Ok(range),
            Message::Nok { reason } => Err(ReplicationError::HandshakeRejected { reason }),
            other => Err(ReplicationError::Protocol(format!(
                "expected ok or nok, received {}",
                other.kind()
            ))),
        }
    }

    pub async fn request_events(&mut self, seqno: u64, prefetch_range: u32) -> Result<()> {
        self.conn
            .send(&Message::EventRequest {
                seqno,
                prefetch_range,
            })
            .await
    }

    /// Read the next event frame, skipping heartbeats. A batch frame yields
    /// all of its events.
    pub async fn read_events(&mut self) -> Result<Vec<ReplicatedEvent>> {
        loop {
            match self.recv("read_events").await? {
                Message::Heartbeat => {
                    trace!(peer = %self.conn.peer(), "Heartbeat");
                }
                Message::Event(event) => return Ok(vec![event]),
                Message::EventBatch(events) if !events.is_empty() => return Ok(events),
                Message::EventBatch(_) => {
                    return Err(ReplicationError::Protocol("empty event batch".to_string()))
                }
                Message::Nok { reason } => return Err(ReplicationError::ServerFault { reason }),
                other => {
                    return Err(ReplicationError::Protocol(format!(
                        "expected event, received {}",
                        other.kind()
                    )))
                }
            }
        }
    }

    pub async fn close(self) {
        self.conn.close().await;
    }
}
