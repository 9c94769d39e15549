// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming wire protocol between a log server and remote readers.
//!
//! # Exchange
//!
//! ```text
//! Server                                   Client
//!   │── Handshake(capabilities) ──────────────▶│
//!   │◀──────────── HandshakeResponse ──────────│
//!   │   validator                              │
//!   │── Ok(range) | Nok(reason) ──────────────▶│   (Nok closes)
//!   │                                          │
//!   │◀──────── EventRequest(seqno, window) ────│
//!   │── Event / EventBatch ... ───────────────▶│   until window exhausted
//!   │── Heartbeat (idle) ─────────────────────▶│
//!   │◀──────── EventRequest(next, window) ─────│
//! ```
//!
//! Each frame is a 4-byte big-endian length followed by a JSON message.
//! The window is the only flow control: the server never sends more than a
//! window's worth of transactions without a new request, and never ends a
//! window inside a fragmented transaction.

mod client;
mod codec;
mod server;
mod validator;

pub use client::ProtocolClient;
pub use codec::{decode_frame, encode_frame, AsyncStream, BoxedStream, FramedConnection, MAX_FRAME_BYTES};
pub use server::{ProtocolServer, ServerSettings};
pub use validator::{
    build_validator, AcceptAllValidator, HandshakeFacts, HandshakeValidator, SeqnoOnlyValidator,
    StrictValidator,
};

use crate::event::ReplicatedEvent;
use serde::{Deserialize, Serialize};

/// Capabilities advertised by the server when a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub source_id: String,
    pub role: String,
    pub version: String,
    /// `None` when the log is empty.
    pub min_seqno: Option<u64>,
    pub max_seqno: Option<u64>,
}

/// Client reply to the server's capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub source_id: String,
    pub last_epoch: u64,
    /// Last seqno the client holds. `None` for an empty client log or when
    /// serialization checking is disabled.
    pub last_seqno: Option<u64>,
    pub heartbeat_interval_ms: u64,
    /// Opaque source position to resume from.
    #[serde(default)]
    pub resume_event_id: Option<String>,
}

/// Payload of an accepted handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqnoRange {
    pub min_seqno: Option<u64>,
    pub max_seqno: Option<u64>,
    /// Seqno located for the client's `resume_event_id`.
    #[serde(default)]
    pub resume_seqno: Option<u64>,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    Handshake(Capabilities),
    HandshakeResponse(HandshakeResponse),
    Ok(SeqnoRange),
    /// Handshake refusal, or an error frame in reply to an event request.
    Nok { reason: String },
    EventRequest { seqno: u64, prefetch_range: u32 },
    Event(ReplicatedEvent),
    EventBatch(Vec<ReplicatedEvent>),
    Heartbeat,
}

impl Message {
    /// Short name for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeResponse(_) => "handshake_response",
            Message::Ok(_) => "ok",
            Message::Nok { .. } => "nok",
            Message::EventRequest { .. } => "event_request",
            Message::Event(_) => "event",
            Message::EventBatch(_) => "event_batch",
            Message::Heartbeat => "heartbeat",
        }
    }
}
