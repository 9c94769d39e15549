// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication distributor.
//!
//! Errors are categorized by their source (network, wire protocol, SQLite,
//! configuration) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Protocol fault | Description |
//! |------------|-----------|----------------|-------------|
//! | `Io` | Yes | No | Socket read/write/connect failures |
//! | `Timeout` | Yes | No | Connect or read timed out |
//! | `HandshakeRejected` | No | Yes | Server answered the handshake with NOK |
//! | `ServerFault` | No | Yes | Server answered an event request with an error frame |
//! | `Protocol` | No | Yes | Unexpected message kind or malformed exchange |
//! | `OutOfSequence` | No | Yes | Server delivered a seqno the client did not expect |
//! | `Codec` | No | Yes | Frame could not be encoded or decoded |
//! | `Tls` | No | No | TLS material missing or invalid |
//! | `CommitStore` | No | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | No | Configuration invalid |
//! | `ChannelCountMismatch` | No | No | Persisted commit rows disagree with channel count |
//! | `InvalidPartition` / `InvalidChannel` | No | No | Id outside the configured range |
//! | `LogStore` | No | No | Log storage collaborator failed |
//! | `InvalidState` | No | No | Component state machine violation |
//! | `Shutdown` | No | No | Component is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The remote client's reconnect loop retries every error for which
//! [`ReplicationError::is_retryable()`] is true, forever, with a fixed delay.
//! Protocol faults terminate the connection and are surfaced to the caller.

use thiserror::Error;

/// Result type alias for distributor operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while distributing the log.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Socket level failure.
    ///
    /// Occurs when connecting to, reading from or writing to a peer.
    /// Retryable: the client reconnects from its last known position.
    #[error("I/O error ({operation}): {message}")]
    Io {
        operation: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A connect or read did not complete in time.
    ///
    /// Tracked separately from other I/O errors for diagnostics.
    #[error("Timed out during {operation} after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The server refused the handshake (NOK).
    #[error("Handshake rejected by server: {reason}")]
    HandshakeRejected { reason: String },

    /// The server answered an event request with an error frame.
    #[error("Server fault: {reason}")]
    ServerFault { reason: String },

    /// Unexpected message kind or malformed exchange.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server delivered an event whose seqno does not continue the stream.
    #[error("Out of sequence event: expected seqno {expected}, received {actual}")]
    OutOfSequence { expected: u64, actual: u64 },

    /// Frame encode/decode failure.
    #[error("Codec error: {0}")]
    Codec(String),

    /// TLS material missing or invalid.
    #[error("TLS error: {0}")]
    Tls(String),

    /// SQLite error during commit position persistence.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Commit store error: {0}")]
    CommitStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The number of persisted commit rows does not match the configured
    /// number of apply channels. Continuing could skip or replay data.
    #[error("Commit position rows ({found}) do not match configured channel count ({expected})")]
    ChannelCountMismatch { expected: usize, found: usize },

    /// A partitioner returned an index outside the configured range.
    #[error("Partition {partition} out of range (partitions: {partitions})")]
    InvalidPartition { partition: usize, partitions: usize },

    /// A channel id outside the configured range was referenced.
    #[error("Channel {channel} out of range (channels: {channels})")]
    InvalidChannel { channel: u32, channels: u32 },

    /// The log storage collaborator failed.
    #[error("Log store error: {0}")]
    LogStore(String),

    /// Component state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an I/O error from a `std::io::Error`.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create an I/O error without source.
    pub fn io_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Io {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Timeout { .. })
    }

    /// Check if this error is a wire protocol fault.
    ///
    /// Protocol faults end the current connection; the connection must not
    /// be used afterwards.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRejected { .. }
                | Self::ServerFault { .. }
                | Self::Protocol(_)
                | Self::OutOfSequence { .. }
                | Self::Codec(_)
        )
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for ReplicationError {
    fn from(e: std::io::Error) -> Self {
        Self::io("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
