// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication distributor.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are human-readable strings (`"500ms"`, `"1s"`, `"2m"`).
//!
//! # Configuration Structure
//!
//! ```text
//! DistributorConfig
//! ├── server: LogServerConfig      # Serves the local log to remote readers
//! ├── client: RemoteClientConfig   # Pulls a remote log into this node
//! ├── dispatch: DispatchConfig     # Partitioned fan-out to apply channels
//! └── commit: CommitStoreConfig    # SQLite commit position persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! server:
//!   listen_uri: "plain://0.0.0.0:2112"
//!   source_id: "db1"
//!   role: "master"
//!   buffer_size: 10
//!
//! client:
//!   uris: ["plain://db1:2112", "plain://db2:2112"]
//!   preferred_role: "master"
//!   heartbeat_interval: "3s"
//!
//! dispatch:
//!   partitions: 4
//!   sync_interval: 1000
//!   partitioner:
//!     type: hash
//!
//! commit:
//!   sqlite_path: "/var/lib/replicator/commit.db"
//!   channels: 4
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default)]
    pub server: LogServerConfig,
    #[serde(default)]
    pub client: RemoteClientConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub commit: CommitStoreConfig,
}

impl DistributorConfig {
    /// Create a minimal config for testing.
    pub fn for_testing() -> Self {
        Self {
            server: LogServerConfig::for_testing("test-source"),
            client: RemoteClientConfig::for_testing(vec!["plain://127.0.0.1:2112".to_string()]),
            dispatch: DispatchConfig::for_testing(2),
            commit: CommitStoreConfig::in_memory(2),
        }
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LogServerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Handshake validation policy applied by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    /// Seqno range and epoch consistency.
    #[default]
    Strict,
    /// Seqno range only.
    SeqnoOnly,
    /// Accept every client.
    AcceptAll,
}

/// Server TLS material (PEM files).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Log server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogServerConfig {
    /// `plain://host:port` or `secure://host:port`.
    #[serde(default = "default_listen_uri")]
    pub listen_uri: String,

    /// Identity advertised in the handshake.
    #[serde(default = "default_source_id")]
    pub source_id: String,

    /// Replication role advertised in the handshake (e.g. "master", "slave").
    #[serde(default = "default_role")]
    pub role: String,

    /// Protocol/software version advertised in the handshake.
    #[serde(default = "default_version")]
    pub version: String,

    /// Events per batch frame. 1 sends each event in its own frame.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub validator: ValidatorKind,

    /// Required when `listen_uri` uses the `secure` scheme.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// How long `stop()` waits for each handler before giving up on it.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String,
}

fn default_listen_uri() -> String {
    "plain://0.0.0.0:2112".to_string()
}

fn default_source_id() -> String {
    "local".to_string()
}

fn default_role() -> String {
    "master".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_buffer_size() -> usize {
    10
}

fn default_stop_timeout() -> String {
    "5s".to_string()
}

impl Default for LogServerConfig {
    fn default() -> Self {
        Self {
            listen_uri: default_listen_uri(),
            source_id: default_source_id(),
            role: default_role(),
            version: default_version(),
            buffer_size: default_buffer_size(),
            validator: ValidatorKind::Strict,
            tls: None,
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl LogServerConfig {
    /// Listen on an ephemeral loopback port.
    pub fn for_testing(source_id: &str) -> Self {
        Self {
            listen_uri: "plain://127.0.0.1:0".to_string(),
            source_id: source_id.to_string(),
            stop_timeout: "1s".to_string(),
            ..Default::default()
        }
    }

    pub fn stop_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.stop_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteClientConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Client TLS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// PEM bundle of trusted certificate authorities.
    pub ca_path: String,
    /// Name to verify against the server certificate. Defaults to the URI host.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Remote log client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteClientConfig {
    /// Candidate servers, tried round-robin.
    pub uris: Vec<String>,

    /// Prefer servers advertising this role; any reachable server is accepted
    /// after a full rotation without a match.
    #[serde(default)]
    pub preferred_role: Option<String>,

    /// Identity sent in the handshake response.
    #[serde(default = "default_client_source_id")]
    pub source_id: String,

    /// Events requested per window.
    #[serde(default = "default_prefetch_range")]
    pub prefetch_range: u32,

    /// Heartbeat interval requested from the server. Reads time out after
    /// ten intervals of silence.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Fixed delay between failed connection attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// Log a warning on every Nth failed attempt (others are debug).
    #[serde(default = "default_retry_warn_every")]
    pub retry_warn_every: u64,

    /// Advertise the last known (epoch, seqno) so the server can validate
    /// log consistency. Disabled when forcing a replica online.
    #[serde(default = "default_true")]
    pub check_serialization: bool,

    #[serde(default)]
    pub tls: Option<ClientTlsConfig>,
}

fn default_client_source_id() -> String {
    "replica".to_string()
}

fn default_prefetch_range() -> u32 {
    100
}

fn default_heartbeat_interval() -> String {
    "3s".to_string()
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_retry_delay() -> String {
    "1s".to_string()
}

fn default_retry_warn_every() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            uris: vec!["plain://localhost:2112".to_string()],
            preferred_role: None,
            source_id: default_client_source_id(),
            prefetch_range: default_prefetch_range(),
            heartbeat_interval: default_heartbeat_interval(),
            connect_timeout: default_connect_timeout(),
            retry_delay: default_retry_delay(),
            retry_warn_every: default_retry_warn_every(),
            check_serialization: true,
            tls: None,
        }
    }
}

impl RemoteClientConfig {
    /// Short timeouts for tests.
    pub fn for_testing(uris: Vec<String>) -> Self {
        Self {
            uris,
            heartbeat_interval: "100ms".to_string(),
            connect_timeout: "500ms".to_string(),
            retry_delay: "20ms".to_string(),
            prefetch_range: 5,
            ..Default::default()
        }
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        parse_duration_or(&self.heartbeat_interval, Duration::from_secs(3))
    }

    /// Reads fail after ten heartbeat intervals without any frame.
    pub fn read_timeout(&self) -> Duration {
        self.heartbeat_interval_duration() * 10
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(5))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        parse_duration_or(&self.retry_delay, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Partition function selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionerConfig {
    /// FNV-1a hash of the shard id modulo the partition count.
    Hash,
    /// Everything to partition 0.
    Single,
    /// Explicit shard to partition mapping.
    ShardList {
        #[serde(default)]
        mapping: HashMap<String, usize>,
        /// Shards whose transactions are serialized against all partitions.
        #[serde(default)]
        critical_shards: Vec<String>,
        /// Partition for unmapped shards; `None` hashes them instead.
        #[serde(default)]
        default_partition: Option<usize>,
    },
}

impl Default for PartitionerConfig {
    fn default() -> Self {
        Self::Hash
    }
}

/// Partitioned dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Bounded capacity of each per-partition output queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Emit a SYNC marker every N committed transactions. 0 disables.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    #[serde(default)]
    pub partitioner: PartitionerConfig,

    /// Task id handed to the partitioner with every event.
    #[serde(default)]
    pub task_id: u32,
}

fn default_partitions() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_sync_interval() -> u64 {
    10_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            queue_capacity: default_queue_capacity(),
            sync_interval: default_sync_interval(),
            partitioner: PartitionerConfig::Hash,
            task_id: 0,
        }
    }
}

impl DispatchConfig {
    pub fn for_testing(partitions: usize) -> Self {
        Self {
            partitions,
            queue_capacity: 16,
            sync_interval: 0,
            partitioner: PartitionerConfig::Hash,
            task_id: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CommitStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Commit position persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitStoreConfig {
    /// Path to SQLite database.
    pub sqlite_path: String,

    /// Number of apply channels, one commit row each.
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_channels() -> usize {
    1
}

impl Default for CommitStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "commit_positions.db".to_string(),
            channels: 1,
            wal_mode: true,
        }
    }
}

impl CommitStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory(channels: usize) -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            channels,
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
