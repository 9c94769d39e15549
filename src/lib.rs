//! # Replication Distributor
//!
//! Distribution layer for a replicated transaction history log: moves a
//! totally ordered stream of transactions from one source log to remote
//! readers and to parallel apply channels, and keeps a crash-consistent
//! restart position per channel.
//!
//! ## Architecture
//!
//! ```text
//!        source side                              replica side
//! ┌──────────────────────────┐            ┌──────────────────────────────┐
//! │ LogStore ──► LogServer ──┼── plain:// ┼──► RemoteLogClient ──► LogStore│
//! │              (handler    │  secure:// │    (rotate, handshake,       │
//! │               per client)│            │     windowed pull, resume)   │
//! └──────────────────────────┘            └───────────────┬──────────────┘
//!                                                         │
//!                                                         ▼
//!                                          ┌──────────────────────────────┐
//!                                          │ PartitionedDispatchQueue     │
//!                                          │  partitioner + drain barrier │
//!                                          ├──────────┬─────────┬─────────┤
//!                                          │ merge q0 │ merge q1│ merge qN│
//!                                          └────┬─────┴────┬────┴────┬────┘
//!                                               ▼          ▼         ▼
//!                                            apply channels (external)
//!                                               │
//!                                               ▼
//!                                          CommitPositionTracker (SQLite)
//! ```
//!
//! ## Guarantees
//!
//! 1. **Per-partition order**: seqno never goes backward on a partition,
//!    including across reconnects.
//! 2. **No interleaving**: fragments of one transaction stay together on one
//!    partition.
//! 3. **Critical barrier**: a critical transaction runs with nothing else in
//!    flight on any partition.
//! 4. **Restart safety**: commit positions never move below the mark they
//!    had when the tracker was opened.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_distributor::{
//!     LogServer, LogServerConfig, MemoryLogStore, RemoteClientConfig, RemoteLogClient,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replication_distributor::Result<()> {
//!     let log = MemoryLogStore::new();
//!     let mut server = LogServer::new(LogServerConfig::for_testing("db1"), Arc::new(log))?;
//!     let addr = server.start().await?;
//!
//!     let uri = format!("plain://{}", addr);
//!     let mut client = RemoteLogClient::new(RemoteClientConfig::for_testing(vec![uri]))?;
//!     let event = client.extract().await?;
//!     println!("received seqno {}", event.seqno());
//!
//!     client.shutdown().await;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod commit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod log_store;
pub mod merge_queue;
pub mod metrics;
pub mod partition;
pub mod predicate;
pub mod protocol;
pub mod resilience;
pub mod server;
pub mod tls;
pub mod uri;

// Re-exports for convenience
pub use client::{ClientShutdown, ClientState, OutOfSequenceNotice, RemoteLogClient};
pub use commit::{CommitPosition, CommitPositionTracker, NativePositionSync};
pub use config::{
    CommitStoreConfig, DispatchConfig, DistributorConfig, LogServerConfig, PartitionerConfig,
    RemoteClientConfig, ValidatorKind,
};
pub use dispatch::PartitionedDispatchQueue;
pub use error::{ReplicationError, Result};
pub use event::{ControlKind, ControlMarker, Header, Payload, ReplicatedEvent};
pub use log_store::{LogConnection, LogStore, MemoryLogStore, SeekPosition};
pub use merge_queue::{InFlightCounter, PerPartitionMergeQueue};
pub use partition::{PartitionAssignment, Partitioner};
pub use predicate::WatchPredicate;
pub use server::LogServer;
pub use uri::{ConnectionUriRotator, LogUri};
