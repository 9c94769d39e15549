// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log storage collaborator traits.
//!
//! The distributor never touches the on-disk log format. It consumes a log
//! through [`LogStore`] (shared handle, seqno range) and [`LogConnection`]
//! (a cursor with seek/next/append/delete).
//!
//! [`MemoryLogStore`] is an in-process implementation used by tests and by
//! embedders that stage events in memory.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> replication_distributor::Result<()> {
//! use replication_distributor::log_store::{LogStore, MemoryLogStore, SeekPosition};
//!
//! let store = MemoryLogStore::new();
//! let mut reader = store.connect(true).await?;
//! if reader.seek(SeekPosition::Seqno(0)).await? {
//!     // Blocks until an event is appended.
//!     let event = reader.next(true).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::event::ReplicatedEvent;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where to position a log cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekPosition {
    /// First fragment of the given seqno.
    Seqno(u64),
    /// First event carrying the given opaque source event id.
    EventId(String),
}

/// Shared handle to a transaction history log.
pub trait LogStore: Send + Sync + 'static {
    /// Open a cursor. Read-only cursors reject `append` and `delete`.
    fn connect(&self, readonly: bool) -> BoxFuture<'_, Box<dyn LogConnection>>;

    /// Lowest seqno still stored, `None` when the log is empty.
    fn min_seqno(&self) -> BoxFuture<'_, Option<u64>>;

    /// Highest seqno stored, `None` when the log is empty.
    fn max_seqno(&self) -> BoxFuture<'_, Option<u64>>;
}

/// A cursor over the log.
pub trait LogConnection: Send {
    /// Position the cursor. Returns `false` when the position does not exist.
    ///
    /// Seeking to the seqno one past the current maximum succeeds and leaves
    /// the cursor at the tail.
    fn seek(&mut self, position: SeekPosition) -> BoxFuture<'_, bool>;

    /// Return the next event after the cursor.
    ///
    /// With `blocking`, waits until an event is available. Implementations
    /// must be cancel-safe: dropping the future must not advance the cursor.
    /// `Ok(None)` means no event is available (non-blocking) or the store
    /// was closed.
    fn next(&mut self, blocking: bool) -> BoxFuture<'_, Option<ReplicatedEvent>>;

    /// Append an event at the end of the log.
    fn append(&mut self, event: ReplicatedEvent) -> BoxFuture<'_, ()>;

    /// Delete events with `low <= seqno <= high`. Returns the number removed.
    fn delete(&mut self, low: u64, high: u64) -> BoxFuture<'_, usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryLogStore
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryLog {
    /// Sorted by (seqno, fragno).
    events: Vec<ReplicatedEvent>,
    /// Seqno the next appended transaction must carry.
    next_seqno: u64,
    closed: bool,
}

impl MemoryLog {
    /// Index of the first event positioned after `(seqno, fragno)`.
    fn index_after(&self, seqno: u64, fragno: u16) -> usize {
        self.events
            .partition_point(|e| (e.seqno(), e.fragno()) <= (seqno, fragno))
    }

    fn index_of_seqno(&self, seqno: u64) -> usize {
        self.events.partition_point(|e| e.seqno() < seqno)
    }
}

struct MemoryInner {
    log: RwLock<MemoryLog>,
    appended: Notify,
}

/// In-memory log with blocking tail reads.
#[derive(Clone)]
pub struct MemoryLogStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a store whose first transaction must be `first_seqno`.
    pub fn starting_at(first_seqno: u64) -> Self {
        let log = MemoryLog {
            next_seqno: first_seqno,
            ..Default::default()
        };
        Self {
            inner: Arc::new(MemoryInner {
                log: RwLock::new(log),
                appended: Notify::new(),
            }),
        }
    }

    /// Append without opening a connection.
    pub async fn append(&self, event: ReplicatedEvent) -> Result<()> {
        append_event(&self.inner, event).await
    }

    /// Number of stored events (fragments).
    pub async fn len(&self) -> usize {
        self.inner.log.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.log.read().await.events.is_empty()
    }

    /// Wake every blocked reader with `Ok(None)` and refuse further appends.
    pub async fn close(&self) {
        self.inner.log.write().await.closed = true;
        self.inner.appended.notify_waiters();
    }
}

async fn append_event(inner: &MemoryInner, event: ReplicatedEvent) -> Result<()> {
    let mut log = inner.log.write().await;
    if log.closed {
        return Err(ReplicationError::LogStore("log is closed".to_string()));
    }

    if let Some(last) = log.events.last() {
        let valid = if last.last_frag() {
            event.seqno() == last.seqno() + 1 && event.fragno() == 0
        } else {
            event.seqno() == last.seqno() && event.fragno() == last.fragno() + 1
        };
        if !valid {
            return Err(ReplicationError::LogStore(format!(
                "append of {}/{} does not follow {}/{}",
                event.seqno(),
                event.fragno(),
                last.seqno(),
                last.fragno()
            )));
        }
    } else if event.seqno() < log.next_seqno || event.fragno() != 0 {
        return Err(ReplicationError::LogStore(format!(
            "first append must start at seqno {} fragment 0, got {}/{}",
            log.next_seqno,
            event.seqno(),
            event.fragno()
        )));
    }

    if event.last_frag() {
        log.next_seqno = event.seqno() + 1;
    } else {
        log.next_seqno = event.seqno();
    }
    log.events.push(event);
    drop(log);

    inner.appended.notify_waiters();
    Ok(())
}

impl LogStore for MemoryLogStore {
    fn connect(&self, readonly: bool) -> BoxFuture<'_, Box<dyn LogConnection>> {
        Box::pin(async move {
            let conn: Box<dyn LogConnection> = Box::new(MemoryLogConnection {
                inner: Arc::clone(&self.inner),
                readonly,
                cursor: Cursor::Start,
            });
            Ok(conn)
        })
    }

    fn min_seqno(&self) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async move { Ok(self.inner.log.read().await.events.first().map(|e| e.seqno())) })
    }

    fn max_seqno(&self) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async move { Ok(self.inner.log.read().await.events.last().map(|e| e.seqno())) })
    }
}

/// Cursor position, kept as a log position so purges do not invalidate it.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// Before the first event.
    Start,
    /// Before the first fragment of this seqno.
    BeforeSeqno(u64),
    /// After this (seqno, fragno).
    After(u64, u16),
}

struct MemoryLogConnection {
    inner: Arc<MemoryInner>,
    readonly: bool,
    cursor: Cursor,
}

impl MemoryLogConnection {
    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.readonly {
            return Err(ReplicationError::LogStore(format!(
                "{} on a read-only connection",
                operation
            )));
        }
        Ok(())
    }
}

impl LogConnection for MemoryLogConnection {
    fn seek(&mut self, position: SeekPosition) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let log = self.inner.log.read().await;
            match position {
                SeekPosition::Seqno(seqno) => {
                    let idx = log.index_of_seqno(seqno);
                    let found = log.events.get(idx).map(|e| e.seqno() == seqno).unwrap_or(false);
                    let at_tail = idx == log.events.len() && seqno == log.next_seqno;
                    if found || at_tail {
                        self.cursor = Cursor::BeforeSeqno(seqno);
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                SeekPosition::EventId(event_id) => {
                    match log.events.iter().find(|e| e.header.event_id == event_id) {
                        Some(event) => {
                            self.cursor = Cursor::BeforeSeqno(event.seqno());
                            Ok(true)
                        }
                        None => Ok(false),
                    }
                }
            }
        })
    }

    fn next(&mut self, blocking: bool) -> BoxFuture<'_, Option<ReplicatedEvent>> {
        Box::pin(async move {
            loop {
                let notified = self.inner.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let log = self.inner.log.read().await;
                    let idx = match self.cursor {
                        Cursor::Start => 0,
                        Cursor::BeforeSeqno(seqno) => log.index_of_seqno(seqno),
                        Cursor::After(seqno, fragno) => log.index_after(seqno, fragno),
                    };
                    if let Some(event) = log.events.get(idx) {
                        self.cursor = Cursor::After(event.seqno(), event.fragno());
                        return Ok(Some(event.clone()));
                    }
                    if !blocking || log.closed {
                        return Ok(None);
                    }
                }

                notified.await;
            }
        })
    }

    fn append(&mut self, event: ReplicatedEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_writable("append")?;
            append_event(&self.inner, event).await
        })
    }

    fn delete(&mut self, low: u64, high: u64) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            self.check_writable("delete")?;
            let mut log = self.inner.log.write().await;
            let before = log.events.len();
            log.events.retain(|e| e.seqno() < low || e.seqno() > high);
            Ok(before - log.events.len())
        })
    }
}
