// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-partition merge queue.
//!
//! Each partition's consumer reads one bounded queue that merges three
//! sources into a single order:
//!
//! 1. events read from the log for this partition (`put_event`)
//! 2. out-of-band control markers posted by the dispatcher
//!    (`post_out_of_band`), released once the read position reaches their
//!    target seqno
//! 3. SYNC markers for local watch predicates that now match (`add_watch`)
//!
//! Markers are released only on a transaction boundary, after the event that
//! completed the transaction. A marker whose target is behind the read
//! position is moved up to it, so the consumer never sees seqno go backward.
//!
//! # Locking
//!
//! ```text
//! producer ──► state lock ──► bounded output ──► consumer
//!             (put_event,          ▲              (take / try_take / peek,
//!              advance, post,      │               output lock only)
//!              add_watch)          │
//! ```
//!
//! Producers hold the state lock while waiting for output space. Consumers
//! never take the state lock, so a full queue cannot deadlock them.

use crate::error::{ReplicationError, Result};
use crate::event::{ControlMarker, Header, ReplicatedEvent};
use crate::metrics;
use crate::predicate::WatchPredicate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};

/// Events accepted but not yet dequeued, across all partitions.
///
/// Incremented on every accepted event or marker, decremented on every
/// consumer dequeue. The dispatcher waits on it reaching zero.
#[derive(Debug, Default)]
pub struct InFlightCounter {
    count: AtomicUsize,
    zero: Notify,
}

impl InFlightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn increment(&self) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_in_flight(count);
    }

    pub fn decrement(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .unwrap_or(0);
        let count = previous.saturating_sub(1);
        metrics::set_in_flight(count);
        if count == 0 {
            self.zero.notify_waiters();
        }
    }

    /// Wait until nothing is in flight.
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct MergeState {
    /// Last header read for this partition, or passed by `advance`.
    position: Option<Header>,
    /// Out-of-band markers, ordered by target seqno.
    pending: Vec<ControlMarker>,
    watches: Vec<WatchPredicate>,
}

struct Output {
    rx: mpsc::Receiver<ReplicatedEvent>,
    peeked: Option<ReplicatedEvent>,
}

pub struct PerPartitionMergeQueue {
    partition: usize,
    state: Mutex<MergeState>,
    tx: mpsc::Sender<ReplicatedEvent>,
    output: Mutex<Output>,
    len: AtomicUsize,
    in_flight: Arc<InFlightCounter>,
}

impl PerPartitionMergeQueue {
    pub fn new(partition: usize, capacity: usize, in_flight: Arc<InFlightCounter>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            partition,
            state: Mutex::new(MergeState::default()),
            tx,
            output: Mutex::new(Output { rx, peeked: None }),
            len: AtomicUsize::new(0),
            in_flight,
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Queue an event read from the log for this partition.
    pub async fn put_event(&self, event: ReplicatedEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(position) = &state.position {
            if event.seqno() < position.seqno {
                return Err(ReplicationError::InvalidState {
                    expected: format!("seqno >= {} on partition {}", position.seqno, self.partition),
                    actual: event.seqno().to_string(),
                });
            }
        }
        let header = event.header.clone();
        self.emit(event).await?;
        state.position = Some(header);
        self.release(&mut state).await
    }

    /// Move the read position without queueing anything, for events routed
    /// to other partitions. Never moves the position backward.
    pub async fn advance(&self, header: &Header) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(position) = &state.position {
            if header.seqno < position.seqno {
                return Ok(());
            }
        }
        state.position = Some(header.clone());
        self.release(&mut state).await
    }

    /// Queue a marker for release once the read position reaches its target.
    pub async fn post_out_of_band(&self, marker: ControlMarker) -> Result<()> {
        let mut state = self.state.lock().await;
        let at = state.pending.partition_point(|m| m.seqno <= marker.seqno);
        trace!(partition = self.partition, kind = marker.kind.as_str(), seqno = marker.seqno, "Marker posted");
        state.pending.insert(at, marker);
        self.release(&mut state).await
    }

    /// Register a predicate; a SYNC marker is queued the first time it
    /// matches.
    pub async fn add_watch(&self, predicate: WatchPredicate) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(partition = self.partition, predicate = %predicate, "Watch added");
        state.watches.push(predicate);
        self.release(&mut state).await
    }

    /// Release due markers and matched watches. Only acts on a transaction
    /// boundary.
    async fn release(&self, state: &mut MergeState) -> Result<()> {
        let Some(position) = state.position.clone() else {
            return Ok(());
        };
        if !position.last_frag {
            return Ok(());
        }

        let due = state.pending.partition_point(|m| m.seqno <= position.seqno);
        for mut marker in state.pending.drain(..due).collect::<Vec<_>>() {
            if marker.seqno < position.seqno {
                marker.seqno = position.seqno;
                marker.header = position.clone();
            }
            metrics::record_control_marker(marker.kind.as_str());
            self.emit(ReplicatedEvent::from_marker(marker)).await?;
        }

        let (matched, waiting): (Vec<_>, Vec<_>) =
            state.watches.drain(..).partition(|p| p.matches(&position));
        state.watches = waiting;
        for predicate in matched {
            debug!(partition = self.partition, predicate = %predicate, seqno = position.seqno, "Watch matched");
            metrics::record_control_marker("sync");
            self.emit(ReplicatedEvent::from_marker(ControlMarker::sync(position.clone())))
                .await?;
        }
        Ok(())
    }

    async fn emit(&self, event: ReplicatedEvent) -> Result<()> {
        self.in_flight.increment();
        self.len.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).await.is_err() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            self.in_flight.decrement();
            return Err(ReplicationError::Shutdown);
        }
        metrics::set_merge_queue_depth(self.partition, self.len());
        Ok(())
    }

    fn dequeued(&self) {
        let _ = self
            .len
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.in_flight.decrement();
        metrics::set_merge_queue_depth(self.partition, self.len());
    }

    /// Next event, waiting while the queue is empty.
    pub async fn take(&self) -> Result<ReplicatedEvent> {
        let mut output = self.output.lock().await;
        let event = match output.peeked.take() {
            Some(event) => event,
            None => output.rx.recv().await.ok_or(ReplicationError::Shutdown)?,
        };
        self.dequeued();
        Ok(event)
    }

    /// Next event if one is ready.
    pub fn try_take(&self) -> Option<ReplicatedEvent> {
        let mut output = self.output.try_lock().ok()?;
        let event = match output.peeked.take() {
            Some(event) => event,
            None => output.rx.try_recv().ok()?,
        };
        self.dequeued();
        Some(event)
    }

    /// The event `take` would return next, without removing it.
    pub fn peek(&self) -> Option<ReplicatedEvent> {
        let mut output = self.output.try_lock().ok()?;
        if output.peeked.is_none() {
            output.peeked = output.rx.try_recv().ok();
        }
        output.peeked.clone()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn read_position(&self) -> Option<Header> {
        self.state.lock().await.position.clone()
    }

    /// Markers waiting for the read position to reach them.
    pub async fn pending_markers(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
