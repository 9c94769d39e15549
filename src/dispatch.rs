// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Partitioned dispatch: one ordered log stream in, N partition streams out.
//!
//! The single log-tailing producer calls [`PartitionedDispatchQueue::put`]
//! for every event. Each transaction is assigned a partition by the
//! configured [`Partitioner`] and queued on that partition's
//! [`PerPartitionMergeQueue`].
//!
//! # Critical sections
//!
//! Critical transactions (schema changes, unknown shards) must be ordered
//! against every partition. Before the first critical transaction on a
//! partition, and again before the first non-critical transaction after it,
//! the dispatcher drains: it waits until every queued event on every
//! partition has been dequeued.
//!
//! ```text
//! p0: a1 a2 ─┐                 ┌─ a3
//! p1: b1 ────┤ drain  C  drain ├─ b2
//! p2: ───────┘  (p1 critical)  └─
//! ```
//!
//! # Control markers
//!
//! - a SYNC marker every `sync_interval` completed transactions
//! - a SYNC marker when a watch predicate first matches
//! - a STOP marker on request, at the current or next transaction boundary
//!
//! Markers go to every partition; each merge queue releases them once its own
//! read position reaches the marker.

use crate::config::DispatchConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{min_header, ControlMarker, Header, ReplicatedEvent};
use crate::merge_queue::{InFlightCounter, PerPartitionMergeQueue};
use crate::metrics;
use crate::partition::{build_partitioner, PartitionAssignment, Partitioner};
use crate::predicate::WatchPredicate;
use std::cmp::Ordering as PositionOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

const NO_CRITICAL: usize = usize::MAX;

#[derive(Default)]
struct DispatchState {
    /// Header of the last event dispatched (or discarded).
    last_header: Option<Header>,
    /// Assignment of the transaction in progress.
    current: Option<PartitionAssignment>,
    since_sync: u64,
    stop_requested: bool,
    watches: Vec<WatchPredicate>,
}

impl DispatchState {
    fn at_boundary(&self) -> bool {
        self.last_header.as_ref().map_or(true, |h| h.last_frag)
    }

    /// Whether `event` continues the transaction in progress.
    fn continues(&self, event: &ReplicatedEvent) -> bool {
        matches!(&self.last_header, Some(h) if !h.last_frag && h.seqno == event.seqno())
    }
}

pub struct PartitionedDispatchQueue {
    partitioner: Arc<dyn Partitioner>,
    queues: Vec<Arc<PerPartitionMergeQueue>>,
    in_flight: Arc<InFlightCounter>,
    active_critical: AtomicUsize,
    /// Producer state; held for the whole of each dispatch.
    state: tokio::sync::Mutex<DispatchState>,
    /// Last header each partition's consumer reported as processed.
    processed: Mutex<Vec<Option<Header>>>,
    sync_interval: u64,
    task_id: u32,
    discarded: AtomicU64,
    transactions: AtomicU64,
}

impl PartitionedDispatchQueue {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let partitioner = build_partitioner(&config.partitioner, config.partitions)?;
        Self::with_partitioner(config, partitioner)
    }

    pub fn with_partitioner(config: &DispatchConfig, partitioner: Arc<dyn Partitioner>) -> Result<Self> {
        if config.partitions == 0 {
            return Err(ReplicationError::Config("partition count must be at least 1".to_string()));
        }
        let in_flight = Arc::new(InFlightCounter::new());
        let queues = (0..config.partitions)
            .map(|p| Arc::new(PerPartitionMergeQueue::new(p, config.queue_capacity, in_flight.clone())))
            .collect();
        info!(
            partitions = config.partitions,
            partitioner = partitioner.name(),
            sync_interval = config.sync_interval,
            "Dispatch queue created"
        );
        Ok(Self {
            partitioner,
            queues,
            in_flight,
            active_critical: AtomicUsize::new(NO_CRITICAL),
            state: tokio::sync::Mutex::new(DispatchState::default()),
            processed: Mutex::new(vec![None; config.partitions]),
            sync_interval: config.sync_interval,
            task_id: config.task_id,
            discarded: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
        })
    }

    pub fn partitions(&self) -> usize {
        self.queues.len()
    }

    /// The merge queue a partition's consumer reads.
    pub fn queue(&self, partition: usize) -> Result<Arc<PerPartitionMergeQueue>> {
        self.queues
            .get(partition)
            .cloned()
            .ok_or(ReplicationError::InvalidPartition {
                partition,
                partitions: self.queues.len(),
            })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    pub fn active_critical_partition(&self) -> Option<usize> {
        match self.active_critical.load(Ordering::SeqCst) {
            NO_CRITICAL => None,
            partition => Some(partition),
        }
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Completed transactions seen, discarded ones included.
    pub fn transaction_count(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// Dispatch one event from the log.
    ///
    /// May wait for consumers: on a full partition queue, or for a drain at
    /// a critical section edge.
    pub async fn put(&self, event: ReplicatedEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        let continues = state.continues(&event);

        if event.is_empty() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            metrics::record_discarded();
            debug!(seqno = event.seqno(), fragno = event.header.fragno, "Discarding empty event");
            if !continues {
                // The first non-empty fragment assigns the transaction.
                state.current = None;
            }
            let header = event.header;
            for queue in &self.queues {
                queue.advance(&header).await?;
            }
            return self.finish(&mut state, header).await;
        }

        let assignment = match (state.current, continues) {
            (Some(assignment), true) => assignment,
            _ => {
                let assignment = self.assign(&event)?;
                self.enter_section(assignment).await;
                assignment
            }
        };

        let header = event.header.clone();
        self.queues[assignment.partition].put_event(event).await?;
        metrics::record_dispatched(assignment.partition);
        if header.last_frag {
            for queue in self.queues.iter().filter(|q| q.partition() != assignment.partition) {
                queue.advance(&header).await?;
            }
        }
        state.current = Some(assignment);
        self.finish(&mut state, header).await
    }

    fn assign(&self, event: &ReplicatedEvent) -> Result<PartitionAssignment> {
        let assignment = self.partitioner.partition(event, self.task_id);
        if assignment.partition >= self.queues.len() {
            return Err(ReplicationError::InvalidPartition {
                partition: assignment.partition,
                partitions: self.queues.len(),
            });
        }
        Ok(assignment)
    }

    /// Apply the drain rule at the start of a transaction.
    async fn enter_section(&self, assignment: PartitionAssignment) {
        let active = self.active_critical_partition();
        let needs_drain = if assignment.critical {
            active != Some(assignment.partition)
        } else {
            active.is_some()
        };
        if !needs_drain {
            return;
        }

        let started = Instant::now();
        debug!(
            partition = assignment.partition,
            critical = assignment.critical,
            in_flight = self.in_flight.count(),
            "Draining before critical section change"
        );
        self.in_flight.wait_for_zero().await;
        metrics::record_critical_drain(started.elapsed());

        let next = if assignment.critical {
            assignment.partition
        } else {
            NO_CRITICAL
        };
        self.active_critical.store(next, Ordering::SeqCst);
    }

    /// Bookkeeping after an event: counts, sync markers, watches, stop.
    async fn finish(&self, state: &mut DispatchState, header: Header) -> Result<()> {
        let boundary = header.last_frag;
        state.last_header = Some(header.clone());
        if !boundary {
            return Ok(());
        }

        self.transactions.fetch_add(1, Ordering::Relaxed);
        state.since_sync += 1;
        if self.sync_interval > 0 && state.since_sync >= self.sync_interval {
            state.since_sync = 0;
            debug!(seqno = header.seqno, "Periodic sync");
            self.broadcast(ControlMarker::sync(header.clone())).await?;
        }

        let (matched, waiting): (Vec<_>, Vec<_>) =
            state.watches.drain(..).partition(|p| p.matches(&header));
        state.watches = waiting;
        for predicate in matched {
            info!(predicate = %predicate, seqno = header.seqno, "Watch predicate matched");
            self.broadcast(ControlMarker::sync(header.clone())).await?;
        }

        if state.stop_requested {
            state.stop_requested = false;
            info!(seqno = header.seqno, "Deferred stop inserted");
            self.broadcast(ControlMarker::stop(header)).await?;
        }
        Ok(())
    }

    async fn broadcast(&self, marker: ControlMarker) -> Result<()> {
        for queue in &self.queues {
            queue.post_out_of_band(marker.clone()).await?;
        }
        Ok(())
    }

    /// Emit a SYNC marker the first time a completed transaction satisfies
    /// `predicate`. Checked immediately against the last transaction.
    pub async fn add_watch_sync(&self, predicate: WatchPredicate) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(header) = state.last_header.clone() {
            if predicate.matches(&header) {
                info!(predicate = %predicate, seqno = header.seqno, "Watch predicate already satisfied");
                return self.broadcast(ControlMarker::sync(header)).await;
            }
        }
        state.watches.push(predicate);
        Ok(())
    }

    /// Ask consumers to stop. Returns `true` if the STOP marker was inserted
    /// now, `false` if it waits for the next transaction boundary.
    pub async fn insert_stop(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.last_header.clone() {
            Some(header) if state.at_boundary() => {
                info!(seqno = header.seqno, "Stop inserted");
                self.broadcast(ControlMarker::stop(header)).await?;
                Ok(true)
            }
            _ => {
                state.stop_requested = true;
                Ok(false)
            }
        }
    }

    /// Record the last transaction a partition's consumer fully processed.
    /// Older reports than the current one are ignored.
    pub fn report_processed(&self, partition: usize, header: Header) -> Result<()> {
        let partitions = self.queues.len();
        let mut processed = self
            .processed
            .lock()
            .map_err(|_| ReplicationError::Internal("processed positions lock poisoned".to_string()))?;
        let slot = processed
            .get_mut(partition)
            .ok_or(ReplicationError::InvalidPartition { partition, partitions })?;
        let newer = slot
            .as_ref()
            .map_or(true, |current| header.position_cmp(current) != PositionOrdering::Less);
        if newer {
            *slot = Some(header);
        }
        Ok(())
    }

    /// Restart point: the minimum processed header, once every partition
    /// has reported.
    pub fn min_last_header(&self) -> Option<Header> {
        let processed = self.processed.lock().ok()?;
        if processed.iter().any(Option::is_none) {
            return None;
        }
        min_header(processed.iter().flatten()).cloned()
    }
}
