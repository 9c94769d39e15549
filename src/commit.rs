// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-channel commit positions persisted in SQLite.
//!
//! Each apply channel owns one row holding the header of the last transaction
//! it committed. The minimum across all rows is the restart point: log data
//! below it may be reclaimed, data above it is replayed after a crash.
//!
//! # Low-water-mark
//!
//! The first update a channel makes after the tracker is opened fixes that
//! channel's low-water-mark to whatever seqno was stored at the time. Later
//! updates below the mark are dropped, never written:
//!
//! ```text
//! stored 120 → open → update(121) ✓ → update(118) ✗ dropped (warned once)
//! ```
//!
//! A stale or duplicated commit callback therefore cannot rewind the restart
//! point.
//!
//! # Channel reconfiguration
//!
//! - `expand_tasks(n)` copies channel 0's row to channels `1..n`.
//! - `reduce_tasks(n)` collapses back to channel 0, but only when all `n`
//!   rows agree on the seqno. Otherwise nothing changes and `false` is
//!   returned.
//!
//! # SQLite Busy Handling
//!
//! Writes retry SQLITE_BUSY/SQLITE_LOCKED with exponential backoff, like
//! every other SQLite access in this crate.

use crate::config::CommitStoreConfig;
use crate::error::{ReplicationError, Result};
use crate::event::{min_header, Header};
use crate::log_store::BoxFuture;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Stored seqno of a channel that has not committed anything yet.
const NO_SEQNO: i64 = -1;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::commit_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Hook run after a successful `reduce_tasks`, e.g. to move the position of
/// a native replication stream to the collapsed restart point.
pub trait NativePositionSync: Send + Sync {
    fn sync_position<'a>(&'a self, header: &'a Header) -> BoxFuture<'a, ()>;
}

/// One channel's persisted commit position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPosition {
    pub channel: u32,
    /// `None` until the channel commits its first transaction.
    pub header: Option<Header>,
    /// Seconds between extraction and apply, never negative.
    pub applied_latency: u64,
    pub update_timestamp: DateTime<Utc>,
}

impl CommitPosition {
    pub fn seqno(&self) -> Option<u64> {
        self.header.as_ref().map(|h| h.seqno)
    }
}

/// Row image of `commit_positions`.
struct StoredRow {
    channel: i64,
    seqno: i64,
    fragno: i64,
    last_frag: bool,
    source_id: String,
    epoch_number: i64,
    event_id: String,
    shard_id: String,
    applied_latency: i64,
    update_timestamp: i64,
    source_timestamp: i64,
    extract_timestamp: i64,
}

fn to_sql(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| ReplicationError::Internal(format!("{} {} does not fit in SQLite INTEGER", column, value)))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

impl StoredRow {
    fn new(channel: u32, header: Option<&Header>, applied_latency: u64) -> Result<Self> {
        let now = Utc::now().timestamp_millis();
        let latency = to_sql(applied_latency, "applied_latency")?;
        Ok(match header {
            Some(h) => Self {
                channel: i64::from(channel),
                seqno: to_sql(h.seqno, "seqno")?,
                fragno: i64::from(h.fragno),
                last_frag: h.last_frag,
                source_id: h.source_id.clone(),
                epoch_number: to_sql(h.epoch_number, "epoch_number")?,
                event_id: h.event_id.clone(),
                shard_id: h.shard_id.clone(),
                applied_latency: latency,
                update_timestamp: now,
                source_timestamp: h.source_tstamp.timestamp_millis(),
                extract_timestamp: h.extract_tstamp.timestamp_millis(),
            },
            None => Self {
                channel: i64::from(channel),
                seqno: NO_SEQNO,
                fragno: 0,
                last_frag: true,
                source_id: String::new(),
                epoch_number: 0,
                event_id: String::new(),
                shard_id: String::new(),
                applied_latency: latency,
                update_timestamp: now,
                source_timestamp: 0,
                extract_timestamp: 0,
            },
        })
    }

    fn from_sqlite(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            channel: row.try_get("task_id")?,
            seqno: row.try_get("seqno")?,
            fragno: row.try_get("fragno")?,
            last_frag: row.try_get("last_frag")?,
            source_id: row.try_get("source_id")?,
            epoch_number: row.try_get("epoch_number")?,
            event_id: row.try_get("event_id")?,
            shard_id: row.try_get("shard_id")?,
            applied_latency: row.try_get("applied_latency")?,
            update_timestamp: row.try_get("update_timestamp")?,
            source_timestamp: row.try_get("source_timestamp")?,
            extract_timestamp: row.try_get("extract_timestamp")?,
        })
    }

    /// Same position moved to another channel.
    fn for_channel(&self, channel: u32) -> Self {
        Self {
            channel: i64::from(channel),
            source_id: self.source_id.clone(),
            event_id: self.event_id.clone(),
            shard_id: self.shard_id.clone(),
            ..*self
        }
    }

    fn into_position(self) -> CommitPosition {
        let header = (self.seqno >= 0).then(|| Header {
            seqno: self.seqno as u64,
            fragno: u16::try_from(self.fragno).unwrap_or(0),
            last_frag: self.last_frag,
            source_id: self.source_id,
            epoch_number: self.epoch_number.max(0) as u64,
            event_id: self.event_id,
            shard_id: self.shard_id,
            source_tstamp: from_millis(self.source_timestamp),
            extract_tstamp: from_millis(self.extract_timestamp),
        });
        CommitPosition {
            channel: u32::try_from(self.channel).unwrap_or(u32::MAX),
            header,
            applied_latency: self.applied_latency.max(0) as u64,
            update_timestamp: from_millis(self.update_timestamp),
        }
    }
}

async fn write_row(conn: &mut SqliteConnection, row: &StoredRow) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO commit_positions (
            task_id, seqno, fragno, last_frag, source_id, epoch_number, event_id,
            shard_id, applied_latency, update_timestamp, source_timestamp, extract_timestamp
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            seqno = excluded.seqno,
            fragno = excluded.fragno,
            last_frag = excluded.last_frag,
            source_id = excluded.source_id,
            epoch_number = excluded.epoch_number,
            event_id = excluded.event_id,
            shard_id = excluded.shard_id,
            applied_latency = excluded.applied_latency,
            update_timestamp = excluded.update_timestamp,
            source_timestamp = excluded.source_timestamp,
            extract_timestamp = excluded.extract_timestamp
        "#,
    )
    .bind(row.channel)
    .bind(row.seqno)
    .bind(row.fragno)
    .bind(row.last_frag)
    .bind(row.source_id.clone())
    .bind(row.epoch_number)
    .bind(row.event_id.clone())
    .bind(row.shard_id.clone())
    .bind(row.applied_latency)
    .bind(row.update_timestamp)
    .bind(row.source_timestamp)
    .bind(row.extract_timestamp)
    .execute(conn)
    .await?;
    Ok(())
}

/// Persistent per-channel commit positions backed by SQLite.
pub struct CommitPositionTracker {
    pool: SqlitePool,
    channels: AtomicUsize,
    /// Low-water-mark per channel, fixed on first update after open.
    /// `None` inside means the channel had nothing stored.
    marks: DashMap<u32, Option<u64>>,
    /// Last header written per channel, for idempotent repeats.
    last_written: DashMap<u32, Header>,
    regression_warned: AtomicBool,
    regressions_dropped: AtomicU64,
    native_sync: Option<Arc<dyn NativePositionSync>>,
    wal_mode: bool,
    path: String,
}

impl CommitPositionTracker {
    /// Open the store and reconcile its rows with `config.channels`.
    ///
    /// Creates the database and table if they don't exist.
    pub async fn open(config: &CommitStoreConfig) -> Result<Self> {
        let tracker = Self::connect(config).await?;
        tracker.initialize(config.channels).await?;
        Ok(tracker)
    }

    /// Open the store without touching its rows.
    pub async fn connect(config: &CommitStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing commit position store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        let wal_mode = config.wal_mode && !in_memory;
        if wal_mode {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // An in-memory database lives exactly as long as its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commit_positions (
                task_id INTEGER PRIMARY KEY,
                seqno INTEGER NOT NULL,
                fragno INTEGER NOT NULL,
                last_frag INTEGER NOT NULL,
                source_id TEXT NOT NULL,
                epoch_number INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                shard_id TEXT NOT NULL,
                applied_latency INTEGER NOT NULL,
                update_timestamp INTEGER NOT NULL,
                source_timestamp INTEGER NOT NULL,
                extract_timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            channels: AtomicUsize::new(0),
            marks: DashMap::new(),
            last_written: DashMap::new(),
            regression_warned: AtomicBool::new(false),
            regressions_dropped: AtomicU64::new(0),
            native_sync: None,
            wal_mode,
            path,
        })
    }

    pub fn with_native_sync(mut self, hook: Arc<dyn NativePositionSync>) -> Self {
        self.native_sync = Some(hook);
        self
    }

    /// Reconcile persisted rows with the configured channel count.
    ///
    /// | rows | channels | action |
    /// |------|----------|--------|
    /// | 0 | n | create n empty rows |
    /// | n | n | nothing |
    /// | 1 | n > 1 | `expand_tasks(n)` |
    /// | n > 1 | 1 | `reduce_tasks(n)`, fatal if not reducible |
    /// | other | other | `ChannelCountMismatch` |
    pub async fn initialize(&self, channels: usize) -> Result<()> {
        if channels == 0 {
            return Err(ReplicationError::Config("channel count must be at least 1".to_string()));
        }
        let found = self.count().await?;

        if found == 0 {
            let pool = &self.pool;
            let rows = (0..channels)
                .map(|channel| StoredRow::new(channel as u32, None, 0))
                .collect::<Result<Vec<_>>>()?;
            execute_with_retry("commit_init", || async {
                let mut tx = pool.begin().await?;
                for row in &rows {
                    write_row(&mut tx, row).await?;
                }
                tx.commit().await
            })
            .await?;
            info!(channels, "Created commit positions");
        } else if found == channels {
            info!(channels, "Restored commit positions from previous run");
        } else if found == 1 {
            self.expand_tasks(channels).await?;
        } else if channels == 1 {
            if !self.reduce_tasks(found).await? {
                return Err(ReplicationError::ChannelCountMismatch { expected: 1, found });
            }
        } else {
            return Err(ReplicationError::ChannelCountMismatch {
                expected: channels,
                found,
            });
        }

        self.channels.store(channels, Ordering::SeqCst);
        Ok(())
    }

    /// Number of channels the rows currently describe.
    pub fn channels(&self) -> usize {
        self.channels.load(Ordering::SeqCst)
    }

    fn check_channel(&self, channel: u32) -> Result<()> {
        let channels = self.channels();
        if (channel as usize) < channels {
            Ok(())
        } else {
            Err(ReplicationError::InvalidChannel {
                channel,
                channels: channels as u32,
            })
        }
    }

    async fn low_water_mark(&self, channel: u32) -> Result<Option<u64>> {
        let cached = self.marks.get(&channel).map(|mark| *mark);
        if let Some(mark) = cached {
            return Ok(mark);
        }
        let stored = self.last_commit_seqno(channel).await?;
        debug!(channel, low_water_mark = ?stored, "Low-water-mark established");
        Ok(*self.marks.entry(channel).or_insert(stored))
    }

    /// Record that `channel` committed the transaction `header`.
    ///
    /// Returns `false` when the update was dropped: below the channel's
    /// low-water-mark, or identical to the previous update. Negative
    /// `applied_latency` (clock skew) is stored as zero.
    pub async fn update_last_commit_seqno(
        &self,
        channel: u32,
        header: &Header,
        applied_latency: i64,
    ) -> Result<bool> {
        self.check_channel(channel)?;

        if let Some(mark) = self.low_water_mark(channel).await? {
            if header.seqno < mark {
                self.regressions_dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_commit_regression(channel);
                if !self.regression_warned.swap(true, Ordering::SeqCst) {
                    warn!(
                        channel,
                        seqno = header.seqno,
                        low_water_mark = mark,
                        "Dropping commit position below low-water-mark; further drops are not logged"
                    );
                }
                return Ok(false);
            }
        }

        if self.last_written.get(&channel).is_some_and(|last| *last == *header) {
            return Ok(false);
        }

        let latency = applied_latency.max(0) as u64;
        let row = StoredRow::new(channel, Some(header), latency)?;
        let pool = &self.pool;
        execute_with_retry("commit_update", || async {
            let mut conn = pool.acquire().await?;
            write_row(&mut conn, &row).await
        })
        .await?;

        self.last_written.insert(channel, header.clone());
        crate::metrics::record_commit_update(channel, latency as f64);
        debug!(channel, seqno = header.seqno, fragno = header.fragno, "Commit position updated");
        Ok(true)
    }

    async fn fetch_row(&self, channel: u32) -> Result<Option<CommitPosition>> {
        let row = sqlx::query("SELECT * FROM commit_positions WHERE task_id = ?")
            .bind(i64::from(channel))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(StoredRow::from_sqlite(&row)?.into_position())),
            None => Ok(None),
        }
    }

    pub async fn last_commit_header(&self, channel: u32) -> Result<Option<Header>> {
        Ok(self.fetch_row(channel).await?.and_then(|p| p.header))
    }

    pub async fn last_commit_seqno(&self, channel: u32) -> Result<Option<u64>> {
        Ok(self.last_commit_header(channel).await?.map(|h| h.seqno))
    }

    /// Number of persisted rows.
    pub async fn count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM commit_positions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// All rows ordered by channel.
    pub async fn all_positions(&self) -> Result<Vec<CommitPosition>> {
        let rows = sqlx::query("SELECT * FROM commit_positions ORDER BY task_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(StoredRow::from_sqlite(row)?.into_position()))
            .collect()
    }

    /// Minimum committed header across channels; the safe restart and purge
    /// point. `None` if any channel has not committed yet.
    pub async fn get_min_last_header(&self) -> Result<Option<Header>> {
        let positions = self.all_positions().await?;
        if positions.is_empty() || positions.iter().any(|p| p.header.is_none()) {
            return Ok(None);
        }
        Ok(min_header(positions.iter().filter_map(|p| p.header.as_ref())).cloned())
    }

    pub async fn min_commit_seqno(&self) -> Result<Option<u64>> {
        Ok(self.get_min_last_header().await?.map(|h| h.seqno))
    }

    /// Copy channel 0's position to channels `1..channels`.
    ///
    /// Fails if channel 0 has no row.
    pub async fn expand_tasks(&self, channels: usize) -> Result<()> {
        let template = sqlx::query("SELECT * FROM commit_positions WHERE task_id = 0")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ReplicationError::InvalidState {
                expected: "commit position for channel 0".to_string(),
                actual: "no row".to_string(),
            })?;
        let template = StoredRow::from_sqlite(&template)?;
        let rows: Vec<StoredRow> = (1..channels).map(|c| template.for_channel(c as u32)).collect();

        let pool = &self.pool;
        execute_with_retry("commit_expand", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM commit_positions WHERE task_id > 0")
                .execute(&mut *tx)
                .await?;
            for row in &rows {
                write_row(&mut tx, row).await?;
            }
            tx.commit().await
        })
        .await?;

        self.marks.retain(|channel, _| *channel == 0);
        self.last_written.retain(|channel, _| *channel == 0);
        self.channels.store(channels, Ordering::SeqCst);
        info!(channels, seqno = template.seqno, "Expanded commit positions from channel 0");
        Ok(())
    }

    /// Collapse `expected_channels` rows back to channel 0.
    ///
    /// Only reduces when channel 0 exists, the row count equals
    /// `expected_channels` and every row holds the same seqno. Anything else
    /// leaves the table unchanged and returns `false`.
    pub async fn reduce_tasks(&self, expected_channels: usize) -> Result<bool> {
        let positions = self.all_positions().await?;

        let Some(zero) = positions.iter().find(|p| p.channel == 0) else {
            warn!("Cannot reduce commit positions: channel 0 has no row");
            return Ok(false);
        };
        if positions.len() != expected_channels {
            warn!(
                rows = positions.len(),
                expected_channels, "Cannot reduce commit positions: row count does not match channel count"
            );
            return Ok(false);
        }
        let seqno = zero.seqno();
        if let Some(other) = positions.iter().find(|p| p.seqno() != seqno) {
            info!(
                channel = other.channel,
                seqno = ?other.seqno(),
                channel_0_seqno = ?seqno,
                "Channels are at different positions, not reducing"
            );
            return Ok(false);
        }

        let pool = &self.pool;
        execute_with_retry("commit_reduce", || async {
            sqlx::query("DELETE FROM commit_positions WHERE task_id > 0")
                .execute(pool)
                .await
        })
        .await?;

        self.marks.retain(|channel, _| *channel == 0);
        self.last_written.retain(|channel, _| *channel == 0);
        self.channels.store(1, Ordering::SeqCst);
        info!(from = expected_channels, seqno = ?seqno, "Reduced commit positions to one channel");

        if let (Some(hook), Some(header)) = (&self.native_sync, &zero.header) {
            if let Err(e) = hook.sync_position(header).await {
                warn!(error = %e, seqno = header.seqno, "Native position sync failed after reduce");
            }
        }
        Ok(true)
    }

    /// Updates dropped for being below a low-water-mark.
    pub fn regressions_dropped(&self) -> u64 {
        self.regressions_dropped.load(Ordering::Relaxed)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if self.wal_mode {
            let pool = &self.pool;
            let result = execute_with_retry("commit_checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!("Commit position store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use tracing_subscriber::Registry;

    fn header(seqno: u64) -> Header {
        Header::new(seqno, "db1", 3)
    }

    async fn tracker(channels: usize) -> CommitPositionTracker {
        CommitPositionTracker::open(&CommitStoreConfig::in_memory(channels))
            .await
            .unwrap()
    }

    #[derive(Default)]
    struct RecordingSync {
        synced: Mutex<Vec<u64>>,
    }

    impl NativePositionSync for RecordingSync {
        fn sync_position<'a>(&'a self, header: &'a Header) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.synced.lock().unwrap().push(header.seqno);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_open_creates_empty_rows() {
        let tracker = tracker(3).await;
        assert_eq!(tracker.count().await.unwrap(), 3);
        assert_eq!(tracker.channels(), 3);
        assert!(tracker.last_commit_header(2).await.unwrap().is_none());
        assert!(tracker.min_commit_seqno().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_and_read_back() {
        let tracker = tracker(1).await;
        let mut h = header(42);
        h.event_id = "mysql-bin.000003:1200".to_string();
        h.shard_id = "sales".to_string();

        assert!(tracker.update_last_commit_seqno(0, &h, 7).await.unwrap());

        let stored = tracker.last_commit_header(0).await.unwrap().unwrap();
        assert_eq!(stored.seqno, 42);
        assert_eq!(stored.event_id, "mysql-bin.000003:1200");
        assert_eq!(stored.shard_id, "sales");
        assert_eq!(stored.epoch_number, 3);
        let positions = tracker.all_positions().await.unwrap();
        assert_eq!(positions[0].applied_latency, 7);
    }

    #[tokio::test]
    async fn test_negative_latency_floored() {
        let tracker = tracker(1).await;
        tracker.update_last_commit_seqno(0, &header(1), -30).await.unwrap();
        let positions = tracker.all_positions().await.unwrap();
        assert_eq!(positions[0].applied_latency, 0);
    }

    #[tokio::test]
    async fn test_identical_update_is_idempotent() {
        let tracker = tracker(1).await;
        let h = header(10);
        assert!(tracker.update_last_commit_seqno(0, &h, 1).await.unwrap());
        let before = tracker.all_positions().await.unwrap();

        assert!(!tracker.update_last_commit_seqno(0, &h, 1).await.unwrap());
        assert_eq!(tracker.all_positions().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_regression_below_low_water_mark_dropped() {
        let dir = tempdir().unwrap();
        let config = CommitStoreConfig {
            sqlite_path: dir.path().join("commit.db").to_string_lossy().to_string(),
            channels: 1,
            wal_mode: true,
        };
        {
            let tracker = CommitPositionTracker::open(&config).await.unwrap();
            tracker.update_last_commit_seqno(0, &header(120), 0).await.unwrap();
            tracker.close().await;
        }

        let tracker = CommitPositionTracker::open(&config).await.unwrap();
        assert!(tracker.update_last_commit_seqno(0, &header(121), 0).await.unwrap());
        assert!(!tracker.update_last_commit_seqno(0, &header(118), 0).await.unwrap());
        assert!(!tracker.update_last_commit_seqno(0, &header(100), 0).await.unwrap());

        assert_eq!(tracker.last_commit_seqno(0).await.unwrap(), Some(121));
        assert_eq!(tracker.regressions_dropped(), 2);
        tracker.close().await;
    }

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == Level::WARN && meta.target() == "replication_distributor::commit" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    // current_thread keeps every tracker call on the thread holding the
    // default subscriber.
    #[tokio::test(flavor = "current_thread")]
    async fn test_regression_warning_logged_once_per_tracker() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let _guard = tracing::subscriber::set_default(
            Registry::default().with(WarnCounter(warnings.clone())),
        );

        let dir = tempdir().unwrap();
        let config = CommitStoreConfig {
            sqlite_path: dir.path().join("commit.db").to_string_lossy().to_string(),
            channels: 2,
            wal_mode: true,
        };
        {
            let tracker = CommitPositionTracker::open(&config).await.unwrap();
            tracker.update_last_commit_seqno(0, &header(120), 0).await.unwrap();
            tracker.update_last_commit_seqno(1, &header(220), 0).await.unwrap();
            tracker.close().await;
        }

        let tracker = CommitPositionTracker::open(&config).await.unwrap();
        assert!(!tracker.update_last_commit_seqno(0, &header(100), 0).await.unwrap());
        assert!(!tracker.update_last_commit_seqno(1, &header(200), 0).await.unwrap());
        assert!(!tracker.update_last_commit_seqno(0, &header(90), 0).await.unwrap());
        assert!(!tracker.update_last_commit_seqno(1, &header(150), 0).await.unwrap());

        assert_eq!(tracker.regressions_dropped(), 4);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        tracker.close().await;

        // A fresh tracker warns again.
        let tracker = CommitPositionTracker::open(&config).await.unwrap();
        assert!(!tracker.update_last_commit_seqno(1, &header(10), 0).await.unwrap());
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
        tracker.close().await;
    }

    #[tokio::test]
    async fn test_mark_is_fixed_at_first_observation() {
        let tracker = tracker(1).await;
        // Nothing stored: no mark, so later lower updates are still accepted.
        tracker.update_last_commit_seqno(0, &header(50), 0).await.unwrap();
        assert!(tracker.update_last_commit_seqno(0, &header(40), 0).await.unwrap());
        assert_eq!(tracker.regressions_dropped(), 0);
    }

    #[tokio::test]
    async fn test_invalid_channel() {
        let tracker = tracker(2).await;
        let err = tracker.update_last_commit_seqno(2, &header(1), 0).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidChannel { channel: 2, channels: 2 }));
    }

    #[tokio::test]
    async fn test_min_across_channels() {
        let tracker = tracker(2).await;
        tracker.update_last_commit_seqno(0, &header(100), 0).await.unwrap();
        assert!(tracker.min_commit_seqno().await.unwrap().is_none());

        tracker.update_last_commit_seqno(1, &header(80), 0).await.unwrap();
        assert_eq!(tracker.min_commit_seqno().await.unwrap(), Some(80));
        assert_eq!(tracker.get_min_last_header().await.unwrap().unwrap().seqno, 80);
    }

    #[tokio::test]
    async fn test_expand_copies_channel_zero() {
        let tracker = tracker(1).await;
        tracker.update_last_commit_seqno(0, &header(77), 0).await.unwrap();

        tracker.expand_tasks(4).await.unwrap();

        assert_eq!(tracker.count().await.unwrap(), 4);
        assert_eq!(tracker.channels(), 4);
        for channel in 0..4 {
            assert_eq!(tracker.last_commit_seqno(channel).await.unwrap(), Some(77));
        }
    }

    #[tokio::test]
    async fn test_expand_without_channel_zero_fails() {
        let tracker = CommitPositionTracker::connect(&CommitStoreConfig::in_memory(1))
            .await
            .unwrap();
        let err = tracker.expand_tasks(2).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_reduce_refuses_inconsistent_seqnos() {
        let tracker = tracker(2).await;
        tracker.update_last_commit_seqno(0, &header(80), 0).await.unwrap();
        tracker.update_last_commit_seqno(1, &header(95), 0).await.unwrap();

        assert!(!tracker.reduce_tasks(2).await.unwrap());
        assert!(!tracker.reduce_tasks(1).await.unwrap());
        assert_eq!(tracker.count().await.unwrap(), 2);
        assert_eq!(tracker.last_commit_seqno(1).await.unwrap(), Some(95));
    }

    #[tokio::test]
    async fn test_reduce_consistent_channels_runs_hook() {
        let hook = Arc::new(RecordingSync::default());
        let tracker = CommitPositionTracker::open(&CommitStoreConfig::in_memory(3))
            .await
            .unwrap()
            .with_native_sync(hook.clone());
        for channel in 0..3 {
            tracker.update_last_commit_seqno(channel, &header(200), 0).await.unwrap();
        }

        assert!(tracker.reduce_tasks(3).await.unwrap());
        assert_eq!(tracker.count().await.unwrap(), 1);
        assert_eq!(tracker.channels(), 1);
        assert_eq!(*hook.synced.lock().unwrap(), vec![200]);
    }

    #[tokio::test]
    async fn test_initialize_channel_count_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mismatch.db").to_string_lossy().to_string();
        let config = |channels| CommitStoreConfig {
            sqlite_path: path.clone(),
            channels,
            wal_mode: true,
        };
        CommitPositionTracker::open(&config(3)).await.unwrap().close().await;

        let err = CommitPositionTracker::open(&config(2)).await.err().unwrap();
        assert!(matches!(
            err,
            ReplicationError::ChannelCountMismatch { expected: 2, found: 3 }
        ));
    }

    #[tokio::test]
    async fn test_initialize_reduces_to_single_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reduce.db").to_string_lossy().to_string();
        let config = |channels| CommitStoreConfig {
            sqlite_path: path.clone(),
            channels,
            wal_mode: true,
        };
        {
            let tracker = CommitPositionTracker::open(&config(2)).await.unwrap();
            tracker.update_last_commit_seqno(0, &header(9), 0).await.unwrap();
            tracker.update_last_commit_seqno(1, &header(9), 0).await.unwrap();
            tracker.close().await;
        }

        let tracker = CommitPositionTracker::open(&config(1)).await.unwrap();
        assert_eq!(tracker.count().await.unwrap(), 1);
        assert_eq!(tracker.last_commit_seqno(0).await.unwrap(), Some(9));
        tracker.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }
}
