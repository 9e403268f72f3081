// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap persistence for change-log coverage.
//!
//! A gap is an inclusive `[start_id, end_id]` range of change-log ids that
//! are not yet confirmed routed. The gap table is the engine's memory of
//! where it left off: a routing pass scans only the open gaps, and ids become
//! OK only after their batches are committed. A crash at any point leaves
//! every unconfirmed id inside an OPEN gap, so the next pass picks it up
//! again. No id is ever silently skipped.
//!
//! The tail of the log is itself an open gap ending at `i64::MAX`; splitting
//! it during commit is what advances the scan position.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. We handle this with:
//! - Automatic retry with exponential backoff
//! - Configurable max retries (default 5)
//!
//! # Commit Semantics
//!
//! `commit_pass()` rewrites each open gap as the pieces the pass proved:
//! runs of routed ids become OK rows, everything else (failed rows, ids the
//! scan never saw, the unscanned remainder) stays OPEN. Each original gap row
//! is rewritten in its own transaction, so an interruption leaves whole gap
//! rows either old or new, never half-covered.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::config::GapStoreConfig;
use crate::error::{Result, RoutingError};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            // Fallback to message matching
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
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
                crate::metrics::gap_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                // Exponential backoff with cap
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

/// Gap status codes as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    /// Ids in the range are not yet confirmed routed.
    Open,
    /// Every id in the range has been routed and committed.
    Ok,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Open => "OPEN",
            GapStatus::Ok => "OK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(GapStatus::Open),
            "OK" => Some(GapStatus::Ok),
            _ => None,
        }
    }
}

/// One persisted gap row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub channel_id: String,
    /// Inclusive lower bound.
    pub start_id: i64,
    /// Inclusive upper bound. `i64::MAX` marks the tail of the log.
    pub end_id: i64,
    pub status: GapStatus,
    /// Millis since epoch of the last rewrite.
    pub updated_at: i64,
}

impl Gap {
    pub fn contains(&self, data_id: i64) -> bool {
        data_id >= self.start_id && data_id <= self.end_id
    }

    pub fn is_tail(&self) -> bool {
        self.end_id == i64::MAX
    }
}

/// Persistent gap storage backed by SQLite.
pub struct GapTracker {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Path to database file
    path: String,
}

impl GapTracker {
    /// Open (or create) the gap store described by `config`.
    pub async fn new(config: &GapStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing gap store");

        let (url, max_connections) = if path == ":memory:" {
            // A pooled in-memory database must stay on one connection or each
            // connection sees its own empty database.
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite://{}?mode=rwc", path), 2)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RoutingError::Config(format!("Invalid SQLite path: {}", e)))?
            .create_if_missing(true);
        if config.wal_mode {
            options = options
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gaps (
                channel_id TEXT NOT NULL,
                start_id INTEGER NOT NULL,
                end_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (channel_id, start_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    /// The ordered open gaps for a channel; what the next pass will scan.
    ///
    /// A channel seen for the first time is seeded with one open gap covering
    /// the whole log, `[0, i64::MAX]`.
    pub async fn gap_plan(&self, channel_id: &str) -> Result<Vec<Gap>> {
        let pool = &self.pool;
        let channel = channel_id.to_string();

        let total: i64 = execute_with_retry("gap_plan_count", || async {
            sqlx::query_scalar("SELECT COUNT(*) FROM gaps WHERE channel_id = ?")
                .bind(&channel)
                .fetch_one(pool)
                .await
        })
        .await?;

        if total == 0 {
            let now = chrono::Utc::now().timestamp_millis();
            execute_with_retry("gap_plan_seed", || async {
                sqlx::query(
                    "INSERT INTO gaps (channel_id, start_id, end_id, status, updated_at) \
                     VALUES (?, 0, ?, 'OPEN', ?)",
                )
                .bind(&channel)
                .bind(i64::MAX)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;
            debug!(channel_id = %channel, "Seeded initial gap covering whole log");
        }

        let rows: Vec<(i64, i64, i64)> = execute_with_retry("gap_plan_select", || async {
            sqlx::query_as(
                "SELECT start_id, end_id, updated_at FROM gaps \
                 WHERE channel_id = ? AND status = 'OPEN' ORDER BY start_id",
            )
            .bind(&channel)
            .fetch_all(pool)
            .await
        })
        .await?;

        Ok(rows
            .into_iter()
            .map(|(start_id, end_id, updated_at)| Gap {
                channel_id: channel.clone(),
                start_id,
                end_id,
                status: GapStatus::Open,
                updated_at,
            })
            .collect())
    }

    /// Commit a finished pass for one channel.
    ///
    /// `last_id_seen` is the highest id the scan reached (`None` means the
    /// log had nothing to offer and the gaps stay as they are). `routed_ids`
    /// are the ids whose batch copies were committed this pass. Open gaps are
    /// rewritten piecewise: routed runs become OK, everything else stays OPEN,
    /// and the portion of each gap above `last_id_seen` is untouched OPEN
    /// remainder (for the tail gap, that is the rest of the log).
    pub async fn commit_pass(
        &self,
        channel_id: &str,
        last_id_seen: Option<i64>,
        routed_ids: &BTreeSet<i64>,
    ) -> Result<()> {
        let Some(last_id_seen) = last_id_seen else {
            return Ok(());
        };

        let open = self.gap_plan(channel_id).await?;
        let now = chrono::Utc::now().timestamp_millis();

        for gap in open {
            if gap.start_id > last_id_seen {
                break; // beyond the scan, ordered by start_id
            }
            let pieces = split_gap(&gap, last_id_seen, routed_ids);
            if pieces.len() == 1 && pieces[0].1 == gap.end_id && pieces[0].2 == GapStatus::Open {
                continue; // nothing routed in this gap, leave the row alone
            }
            self.rewrite_gap(&gap, &pieces, now).await?;
        }

        debug!(
            channel_id = %channel_id,
            last_id_seen,
            routed = routed_ids.len(),
            "Committed routing pass to gap store"
        );
        Ok(())
    }

    /// Replace one gap row with its proven pieces, atomically.
    async fn rewrite_gap(
        &self,
        gap: &Gap,
        pieces: &[(i64, i64, GapStatus)],
        now: i64,
    ) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("gap_rewrite", || async {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM gaps WHERE channel_id = ? AND start_id = ?")
                .bind(&gap.channel_id)
                .bind(gap.start_id)
                .execute(&mut *tx)
                .await?;
            for (start_id, end_id, status) in pieces {
                sqlx::query(
                    "INSERT INTO gaps (channel_id, start_id, end_id, status, updated_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&gap.channel_id)
                .bind(start_id)
                .bind(end_id)
                .bind(status.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// All gap rows for a channel, OK included, ordered by start. For
    /// diagnostics and tests.
    pub async fn all_gaps(&self, channel_id: &str) -> Result<Vec<Gap>> {
        let pool = &self.pool;
        let channel = channel_id.to_string();
        let rows: Vec<(i64, i64, String, i64)> = execute_with_retry("gap_all_select", || async {
            sqlx::query_as(
                "SELECT start_id, end_id, status, updated_at FROM gaps \
                 WHERE channel_id = ? ORDER BY start_id",
            )
            .bind(&channel)
            .fetch_all(pool)
            .await
        })
        .await?;

        rows.into_iter()
            .map(|(start_id, end_id, status, updated_at)| {
                let status = GapStatus::from_str(&status).ok_or_else(|| {
                    RoutingError::Internal(format!("unknown gap status '{}' in store", status))
                })?;
                Ok(Gap {
                    channel_id: channel.clone(),
                    start_id,
                    end_id,
                    status,
                    updated_at,
                })
            })
            .collect()
    }

    /// Count of open gaps per channel (for metrics).
    pub async fn open_gap_counts(&self) -> Result<HashMap<String, usize>> {
        let pool = &self.pool;
        let rows: Vec<(String, i64)> = execute_with_retry("gap_open_counts", || async {
            sqlx::query_as(
                "SELECT channel_id, COUNT(*) FROM gaps WHERE status = 'OPEN' GROUP BY channel_id",
            )
            .fetch_all(pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(|(c, n)| (c, n as usize)).collect())
    }

    /// Drop OK rows below `below_id`; their coverage is implied by the
    /// surviving open gaps. Keeps the table from growing without bound.
    pub async fn purge_ok(&self, channel_id: &str, below_id: i64) -> Result<u64> {
        let pool = &self.pool;
        let channel = channel_id.to_string();
        let result = execute_with_retry("gap_purge_ok", || async {
            sqlx::query(
                "DELETE FROM gaps WHERE channel_id = ? AND status = 'OK' AND end_id < ?",
            )
            .bind(&channel)
            .bind(below_id)
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("gap_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Gap store closed");
    }
}

/// Split one open gap into the pieces a finished pass proved.
///
/// The scanned portion is `[gap.start_id, min(gap.end_id, last_id_seen)]`.
/// Maximal runs of routed ids inside it become OK pieces; the rest, plus any
/// unscanned remainder above `last_id_seen`, stays OPEN. Pieces come back
/// ordered and contiguous over the original range.
fn split_gap(gap: &Gap, last_id_seen: i64, routed_ids: &BTreeSet<i64>) -> Vec<(i64, i64, GapStatus)> {
    let scan_end = gap.end_id.min(last_id_seen);
    let mut pieces: Vec<(i64, i64, GapStatus)> = Vec::new();

    let mut cursor = gap.start_id;
    let mut run_start: Option<i64> = None;
    let mut run_end = 0i64;

    for &id in routed_ids.range(gap.start_id..=scan_end) {
        match run_start {
            Some(_) if run_end.checked_add(1) == Some(id) => {
                run_end = id;
            }
            _ => {
                if let Some(start) = run_start {
                    if cursor < start {
                        pieces.push((cursor, start - 1, GapStatus::Open));
                    }
                    pieces.push((start, run_end, GapStatus::Ok));
                    cursor = run_end + 1; // run_end < id, cannot overflow
                }
                run_start = Some(id);
                run_end = id;
            }
        }
    }
    if let Some(start) = run_start {
        if cursor < start {
            pieces.push((cursor, start - 1, GapStatus::Open));
        }
        pieces.push((start, run_end, GapStatus::Ok));
        // A run ending at the top of the id space leaves nothing above it.
        match run_end.checked_add(1) {
            Some(next) => cursor = next,
            None => return pieces,
        }
    }
    // Unrouted scanned tail plus the unscanned remainder stay open. They are
    // contiguous, so they collapse into one row.
    if cursor <= gap.end_id {
        pieces.push((cursor, gap.end_id, GapStatus::Open));
    }
    pieces
}
