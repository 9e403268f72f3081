// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed change-log source.
//!
//! Reads the trigger-populated `change_log` table as a
//! [`ChangeLogSource`]. Two query-shaping rules keep the scan cheap:
//!
//! - Payload columns the channel policy disables are selected as `''`
//!   instead of being read off disk; the rows come back with empty payloads
//!   but correct ids and metadata.
//! - The scan is qualified to the gap plan with `data_id BETWEEN` clauses,
//!   one per open gap, so already-covered ranges are never re-read. Past
//!   [`GAP_CLAUSE_THRESHOLD`] gaps the clause list would dwarf the query, so
//!   it degrades to a single lower bound and the reader's own gap filter
//!   drops the extras.
//!
//! Pages are fetched by keyset (`data_id > last`), so memory stays bounded
//! regardless of backlog depth.

use std::collections::VecDeque;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use tracing::{debug, info};

use crate::channels::ChannelPolicy;
use crate::data::{ChangeRow, EventType};
use crate::error::{Result, RoutingError};
use crate::gap::Gap;
use crate::reader::{BoxFuture, ChangeCursor, ChangeLogSource};

/// Above this many open gaps the per-gap BETWEEN clauses are dropped in
/// favor of one lower bound.
pub const GAP_CLAUSE_THRESHOLD: usize = 100;

/// Rows fetched per keyset page.
const PAGE_SIZE: usize = 1000;

/// Change log stored in a local SQLite database.
pub struct SqliteChangeLog {
    pool: SqlitePool,
}

impl SqliteChangeLog {
    /// Open (or create) the change log at `path`.
    pub async fn new(path: &str) -> Result<Self> {
        info!(path = %path, "Opening change log");
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RoutingError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let max_connections = if path == ":memory:" { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| RoutingError::change_log("open", e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                data_id INTEGER PRIMARY KEY,
                table_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                pk_data TEXT NOT NULL DEFAULT '',
                row_data TEXT NOT NULL DEFAULT '',
                old_data TEXT NOT NULL DEFAULT '',
                channel_id TEXT NOT NULL,
                transaction_id TEXT,
                source_node_id TEXT,
                router_id TEXT NOT NULL DEFAULT 'default',
                create_time INTEGER NOT NULL,
                is_routed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| RoutingError::change_log("migrate", e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_log_channel \
             ON change_log (channel_id, data_id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| RoutingError::change_log("migrate", e.to_string()))?;

        Ok(Self { pool })
    }

    /// Insert captured rows. Used by capture integrations and tests; the
    /// routing side never writes here.
    pub async fn append(&self, rows: &[ChangeRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO change_log
                    (data_id, table_name, event_type, pk_data, row_data, old_data,
                     channel_id, transaction_id, source_node_id, router_id,
                     create_time, is_routed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.data_id)
            .bind(&row.table_name)
            .bind(row.event_type.code())
            .bind(&row.pk_data)
            .bind(&row.row_data)
            .bind(&row.old_data)
            .bind(&row.channel_id)
            .bind(&row.transaction_id)
            .bind(&row.source_node_id)
            .bind(&row.router_id)
            .bind(row.create_time.timestamp_millis())
            .bind(row.already_routed as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| RoutingError::change_log("append", e.to_string()))?;
        }
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Change log closed");
    }
}

impl ChangeLogSource for SqliteChangeLog {
    fn open_cursor(
        &self,
        policy: &ChannelPolicy,
        gaps: &[Gap],
    ) -> BoxFuture<'_, Box<dyn ChangeCursor>> {
        let policy = policy.clone();
        let gap_ranges: Vec<(i64, i64)> = gaps.iter().map(|g| (g.start_id, g.end_id)).collect();
        let pool = self.pool.clone();
        Box::pin(async move {
            let start_after = gap_ranges.first().map(|&(s, _)| s - 1).unwrap_or(-1);
            debug!(
                channel_id = %policy.channel_id,
                gaps = gap_ranges.len(),
                "Opening change-log cursor"
            );
            Ok(Box::new(SqliteCursor {
                pool,
                policy,
                gap_ranges,
                last_id: start_after,
                buffer: VecDeque::new(),
                done: false,
            }) as Box<dyn ChangeCursor>)
        })
    }
}

struct SqliteCursor {
    pool: SqlitePool,
    policy: ChannelPolicy,
    gap_ranges: Vec<(i64, i64)>,
    last_id: i64,
    buffer: VecDeque<ChangeRow>,
    done: bool,
}

type LogRow = (
    i64,            // data_id
    String,         // table_name
    String,         // event_type
    String,         // pk_data
    String,         // row_data
    String,         // old_data
    String,         // channel_id
    Option<String>, // transaction_id
    Option<String>, // source_node_id
    String,         // router_id
    i64,            // create_time millis
    i64,            // is_routed
);

impl SqliteCursor {
    async fn fetch_page(&mut self) -> Result<()> {
        let mut qb: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("SELECT data_id, table_name, event_type, ");
        // Disabled payload columns are never read off disk.
        if self.policy.use_pk_data {
            qb.push("pk_data, ");
        } else {
            qb.push("'' AS pk_data, ");
        }
        if self.policy.use_row_data {
            qb.push("row_data, ");
        } else {
            qb.push("'' AS row_data, ");
        }
        if self.policy.use_old_data {
            qb.push("old_data, ");
        } else {
            qb.push("'' AS old_data, ");
        }
        qb.push(
            "channel_id, transaction_id, source_node_id, router_id, create_time, is_routed \
             FROM change_log WHERE channel_id = ",
        );
        qb.push_bind(self.policy.channel_id.clone());
        qb.push(" AND data_id > ");
        qb.push_bind(self.last_id);

        if !self.gap_ranges.is_empty() && self.gap_ranges.len() <= GAP_CLAUSE_THRESHOLD {
            qb.push(" AND (");
            for (i, &(start, end)) in self.gap_ranges.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                if end == i64::MAX {
                    qb.push("data_id >= ");
                    qb.push_bind(start);
                } else {
                    qb.push("data_id BETWEEN ");
                    qb.push_bind(start);
                    qb.push(" AND ");
                    qb.push_bind(end);
                }
            }
            qb.push(")");
        }
        // Past the threshold the lower bound above has to do; the reader's
        // gap filter drops rows from covered ranges.

        qb.push(" ORDER BY data_id LIMIT ");
        qb.push_bind(PAGE_SIZE as i64);

        let rows: Vec<LogRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RoutingError::change_log("scan", e.to_string()))?;

        if rows.len() < PAGE_SIZE {
            self.done = true;
        }

        for (
            data_id,
            table_name,
            event_type,
            pk_data,
            row_data,
            old_data,
            channel_id,
            transaction_id,
            source_node_id,
            router_id,
            create_time,
            is_routed,
        ) in rows
        {
            let event_type = EventType::from_code(&event_type).ok_or_else(|| {
                RoutingError::change_log(
                    "scan",
                    format!("data_id {} has unknown event type '{}'", data_id, event_type),
                )
            })?;
            let create_time = chrono::DateTime::from_timestamp_millis(create_time)
                .ok_or_else(|| {
                    RoutingError::change_log(
                        "scan",
                        format!("data_id {} has invalid create_time", data_id),
                    )
                })?;
            self.last_id = data_id;
            self.buffer.push_back(ChangeRow {
                data_id,
                table_name,
                event_type,
                pk_data,
                row_data,
                old_data,
                channel_id,
                transaction_id,
                source_node_id,
                router_id,
                create_time,
                already_routed: is_routed != 0,
            });
        }
        Ok(())
    }
}

impl ChangeCursor for SqliteCursor {
    fn next(&mut self) -> BoxFuture<'_, Option<ChangeRow>> {
        Box::pin(async move {
            if self.buffer.is_empty() && !self.done {
                self.fetch_page().await?;
            }
            Ok(self.buffer.pop_front())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::GapStatus;
    use chrono::Utc;
    use tempfile::tempdir;

    fn row(data_id: i64, channel_id: &str) -> ChangeRow {
        ChangeRow {
            data_id,
            table_name: "customer".to_string(),
            event_type: EventType::Update,
            pk_data: format!("{}", data_id),
            row_data: "1,alice".to_string(),
            old_data: "1,al".to_string(),
            channel_id: channel_id.to_string(),
            transaction_id: Some("tx-1".to_string()),
            source_node_id: None,
            router_id: "default".to_string(),
            create_time: Utc::now(),
            already_routed: false,
        }
    }

    fn open_gap(start: i64, end: i64) -> Gap {
        Gap {
            channel_id: "sales".to_string(),
            start_id: start,
            end_id: end,
            status: GapStatus::Open,
            updated_at: 0,
        }
    }

    async fn collect(log: &SqliteChangeLog, policy: &ChannelPolicy, gaps: &[Gap]) -> Vec<ChangeRow> {
        let mut cursor = log.open_cursor(policy, gaps).await.unwrap();
        let mut out = Vec::new();
        while let Some(row) = cursor.next().await.unwrap() {
            out.push(row);
        }
        out
    }

    #[tokio::test]
    async fn test_scan_returns_channel_rows_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db").to_string_lossy().to_string();
        let log = SqliteChangeLog::new(&path).await.unwrap();
        log.append(&[row(3, "sales"), row(1, "sales"), row(2, "config")])
            .await
            .unwrap();

        let rows = collect(&log, &ChannelPolicy::for_testing("sales"), &[open_gap(0, i64::MAX)]).await;
        let ids: Vec<i64> = rows.iter().map(|r| r.data_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(rows[0].transaction_id.as_deref(), Some("tx-1"));
        log.close().await;
    }

    #[tokio::test]
    async fn test_gap_clauses_restrict_the_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db").to_string_lossy().to_string();
        let log = SqliteChangeLog::new(&path).await.unwrap();
        log.append(&(1..=10).map(|i| row(i, "sales")).collect::<Vec<_>>())
            .await
            .unwrap();

        let gaps = [open_gap(2, 3), open_gap(8, i64::MAX)];
        let rows = collect(&log, &ChannelPolicy::for_testing("sales"), &gaps).await;
        let ids: Vec<i64> = rows.iter().map(|r| r.data_id).collect();
        assert_eq!(ids, vec![2, 3, 8, 9, 10]);
        log.close().await;
    }

    #[tokio::test]
    async fn test_disabled_columns_come_back_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db").to_string_lossy().to_string();
        let log = SqliteChangeLog::new(&path).await.unwrap();
        log.append(&[row(1, "sales")]).await.unwrap();

        let mut policy = ChannelPolicy::for_testing("sales");
        policy.use_old_data = false;
        policy.use_row_data = false;

        let rows = collect(&log, &policy, &[open_gap(0, i64::MAX)]).await;
        assert_eq!(rows[0].pk_data, "1");
        assert!(rows[0].row_data.is_empty());
        assert!(rows[0].old_data.is_empty());
        log.close().await;
    }

    #[tokio::test]
    async fn test_blank_marker_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db").to_string_lossy().to_string();
        let log = SqliteChangeLog::new(&path).await.unwrap();
        let mut marked = row(1, "sales");
        marked.already_routed = true;
        log.append(&[marked]).await.unwrap();

        let rows = collect(&log, &ChannelPolicy::for_testing("sales"), &[open_gap(0, i64::MAX)]).await;
        assert!(rows[0].already_routed);
        log.close().await;
    }

    #[tokio::test]
    async fn test_many_gaps_degrade_to_lower_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db").to_string_lossy().to_string();
        let log = SqliteChangeLog::new(&path).await.unwrap();
        log.append(&(1..=5).map(|i| row(i, "sales")).collect::<Vec<_>>())
            .await
            .unwrap();

        // Far past the clause threshold; the scan falls back to data_id >=
        // first gap and returns everything from there (the reader filters).
        let gaps: Vec<Gap> = (0..(GAP_CLAUSE_THRESHOLD as i64 + 10))
            .map(|i| open_gap(i * 2 + 2, i * 2 + 2))
            .collect();
        let rows = collect(&log, &ChannelPolicy::for_testing("sales"), &gaps).await;
        let ids: Vec<i64> = rows.iter().map(|r| r.data_id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        log.close().await;
    }

    #[tokio::test]
    async fn test_empty_log_yields_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db").to_string_lossy().to_string();
        let log = SqliteChangeLog::new(&path).await.unwrap();
        let rows = collect(&log, &ChannelPolicy::for_testing("sales"), &[open_gap(0, i64::MAX)]).await;
        assert!(rows.is_empty());
        log.close().await;
    }
}
