// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Streaming change-log reader.
//!
//! A routing pass never loads a channel's backlog into memory. Instead a
//! producer task pulls rows from a [`ChangeLogSource`] cursor through a small
//! peek-ahead buffer and pushes them onto a bounded queue; the routing loop
//! consumes from the other end. A full queue blocks the producer, so memory
//! stays bounded no matter how far behind the channel is.
//!
//! The producer always delivers exactly one end-of-data marker, on success,
//! on error, and on cancellation alike, so the consumer can always tell
//! "stream finished" from "stream stalled". The consumer's [`RowStream::take`]
//! bounds its wait and surfaces a stalled producer as
//! [`RoutingError::QueueStalled`] instead of hanging the pass.
//!
//! Cancellation is cooperative: a `watch` flag is checked between rows, never
//! mid-row.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::channels::ChannelPolicy;
use crate::config::ReaderConfig;
use crate::data::ChangeRow;
use crate::error::{Result, RoutingError};
use crate::gap::Gap;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A cursor over one channel's change rows, ascending by `data_id`.
pub trait ChangeCursor: Send {
    /// The next row, or `None` when the scan is exhausted.
    fn next(&mut self) -> BoxFuture<'_, Option<ChangeRow>>;
}

/// A source of change rows (the trigger-populated change log).
///
/// The engine treats the log as read-only. Implementations shape the scan to
/// the channel policy (which payload columns to fetch) and to the gap plan
/// (which id ranges are worth scanning).
pub trait ChangeLogSource: Send + Sync + 'static {
    fn open_cursor(
        &self,
        policy: &ChannelPolicy,
        gaps: &[Gap],
    ) -> BoxFuture<'_, Box<dyn ChangeCursor>>;
}

/// In-memory change log for tests and standalone use.
///
/// Rows are held sorted by `data_id`; cursors filter by channel, start from
/// the first open gap, and apply the policy's column shaping the same way the
/// SQL-backed source does.
#[derive(Clone, Default)]
pub struct VecChangeLog {
    rows: Arc<Vec<ChangeRow>>,
    /// Fail the cursor after this many rows have been served. For tests.
    fail_after: Option<usize>,
}

impl VecChangeLog {
    pub fn new(mut rows: Vec<ChangeRow>) -> Self {
        rows.sort_by_key(|r| r.data_id);
        Self {
            rows: Arc::new(rows),
            fail_after: None,
        }
    }

    /// A log whose cursors error out mid-scan. For failure-path tests.
    pub fn with_error_after(mut self, served: usize) -> Self {
        self.fail_after = Some(served);
        self
    }
}

impl ChangeLogSource for VecChangeLog {
    fn open_cursor(
        &self,
        policy: &ChannelPolicy,
        gaps: &[Gap],
    ) -> BoxFuture<'_, Box<dyn ChangeCursor>> {
        let start_id = gaps.first().map(|g| g.start_id).unwrap_or(0);
        let rows: Vec<ChangeRow> = self
            .rows
            .iter()
            .filter(|r| r.channel_id == policy.channel_id && r.data_id >= start_id)
            .map(|r| {
                let mut row = r.clone();
                if !policy.use_pk_data {
                    row.pk_data.clear();
                }
                if !policy.use_row_data {
                    row.row_data.clear();
                }
                if !policy.use_old_data {
                    row.old_data.clear();
                }
                row
            })
            .collect();
        let fail_after = self.fail_after;
        Box::pin(async move {
            Ok(Box::new(VecCursor {
                rows: rows.into(),
                served: 0,
                fail_after,
            }) as Box<dyn ChangeCursor>)
        })
    }
}

struct VecCursor {
    rows: VecDeque<ChangeRow>,
    served: usize,
    fail_after: Option<usize>,
}

impl ChangeCursor for VecCursor {
    fn next(&mut self) -> BoxFuture<'_, Option<ChangeRow>> {
        Box::pin(async move {
            if let Some(limit) = self.fail_after {
                if self.served >= limit {
                    return Err(RoutingError::change_log("scan", "injected cursor failure"));
                }
            }
            self.served += 1;
            Ok(self.rows.pop_front())
        })
    }
}

/// What the consumer pulls off the queue.
#[derive(Debug)]
pub enum TakenItem {
    /// A change row to route.
    Row(ChangeRow),
    /// A blank-marker row's id: already accounted for, skip routing but
    /// confirm the id as covered.
    Skipped(i64),
    /// The producer finished cleanly (or was cancelled). Always the last item.
    EndOfData,
}

enum QueueItem {
    Row(Box<ChangeRow>),
    Skipped(i64),
    EndOfData(Option<RoutingError>),
}

/// Spawns producer tasks that stream one channel's rows through a bounded
/// queue.
pub struct ChangeLogReader {
    source: Arc<dyn ChangeLogSource>,
    config: ReaderConfig,
}

impl ChangeLogReader {
    pub fn new(source: Arc<dyn ChangeLogSource>, config: ReaderConfig) -> Self {
        Self { source, config }
    }

    /// Start a producer for `policy`'s channel over the given gap plan.
    ///
    /// The producer runs until the scan is exhausted, the per-pass row budget
    /// is spent (transaction grouping may stretch it), an error occurs, or
    /// `reading` flips to `false`. In every case it posts one end-of-data
    /// marker before exiting.
    pub fn spawn(
        &self,
        policy: ChannelPolicy,
        gaps: Vec<Gap>,
        reading: watch::Receiver<bool>,
    ) -> RowStream {
        let (tx, rx) = mpsc::channel(self.config.max_queue_size.max(1));
        let source = Arc::clone(&self.source);
        let peek_ahead_size = self.config.peek_ahead_size.max(1);
        let channel_id = policy.channel_id.clone();
        let take_timeout = self.config.take_timeout_duration();

        let task_channel_id = channel_id.clone();
        tokio::spawn(async move {
            let result = produce(source, policy, gaps, peek_ahead_size, reading, &tx).await;
            if let Err(e) = &result {
                warn!(channel_id = %task_channel_id, error = %e, "Change-log producer failed");
            }
            // The marker must go out even when the scan failed; the consumer
            // is blocked on the queue, not on the task handle.
            let _ = tx.send(QueueItem::EndOfData(result.err())).await;
        });

        RowStream {
            rx,
            channel_id,
            take_timeout,
        }
    }
}

async fn produce(
    source: Arc<dyn ChangeLogSource>,
    policy: ChannelPolicy,
    gaps: Vec<Gap>,
    peek_ahead_size: usize,
    mut reading: watch::Receiver<bool>,
    tx: &mpsc::Sender<QueueItem>,
) -> Result<()> {
    let mut cursor = source.open_cursor(&policy, &gaps).await?;
    let mut peek_ahead: VecDeque<ChangeRow> = VecDeque::with_capacity(peek_ahead_size);
    let mut exhausted = false;
    let mut sent = 0usize;
    let mut in_flight_txn: Option<String> = None;

    loop {
        if !*reading.borrow() {
            debug!(channel_id = %policy.channel_id, "Producer cancelled between rows");
            return Ok(());
        }

        while !exhausted && peek_ahead.len() < peek_ahead_size {
            match cursor.next().await? {
                Some(row) => peek_ahead.push_back(row),
                None => exhausted = true,
            }
        }

        let Some(row) = peek_ahead.pop_front() else {
            return Ok(()); // scan exhausted
        };

        // Budget check. Once max_data_to_route rows have gone out, only rows
        // of the transaction in flight at the boundary may follow; a batch
        // never splits a transaction at the budget edge.
        if sent >= policy.max_data_to_route {
            let same_txn = match (&in_flight_txn, &row.transaction_id) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            if !same_txn {
                debug!(
                    channel_id = %policy.channel_id,
                    sent,
                    "Row budget reached, ending scan for this pass"
                );
                return Ok(());
            }
        }

        if !id_in_gaps(&gaps, row.data_id) {
            continue; // already covered by a committed pass
        }

        in_flight_txn = row.transaction_id.clone();
        sent += 1;

        let item = if row.already_routed {
            QueueItem::Skipped(row.data_id)
        } else {
            QueueItem::Row(Box::new(row))
        };

        tokio::select! {
            res = tx.send(item) => {
                if res.is_err() {
                    return Ok(()); // consumer went away, nothing left to do
                }
            }
            _ = wait_for_stop(&mut reading) => {
                debug!(channel_id = %policy.channel_id, "Producer cancelled while queue full");
                return Ok(());
            }
        }
    }
}

async fn wait_for_stop(reading: &mut watch::Receiver<bool>) {
    loop {
        if !*reading.borrow() {
            return;
        }
        if reading.changed().await.is_err() {
            return; // sender dropped, treat as stop
        }
    }
}

/// `gaps` is ordered by `start_id` and non-overlapping.
fn id_in_gaps(gaps: &[Gap], data_id: i64) -> bool {
    match gaps.binary_search_by(|g| g.start_id.cmp(&data_id)) {
        Ok(_) => true,
        Err(0) => false,
        Err(idx) => gaps[idx - 1].contains(data_id),
    }
}

/// Consumer handle for one channel's row stream.
pub struct RowStream {
    rx: mpsc::Receiver<QueueItem>,
    channel_id: String,
    take_timeout: Duration,
}

impl RowStream {
    /// Pull the next item, waiting at most the configured take timeout.
    ///
    /// After [`TakenItem::EndOfData`] or an error the stream is spent;
    /// further calls return an error.
    pub async fn take(&mut self) -> Result<TakenItem> {
        let started = std::time::Instant::now();
        match tokio::time::timeout(self.take_timeout, self.rx.recv()).await {
            Err(_) => {
                crate::metrics::record_queue_stall(&self.channel_id);
                Err(RoutingError::QueueStalled {
                    channel_id: self.channel_id.clone(),
                    waited: self.take_timeout,
                })
            }
            Ok(None) => Err(RoutingError::Internal(format!(
                "producer for channel '{}' dropped without end-of-data",
                self.channel_id
            ))),
            Ok(Some(item)) => {
                crate::metrics::record_take_wait(&self.channel_id, started.elapsed());
                match item {
                    QueueItem::Row(row) => Ok(TakenItem::Row(*row)),
                    QueueItem::Skipped(data_id) => Ok(TakenItem::Skipped(data_id)),
                    QueueItem::EndOfData(None) => {
                        self.rx.close();
                        Ok(TakenItem::EndOfData)
                    }
                    QueueItem::EndOfData(Some(e)) => {
                        self.rx.close();
                        Err(e)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::GapStatus;
    use chrono::Utc;

    fn row(data_id: i64, channel_id: &str) -> ChangeRow {
        ChangeRow {
            data_id,
            table_name: "customer".to_string(),
            event_type: crate::data::EventType::Insert,
            pk_data: format!("{}", data_id),
            row_data: "v".to_string(),
            old_data: "o".to_string(),
            channel_id: channel_id.to_string(),
            transaction_id: None,
            source_node_id: None,
            router_id: "default".to_string(),
            create_time: Utc::now(),
            already_routed: false,
        }
    }

    fn whole_log() -> Vec<Gap> {
        vec![Gap {
            channel_id: "sales".to_string(),
            start_id: 0,
            end_id: i64::MAX,
            status: GapStatus::Open,
            updated_at: 0,
        }]
    }

    fn reader(source: VecChangeLog) -> ChangeLogReader {
        ChangeLogReader::new(Arc::new(source), ReaderConfig::default())
    }

    async fn drain(stream: &mut RowStream) -> Vec<i64> {
        let mut ids = Vec::new();
        loop {
            match stream.take().await.unwrap() {
                TakenItem::Row(r) => ids.push(r.data_id),
                TakenItem::Skipped(id) => ids.push(-id),
                TakenItem::EndOfData => return ids,
            }
        }
    }

    #[tokio::test]
    async fn test_rows_stream_in_order_with_end_marker() {
        let source = VecChangeLog::new(vec![row(3, "sales"), row(1, "sales"), row(2, "sales")]);
        let (_keep, reading) = watch::channel(true);
        let mut stream =
            reader(source).spawn(ChannelPolicy::for_testing("sales"), whole_log(), reading);
        assert_eq!(drain(&mut stream).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_other_channels_are_invisible() {
        let source = VecChangeLog::new(vec![row(1, "sales"), row(2, "config"), row(3, "sales")]);
        let (_keep, reading) = watch::channel(true);
        let mut stream =
            reader(source).spawn(ChannelPolicy::for_testing("sales"), whole_log(), reading);
        assert_eq!(drain(&mut stream).await, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_rows_outside_gap_plan_are_filtered() {
        let source = VecChangeLog::new((1..=10).map(|i| row(i, "sales")).collect());
        let gaps = vec![
            Gap {
                channel_id: "sales".to_string(),
                start_id: 2,
                end_id: 3,
                status: GapStatus::Open,
                updated_at: 0,
            },
            Gap {
                channel_id: "sales".to_string(),
                start_id: 7,
                end_id: i64::MAX,
                status: GapStatus::Open,
                updated_at: 0,
            },
        ];
        let (_keep, reading) = watch::channel(true);
        let mut stream = reader(source).spawn(ChannelPolicy::for_testing("sales"), gaps, reading);
        assert_eq!(drain(&mut stream).await, vec![2, 3, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_blank_markers_are_skipped_but_reported() {
        let mut marked = row(2, "sales");
        marked.already_routed = true;
        let source = VecChangeLog::new(vec![row(1, "sales"), marked, row(3, "sales")]);
        let (_keep, reading) = watch::channel(true);
        let mut stream =
            reader(source).spawn(ChannelPolicy::for_testing("sales"), whole_log(), reading);
        // Negative ids in drain() mark Skipped items.
        assert_eq!(drain(&mut stream).await, vec![1, -2, 3]);
    }

    #[tokio::test]
    async fn test_row_budget_bounds_the_pass() {
        let source = VecChangeLog::new((1..=20).map(|i| row(i, "sales")).collect());
        let mut policy = ChannelPolicy::for_testing("sales");
        policy.max_data_to_route = 5;
        let (_keep, reading) = watch::channel(true);
        let mut stream = reader(source).spawn(policy, whole_log(), reading);
        assert_eq!(drain(&mut stream).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_transaction_rows_stay_together_past_budget() {
        let mut rows: Vec<ChangeRow> = (1..=3).map(|i| row(i, "sales")).collect();
        // Rows 4..=6 share a transaction straddling the budget edge.
        for i in 4..=6 {
            let mut r = row(i, "sales");
            r.transaction_id = Some("tx-big".to_string());
            rows.push(r);
        }
        rows.push(row(7, "sales"));

        let mut policy = ChannelPolicy::for_testing("sales");
        policy.max_data_to_route = 4;
        let (_keep, reading) = watch::channel(true);
        let mut stream = reader(VecChangeLog::new(rows)).spawn(policy, whole_log(), reading);
        // 5 and 6 ride along with tx-big; 7 does not.
        assert_eq!(drain(&mut stream).await, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_cursor_error_ends_stream_with_error() {
        let source =
            VecChangeLog::new(vec![row(1, "sales"), row(2, "sales"), row(3, "sales")])
                .with_error_after(2);
        let (_keep, reading) = watch::channel(true);
        let mut stream =
            reader(source).spawn(ChannelPolicy::for_testing("sales"), whole_log(), reading);

        // Rows buffered before the failure may or may not be delivered; the
        // stream must end with the error either way.
        let err = loop {
            match stream.take().await {
                Ok(TakenItem::Row(_)) | Ok(TakenItem::Skipped(_)) => continue,
                Ok(TakenItem::EndOfData) => panic!("expected an error, got clean end"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, RoutingError::ChangeLog { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancellation_ends_stream_promptly() {
        let source = VecChangeLog::new((1..=1000).map(|i| row(i, "sales")).collect());
        let config = ReaderConfig {
            max_queue_size: 2, // force the producer to block on the queue
            ..Default::default()
        };
        let reader = ChangeLogReader::new(Arc::new(source), config);
        let (stop, reading) = watch::channel(true);
        let mut stream =
            reader.spawn(ChannelPolicy::for_testing("sales"), whole_log(), reading);

        // Consume a couple of rows, then cancel.
        assert!(matches!(stream.take().await.unwrap(), TakenItem::Row(_)));
        assert!(matches!(stream.take().await.unwrap(), TakenItem::Row(_)));
        stop.send(false).unwrap();

        // The stream must end with the marker, not hang. A few queued rows
        // may still arrive first.
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match stream.take().await.unwrap() {
                    TakenItem::EndOfData => break,
                    _ => continue,
                }
            }
        })
        .await;
        assert!(result.is_ok(), "cancelled stream did not terminate");
    }

    #[tokio::test]
    async fn test_stalled_queue_times_out() {
        /// A source whose cursor never yields.
        struct StuckSource;
        struct StuckCursor;
        impl ChangeCursor for StuckCursor {
            fn next(&mut self) -> BoxFuture<'_, Option<ChangeRow>> {
                Box::pin(std::future::pending())
            }
        }
        impl ChangeLogSource for StuckSource {
            fn open_cursor(
                &self,
                _policy: &ChannelPolicy,
                _gaps: &[Gap],
            ) -> BoxFuture<'_, Box<dyn ChangeCursor>> {
                Box::pin(async { Ok(Box::new(StuckCursor) as Box<dyn ChangeCursor>) })
            }
        }

        let config = ReaderConfig {
            take_timeout: "50ms".to_string(),
            ..Default::default()
        };
        let reader = ChangeLogReader::new(Arc::new(StuckSource), config);
        let (_keep, reading) = watch::channel(true);
        let mut stream =
            reader.spawn(ChannelPolicy::for_testing("sales"), whole_log(), reading);

        let err = stream.take().await.unwrap_err();
        assert!(matches!(err, RoutingError::QueueStalled { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_policy_column_shaping() {
        let mut policy = ChannelPolicy::for_testing("sales");
        policy.use_old_data = false;
        policy.use_row_data = false;
        let source = VecChangeLog::new(vec![row(1, "sales")]);
        let (_keep, reading) = watch::channel(true);
        let mut stream = reader(source).spawn(policy, whole_log(), reading);
        match stream.take().await.unwrap() {
            TakenItem::Row(r) => {
                assert!(r.old_data.is_empty());
                assert!(r.row_data.is_empty());
                assert_eq!(r.pk_data, "1");
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_id_in_gaps() {
        let gaps = vec![
            Gap {
                channel_id: "c".to_string(),
                start_id: 2,
                end_id: 4,
                status: GapStatus::Open,
                updated_at: 0,
            },
            Gap {
                channel_id: "c".to_string(),
                start_id: 10,
                end_id: i64::MAX,
                status: GapStatus::Open,
                updated_at: 0,
            },
        ];
        assert!(!id_in_gaps(&gaps, 1));
        assert!(id_in_gaps(&gaps, 2));
        assert!(id_in_gaps(&gaps, 4));
        assert!(!id_in_gaps(&gaps, 5));
        assert!(id_in_gaps(&gaps, 10));
        assert!(id_in_gaps(&gaps, i64::MAX));
        assert!(!id_in_gaps(&[], 1));
    }
}
