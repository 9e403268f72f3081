//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Routing pass outcomes
//! - Change-log read performance
//! - Queue pressure between reader and router
//! - Batch creation stats
//! - Gap tracking
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `routing_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed routing pass for a channel.
pub fn record_pass(channel_id: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("routing_passes_total", "channel_id" => channel_id.to_string(), "status" => status)
        .increment(1);
    histogram!("routing_pass_duration_seconds", "channel_id" => channel_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record rows read off the change log for a channel.
pub fn record_rows_read(channel_id: &str, count: usize) {
    counter!("routing_rows_read_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record rows evaluated by a router.
pub fn record_rows_routed(channel_id: &str, count: usize) {
    counter!("routing_rows_routed_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record rows skipped without evaluation (blank markers).
pub fn record_rows_skipped(channel_id: &str, count: usize) {
    counter!("routing_rows_skipped_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record a row that failed evaluation and was left unrouted.
pub fn record_row_failure(channel_id: &str) {
    counter!("routing_row_failures_total", "channel_id" => channel_id.to_string()).increment(1);
}

/// Record batch copies created (one per destination per row).
pub fn record_copies_created(channel_id: &str, count: usize) {
    counter!("routing_copies_created_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record outgoing batches opened during a pass.
pub fn record_batches_created(channel_id: &str, count: usize) {
    counter!("routing_batches_created_total", "channel_id" => channel_id.to_string())
        .increment(count as u64);
}

/// Record time the consumer spent blocked waiting for the next row.
pub fn record_take_wait(channel_id: &str, duration: Duration) {
    histogram!("routing_take_wait_duration_seconds", "channel_id" => channel_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a stalled queue (consumer timed out waiting for the producer).
pub fn record_queue_stall(channel_id: &str) {
    counter!("routing_queue_stalls_total", "channel_id" => channel_id.to_string()).increment(1);
}

/// Gauge for open gaps on a channel after a pass commits.
pub fn set_open_gaps(channel_id: &str, count: usize) {
    gauge!("routing_open_gaps", "channel_id" => channel_id.to_string()).set(count as f64);
}

/// Record gap store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn gap_store_retries_total(operation: &str) {
    counter!("routing_gap_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record errors by type.
pub fn record_error(channel_id: &str, error_type: &str) {
    counter!("routing_errors_total", "channel_id" => channel_id.to_string(), "error_type" => error_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: The metrics crate uses global state. In tests, we just verify that
    // the functions don't panic and handle edge cases correctly.

    #[test]
    fn test_record_pass() {
        record_pass("sales", true, Duration::from_millis(120));
        record_pass("sales", false, Duration::ZERO);
    }

    #[test]
    fn test_record_row_counters() {
        record_rows_read("sales", 100);
        record_rows_read("sales", 0);
        record_rows_routed("sales", 90);
        record_rows_skipped("sales", 10);
        record_row_failure("sales");
    }

    #[test]
    fn test_record_batch_counters() {
        record_copies_created("sales", 180);
        record_batches_created("sales", 4);
        record_batches_created("", 0);
    }

    #[test]
    fn test_record_queue_metrics() {
        record_take_wait("sales", Duration::from_micros(50));
        record_queue_stall("sales");
    }

    #[test]
    fn test_gap_metrics() {
        set_open_gaps("sales", 3);
        set_open_gaps("sales", 0);
        gap_store_retries_total("commit_pass");
    }

    #[test]
    fn test_record_error() {
        record_error("sales", "topology");
        record_error("sales", "queue_stalled");
    }
}
