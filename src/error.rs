// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the routing engine.
//!
//! Errors are categorized by their blast radius: row-level errors are
//! recovered locally (the row is skipped and its gap stays open), pass-level
//! errors abort the whole routing pass for a channel, leaving committed
//! gap/batch state untouched.
//!
//! # Error Categories
//!
//! | Error Type | Scope | Retryable | Description |
//! |------------|-------|-----------|-------------|
//! | `Topology` | Pass | No | Inconsistent node directory (missing parent, cycle, unreachable node) |
//! | `RouterDecision` | Row | No | A single row could not be evaluated (malformed key data) |
//! | `ChangeLog` | Pass | Yes | Change-log cursor failure mid-scan |
//! | `QueueStalled` | Pass | Yes | Consumer waited past the take timeout with no sentinel |
//! | `GapStore` | Pass | No | Local SQLite errors (needs operator attention) |
//! | `Config` | Startup | No | Configuration invalid |
//! | `Shutdown` | Pass | No | Engine is shutting down |
//! | `Internal` | - | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`RoutingError::is_retryable()`] to decide whether the next scheduled
//! pass should simply re-run (transient conditions) or whether the failure
//! needs attention first (bad directory data, local database trouble). Either
//! way the gap table guarantees no id is silently skipped: anything not
//! confirmed routed stays in an OPEN gap.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors that can occur while routing change rows into batches.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Inconsistent parent/child data in the node directory.
    ///
    /// Fatal to the current pass. A node that cannot be placed in the tree
    /// must never be silently treated as "routed nowhere" — that would drop
    /// data. The pass aborts and the affected gaps remain OPEN until the
    /// directory is fixed.
    #[error("Topology error: {0}")]
    Topology(String),

    /// A single change row could not be evaluated.
    ///
    /// Non-fatal: the row is skipped (no batch entries created) and its gap
    /// entry is left OPEN so a corrected future pass can retry it.
    #[error("Router decision failed for data_id {data_id}: {message}")]
    RouterDecision { data_id: i64, message: String },

    /// Change-log cursor failure during a scan.
    ///
    /// The producer stops, posts the end-of-stream sentinel, and the pass is
    /// aborted. Retryable: the next pass resumes from the last OK gap
    /// boundary, and routing decisions for already-OK ids are not redone.
    #[error("Change log error ({operation}): {message}")]
    ChangeLog { operation: String, message: String },

    /// Consumer wait exceeded the take timeout with no sentinel received.
    ///
    /// An operational/transient condition, not a data error. The pass is
    /// aborted and retried on the next schedule — never silently hung.
    #[error("Routing queue for channel '{channel_id}' stalled after {waited:?}")]
    QueueStalled { channel_id: String, waited: Duration },

    /// SQLite error in the gap store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Gap store error: {0}")]
    GapStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    ///
    /// Returned when a pass is attempted or interrupted during shutdown.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoutingError {
    /// Create a change-log error with operation context.
    pub fn change_log(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChangeLog {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if the next scheduled pass should retry without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ChangeLog { .. } => true,
            Self::QueueStalled { .. } => true,
            Self::Topology(_) => false, // Directory needs fixing first
            Self::RouterDecision { .. } => false,
            Self::GapStore(_) => false, // Local DB issues need attention
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error aborts the whole pass (as opposed to one row).
    pub fn is_pass_fatal(&self) -> bool {
        !matches!(self, Self::RouterDecision { .. })
    }
}
