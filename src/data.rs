// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Captured change rows.
//!
//! A [`ChangeRow`] is one row-level mutation captured by a database trigger
//! into the change log. Rows are immutable once read: the reader owns them
//! for the duration of one routing pass and hands references to the routers.
//!
//! Column payloads (`pk_data`, `row_data`, `old_data`) are comma-separated
//! text exactly as the capture triggers wrote them. A payload may be empty
//! when the channel's policy disables fetching it — that is a query-shaping
//! optimization, not data loss, since disabled columns are never needed by
//! any router on that channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of mutation a change row captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    /// Parse the single-letter code stored in the change log.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_uppercase().as_str() {
            "I" | "INSERT" => Some(EventType::Insert),
            "U" | "UPDATE" => Some(EventType::Update),
            "D" | "DELETE" => Some(EventType::Delete),
            _ => None,
        }
    }

    /// The single-letter code stored in the change log.
    pub fn code(&self) -> &'static str {
        match self {
            EventType::Insert => "I",
            EventType::Update => "U",
            EventType::Delete => "D",
        }
    }
}

/// One captured mutation from the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// Monotonically increasing change-log id.
    pub data_id: i64,
    /// Source table the trigger fired on.
    pub table_name: String,
    /// Mutation kind.
    pub event_type: EventType,
    /// Primary key column values, comma-separated.
    pub pk_data: String,
    /// New row values, comma-separated (empty if the policy excludes them).
    pub row_data: String,
    /// Old row values, comma-separated (empty if the policy excludes them).
    pub old_data: String,
    /// Channel this row belongs to.
    pub channel_id: String,
    /// Groups rows that must not be split across batches.
    pub transaction_id: Option<String>,
    /// Node the change originated from, when it was relayed (not locally captured).
    pub source_node_id: Option<String>,
    /// Selects which router variant evaluates this row.
    pub router_id: String,
    /// When the trigger captured the row.
    pub create_time: DateTime<Utc>,
    /// Blank marker: set when the row was already accounted for by a prior
    /// transaction-spanning read. Skipped from routing, still counted.
    pub already_routed: bool,
}

impl ChangeRow {
    /// Split the primary key payload into its column values.
    pub fn pk_columns(&self) -> Vec<&str> {
        if self.pk_data.is_empty() {
            Vec::new()
        } else {
            self.pk_data.split(',').collect()
        }
    }

    /// First primary key column, if any.
    ///
    /// For rows that mutate node registration data this is the id of the
    /// node the row is about.
    pub fn first_pk(&self) -> Option<&str> {
        self.pk_columns().first().copied().filter(|s| !s.is_empty())
    }

    /// Approximate payload size, used for batch byte accounting.
    pub fn byte_size(&self) -> usize {
        self.pk_data.len() + self.row_data.len() + self.old_data.len()
    }
}
