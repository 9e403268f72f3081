//! Configuration for the routing engine.
//!
//! Configuration is passed to [`RoutingPipeline::new()`](crate::RoutingPipeline::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Configuration Structure
//!
//! ```text
//! RoutingConfig
//! ├── node_id: String           # The node this engine routes for
//! ├── reader: ReaderConfig      # Change-log scan and queue settings
//! └── gap_store: GapStoreConfig # SQLite gap persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "00001"
//!
//! reader:
//!   peek_ahead_size: 1000
//!   max_queue_size: 1000
//!   take_timeout: "330s"
//!
//! gap_store:
//!   sqlite_path: "/var/lib/app/routing_gaps.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top-level config object for a routing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// The identity of the node this engine routes for. Used to locate the
    /// routing node in each directory snapshot and excluded from its own
    /// destination sets.
    pub node_id: String,

    /// Change-log scan and queue settings.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Gap persistence settings.
    /// Gaps are stored in SQLite so a crash never skips an id.
    #[serde(default)]
    pub gap_store: GapStoreConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            node_id: "local.dev.node.default".to_string(),
            reader: ReaderConfig::default(),
            gap_store: GapStoreConfig::default(),
        }
    }
}

impl RoutingConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            reader: ReaderConfig::default(),
            gap_store: GapStoreConfig::in_memory(),
        }
    }
}

/// Change-log reader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Rows held in the peek-ahead buffer while grouping transactions.
    #[serde(default = "default_peek_ahead_size")]
    pub peek_ahead_size: usize,

    /// Capacity of the bounded row queue between producer and consumer.
    /// A full queue blocks the producer; that is the backpressure.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long the consumer waits for the next row before declaring the
    /// queue stalled, as a duration string (e.g., "330s").
    #[serde(default = "default_take_timeout")]
    pub take_timeout: String,
}

fn default_peek_ahead_size() -> usize {
    1000
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_take_timeout() -> String {
    "330s".to_string()
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            peek_ahead_size: 1000,
            max_queue_size: 1000,
            take_timeout: "330s".to_string(),
        }
    }
}

impl ReaderConfig {
    /// Parse the take_timeout string to a Duration.
    pub fn take_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.take_timeout).unwrap_or(Duration::from_secs(330))
    }
}

/// Gap persistence configuration.
///
/// Gaps track which change-log id ranges are not yet confirmed routed. We
/// persist them to SQLite so an interrupted pass resumes exactly where it
/// left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapStoreConfig {
    /// Path to SQLite database for gap storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for GapStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "routing_gaps.db".to_string(),
            wal_mode: true,
        }
    }
}

impl GapStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}
