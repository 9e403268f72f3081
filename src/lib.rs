//! # Route Engine
//!
//! Change routing and batch assignment for trigger-based multi-node
//! database synchronization.
//!
//! ## Architecture
//!
//! The route engine decides, for every captured change row, which nodes
//! receive a copy and which outgoing batch carries it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            route-engine                              │
//! │                                                                      │
//! │  ┌────────────┐    ┌─────────────────┐    ┌───────────────────────┐  │
//! │  │ GapTracker │───►│ ChangeLogReader │───►│ RouterKind dispatch   │  │
//! │  │ (SQLite)   │    │ (bounded queue) │    │ (default/self-config) │  │
//! │  └────────────┘    └─────────────────┘    └───────────────────────┘  │
//! │        ▲                                              │              │
//! │        │                                              ▼              │
//! │  ┌─────┴──────────┐                        ┌───────────────────┐     │
//! │  │ commit_pass    │◄───────────────────────│ BatchAssigner     │     │
//! │  │ (gap rewrite)  │                        │ (per node+channel)│     │
//! │  └────────────────┘                        └───────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Routing Strategies
//!
//! 1. **Default**: group-link routing for application tables
//! 2. **Self-configuration**: registration-tree routing for rows that
//!    describe the node directory itself
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use route_engine::{
//!     ChannelPolicy, DirectorySnapshot, RoutingConfig, RoutingPipeline, VecChangeLog,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RoutingConfig::for_testing("corp");
//!     let source = Arc::new(VecChangeLog::new(Vec::new()));
//!     let pipeline = RoutingPipeline::new(config, source)
//!         .await
//!         .expect("Failed to open gap store");
//!
//!     let snapshot = DirectorySnapshot { nodes: Vec::new(), links: Vec::new() };
//!     let policies = vec![ChannelPolicy::for_testing("sales")];
//!     let _results = pipeline.route_channels(&snapshot, &policies).await;
//!     pipeline.shutdown().await;
//! }
//! ```

pub mod batch;
pub mod changelog;
pub mod channels;
pub mod config;
pub mod data;
pub mod error;
pub mod gap;
pub mod metrics;
pub mod pipeline;
pub mod reader;
pub mod router;
pub mod topology;

// Re-exports for convenience
pub use batch::{BatchAssigner, BatchStatus, OutgoingBatch};
pub use changelog::SqliteChangeLog;
pub use channels::ChannelPolicy;
pub use config::{GapStoreConfig, ReaderConfig, RoutingConfig};
pub use data::{ChangeRow, EventType};
pub use error::{Result, RoutingError};
pub use gap::{Gap, GapStatus, GapTracker};
pub use pipeline::{ChannelRouteResult, DirectorySnapshot, RoutingPipeline};
pub use reader::{
    ChangeCursor, ChangeLogReader, ChangeLogSource, RowStream, TakenItem, VecChangeLog,
};
pub use router::{RouterKind, RoutingContext, RoutingEnv, RoutingStats};
pub use topology::{LinkAction, Node, NodeGroupLink, NodeTopology};
