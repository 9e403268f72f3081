// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The routing pass orchestrator.
//!
//! [`RoutingPipeline`] wires the pieces together: it builds the registration
//! tree from a fresh directory snapshot, plans the scan from the gap store,
//! spawns a change-log producer, routes and assigns each row as it arrives,
//! and commits coverage back to the gap store when the stream ends.
//!
//! Error policy splits by blast radius. A row that fails evaluation is
//! logged, skipped, and its id stays inside an OPEN gap for a later pass;
//! the rest of the pass continues. Anything pass-fatal (inconsistent
//! topology, cursor failure, stalled queue) aborts the pass before the gap
//! commit, so committed state is exactly the state of the last good pass.
//!
//! Independent channels route concurrently; rows within one channel are
//! strictly ordered.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchAssigner, OutgoingBatch};
use crate::channels::ChannelPolicy;
use crate::config::RoutingConfig;
use crate::error::{Result, RoutingError};
use crate::gap::GapTracker;
use crate::metrics;
use crate::reader::{ChangeLogReader, ChangeLogSource, RowStream, TakenItem};
use crate::router::{RouterKind, RoutingContext, RoutingEnv, RoutingStats};
use crate::topology::{Node, NodeGroupLink, NodeTopology};

/// A point-in-time read of the node directory. Taken fresh before each pass
/// and never mutated during one.
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    pub nodes: Vec<Node>,
    pub links: Vec<NodeGroupLink>,
}

/// What one channel's routing pass produced.
#[derive(Debug)]
pub struct ChannelRouteResult {
    pub channel_id: String,
    /// Batches in creation order, open and sealed alike.
    pub batches: Vec<OutgoingBatch>,
    pub stats: RoutingStats,
    /// Highest change-log id the scan reached.
    pub last_id_seen: Option<i64>,
}

/// Drives routing passes over a change-log source.
pub struct RoutingPipeline {
    config: RoutingConfig,
    source: Arc<dyn ChangeLogSource>,
    gap_tracker: Arc<GapTracker>,
    reading: watch::Sender<bool>,
}

impl RoutingPipeline {
    /// Open the gap store and assemble a pipeline.
    pub async fn new(config: RoutingConfig, source: Arc<dyn ChangeLogSource>) -> Result<Self> {
        let gap_tracker = Arc::new(GapTracker::new(&config.gap_store).await?);
        let (reading, _) = watch::channel(true);
        info!(node_id = %config.node_id, "Routing pipeline ready");
        Ok(Self {
            config,
            source,
            gap_tracker,
            reading,
        })
    }

    /// The gap store, for diagnostics and scheduling decisions.
    pub fn gap_tracker(&self) -> &GapTracker {
        &self.gap_tracker
    }

    /// Ask running passes to wind down at the next row boundary.
    pub fn stop_reading(&self) {
        let _ = self.reading.send(false);
    }

    /// Stop reading and close the gap store.
    pub async fn shutdown(&self) {
        self.stop_reading();
        self.gap_tracker.close().await;
        info!("Routing pipeline shut down");
    }

    /// Run one routing pass for a single channel.
    pub async fn route_channel(
        &self,
        snapshot: &DirectorySnapshot,
        policy: &ChannelPolicy,
    ) -> Result<ChannelRouteResult> {
        if !*self.reading.borrow() {
            return Err(RoutingError::Shutdown);
        }
        route_one_channel(
            self.config.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.gap_tracker),
            snapshot.clone(),
            policy.clone(),
            self.reading.subscribe(),
        )
        .await
    }

    /// Run one pass per enabled channel, concurrently.
    ///
    /// Channels are independent: one failing pass does not stop the others.
    /// Results come back ordered by channel id.
    pub async fn route_channels(
        &self,
        snapshot: &DirectorySnapshot,
        policies: &[ChannelPolicy],
    ) -> Vec<Result<ChannelRouteResult>> {
        let mut join_set = JoinSet::new();
        for policy in policies {
            if !policy.enabled {
                debug!(channel_id = %policy.channel_id, "Channel disabled, skipping pass");
                continue;
            }
            if !*self.reading.borrow() {
                break;
            }
            join_set.spawn(route_one_channel(
                self.config.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.gap_tracker),
                snapshot.clone(),
                policy.clone(),
                self.reading.subscribe(),
            ));
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => results.push(Err(RoutingError::Internal(format!(
                    "routing task panicked: {}",
                    e
                )))),
            }
        }
        results.sort_by(|a, b| {
            let key = |r: &Result<ChannelRouteResult>| match r {
                Ok(res) => res.channel_id.clone(),
                Err(_) => String::new(),
            };
            key(a).cmp(&key(b))
        });
        results
    }
}

async fn route_one_channel(
    config: RoutingConfig,
    source: Arc<dyn ChangeLogSource>,
    gap_tracker: Arc<GapTracker>,
    snapshot: DirectorySnapshot,
    policy: ChannelPolicy,
    reading: watch::Receiver<bool>,
) -> Result<ChannelRouteResult> {
    let channel_id = policy.channel_id.clone();
    let started = Instant::now();

    let result = run_pass(&config, source, gap_tracker, snapshot, &policy, reading).await;
    match &result {
        Ok(res) => {
            metrics::record_pass(&channel_id, true, started.elapsed());
            info!(
                channel_id = %channel_id,
                rows = res.stats.rows_seen,
                copies = res.stats.copies_created,
                batches = res.batches.len(),
                "Routing pass complete"
            );
        }
        Err(e) => {
            metrics::record_pass(&channel_id, false, started.elapsed());
            metrics::record_error(&channel_id, error_label(e));
            error!(channel_id = %channel_id, error = %e, "Routing pass failed");
        }
    }
    result
}

fn error_label(e: &RoutingError) -> &'static str {
    match e {
        RoutingError::Topology(_) => "topology",
        RoutingError::RouterDecision { .. } => "router_decision",
        RoutingError::ChangeLog { .. } => "change_log",
        RoutingError::QueueStalled { .. } => "queue_stalled",
        RoutingError::GapStore(_) => "gap_store",
        RoutingError::Config(_) => "config",
        RoutingError::Shutdown => "shutdown",
        RoutingError::Internal(_) => "internal",
    }
}

async fn run_pass(
    config: &RoutingConfig,
    source: Arc<dyn ChangeLogSource>,
    gap_tracker: Arc<GapTracker>,
    snapshot: DirectorySnapshot,
    policy: &ChannelPolicy,
    reading: watch::Receiver<bool>,
) -> Result<ChannelRouteResult> {
    let topology = NodeTopology::build(snapshot.nodes)?;
    let routing_node = topology.find_node(&config.node_id).ok_or_else(|| {
        RoutingError::Topology(format!(
            "routing node '{}' not in directory snapshot",
            config.node_id
        ))
    })?;
    // The routing node never receives its own copies; disabled nodes are out
    // until they re-enable.
    let candidates: BTreeSet<String> = topology
        .node_ids()
        .into_iter()
        .filter(|id| id != &config.node_id)
        .filter(|id| topology.find_node(id).is_some_and(|n| n.sync_enabled))
        .collect();

    let gaps = gap_tracker.gap_plan(&policy.channel_id).await?;
    let mut stream = ChangeLogReader::new(source, config.reader.clone()).spawn(
        policy.clone(),
        gaps,
        reading.clone(),
    );

    let env = RoutingEnv {
        routing_node,
        topology: &topology,
        links: &snapshot.links,
    };
    let mut ctx = RoutingContext::new(&policy.channel_id);
    let mut assigner = BatchAssigner::new();
    let mut routed_ids: BTreeSet<i64> = BTreeSet::new();
    let mut last_id_seen: Option<i64> = None;

    let outcome = consume(
        &mut stream,
        &reading,
        &env,
        &candidates,
        &mut ctx,
        &mut assigner,
        policy,
        &mut routed_ids,
        &mut last_id_seen,
    )
    .await;

    metrics::record_rows_read(&policy.channel_id, ctx.stats.rows_seen as usize);
    metrics::record_rows_routed(&policy.channel_id, ctx.stats.rows_evaluated as usize);
    metrics::record_rows_skipped(&policy.channel_id, ctx.stats.rows_skipped as usize);
    metrics::record_copies_created(&policy.channel_id, ctx.stats.copies_created as usize);

    // A pass-fatal error leaves the gap store exactly as the last committed
    // pass left it.
    outcome?;

    gap_tracker
        .commit_pass(&policy.channel_id, last_id_seen, &routed_ids)
        .await?;
    let open_after = gap_tracker.gap_plan(&policy.channel_id).await?.len();
    metrics::set_open_gaps(&policy.channel_id, open_after);

    let batches = assigner.into_batches();
    metrics::record_batches_created(&policy.channel_id, batches.len());

    Ok(ChannelRouteResult {
        channel_id: policy.channel_id.clone(),
        batches,
        stats: ctx.stats,
        last_id_seen,
    })
}

#[allow(clippy::too_many_arguments)]
async fn consume(
    stream: &mut RowStream,
    reading: &watch::Receiver<bool>,
    env: &RoutingEnv<'_>,
    candidates: &BTreeSet<String>,
    ctx: &mut RoutingContext,
    assigner: &mut BatchAssigner,
    policy: &ChannelPolicy,
    routed_ids: &mut BTreeSet<i64>,
    last_id_seen: &mut Option<i64>,
) -> Result<()> {
    loop {
        // Checked between rows, like the producer. Rows already queued when
        // the stop signal lands are not routed; their ids stay open for the
        // next pass.
        if !*reading.borrow() {
            return Err(RoutingError::Shutdown);
        }
        match stream.take().await? {
            TakenItem::Row(row) => {
                ctx.stats.rows_seen += 1;
                *last_id_seen = Some(last_id_seen.unwrap_or(i64::MIN).max(row.data_id));

                let kind = RouterKind::from_router_id(&row.router_id);
                match kind.route(env, ctx, &row, candidates, false) {
                    Ok(targets) => {
                        if !targets.is_empty() {
                            assigner.assign(&row, &targets, policy);
                        }
                        routed_ids.insert(row.data_id);
                    }
                    Err(e) if !e.is_pass_fatal() => {
                        // Row-scoped: skip it, leave its id unconfirmed so a
                        // later pass retries it.
                        ctx.stats.rows_failed += 1;
                        metrics::record_row_failure(&ctx.channel_id);
                        warn!(
                            channel_id = %ctx.channel_id,
                            data_id = row.data_id,
                            error = %e,
                            "Row failed routing, leaving its gap open"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            TakenItem::Skipped(data_id) => {
                ctx.stats.rows_seen += 1;
                ctx.stats.rows_skipped += 1;
                *last_id_seen = Some(last_id_seen.unwrap_or(i64::MIN).max(data_id));
                // Already routed by an earlier pass; confirm coverage.
                routed_ids.insert(data_id);
            }
            TakenItem::EndOfData => return Ok(()),
        }
    }
}
