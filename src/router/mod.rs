// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router dispatch.
//!
//! Each change row names a `router_id`; [`RouterKind`] resolves that id to one
//! of a closed set of routing strategies and evaluates the row against the
//! candidate destinations. Routers are pure with respect to the pass: they
//! read the row and the directory snapshot, update pass statistics, and return
//! a deterministic, id-ordered set of destination node ids. They never mutate
//! the row or the topology.
//!
//! An empty result is a valid no-op route, not an error.

mod default_router;
mod self_config;

use std::collections::BTreeSet;

use tracing::warn;

use crate::data::ChangeRow;
use crate::error::Result;
use crate::topology::{Node, NodeGroupLink, NodeTopology};

/// Everything a router may read: the node doing the routing, the registration
/// tree, and the configured group links. Immutable for the whole pass.
pub struct RoutingEnv<'a> {
    pub routing_node: &'a Node,
    pub topology: &'a NodeTopology,
    pub links: &'a [NodeGroupLink],
}

/// Per-pass statistics a router may update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStats {
    /// Rows pulled off the stream, blank markers included.
    pub rows_seen: u64,
    /// Rows evaluated by a router.
    pub rows_evaluated: u64,
    /// Blank-marker rows skipped without evaluation.
    pub rows_skipped: u64,
    /// Rows that failed evaluation and were left unrouted.
    pub rows_failed: u64,
    /// Batch copies created (one per destination per row).
    pub copies_created: u64,
    /// Rows that routed to the empty set.
    pub noop_routes: u64,
}

/// Mutable per-pass state handed to routers. Carries statistics only; the
/// directory snapshot lives in [`RoutingEnv`].
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub channel_id: String,
    pub stats: RoutingStats,
    /// Transaction id of the most recently evaluated row.
    pub last_transaction_id: Option<String>,
}

impl RoutingContext {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            ..Default::default()
        }
    }
}

/// The closed set of routing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    /// Group-link routing: a candidate qualifies when a link exists from the
    /// change's source group to the candidate's group.
    Default,
    /// Registration-tree routing for rows that describe nodes themselves.
    SelfConfiguration,
}

impl RouterKind {
    /// Resolve a row's `router_id`. Unknown ids route with the default
    /// strategy rather than wedging the channel on a misconfigured trigger.
    pub fn from_router_id(router_id: &str) -> Self {
        match router_id {
            "" | "default" => RouterKind::Default,
            "self-configuration" => RouterKind::SelfConfiguration,
            other => {
                warn!(router_id = %other, "unknown router id, falling back to default router");
                RouterKind::Default
            }
        }
    }

    /// Evaluate one row against the candidate destinations.
    ///
    /// During an initial load the rows are already targeted at a specific
    /// node and the candidate set reflects that, so routing passes it
    /// through unchanged.
    pub fn route(
        &self,
        env: &RoutingEnv<'_>,
        ctx: &mut RoutingContext,
        row: &ChangeRow,
        candidates: &BTreeSet<String>,
        initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        ctx.stats.rows_evaluated += 1;
        ctx.last_transaction_id = row.transaction_id.clone();

        let mut targets = if initial_load {
            candidates.clone()
        } else {
            match self {
                RouterKind::Default => default_router::route(env, row, candidates),
                RouterKind::SelfConfiguration => self_config::route(env, row, candidates)?,
            }
        };

        // A change never loops back to the node that produced it.
        if let Some(source) = &row.source_node_id {
            targets.remove(source);
        }

        if targets.is_empty() {
            ctx.stats.noop_routes += 1;
        } else {
            ctx.stats.copies_created += targets.len() as u64;
        }
        Ok(targets)
    }
}

/// Whether a link is configured from `source_group` to `target_group`.
/// `WaitForPull` links qualify the same as `PushOnSchedule` ones; the action
/// only governs transport timing.
pub(crate) fn has_link(links: &[NodeGroupLink], source_group: &str, target_group: &str) -> bool {
    links
        .iter()
        .any(|l| l.source_group_id == source_group && l.target_group_id == target_group)
}

/// Groups with a configured link touching `group`, in either direction.
/// These are the groups that care about changes to nodes in `group`.
pub(crate) fn interested_groups(links: &[NodeGroupLink], group: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for link in links {
        if link.target_group_id == group {
            out.insert(link.source_group_id.clone());
        }
        if link.source_group_id == group {
            out.insert(link.target_group_id.clone());
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::LinkAction;

    #[test]
    fn test_from_router_id() {
        assert_eq!(RouterKind::from_router_id("default"), RouterKind::Default);
        assert_eq!(RouterKind::from_router_id(""), RouterKind::Default);
        assert_eq!(
            RouterKind::from_router_id("self-configuration"),
            RouterKind::SelfConfiguration
        );
        // Unknown ids fall back rather than erroring.
        assert_eq!(RouterKind::from_router_id("bsh"), RouterKind::Default);
    }

    #[test]
    fn test_has_link_is_directional() {
        let links = vec![NodeGroupLink::new("store", "corp", LinkAction::PushOnSchedule)];
        assert!(has_link(&links, "store", "corp"));
        assert!(!has_link(&links, "corp", "store"));
    }

    #[test]
    fn test_wait_for_pull_links_qualify() {
        let links = vec![NodeGroupLink::new("corp", "store", LinkAction::WaitForPull)];
        assert!(has_link(&links, "corp", "store"));
    }

    #[test]
    fn test_interested_groups_both_directions() {
        let links = vec![
            NodeGroupLink::new("regsvr", "store", LinkAction::WaitForPull),
            NodeGroupLink::new("store", "regsvr", LinkAction::PushOnSchedule),
            NodeGroupLink::new("store", "warehouse", LinkAction::PushOnSchedule),
        ];
        let interested = interested_groups(&links, "store");
        let expected: BTreeSet<String> = ["regsvr".to_string(), "warehouse".to_string()].into();
        assert_eq!(interested, expected);
        // The group itself is not interested in itself.
        assert!(!interested.contains("store"));
    }
}
