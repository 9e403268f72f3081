// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Group-link routing.
//!
//! The default strategy for application tables: a candidate node receives a
//! copy when a [`NodeGroupLink`](crate::topology::NodeGroupLink) is configured
//! from the change's source group to the candidate's group. The source group
//! is the group of `row.source_node_id` when the change was relayed from
//! another node, otherwise the routing node's own group.

use std::collections::BTreeSet;

use crate::data::ChangeRow;
use crate::router::{has_link, RoutingEnv};

pub(super) fn route(
    env: &RoutingEnv<'_>,
    row: &ChangeRow,
    candidates: &BTreeSet<String>,
) -> BTreeSet<String> {
    let source_group = row
        .source_node_id
        .as_deref()
        .and_then(|id| env.topology.find_node(id))
        .map(|n| n.node_group_id.as_str())
        .unwrap_or(env.routing_node.node_group_id.as_str());

    candidates
        .iter()
        .filter(|candidate_id| {
            env.topology
                .find_node(candidate_id)
                .is_some_and(|n| has_link(env.links, source_group, &n.node_group_id))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_support::table_row;
    use crate::topology::{LinkAction, Node, NodeGroupLink, NodeTopology};

    fn corp_fleet() -> NodeTopology {
        NodeTopology::build(vec![
            Node::for_testing("corp", "corp", None),
            Node::for_testing("s1", "store", Some("corp")),
            Node::for_testing("s2", "store", Some("corp")),
            Node::for_testing("dw", "warehouse", Some("corp")),
        ])
        .unwrap()
    }

    fn all_but(topo: &NodeTopology, exclude: &str) -> BTreeSet<String> {
        topo.node_ids().into_iter().filter(|id| id != exclude).collect()
    }

    #[test]
    fn test_routes_along_configured_links() {
        let topo = corp_fleet();
        let links = vec![
            NodeGroupLink::new("corp", "store", LinkAction::WaitForPull),
            NodeGroupLink::new("corp", "warehouse", LinkAction::PushOnSchedule),
        ];
        let env = RoutingEnv {
            routing_node: topo.find_node("corp").unwrap(),
            topology: &topo,
            links: &links,
        };
        let row = table_row(1, "sales", None);
        let targets = route(&env, &row, &all_but(&topo, "corp"));
        let expected: BTreeSet<String> =
            ["dw".to_string(), "s1".to_string(), "s2".to_string()].into();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_no_link_means_no_targets() {
        let topo = corp_fleet();
        let links = vec![NodeGroupLink::new("store", "corp", LinkAction::PushOnSchedule)];
        let env = RoutingEnv {
            routing_node: topo.find_node("corp").unwrap(),
            topology: &topo,
            links: &links,
        };
        let row = table_row(1, "sales", None);
        // Only a store->corp link exists; corp has nowhere to send.
        assert!(route(&env, &row, &all_but(&topo, "corp")).is_empty());
    }

    #[test]
    fn test_relayed_change_uses_source_node_group() {
        let topo = corp_fleet();
        let links = vec![NodeGroupLink::new("store", "warehouse", LinkAction::PushOnSchedule)];
        let env = RoutingEnv {
            routing_node: topo.find_node("corp").unwrap(),
            topology: &topo,
            links: &links,
        };
        // Change captured at s1 and relayed through corp. The store group,
        // not corp, is the effective source.
        let row = table_row(1, "sales", Some("s1"));
        let targets = route(&env, &row, &all_but(&topo, "corp"));
        let expected: BTreeSet<String> = ["dw".to_string()].into();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_unknown_source_node_falls_back_to_routing_group() {
        let topo = corp_fleet();
        let links = vec![NodeGroupLink::new("corp", "warehouse", LinkAction::PushOnSchedule)];
        let env = RoutingEnv {
            routing_node: topo.find_node("corp").unwrap(),
            topology: &topo,
            links: &links,
        };
        let row = table_row(1, "sales", Some("gone"));
        let targets = route(&env, &row, &all_but(&topo, "corp"));
        let expected: BTreeSet<String> = ["dw".to_string()].into();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_unknown_candidate_is_dropped() {
        let topo = corp_fleet();
        let links = vec![NodeGroupLink::new("corp", "store", LinkAction::PushOnSchedule)];
        let env = RoutingEnv {
            routing_node: topo.find_node("corp").unwrap(),
            topology: &topo,
            links: &links,
        };
        let row = table_row(1, "sales", None);
        let candidates: BTreeSet<String> = ["s1".to_string(), "ghost".to_string()].into();
        let targets = route(&env, &row, &candidates);
        let expected: BTreeSet<String> = ["s1".to_string()].into();
        assert_eq!(targets, expected);
    }
}
