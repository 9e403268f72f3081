// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use std::collections::BTreeSet;

use chrono::Utc;
use proptest::prelude::*;

use route_engine::{
    BatchAssigner, ChangeRow, ChannelPolicy, EventType, Node, NodeTopology,
};

// =============================================================================
// Registration Tree Properties
// =============================================================================

/// A random tree: node `i > 0` gets a parent chosen among nodes `0..i`, so
/// the result is always a single rooted tree with no cycles.
fn arb_tree() -> impl Strategy<Value = Vec<Node>> {
    (1usize..16).prop_flat_map(|n| {
        let parents: Vec<BoxedStrategy<usize>> =
            (1..n).map(|i| (0..i).boxed()).collect();
        parents.prop_map(move |parents| {
            let mut nodes = vec![Node::for_testing("n0", "g0", None)];
            for (i, p) in parents.iter().enumerate() {
                let id = format!("n{}", i + 1);
                let group = format!("g{}", (i + 1) % 3);
                nodes.push(Node::for_testing(&id, &group, Some(&format!("n{}", p))));
            }
            nodes
        })
    })
}

proptest! {
    /// Any parent-before-child node list builds a valid tree.
    #[test]
    fn tree_always_builds(nodes in arb_tree()) {
        let topo = NodeTopology::build(nodes.clone());
        prop_assert!(topo.is_ok());
    }

    /// The root is an ancestor of every other node.
    #[test]
    fn root_reaches_every_node(nodes in arb_tree()) {
        let topo = NodeTopology::build(nodes.clone()).unwrap();
        for node in &nodes[1..] {
            prop_assert!(topo.is_ancestor_of("n0", &node.node_id));
        }
    }

    /// No node is its own ancestor.
    #[test]
    fn ancestry_is_irreflexive(nodes in arb_tree()) {
        let topo = NodeTopology::build(nodes.clone()).unwrap();
        for node in &nodes {
            prop_assert!(!topo.is_ancestor_of(&node.node_id, &node.node_id));
        }
    }

    /// Ancestry is antisymmetric: if a is above b, b is never above a.
    #[test]
    fn ancestry_is_antisymmetric(nodes in arb_tree()) {
        let topo = NodeTopology::build(nodes.clone()).unwrap();
        for a in &nodes {
            for b in &nodes {
                if topo.is_ancestor_of(&a.node_id, &b.node_id) {
                    prop_assert!(!topo.is_ancestor_of(&b.node_id, &a.node_id));
                }
            }
        }
    }

    /// Every node sits one level below its parent.
    #[test]
    fn depth_increases_by_one_per_level(nodes in arb_tree()) {
        let topo = NodeTopology::build(nodes.clone()).unwrap();
        for node in &nodes[1..] {
            let parent = topo.parent_of(&node.node_id).unwrap();
            let parent_depth = topo.distance_from_root(&parent.node_id).unwrap();
            let depth = topo.distance_from_root(&node.node_id).unwrap();
            prop_assert_eq!(depth, parent_depth + 1);
        }
    }

    /// children_of and parent_of agree with each other.
    #[test]
    fn children_and_parents_agree(nodes in arb_tree()) {
        let topo = NodeTopology::build(nodes.clone()).unwrap();
        for node in &nodes {
            for child in topo.children_of(&node.node_id) {
                let back = topo.parent_of(&child.node_id).unwrap();
                prop_assert_eq!(&back.node_id, &node.node_id);
            }
        }
    }
}

// =============================================================================
// Batch Assignment Properties
// =============================================================================

fn row(data_id: i64) -> ChangeRow {
    ChangeRow {
        data_id,
        table_name: "t".to_string(),
        event_type: EventType::Insert,
        pk_data: format!("{}", data_id),
        row_data: "x".to_string(),
        old_data: String::new(),
        channel_id: "ch".to_string(),
        transaction_id: None,
        source_node_id: None,
        router_id: "default".to_string(),
        create_time: Utc::now(),
        already_routed: false,
    }
}

/// For each row, the subset of three destinations that should receive it.
fn arb_assignments() -> impl Strategy<Value = Vec<(bool, bool, bool)>> {
    prop::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 0..40)
}

fn targets(mask: (bool, bool, bool)) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if mask.0 {
        out.insert("a".to_string());
    }
    if mask.1 {
        out.insert("b".to_string());
    }
    if mask.2 {
        out.insert("c".to_string());
    }
    out
}

proptest! {
    /// No batch ever exceeds the channel's size limit.
    #[test]
    fn batches_respect_the_size_limit(
        assignments in arb_assignments(),
        max_batch_size in 1usize..6,
    ) {
        let policy = ChannelPolicy {
            max_batch_size,
            ..ChannelPolicy::for_testing("ch")
        };
        let mut assigner = BatchAssigner::new();
        for (i, mask) in assignments.iter().enumerate() {
            assigner.assign(&row(i as i64 + 1), &targets(*mask), &policy);
        }
        for batch in assigner.batches() {
            prop_assert!(batch.data_row_count() <= max_batch_size);
        }
    }

    /// Every copy lands in exactly one batch for its destination, in change
    /// id order, and no destination gets a copy it was not assigned.
    #[test]
    fn every_copy_lands_exactly_once_in_order(assignments in arb_assignments()) {
        let policy = ChannelPolicy {
            max_batch_size: 3,
            ..ChannelPolicy::for_testing("ch")
        };
        let mut assigner = BatchAssigner::new();
        for (i, mask) in assignments.iter().enumerate() {
            assigner.assign(&row(i as i64 + 1), &targets(*mask), &policy);
        }

        for node in ["a", "b", "c"] {
            let expected: Vec<i64> = assignments
                .iter()
                .enumerate()
                .filter(|(_, mask)| targets(**mask).contains(node))
                .map(|(i, _)| i as i64 + 1)
                .collect();
            let got: Vec<i64> = assigner
                .batches()
                .iter()
                .filter(|b| b.node_id == node)
                .flat_map(|b| b.data_ids.iter().copied())
                .collect();
            prop_assert_eq!(got, expected);
        }
    }

    /// Batch ids are unique and increase in creation order.
    #[test]
    fn batch_ids_are_unique_and_increasing(assignments in arb_assignments()) {
        let policy = ChannelPolicy {
            max_batch_size: 2,
            ..ChannelPolicy::for_testing("ch")
        };
        let mut assigner = BatchAssigner::new();
        for (i, mask) in assignments.iter().enumerate() {
            assigner.assign(&row(i as i64 + 1), &targets(*mask), &policy);
        }
        let ids: Vec<i64> = assigner.batches().iter().map(|b| b.batch_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(ids, sorted);
    }
}
