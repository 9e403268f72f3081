// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registration-tree routing for node-directory rows.
//!
//! Rows routed here describe nodes themselves (registrations, identity
//! updates, removals); the first primary key column is the id of the node the
//! row is about. Propagation follows the registration tree one hop at a time,
//! so each node relays directory changes onward and no node needs global
//! knowledge of the fleet:
//!
//! 1. The routing node is the changed node: route to its immediate parent
//!    only. The change climbs toward the root one level per pass.
//! 2. The routing node is an ancestor of the changed node: route to the
//!    immediate children that either sit on the line of descent toward the
//!    changed node, or belong to a group with a configured link touching the
//!    changed node's group (a sibling branch that shares data with it). Each
//!    child must itself be reachable over a link from the routing node's
//!    group. Every qualifying child receives a copy.
//! 3. Anything else routes nowhere. Unrelated branches stay quiet.
//!
//! A removed node never receives its own removal.

use std::collections::BTreeSet;

use crate::data::{ChangeRow, EventType};
use crate::error::{Result, RoutingError};
use crate::router::{has_link, interested_groups, RoutingEnv};

pub(super) fn route(
    env: &RoutingEnv<'_>,
    row: &ChangeRow,
    candidates: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let changed_node_id = row.first_pk().ok_or_else(|| RoutingError::RouterDecision {
        data_id: row.data_id,
        message: format!(
            "node-directory row on table '{}' has no primary key",
            row.table_name
        ),
    })?;

    let routing_node_id = env.routing_node.node_id.as_str();
    let mut targets = BTreeSet::new();

    if changed_node_id == routing_node_id {
        // Rule 1: one hop up, never further.
        if let Some(parent) = env.topology.parent_of(routing_node_id) {
            if candidates.contains(&parent.node_id) {
                targets.insert(parent.node_id.clone());
            }
        }
    } else if env.topology.is_ancestor_of(routing_node_id, changed_node_id) {
        // Rule 2: fan out to the children that lead to, or share data with,
        // the changed node.
        let changed_group = env
            .topology
            .find_node(changed_node_id)
            .map(|n| n.node_group_id.clone())
            .ok_or_else(|| RoutingError::RouterDecision {
                data_id: row.data_id,
                message: format!("changed node '{}' not in directory snapshot", changed_node_id),
            })?;
        let interested = interested_groups(env.links, &changed_group);

        for child in env.topology.children_of(routing_node_id) {
            if !candidates.contains(&child.node_id) {
                continue;
            }
            if !has_link(env.links, &env.routing_node.node_group_id, &child.node_group_id) {
                continue;
            }
            let on_line_of_descent = child.node_id == changed_node_id
                || env.topology.is_ancestor_of(&child.node_id, changed_node_id);
            if on_line_of_descent || interested.contains(&child.node_group_id) {
                targets.insert(child.node_id.clone());
            }
        }
    }
    // Rule 3: empty set. A no-op route is valid.

    if row.event_type == EventType::Delete {
        targets.remove(changed_node_id);
    }
    Ok(targets)
}
