// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node directory: nodes, group links, and the registration tree.
//!
//! Nodes form a tree through their `created_at_node_id` parent pointer (the
//! node they registered with). [`NodeTopology`] materializes that tree as an
//! arena keyed by node id: each entry holds its parent's key and an id-ordered
//! set of child keys, so ancestor walks follow parent pointers and descendant
//! walks follow child sets, with no reference cycles to manage.
//!
//! A topology is built fresh from a directory snapshot at the start of each
//! routing pass and is immutable for the duration of the pass. Inconsistent
//! snapshots (a declared parent that is absent, or a parent chain that loops)
//! fail the build with [`RoutingError::Topology`] rather than producing a tree
//! that would silently route nothing.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};

/// A synchronization node in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub node_id: String,
    /// Group this node belongs to (tier in the deployment).
    pub node_group_id: String,
    /// Deployment-assigned external identifier.
    pub external_id: String,
    /// The node this one registered with. `None` for the root.
    pub created_at_node_id: Option<String>,
    /// Disabled nodes stay in the tree but are filtered from candidate sets
    /// by the caller.
    pub sync_enabled: bool,
    /// URL peers use to reach this node, when known.
    pub sync_url: Option<String>,
}

impl Node {
    /// Create an enabled node for testing.
    pub fn for_testing(node_id: &str, group_id: &str, parent: Option<&str>) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_group_id: group_id.to_string(),
            external_id: node_id.to_string(),
            created_at_node_id: parent.map(|p| p.to_string()),
            sync_enabled: true,
            sync_url: None,
        }
    }
}

/// Direction of data flow on a configured link between two node groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkAction {
    /// The source group pushes to the target on its schedule.
    PushOnSchedule,
    /// The source group holds batches until the target pulls.
    WaitForPull,
}

impl LinkAction {
    /// Parse the single-letter code stored in configuration.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_uppercase().as_str() {
            "P" => Some(LinkAction::PushOnSchedule),
            "W" => Some(LinkAction::WaitForPull),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LinkAction::PushOnSchedule => "P",
            LinkAction::WaitForPull => "W",
        }
    }
}

/// A configured data-flow edge between two node groups.
///
/// Links qualify destinations regardless of action: a `WaitForPull` link is
/// advisory about transport timing, not about whether batches are created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupLink {
    pub source_group_id: String,
    pub target_group_id: String,
    pub action: LinkAction,
}

impl NodeGroupLink {
    pub fn new(source: &str, target: &str, action: LinkAction) -> Self {
        Self {
            source_group_id: source.to_string(),
            target_group_id: target.to_string(),
            action,
        }
    }
}

/// Arena entry: one node plus its tree position.
#[derive(Debug, Clone)]
struct NetworkedNode {
    node: Node,
    parent: Option<String>,
    children: BTreeSet<String>,
}

/// The registration tree over a directory snapshot.
#[derive(Debug, Clone)]
pub struct NodeTopology {
    arena: HashMap<String, NetworkedNode>,
    root_id: String,
}

impl NodeTopology {
    /// Build the tree from a directory snapshot.
    ///
    /// The root is the single node with no `created_at_node_id` (a
    /// self-referential pointer counts as none). Fails when the snapshot has
    /// zero or multiple roots, a declared parent that is not in the snapshot,
    /// or a parent chain that loops.
    pub fn build(nodes: Vec<Node>) -> Result<Self> {
        let mut arena: HashMap<String, NetworkedNode> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let parent = match &node.created_at_node_id {
                Some(p) if *p != node.node_id => Some(p.clone()),
                _ => None,
            };
            let id = node.node_id.clone();
            if arena
                .insert(
                    id.clone(),
                    NetworkedNode {
                        node,
                        parent,
                        children: BTreeSet::new(),
                    },
                )
                .is_some()
            {
                return Err(RoutingError::Topology(format!(
                    "duplicate node id '{}' in directory snapshot",
                    id
                )));
            }
        }

        // Wire children and find the root.
        let mut root_id: Option<String> = None;
        let edges: Vec<(String, Option<String>)> = arena
            .iter()
            .map(|(id, entry)| (id.clone(), entry.parent.clone()))
            .collect();
        for (id, parent) in edges {
            match parent {
                Some(parent_id) => {
                    let parent_entry = arena.get_mut(&parent_id).ok_or_else(|| {
                        RoutingError::Topology(format!(
                            "node '{}' declares missing parent '{}'",
                            id, parent_id
                        ))
                    })?;
                    parent_entry.children.insert(id);
                }
                None => {
                    if let Some(existing) = &root_id {
                        return Err(RoutingError::Topology(format!(
                            "multiple roots in directory snapshot: '{}' and '{}'",
                            existing, id
                        )));
                    }
                    root_id = Some(id);
                }
            }
        }
        let root_id = root_id.ok_or_else(|| {
            RoutingError::Topology("directory snapshot has no root node".to_string())
        })?;

        let topology = Self { arena, root_id };
        topology.check_reachability()?;
        Ok(topology)
    }

    /// Every node must reach the root through its parent chain. A node that
    /// cannot is part of a parent cycle detached from the tree.
    fn check_reachability(&self) -> Result<()> {
        for id in self.arena.keys() {
            if self.distance_from_root(id).is_none() {
                return Err(RoutingError::Topology(format!(
                    "node '{}' does not reach root '{}' (parent cycle)",
                    id, self.root_id
                )));
            }
        }
        Ok(())
    }

    /// The root node's id.
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Look up a node by id. O(1).
    pub fn find_node(&self, node_id: &str) -> Option<&Node> {
        self.arena.get(node_id).map(|entry| &entry.node)
    }

    /// Immediate parent of a node, if it has one.
    pub fn parent_of(&self, node_id: &str) -> Option<&Node> {
        let parent_id = self.arena.get(node_id)?.parent.as_deref()?;
        self.find_node(parent_id)
    }

    /// Immediate children of a node, in id order.
    pub fn children_of(&self, node_id: &str) -> impl Iterator<Item = &Node> {
        self.arena
            .get(node_id)
            .into_iter()
            .flat_map(|entry| entry.children.iter())
            .filter_map(|child_id| self.find_node(child_id))
    }

    /// Whether `ancestor_id` appears on `node_id`'s parent chain.
    ///
    /// A node is not its own ancestor. Unknown ids are simply not ancestors.
    pub fn is_ancestor_of(&self, ancestor_id: &str, node_id: &str) -> bool {
        let mut current = self.arena.get(node_id).and_then(|e| e.parent.as_deref());
        let mut hops = 0usize;
        while let Some(parent_id) = current {
            if parent_id == ancestor_id {
                return true;
            }
            hops += 1;
            if hops > self.arena.len() {
                return false; // walk bounded by tree size
            }
            current = self.arena.get(parent_id).and_then(|e| e.parent.as_deref());
        }
        false
    }

    /// Whether `node_id` appears somewhere under `ancestor_id`.
    pub fn is_descendant_of(&self, node_id: &str, ancestor_id: &str) -> bool {
        self.is_ancestor_of(ancestor_id, node_id)
    }

    /// Number of parent hops from `node_id` up to the root.
    ///
    /// `None` when the node is unknown. Callers treat `None` as a topology
    /// error, never as distance zero.
    pub fn distance_from_root(&self, node_id: &str) -> Option<usize> {
        if !self.arena.contains_key(node_id) {
            return None;
        }
        let mut distance = 0usize;
        let mut current = node_id;
        while let Some(parent_id) = self.arena.get(current)?.parent.as_deref() {
            distance += 1;
            if distance > self.arena.len() {
                return None;
            }
            current = parent_id;
        }
        Some(distance)
    }

    /// Whether the subtree rooted at `node_id` (itself included) contains a
    /// node in any of `groups`. Short-circuits on first hit.
    pub fn has_descendant_in_groups(&self, node_id: &str, groups: &BTreeSet<String>) -> bool {
        let mut stack = vec![node_id];
        while let Some(id) = stack.pop() {
            let Some(entry) = self.arena.get(id) else {
                continue;
            };
            if groups.contains(&entry.node.node_group_id) {
                return true;
            }
            stack.extend(entry.children.iter().map(|s| s.as_str()));
        }
        false
    }

    /// All node ids in id order. Used to form candidate sets in tests.
    pub fn node_ids(&self) -> BTreeSet<String> {
        self.arena.keys().cloned().collect()
    }
}
