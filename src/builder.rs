//! Closure cache builder.
//!
//! Works on an in-memory working set whose structural fields already reflect
//! the pending mutation. Every tree touched by a target id is recomputed
//! whole: `order_index` is a per-tree preorder counter, so a change anywhere
//! in a tree can shift the rank of every later node in it.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ForestConfig;
use crate::error::ForestError;
use crate::node::{ClosureFields, Node, NodeId};

pub type Closures = BTreeMap<NodeId, ClosureFields>;

#[derive(Clone, Copy, Debug)]
pub struct ClosureBuilder<'a> {
    config: &'a ForestConfig,
}

impl<'a> ClosureBuilder<'a> {
    pub fn new(config: &'a ForestConfig) -> Self {
        Self { config }
    }

    /// Recompute the trees containing `targets`.
    ///
    /// The working set must hold every member of those trees. A target may be
    /// any node of a tree, including the surviving parent of a removed subtree.
    pub fn rebuild(
        &self,
        nodes: &BTreeMap<NodeId, Node>,
        targets: &BTreeSet<NodeId>,
    ) -> Result<Closures, ForestError> {
        let mut roots = BTreeSet::new();
        for target in targets {
            roots.insert(resolve_root(nodes, *target)?);
        }
        self.build_trees(nodes, &roots)
    }

    /// Recompute every tree in the working set.
    pub fn rebuild_all(&self, nodes: &BTreeMap<NodeId, Node>) -> Result<Closures, ForestError> {
        let roots: BTreeSet<NodeId> = nodes
            .values()
            .filter(|node| node.is_root())
            .map(Node::id)
            .collect();
        let closures = self.build_trees(nodes, &roots)?;

        if closures.len() != nodes.len() {
            let stray = nodes
                .keys()
                .find(|id| !closures.contains_key(*id))
                .copied()
                .unwrap_or(NodeId::new(0));
            return Err(ForestError::invariant(format!(
                "node {stray} is not reachable from any root"
            )));
        }
        Ok(closures)
    }

    fn build_trees(
        &self,
        nodes: &BTreeMap<NodeId, Node>,
        roots: &BTreeSet<NodeId>,
    ) -> Result<Closures, ForestError> {
        let children = self.children_index(nodes);
        let mut closures = Closures::new();
        for root in roots {
            self.build_tree(*root, &children, &mut closures)?;
        }
        Ok(closures)
    }

    /// Parent id to children, each list in sibling order.
    fn children_index<'n>(
        &self,
        nodes: &'n BTreeMap<NodeId, Node>,
    ) -> BTreeMap<NodeId, Vec<&'n Node>> {
        let mut children: BTreeMap<NodeId, Vec<&Node>> = BTreeMap::new();
        for node in nodes.values() {
            if let Some(parent) = node.parent_id() {
                children.entry(parent).or_default().push(node);
            }
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| self.config.sibling_order(a, b));
        }
        children
    }

    fn build_tree(
        &self,
        root: NodeId,
        children: &BTreeMap<NodeId, Vec<&Node>>,
        closures: &mut Closures,
    ) -> Result<(), ForestError> {
        let no_children = Vec::new();
        let mut ancestors: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut order: BTreeMap<NodeId, u64> = BTreeMap::new();
        let mut preorder = Vec::new();

        ancestors.insert(root, Vec::new());
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if order.contains_key(&id) {
                return Err(ForestError::invariant(format!(
                    "node {id} visited twice while building tree {root}"
                )));
            }
            order.insert(id, preorder.len() as u64);
            preorder.push(id);

            let mut chain = ancestors.get(&id).cloned().unwrap_or_default();
            chain.push(id);
            for child in children.get(&id).unwrap_or(&no_children).iter().rev() {
                ancestors.insert(child.id(), chain.clone());
                stack.push(child.id());
            }
        }

        // Bottom-up: every child is finished before its parent.
        let mut descendants: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut heights: BTreeMap<NodeId, u32> = BTreeMap::new();
        for id in preorder.iter().rev() {
            let mut set = BTreeSet::new();
            let mut height = 0;
            for child in children.get(id).unwrap_or(&no_children) {
                set.insert(child.id());
                if let Some(below) = descendants.get(&child.id()) {
                    set.extend(below.iter().copied());
                }
                height = height.max(heights.get(&child.id()).copied().unwrap_or(0) + 1);
            }
            descendants.insert(*id, set);
            heights.insert(*id, height);
        }

        for id in preorder {
            let fields = ClosureFields::new(
                ancestors.remove(&id).unwrap_or_default(),
                descendants.remove(&id).unwrap_or_default(),
                heights.get(&id).copied().unwrap_or(0),
                order.get(&id).copied().unwrap_or(0),
                root,
            );
            closures.insert(id, fields);
        }
        Ok(())
    }
}

/// Follow parent links inside the working set up to the root.
fn resolve_root(nodes: &BTreeMap<NodeId, Node>, start: NodeId) -> Result<NodeId, ForestError> {
    let mut current = nodes
        .get(&start)
        .ok_or_else(|| ForestError::invariant(format!("rebuild target {start} not loaded")))?;

    for _ in 0..=nodes.len() {
        let Some(parent_id) = current.parent_id() else {
            return Ok(current.id());
        };
        current = nodes.get(&parent_id).ok_or_else(|| {
            ForestError::invariant(format!(
                "parent {parent_id} of node {} missing from working set",
                current.id()
            ))
        })?;
    }

    Err(ForestError::invariant(format!(
        "parent chain of node {start} does not reach a root"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForestOptions, TieBreak};

    fn working_set(edges: &[(i64, Option<i64>, i64)]) -> BTreeMap<NodeId, Node> {
        edges
            .iter()
            .map(|(id, parent, priority)| {
                (
                    NodeId::new(*id),
                    Node::new(NodeId::new(*id), parent.map(NodeId::new), *priority),
                )
            })
            .collect()
    }

    fn ids(values: &[i64]) -> Vec<NodeId> {
        values.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn builds_chain_fields() {
        let config = ForestConfig::default();
        let nodes = working_set(&[(1, None, 0), (2, Some(1), 0), (3, Some(2), 0)]);
        let closures = ClosureBuilder::new(&config).rebuild_all(&nodes).unwrap();

        let leaf = &closures[&NodeId::new(3)];
        assert_eq!(leaf.ancestor_ids(), ids(&[1, 2]).as_slice());
        assert_eq!(leaf.depth(), 2);
        assert_eq!(leaf.tree_id(), Some(NodeId::new(1)));

        let root = &closures[&NodeId::new(1)];
        assert_eq!(root.descendant_ids().iter().copied().collect::<Vec<_>>(), ids(&[2, 3]));
        assert_eq!(root.height(), 2);
        assert_eq!(root.order_index(), 0);
    }

    #[test]
    fn order_index_follows_priority_then_id() {
        let config = ForestConfig::default();
        let nodes = working_set(&[
            (1, None, 0),
            (2, Some(1), 5),
            (3, Some(1), 1),
            (4, Some(1), 1),
            (5, Some(3), 0),
        ]);
        let closures = ClosureBuilder::new(&config).rebuild_all(&nodes).unwrap();

        let mut by_order: Vec<(u64, NodeId)> = closures
            .iter()
            .map(|(id, fields)| (fields.order_index(), *id))
            .collect();
        by_order.sort();
        let visit: Vec<NodeId> = by_order.into_iter().map(|(_, id)| id).collect();
        assert_eq!(visit, ids(&[1, 3, 5, 4, 2]));
    }

    #[test]
    fn descending_tie_break_flips_equal_priorities() {
        let config = ForestOptions::default()
            .tie_break(TieBreak::IdDescending)
            .apply(ForestConfig::default());
        let nodes = working_set(&[(1, None, 0), (2, Some(1), 0), (3, Some(1), 0)]);
        let closures = ClosureBuilder::new(&config).rebuild_all(&nodes).unwrap();
        assert_eq!(closures[&NodeId::new(3)].order_index(), 1);
        assert_eq!(closures[&NodeId::new(2)].order_index(), 2);
    }

    #[test]
    fn rebuild_restarts_order_per_tree_and_skips_other_trees() {
        let config = ForestConfig::default();
        let nodes = working_set(&[(1, None, 0), (2, Some(1), 0), (10, None, 0), (11, Some(10), 0)]);
        let targets: BTreeSet<NodeId> = [NodeId::new(11)].into_iter().collect();
        let closures = ClosureBuilder::new(&config).rebuild(&nodes, &targets).unwrap();

        assert_eq!(closures.keys().copied().collect::<Vec<_>>(), ids(&[10, 11]));
        assert_eq!(closures[&NodeId::new(10)].order_index(), 0);
        assert_eq!(closures[&NodeId::new(11)].order_index(), 1);
        assert_eq!(closures[&NodeId::new(11)].tree_id(), Some(NodeId::new(10)));
    }

    #[test]
    fn missing_parent_is_reported() {
        let config = ForestConfig::default();
        let nodes = working_set(&[(2, Some(1), 0)]);
        let targets: BTreeSet<NodeId> = [NodeId::new(2)].into_iter().collect();
        let err = ClosureBuilder::new(&config).rebuild(&nodes, &targets).unwrap_err();
        assert!(matches!(err, ForestError::Invariant(_)));
    }

    #[test]
    fn cycle_without_root_is_reported() {
        let config = ForestConfig::default();
        let nodes = working_set(&[(1, None, 0), (2, Some(3), 0), (3, Some(2), 0)]);
        let err = ClosureBuilder::new(&config).rebuild_all(&nodes).unwrap_err();
        assert!(matches!(err, ForestError::Invariant(_)));

        let targets: BTreeSet<NodeId> = [NodeId::new(2)].into_iter().collect();
        let err = ClosureBuilder::new(&config).rebuild(&nodes, &targets).unwrap_err();
        assert!(matches!(err, ForestError::Invariant(_)));
    }
}
