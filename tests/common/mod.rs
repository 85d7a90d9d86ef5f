#![allow(dead_code)]

pub mod entity;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use closure_forest::{ForestConfig, MemoryStore, Node, NodeId, TreeRepository};

pub type Repo = TreeRepository<MemoryStore>;

pub fn repo() -> Repo {
    repo_with(ForestConfig::default())
}

pub fn repo_with(config: ForestConfig) -> Repo {
    TreeRepository::new(Arc::new(MemoryStore::new()), config)
}

pub async fn snapshot(repo: &Repo) -> Vec<Node> {
    repo.store().snapshot().await
}

/// Recompute every cached field naively from parent links and compare.
pub async fn assert_consistent(repo: &Repo) {
    let nodes: BTreeMap<NodeId, Node> = snapshot(repo)
        .await
        .into_iter()
        .map(|node| (node.id(), node))
        .collect();

    let mut expected_descendants: BTreeMap<NodeId, BTreeSet<NodeId>> =
        nodes.keys().map(|id| (*id, BTreeSet::new())).collect();

    for node in nodes.values() {
        let mut chain = Vec::new();
        let mut cursor = node.parent_id();
        while let Some(parent_id) = cursor {
            assert!(chain.len() <= nodes.len(), "cycle through node {}", node.id());
            let parent = nodes
                .get(&parent_id)
                .unwrap_or_else(|| panic!("dangling parent {parent_id} of {}", node.id()));
            chain.push(parent_id);
            expected_descendants
                .get_mut(&parent_id)
                .unwrap()
                .insert(node.id());
            cursor = parent.parent_id();
        }
        chain.reverse();

        let closure = node.closure();
        assert_eq!(closure.ancestor_ids(), chain.as_slice(), "ancestors of {}", node.id());
        assert_eq!(closure.depth() as usize, chain.len(), "depth of {}", node.id());
        let root = chain.first().copied().unwrap_or(node.id());
        assert_eq!(closure.tree_id(), Some(root), "tree of {}", node.id());
    }

    for (id, expected) in &expected_descendants {
        assert_eq!(nodes[id].closure().descendant_ids(), expected, "descendants of {id}");
    }

    let config = repo.config();
    let mut children: BTreeMap<NodeId, Vec<&Node>> = BTreeMap::new();
    for node in nodes.values() {
        if let Some(parent_id) = node.parent_id() {
            children.entry(parent_id).or_default().push(node);
        }
    }
    for group in children.values_mut() {
        group.sort_by(|a, b| config.sibling_order(a, b));
    }

    for root in nodes.values().filter(|node| node.is_root()) {
        let mut counter = 0_u64;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            assert_eq!(node.closure().order_index(), counter, "order of {}", node.id());
            counter += 1;
            if let Some(group) = children.get(&node.id()) {
                stack.extend(group.iter().rev().copied());
            }
        }
    }

    for node in nodes.values() {
        let height = children
            .get(&node.id())
            .map(|group| {
                group
                    .iter()
                    .map(|child| child.closure().height() + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        assert_eq!(node.closure().height(), height, "height of {}", node.id());
    }
}
