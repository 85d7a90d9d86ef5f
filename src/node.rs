//! Node records and the cached closure fields derived from them.
//!
//! The structural fields (`parent_id`, `priority`) and every cached field are
//! only writable from inside this crate. Callers read them through accessors;
//! the [`MutationCoordinator`](crate::coordinator::MutationCoordinator) is the
//! single writer.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Stable identifier assigned by the node store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(i64);

impl NodeId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for NodeId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Derived fields cached on every node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureFields {
    ancestor_ids: Vec<NodeId>,
    descendant_ids: BTreeSet<NodeId>,
    depth: u32,
    height: u32,
    order_index: u64,
    tree_id: Option<NodeId>,
}

impl ClosureFields {
    pub(crate) fn new(
        ancestor_ids: Vec<NodeId>,
        descendant_ids: BTreeSet<NodeId>,
        height: u32,
        order_index: u64,
        tree_id: NodeId,
    ) -> Self {
        let depth = u32::try_from(ancestor_ids.len()).unwrap_or(u32::MAX);
        Self {
            ancestor_ids,
            descendant_ids,
            depth,
            height,
            order_index,
            tree_id: Some(tree_id),
        }
    }

    /// Ancestors ordered from the root down to the immediate parent.
    pub fn ancestor_ids(&self) -> &[NodeId] {
        &self.ancestor_ids
    }

    /// Every node in the subtree below this one, excluding itself.
    pub fn descendant_ids(&self) -> &BTreeSet<NodeId> {
        &self.descendant_ids
    }

    /// `0` for roots.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Length of the longest downward path; `0` for leaves.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Preorder rank inside the owning tree; the root is `0`.
    pub fn order_index(&self) -> u64 {
        self.order_index
    }

    /// Root id of the owning tree. `None` only for imported nodes whose cache
    /// has not been built yet.
    pub fn tree_id(&self) -> Option<NodeId> {
        self.tree_id
    }

    pub fn is_built(&self) -> bool {
        self.tree_id.is_some()
    }

    /// Decode the JSON column written by [`to_json`](Self::to_json). `null`
    /// decodes to an unbuilt cache.
    pub fn from_json(value: serde_json::Value) -> Result<Self, StoreError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Raw adjacency for bulk import; carries no cached fields.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub priority: i64,
}

/// One tree element together with its cached closure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    parent_id: Option<NodeId>,
    priority: i64,
    closure: ClosureFields,
}

impl Node {
    pub(crate) fn new(id: NodeId, parent_id: Option<NodeId>, priority: i64) -> Self {
        Self {
            id,
            parent_id,
            priority,
            closure: ClosureFields::default(),
        }
    }

    pub(crate) fn from_record(record: NodeRecord) -> Self {
        Self::new(record.id, record.parent_id, record.priority)
    }

    /// Reassemble a node from the columns a store persisted.
    ///
    /// Only meant for [`NodeStore`](crate::store::NodeStore) implementations
    /// reading back what the coordinator wrote.
    pub fn rehydrate(
        id: NodeId,
        parent_id: Option<NodeId>,
        priority: i64,
        closure: ClosureFields,
    ) -> Self {
        Self {
            id,
            parent_id,
            priority,
            closure,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn closure(&self) -> &ClosureFields {
        &self.closure
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.closure.descendant_ids.is_empty()
    }

    /// Tree id, falling back to the node's own id for an unbuilt root.
    pub fn tree_id(&self) -> NodeId {
        self.closure.tree_id.unwrap_or(self.id)
    }

    pub(crate) fn set_parent(&mut self, parent_id: Option<NodeId>) {
        self.parent_id = parent_id;
    }

    pub(crate) fn set_priority(&mut self, priority: i64) {
        self.priority = priority;
    }

    pub(crate) fn set_closure(&mut self, closure: ClosureFields) {
        self.closure = closure;
    }
}

/// Nested, ordered view of a subtree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: NodeId,
    pub depth: u32,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Ids in preorder.
    pub fn flatten(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node.id);
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_depth_follows_ancestor_count() {
        let fields = ClosureFields::new(
            vec![NodeId::new(1), NodeId::new(2)],
            BTreeSet::new(),
            0,
            2,
            NodeId::new(1),
        );
        assert_eq!(fields.depth(), 2);
        assert!(fields.is_built());
    }

    #[test]
    fn closure_fields_survive_json() {
        let fields = ClosureFields::new(
            vec![NodeId::new(7)],
            [NodeId::new(9), NodeId::new(10)].into_iter().collect(),
            1,
            1,
            NodeId::new(7),
        );
        let json = fields.to_json().unwrap();
        assert_eq!(json["ancestor_ids"], serde_json::json!([7]));
        assert_eq!(ClosureFields::from_json(json).unwrap(), fields);
    }

    #[test]
    fn null_json_is_an_unbuilt_cache() {
        let fields = ClosureFields::from_json(serde_json::Value::Null).unwrap();
        assert!(!fields.is_built());
        assert!(ClosureFields::from_json(serde_json::json!({"depth": "x"})).is_err());
    }

    #[test]
    fn flatten_is_preorder() {
        let tree = TreeNode {
            id: NodeId::new(1),
            depth: 0,
            children: vec![
                TreeNode {
                    id: NodeId::new(2),
                    depth: 1,
                    children: vec![TreeNode {
                        id: NodeId::new(4),
                        depth: 2,
                        children: Vec::new(),
                    }],
                },
                TreeNode {
                    id: NodeId::new(3),
                    depth: 1,
                    children: Vec::new(),
                },
            ],
        };
        let ids: Vec<i64> = tree.flatten().into_iter().map(NodeId::get).collect();
        assert_eq!(ids, vec![1, 2, 4, 3]);
    }
}
