//! Node store contract.
//!
//! The core never talks to a storage engine directly. Everything it needs is
//! expressed by [`NodeStore`]: point and bulk reads, a parent filter, the root
//! list, id allocation and one atomic batch write.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::node::{Node, NodeId};

/// One atomic unit of writes.
///
/// Batches are only assembled by the mutation coordinator, which keeps cache
/// fields out of reach of any other writer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    upserts: Vec<Node>,
    removals: Vec<NodeId>,
}

impl WriteBatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn upsert(&mut self, node: Node) {
        self.upserts.push(node);
    }

    pub(crate) fn remove(&mut self, id: NodeId) {
        self.removals.push(id);
    }

    /// Nodes to insert or overwrite, parents before children where both are new.
    pub fn upserts(&self) -> &[Node] {
        &self.upserts
    }

    /// Ids to delete once all upserts are applied.
    pub fn removals(&self) -> &[NodeId] {
        &self.removals
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }
}

/// Durable keyed storage of nodes.
///
/// Implementations must be `Send + Sync`; the coordinator shares one store
/// between concurrent operations.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, id: NodeId) -> Result<Option<Node>, StoreError>;

    /// Missing ids are omitted from the result.
    async fn get_many(&self, ids: &[NodeId]) -> Result<BTreeMap<NodeId, Node>, StoreError>;

    /// Direct children of `parent_id`, in no particular order.
    async fn filter_by_parent(&self, parent_id: NodeId) -> Result<Vec<Node>, StoreError>;

    /// Every node without a parent, in no particular order.
    async fn all_roots(&self) -> Result<Vec<Node>, StoreError>;

    /// Number of stored nodes, reachable from a root or not.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Reserve a fresh id for a node about to be inserted.
    async fn allocate_id(&self) -> Result<NodeId, StoreError>;

    /// Apply every upsert and removal, or none of them.
    async fn put_many(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
