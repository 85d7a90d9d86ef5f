use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::node::{Node, NodeId, NodeRecord};
use crate::store::{NodeStore, WriteBatch};

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<NodeId, Node>,
    next_id: i64,
}

/// In-process node store.
///
/// Readers see either the state before a batch or after it; a batch is applied
/// under one write guard.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_next_write: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load raw adjacency without cached fields. Run
    /// [`rebuild_all`](crate::coordinator::MutationCoordinator::rebuild_all)
    /// afterwards to build them.
    ///
    /// Nothing is written unless every record has a fresh id and a parent
    /// chain that ends at a root without looping.
    pub async fn import(
        &self,
        records: impl IntoIterator<Item = NodeRecord>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        let mut incoming: BTreeMap<NodeId, NodeRecord> = BTreeMap::new();
        for record in records {
            if state.nodes.contains_key(&record.id) || incoming.insert(record.id, record).is_some()
            {
                return Err(StoreError::rejected(record.id, "id is already in use"));
            }
        }
        for record in incoming.values() {
            check_ancestry(&state.nodes, &incoming, record)?;
        }

        for record in incoming.into_values() {
            state.next_id = state.next_id.max(record.id.get());
            state.nodes.insert(record.id, Node::from_record(record));
        }
        Ok(())
    }

    /// Every stored node ordered by id.
    pub async fn snapshot(&self) -> Vec<Node> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    /// Make the next `put_many` fail without touching any node.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }
}

/// Walk `record`'s parent links through the incoming batch until they reach a
/// stored node or a root. Stored nodes never point into the batch.
fn check_ancestry(
    stored: &BTreeMap<NodeId, Node>,
    incoming: &BTreeMap<NodeId, NodeRecord>,
    record: &NodeRecord,
) -> Result<(), StoreError> {
    let mut cursor = record.parent_id;
    let mut steps = 0;
    while let Some(parent_id) = cursor {
        if parent_id == record.id || steps > incoming.len() {
            return Err(StoreError::rejected(record.id, "parent links form a cycle"));
        }
        if stored.contains_key(&parent_id) {
            return Ok(());
        }
        let parent = incoming
            .get(&parent_id)
            .ok_or(StoreError::rejected(record.id, "parent does not exist"))?;
        cursor = parent.parent_id;
        steps += 1;
    }
    Ok(())
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[NodeId]) -> Result<BTreeMap<NodeId, Node>, StoreError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.nodes.get(id).map(|node| (*id, node.clone())))
            .collect())
    }

    async fn filter_by_parent(&self, parent_id: NodeId) -> Result<Vec<Node>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .filter(|node| node.parent_id() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn all_roots(&self) -> Result<Vec<Node>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .filter(|node| node.is_root())
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.nodes.len() as u64)
    }

    async fn allocate_id(&self) -> Result<NodeId, StoreError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        Ok(NodeId::new(state.next_id))
    }

    async fn put_many(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected write failure"));
        }

        let mut state = self.state.write().await;
        for node in batch.upserts() {
            state.nodes.insert(node.id(), node.clone());
        }
        for id in batch.removals() {
            state.nodes.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, parent: Option<i64>) -> NodeRecord {
        NodeRecord {
            id: NodeId::new(id),
            parent_id: parent.map(NodeId::new),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn import_advances_id_allocation() {
        let store = MemoryStore::new();
        store.import([record(4, None), record(9, Some(4))]).await.unwrap();

        assert_eq!(store.allocate_id().await.unwrap(), NodeId::new(10));
        assert_eq!(store.all_roots().await.unwrap().len(), 1);
        assert_eq!(
            store.filter_by_parent(NodeId::new(4)).await.unwrap()[0].id(),
            NodeId::new(9)
        );
    }

    #[tokio::test]
    async fn injected_failure_leaves_nodes_untouched() {
        let store = MemoryStore::new();
        store.import([record(1, None)]).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.remove(NodeId::new(1));
        store.fail_next_write();
        assert!(store.put_many(batch.clone()).await.is_err());
        assert_eq!(store.len().await, 1);

        store.put_many(batch).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn get_many_skips_missing_ids() {
        let store = MemoryStore::new();
        store.import([record(1, None), record(2, Some(1))]).await.unwrap();

        let found = store
            .get_many(&[NodeId::new(2), NodeId::new(3)])
            .await
            .unwrap();
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![NodeId::new(2)]);
    }

    #[tokio::test]
    async fn import_rejects_cycles_and_dangling_parents() {
        let store = MemoryStore::new();
        store.import([record(1, None)]).await.unwrap();

        let err = store
            .import([record(2, Some(3)), record(3, Some(2)), record(4, Some(1))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected { id, reason: "parent links form a cycle" } if id == NodeId::new(2)
        ));

        let err = store
            .import([record(4, Some(1)), record(5, Some(99))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected { id, reason: "parent does not exist" } if id == NodeId::new(5)
        ));

        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn import_never_overwrites() {
        let store = MemoryStore::new();
        store.import([record(1, None), record(2, Some(1))]).await.unwrap();

        assert!(store.import([record(2, None)]).await.is_err());
        assert!(store.import([record(3, None), record(3, None)]).await.is_err());
        assert_eq!(
            store.get(NodeId::new(2)).await.unwrap().unwrap().parent_id(),
            Some(NodeId::new(1))
        );
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn import_accepts_records_in_any_order() {
        let store = MemoryStore::new();
        store
            .import([record(3, Some(2)), record(2, Some(1)), record(1, None)])
            .await
            .unwrap();
        store.import([record(4, Some(3))]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 4);
    }
}
