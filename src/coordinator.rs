//! Mutation coordinator.
//!
//! Every structural change goes through here: the coordinator locks the
//! affected trees, re-reads the subjects, validates, rebuilds the closure of
//! each touched tree in memory and persists the difference as one batch. A
//! failure at any step leaves the store exactly as it was.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::builder::ClosureBuilder;
use crate::config::{DeleteMode, ForestConfig};
use crate::error::ForestError;
use crate::lock::{TreeGuard, TreeLocks};
use crate::node::{Node, NodeId};
use crate::store::{NodeStore, WriteBatch};
use crate::validator::validate_reparent;

type WorkingSet = BTreeMap<NodeId, Node>;

pub struct MutationCoordinator<S> {
    store: Arc<S>,
    config: Arc<ForestConfig>,
    locks: Arc<TreeLocks>,
}

impl<S> Clone for MutationCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<S> MutationCoordinator<S>
where
    S: NodeStore,
{
    pub fn new(store: Arc<S>, config: Arc<ForestConfig>, locks: Arc<TreeLocks>) -> Self {
        Self {
            store,
            config,
            locks,
        }
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Create a node under `parent_id` (or a new root) with the given priority.
    #[instrument(skip(self))]
    pub async fn insert(
        &self,
        parent_id: Option<NodeId>,
        priority: i64,
    ) -> Result<NodeId, ForestError> {
        self.insert_with(parent_id, Some(priority)).await
    }

    /// Create a node after every existing sibling.
    #[instrument(skip(self))]
    pub async fn insert_last(&self, parent_id: Option<NodeId>) -> Result<NodeId, ForestError> {
        self.insert_with(parent_id, None).await
    }

    async fn insert_with(
        &self,
        parent_id: Option<NodeId>,
        priority: Option<i64>,
    ) -> Result<NodeId, ForestError> {
        let Some(parent_id) = parent_id else {
            let _guard = self.lock_subjects(&[]).await?.0;
            let priority = match priority {
                Some(priority) => priority,
                None => next_priority(&self.store.all_roots().await?, None),
            };
            let id = self.store.allocate_id().await?;
            let mut working = WorkingSet::new();
            working.insert(id, Node::new(id, None, priority));
            self.commit(&WorkingSet::new(), working, BTreeSet::from([id]), Vec::new()).await?;
            debug!(%id, "inserted root");
            return Ok(id);
        };

        let (_guard, subjects) = self.lock_subjects(&[parent_id]).await?;
        let parent = subject(&subjects, parent_id)?;
        let before = self.load_trees(&BTreeSet::from([parent.tree_id()])).await?;
        let mut working = before.clone();

        let priority = match priority {
            Some(priority) => priority,
            None => {
                let siblings: Vec<Node> = children_in(&working, parent_id).cloned().collect();
                next_priority(&siblings, None)
            }
        };
        let id = self.store.allocate_id().await?;
        working.insert(id, Node::new(id, Some(parent_id), priority));

        self.commit(&before, working, BTreeSet::from([id]), Vec::new()).await?;
        debug!(%id, %parent_id, "inserted child");
        Ok(id)
    }

    /// Delete with the configured default mode.
    pub async fn delete_default(&self, id: NodeId) -> Result<(), ForestError> {
        self.delete(id, self.config.default_delete_mode()).await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: NodeId, mode: DeleteMode) -> Result<(), ForestError> {
        let (_guard, subjects) = self.lock_subjects(&[id]).await?;
        let node = subject(&subjects, id)?;
        let before = self.load_trees(&BTreeSet::from([node.tree_id()])).await?;
        let mut working = before.clone();

        let grandparent = node.parent_id();
        let mut targets = BTreeSet::new();
        let mut removals = vec![id];
        working.remove(&id);

        match mode {
            DeleteMode::Cascade => {
                for descendant in node.closure().descendant_ids() {
                    working.remove(descendant);
                    removals.push(*descendant);
                }
                targets.extend(grandparent);
            }
            DeleteMode::ReparentChildrenToGrandparent => {
                let mut children: Vec<Node> = children_in(&working, id).cloned().collect();
                children.sort_by(|a, b| self.config.sibling_order(a, b));

                let offset = match grandparent {
                    Some(gp) => {
                        let siblings: Vec<Node> = children_in(&working, gp).cloned().collect();
                        next_priority(&siblings, None)
                    }
                    None => next_priority(&self.store.all_roots().await?, Some(id)),
                };

                for (rank, child) in (0_i64..).zip(children.iter()) {
                    if let Some(moved) = working.get_mut(&child.id()) {
                        moved.set_parent(grandparent);
                        moved.set_priority(offset.saturating_add(rank));
                    }
                    if grandparent.is_none() {
                        targets.insert(child.id());
                    }
                }
                targets.extend(grandparent);
            }
        }

        self.commit(&before, working, targets, removals).await
    }

    /// Place `id` (with its subtree) under `new_parent_id`, or make it a root.
    ///
    /// `new_priority = None` keeps the node's current priority.
    #[instrument(skip(self))]
    pub async fn move_node(
        &self,
        id: NodeId,
        new_parent_id: Option<NodeId>,
        new_priority: Option<i64>,
    ) -> Result<(), ForestError> {
        let mut ids = vec![id];
        ids.extend(new_parent_id);
        let (_guard, subjects) = self.lock_subjects(&ids).await?;

        let node = subject(&subjects, id)?;
        let new_parent = new_parent_id
            .map(|parent_id| subject(&subjects, parent_id))
            .transpose()?;
        validate_reparent(node, new_parent)?;

        let mut trees = BTreeSet::from([node.tree_id()]);
        trees.extend(new_parent.map(Node::tree_id));
        let before = self.load_trees(&trees).await?;
        let mut working = before.clone();

        let moving = working
            .get_mut(&id)
            .ok_or_else(|| ForestError::invariant(format!("node {id} missing from its tree")))?;
        moving.set_parent(new_parent_id);
        if let Some(priority) = new_priority {
            moving.set_priority(priority);
        }

        let mut targets = BTreeSet::from([id]);
        targets.extend(node.parent_id());
        targets.extend(new_parent_id);

        self.commit(&before, working, targets, Vec::new()).await
    }

    /// Give a complete sibling group the priorities `0..n` in the order given.
    #[instrument(skip(self))]
    pub async fn reorder(&self, sibling_ids_in_order: &[NodeId]) -> Result<(), ForestError> {
        let Some(first) = sibling_ids_in_order.first() else {
            return Err(ForestError::MismatchedSiblings { parent: None });
        };
        let found = self.store.get_many(sibling_ids_in_order).await?;
        if let Some(missing) = sibling_ids_in_order.iter().find(|id| !found.contains_key(*id)) {
            return Err(ForestError::NotFound(*missing));
        }
        let supplied: BTreeSet<NodeId> = sibling_ids_in_order.iter().copied().collect();
        if supplied.len() != sibling_ids_in_order.len() {
            return Err(ForestError::MismatchedSiblings {
                parent: found.get(first).and_then(Node::parent_id),
            });
        }

        match found.get(first).and_then(Node::parent_id) {
            Some(parent_id) => {
                self.reorder_children(parent_id, sibling_ids_in_order, &supplied).await
            }
            None => self.reorder_roots(sibling_ids_in_order, &supplied).await,
        }
    }

    async fn reorder_children(
        &self,
        parent_id: NodeId,
        ordered: &[NodeId],
        supplied: &BTreeSet<NodeId>,
    ) -> Result<(), ForestError> {
        let (_guard, subjects) = self.lock_subjects(&[parent_id]).await?;
        let parent = subject(&subjects, parent_id)?;
        let before = self.load_trees(&BTreeSet::from([parent.tree_id()])).await?;
        let mut working = before.clone();

        let group: BTreeSet<NodeId> = children_in(&working, parent_id).map(Node::id).collect();
        if &group != supplied {
            return Err(ForestError::MismatchedSiblings {
                parent: Some(parent_id),
            });
        }

        for (priority, id) in (0_i64..).zip(ordered) {
            if let Some(node) = working.get_mut(id) {
                node.set_priority(priority);
            }
        }

        self.commit(&before, working, BTreeSet::from([parent_id]), Vec::new()).await
    }

    /// Roots each own a tree, so only priorities change; the forest lock keeps
    /// the root group stable while it is compared and rewritten.
    async fn reorder_roots(
        &self,
        ordered: &[NodeId],
        supplied: &BTreeSet<NodeId>,
    ) -> Result<(), ForestError> {
        let _guard = self.locks.lock_forest(self.config.lock_timeout()).await?;
        let roots: BTreeMap<NodeId, Node> = self
            .store
            .all_roots()
            .await?
            .into_iter()
            .map(|node| (node.id(), node))
            .collect();

        let group: BTreeSet<NodeId> = roots.keys().copied().collect();
        if &group != supplied {
            return Err(ForestError::MismatchedSiblings { parent: None });
        }

        let mut batch = WriteBatch::new();
        for (priority, id) in (0_i64..).zip(ordered) {
            if let Some(root) = roots.get(id) {
                if root.priority() != priority {
                    let mut updated = root.clone();
                    updated.set_priority(priority);
                    batch.upsert(updated);
                }
            }
        }
        self.write(batch).await
    }

    /// Recompute every cached field from the adjacency alone.
    ///
    /// Walks the forest from the roots through the parent filter, so it does
    /// not trust any cached field. Used after bulk imports and to repair a
    /// damaged cache. Fails with [`ForestError::Invariant`] and writes nothing
    /// when some stored node cannot be reached from a root (a parent cycle or
    /// a dangling parent).
    #[instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<(), ForestError> {
        let _guard = self.locks.lock_forest(self.config.lock_timeout()).await?;

        let mut before = WorkingSet::new();
        let mut queue: VecDeque<Node> = self.store.all_roots().await?.into();
        while let Some(node) = queue.pop_front() {
            let id = node.id();
            if before.insert(id, node).is_some() {
                continue;
            }
            queue.extend(self.store.filter_by_parent(id).await?);
        }

        let stored = self.store.count().await?;
        if stored != before.len() as u64 {
            warn!(stored, reachable = before.len(), "forest has unreachable nodes");
            return Err(ForestError::invariant(format!(
                "{} of {stored} stored nodes are not reachable from any root",
                stored.saturating_sub(before.len() as u64)
            )));
        }

        let closures = ClosureBuilder::new(&self.config).rebuild_all(&before)?;
        let mut batch = WriteBatch::new();
        for (id, fields) in closures {
            if let Some(node) = before.get(&id) {
                if node.closure() != &fields {
                    let mut updated = node.clone();
                    updated.set_closure(fields);
                    batch.upsert(updated);
                }
            }
        }

        let updated = batch.len();
        self.write(batch).await?;
        info!(nodes = before.len(), updated, "rebuilt forest closure");
        Ok(())
    }

    /// Lock the trees owning `ids`, then re-read the subjects.
    ///
    /// A subject whose tree changed while we waited (another mutation moved
    /// it) sends us round again with the new tree ids, within one deadline.
    async fn lock_subjects(
        &self,
        ids: &[NodeId],
    ) -> Result<(TreeGuard, WorkingSet), ForestError> {
        let timeout = self.config.lock_timeout();
        let deadline = Instant::now() + timeout;
        let mut subjects = self.fetch_subjects(ids).await?;

        loop {
            let trees = tree_ids(&subjects);
            let guard = self.locks.lock_trees(&trees, deadline, timeout).await?;
            let fresh = self.fetch_subjects(ids).await?;
            if tree_ids(&fresh) == trees {
                return Ok((guard, fresh));
            }

            drop(guard);
            if Instant::now() >= deadline {
                warn!(?ids, "subjects kept changing trees while locking");
                return Err(ForestError::Contention { timeout });
            }
            debug!(?ids, "tree membership changed while locking, retrying");
            subjects = fresh;
        }
    }

    async fn fetch_subjects(&self, ids: &[NodeId]) -> Result<WorkingSet, ForestError> {
        let found = self.store.get_many(ids).await?;
        if let Some(missing) = ids.iter().find(|id| !found.contains_key(*id)) {
            return Err(ForestError::NotFound(*missing));
        }
        if let Some(unbuilt) = found.values().find(|node| !node.closure().is_built()) {
            return Err(ForestError::invariant(format!(
                "node {} has no closure cache; run rebuild_all first",
                unbuilt.id()
            )));
        }
        Ok(found)
    }

    /// Every member of the given trees, read through the root's cached
    /// descendant set.
    async fn load_trees(&self, trees: &BTreeSet<NodeId>) -> Result<WorkingSet, ForestError> {
        let mut working = WorkingSet::new();
        for tree in trees {
            let root = self
                .store
                .get(*tree)
                .await?
                .filter(Node::is_root)
                .ok_or_else(|| ForestError::invariant(format!("tree root {tree} missing")))?;

            let ids: Vec<NodeId> = root.closure().descendant_ids().iter().copied().collect();
            let members = self.store.get_many(&ids).await?;
            if members.len() != ids.len() {
                return Err(ForestError::invariant(format!(
                    "tree {tree} lists {} descendants but {} exist",
                    ids.len(),
                    members.len()
                )));
            }
            working.extend(members);
            working.insert(root.id(), root);
        }
        debug!(trees = trees.len(), nodes = working.len(), "loaded working set");
        Ok(working)
    }

    /// Rebuild the trees reachable from `targets` and persist what changed.
    async fn commit(
        &self,
        before: &WorkingSet,
        mut working: WorkingSet,
        targets: BTreeSet<NodeId>,
        removals: Vec<NodeId>,
    ) -> Result<(), ForestError> {
        let closures = ClosureBuilder::new(&self.config).rebuild(&working, &targets)?;
        if closures.len() != working.len() {
            return Err(ForestError::invariant(format!(
                "rebuild covered {} of {} loaded nodes",
                closures.len(),
                working.len()
            )));
        }
        for (id, fields) in closures {
            if let Some(node) = working.get_mut(&id) {
                node.set_closure(fields);
            }
        }

        let mut changed: Vec<Node> = working
            .into_values()
            .filter(|node| before.get(&node.id()) != Some(node))
            .collect();
        // New parents land before their new children.
        changed.sort_by_key(|node| (node.closure().depth(), node.id()));

        let mut batch = WriteBatch::new();
        for node in changed {
            batch.upsert(node);
        }
        for id in removals {
            batch.remove(id);
        }
        self.write(batch).await
    }

    async fn write(&self, batch: WriteBatch) -> Result<(), ForestError> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!(
            upserts = batch.upserts().len(),
            removals = batch.removals().len(),
            "writing batch"
        );
        self.store.put_many(batch).await.map_err(|err| {
            warn!(%err, "batch write aborted");
            ForestError::Store(err)
        })
    }
}

fn subject(subjects: &WorkingSet, id: NodeId) -> Result<&Node, ForestError> {
    subjects.get(&id).ok_or(ForestError::NotFound(id))
}

fn tree_ids(nodes: &WorkingSet) -> BTreeSet<NodeId> {
    nodes.values().map(Node::tree_id).collect()
}

fn children_in(working: &WorkingSet, parent_id: NodeId) -> impl Iterator<Item = &Node> {
    working
        .values()
        .filter(move |node| node.parent_id() == Some(parent_id))
}

/// One past the highest priority in `siblings`, ignoring `except`.
fn next_priority(siblings: &[Node], except: Option<NodeId>) -> i64 {
    siblings
        .iter()
        .filter(|node| Some(node.id()) != except)
        .map(Node::priority)
        .max()
        .map_or(0, |max| max.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::node::ClosureFields;

    fn coordinator() -> MutationCoordinator<MemoryStore> {
        MutationCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ForestConfig::default()),
            Arc::new(TreeLocks::new()),
        )
    }

    async fn plant(store: &MemoryStore, nodes: Vec<Node>) {
        let mut batch = WriteBatch::new();
        for node in nodes {
            batch.upsert(node);
        }
        store.put_many(batch).await.unwrap();
    }

    #[tokio::test]
    async fn rebuild_all_refuses_unreachable_nodes() {
        let coordinator = coordinator();
        let raw = |id: i64, parent: Option<i64>| {
            Node::new(NodeId::new(id), parent.map(NodeId::new), 0)
        };
        plant(
            &coordinator.store,
            vec![raw(1, None), raw(2, Some(3)), raw(3, Some(2)), raw(5, Some(99))],
        )
        .await;
        let before = coordinator.store.snapshot().await;

        let err = coordinator.rebuild_all().await.unwrap_err();
        assert!(
            matches!(err, ForestError::Invariant(ref detail) if detail.starts_with("3 of 4")),
            "{err}"
        );
        assert_eq!(coordinator.store.snapshot().await, before);
    }

    #[tokio::test]
    async fn rebuild_all_repairs_a_damaged_cache() {
        let coordinator = coordinator();
        let r = coordinator.insert(None, 0).await.unwrap();
        let a = coordinator.insert(Some(r), 0).await.unwrap();
        let b = coordinator.insert(Some(r), 1).await.unwrap();
        let leaf = coordinator.insert(Some(a), 0).await.unwrap();
        let store = &coordinator.store;
        let healthy = store.snapshot().await;

        let mut damaged_root = store.get(r).await.unwrap().unwrap();
        damaged_root.set_closure(ClosureFields::new(Vec::new(), BTreeSet::from([a]), 0, 0, r));
        let mut damaged_leaf = store.get(leaf).await.unwrap().unwrap();
        damaged_leaf.set_closure(ClosureFields::new(vec![b], BTreeSet::new(), 3, 9, r));
        plant(store, vec![damaged_root, damaged_leaf]).await;
        assert_ne!(store.snapshot().await, healthy);

        coordinator.rebuild_all().await.unwrap();
        assert_eq!(store.snapshot().await, healthy);
    }
}
