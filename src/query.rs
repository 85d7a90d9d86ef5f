//! Read-only navigation served from cached closure fields.
//!
//! Nothing here walks parent chains or recurses through the store; each call
//! is a point read, a bulk read of cached ids, or a parent filter. Reads take
//! no locks and see the last committed batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::ForestConfig;
use crate::error::ForestError;
use crate::node::{Node, NodeId, TreeNode};
use crate::store::NodeStore;

pub struct QueryFacade<S> {
    store: Arc<S>,
    config: Arc<ForestConfig>,
}

impl<S> Clone for QueryFacade<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S> QueryFacade<S>
where
    S: NodeStore,
{
    pub fn new(store: Arc<S>, config: Arc<ForestConfig>) -> Self {
        Self { store, config }
    }

    pub async fn node(&self, id: NodeId) -> Result<Node, ForestError> {
        self.store.get(id).await?.ok_or(ForestError::NotFound(id))
    }

    /// Ancestor ids, root first. Empty for roots.
    pub async fn ancestors_of(&self, id: NodeId) -> Result<Vec<NodeId>, ForestError> {
        Ok(self.node(id).await?.closure().ancestor_ids().to_vec())
    }

    pub async fn ancestors_count(&self, id: NodeId) -> Result<usize, ForestError> {
        Ok(self.node(id).await?.closure().ancestor_ids().len())
    }

    pub async fn descendants_of(&self, id: NodeId) -> Result<BTreeSet<NodeId>, ForestError> {
        Ok(self.node(id).await?.closure().descendant_ids().clone())
    }

    /// Descendants in tree traversal order.
    pub async fn descendants_in_order(&self, id: NodeId) -> Result<Vec<NodeId>, ForestError> {
        let node = self.node(id).await?;
        let mut members = self.members(&node).await?;
        members.sort_by_key(|member| member.closure().order_index());
        Ok(members.iter().map(Node::id).collect())
    }

    pub async fn descendants_count(&self, id: NodeId) -> Result<usize, ForestError> {
        Ok(self.node(id).await?.closure().descendant_ids().len())
    }

    /// Direct children in sibling order.
    pub async fn children_of(&self, id: NodeId) -> Result<Vec<NodeId>, ForestError> {
        self.node(id).await?;
        let children = self.ordered(self.store.filter_by_parent(id).await?);
        Ok(children.iter().map(Node::id).collect())
    }

    pub async fn children_count(&self, id: NodeId) -> Result<usize, ForestError> {
        Ok(self.children_of(id).await?.len())
    }

    pub async fn first_child(&self, id: NodeId) -> Result<Option<NodeId>, ForestError> {
        Ok(self.children_of(id).await?.first().copied())
    }

    pub async fn last_child(&self, id: NodeId) -> Result<Option<NodeId>, ForestError> {
        Ok(self.children_of(id).await?.last().copied())
    }

    /// Other members of `id`'s sibling group, in sibling order.
    ///
    /// Roots have no siblings unless `include_roots_as_siblings` is set.
    pub async fn siblings_of(&self, id: NodeId) -> Result<Vec<NodeId>, ForestError> {
        let node = self.node(id).await?;
        let group = match node.parent_id() {
            Some(parent_id) => self.store.filter_by_parent(parent_id).await?,
            None if self.config.include_roots_as_siblings() => self.store.all_roots().await?,
            None => return Ok(Vec::new()),
        };
        Ok(self
            .ordered(group)
            .iter()
            .map(Node::id)
            .filter(|sibling| *sibling != id)
            .collect())
    }

    /// Rank of `id` within its full sibling group (roots rank among roots).
    pub async fn index_of(&self, id: NodeId) -> Result<usize, ForestError> {
        let node = self.node(id).await?;
        let group = match node.parent_id() {
            Some(parent_id) => self.store.filter_by_parent(parent_id).await?,
            None => self.store.all_roots().await?,
        };
        self.ordered(group)
            .iter()
            .position(|member| member.id() == id)
            .ok_or_else(|| {
                ForestError::invariant(format!("node {id} missing from its sibling group"))
            })
    }

    /// Every root in sibling order.
    pub async fn roots(&self) -> Result<Vec<NodeId>, ForestError> {
        let roots = self.ordered(self.store.all_roots().await?);
        Ok(roots.iter().map(Node::id).collect())
    }

    pub async fn parent_of(&self, id: NodeId) -> Result<Option<Node>, ForestError> {
        match self.node(id).await?.parent_id() {
            Some(parent_id) => Ok(Some(self.node(parent_id).await?)),
            None => Ok(None),
        }
    }

    /// Root of the tree containing `id` (the node itself for a root).
    pub async fn root_of(&self, id: NodeId) -> Result<Node, ForestError> {
        let node = self.node(id).await?;
        match node.closure().ancestor_ids().first() {
            Some(root_id) => self.node(*root_id).await,
            None => Ok(node),
        }
    }

    pub async fn depth_of(&self, id: NodeId) -> Result<u32, ForestError> {
        Ok(self.node(id).await?.closure().depth())
    }

    /// Longest downward path below `id`; `0` for a leaf.
    pub async fn height_of(&self, id: NodeId) -> Result<u32, ForestError> {
        Ok(self.node(id).await?.closure().height())
    }

    /// Ancestor ids followed by `id` itself.
    pub async fn path_to_root(&self, id: NodeId) -> Result<Vec<NodeId>, ForestError> {
        let mut path = self.ancestors_of(id).await?;
        path.push(id);
        Ok(path)
    }

    pub async fn is_ancestor_of(&self, a: NodeId, b: NodeId) -> Result<bool, ForestError> {
        let (a, _) = self.pair(a, b).await?;
        Ok(a.closure().descendant_ids().contains(&b))
    }

    pub async fn is_descendant_of(&self, a: NodeId, b: NodeId) -> Result<bool, ForestError> {
        self.is_ancestor_of(b, a).await
    }

    pub async fn is_child_of(&self, a: NodeId, b: NodeId) -> Result<bool, ForestError> {
        let (a, _) = self.pair(a, b).await?;
        Ok(a.parent_id() == Some(b))
    }

    pub async fn is_parent_of(&self, a: NodeId, b: NodeId) -> Result<bool, ForestError> {
        self.is_child_of(b, a).await
    }

    pub async fn is_sibling_of(&self, a: NodeId, b: NodeId) -> Result<bool, ForestError> {
        let (a_node, b_node) = self.pair(a, b).await?;
        if a == b {
            return Ok(false);
        }
        Ok(match (a_node.parent_id(), b_node.parent_id()) {
            (Some(x), Some(y)) => x == y,
            (None, None) => self.config.include_roots_as_siblings(),
            _ => false,
        })
    }

    pub async fn is_root_of(&self, a: NodeId, b: NodeId) -> Result<bool, ForestError> {
        let (a_node, b_node) = self.pair(a, b).await?;
        Ok(a_node.is_root() && b_node.closure().ancestor_ids().first() == Some(&a))
    }

    pub async fn is_root(&self, id: NodeId) -> Result<bool, ForestError> {
        Ok(self.node(id).await?.is_root())
    }

    pub async fn is_leaf(&self, id: NodeId) -> Result<bool, ForestError> {
        Ok(self.node(id).await?.is_leaf())
    }

    /// Nested view of the subtree rooted at `id`.
    pub async fn tree_of(&self, id: NodeId) -> Result<TreeNode, ForestError> {
        let node = self.node(id).await?;
        let members = self.members(&node).await?;
        Ok(self.nest(node, members))
    }

    /// Nested view of every tree, roots in sibling order.
    pub async fn forest(&self) -> Result<Vec<TreeNode>, ForestError> {
        let roots = self.ordered(self.store.all_roots().await?);
        let mut trees = Vec::with_capacity(roots.len());
        for root in roots {
            let members = self.members(&root).await?;
            trees.push(self.nest(root, members));
        }
        Ok(trees)
    }

    async fn pair(&self, a: NodeId, b: NodeId) -> Result<(Node, Node), ForestError> {
        let mut found = self.store.get_many(&[a, b]).await?;
        let a_node = found.remove(&a).ok_or(ForestError::NotFound(a))?;
        let b_node = match found.remove(&b) {
            Some(node) => node,
            None if a == b => a_node.clone(),
            None => return Err(ForestError::NotFound(b)),
        };
        Ok((a_node, b_node))
    }

    /// Every cached descendant of `node`, loaded in one bulk read.
    async fn members(&self, node: &Node) -> Result<Vec<Node>, ForestError> {
        let ids: Vec<NodeId> = node.closure().descendant_ids().iter().copied().collect();
        Ok(self.store.get_many(&ids).await?.into_values().collect())
    }

    fn ordered(&self, mut nodes: Vec<Node>) -> Vec<Node> {
        nodes.sort_by(|a, b| self.config.sibling_order(a, b));
        nodes
    }

    fn nest(&self, root: Node, members: Vec<Node>) -> TreeNode {
        let mut by_parent: BTreeMap<NodeId, Vec<Node>> = BTreeMap::new();
        for member in members {
            if let Some(parent_id) = member.parent_id() {
                by_parent.entry(parent_id).or_default().push(member);
            }
        }
        for siblings in by_parent.values_mut() {
            siblings.sort_by(|a, b| self.config.sibling_order(a, b));
        }
        assemble(&root, &mut by_parent)
    }
}

fn assemble(node: &Node, by_parent: &mut BTreeMap<NodeId, Vec<Node>>) -> TreeNode {
    let children = by_parent.remove(&node.id()).unwrap_or_default();
    TreeNode {
        id: node.id(),
        depth: node.closure().depth(),
        children: children
            .iter()
            .map(|child| assemble(child, by_parent))
            .collect(),
    }
}
