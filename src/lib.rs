//! Adjacency-list trees with a cached closure.
//!
//! Every node keeps a single parent reference and a sibling priority. On top
//! of that the crate maintains, per node, the ancestor chain, the descendant
//! set, depth, height, a per-tree preorder index and the tree id, so that
//! navigation never walks the tree at read time. All structural writes go
//! through [`MutationCoordinator`], which keeps those cached fields consistent
//! under insert, move, reorder, delete and full rebuilds.
//!
//! Storage is pluggable through [`NodeStore`]. [`MemoryStore`] keeps the forest
//! in process; [`SeaOrmStore`] persists it to PostgreSQL through any SeaORM
//! entity deriving [`TreeNodeModel`].

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod memory;
pub mod node;
pub mod query;
pub mod repository;
pub mod sea_store;
pub mod store;
pub mod traits;
pub mod validator;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::config::{DeleteMode, ForestConfig, ForestOptions, TieBreak};
    pub use crate::error::ForestError;
    pub use crate::node::{Node, NodeId};
    pub use crate::repository::TreeRepository;
    pub use crate::store::NodeStore;
    pub use crate::traits::TreeNodeModel;
}

pub use closure_forest_macros::TreeNodeModel as TreeNodeModelDerive;
#[doc(hidden)]
pub use closure_forest_macros::TreeNodeModel;
#[doc(hidden)]
pub use once_cell;

pub use builder::ClosureBuilder;
pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, DeleteMode, ForestConfig, ForestOptions, TieBreak,
};
pub use coordinator::MutationCoordinator;
pub use error::{ForestError, StoreError};
pub use memory::MemoryStore;
pub use node::{ClosureFields, Node, NodeId, NodeRecord, TreeNode};
pub use query::QueryFacade;
pub use repository::TreeRepository;
pub use sea_store::SeaOrmStore;
pub use store::{NodeStore, WriteBatch};
pub use traits::TreeNodeModel;
pub use validator::validate_reparent;
