use std::time::Duration;

use thiserror::Error;

use crate::node::NodeId;

/// Errors returned by the forest mutation and query APIs.
#[derive(Debug, Error)]
pub enum ForestError {
    #[error("node {0} does not exist")]
    NotFound(NodeId),

    #[error("node {0} cannot be its own parent")]
    SelfParent(NodeId),

    #[error("moving node {node} under {new_parent} would create a cycle")]
    Cycle { node: NodeId, new_parent: NodeId },

    #[error("reorder ids do not match the sibling group of parent {}", display_parent(.parent))]
    MismatchedSiblings { parent: Option<NodeId> },

    #[error("timed out after {timeout:?} waiting for a tree lock")]
    Contention { timeout: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("closure-forest invariant violation: {0}")]
    Invariant(String),
}

impl ForestError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant(detail.into())
    }

    /// Only lock contention is worth retrying; everything else is deterministic
    /// given the same tree state or is a store failure the caller must judge.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

fn display_parent(parent: &Option<NodeId>) -> String {
    match parent {
        Some(id) => id.to_string(),
        None => "<root>".to_string(),
    }
}

/// Failures raised by a [`NodeStore`](crate::store::NodeStore) implementation.
///
/// The core treats these as opaque and always propagates them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("closure field encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{field} value {value} does not fit its column type")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record {id} rejected: {reason}")]
    Rejected { id: NodeId, reason: &'static str },
}

impl StoreError {
    pub fn out_of_range(field: &'static str, value: i64) -> Self {
        Self::OutOfRange { field, value }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::Unavailable(detail.into())
    }

    pub fn rejected(id: NodeId, reason: &'static str) -> Self {
        Self::Rejected { id, reason }
    }
}
