use crate::error::ForestError;
use crate::node::Node;

/// Check that `node` may be placed under `new_parent`.
///
/// Pure function of the cached state of both nodes; the caller must hold the
/// tree locks covering them so the snapshot cannot change before the write.
pub fn validate_reparent(node: &Node, new_parent: Option<&Node>) -> Result<(), ForestError> {
    let Some(parent) = new_parent else {
        return Ok(());
    };

    if parent.id() == node.id() {
        return Err(ForestError::SelfParent(node.id()));
    }

    if node.closure().descendant_ids().contains(&parent.id()) {
        return Err(ForestError::Cycle {
            node: node.id(),
            new_parent: parent.id(),
        });
    }

    Ok(())
}
