use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectionTrait, DatabaseTransaction, DbBackend, Statement, Value};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::config::AdvisoryLockKey;
use crate::error::{ForestError, StoreError};
use crate::node::NodeId;

/// Writer locks for structural mutations.
///
/// Tree-scoped mutations share the forest lock and take one mutex per
/// `tree_id`; full rebuilds take the forest lock exclusively.
#[derive(Debug, Default)]
pub struct TreeLocks {
    forest: Arc<RwLock<()>>,
    trees: Mutex<BTreeMap<NodeId, Arc<Mutex<()>>>>,
}

/// Held for the duration of a tree-scoped mutation.
#[derive(Debug)]
pub struct TreeGuard {
    // Tree mutexes are released before the shared forest guard.
    _trees: Vec<OwnedMutexGuard<()>>,
    _forest: OwnedRwLockReadGuard<()>,
}

/// Held for the duration of a forest-wide mutation.
#[derive(Debug)]
pub struct ForestGuard {
    _forest: OwnedRwLockWriteGuard<()>,
}

impl TreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `tree_ids` in ascending order, giving up at `deadline`.
    pub async fn lock_trees(
        &self,
        tree_ids: &BTreeSet<NodeId>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<TreeGuard, ForestError> {
        let acquire = async {
            let forest = self.forest.clone().read_owned().await;

            let handles: Vec<Arc<Mutex<()>>> = {
                let mut trees = self.trees.lock().await;
                trees.retain(|_, handle| Arc::strong_count(handle) > 1);
                tree_ids
                    .iter()
                    .map(|id| trees.entry(*id).or_default().clone())
                    .collect()
            };

            let mut guards = Vec::with_capacity(handles.len());
            for handle in handles {
                guards.push(handle.lock_owned().await);
            }

            TreeGuard {
                _trees: guards,
                _forest: forest,
            }
        };

        timeout_at(deadline, acquire).await.map_err(|_| {
            warn!(?tree_ids, ?timeout, "timed out acquiring tree locks");
            ForestError::Contention { timeout }
        })
    }

    /// Exclusive lock over every tree.
    pub async fn lock_forest(&self, timeout: Duration) -> Result<ForestGuard, ForestError> {
        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, self.forest.clone().write_owned()).await {
            Ok(guard) => Ok(ForestGuard { _forest: guard }),
            Err(_) => {
                warn!(?timeout, "timed out acquiring the forest lock");
                Err(ForestError::Contention { timeout })
            }
        }
    }
}

/// Serialise batch writes from every process sharing the database.
///
/// Released automatically when the transaction ends.
pub(crate) async fn advisory_xact_lock(
    txn: &DatabaseTransaction,
    key: &AdvisoryLockKey,
) -> Result<(), StoreError> {
    txn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT pg_advisory_xact_lock(hashtext($1))",
        vec![Value::from(key.as_str())],
    ))
    .await?;
    Ok(())
}
