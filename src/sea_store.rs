use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, EntityName,
    EntityTrait, PaginatorTrait, QueryFilter, Statement, TransactionTrait, Value,
};
use tracing::debug;

use crate::config::ForestConfig;
use crate::error::StoreError;
use crate::lock::advisory_xact_lock;
use crate::node::{Node, NodeId};
use crate::repository::TreeRepository;
use crate::store::{NodeStore, WriteBatch};
use crate::traits::TreeNodeModel;

/// PostgreSQL node store for a SeaORM entity.
///
/// Every batch runs in one transaction under `pg_advisory_xact_lock`, which
/// only covers the write itself. The coordinator's tree locks live in process
/// memory, so the read, validate and write steps of a mutation are serialised
/// only among clones of one [`TreeRepository`]. Two processes, or two separate
/// repositories over the same table, can validate against stale caches and
/// must not mutate the same forest concurrently.
#[derive(Debug)]
pub struct SeaOrmStore<M>
where
    M: TreeNodeModel,
{
    db: DatabaseConnection,
    _marker: PhantomData<M>,
}

impl<M> SeaOrmStore<M>
where
    M: TreeNodeModel,
{
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            _marker: PhantomData,
        }
    }

    fn config(&self) -> &'static ForestConfig {
        M::forest_config()
    }

    fn ensure_postgres(conn: &impl ConnectionTrait) -> Result<(), StoreError> {
        if conn.get_database_backend() == DbBackend::Postgres {
            Ok(())
        } else {
            Err(StoreError::unavailable(
                "closure-forest's SeaORM store supports PostgreSQL connections only",
            ))
        }
    }

    fn id_values(ids: &[NodeId]) -> Result<Vec<Value>, StoreError> {
        ids.iter().map(|id| M::id_to_value(*id)).collect()
    }

    fn into_nodes(models: Vec<M>) -> Result<Vec<Node>, StoreError> {
        models.into_iter().map(M::into_node).collect()
    }
}

#[async_trait]
impl<M> NodeStore for SeaOrmStore<M>
where
    M: TreeNodeModel,
{
    async fn get(&self, id: NodeId) -> Result<Option<Node>, StoreError> {
        Self::ensure_postgres(&self.db)?;
        let model = M::Entity::find()
            .filter(M::id_column().eq(M::id_to_value(id)?))
            .one(&self.db)
            .await?;
        model.map(M::into_node).transpose()
    }

    async fn get_many(&self, ids: &[NodeId]) -> Result<BTreeMap<NodeId, Node>, StoreError> {
        Self::ensure_postgres(&self.db)?;
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let models = M::Entity::find()
            .filter(M::id_column().is_in(Self::id_values(ids)?))
            .all(&self.db)
            .await?;
        Ok(Self::into_nodes(models)?
            .into_iter()
            .map(|node| (node.id(), node))
            .collect())
    }

    async fn filter_by_parent(&self, parent_id: NodeId) -> Result<Vec<Node>, StoreError> {
        Self::ensure_postgres(&self.db)?;
        let models = M::Entity::find()
            .filter(M::parent_column().eq(M::id_to_value(parent_id)?))
            .all(&self.db)
            .await?;
        Self::into_nodes(models)
    }

    async fn all_roots(&self) -> Result<Vec<Node>, StoreError> {
        Self::ensure_postgres(&self.db)?;
        let models = M::Entity::find()
            .filter(M::parent_column().is_null())
            .all(&self.db)
            .await?;
        Self::into_nodes(models)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Self::ensure_postgres(&self.db)?;
        Ok(M::Entity::find().count(&self.db).await?)
    }

    async fn allocate_id(&self) -> Result<NodeId, StoreError> {
        Self::ensure_postgres(&self.db)?;
        let table = M::Entity::default().table_name().to_owned();
        let column = self.config().id_column().to_owned();
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "SELECT nextval(pg_get_serial_sequence($1, $2)) AS id",
                vec![Value::from(table), Value::from(column)],
            ))
            .await?
            .ok_or_else(|| StoreError::unavailable("id sequence returned no row"))?;
        let id: i64 = row.try_get("", "id")?;
        Ok(NodeId::new(id))
    }

    async fn put_many(&self, batch: WriteBatch) -> Result<(), StoreError> {
        Self::ensure_postgres(&self.db)?;
        let txn = self.db.begin().await?;

        match write_batch::<M>(&txn, &batch).await {
            Ok(()) => {
                txn.commit().await?;
                debug!(
                    upserts = batch.upserts().len(),
                    removals = batch.removals().len(),
                    "committed batch"
                );
                Ok(())
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }
}

async fn write_batch<M>(txn: &DatabaseTransaction, batch: &WriteBatch) -> Result<(), StoreError>
where
    M: TreeNodeModel,
{
    if let Some(key) = M::forest_config().advisory_lock_strategy().key() {
        advisory_xact_lock(txn, key).await?;
    }

    for node in batch.upserts() {
        M::Entity::insert(M::active_from_node(node)?)
            .on_conflict(
                OnConflict::column(M::id_column())
                    .update_columns([
                        M::parent_column(),
                        M::priority_column(),
                        M::closure_column(),
                    ])
                    .to_owned(),
            )
            .exec(txn)
            .await?;
    }

    if !batch.removals().is_empty() {
        let ids = batch
            .removals()
            .iter()
            .map(|id| M::id_to_value(*id))
            .collect::<Result<Vec<_>, _>>()?;
        M::Entity::delete_many()
            .filter(M::id_column().is_in(ids))
            .exec(txn)
            .await?;
    }

    Ok(())
}

impl<M> TreeRepository<SeaOrmStore<M>>
where
    M: TreeNodeModel,
{
    /// Repository over `M`'s table using the configuration generated for `M`.
    pub fn for_model(db: DatabaseConnection) -> Self {
        TreeRepository::new(
            Arc::new(SeaOrmStore::<M>::new(db)),
            M::forest_config().clone(),
        )
    }
}
