mod common;

use std::collections::BTreeMap;

use closure_forest::{NodeId, NodeStore, SeaOrmStore, StoreError, TreeNodeModel};
use common::entity::category;
use sea_orm::{DatabaseBackend, MockDatabase, Value};
use serde_json::json;

fn row(id: i32, parent_id: Option<i32>, closure_cache: serde_json::Value) -> category::Model {
    category::Model {
        id,
        parent_id,
        priority: 3,
        name: format!("category {id}"),
        closure_cache,
    }
}

fn built_closure() -> serde_json::Value {
    json!({
        "ancestor_ids": [1],
        "descendant_ids": [],
        "depth": 1,
        "height": 0,
        "order_index": 1,
        "tree_id": 1
    })
}

#[tokio::test]
async fn rows_decode_into_nodes() -> Result<(), StoreError> {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![row(2, Some(1), built_closure())]])
        .append_query_results([vec![row(1, None, json!(null)), row(5, None, json!(null))]])
        .into_connection();
    let store = SeaOrmStore::<category::Model>::new(db);

    let node = store.get(NodeId::new(2)).await?.expect("row decoded");
    assert_eq!(node.parent_id(), Some(NodeId::new(1)));
    assert_eq!(node.priority(), 3);
    assert_eq!(node.closure().ancestor_ids(), &[NodeId::new(1)]);
    assert_eq!(node.closure().tree_id(), Some(NodeId::new(1)));

    let roots = store.all_roots().await?;
    assert_eq!(roots.len(), 2);
    assert!(roots.iter().all(|root| !root.closure().is_built()));
    Ok(())
}

#[tokio::test]
async fn ids_come_from_the_serial_sequence() -> Result<(), StoreError> {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([[BTreeMap::from([("id", Value::BigInt(Some(42)))])]])
        .into_connection();
    let store = SeaOrmStore::<category::Model>::new(db);

    assert_eq!(store.allocate_id().await?, NodeId::new(42));
    Ok(())
}

#[tokio::test]
async fn malformed_closure_column_is_reported() {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![row(2, Some(1), json!({"depth": "deep"}))]])
        .into_connection();
    let store = SeaOrmStore::<category::Model>::new(db);

    let err = store.filter_by_parent(NodeId::new(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::Serialization(_)));
}

#[tokio::test]
async fn empty_bulk_read_skips_the_database() -> Result<(), StoreError> {
    let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
    let store = SeaOrmStore::<category::Model>::new(db);
    assert!(store.get_many(&[]).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn non_postgres_connections_are_refused() {
    let db = MockDatabase::new(DatabaseBackend::MySql).into_connection();
    let store = SeaOrmStore::<category::Model>::new(db);
    assert!(matches!(
        store.get(NodeId::new(1)).await,
        Err(StoreError::Unavailable(_))
    ));
}

#[test]
fn derived_model_maps_nodes_to_rows() -> Result<(), StoreError> {
    let config = category::Model::forest_config();
    assert_eq!(config.entity_name(), "Category");
    assert_eq!(config.table_name(), "categories");
    assert_eq!(config.id_column(), "id");

    let node = row(7, Some(1), built_closure()).into_node()?;
    let active = category::Model::active_from_node(&node)?;
    assert_eq!(active.id, sea_orm::ActiveValue::Set(7));
    assert_eq!(active.parent_id, sea_orm::ActiveValue::Set(Some(1)));
    assert_eq!(active.priority, sea_orm::ActiveValue::Set(3));
    assert_eq!(active.closure_cache, sea_orm::ActiveValue::Set(built_closure()));
    assert!(matches!(active.name, sea_orm::ActiveValue::NotSet));

    assert!(matches!(
        category::Model::id_to_value(NodeId::new(i64::MAX)),
        Err(StoreError::OutOfRange { field: "id", .. })
    ));
    Ok(())
}
