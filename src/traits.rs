use sea_orm::{ActiveModelBehavior, ActiveModelTrait, EntityTrait, FromQueryResult, Value};

use crate::config::ForestConfig;
use crate::error::StoreError;
use crate::node::{Node, NodeId};

/// Trait implemented by SeaORM `Model` types whose rows are forest nodes.
///
/// Implementations are normally provided by the `#[derive(TreeNodeModel)]` macro.
/// Only the structural columns and the closure column are written through this
/// trait; any other column belongs to the application.
pub trait TreeNodeModel: Clone + Send + Sync + 'static + FromQueryResult {
    type Entity: EntityTrait<Model = Self>;
    type ActiveModel: ActiveModelTrait<Entity = Self::Entity> + ActiveModelBehavior + Send;

    fn forest_config() -> &'static ForestConfig;

    fn id_column() -> <Self::Entity as EntityTrait>::Column;
    fn parent_column() -> <Self::Entity as EntityTrait>::Column;
    fn priority_column() -> <Self::Entity as EntityTrait>::Column;
    fn closure_column() -> <Self::Entity as EntityTrait>::Column;

    fn id_to_value(id: NodeId) -> Result<Value, StoreError>;

    fn into_node(self) -> Result<Node, StoreError>;
    fn active_from_node(node: &Node) -> Result<Self::ActiveModel, StoreError>;
}
