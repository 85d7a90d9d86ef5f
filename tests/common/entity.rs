pub mod category {
    use closure_forest::TreeNodeModelDerive as TreeNodeModel;
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, TreeNodeModel)]
    #[sea_orm(table_name = "categories")]
    #[tree_node(closure_field = "closure_cache", entity_name = "Category")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub parent_id: Option<i32>,
        pub priority: i32,
        pub name: String,
        pub closure_cache: Json,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
