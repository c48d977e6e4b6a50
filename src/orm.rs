#[allow(warnings, clippy::all)]
pub(crate) mod kv_entry {
    use sea_orm::entity::prelude::*;

    #[sea_orm::model]
    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "kv_entries")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub key: String,
        #[sea_orm(column_type = "Text")]
        pub value: String,
        pub expires_at_ms: Option<i64>,
    }

    impl ActiveModelBehavior for ActiveModel {}
}
