//! IdMapping entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// Foreign ID to local ID map for one adapter mapping key within a workspace
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "id_mappings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub workspace_id: i64,

    /// Mapping key produced by the adapter's `key_for`
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// JSON object of foreign ID -> local ID
    #[sea_orm(column_type = "JsonBinary")]
    pub data: JsonValue,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
