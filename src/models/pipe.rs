//! Pipe entity model
//!
//! One row per configured (workspace, service, entity type) sync channel.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pipes")]
pub struct Model {
    /// Workspace owning the pipe
    #[sea_orm(primary_key, auto_increment = false)]
    pub workspace_id: i64,

    /// Pipe key in the form `<service>:<entity>`
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    pub service_id: String,

    pub entity_type: String,

    /// Whether scheduled sweeps enqueue this pipe
    pub automatic: bool,

    /// Adapter-specific parameters, opaque to the engine
    pub service_params: Option<Vec<u8>>,

    /// Start time of the last successful run
    pub last_sync: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
