//! QueuedPipe entity model
//!
//! This module contains the SeaORM entity model for the queued_pipes table,
//! the leased work queue of pending pipe runs.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Queue entry for one pipe run
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "queued_pipes")]
pub struct Model {
    /// Unique identifier for the entry (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Workspace the pipe belongs to
    pub workspace_id: i64,

    /// Pipe key in the form `<service>:<entity>`
    pub pipe_key: String,

    /// Claim priority (higher values are claimed first)
    pub priority: i16,

    /// Enqueue time, used as the age tie-breaker
    pub created_at: DateTimeWithTimeZone,

    /// Set when a worker claims the entry
    pub claimed_at: Option<DateTimeWithTimeZone>,

    /// Identifier of the claiming worker
    pub claimed_by: Option<String>,

    /// Set when the claiming worker finished the run
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
