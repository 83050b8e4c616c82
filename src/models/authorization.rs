//! Authorization entity model
//!
//! Stores the workspace token and the OAuth credential blob for a
//! (workspace, service) pair.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "authorizations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub workspace_id: i64,

    #[sea_orm(primary_key, auto_increment = false)]
    pub service_id: String,

    /// Token used to call the central service on behalf of the workspace
    pub workspace_token: String,

    /// Serialized OAuth1 or OAuth2 credential, shape depends on the integration's auth type
    pub data: Vec<u8>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
