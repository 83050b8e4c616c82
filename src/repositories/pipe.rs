//! Pipe repository
//!
//! Configured sync channels per workspace. Deleting a pipe also removes its run
//! status, its ID mapping and any pending queue entry in one transaction.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::debug;

use crate::error::StoreError;
use crate::models::pipe::{self, Entity as PipeEntity};
use crate::models::queued_pipe::{self, Entity as QueuedPipeEntity};
use crate::repositories::{IdMappingRepository, RunStatusRepository};
use crate::status::RunStatus;
use crate::types::{PipeId, WorkspaceId};

/// A sync channel for one (workspace, service, entity type).
#[derive(Debug, Clone, PartialEq)]
pub struct Pipe {
    pub workspace_id: WorkspaceId,
    pub id: PipeId,
    /// True once the pipe has been explicitly configured and stored
    pub configured: bool,
    pub automatic: bool,
    pub service_params: Option<Vec<u8>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
}

impl Pipe {
    /// Unconfigured pipe with default settings.
    pub fn new(workspace_id: WorkspaceId, id: PipeId) -> Self {
        Self {
            workspace_id,
            id,
            configured: false,
            automatic: false,
            service_params: None,
            last_sync: None,
            status: None,
        }
    }

    fn from_model(row: pipe::Model) -> Result<Self, StoreError> {
        let id = PipeId::parse(&row.key).map_err(|err| StoreError::decode("pipe key", err))?;
        Ok(Self {
            workspace_id: row.workspace_id,
            id,
            configured: true,
            automatic: row.automatic,
            service_params: row.service_params,
            last_sync: row.last_sync.map(|at| at.with_timezone(&Utc)),
            status: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipeRepository {
    db: DatabaseConnection,
}

impl PipeRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
    ) -> Result<Option<Pipe>, StoreError> {
        PipeEntity::find_by_id((workspace_id, id.key()))
            .one(&self.db)
            .await?
            .map(Pipe::from_model)
            .transpose()
    }

    /// Inserts the pipe or updates its settings. `created_at` is kept on update.
    pub async fn save(&self, pipe: &Pipe) -> Result<(), StoreError> {
        let now = Utc::now().fixed_offset();
        let row = pipe::ActiveModel {
            workspace_id: Set(pipe.workspace_id),
            key: Set(pipe.id.key()),
            service_id: Set(pipe.id.service_id.clone()),
            entity_type: Set(pipe.id.entity.as_str().to_string()),
            automatic: Set(pipe.automatic),
            service_params: Set(pipe.service_params.clone()),
            last_sync: Set(pipe.last_sync.map(|at| at.fixed_offset())),
            created_at: Set(now),
            updated_at: Set(now),
        };

        PipeEntity::insert(row)
            .on_conflict(
                OnConflict::columns([pipe::Column::WorkspaceId, pipe::Column::Key])
                    .update_columns([
                        pipe::Column::Automatic,
                        pipe::Column::ServiceParams,
                        pipe::Column::LastSync,
                        pipe::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    /// Every automatic pipe across all workspaces.
    pub async fn list_automatic(&self) -> Result<Vec<Pipe>, StoreError> {
        PipeEntity::find()
            .filter(pipe::Column::Automatic.eq(true))
            .order_by_asc(pipe::Column::WorkspaceId)
            .order_by_asc(pipe::Column::Key)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Pipe::from_model)
            .collect()
    }

    pub async fn list_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<Pipe>, StoreError> {
        PipeEntity::find()
            .filter(pipe::Column::WorkspaceId.eq(workspace_id))
            .order_by_asc(pipe::Column::Key)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Pipe::from_model)
            .collect()
    }

    pub async fn update_last_sync(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        PipeEntity::update_many()
            .col_expr(pipe::Column::LastSync, Expr::value(at.fixed_offset()))
            .col_expr(
                pipe::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(pipe::Column::WorkspaceId.eq(workspace_id))
            .filter(pipe::Column::Key.eq(id.key()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Removes the pipe with its status, ID mapping and pending queue entry.
    ///
    /// Returns false when no pipe row existed.
    pub async fn delete(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
        mapping_key: &str,
    ) -> Result<bool, StoreError> {
        let txn = self.db.begin().await?;

        let deleted = PipeEntity::delete_by_id((workspace_id, id.key()))
            .exec(&txn)
            .await?
            .rows_affected;
        RunStatusRepository::delete_with(&txn, workspace_id, id).await?;
        IdMappingRepository::delete_with(&txn, workspace_id, mapping_key).await?;
        QueuedPipeEntity::delete_many()
            .filter(queued_pipe::Column::WorkspaceId.eq(workspace_id))
            .filter(queued_pipe::Column::PipeKey.eq(id.key()))
            .filter(queued_pipe::Column::ClaimedAt.is_null())
            .exec(&txn)
            .await?;

        txn.commit().await?;
        debug!(workspace_id, pipe = %id, deleted, "Deleted pipe");
        Ok(deleted > 0)
    }
}
