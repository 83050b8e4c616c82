//! Run status repository
//!
//! Persists the last [`RunStatus`] of each pipe as a JSON document keyed by
//! (workspace, pipe key).

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::error::StoreError;
use crate::models::run_status::{self, Entity as RunStatusEntity};
use crate::status::RunStatus;
use crate::types::{PipeId, WorkspaceId};

#[derive(Debug, Clone)]
pub struct RunStatusRepository {
    db: DatabaseConnection,
    log_host: String,
}

impl RunStatusRepository {
    pub fn new(db: DatabaseConnection, log_host: impl Into<String>) -> Self {
        Self {
            db,
            log_host: log_host.into(),
        }
    }

    pub async fn load(
        &self,
        workspace_id: WorkspaceId,
        pipe: &PipeId,
    ) -> Result<Option<RunStatus>, StoreError> {
        let row = RunStatusEntity::find_by_id((workspace_id, pipe.key()))
            .one(&self.db)
            .await?;
        row.map(|row| self.decode(row)).transpose()
    }

    /// All statuses stored for a workspace, keyed by pipe key.
    pub async fn list_for_workspace(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<(String, RunStatus)>, StoreError> {
        let rows = RunStatusEntity::find()
            .filter(run_status::Column::WorkspaceId.eq(workspace_id))
            .all(&self.db)
            .await?;
        rows.into_iter()
            .map(|row| {
                let key = row.key.clone();
                self.decode(row).map(|status| (key, status))
            })
            .collect()
    }

    /// Overwrites the stored status for the status's pipe.
    pub async fn save(&self, status: &RunStatus) -> Result<(), StoreError> {
        let data =
            serde_json::to_value(status).map_err(|err| StoreError::encode("run status", err))?;
        let row = run_status::ActiveModel {
            workspace_id: Set(status.workspace_id),
            key: Set(status.pipe_id().key()),
            data: Set(data),
            updated_at: Set(Utc::now().fixed_offset()),
        };

        RunStatusEntity::insert(row)
            .on_conflict(
                OnConflict::columns([run_status::Column::WorkspaceId, run_status::Column::Key])
                    .update_columns([run_status::Column::Data, run_status::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    /// Deletes within a caller-provided connection or transaction.
    pub async fn delete_with<C: ConnectionTrait>(
        conn: &C,
        workspace_id: WorkspaceId,
        pipe: &PipeId,
    ) -> Result<(), StoreError> {
        RunStatusEntity::delete_by_id((workspace_id, pipe.key()))
            .exec(conn)
            .await?;
        Ok(())
    }

    fn decode(&self, row: run_status::Model) -> Result<RunStatus, StoreError> {
        serde_json::from_value::<RunStatus>(row.data)
            .map(|status| status.with_log_host(self.log_host.clone()))
            .map_err(|err| StoreError::decode("run status", err))
    }
}
