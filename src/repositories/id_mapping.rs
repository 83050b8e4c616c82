//! ID mapping repository
//!
//! Foreign ID to local ID maps per (workspace, adapter mapping key). Saves write the
//! whole map; callers load, mutate and save within one run.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, Set};

use crate::error::StoreError;
use crate::models::id_mapping::{self, Entity as IdMappingEntity};
use crate::types::WorkspaceId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    pub workspace_id: WorkspaceId,
    pub key: String,
    pub data: BTreeMap<String, i64>,
}

impl IdMapping {
    pub fn new(workspace_id: WorkspaceId, key: impl Into<String>) -> Self {
        Self {
            workspace_id,
            key: key.into(),
            data: BTreeMap::new(),
        }
    }

    /// Local ID for a foreign ID, or 0 when unmapped.
    pub fn local_id(&self, foreign_id: &str) -> i64 {
        self.data.get(foreign_id).copied().unwrap_or(0)
    }

    /// Later writes for the same foreign ID replace earlier ones.
    pub fn insert(&mut self, foreign_id: impl Into<String>, local_id: i64) {
        self.data.insert(foreign_id.into(), local_id);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn reversed(&self) -> ReversedIdMapping {
        ReversedIdMapping {
            data: self
                .data
                .iter()
                .map(|(foreign_id, local_id)| (*local_id, foreign_id.clone()))
                .collect(),
        }
    }
}

/// Read-only local ID to foreign ID view of an [`IdMapping`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversedIdMapping {
    data: HashMap<i64, String>,
}

impl ReversedIdMapping {
    pub fn get(&self, local_id: i64) -> Option<&str> {
        self.data.get(&local_id).map(String::as_str)
    }

    pub fn local_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.data.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IdMappingRepository {
    db: DatabaseConnection,
}

impl IdMappingRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Stored mapping, or an empty one if nothing was saved yet.
    pub async fn load(&self, workspace_id: WorkspaceId, key: &str) -> Result<IdMapping, StoreError> {
        let Some(row) = IdMappingEntity::find_by_id((workspace_id, key.to_string()))
            .one(&self.db)
            .await?
        else {
            return Ok(IdMapping::new(workspace_id, key));
        };

        let data: BTreeMap<String, i64> = serde_json::from_value(row.data)
            .map_err(|err| StoreError::decode("id mapping", err))?;
        Ok(IdMapping {
            workspace_id,
            key: key.to_string(),
            data,
        })
    }

    pub async fn load_reversed(
        &self,
        workspace_id: WorkspaceId,
        key: &str,
    ) -> Result<ReversedIdMapping, StoreError> {
        Ok(self.load(workspace_id, key).await?.reversed())
    }

    pub async fn save(&self, mapping: &IdMapping) -> Result<(), StoreError> {
        let data = serde_json::to_value(&mapping.data)
            .map_err(|err| StoreError::encode("id mapping", err))?;
        let row = id_mapping::ActiveModel {
            workspace_id: Set(mapping.workspace_id),
            key: Set(mapping.key.clone()),
            data: Set(data),
            updated_at: Set(Utc::now().fixed_offset()),
        };

        IdMappingEntity::insert(row)
            .on_conflict(
                OnConflict::columns([id_mapping::Column::WorkspaceId, id_mapping::Column::Key])
                    .update_columns([id_mapping::Column::Data, id_mapping::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, workspace_id: WorkspaceId, key: &str) -> Result<(), StoreError> {
        Self::delete_with(&self.db, workspace_id, key).await
    }

    /// Deletes within a caller-provided connection or transaction.
    pub async fn delete_with<C: ConnectionTrait>(
        conn: &C,
        workspace_id: WorkspaceId,
        key: &str,
    ) -> Result<(), StoreError> {
        IdMappingEntity::delete_by_id((workspace_id, key.to_string()))
            .exec(conn)
            .await?;
        Ok(())
    }
}
