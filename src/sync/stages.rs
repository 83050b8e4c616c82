//! Stage execution: fetch from the foreign service, post to the central one, and
//! the reverse direction for time entries.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::central::{CentralApi, CentralError, ImportResult};
use crate::error::SyncError;
use crate::integrations::Service;
use crate::repositories::IdMapping;
use crate::status::RunStatus;
use crate::sync::SyncOrchestrator;
use crate::sync::batch::adjust_request_size;
use crate::types::{Client, EntityType, ForeignObject, Project, Task, User, WorkspaceId};

/// A configured adapter plus the workspace token, ready for one stage.
pub(crate) struct Session {
    pub workspace_id: WorkspaceId,
    pub service: Box<dyn Service>,
    pub workspace_token: String,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Session {
    fn service_id(&self) -> &str {
        self.service.id()
    }

    fn adapter_error(&self, err: crate::integrations::ServiceError) -> SyncError {
        SyncError::adapter(self.service.id(), err)
    }
}

/// Objects the central service accepts in bulk.
#[async_trait]
pub(crate) trait Importable: ForeignObject + Serialize + Send + Sync + Sized + 'static {
    async fn post(
        central: &dyn CentralApi,
        entity: EntityType,
        token: &str,
        items: &[Self],
    ) -> Result<ImportResult<Self>, CentralError>;
}

#[async_trait]
impl Importable for User {
    async fn post(
        central: &dyn CentralApi,
        _entity: EntityType,
        token: &str,
        items: &[Self],
    ) -> Result<ImportResult<Self>, CentralError> {
        central.post_users(token, items).await
    }
}

#[async_trait]
impl Importable for Client {
    async fn post(
        central: &dyn CentralApi,
        _entity: EntityType,
        token: &str,
        items: &[Self],
    ) -> Result<ImportResult<Self>, CentralError> {
        central.post_clients(token, items).await
    }
}

#[async_trait]
impl Importable for Project {
    async fn post(
        central: &dyn CentralApi,
        _entity: EntityType,
        token: &str,
        items: &[Self],
    ) -> Result<ImportResult<Self>, CentralError> {
        central.post_projects(token, items).await
    }
}

#[async_trait]
impl Importable for Task {
    async fn post(
        central: &dyn CentralApi,
        entity: EntityType,
        token: &str,
        items: &[Self],
    ) -> Result<ImportResult<Self>, CentralError> {
        match entity {
            EntityType::TodoLists => central.post_todo_lists(token, items).await,
            _ => central.post_tasks(token, items).await,
        }
    }
}

/// Keeps items that are active or were imported before, filling in their local IDs.
///
/// A previously imported item that became inactive is still forwarded so the
/// central service can deactivate it.
pub fn select_forwarded<T: ForeignObject>(items: Vec<T>, mapping: &IdMapping) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|mut item| {
            let local_id = mapping.local_id(item.foreign_id());
            if !item.is_active() && local_id <= 0 {
                return None;
            }
            item.set_local_id(local_id);
            Some(item)
        })
        .collect()
}

impl SyncOrchestrator {
    pub(crate) async fn run_stage(
        &self,
        session: &Session,
        entity: EntityType,
        status: &mut RunStatus,
    ) -> Result<(), SyncError> {
        debug!(
            workspace_id = session.workspace_id,
            service_id = session.service_id(),
            %entity,
            "Running stage"
        );
        let service = session.service.as_ref();

        match entity {
            EntityType::Users => {
                let users = service.users().await.map_err(|e| session.adapter_error(e))?;
                self.import(session, entity, users, status).await
            }
            EntityType::Clients => {
                let clients = service
                    .clients()
                    .await
                    .map_err(|e| session.adapter_error(e))?;
                self.import(session, entity, clients, status).await
            }
            EntityType::Projects => {
                let mut projects = service
                    .projects()
                    .await
                    .map_err(|e| session.adapter_error(e))?;
                let clients = self
                    .mappings
                    .load(session.workspace_id, &service.key_for(EntityType::Clients))
                    .await?;
                for project in &mut projects {
                    project.client_id = project
                        .foreign_client_id
                        .as_deref()
                        .map(|foreign_id| clients.local_id(foreign_id))
                        .filter(|id| *id > 0);
                }
                self.import(session, entity, projects, status).await
            }
            EntityType::Tasks | EntityType::TodoLists => {
                let fetched = if entity == EntityType::Tasks {
                    service.tasks().await
                } else {
                    service.todo_lists().await
                };
                let tasks = fetched.map_err(|e| session.adapter_error(e))?;

                let projects = self
                    .mappings
                    .load(session.workspace_id, &service.key_for(EntityType::Projects))
                    .await?;
                let total = tasks.len();
                let tasks: Vec<Task> = tasks
                    .into_iter()
                    .filter_map(|mut task| {
                        task.project_id = projects.local_id(&task.foreign_project_id);
                        (task.project_id > 0).then_some(task)
                    })
                    .collect();
                if tasks.len() < total {
                    debug!(
                        skipped = total - tasks.len(),
                        %entity,
                        "Skipping items whose project was never imported"
                    );
                }
                self.import(session, entity, tasks, status).await
            }
            EntityType::TimeEntries => self.export_time_entries(session, status).await,
        }
    }

    async fn import<T: Importable>(
        &self,
        session: &Session,
        entity: EntityType,
        items: Vec<T>,
        status: &mut RunStatus,
    ) -> Result<(), SyncError> {
        let mut mapping = self
            .mappings
            .load(session.workspace_id, &session.service.key_for(entity))
            .await?;
        let forwarded = select_forwarded(items, &mapping);

        let result = self
            .post_batches(entity, &session.workspace_token, &forwarded)
            .await?;

        for item in &result.items {
            if item.local_id() > 0 && !item.foreign_id().is_empty() {
                mapping.insert(item.foreign_id(), item.local_id());
            }
        }
        self.mappings.save(&mapping).await?;

        counter!(
            "pipes_objects_imported_total",
            "service" => session.service_id().to_string(),
            "entity" => entity.as_str()
        )
        .increment(result.items.len() as u64);
        status.complete(entity, result.notifications, result.items.len());
        Ok(())
    }

    async fn post_batches<T: Importable>(
        &self,
        entity: EntityType,
        token: &str,
        items: &[T],
    ) -> Result<ImportResult<T>, SyncError> {
        let mut merged = ImportResult::default();
        for chunk in adjust_request_size(items, self.config.max_payload_bytes)? {
            let result = T::post(self.central.as_ref(), entity, token, chunk).await?;
            merged.merge(result);
        }
        Ok(merged)
    }

    /// Exports central time entries to the foreign service one by one.
    ///
    /// A failed entry is reported and skipped; the rest are still attempted and only
    /// exported entries are added to the mapping.
    async fn export_time_entries(
        &self,
        session: &Session,
        status: &mut RunStatus,
    ) -> Result<(), SyncError> {
        let ws = session.workspace_id;
        let service = session.service.as_ref();

        let users = self
            .mappings
            .load_reversed(ws, &service.key_for(EntityType::Users))
            .await?;
        if users.is_empty() {
            status.complete(
                EntityType::TimeEntries,
                vec!["No users have been imported yet, so no time entries were exported".to_string()],
                0,
            );
            return Ok(());
        }
        let projects = self
            .mappings
            .load_reversed(ws, &service.key_for(EntityType::Projects))
            .await?;
        let tasks = self
            .mappings
            .load_reversed(ws, &service.key_for(EntityType::Tasks))
            .await?;
        let mut exported_ids = self
            .mappings
            .load(ws, &service.key_for(EntityType::TimeEntries))
            .await?;
        let previously_exported = exported_ids.reversed();

        let since = session
            .last_sync
            .unwrap_or_else(|| Utc::now() - Duration::days(self.config.time_entries_lookback_days));
        let entries = self
            .central
            .get_time_entries(
                &session.workspace_token,
                since,
                &users.local_ids(),
                &projects.local_ids(),
            )
            .await?;

        let mut notifications = Vec::new();
        let mut exported = 0;
        for mut entry in entries {
            entry.foreign_id = previously_exported.get(entry.id).map(str::to_string);
            entry.foreign_user_id = users.get(entry.user_id).map(str::to_string);
            entry.foreign_project_id = entry
                .project_id
                .and_then(|id| projects.get(id))
                .map(str::to_string);
            entry.foreign_task_id = entry
                .task_id
                .and_then(|id| tasks.get(id))
                .map(str::to_string);

            match service.export_time_entry(&entry).await {
                Ok(foreign_id) => {
                    exported_ids.insert(foreign_id, entry.id);
                    exported += 1;
                }
                Err(err) => {
                    let err = session.adapter_error(err);
                    warn!(
                        workspace_id = ws,
                        time_entry_id = entry.id,
                        error = %err,
                        "Time entry export failed"
                    );
                    self.notifier.notify(
                        &err,
                        json!({
                            "workspace_id": ws,
                            "service_id": session.service_id(),
                            "time_entry_id": entry.id,
                        }),
                    );
                    notifications.push(format!("Time entry {} was not exported: {}", entry.id, err));
                }
            }
        }

        if exported > 0 {
            self.mappings.save(&exported_ids).await?;
        }
        counter!(
            "pipes_time_entries_exported_total",
            "service" => session.service_id().to_string()
        )
        .increment(exported as u64);
        status.complete(EntityType::TimeEntries, notifications, exported);
        Ok(())
    }
}
