//! # Sync Orchestrator
//!
//! Runs one pipe at a time per workspace: plans the dependency stages for the
//! pipe's entity type, opens a fresh adapter session for each stage, and records
//! the outcome in the pipe's [`RunStatus`].

pub mod batch;
pub mod locks;
pub mod pipeline;
pub mod stages;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde_json::json;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::central::CentralApi;
use crate::config::{AppConfig, SyncConfig};
use crate::error::{ErrorKind, SyncError};
use crate::integrations::{Integration, RegistryError, ServiceRegistry};
use crate::queue::{JobQueue, QueueEntry};
use crate::repositories::{
    CredentialStore, IdMappingRepository, Pipe, PipeRepository, RunStatusRepository,
};
use crate::status::RunStatus;
use crate::telemetry::ErrorNotifier;
use crate::types::{EntityType, PipeId, WorkspaceId};

pub use batch::{BatchError, adjust_request_size};
pub use locks::WorkspaceLocks;
pub use stages::select_forwarded;

use stages::Session;

/// Result of a manual run request.
#[derive(Debug, Clone, PartialEq)]
pub enum RunNowOutcome {
    /// The run finished within the wait window
    Finished(RunStatus),
    /// The run is still going in the background
    InProgress,
    /// The pipe was queued at manual priority
    Queued,
}

/// An integration as seen by one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceIntegration {
    pub integration: Integration,
    pub authorized: bool,
    pub pipes: Vec<Pipe>,
}

pub struct SyncOrchestrator {
    registry: Arc<ServiceRegistry>,
    pipes: PipeRepository,
    statuses: RunStatusRepository,
    pub(crate) mappings: IdMappingRepository,
    credentials: CredentialStore,
    queue: JobQueue,
    pub(crate) central: Arc<dyn CentralApi>,
    pub(crate) notifier: Arc<dyn ErrorNotifier>,
    locks: WorkspaceLocks,
    pub(crate) config: SyncConfig,
    log_host: String,
}

impl SyncOrchestrator {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<ServiceRegistry>,
        credentials: CredentialStore,
        central: Arc<dyn CentralApi>,
        notifier: Arc<dyn ErrorNotifier>,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            pipes: PipeRepository::new(db.clone()),
            statuses: RunStatusRepository::new(db.clone(), config.sync_log_host.clone()),
            mappings: IdMappingRepository::new(db.clone()),
            credentials,
            queue: JobQueue::new(
                db,
                config.scheduler.claim_batch_size,
                config.scheduler.claim_lease_seconds,
            ),
            central,
            notifier,
            locks: WorkspaceLocks::new(),
            config: config.sync.clone(),
            log_host: config.sync_log_host.clone(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Creates or updates a pipe after checking the integration offers the entity
    /// type and the adapter accepts the parameters.
    pub async fn configure_pipe(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
        automatic: bool,
        service_params: Option<Vec<u8>>,
    ) -> Result<Pipe, SyncError> {
        let integration = self.supported_integration(id)?;
        if automatic && !integration.pipe(id.entity).is_some_and(|p| p.automatic_option) {
            return Err(SyncError::Validation(format!(
                "{} {} cannot run automatically",
                id.service_id, id.entity
            )));
        }
        if let Some(params) = &service_params {
            let mut service = self.registry.create(&id.service_id)?;
            service
                .set_params(params)
                .map_err(|err| SyncError::Validation(err.to_string()))?;
        }

        let mut pipe = self
            .pipes
            .find(workspace_id, id)
            .await?
            .unwrap_or_else(|| Pipe::new(workspace_id, id.clone()));
        pipe.automatic = automatic;
        if service_params.is_some() {
            pipe.service_params = service_params;
        }
        self.pipes.save(&pipe).await?;
        pipe.configured = true;

        info!(workspace_id, pipe = %id, automatic, "Configured pipe");
        Ok(pipe)
    }

    /// The pipe with its last status, or an unconfigured placeholder.
    pub async fn pipe(&self, workspace_id: WorkspaceId, id: &PipeId) -> Result<Pipe, SyncError> {
        self.supported_integration(id)?;
        let mut pipe = self
            .pipes
            .find(workspace_id, id)
            .await?
            .unwrap_or_else(|| Pipe::new(workspace_id, id.clone()));
        pipe.status = self.statuses.load(workspace_id, id).await?;
        Ok(pipe)
    }

    /// Configured pipes of a workspace with their last statuses.
    pub async fn list_pipes(&self, workspace_id: WorkspaceId) -> Result<Vec<Pipe>, SyncError> {
        let mut statuses: HashMap<String, RunStatus> = self
            .statuses
            .list_for_workspace(workspace_id)
            .await?
            .into_iter()
            .collect();
        let mut pipes = self.pipes.list_for_workspace(workspace_id).await?;
        for pipe in &mut pipes {
            pipe.status = statuses.remove(&pipe.id.key());
        }
        Ok(pipes)
    }

    /// Every integration with the workspace's authorization state and pipes.
    pub async fn workspace_integrations(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Vec<WorkspaceIntegration>, SyncError> {
        let authorized = self
            .credentials
            .list_authorized_services(workspace_id)
            .await?;
        let mut configured: HashMap<String, Pipe> = self
            .list_pipes(workspace_id)
            .await?
            .into_iter()
            .map(|pipe| (pipe.id.key(), pipe))
            .collect();

        Ok(self
            .registry
            .integrations()
            .map(|integration| {
                let pipes = integration
                    .pipes
                    .iter()
                    .map(|offered| {
                        let id = PipeId::new(integration.id.clone(), offered.id);
                        configured
                            .remove(&id.key())
                            .unwrap_or_else(|| Pipe::new(workspace_id, id))
                    })
                    .collect();
                WorkspaceIntegration {
                    integration: integration.clone(),
                    authorized: authorized.contains(&integration.id),
                    pipes,
                }
            })
            .collect())
    }

    /// Rendered log of the pipe's last run, if it ever ran.
    pub async fn pipe_log(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
    ) -> Result<Option<String>, SyncError> {
        Ok(self
            .statuses
            .load(workspace_id, id)
            .await?
            .map(|status| status.generate_log()))
    }

    /// Deletes the pipe together with its status, ID mapping and pending queue entry.
    pub async fn delete_pipe(&self, workspace_id: WorkspaceId, id: &PipeId) -> Result<(), SyncError> {
        let _guard = self.locks.acquire(workspace_id).await;

        let pipe = self
            .pipes
            .find(workspace_id, id)
            .await?
            .ok_or_else(|| not_configured(workspace_id, id))?;
        let mapping_key = self.mapping_key(&pipe)?;
        self.pipes.delete(workspace_id, id, &mapping_key).await?;

        info!(workspace_id, pipe = %id, "Deleted pipe");
        Ok(())
    }

    /// Runs a claimed queue entry.
    pub async fn run_queued(&self, entry: &QueueEntry) -> Result<RunStatus, SyncError> {
        self.run_pipe(entry.workspace_id, &entry.pipe).await
    }

    /// Manual trigger.
    ///
    /// User pipes run right away on a background task and the call waits up to the
    /// configured window for the result. Other pipes, and user pipes of a workspace
    /// that already has a run in flight, are queued at manual priority.
    pub async fn run_now(
        self: &Arc<Self>,
        workspace_id: WorkspaceId,
        id: &PipeId,
    ) -> Result<RunNowOutcome, SyncError> {
        if self.pipes.find(workspace_id, id).await?.is_none() {
            return Err(not_configured(workspace_id, id));
        }

        if id.entity != EntityType::Users {
            self.queue.boost_and_enqueue(workspace_id, id).await?;
            return Ok(RunNowOutcome::Queued);
        }

        // Credential problems are reported to the caller instead of the status.
        let mut auth = self.credentials.load(workspace_id, &id.service_id).await?;
        self.credentials.refresh_if_needed(&mut auth).await?;

        // The queue row makes the run visible to claimants in other processes.
        let claimant = format!("manual-{}", Uuid::new_v4().simple());
        let Some(entry) = self.queue.claim_direct(workspace_id, id, &claimant).await? else {
            self.queue.boost_and_enqueue(workspace_id, id).await?;
            return Ok(RunNowOutcome::Queued);
        };

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = this.run_queued(&entry).await;
            if let Err(err) = this.queue.mark_complete(entry.id, &entry.claimed_by).await {
                warn!(entry_id = %entry.id, error = %err, "Could not finish manual queue entry");
            }
            result
        });

        match timeout(Duration::from_millis(self.config.run_now_wait_ms), handle).await {
            Ok(Ok(result)) => result.map(RunNowOutcome::Finished),
            Ok(Err(join_err)) => Err(SyncError::Interrupted(join_err.to_string())),
            Err(_) => {
                debug!(workspace_id, pipe = %id, "Manual run still in progress");
                Ok(RunNowOutcome::InProgress)
            }
        }
    }

    /// Runs a pipe while holding its workspace lock.
    pub async fn run_pipe(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
    ) -> Result<RunStatus, SyncError> {
        let _guard = self.locks.acquire(workspace_id).await;
        self.run_locked(workspace_id, id).await
    }

    #[instrument(skip(self, id), fields(pipe = %id))]
    async fn run_locked(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
    ) -> Result<RunStatus, SyncError> {
        let pipe = self
            .pipes
            .find(workspace_id, id)
            .await?
            .ok_or_else(|| not_configured(workspace_id, id))?;

        let started_at = Utc::now();
        let timer = Instant::now();
        let mut status = RunStatus::start(
            workspace_id,
            id.service_id.clone(),
            id.entity,
            self.log_host.clone(),
        );
        self.statuses.save(&status).await?;

        if let Err(err) = self.execute(&pipe, &mut status).await {
            status.fail(&err);
            if err.kind() == ErrorKind::Store {
                if let Err(save_err) = self.statuses.save(&status).await {
                    warn!(error = %save_err, "Could not record failed run status");
                }
                self.record_run(id, "store_error", timer);
                return Err(err);
            }
            warn!(error = %err, kind = err.kind().as_str(), "Pipe run failed");
            self.notifier.notify(
                &err,
                json!({
                    "workspace_id": workspace_id,
                    "service_id": id.service_id,
                    "entity": id.entity,
                    "kind": err.kind().as_str(),
                }),
            );
        }

        self.statuses.save(&status).await?;
        if status.is_error() {
            self.record_run(id, "error", timer);
        } else {
            self.pipes
                .update_last_sync(workspace_id, id, started_at)
                .await?;
            self.record_run(id, "success", timer);
            info!(message = %status.message, "Pipe run finished");
        }
        Ok(status)
    }

    async fn execute(&self, pipe: &Pipe, status: &mut RunStatus) -> Result<(), SyncError> {
        for entity in pipeline::plan(pipe.id.entity) {
            // Earlier stages may have refreshed the token, so every stage reloads.
            let session = self
                .open_session(pipe.workspace_id, &pipe.id, pipe.last_sync)
                .await?;
            self.run_stage(&session, entity, status).await?;
        }
        Ok(())
    }

    async fn open_session(
        &self,
        workspace_id: WorkspaceId,
        id: &PipeId,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Session, SyncError> {
        let pipe = self
            .pipes
            .find(workspace_id, id)
            .await?
            .ok_or_else(|| not_configured(workspace_id, id))?;
        let mut auth = self.credentials.load(workspace_id, &id.service_id).await?;
        self.credentials.refresh_if_needed(&mut auth).await?;

        let mut service = self.registry.create(&id.service_id)?;
        if let Some(params) = &pipe.service_params {
            service
                .set_params(params)
                .map_err(|err| SyncError::Validation(err.to_string()))?;
        }
        service
            .set_auth_data(&auth.data)
            .map_err(|err| SyncError::adapter(&id.service_id, err))?;
        service.set_since(last_sync);

        Ok(Session {
            workspace_id,
            service,
            workspace_token: auth.workspace_token,
            last_sync,
        })
    }

    fn mapping_key(&self, pipe: &Pipe) -> Result<String, SyncError> {
        let mut service = match self.registry.create(&pipe.id.service_id) {
            Ok(service) => service,
            Err(RegistryError::AdapterNotFound { .. }) => return Ok(pipe.id.key()),
            Err(err) => return Err(err.into()),
        };
        if let Some(params) = &pipe.service_params {
            service
                .set_params(params)
                .map_err(|err| SyncError::Validation(err.to_string()))?;
        }
        Ok(service.key_for(pipe.id.entity))
    }

    fn supported_integration(&self, id: &PipeId) -> Result<&Integration, SyncError> {
        let integration = self.registry.integration(&id.service_id)?;
        if !integration.supports(id.entity) {
            return Err(SyncError::Validation(format!(
                "{} does not offer {}",
                integration.name, id.entity
            )));
        }
        Ok(integration)
    }

    fn record_run(&self, id: &PipeId, outcome: &'static str, timer: Instant) {
        counter!(
            "pipes_runs_total",
            "service" => id.service_id.clone(),
            "entity" => id.entity.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("pipes_run_duration_ms", "entity" => id.entity.as_str())
            .record(timer.elapsed().as_secs_f64() * 1_000.0);
    }
}

fn not_configured(workspace_id: WorkspaceId, id: &PipeId) -> SyncError {
    SyncError::NotConfigured {
        workspace_id,
        pipe: id.key(),
    }
}
