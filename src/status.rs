//! # Run Status
//!
//! Outcome record for the most recent run of a pipe. A run starts `running` and
//! ends in `success` or `error`; once a run has failed, later stage completions
//! leave the record untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityType, PipeId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Success,
    Error,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub workspace_id: WorkspaceId,
    pub service_id: String,
    pub entity: EntityType,
    pub state: RunState,
    #[serde(default)]
    pub message: String,
    /// Per-stage counts in completion order, e.g. `"3 projects"`
    #[serde(default)]
    pub object_counts: Vec<String>,
    #[serde(default)]
    pub notifications: Vec<String>,
    #[serde(default)]
    pub sync_log: String,
    pub sync_date: DateTime<Utc>,
    #[serde(skip)]
    log_host: String,
}

impl RunStatus {
    /// Fresh `running` record for a run that begins now.
    pub fn start(
        workspace_id: WorkspaceId,
        service_id: impl Into<String>,
        entity: EntityType,
        log_host: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id,
            service_id: service_id.into(),
            entity,
            state: RunState::Running,
            message: String::new(),
            object_counts: Vec::new(),
            notifications: Vec::new(),
            sync_log: String::new(),
            sync_date: Utc::now(),
            log_host: log_host.into(),
        }
    }

    pub fn pipe_id(&self) -> PipeId {
        PipeId::new(self.service_id.clone(), self.entity)
    }

    pub fn is_error(&self) -> bool {
        self.state == RunState::Error
    }

    /// Marks the run failed. The first failure's message is kept.
    pub fn fail(&mut self, err: &dyn std::error::Error) {
        if self.state == RunState::Error {
            return;
        }
        self.state = RunState::Error;
        self.message = err.to_string();
    }

    /// Records a finished stage. No-op once the run has failed.
    pub fn complete(&mut self, entity: EntityType, notifications: Vec<String>, count: usize) {
        if self.state == RunState::Error {
            return;
        }

        self.state = RunState::Success;
        self.notifications.extend(notifications);
        if count > 0 {
            self.object_counts.push(format!("{count} {entity}"));
        }
        self.sync_log = format!(
            "{}/api/v1/integrations/{}/pipes/{}/log",
            self.log_host.trim_end_matches('/'),
            self.service_id,
            self.entity
        );
        self.message = if self.object_counts.is_empty() {
            format!("No new {} were found", self.entity)
        } else {
            format!(
                "{} successfully {}",
                self.object_counts.join(", "),
                self.direction()
            )
        };
    }

    fn direction(&self) -> &'static str {
        match self.entity {
            EntityType::TimeEntries => "exported",
            _ => "imported",
        }
    }

    /// Renders the human-readable log for this status.
    pub fn generate_log(&self) -> String {
        self.generate_log_at(Utc::now())
    }

    pub fn generate_log_at(&self, now: DateTime<Utc>) -> String {
        let parts = [
            format!(
                "Log for {} {} ({})",
                self.service_id,
                self.entity,
                now.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            "-".repeat(80),
            self.message.clone(),
            self.notifications.join("\r\n"),
        ];
        parts.join("\r\n")
    }

    /// Reattaches the log host after a status was decoded from storage.
    pub(crate) fn with_log_host(mut self, host: impl Into<String>) -> Self {
        self.log_host = host.into();
        self
    }
}
