//! Service adapter trait definition
//!
//! Defines the capability interface every third-party service adapter implements.
//! Adapters are stateful for the duration of one stage: the orchestrator builds a
//! fresh instance, hands it parameters, credentials and the `since` filter, then
//! calls the fetch or export method it needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Client, EntityType, Project, Task, TimeEntry, User};

/// Adapter-side failures, recorded into the run status by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("HTTP error {status}: {}", body.as_deref().unwrap_or("No body"))]
    Http { status: u16, body: Option<String> },
    #[error("network error: {details}")]
    Network { details: String },
    #[error("authentication error: {details}")]
    Authentication { details: String },
    #[error("rate limited by service")]
    RateLimited { retry_after: Option<u64> },
    #[error("invalid service parameters: {details}")]
    InvalidParams { details: String },
    #[error("invalid authorization data: {details}")]
    InvalidAuthData { details: String },
    #[error("{entity} are not supported by this service")]
    Unsupported { entity: EntityType },
    #[error("{details}")]
    Other { details: String },
}

#[async_trait]
pub trait Service: Send + Sync {
    /// Service identifier, matching the integration id.
    fn id(&self) -> &str;

    /// Validates and applies the pipe's opaque parameters.
    fn set_params(&mut self, params: &[u8]) -> Result<(), ServiceError>;

    /// Applies the stored credential blob.
    fn set_auth_data(&mut self, data: &[u8]) -> Result<(), ServiceError>;

    /// Restricts fetches to objects changed after `since`, where the service supports it.
    fn set_since(&mut self, since: Option<DateTime<Utc>>);

    /// ID mapping key for an entity type. May depend on parameters (e.g. an account id).
    fn key_for(&self, entity: EntityType) -> String {
        format!("{}:{}", self.id(), entity)
    }

    async fn users(&self) -> Result<Vec<User>, ServiceError> {
        Err(ServiceError::Unsupported {
            entity: EntityType::Users,
        })
    }

    async fn clients(&self) -> Result<Vec<Client>, ServiceError> {
        Err(ServiceError::Unsupported {
            entity: EntityType::Clients,
        })
    }

    async fn projects(&self) -> Result<Vec<Project>, ServiceError> {
        Err(ServiceError::Unsupported {
            entity: EntityType::Projects,
        })
    }

    async fn tasks(&self) -> Result<Vec<Task>, ServiceError> {
        Err(ServiceError::Unsupported {
            entity: EntityType::Tasks,
        })
    }

    async fn todo_lists(&self) -> Result<Vec<Task>, ServiceError> {
        Err(ServiceError::Unsupported {
            entity: EntityType::TodoLists,
        })
    }

    /// Creates or updates the entry in the foreign service, returning its foreign ID.
    async fn export_time_entry(&self, _entry: &TimeEntry) -> Result<String, ServiceError> {
        Err(ServiceError::Unsupported {
            entity: EntityType::TimeEntries,
        })
    }
}
