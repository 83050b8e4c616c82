//! # Error Handling
//!
//! Error taxonomy for the sync engine. Persistence failures are `StoreError`; the
//! orchestrator classifies everything a run can hit into `SyncError`.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

use crate::central::CentralError;
use crate::integrations::{RegistryError, ServiceError};
use crate::queue::QueueError;
use crate::repositories::authorization::CredentialError;
use crate::sync::batch::BatchError;
use crate::types::WorkspaceId;

/// Failures reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("stored {what} could not be decoded: {detail}")]
    Decode { what: &'static str, detail: String },
    #[error("{what} could not be encoded: {detail}")]
    Encode { what: &'static str, detail: String },
}

impl StoreError {
    pub fn decode(what: &'static str, err: impl std::fmt::Display) -> Self {
        StoreError::Decode {
            what,
            detail: err.to_string(),
        }
    }

    pub fn encode(what: &'static str, err: impl std::fmt::Display) -> Self {
        StoreError::Encode {
            what,
            detail: err.to_string(),
        }
    }
}

/// Coarse classification of a [`SyncError`], used for reporting and by callers
/// deciding whether to surface or record a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotConfigured,
    Auth,
    Adapter,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotConfigured => "not_configured",
            ErrorKind::Auth => "auth",
            ErrorKind::Adapter => "adapter",
            ErrorKind::Store => "store",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors produced while configuring or running pipes.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid pipe request: {0}")]
    Validation(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("pipe {pipe} is not configured for workspace {workspace_id}")]
    NotConfigured {
        workspace_id: WorkspaceId,
        pipe: String,
    },
    #[error("authorization failed: {0}")]
    Auth(CredentialError),
    #[error("{service_id} request failed: {source}")]
    Adapter {
        service_id: String,
        #[source]
        source: ServiceError,
    },
    #[error("central service request failed: {0}")]
    Central(#[from] CentralError),
    #[error("request could not be batched: {0}")]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background run did not finish: {0}")]
    Interrupted(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) | SyncError::Registry(_) | SyncError::Batch(_) => {
                ErrorKind::Validation
            }
            SyncError::NotConfigured { .. } => ErrorKind::NotConfigured,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Adapter { .. } | SyncError::Central(_) => ErrorKind::Adapter,
            SyncError::Store(_) | SyncError::Queue(_) => ErrorKind::Store,
            SyncError::Interrupted(_) => ErrorKind::Internal,
        }
    }

    pub fn adapter(service_id: &str, source: ServiceError) -> Self {
        SyncError::Adapter {
            service_id: service_id.to_string(),
            source,
        }
    }
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Store(store) => SyncError::Store(store),
            other => SyncError::Auth(other),
        }
    }
}

impl From<DbErr> for SyncError {
    fn from(err: DbErr) -> Self {
        SyncError::Store(StoreError::Database(err))
    }
}

/// Returns true when the database rejected a write because of a unique index.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    match db_error.code() {
        Some(code) => code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()),
        None => false,
    }
}
