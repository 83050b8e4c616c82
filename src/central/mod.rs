//! Central time-tracking service
//!
//! Contract the orchestrator uses to post imported objects and read time entries,
//! plus the HTTP implementation.

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Client, Project, Task, TimeEntry, User};

pub use client::HttpCentralClient;

/// Objects accepted by the central service together with its user-facing notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub notifications: Vec<String>,
}

impl<T> Default for ImportResult<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

impl<T> ImportResult<T> {
    pub fn merge(&mut self, other: ImportResult<T>) {
        self.items.extend(other.items);
        self.notifications.extend(other.notifications);
    }
}

#[derive(Debug, Error)]
pub enum CentralError {
    #[error("central service returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("central service request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected central service response: {0}")]
    Decode(String),
    #[error("invalid central service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Calls authenticate with the workspace token stored alongside the authorization.
#[async_trait]
pub trait CentralApi: Send + Sync {
    async fn post_users(
        &self,
        token: &str,
        users: &[User],
    ) -> Result<ImportResult<User>, CentralError>;

    async fn post_clients(
        &self,
        token: &str,
        clients: &[Client],
    ) -> Result<ImportResult<Client>, CentralError>;

    async fn post_projects(
        &self,
        token: &str,
        projects: &[Project],
    ) -> Result<ImportResult<Project>, CentralError>;

    async fn post_tasks(
        &self,
        token: &str,
        tasks: &[Task],
    ) -> Result<ImportResult<Task>, CentralError>;

    /// Todo lists are imported into the central task collection.
    async fn post_todo_lists(
        &self,
        token: &str,
        todo_lists: &[Task],
    ) -> Result<ImportResult<Task>, CentralError>;

    async fn get_time_entries(
        &self,
        token: &str,
        since: DateTime<Utc>,
        user_ids: &[i64],
        project_ids: &[i64],
    ) -> Result<Vec<TimeEntry>, CentralError>;

    async fn ping(&self) -> Result<(), CentralError>;
}
