//! Domain types shared by the stores, the service adapters and the sync orchestrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque tenant identifier scoping every pipe, authorization and mapping.
pub type WorkspaceId = i64;

/// Entity types a pipe can synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Users,
    Clients,
    Projects,
    Tasks,
    TodoLists,
    TimeEntries,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity type '{0}'")]
pub struct UnknownEntityType(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed pipe key '{0}'")]
pub struct InvalidPipeKey(pub String);

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Users,
        EntityType::Clients,
        EntityType::Projects,
        EntityType::Tasks,
        EntityType::TodoLists,
        EntityType::TimeEntries,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Users => "users",
            EntityType::Clients => "clients",
            EntityType::Projects => "projects",
            EntityType::Tasks => "tasks",
            EntityType::TodoLists => "todolists",
            EntityType::TimeEntries => "timeentries",
        }
    }

    /// Entity types that must be fetched and posted earlier in the same run.
    pub fn predecessors(self) -> &'static [EntityType] {
        match self {
            EntityType::Users | EntityType::Clients | EntityType::TimeEntries => &[],
            EntityType::Projects => &[EntityType::Clients],
            EntityType::Tasks | EntityType::TodoLists => &[EntityType::Projects],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.as_str() == value)
            .ok_or_else(|| UnknownEntityType(value.to_string()))
    }
}

/// Identifies a pipe within a workspace: one service plus one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeId {
    pub service_id: String,
    pub entity: EntityType,
}

impl PipeId {
    pub fn new(service_id: impl Into<String>, entity: EntityType) -> Self {
        Self {
            service_id: service_id.into(),
            entity,
        }
    }

    /// Storage key, `<service>:<entity>`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.service_id, self.entity)
    }

    pub fn parse(key: &str) -> Result<Self, InvalidPipeKey> {
        let (service_id, entity) = key
            .split_once(':')
            .ok_or_else(|| InvalidPipeKey(key.to_string()))?;
        if service_id.is_empty() {
            return Err(InvalidPipeKey(key.to_string()));
        }
        let entity = entity
            .parse()
            .map_err(|_| InvalidPipeKey(key.to_string()))?;
        Ok(Self::new(service_id, entity))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.entity)
    }
}

/// Common view over objects fetched from a foreign service and posted to the central one.
pub trait ForeignObject {
    fn foreign_id(&self) -> &str;

    fn local_id(&self) -> i64;

    fn set_local_id(&mut self, id: i64);

    /// Whether the object is still active in the foreign service.
    fn is_active(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub foreign_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub foreign_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub billable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub foreign_id: String,
    /// Foreign ID of the owning client, resolved to `client_id` before posting
    #[serde(skip)]
    pub foreign_client_id: Option<String>,
}

/// A task or a todo list; both post to the central task collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub foreign_id: String,
    #[serde(skip)]
    pub foreign_project_id: String,
}

/// A central-service time entry, annotated with foreign references before export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub task_id: Option<i64>,
    pub user_id: i64,
    #[serde(default)]
    pub billable: bool,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_in_seconds: i64,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub foreign_id: Option<String>,
    #[serde(skip)]
    pub foreign_user_id: Option<String>,
    #[serde(skip)]
    pub foreign_project_id: Option<String>,
    #[serde(skip)]
    pub foreign_task_id: Option<String>,
}

impl ForeignObject for User {
    fn foreign_id(&self) -> &str {
        &self.foreign_id
    }

    fn local_id(&self) -> i64 {
        self.id
    }

    fn set_local_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl ForeignObject for Client {
    fn foreign_id(&self) -> &str {
        &self.foreign_id
    }

    fn local_id(&self) -> i64 {
        self.id
    }

    fn set_local_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl ForeignObject for Project {
    fn foreign_id(&self) -> &str {
        &self.foreign_id
    }

    fn local_id(&self) -> i64 {
        self.id
    }

    fn set_local_id(&mut self, id: i64) {
        self.id = id;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl ForeignObject for Task {
    fn foreign_id(&self) -> &str {
        &self.foreign_id
    }

    fn local_id(&self) -> i64 {
        self.id
    }

    fn set_local_id(&mut self, id: i64) {
        self.id = id;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
