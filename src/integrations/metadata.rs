//! Integration metadata types
//!
//! Static descriptors of the external services, loaded once at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EntityType;

const DEFAULT_CATALOG: &str = include_str!("../../config/integrations.json");

/// Authentication type used by an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// OAuth 1.0a token and secret
    OAuth1,
    /// OAuth 2.0 access/refresh token with expiry
    OAuth2,
}

/// One entity type offered by an integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationPipe {
    pub id: EntityType,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub premium: bool,
    /// Whether the pipe may be flagged for scheduled runs
    #[serde(default)]
    pub automatic_option: bool,
}

/// Descriptor of one external service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub image: String,
    pub auth_type: AuthType,
    pub pipes: Vec<IntegrationPipe>,
}

impl Integration {
    pub fn pipe(&self, entity: EntityType) -> Option<&IntegrationPipe> {
        self.pipes.iter().find(|pipe| pipe.id == entity)
    }

    pub fn supports(&self, entity: EntityType) -> bool {
        self.pipe(entity).is_some()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read integration catalog {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid integration catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("integration '{0}' is declared more than once")]
    Duplicate(String),
}

/// Loads the integration catalog from `path`, or the built-in catalog when `None`.
pub fn load_catalog(path: Option<&Path>) -> Result<Vec<Integration>, CatalogError> {
    let integrations: Vec<Integration> = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&raw)?
        }
        None => serde_json::from_str(DEFAULT_CATALOG)?,
    };

    let mut seen = std::collections::HashSet::new();
    for integration in &integrations {
        if !seen.insert(integration.id.as_str()) {
            return Err(CatalogError::Duplicate(integration.id.clone()));
        }
    }

    Ok(integrations)
}
