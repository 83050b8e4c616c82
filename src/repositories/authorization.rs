//! Credential store
//!
//! Persists one authorization per (workspace, service) and keeps OAuth2 access
//! tokens fresh. Every path that is about to call a foreign service goes through
//! [`CredentialStore::refresh_if_needed`] first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect, Set};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::error::StoreError;
use crate::integrations::{AuthType, ServiceRegistry};
use crate::models::authorization::{self, Entity as AuthorizationEntity};
use crate::oauth::{OAuth1Token, OAuth2ClientConfig, OAuth2Token, OAuthError, OAuthProvider};
use crate::types::WorkspaceId;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("workspace {workspace_id} has no authorization for {service_id}")]
    NotFound {
        workspace_id: WorkspaceId,
        service_id: String,
    },
    #[error("no OAuth2 client configured for {service_id}")]
    ConfigNotFound { service_id: String },
    #[error("{service_id} does not use OAuth2")]
    UnsupportedAuthType { service_id: String },
    #[error("stored credential for {service_id} is malformed: {detail}")]
    Decode { service_id: String, detail: String },
    #[error("OAuth request failed: {0}")]
    OAuth(#[from] OAuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DbErr> for CredentialError {
    fn from(err: DbErr) -> Self {
        CredentialError::Store(StoreError::Database(err))
    }
}

/// Workspace token plus the opaque credential blob for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub workspace_id: WorkspaceId,
    pub service_id: String,
    /// Token used to call the central service for this workspace
    pub workspace_token: String,
    /// Encoded [`OAuth1Token`] or [`OAuth2Token`]
    pub data: Vec<u8>,
}

impl Authorization {
    pub fn oauth2(
        workspace_id: WorkspaceId,
        service_id: impl Into<String>,
        workspace_token: impl Into<String>,
        token: &OAuth2Token,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            workspace_id,
            service_id: service_id.into(),
            workspace_token: workspace_token.into(),
            data: encode(token)?,
        })
    }

    pub fn oauth1(
        workspace_id: WorkspaceId,
        service_id: impl Into<String>,
        workspace_token: impl Into<String>,
        token: &OAuth1Token,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            workspace_id,
            service_id: service_id.into(),
            workspace_token: workspace_token.into(),
            data: encode(token)?,
        })
    }

    pub fn oauth2_token(&self) -> Result<OAuth2Token, CredentialError> {
        self.decode()
    }

    pub fn oauth1_token(&self) -> Result<OAuth1Token, CredentialError> {
        self.decode()
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, CredentialError> {
        serde_json::from_slice(&self.data).map_err(|err| CredentialError::Decode {
            service_id: self.service_id.clone(),
            detail: err.to_string(),
        })
    }

    fn from_model(row: authorization::Model) -> Self {
        Self {
            workspace_id: row.workspace_id,
            service_id: row.service_id,
            workspace_token: row.workspace_token,
            data: row.data,
        }
    }
}

fn encode<T: Serialize>(token: &T) -> Result<Vec<u8>, CredentialError> {
    serde_json::to_vec(token)
        .map_err(|err| CredentialError::Store(StoreError::encode("authorization", err)))
}

#[derive(Clone)]
pub struct CredentialStore {
    db: DatabaseConnection,
    registry: Arc<ServiceRegistry>,
    provider: Arc<dyn OAuthProvider>,
    oauth2_clients: Arc<BTreeMap<String, OAuth2ClientConfig>>,
}

impl CredentialStore {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<ServiceRegistry>,
        provider: Arc<dyn OAuthProvider>,
        oauth2_clients: BTreeMap<String, OAuth2ClientConfig>,
    ) -> Self {
        Self {
            db,
            registry,
            provider,
            oauth2_clients: Arc::new(oauth2_clients),
        }
    }

    pub async fn load(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<Authorization, CredentialError> {
        AuthorizationEntity::find_by_id((workspace_id, service_id.to_string()))
            .one(&self.db)
            .await?
            .map(Authorization::from_model)
            .ok_or_else(|| CredentialError::NotFound {
                workspace_id,
                service_id: service_id.to_string(),
            })
    }

    /// Stores the authorization, replacing any previous one for the same service.
    pub async fn save(&self, auth: &Authorization) -> Result<(), CredentialError> {
        let now = Utc::now().fixed_offset();
        let row = authorization::ActiveModel {
            workspace_id: Set(auth.workspace_id),
            service_id: Set(auth.service_id.clone()),
            workspace_token: Set(auth.workspace_token.clone()),
            data: Set(auth.data.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        AuthorizationEntity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    authorization::Column::WorkspaceId,
                    authorization::Column::ServiceId,
                ])
                .update_columns([
                    authorization::Column::WorkspaceToken,
                    authorization::Column::Data,
                    authorization::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
    ) -> Result<(), CredentialError> {
        AuthorizationEntity::delete_by_id((workspace_id, service_id.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn list_authorized_services(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<BTreeSet<String>, CredentialError> {
        let services: Vec<String> = AuthorizationEntity::find()
            .select_only()
            .column(authorization::Column::ServiceId)
            .filter(authorization::Column::WorkspaceId.eq(workspace_id))
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(services.into_iter().collect())
    }

    /// URL that starts the OAuth2 grant for a service.
    pub fn authorize_url(&self, service_id: &str, state: &str) -> Result<Url, CredentialError> {
        let config = self.oauth2_config(service_id)?;
        Ok(self.provider.authorize_url(config, state)?)
    }

    /// Completes an OAuth2 grant and stores the resulting authorization.
    pub async fn exchange(
        &self,
        workspace_id: WorkspaceId,
        service_id: &str,
        workspace_token: &str,
        code: &str,
    ) -> Result<Authorization, CredentialError> {
        if self.registry.auth_type(service_id) != Some(AuthType::OAuth2) {
            return Err(CredentialError::UnsupportedAuthType {
                service_id: service_id.to_string(),
            });
        }
        let config = self.oauth2_config(service_id)?;
        let token = self.provider.exchange_code(config, code).await?;

        let auth = Authorization::oauth2(workspace_id, service_id, workspace_token, &token)?;
        self.save(&auth).await?;
        info!(workspace_id, service_id, "Stored new authorization");
        Ok(auth)
    }

    /// Refreshes an expired OAuth2 token in place and persists it.
    ///
    /// Returns true when a refresh happened.
    pub async fn refresh_if_needed(&self, auth: &mut Authorization) -> Result<bool, CredentialError> {
        self.refresh_if_needed_at(auth, Utc::now()).await
    }

    pub async fn refresh_if_needed_at(
        &self,
        auth: &mut Authorization,
        now: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        match self.registry.auth_type(&auth.service_id) {
            Some(AuthType::OAuth2) => {}
            Some(AuthType::OAuth1) | None => return Ok(false),
        }

        let token = auth.oauth2_token()?;
        if !token.is_expired_at(now) {
            return Ok(false);
        }

        let config = self.oauth2_config(&auth.service_id)?;
        let refreshed = match self.provider.refresh(config, &token).await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                counter!("pipes_token_refresh_total", "service" => auth.service_id.clone(), "outcome" => "failure").increment(1);
                warn!(
                    workspace_id = auth.workspace_id,
                    service_id = %auth.service_id,
                    error = %err,
                    "Token refresh failed"
                );
                return Err(err.into());
            }
        };

        auth.data = encode(&refreshed)?;
        self.save(auth).await?;
        counter!("pipes_token_refresh_total", "service" => auth.service_id.clone(), "outcome" => "success").increment(1);
        info!(
            workspace_id = auth.workspace_id,
            service_id = %auth.service_id,
            "Refreshed expired access token"
        );
        Ok(true)
    }

    fn oauth2_config(&self, service_id: &str) -> Result<&OAuth2ClientConfig, CredentialError> {
        self.oauth2_clients
            .get(service_id)
            .ok_or_else(|| CredentialError::ConfigNotFound {
                service_id: service_id.to_string(),
            })
    }
}
