//! OAuth provider contract and credential shapes.
//!
//! The credential store talks to providers only through [`OAuthProvider`]. The default
//! implementation drives the `oauth2` crate over `reqwest`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// OAuth2 client settings for one integration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2ClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Stored OAuth2 credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry; `None` means the token does not expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuth2Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }
}

/// Stored OAuth1 credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth1Token {
    pub token: String,
    pub secret: String,
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid OAuth2 endpoint configuration: {0}")]
    InvalidConfig(String),
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("token has no refresh token")]
    MissingRefreshToken,
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// URL the user is sent to in order to grant access.
    fn authorize_url(&self, config: &OAuth2ClientConfig, state: &str) -> Result<Url, OAuthError>;

    /// Exchanges an authorization code for a token.
    async fn exchange_code(
        &self,
        config: &OAuth2ClientConfig,
        code: &str,
    ) -> Result<OAuth2Token, OAuthError>;

    /// Obtains a fresh access token using the refresh token.
    async fn refresh(
        &self,
        config: &OAuth2ClientConfig,
        token: &OAuth2Token,
    ) -> Result<OAuth2Token, OAuthError>;
}

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// [`OAuthProvider`] backed by the `oauth2` crate
#[derive(Clone)]
pub struct StandardOAuthProvider {
    http: reqwest::Client,
}

impl StandardOAuthProvider {
    pub fn new() -> Result<Self, OAuthError> {
        // Token endpoints are never followed through redirects
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    fn client(config: &OAuth2ClientConfig) -> Result<ConfiguredClient, OAuthError> {
        let invalid = |err: oauth2::url::ParseError| OAuthError::InvalidConfig(err.to_string());

        let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(config.auth_url.clone()).map_err(invalid)?)
            .set_token_uri(TokenUrl::new(config.token_url.clone()).map_err(invalid)?);
        if let Some(redirect) = &config.redirect_url {
            client = client.set_redirect_uri(RedirectUrl::new(redirect.clone()).map_err(invalid)?);
        }
        Ok(client)
    }
}

fn token_from_response(response: &BasicTokenResponse, now: DateTime<Utc>) -> OAuth2Token {
    OAuth2Token {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|token| token.secret().clone()),
        token_type: default_token_type(),
        expiry: response
            .expires_in()
            .and_then(|expires_in| Duration::from_std(expires_in).ok())
            .map(|expires_in| now + expires_in),
    }
}

#[async_trait]
impl OAuthProvider for StandardOAuthProvider {
    fn authorize_url(&self, config: &OAuth2ClientConfig, state: &str) -> Result<Url, OAuthError> {
        let client = Self::client(config)?;
        let state = state.to_string();
        let (url, _csrf) = client
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(config.scopes.iter().cloned().map(Scope::new))
            .url();
        Ok(url)
    }

    async fn exchange_code(
        &self,
        config: &OAuth2ClientConfig,
        code: &str,
    ) -> Result<OAuth2Token, OAuthError> {
        let client = Self::client(config)?;
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|err| OAuthError::Exchange(err.to_string()))?;
        Ok(token_from_response(&response, Utc::now()))
    }

    async fn refresh(
        &self,
        config: &OAuth2ClientConfig,
        token: &OAuth2Token,
    ) -> Result<OAuth2Token, OAuthError> {
        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or(OAuthError::MissingRefreshToken)?;
        let client = Self::client(config)?;
        let refresh_token = RefreshToken::new(refresh_token);
        let response = client
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http)
            .await
            .map_err(|err| OAuthError::Refresh(err.to_string()))?;

        let mut refreshed = token_from_response(&response, Utc::now());
        // Providers may omit the refresh token on refresh; keep the one we have.
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = token.refresh_token.clone();
        }
        Ok(refreshed)
    }
}
