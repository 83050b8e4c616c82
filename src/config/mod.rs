//! Configuration loading for the pipes sync engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `PIPES_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::oauth::OAuth2ClientConfig;

const ENV_PREFIX: &str = "PIPES_";

/// Application configuration derived from `PIPES_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Base URL of the central time-tracking service
    #[serde(default = "default_central_api_url")]
    pub central_api_url: String,
    /// Host used to build run log links
    #[serde(default = "default_sync_log_host")]
    pub sync_log_host: String,
    /// Optional JSON file overriding the built-in integration catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrations_path: Option<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// OAuth2 client settings keyed by service id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub oauth2: BTreeMap<String, OAuth2ClientConfig>,
}

/// Autosync scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Base sleep between queue sweeps
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Extra random share of the base interval added to every sleep (0.0..=1.0)
    #[serde(default = "default_sweep_jitter_pct")]
    pub sweep_jitter_pct: f64,
    /// Automatic enqueue runs this many sweep intervals apart
    #[serde(default = "default_enqueue_interval_multiplier")]
    pub enqueue_interval_multiplier: u32,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Maximum entries (distinct workspaces) per claim
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    #[serde(default = "default_idle_backoff_ms_min")]
    pub idle_backoff_ms_min: u64,
    #[serde(default = "default_idle_backoff_ms_max")]
    pub idle_backoff_ms_max: u64,
    /// Consecutive empty claims after which a worker reports idle
    #[serde(default = "default_empty_claims_before_idle")]
    pub empty_claims_before_idle: u32,
    #[serde(default = "default_complete_retry_attempts")]
    pub complete_retry_attempts: u32,
    /// Claims older than this are treated as abandoned and finished by the next claimant
    #[serde(default = "default_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
}

/// Sync orchestrator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Upper bound for one serialized batch posted to the central service
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// How long a manual users run is awaited before answering "in progress"
    #[serde(default = "default_run_now_wait_ms")]
    pub run_now_wait_ms: u64,
    /// Window of time entries exported by a pipe that never synced before
    #[serde(default = "default_time_entries_lookback_days")]
    pub time_entries_lookback_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            central_api_url: default_central_api_url(),
            sync_log_host: default_sync_log_host(),
            integrations_path: None,
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            oauth2: BTreeMap::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval_seconds(),
            sweep_jitter_pct: default_sweep_jitter_pct(),
            enqueue_interval_multiplier: default_enqueue_interval_multiplier(),
            worker_count: default_worker_count(),
            claim_batch_size: default_claim_batch_size(),
            idle_backoff_ms_min: default_idle_backoff_ms_min(),
            idle_backoff_ms_max: default_idle_backoff_ms_max(),
            empty_claims_before_idle: default_empty_claims_before_idle(),
            complete_retry_attempts: default_complete_retry_attempts(),
            claim_lease_seconds: default_claim_lease_seconds(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            run_now_wait_ms: default_run_now_wait_ms(),
            time_entries_lookback_days: default_time_entries_lookback_days(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        for client in config.oauth2.values_mut() {
            client.client_secret = "[REDACTED]".to_string();
        }
        if let Ok(mut url) = Url::parse(&config.database_url) {
            if url.password().is_some() && url.set_password(Some("[REDACTED]")).is_ok() {
                config.database_url = url.to_string();
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }
        for (field, value) in [
            ("CENTRAL_API_URL", &self.central_api_url),
            ("SYNC_LOG_HOST", &self.sync_log_host),
        ] {
            Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                field: field.to_string(),
                value: value.clone(),
                source,
            })?;
        }

        self.scheduler.validate()?;
        self.sync.validate()?;

        for (service, client) in &self.oauth2 {
            let missing = [
                ("CLIENT_ID", client.client_id.is_empty()),
                ("CLIENT_SECRET", client.client_secret.is_empty()),
                ("AUTH_URL", client.auth_url.is_empty()),
                ("TOKEN_URL", client.token_url.is_empty()),
            ]
            .into_iter()
            .find(|(_, empty)| *empty);
            if let Some((field, _)) = missing {
                return Err(ConfigError::IncompleteOAuth2Client {
                    service: service.clone(),
                    field: field.to_string(),
                });
            }
        }

        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidSweepInterval {
                value: self.sweep_interval_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.sweep_jitter_pct) {
            return Err(ConfigError::InvalidSweepJitter {
                value: self.sweep_jitter_pct,
            });
        }
        if self.enqueue_interval_multiplier == 0 {
            return Err(ConfigError::InvalidEnqueueMultiplier);
        }
        if self.worker_count == 0 || self.worker_count > 64 {
            return Err(ConfigError::InvalidWorkerCount {
                value: self.worker_count,
            });
        }
        if self.claim_batch_size == 0 {
            return Err(ConfigError::InvalidClaimBatchSize);
        }
        if self.idle_backoff_ms_min > self.idle_backoff_ms_max {
            return Err(ConfigError::InvalidIdleBackoff {
                min: self.idle_backoff_ms_min,
                max: self.idle_backoff_ms_max,
            });
        }
        if self.empty_claims_before_idle == 0 {
            return Err(ConfigError::InvalidEmptyClaims);
        }
        if self.claim_lease_seconds == 0 {
            return Err(ConfigError::InvalidClaimLease);
        }
        Ok(())
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes < 1024 {
            return Err(ConfigError::InvalidMaxPayload {
                value: self.max_payload_bytes,
            });
        }
        if self.time_entries_lookback_days <= 0 {
            return Err(ConfigError::InvalidLookback {
                value: self.time_entries_lookback_days,
            });
        }
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://pipes.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_central_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_sync_log_host() -> String {
    "http://localhost:8100".to_string()
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_sweep_jitter_pct() -> f64 {
    0.5
}

fn default_enqueue_interval_multiplier() -> u32 {
    10
}

fn default_worker_count() -> usize {
    4
}

fn default_claim_batch_size() -> usize {
    25
}

fn default_idle_backoff_ms_min() -> u64 {
    100
}

fn default_idle_backoff_ms_max() -> u64 {
    500
}

fn default_empty_claims_before_idle() -> u32 {
    2
}

fn default_complete_retry_attempts() -> u32 {
    3
}

fn default_claim_lease_seconds() -> u64 {
    3_600
}

fn default_max_payload_bytes() -> usize {
    800_000
}

fn default_run_now_wait_ms() -> u64 {
    2_000
}

fn default_time_entries_lookback_days() -> i64 {
    30
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for PIPES_{key}")]
    InvalidValue { key: String, value: String },
    #[error("database URL is missing; set PIPES_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("invalid URL '{value}' for {field}: {source}")]
    InvalidUrl {
        field: String,
        value: String,
        source: url::ParseError,
    },
    #[error("sweep interval must be positive, got {value}")]
    InvalidSweepInterval { value: u64 },
    #[error("sweep jitter percentage must be between 0.0 and 1.0, got {value}")]
    InvalidSweepJitter { value: f64 },
    #[error("enqueue interval multiplier must be at least 1")]
    InvalidEnqueueMultiplier,
    #[error("worker count must be between 1 and 64, got {value}")]
    InvalidWorkerCount { value: usize },
    #[error("claim batch size must be at least 1")]
    InvalidClaimBatchSize,
    #[error("idle backoff minimum ({min}ms) cannot be greater than maximum ({max}ms)")]
    InvalidIdleBackoff { min: u64, max: u64 },
    #[error("empty claims before idle must be at least 1")]
    InvalidEmptyClaims,
    #[error("claim lease must be at least 1 second")]
    InvalidClaimLease,
    #[error("max payload bytes must be at least 1024, got {value}")]
    InvalidMaxPayload { value: usize },
    #[error("time entries lookback must be positive, got {value} days")]
    InvalidLookback { value: i64 },
    #[error("OAuth2 client for '{service}' is missing PIPES_OAUTH2_<SERVICE>_{field}")]
    IncompleteOAuth2Client { service: String, field: String },
}

/// Loads configuration using layered `.env` files and `PIPES_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

const OAUTH2_FIELDS: [&str; 6] = [
    "_CLIENT_ID",
    "_CLIENT_SECRET",
    "_AUTH_URL",
    "_TOKEN_URL",
    "_REDIRECT_URL",
    "_SCOPES",
];

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.<profile>`, `.env.<profile>.local`, then the process
    /// environment, later sources winning.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);

        let scheduler = SchedulerConfig {
            sweep_interval_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_SWEEP_INTERVAL_SECONDS",
                default_sweep_interval_seconds,
            )?,
            sweep_jitter_pct: take_parsed(
                &mut layered,
                "SCHEDULER_SWEEP_JITTER_PCT",
                default_sweep_jitter_pct,
            )?,
            enqueue_interval_multiplier: take_parsed(
                &mut layered,
                "SCHEDULER_ENQUEUE_INTERVAL_MULTIPLIER",
                default_enqueue_interval_multiplier,
            )?,
            worker_count: take_parsed(
                &mut layered,
                "SCHEDULER_WORKER_COUNT",
                default_worker_count,
            )?,
            claim_batch_size: take_parsed(
                &mut layered,
                "SCHEDULER_CLAIM_BATCH_SIZE",
                default_claim_batch_size,
            )?,
            idle_backoff_ms_min: take_parsed(
                &mut layered,
                "SCHEDULER_IDLE_BACKOFF_MS_MIN",
                default_idle_backoff_ms_min,
            )?,
            idle_backoff_ms_max: take_parsed(
                &mut layered,
                "SCHEDULER_IDLE_BACKOFF_MS_MAX",
                default_idle_backoff_ms_max,
            )?,
            empty_claims_before_idle: take_parsed(
                &mut layered,
                "SCHEDULER_EMPTY_CLAIMS_BEFORE_IDLE",
                default_empty_claims_before_idle,
            )?,
            complete_retry_attempts: take_parsed(
                &mut layered,
                "SCHEDULER_COMPLETE_RETRY_ATTEMPTS",
                default_complete_retry_attempts,
            )?,
            claim_lease_seconds: take_parsed(
                &mut layered,
                "SCHEDULER_CLAIM_LEASE_SECONDS",
                default_claim_lease_seconds,
            )?,
        };

        let sync = SyncConfig {
            max_payload_bytes: take_parsed(
                &mut layered,
                "SYNC_MAX_PAYLOAD_BYTES",
                default_max_payload_bytes,
            )?,
            run_now_wait_ms: take_parsed(
                &mut layered,
                "SYNC_RUN_NOW_WAIT_MS",
                default_run_now_wait_ms,
            )?,
            time_entries_lookback_days: take_parsed(
                &mut layered,
                "SYNC_TIME_ENTRIES_LOOKBACK_DAYS",
                default_time_entries_lookback_days,
            )?,
        };

        let config = AppConfig {
            profile,
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(
                &mut layered,
                "DB_MAX_CONNECTIONS",
                default_db_max_connections,
            )?,
            db_acquire_timeout_ms: take_parsed(
                &mut layered,
                "DB_ACQUIRE_TIMEOUT_MS",
                default_db_acquire_timeout_ms,
            )?,
            central_api_url: take_string(&mut layered, "CENTRAL_API_URL")
                .unwrap_or_else(default_central_api_url),
            sync_log_host: take_string(&mut layered, "SYNC_LOG_HOST")
                .unwrap_or_else(default_sync_log_host),
            integrations_path: take_string(&mut layered, "INTEGRATIONS_PATH")
                .map(|path| self.base_dir.join(path)),
            scheduler,
            sync,
            oauth2: collect_oauth2_clients(&mut layered),
        };

        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("PIPES_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> Result<T, ConfigError> {
    match take_string(layered, key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default()),
    }
}

/// Collects `OAUTH2_<SERVICE>_<FIELD>` keys into per-service client configs.
fn collect_oauth2_clients(
    layered: &mut BTreeMap<String, String>,
) -> BTreeMap<String, OAuth2ClientConfig> {
    let mut clients: BTreeMap<String, OAuth2ClientConfig> = BTreeMap::new();
    let keys: Vec<String> = layered
        .keys()
        .filter(|key| key.starts_with("OAUTH2_"))
        .cloned()
        .collect();

    for key in keys {
        let rest = &key["OAUTH2_".len()..];
        let Some(field) = OAUTH2_FIELDS.iter().find(|field| rest.ends_with(*field)) else {
            continue;
        };
        let service = rest[..rest.len() - field.len()].to_ascii_lowercase();
        if service.is_empty() {
            continue;
        }
        let Some(value) = take_string(layered, &key) else {
            continue;
        };

        let client = clients
            .entry(service)
            .or_insert_with(|| OAuth2ClientConfig {
                client_id: String::new(),
                client_secret: String::new(),
                auth_url: String::new(),
                token_url: String::new(),
                redirect_url: None,
                scopes: Vec::new(),
            });
        match *field {
            "_CLIENT_ID" => client.client_id = value,
            "_CLIENT_SECRET" => client.client_secret = value,
            "_AUTH_URL" => client.auth_url = value,
            "_TOKEN_URL" => client.token_url = value,
            "_REDIRECT_URL" => client.redirect_url = Some(value),
            _ => {
                client.scopes = value
                    .split(',')
                    .map(|scope| scope.trim().to_string())
                    .filter(|scope| !scope.is_empty())
                    .collect()
            }
        }
    }

    clients
}
