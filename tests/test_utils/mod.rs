//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations applied, plus scripted doubles for the
//! service adapter, the central service, the OAuth provider and the error sink.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::Value;
use url::Url;

use pipes::central::{CentralApi, CentralError, ImportResult};
use pipes::config::AppConfig;
use pipes::integrations::{
    AuthType, Integration, IntegrationPipe, Service, ServiceError, ServiceRegistry,
};
use pipes::oauth::{OAuth2ClientConfig, OAuth2Token, OAuthError, OAuthProvider};
use pipes::repositories::{Authorization, CredentialStore};
use pipes::sync::SyncOrchestrator;
use pipes::telemetry::ErrorNotifier;
use pipes::types::{Client, EntityType, PipeId, Project, Task, TimeEntry, User, WorkspaceId};

pub const SERVICE: &str = "asana";
pub const LOG_HOST: &str = "https://pipes.test";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database_url = "sqlite::memory:".to_string();
    config.sync_log_host = LOG_HOST.to_string();
    config.scheduler.worker_count = 2;
    config.scheduler.idle_backoff_ms_min = 1;
    config.scheduler.idle_backoff_ms_max = 5;
    config.scheduler.empty_claims_before_idle = 2;
    config.sync.run_now_wait_ms = 2_000;
    config.oauth2.insert(
        SERVICE.to_string(),
        OAuth2ClientConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            auth_url: "https://provider.test/authorize".to_string(),
            token_url: "https://provider.test/token".to_string(),
            redirect_url: None,
            scopes: Vec::new(),
        },
    );
    config
}

pub fn catalog() -> Vec<Integration> {
    let pipe = |id: EntityType| IntegrationPipe {
        id,
        name: id.as_str().to_string(),
        description: String::new(),
        premium: false,
        automatic_option: id != EntityType::Users,
    };
    vec![
        Integration {
            id: SERVICE.to_string(),
            name: "Asana".to_string(),
            link: String::new(),
            image: String::new(),
            auth_type: AuthType::OAuth2,
            pipes: EntityType::ALL.into_iter().map(pipe).collect(),
        },
        Integration {
            id: "freshbooks".to_string(),
            name: "FreshBooks".to_string(),
            link: String::new(),
            image: String::new(),
            auth_type: AuthType::OAuth1,
            pipes: vec![pipe(EntityType::Projects)],
        },
    ]
}

/// Scripted data and call records shared by every adapter instance a test builds.
#[derive(Default)]
pub struct ServiceState {
    pub users: Mutex<Vec<User>>,
    pub clients: Mutex<Vec<Client>>,
    pub projects: Mutex<Vec<Project>>,
    pub tasks: Mutex<Vec<Task>>,
    pub todo_lists: Mutex<Vec<Task>>,
    pub failing_entries: Mutex<HashSet<i64>>,
    pub fail_fetch: Mutex<Option<ServiceError>>,
    pub exported: Mutex<Vec<TimeEntry>>,
    pub fetches: Mutex<Vec<EntityType>>,
    pub since: Mutex<Vec<Option<DateTime<Utc>>>>,
    pub fetch_delay: Mutex<Duration>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ServiceState {
    pub fn fetches(&self) -> Vec<EntityType> {
        self.fetches.lock().unwrap().clone()
    }

    async fn fetch<T: Clone>(&self, entity: EntityType, items: &Mutex<Vec<T>>) -> Result<Vec<T>, ServiceError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.fetches.lock().unwrap().push(entity);

        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.fail_fetch.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(items.lock().unwrap().clone())
    }
}

pub struct MockService {
    state: Arc<ServiceState>,
    account: Option<String>,
}

impl MockService {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self {
            state,
            account: None,
        }
    }
}

#[async_trait]
impl Service for MockService {
    fn id(&self) -> &str {
        SERVICE
    }

    fn set_params(&mut self, params: &[u8]) -> Result<(), ServiceError> {
        let value: Value =
            serde_json::from_slice(params).map_err(|err| ServiceError::InvalidParams {
                details: err.to_string(),
            })?;
        let account = value
            .get("account_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::InvalidParams {
                details: "account_id is required".to_string(),
            })?;
        self.account = Some(account.to_string());
        Ok(())
    }

    fn set_auth_data(&mut self, data: &[u8]) -> Result<(), ServiceError> {
        serde_json::from_slice::<OAuth2Token>(data)
            .map(|_| ())
            .map_err(|err| ServiceError::InvalidAuthData {
                details: err.to_string(),
            })
    }

    fn set_since(&mut self, since: Option<DateTime<Utc>>) {
        self.state.since.lock().unwrap().push(since);
    }

    fn key_for(&self, entity: EntityType) -> String {
        match &self.account {
            Some(account) => format!("{SERVICE}:{account}:{entity}"),
            None => format!("{SERVICE}:{entity}"),
        }
    }

    async fn users(&self) -> Result<Vec<User>, ServiceError> {
        self.state.fetch(EntityType::Users, &self.state.users).await
    }

    async fn clients(&self) -> Result<Vec<Client>, ServiceError> {
        self.state.fetch(EntityType::Clients, &self.state.clients).await
    }

    async fn projects(&self) -> Result<Vec<Project>, ServiceError> {
        self.state.fetch(EntityType::Projects, &self.state.projects).await
    }

    async fn tasks(&self) -> Result<Vec<Task>, ServiceError> {
        self.state.fetch(EntityType::Tasks, &self.state.tasks).await
    }

    async fn todo_lists(&self) -> Result<Vec<Task>, ServiceError> {
        self.state
            .fetch(EntityType::TodoLists, &self.state.todo_lists)
            .await
    }

    async fn export_time_entry(&self, entry: &TimeEntry) -> Result<String, ServiceError> {
        if self.state.failing_entries.lock().unwrap().contains(&entry.id) {
            return Err(ServiceError::Http {
                status: 422,
                body: Some("rejected".to_string()),
            });
        }
        self.state.exported.lock().unwrap().push(entry.clone());
        Ok(format!("foreign-entry-{}", entry.id))
    }
}

/// Central service double that assigns local IDs from a counter.
pub struct MockCentral {
    next_id: AtomicI64,
    pub posts: Mutex<Vec<(&'static str, usize)>>,
    pub time_entries: Mutex<Vec<TimeEntry>>,
    pub time_entry_queries: Mutex<Vec<(DateTime<Utc>, Vec<i64>, Vec<i64>)>>,
    pub notifications: Mutex<Vec<String>>,
}

impl Default for MockCentral {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            posts: Mutex::new(Vec::new()),
            time_entries: Mutex::new(Vec::new()),
            time_entry_queries: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        }
    }
}

impl MockCentral {
    fn assign<T: Clone>(
        &self,
        collection: &'static str,
        items: &[T],
        id: impl Fn(&mut T) -> &mut i64,
    ) -> ImportResult<T> {
        self.posts.lock().unwrap().push((collection, items.len()));
        let items = items
            .iter()
            .cloned()
            .map(|mut item| {
                let slot = id(&mut item);
                if *slot == 0 {
                    *slot = self.next_id.fetch_add(1, Ordering::SeqCst);
                }
                item
            })
            .collect();
        ImportResult {
            items,
            notifications: self.notifications.lock().unwrap().clone(),
        }
    }

    pub fn posted(&self, collection: &str) -> usize {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == collection)
            .map(|(_, count)| count)
            .sum()
    }
}

#[async_trait]
impl CentralApi for MockCentral {
    async fn post_users(&self, _token: &str, users: &[User]) -> Result<ImportResult<User>, CentralError> {
        Ok(self.assign("users", users, |u| &mut u.id))
    }

    async fn post_clients(
        &self,
        _token: &str,
        clients: &[Client],
    ) -> Result<ImportResult<Client>, CentralError> {
        Ok(self.assign("clients", clients, |c| &mut c.id))
    }

    async fn post_projects(
        &self,
        _token: &str,
        projects: &[Project],
    ) -> Result<ImportResult<Project>, CentralError> {
        Ok(self.assign("projects", projects, |p| &mut p.id))
    }

    async fn post_tasks(&self, _token: &str, tasks: &[Task]) -> Result<ImportResult<Task>, CentralError> {
        Ok(self.assign("tasks", tasks, |t| &mut t.id))
    }

    async fn post_todo_lists(
        &self,
        _token: &str,
        todo_lists: &[Task],
    ) -> Result<ImportResult<Task>, CentralError> {
        Ok(self.assign("todolists", todo_lists, |t| &mut t.id))
    }

    async fn get_time_entries(
        &self,
        _token: &str,
        since: DateTime<Utc>,
        user_ids: &[i64],
        project_ids: &[i64],
    ) -> Result<Vec<TimeEntry>, CentralError> {
        self.time_entry_queries
            .lock()
            .unwrap()
            .push((since, user_ids.to_vec(), project_ids.to_vec()));
        Ok(self.time_entries.lock().unwrap().clone())
    }

    async fn ping(&self) -> Result<(), CentralError> {
        Ok(())
    }
}

/// OAuth provider double counting refreshes.
#[derive(Default)]
pub struct MockOAuthProvider {
    pub refreshes: AtomicUsize,
    pub fail_refresh: Mutex<bool>,
}

#[async_trait]
impl OAuthProvider for MockOAuthProvider {
    fn authorize_url(&self, config: &OAuth2ClientConfig, state: &str) -> Result<Url, OAuthError> {
        let mut url =
            Url::parse(&config.auth_url).map_err(|err| OAuthError::InvalidConfig(err.to_string()))?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(url)
    }

    async fn exchange_code(
        &self,
        _config: &OAuth2ClientConfig,
        code: &str,
    ) -> Result<OAuth2Token, OAuthError> {
        Ok(fresh_token(&format!("access-{code}")))
    }

    async fn refresh(
        &self,
        _config: &OAuth2ClientConfig,
        _token: &OAuth2Token,
    ) -> Result<OAuth2Token, OAuthError> {
        if *self.fail_refresh.lock().unwrap() {
            return Err(OAuthError::Refresh("invalid_grant".to_string()));
        }
        let count = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(fresh_token(&format!("refreshed-{count}")))
    }
}

pub fn fresh_token(access: &str) -> OAuth2Token {
    OAuth2Token {
        access_token: access.to_string(),
        refresh_token: Some("refresh".to_string()),
        token_type: "Bearer".to_string(),
        expiry: Some(Utc::now() + chrono::Duration::hours(1)),
    }
}

/// Error sink that keeps every reported message.
#[derive(Default)]
pub struct RecordingNotifier {
    pub reports: Mutex<Vec<(String, Value)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }
}

impl ErrorNotifier for RecordingNotifier {
    fn notify(&self, error: &(dyn std::error::Error + 'static), context: Value) {
        self.reports.lock().unwrap().push((error.to_string(), context));
    }
}

pub fn registry(state: &Arc<ServiceState>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::with_catalog(catalog());
    let state = Arc::clone(state);
    registry.register(
        SERVICE,
        Arc::new(move || Box::new(MockService::new(Arc::clone(&state))) as Box<dyn Service>),
    );
    registry
}

/// Fully wired orchestrator over an in-memory database.
pub struct Harness {
    pub db: DatabaseConnection,
    pub config: AppConfig,
    pub state: Arc<ServiceState>,
    pub central: Arc<MockCentral>,
    pub oauth: Arc<MockOAuthProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub credentials: CredentialStore,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Result<Self> {
        let db = setup_test_db().await?;
        let state = Arc::new(ServiceState::default());
        let registry = Arc::new(registry(&state));
        let central = Arc::new(MockCentral::default());
        let oauth = Arc::new(MockOAuthProvider::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let credentials = CredentialStore::new(
            db.clone(),
            Arc::clone(&registry),
            oauth.clone(),
            config.oauth2.clone(),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            registry,
            credentials.clone(),
            central.clone(),
            notifier.clone(),
            &config,
        ));

        Ok(Self {
            db,
            config,
            state,
            central,
            oauth,
            notifier,
            credentials,
            orchestrator,
        })
    }

    pub async fn authorize(&self, workspace_id: WorkspaceId) -> Result<()> {
        let auth = Authorization::oauth2(workspace_id, SERVICE, "workspace-token", &fresh_token("access"))?;
        self.credentials.save(&auth).await?;
        Ok(())
    }

    pub async fn configure(
        &self,
        workspace_id: WorkspaceId,
        entity: EntityType,
        automatic: bool,
    ) -> Result<PipeId> {
        let id = PipeId::new(SERVICE, entity);
        self.orchestrator
            .configure_pipe(workspace_id, &id, automatic, None)
            .await?;
        Ok(id)
    }
}

pub fn project(foreign_id: &str, active: bool, client: Option<&str>) -> Project {
    Project {
        name: format!("Project {foreign_id}"),
        active,
        foreign_id: foreign_id.to_string(),
        foreign_client_id: client.map(str::to_string),
        ..Default::default()
    }
}

pub fn task(foreign_id: &str, active: bool, project: &str) -> Task {
    Task {
        name: format!("Task {foreign_id}"),
        active,
        foreign_id: foreign_id.to_string(),
        foreign_project_id: project.to_string(),
        ..Default::default()
    }
}

pub fn user(foreign_id: &str) -> User {
    User {
        email: format!("{foreign_id}@example.test"),
        name: foreign_id.to_string(),
        foreign_id: foreign_id.to_string(),
        ..Default::default()
    }
}

pub fn mapping_of(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
    pairs
        .iter()
        .map(|(foreign, local)| (foreign.to_string(), *local))
        .collect()
}
