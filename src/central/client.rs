//! HTTP client for the central service's pipes API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use url::Url;

use super::{CentralApi, CentralError, ImportResult};
use crate::types::{Client, Project, Task, TimeEntry, User};

const BASIC_AUTH_PASSWORD: &str = "api_token";

/// `reqwest`-based [`CentralApi`] implementation
#[derive(Clone)]
pub struct HttpCentralClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpCentralClient {
    pub fn new(base_url: &str) -> Result<Self, CentralError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, CentralError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CentralError> {
        Ok(self.base_url.join(&format!("api/pipes/{path}"))?)
    }

    /// Posts `{ "<collection>": [...] }` and reads the same collection plus notifications back.
    async fn post_collection<T>(
        &self,
        token: &str,
        collection: &'static str,
        items: &[T],
    ) -> Result<ImportResult<T>, CentralError>
    where
        T: Serialize + DeserializeOwned,
    {
        let url = self.endpoint(collection)?;
        let mut body = Map::new();
        body.insert(
            collection.to_string(),
            serde_json::to_value(items).map_err(|err| CentralError::Decode(err.to_string()))?,
        );

        let response = self
            .http
            .post(url)
            .basic_auth(token, Some(BASIC_AUTH_PASSWORD))
            .json(&body)
            .send()
            .await?;
        let mut payload: Map<String, Value> = Self::read_json(response).await?;

        let items = match payload.remove(collection) {
            Some(Value::Null) | None => Vec::new(),
            Some(value) => serde_json::from_value(value)
                .map_err(|err| CentralError::Decode(err.to_string()))?,
        };
        let notifications = match payload.remove("notifications") {
            Some(Value::Null) | None => Vec::new(),
            Some(value) => serde_json::from_value(value)
                .map_err(|err| CentralError::Decode(err.to_string()))?,
        };

        counter!("pipes_central_posts_total", "collection" => collection).increment(1);
        debug!(collection, sent = items_len(&body, collection), "Posted collection to central service");

        Ok(ImportResult {
            items,
            notifications,
        })
    }

    async fn read_json<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, CentralError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CentralError::Http {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| CentralError::Decode(err.to_string()))
    }
}

fn items_len(body: &Map<String, Value>, collection: &str) -> usize {
    body.get(collection)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl CentralApi for HttpCentralClient {
    #[instrument(skip_all, fields(count = users.len()))]
    async fn post_users(
        &self,
        token: &str,
        users: &[User],
    ) -> Result<ImportResult<User>, CentralError> {
        self.post_collection(token, "users", users).await
    }

    #[instrument(skip_all, fields(count = clients.len()))]
    async fn post_clients(
        &self,
        token: &str,
        clients: &[Client],
    ) -> Result<ImportResult<Client>, CentralError> {
        self.post_collection(token, "clients", clients).await
    }

    #[instrument(skip_all, fields(count = projects.len()))]
    async fn post_projects(
        &self,
        token: &str,
        projects: &[Project],
    ) -> Result<ImportResult<Project>, CentralError> {
        self.post_collection(token, "projects", projects).await
    }

    #[instrument(skip_all, fields(count = tasks.len()))]
    async fn post_tasks(
        &self,
        token: &str,
        tasks: &[Task],
    ) -> Result<ImportResult<Task>, CentralError> {
        self.post_collection(token, "tasks", tasks).await
    }

    #[instrument(skip_all, fields(count = todo_lists.len()))]
    async fn post_todo_lists(
        &self,
        token: &str,
        todo_lists: &[Task],
    ) -> Result<ImportResult<Task>, CentralError> {
        self.post_collection(token, "tasks", todo_lists).await
    }

    #[instrument(skip_all, fields(%since))]
    async fn get_time_entries(
        &self,
        token: &str,
        since: DateTime<Utc>,
        user_ids: &[i64],
        project_ids: &[i64],
    ) -> Result<Vec<TimeEntry>, CentralError> {
        let mut url = self.endpoint("time_entries")?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("user_ids", &join_ids(user_ids))
            .append_pair("project_ids", &join_ids(project_ids));

        let response = self
            .http
            .get(url)
            .basic_auth(token, Some(BASIC_AUTH_PASSWORD))
            .send()
            .await?;
        let entries: Option<Vec<TimeEntry>> = Self::read_json(response).await?;
        Ok(entries.unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), CentralError> {
        let response = self.http.get(self.endpoint("ping")?).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CentralError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}
