//! HTTP client for the FATMAN REST endpoints.

use std::path::Path;
use std::time::Duration;

use fatman_core::{Task, TaskId, TaskStatus, WorkerId};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Response, Url};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ClientError;

/// Path of the task collection below the service URL.
pub const TASKS_PATH: &str = "api/v2/tasks";

/// Connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bearer token presented with every request.
    pub token: Option<String>,
    /// Verify the server's TLS certificate.
    pub verify_tls: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            token: None,
            verify_tls: true,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Only tasks in one of these states.
    pub statuses: Vec<TaskStatus>,
    /// Only tasks owned by this worker.
    pub machine: Option<WorkerId>,
    /// At most this many tasks.
    pub limit: Option<u32>,
}

impl TaskQuery {
    /// Query parameters in the server's format.
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if !self.statuses.is_empty() {
            let names: Vec<&str> = self.statuses.iter().map(|s| s.wire_name()).collect();
            params.push(("status", names.join(",")));
        }
        if let Some(machine) = &self.machine {
            params.push(("machine", machine.to_string()));
        }
        params
    }
}

/// HTTP client for the FATMAN task API.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: reqwest::Client,
    base_url: Url,
    origin: Url,
}

impl ApiClient {
    /// Create a new client with default options.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_options(base_url, ClientOptions::default())
    }

    /// Create a new client.
    ///
    /// `base_url` is where the service is mounted, e.g. `https://host/fatman`.
    /// Links returned by the server are absolute paths resolved against the
    /// scheme and host of this URL.
    pub fn with_options(base_url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let mut base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut origin = base_url.clone();
        origin.set_path("/");
        origin.set_query(None);

        let mut headers = HeaderMap::new();
        if let Some(token) = &options.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ClientError::InvalidUrl("token is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let inner = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .danger_accept_invalid_certs(!options.verify_tls)
            .build()?;

        Ok(Self {
            inner,
            base_url,
            origin,
        })
    }

    /// The service URL this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of the task collection.
    pub fn tasks_url(&self) -> Result<Url, ClientError> {
        self.base_url
            .join(TASKS_PATH)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    /// Resolve a server-provided link against the server origin.
    pub fn resolve(&self, link: &str) -> Result<Url, ClientError> {
        self.origin
            .join(link)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", link, e)))
    }

    /// URL of a task resource, preferring the task's own link.
    pub fn task_url(&self, task: &Task) -> Result<Url, ClientError> {
        match &task.links.self_link {
            Some(link) => self.resolve(link),
            None => self.task_url_by_id(&task.id),
        }
    }

    fn task_url_by_id(&self, id: &TaskId) -> Result<Url, ClientError> {
        self.base_url
            .join(&format!("{}/{}", TASKS_PATH, id))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    /// List tasks matching the query.
    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, ClientError> {
        let url = self.tasks_url()?;
        debug!(url = %url, "GET tasks");

        let response = self.inner.get(url).query(&query.params()).send().await?;
        json_body(check(response).await?).await
    }

    /// List tasks matching the query without decoding them into [`Task`]s.
    ///
    /// Lets callers deal with individual records they cannot decode.
    pub async fn list_task_values(&self, query: &TaskQuery) -> Result<Vec<Value>, ClientError> {
        let url = self.tasks_url()?;
        debug!(url = %url, "GET tasks");

        let response = self.inner.get(url).query(&query.params()).send().await?;
        json_body(check(response).await?).await
    }

    /// Fetch one task by id.
    pub async fn get_task(&self, id: &TaskId) -> Result<Task, ClientError> {
        let url = self.task_url_by_id(id)?;
        debug!(url = %url, "GET task");

        let response = self.inner.get(url).send().await?;
        json_body(check(response).await?).await
    }

    /// Re-fetch the complete representation of a task.
    pub async fn refresh(&self, task: &Task) -> Result<Task, ClientError> {
        let url = self.task_url(task)?;
        debug!(url = %url, "GET task");

        let response = self.inner.get(url).send().await?;
        json_body(check(response).await?).await
    }

    /// Partially update a task and return its new representation.
    pub async fn patch_task<B: Serialize + ?Sized>(
        &self,
        task: &Task,
        body: &B,
    ) -> Result<Task, ClientError> {
        let url = self.task_url(task)?;
        debug!(url = %url, "PATCH task");

        let response = self.inner.patch(url).json(body).send().await?;
        json_body(check(response).await?).await
    }

    /// Partially update a task by id and return the raw representation.
    pub async fn patch_task_value<B: Serialize + ?Sized>(
        &self,
        id: &TaskId,
        body: &B,
    ) -> Result<Value, ClientError> {
        let url = self.task_url_by_id(id)?;
        debug!(url = %url, "PATCH task");

        let response = self.inner.patch(url).json(body).send().await?;
        json_body(check(response).await?).await
    }

    /// POST a JSON body to a task sub-resource, ignoring the response body.
    pub async fn post_task_action<B: Serialize + ?Sized>(
        &self,
        task: &Task,
        action: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let mut url = self.task_url(task)?;
        let path = format!("{}/{}", url.path().trim_end_matches('/'), action);
        url.set_path(&path);
        debug!(url = %url, "POST task action");

        let response = self.inner.post(url).json(body).send().await?;
        check(response).await?;
        Ok(())
    }

    /// Stream a linked file to `dest`. Returns the number of bytes written.
    pub async fn download(&self, link: &str, dest: &Path) -> Result<u64, ClientError> {
        let url = self.resolve(link)?;
        debug!(url = %url, dest = %dest.display(), "Downloading file");

        let mut response = check(self.inner.get(url).send().await?).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Upload a local file as an artifact of `task` under `name`.
    pub async fn upload(&self, task: &Task, name: &str, path: &Path) -> Result<(), ClientError> {
        let link = task
            .links
            .uploads
            .as_deref()
            .ok_or_else(|| ClientError::MissingLink {
                link: "uploads",
                task_id: task.id.to_string(),
            })?;
        let url = self.resolve(link)?;
        debug!(url = %url, name = %name, "Uploading artifact");

        let bytes = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("name", name.to_string())
            .part("data", part);

        let response = self.inner.post(url).multipart(form).send().await?;
        check(response).await?;
        Ok(())
    }
}

/// Turn non-success responses into `ClientError::Status`.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Serialization(e.to_string()))
}
