//! Network calls to the FATMAN server.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use fatman_client::{ApiClient, TaskQuery};
use fatman_core::{is_relative_inside, Diagnostic, ErrorKind, Task, TaskData, TaskId, TaskStatus, WorkerId};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::workspace::Artifact;

/// Answer to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// The lease was renewed.
    Alive,
    /// The lease already expired or the task was reassigned.
    LeaseExpired,
}

/// What gets uploaded with a terminal status.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Files to upload.
    pub artifacts: &'a [Artifact],
    /// Result document.
    pub data: &'a TaskData,
}

/// The daemon's view of the server.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Claim one pending task for this worker. `None` if there is nothing to do.
    async fn claim_next(&self) -> Result<Option<Task>, TransportError>;

    /// Renew the lease on a claimed task.
    async fn heartbeat(&self, task: &Task) -> Result<Heartbeat, TransportError>;

    /// Tell the server the task started executing.
    async fn mark_running(&self, task: &Task) -> Result<(), TransportError>;

    /// Download the task's input files into `dir`.
    async fn fetch_inputs(&self, task: &Task, dir: &Path) -> Result<(), TransportError>;

    /// Upload the result and mark the task done. Idempotent.
    async fn submit_result(&self, task: &Task, submission: Submission<'_>) -> Result<(), TransportError>;

    /// Upload diagnostics and mark the task failed. Idempotent.
    async fn report_failure(&self, task: &Task, submission: Submission<'_>) -> Result<(), TransportError>;

    /// Tasks this worker still holds a claim on, e.g. from before a restart.
    async fn owned_tasks(&self) -> Result<Vec<Task>, TransportError>;
}

/// [`TaskTransport`] over the FATMAN REST API.
pub struct HttpTransport {
    client: ApiClient,
    worker_id: WorkerId,
}

impl HttpTransport {
    /// Create a new transport claiming tasks as `worker_id`.
    pub fn new(client: ApiClient, worker_id: WorkerId) -> Self {
        Self { client, worker_id }
    }

    /// Bring a task to a terminal status, uploading artifacts first.
    ///
    /// Re-running this after a lost acknowledgment is harmless: files the
    /// server already has are skipped and a task already in `status` is left
    /// alone.
    async fn finish(
        &self,
        task: &Task,
        status: TaskStatus,
        submission: Submission<'_>,
    ) -> Result<(), TransportError> {
        let current = self.client.refresh(task).await?;
        if current.status == status {
            info!(task_id = %task.id, status = %status, "Task already reported, nothing to do");
            return Ok(());
        }
        if current.is_terminal() || current.machine.as_ref() != Some(&self.worker_id) {
            return Err(TransportError::Conflict(format!(
                "task {} is {} on {}",
                task.id,
                current.status,
                current.machine.as_ref().map_or("no machine", |m| m.as_str())
            )));
        }

        for artifact in submission.artifacts {
            if current.has_outfile(&artifact.name) {
                debug!(task_id = %task.id, name = %artifact.name, "Artifact already uploaded");
                continue;
            }
            self.client.upload(&current, &artifact.name, &artifact.path).await?;
        }

        let body = json!({
            "status": status.wire_name(),
            "data": submission.data.to_value(),
        });
        match self.client.patch_task(&current, &body).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Conflict => {
                // the acknowledgment of an earlier attempt may have been lost
                let after = self.client.refresh(task).await?;
                if after.status == status {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(&self, candidate: Task) -> Result<Option<Task>, TransportError> {
        let body = json!({
            "status": TaskStatus::Claimed.wire_name(),
            "machine": self.worker_id,
        });
        let mut task = match self.client.patch_task(&candidate, &body).await {
            Ok(task) => task,
            Err(e) if e.kind() == ErrorKind::Conflict => {
                debug!(task_id = %candidate.id, "Claim race lost");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if task.machine.as_ref() != Some(&self.worker_id) {
            debug!(task_id = %task.id, machine = ?task.machine, "Task claimed by another worker");
            return Ok(None);
        }
        if task.claimed_at.is_none() {
            task.claimed_at = Some(Utc::now());
        }
        Ok(Some(task))
    }

    /// Take a pending task this worker cannot decode and mark it failed, so it
    /// stops sitting at the head of the queue.
    async fn reject_undecodable(&self, raw: &Value, err: &serde_json::Error) -> Result<(), TransportError> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(TaskId::new)
            .ok_or_else(|| TransportError::Malformed(format!("pending task without an id: {}", err)))?;

        let body = json!({
            "status": TaskStatus::Claimed.wire_name(),
            "machine": self.worker_id,
        });
        let claimed = match self.client.patch_task_value(&id, &body).await {
            Ok(claimed) => claimed,
            Err(e) if e.kind() == ErrorKind::Conflict => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if claimed.get("machine").and_then(Value::as_str) != Some(self.worker_id.as_str()) {
            return Ok(());
        }
        self.fail_undecodable(&id, err).await
    }

    /// Mark a task owned by this worker failed because it could not be decoded.
    async fn fail_undecodable(&self, id: &TaskId, err: &serde_json::Error) -> Result<(), TransportError> {
        warn!(task_id = %id, error = %err, "Task could not be decoded, marking it failed");
        let mut data = TaskData::default();
        data.error(Diagnostic::new(
            "task",
            id.as_str(),
            format!("task could not be decoded: {}", err),
        ));
        let body = json!({
            "status": TaskStatus::Failed.wire_name(),
            "data": data.to_value(),
        });
        self.client.patch_task_value(id, &body).await?;
        Ok(())
    }
}

/// Undecodable pending tasks rejected per claim before giving the poll back.
const MAX_UNDECODABLE: usize = 8;

#[async_trait]
impl TaskTransport for HttpTransport {
    async fn claim_next(&self) -> Result<Option<Task>, TransportError> {
        let query = TaskQuery {
            statuses: vec![TaskStatus::Pending],
            limit: Some(1),
            ..TaskQuery::default()
        };
        for _ in 0..MAX_UNDECODABLE {
            let Some(raw) = self.client.list_task_values(&query).await?.into_iter().next() else {
                return Ok(None);
            };
            match serde_json::from_value::<Task>(raw.clone()) {
                Ok(candidate) => return self.claim(candidate).await,
                Err(e) => self.reject_undecodable(&raw, &e).await?,
            }
        }
        Ok(None)
    }

    async fn heartbeat(&self, task: &Task) -> Result<Heartbeat, TransportError> {
        let body = json!({ "machine": self.worker_id });
        match self.client.post_task_action(task, "heartbeat", &body).await {
            Ok(()) => Ok(Heartbeat::Alive),
            Err(e) if e.kind() == ErrorKind::Conflict || e.status() == Some(404) => {
                Ok(Heartbeat::LeaseExpired)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_running(&self, task: &Task) -> Result<(), TransportError> {
        let body = json!({ "status": TaskStatus::Running.wire_name() });
        self.client.patch_task(task, &body).await?;
        Ok(())
    }

    async fn fetch_inputs(&self, task: &Task, dir: &Path) -> Result<(), TransportError> {
        for infile in &task.infiles {
            if !is_relative_inside(&infile.name) {
                return Err(TransportError::Malformed(format!(
                    "input file name '{}' escapes the task directory",
                    infile.name
                )));
            }
            let link = infile.links.download.as_deref().ok_or_else(|| {
                TransportError::Malformed(format!("input file '{}' has no download link", infile.name))
            })?;

            let dest = dir.join(&infile.name);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| TransportError::Transient(e.to_string()))?;
            }
            let bytes = self.client.download(link, &dest).await?;
            debug!(task_id = %task.id, name = %infile.name, bytes, "Downloaded input file");
        }
        Ok(())
    }

    async fn submit_result(&self, task: &Task, submission: Submission<'_>) -> Result<(), TransportError> {
        self.finish(task, TaskStatus::Done, submission).await
    }

    async fn report_failure(&self, task: &Task, submission: Submission<'_>) -> Result<(), TransportError> {
        self.finish(task, TaskStatus::Failed, submission).await
    }

    async fn owned_tasks(&self) -> Result<Vec<Task>, TransportError> {
        let query = TaskQuery {
            statuses: vec![TaskStatus::Claimed, TaskStatus::Running],
            machine: Some(self.worker_id.clone()),
            limit: None,
        };
        let mut tasks = Vec::new();
        for raw in self.client.list_task_values(&query).await? {
            match serde_json::from_value::<Task>(raw.clone()) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    if raw.get("machine").and_then(Value::as_str) != Some(self.worker_id.as_str()) {
                        continue;
                    }
                    let Some(id) = raw.get("id").and_then(Value::as_str).map(TaskId::new) else {
                        warn!(error = %e, "Owned task without an id, ignoring");
                        continue;
                    };
                    if let Err(report) = self.fail_undecodable(&id, &e).await {
                        warn!(task_id = %id, error = %report, "Failed to report undecodable task");
                    }
                }
            }
        }
        let (owned, foreign): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|t| t.is_owned_by(&self.worker_id));
        if !foreign.is_empty() {
            warn!(count = foreign.len(), "Server returned tasks not owned by this worker, ignoring");
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Multipart, Path as UrlPath, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Minimal in-process FATMAN server.
    #[derive(Default)]
    struct Server {
        tasks: HashMap<String, Value>,
        order: Vec<String>,
        /// Claim PATCHes answer 409 when set.
        steal_claims: bool,
        /// Heartbeats answer 409 when set.
        expire_leases: bool,
        reject_auth: bool,
        uploads: Vec<(String, String)>,
        terminal_patches: usize,
    }

    type Shared = Arc<Mutex<Server>>;

    fn task_json(id: &str) -> Value {
        json!({
            "id": id,
            "status": "new",
            "machine": null,
            "settings": {"machine": {"runner": "direct"}, "commands": []},
            "outfiles": [],
            "_links": {
                "self": format!("/fatman/api/v2/tasks/{}", id),
                "uploads": format!("/fatman/api/v2/tasks/{}/uploads", id)
            }
        })
    }

    async fn list(
        State(s): State<Shared>,
        axum::extract::Query(q): axum::extract::Query<HashMap<String, String>>,
    ) -> Result<Json<Value>, StatusCode> {
        let s = s.lock().unwrap();
        if s.reject_auth {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let statuses: Vec<&str> = q.get("status").map(|v| v.split(',').collect()).unwrap_or_default();
        let limit: usize = q.get("limit").and_then(|l| l.parse().ok()).unwrap_or(usize::MAX);
        let tasks: Vec<Value> = s
            .order
            .iter()
            .map(|id| s.tasks[id].clone())
            .filter(|t| statuses.is_empty() || statuses.contains(&t["status"].as_str().unwrap_or("")))
            .filter(|t| q.get("machine").map_or(true, |m| t["machine"] == json!(m)))
            .take(limit)
            .collect();
        Ok(Json(Value::Array(tasks)))
    }

    async fn one(State(s): State<Shared>, UrlPath(id): UrlPath<String>) -> Result<Json<Value>, StatusCode> {
        let s = s.lock().unwrap();
        s.tasks.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
    }

    async fn patch(
        State(s): State<Shared>,
        UrlPath(id): UrlPath<String>,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, StatusCode> {
        let mut s = s.lock().unwrap();
        let steal = s.steal_claims;
        let task = s.tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
        if body["status"] == "pending" && (steal || task["status"] != "new") {
            return Err(StatusCode::CONFLICT);
        }
        if task["status"] == "done" || task["status"] == "error" {
            return Err(StatusCode::CONFLICT);
        }
        for (k, v) in body.as_object().unwrap() {
            task[k] = v.clone();
        }
        let result = task.clone();
        if body["status"] == "done" || body["status"] == "error" {
            s.terminal_patches += 1;
        }
        Ok(Json(result))
    }

    async fn heartbeat(State(s): State<Shared>, UrlPath(id): UrlPath<String>) -> StatusCode {
        let s = s.lock().unwrap();
        if !s.tasks.contains_key(&id) {
            StatusCode::NOT_FOUND
        } else if s.expire_leases {
            StatusCode::CONFLICT
        } else {
            StatusCode::OK
        }
    }

    async fn upload(
        State(s): State<Shared>,
        UrlPath(id): UrlPath<String>,
        mut multipart: Multipart,
    ) -> StatusCode {
        let mut name = None;
        while let Ok(Some(field)) = multipart.next_field().await {
            if field.name() == Some("name") {
                name = field.text().await.ok();
            }
        }
        let Some(name) = name else {
            return StatusCode::BAD_REQUEST;
        };
        let mut s = s.lock().unwrap();
        s.uploads.push((id.clone(), name.clone()));
        if let Some(task) = s.tasks.get_mut(&id) {
            if let Some(outfiles) = task["outfiles"].as_array_mut() {
                outfiles.push(json!({"name": name}));
            }
        }
        StatusCode::CREATED
    }

    async fn serve(ids: &[&str]) -> (HttpTransport, Shared) {
        let shared: Shared = Arc::default();
        {
            let mut s = shared.lock().unwrap();
            for id in ids {
                s.tasks.insert(id.to_string(), task_json(id));
                s.order.push(id.to_string());
            }
        }
        let app = Router::new()
            .route("/fatman/api/v2/tasks", get(list))
            .route("/fatman/api/v2/tasks/:id", get(one).patch(patch))
            .route("/fatman/api/v2/tasks/:id/heartbeat", post(heartbeat))
            .route("/fatman/api/v2/tasks/:id/uploads", post(upload))
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let client = ApiClient::new(&format!("http://{}/fatman", addr)).unwrap();
        (HttpTransport::new(client, WorkerId::new("node01")), shared)
    }

    #[tokio::test]
    async fn test_claim_next_marks_task_claimed() {
        let (transport, server) = serve(&["t1"]).await;

        let task = transport.claim_next().await.unwrap().unwrap();
        assert_eq!(task.id.as_str(), "t1");
        assert_eq!(task.status, TaskStatus::Claimed);
        assert!(task.claimed_at.is_some());
        assert_eq!(server.lock().unwrap().tasks["t1"]["machine"], "node01");

        assert!(transport.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_task_is_failed_and_skipped() {
        let (transport, server) = serve(&["bad", "t2"]).await;
        server.lock().unwrap().tasks.get_mut("bad").unwrap()["settings"]["commands"] = json!("oops");

        let task = transport.claim_next().await.unwrap().unwrap();
        assert_eq!(task.id.as_str(), "t2");

        let s = server.lock().unwrap();
        assert_eq!(s.tasks["bad"]["status"], "error");
        assert_eq!(s.tasks["bad"]["machine"], "node01");
        assert_eq!(s.tasks["bad"]["data"]["errors"][0]["tag"], "task");
        assert_eq!(s.terminal_patches, 1);
    }

    #[tokio::test]
    async fn test_lost_claim_race_is_not_an_error() {
        let (transport, server) = serve(&["t1"]).await;
        server.lock().unwrap().steal_claims = true;

        assert!(transport.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_reports_expired_lease() {
        let (transport, server) = serve(&["t1"]).await;
        let task = transport.claim_next().await.unwrap().unwrap();

        assert_eq!(transport.heartbeat(&task).await.unwrap(), Heartbeat::Alive);
        server.lock().unwrap().expire_leases = true;
        assert_eq!(transport.heartbeat(&task).await.unwrap(), Heartbeat::LeaseExpired);
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_auth_errors() {
        let (transport, server) = serve(&["t1"]).await;
        server.lock().unwrap().reject_auth = true;

        let err = transport.claim_next().await.unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));
    }

    #[tokio::test]
    async fn test_submit_result_is_idempotent() {
        let (transport, server) = serve(&["t1"]).await;
        let task = transport.claim_next().await.unwrap().unwrap();
        transport.mark_running(&task).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.out");
        std::fs::write(&path, "output").unwrap();
        let artifacts = vec![Artifact {
            name: "run.out".to_string(),
            path,
        }];
        let data = TaskData::default();
        let submission = Submission {
            artifacts: &artifacts,
            data: &data,
        };

        transport.submit_result(&task, submission).await.unwrap();
        let after_first = server.lock().unwrap().tasks["t1"].clone();

        transport.submit_result(&task, submission).await.unwrap();
        let s = server.lock().unwrap();
        assert_eq!(s.tasks["t1"], after_first);
        assert_eq!(s.tasks["t1"]["status"], "done");
        assert_eq!(s.uploads.len(), 1);
        assert_eq!(s.terminal_patches, 1);
    }

    #[tokio::test]
    async fn test_report_failure_records_diagnostics() {
        let (transport, server) = serve(&["t1"]).await;
        let task = transport.claim_next().await.unwrap().unwrap();

        let mut data = TaskData::default();
        data.error(fatman_core::Diagnostic::new("timeout", "t1", "too slow"));
        let submission = Submission {
            artifacts: &[],
            data: &data,
        };
        transport.report_failure(&task, submission).await.unwrap();
        transport.report_failure(&task, submission).await.unwrap();

        let s = server.lock().unwrap();
        assert_eq!(s.tasks["t1"]["status"], "error");
        assert_eq!(s.tasks["t1"]["data"]["errors"][0]["tag"], "timeout");
        assert_eq!(s.terminal_patches, 1);
    }

    #[tokio::test]
    async fn test_submit_after_reassignment_conflicts() {
        let (transport, server) = serve(&["t1"]).await;
        let task = transport.claim_next().await.unwrap().unwrap();
        server.lock().unwrap().tasks.get_mut("t1").unwrap()["machine"] = json!("node02");

        let data = TaskData::default();
        let err = transport
            .submit_result(&task, Submission { artifacts: &[], data: &data })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_owned_tasks() {
        let (transport, _server) = serve(&["t1", "t2"]).await;
        let claimed = transport.claim_next().await.unwrap().unwrap();

        let owned = transport.owned_tasks().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, claimed.id);
    }

    #[tokio::test]
    async fn test_fetch_inputs_rejects_escaping_names() {
        let (transport, _server) = serve(&[]).await;
        let mut task = Task::new("t1");
        task.infiles.push(fatman_core::FileRef {
            name: "../evil".to_string(),
            links: fatman_core::FileLinks {
                download: Some("/x".to_string()),
            },
        });
        let dir = tempfile::tempdir().unwrap();

        let err = transport.fetch_inputs(&task, dir.path()).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }
}
