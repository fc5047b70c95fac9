//! HTTP client for the broker.
//!
//! [`BrokerApi`] is the slice of the protocol the coordinator and workers
//! depend on; [`BrokerClient`] implements it over `reqwest` and adds the
//! supervisor endpoints.
//!
//! The client never retries on its own. Callers own their retry cadence:
//! a transport error or rejection simply leaves the entity re-dispatchable.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::protocol::{
    BrokerStats, CollaborationRequest, FileContent, PullResponse, Report, Role, RoleActivity,
    StatusEntry, StructureEnvelope, SubmitAck, Subtask, SubtaskEnvelope, SupervisorReport,
    TaskState,
};
use crate::structure::ProjectStructure;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("broker request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("broker rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected broker response: {0}")]
    Unexpected(String),
}

impl ClientError {
    /// Timeouts and connection failures, as opposed to broker rejections.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Broker operations used by the coordinator and role-workers.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// The submitted blueprint, or `None` while the broker has none.
    async fn fetch_structure(&self) -> Result<Option<ProjectStructure>>;

    /// Enqueue a subtask; returns the id the broker acknowledged.
    async fn submit_subtask(&self, subtask: &Subtask) -> Result<String>;

    /// Non-blocking pull; `None` when the role's queue is empty.
    async fn pull_task(&self, role: Role) -> Result<Option<Subtask>>;

    async fn submit_report(&self, report: &Report) -> Result<()>;

    async fn all_statuses(&self) -> Result<HashMap<String, TaskState>>;

    /// Current text of a repository file; `None` if the broker has no such file.
    async fn file_content(&self, path: &str) -> Result<Option<String>>;
}

/// `reqwest`-backed broker client.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(self.url(path)).timeout(self.timeout).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn health(&self) -> Result<()> {
        let _: serde_json::Value = self.get_json("/health").await?;
        Ok(())
    }

    pub async fn submit_structure(&self, structure: &ProjectStructure) -> Result<()> {
        let body = StructureEnvelope {
            structure: structure.clone(),
        };
        let _: serde_json::Value = self.post_json("/structure", &body).await?;
        Ok(())
    }

    pub async fn subtask_status(&self, id: &str) -> Result<Option<TaskState>> {
        let resp = self
            .http
            .get(self.url(&format!("/subtask_status/{id}")))
            .timeout(self.timeout)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry: StatusEntry = check(resp).await?.json().await?;
        Ok(Some(entry.status))
    }

    pub async fn file_statuses(&self) -> Result<BTreeMap<String, BTreeMap<Role, TaskState>>> {
        self.get_json("/file_statuses").await
    }

    pub async fn worker_status(&self) -> Result<BTreeMap<Role, RoleActivity>> {
        self.get_json("/worker_status").await
    }

    pub async fn stats(&self) -> Result<BrokerStats> {
        self.get_json("/stats").await
    }

    pub async fn submit_supervisor_report(&self, report: &SupervisorReport) -> Result<()> {
        let _: serde_json::Value = self.post_json("/supervisor_report", report).await?;
        Ok(())
    }

    pub async fn request_collaboration(&self, request: &CollaborationRequest) -> Result<()> {
        let _: serde_json::Value = self.post_json("/collaboration", request).await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn fetch_structure(&self) -> Result<Option<ProjectStructure>> {
        let envelope: StructureEnvelope = self.get_json("/structure").await?;
        Ok(Some(envelope.structure).filter(|s| !s.is_empty()))
    }

    async fn submit_subtask(&self, subtask: &Subtask) -> Result<String> {
        let ack: SubmitAck = self
            .post_json("/subtask", &SubtaskEnvelope { subtask })
            .await?;
        if ack.id != subtask.id {
            return Err(ClientError::Unexpected(format!(
                "broker acknowledged id {} for subtask {}",
                ack.id, subtask.id
            )));
        }
        Ok(ack.id)
    }

    async fn pull_task(&self, role: Role) -> Result<Option<Subtask>> {
        let response: PullResponse = self.get_json(&format!("/task/{role}")).await?;
        match response {
            PullResponse::Task { subtask } => Ok(Some(subtask)),
            PullResponse::Empty { message } => {
                tracing::debug!("{message}");
                Ok(None)
            }
        }
    }

    async fn submit_report(&self, report: &Report) -> Result<()> {
        let _: serde_json::Value = self.post_json("/report", report).await?;
        Ok(())
    }

    async fn all_statuses(&self) -> Result<HashMap<String, TaskState>> {
        self.get_json("/all_subtask_statuses").await
    }

    async fn file_content(&self, path: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(self.url("/file_content"))
            .query(&[("path", path)])
            .timeout(self.timeout)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let file: FileContent = check(resp).await?.json().await?;
        Ok(Some(file.content))
    }
}

/// Turn a non-2xx response into [`ClientError::Rejected`].
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Rejected {
        status: status.as_u16(),
        body,
    })
}
