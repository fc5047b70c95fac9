//! Wire types exchanged with the broker.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::structure::ProjectStructure;

// ── Roles ──────────────────────────────────────────────────────────────

/// A worker role. Each role has its own FIFO queue at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Writes the file itself.
    Executor,
    /// Writes unit tests for an executor's output.
    Tester,
    /// Writes documentation for an executor's output.
    Documenter,
}

impl Role {
    /// All roles, in dispatch priority order.
    pub const ALL: [Role; 3] = [Role::Executor, Role::Tester, Role::Documenter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Executor => "executor",
            Role::Tester => "tester",
            Role::Documenter => "documenter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}' (expected executor, tester or documenter)")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "executor" => Ok(Role::Executor),
            "tester" => Ok(Role::Tester),
            "documenter" => Ok(Role::Documenter),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

// ── Lifecycle states ───────────────────────────────────────────────────

/// Lifecycle token for a subtask (broker ledger) or a `(file, role)` slot
/// (coordinator board).
///
/// Serialized as a bare string. Tokens this build does not recognise are
/// kept verbatim in [`TaskState::Other`] so the ledger stays schemaless.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskState {
    Pending,
    Sending,
    Sent,
    /// Pulled by a worker, no report yet.
    Processing,
    CodeReceived,
    Tested,
    FetchFailed,
    FailedToSend,
    Accepted,
    ReviewNeeded,
    FailedTests,
    /// Worker finished without a more specific result.
    CompletedByWorker,
    /// Worker gave up (generation exhausted, bad subtask, role mismatch).
    FailedByWorker,
    ErrorProcessing,
    Skipped,
    /// Default for a `status_update` that names no status.
    Updated,
    Other(String),
}

impl TaskState {
    pub fn as_str(&self) -> &str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Sending => "sending",
            TaskState::Sent => "sent",
            TaskState::Processing => "processing",
            TaskState::CodeReceived => "code_received",
            TaskState::Tested => "tested",
            TaskState::FetchFailed => "fetch_failed",
            TaskState::FailedToSend => "failed_to_send",
            TaskState::Accepted => "accepted",
            TaskState::ReviewNeeded => "review_needed",
            TaskState::FailedTests => "failed_tests",
            TaskState::CompletedByWorker => "completed_by_ai2",
            TaskState::FailedByWorker => "failed_by_ai2",
            TaskState::ErrorProcessing => "error_processing",
            TaskState::Skipped => "skipped",
            TaskState::Updated => "updated",
            TaskState::Other(s) => s,
        }
    }

    /// No further automatic transition happens from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Accepted
                | TaskState::Skipped
                | TaskState::FailedByWorker
                | TaskState::ErrorProcessing
                | TaskState::ReviewNeeded
        )
    }

    /// Executor states that unblock the tester and documenter of a file.
    pub fn is_executor_done(&self) -> bool {
        matches!(
            self,
            TaskState::CodeReceived
                | TaskState::Tested
                | TaskState::Accepted
                | TaskState::CompletedByWorker
                | TaskState::ReviewNeeded
                | TaskState::FailedTests
        )
    }

    /// Local dispatch failures that go back to `pending` on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskState::FetchFailed | TaskState::FailedToSend)
    }

    /// Dispatched and not yet terminal.
    pub fn is_in_flight(&self) -> bool {
        !(self.is_terminal() || self.is_retryable() || *self == TaskState::Pending)
    }

    /// The terminal state a worker result is closed out with, if this is a
    /// result state at all.
    pub fn verdict(&self) -> Option<TaskState> {
        match self {
            TaskState::CodeReceived | TaskState::Tested | TaskState::CompletedByWorker => {
                Some(TaskState::Accepted)
            }
            TaskState::FailedTests => Some(TaskState::ReviewNeeded),
            _ => None,
        }
    }
}

impl From<&str> for TaskState {
    fn from(s: &str) -> Self {
        match s {
            "pending" => TaskState::Pending,
            "sending" => TaskState::Sending,
            "sent" => TaskState::Sent,
            "processing" => TaskState::Processing,
            "code_received" => TaskState::CodeReceived,
            "tested" => TaskState::Tested,
            "fetch_failed" => TaskState::FetchFailed,
            "failed_to_send" => TaskState::FailedToSend,
            "accepted" => TaskState::Accepted,
            "review_needed" => TaskState::ReviewNeeded,
            "failed_tests" => TaskState::FailedTests,
            "completed_by_ai2" => TaskState::CompletedByWorker,
            "failed_by_ai2" => TaskState::FailedByWorker,
            "error_processing" => TaskState::ErrorProcessing,
            "skipped" => TaskState::Skipped,
            "updated" => TaskState::Updated,
            other => TaskState::Other(other.to_string()),
        }
    }
}

impl From<String> for TaskState {
    fn from(s: String) -> Self {
        TaskState::from(s.as_str())
    }
}

impl From<TaskState> for String {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Subtasks and reports ───────────────────────────────────────────────

/// One unit of generation work for a single file and role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    /// Instruction text for the worker.
    pub text: String,
    pub role: Role,
    pub filename: String,
    /// Current file content, required by tester and documenter subtasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Numeric test metrics attached to a `test_result` report.
pub type Metrics = BTreeMap<String, f64>;

/// Metrics stored when a `test_result` arrives without any.
pub fn default_metrics() -> Metrics {
    Metrics::from([("tests_passed".to_string(), 0.0), ("coverage".to_string(), 0.0)])
}

/// A worker's outcome for one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    /// Generated file content, written to `file` in the repository.
    Code {
        subtask_id: String,
        file: String,
        content: String,
    },
    /// Generated tests; `content`, when present, is written to `file`.
    TestResult {
        subtask_id: String,
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<Metrics>,
    },
    /// Explicit state change, usually a failure with a diagnostic message.
    StatusUpdate {
        subtask_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Report {
    /// Build a `status_update` carrying an explicit state.
    pub fn status(subtask_id: impl Into<String>, state: TaskState, message: Option<String>) -> Self {
        Report::StatusUpdate {
            subtask_id: subtask_id.into(),
            file: None,
            status: Some(state.into()),
            message,
        }
    }

    pub fn subtask_id(&self) -> &str {
        match self {
            Report::Code { subtask_id, .. }
            | Report::TestResult { subtask_id, .. }
            | Report::StatusUpdate { subtask_id, .. } => subtask_id,
        }
    }

    /// Ledger state the broker records for this report.
    pub fn ledger_state(&self) -> TaskState {
        match self {
            Report::Code { .. } => TaskState::CodeReceived,
            Report::TestResult { .. } => TaskState::Tested,
            Report::StatusUpdate { status: Some(s), .. } if !s.trim().is_empty() => {
                TaskState::from(s.trim())
            }
            Report::StatusUpdate { .. } => TaskState::Updated,
        }
    }

    /// `(path, content)` the broker should write and commit, if any.
    pub fn write_target(&self) -> Option<(&str, &str)> {
        match self {
            Report::Code { file, content, .. } => Some((file, content)),
            Report::TestResult {
                file,
                content: Some(content),
                ..
            } => Some((file, content)),
            _ => None,
        }
    }
}

// ── Endpoint bodies ────────────────────────────────────────────────────

/// `POST /subtask` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskEnvelope<T = Subtask> {
    pub subtask: T,
}

/// Broker acknowledgement for an accepted subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub status: String,
    pub id: String,
}

/// `GET /task/{role}` response: a subtask, or a message when the queue is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponse {
    Task { subtask: Subtask },
    Empty { message: String },
}

/// `GET /subtask_status/{id}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub subtask_id: String,
    pub status: TaskState,
}

/// `GET /file_content` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

/// `POST /structure` body and `GET /structure` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureEnvelope {
    pub structure: ProjectStructure,
}

/// Role activity as observed by the broker through pulls and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Idle,
    Busy,
}

/// One entry of `GET /worker_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleActivity {
    pub status: Activity,
    pub queue_length: usize,
    pub queue_empty: bool,
    /// Subtasks pulled by this role and not yet reported.
    pub in_progress: usize,
    pub last_poll: Option<DateTime<Utc>>,
}

/// `GET /stats` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub queue_lengths: BTreeMap<Role, usize>,
    pub states: BTreeMap<String, usize>,
    pub commits: u64,
}

/// Status report posted by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// A remediation request logged at the broker for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRequest {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
}
