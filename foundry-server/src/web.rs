//! HTTP surface of the broker.
//!
//! JSON in, JSON out. Validation failures are answered synchronously with a
//! 4xx and never reach a queue. Report-triggered repository writes run in the
//! background so the response path never waits on git.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use foundry_sdk::protocol::{
    BrokerStats, CollaborationRequest, FileContent, PullResponse, Report, Role, RoleActivity,
    StatusEntry, StructureEnvelope, SubmitAck, SubtaskEnvelope, SupervisorReport, TaskState,
};
use foundry_sdk::structure::ProjectStructure;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::broker::{Broker, SubmitError, SubtaskDraft};
use crate::repo::{self, RepoError};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

static START_TIME: OnceLock<SystemTime> = OnceLock::new();

// ── Axum router ────────────────────────────────────────────────────────

pub fn router(broker: Arc<Broker>) -> Router {
    START_TIME.get_or_init(SystemTime::now);
    Router::new()
        .route("/health", get(health))
        // Core protocol
        .route("/structure", get(get_structure).post(post_structure))
        .route("/subtask", post(post_subtask))
        .route("/task/{role}", get(pull_task))
        .route("/report", post(post_report))
        .route("/subtask_status/{id}", get(subtask_status))
        .route("/all_subtask_statuses", get(all_subtask_statuses))
        .route("/file_content", get(file_content))
        // Ledger views
        .route("/file_statuses", get(file_statuses))
        .route("/subtask_metrics/{id}", get(subtask_metrics))
        .route("/worker_status", get(worker_status))
        .route("/stats", get(stats))
        // Supervisor
        .route("/supervisor_report", get(get_supervisor_report).post(post_supervisor_report))
        .route("/collaboration", get(get_collaboration).post(post_collaboration))
        .route("/clear", post(clear))
        .layer(CorsLayer::permissive())
        .with_state(broker)
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn parse_role(role: &str) -> Result<Role, (StatusCode, String)> {
    role.parse::<Role>().map_err(|e| bad_request(e.to_string()))
}

// ── Handlers ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

async fn health() -> Json<HealthResponse> {
    let uptime_secs = START_TIME
        .get_or_init(SystemTime::now)
        .elapsed()
        .unwrap_or_default()
        .as_secs();
    Json(HealthResponse {
        status: "ok",
        uptime_secs,
    })
}

async fn get_structure(State(broker): State<Arc<Broker>>) -> Json<StructureEnvelope> {
    Json(StructureEnvelope {
        structure: broker.structure(),
    })
}

/// Parsed straight from the request bytes so the tree keeps its key order.
#[derive(Deserialize)]
struct StructureBody {
    structure: Option<ProjectStructure>,
}

async fn post_structure(State(broker): State<Arc<Broker>>, body: Bytes) -> ApiResult<Value> {
    let body: StructureBody =
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid structure: {e}")))?;
    let structure = body
        .structure
        .ok_or_else(|| bad_request("'structure' must be a JSON object"))?;
    broker.set_structure(structure);
    Ok(Json(json!({ "status": "structure received" })))
}

async fn post_subtask(
    State(broker): State<Arc<Broker>>,
    Json(body): Json<SubtaskEnvelope<SubtaskDraft>>,
) -> ApiResult<SubmitAck> {
    let subtask = body.subtask.validate().map_err(submit_rejection)?;
    let id = subtask.id.clone();
    broker.submit(subtask).map_err(submit_rejection)?;
    Ok(Json(SubmitAck {
        status: "subtask received".to_string(),
        id,
    }))
}

fn submit_rejection(e: SubmitError) -> (StatusCode, String) {
    tracing::warn!("Rejected subtask: {e}");
    bad_request(e.to_string())
}

async fn pull_task(
    State(broker): State<Arc<Broker>>,
    Path(role): Path<String>,
) -> ApiResult<PullResponse> {
    let role = parse_role(&role)?;
    Ok(Json(match broker.pull(role) {
        Some(subtask) => PullResponse::Task { subtask },
        None => PullResponse::Empty {
            message: format!("No tasks available for {role}"),
        },
    }))
}

async fn post_report(State(broker): State<Arc<Broker>>, Json(report): Json<Report>) -> Json<Value> {
    let (status, _write) = broker.apply_report(&report);
    Json(json!({
        "status": "report received",
        "subtask_id": report.subtask_id(),
        "state": status,
    }))
}

async fn subtask_status(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> ApiResult<StatusEntry> {
    let status = broker
        .status(&id)
        .ok_or((StatusCode::NOT_FOUND, format!("Subtask {id} not found")))?;
    Ok(Json(StatusEntry {
        subtask_id: id,
        status,
    }))
}

async fn all_subtask_statuses(State(broker): State<Arc<Broker>>) -> Json<HashMap<String, TaskState>> {
    Json(broker.all_statuses())
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn file_content(
    State(broker): State<Arc<Broker>>,
    Query(q): Query<FileQuery>,
) -> ApiResult<FileContent> {
    let root = broker.repository().root().to_path_buf();
    let path = q.path.clone();
    let content = tokio::task::spawn_blocking(move || repo::read_text(&root, &path))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| match e {
            RepoError::UnsafePath(_) => (StatusCode::FORBIDDEN, e.to_string()),
            RepoError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            RepoError::IsDirectory(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            other => {
                tracing::error!("Failed to read {}: {other}", q.path);
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        })?;
    Ok(Json(FileContent {
        path: q.path,
        content,
    }))
}

async fn file_statuses(
    State(broker): State<Arc<Broker>>,
) -> Json<BTreeMap<String, BTreeMap<Role, TaskState>>> {
    Json(broker.file_statuses())
}

async fn subtask_metrics(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let metrics = broker
        .metrics(&id)
        .ok_or((StatusCode::NOT_FOUND, format!("No metrics for subtask {id}")))?;
    Ok(Json(json!({ "subtask_id": id, "metrics": metrics })))
}

async fn worker_status(State(broker): State<Arc<Broker>>) -> Json<BTreeMap<Role, RoleActivity>> {
    Json(broker.worker_status())
}

async fn stats(State(broker): State<Arc<Broker>>) -> Json<BrokerStats> {
    Json(broker.stats())
}

#[derive(Deserialize)]
struct SupervisorReportBody {
    status: Option<String>,
    #[serde(default)]
    details: serde_json::Map<String, Value>,
}

async fn post_supervisor_report(
    State(broker): State<Arc<Broker>>,
    Json(body): Json<SupervisorReportBody>,
) -> ApiResult<Value> {
    let status = body
        .status
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| bad_request("Missing 'status' in supervisor report"))?;
    broker.set_supervisor_report(SupervisorReport {
        status,
        details: body.details,
    });
    Ok(Json(json!({ "status": "received" })))
}

async fn get_supervisor_report(State(broker): State<Arc<Broker>>) -> Json<SupervisorReport> {
    Json(broker.supervisor_report())
}

async fn post_collaboration(
    State(broker): State<Arc<Broker>>,
    Json(request): Json<CollaborationRequest>,
) -> Json<Value> {
    broker.add_collaboration(request);
    Json(json!({ "status": "collaboration request logged" }))
}

async fn get_collaboration(State(broker): State<Arc<Broker>>) -> Json<Value> {
    Json(json!({ "collaboration_requests": broker.collaboration() }))
}

async fn clear(State(broker): State<Arc<Broker>>) -> Json<Value> {
    broker.clear();
    Json(json!({ "status": "state cleared" }))
}
