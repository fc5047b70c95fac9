//! Supervisor: plans the project structure and watches the pipeline.
//!
//! Planning asks a generator for a JSON blueprint and hands it to the broker.
//! Monitoring never changes queues or ledger states; it only files
//! remediation requests and a periodic status report for operators.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use foundry_sdk::client::{BrokerApi, BrokerClient};
use foundry_sdk::protocol::{Activity, CollaborationRequest, Role, SupervisorReport, TaskState};
use foundry_sdk::structure::ProjectStructure;
use regex::Regex;
use serde_json::json;
use tokio::time::Instant;

use crate::config::{GenerationConfig, SupervisorConfig};
use crate::llm::{GenerateError, Generator};
use crate::ticker::Ticker;

/// Most log lines forwarded per monitoring pass.
const MAX_LOG_LINES_PER_PASS: usize = 5;

const PLANNER_SYSTEM_PROMPT: &str =
    "You are a software architect. You design file layouts for new projects.";

fn planning_prompt(target: &str) -> String {
    format!(
        r#"Generate a JSON structure for a project with the target: "{target}".
Respond ONLY with the JSON structure itself, enclosed in triple backticks (```json ... ```).
The structure should be a valid JSON object representing directories and files. Use null for files.
Example:
```json
{{
  "src": {{
    "main.py": null,
    "utils.py": null
  }},
  "tests": {{
    "test_main.py": null
  }},
  "README.md": null,
  ".gitignore": null
}}
```
Do not include any explanatory text before or after the JSON block. Ensure the JSON is well-formed."#
    )
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error("no JSON object in planner response")]
    NoJson,
    #[error("invalid structure: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("planner produced a structure without files")]
    Empty,
}

/// The JSON object inside a ```json fence, or the whole response if it is a
/// bare object.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let fenced = Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").ok()?;
    if let Some(m) = fenced.captures(text).and_then(|c| c.get(1)) {
        return Some(m.as_str());
    }
    let trimmed = text.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}')).then_some(trimmed)
}

/// Ask the generator for a project structure for `target`.
pub async fn plan_structure(
    generator: &dyn Generator,
    generation: &GenerationConfig,
    target: &str,
) -> Result<ProjectStructure, PlanError> {
    let request = generation.request(PLANNER_SYSTEM_PROMPT, planning_prompt(target));
    let response = generator.generate(&request).await?;
    let json = extract_json_block(&response).ok_or_else(|| {
        let preview: String = response.chars().take(200).collect();
        tracing::warn!("No JSON in planner response: {preview}");
        PlanError::NoJson
    })?;
    let structure: ProjectStructure = serde_json::from_str(json)?;
    if structure.files().is_empty() {
        return Err(PlanError::Empty);
    }
    Ok(structure)
}

/// Plan a structure, submit it to the broker and report the outcome.
pub async fn plan(
    client: &BrokerClient,
    generator: &dyn Generator,
    generation: &GenerationConfig,
    target: &str,
) -> Result<ProjectStructure> {
    tracing::info!("Planning project structure for: {target}");
    let structure = match plan_structure(generator, generation, target).await {
        Ok(structure) => structure,
        Err(e) => {
            let report = SupervisorReport {
                status: "structure_creation_failed".to_string(),
                details: details(json!({ "error": e.to_string() })),
            };
            if let Err(post) = client.submit_supervisor_report(&report).await {
                tracing::warn!("Could not post supervisor report: {post}");
            }
            return Err(e).context("Structure planning failed");
        }
    };

    client
        .submit_structure(&structure)
        .await
        .context("Failed to submit structure to broker")?;
    let files = structure.files();
    tracing::info!("Submitted structure with {} files", files.len());

    let report = SupervisorReport {
        status: "structure_created".to_string(),
        details: details(json!({ "files": files.len() })),
    };
    if let Err(e) = client.submit_supervisor_report(&report).await {
        tracing::warn!("Could not post supervisor report: {e}");
    }
    Ok(structure)
}

fn details(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

// ── Monitoring ─────────────────────────────────────────────────────────

/// What one monitoring pass found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub stalled_roles: Vec<Role>,
    pub new_failures: Vec<String>,
    pub log_errors: Vec<String>,
    pub requests_sent: usize,
}

pub struct Supervisor {
    client: BrokerClient,
    config: SupervisorConfig,
    log_pattern: Regex,
    stalled_since: HashMap<Role, Instant>,
    reported_stalls: HashSet<Role>,
    seen_failures: HashSet<String>,
    log_offset: u64,
    passes: u64,
    requests_total: u64,
}

impl Supervisor {
    pub fn new(client: BrokerClient, config: SupervisorConfig) -> Result<Self> {
        Ok(Self {
            client,
            config,
            log_pattern: Regex::new(r"(?i)(ERROR|CRITICAL)")?,
            stalled_since: HashMap::new(),
            reported_stalls: HashSet::new(),
            seen_failures: HashSet::new(),
            log_offset: 0,
            passes: 0,
            requests_total: 0,
        })
    }

    pub async fn run(&mut self, ticker: &mut dyn Ticker) {
        tracing::info!("Supervisor monitoring {}", self.client.base_url());
        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            match self.pass().await {
                Ok(summary) => tracing::debug!("Monitoring pass: {summary:?}"),
                Err(e) => tracing::warn!("Monitoring pass failed: {e:#}"),
            }
            ticker.wait(interval).await;
        }
    }

    /// One monitoring pass: stalls, new failures, log errors, status report.
    pub async fn pass(&mut self) -> Result<PassSummary> {
        let mut requests = Vec::new();
        let mut summary = PassSummary::default();

        let workers = self.client.worker_status().await.context("worker_status")?;
        let stall_after = Duration::from_secs(self.config.stall_after_secs);
        for (role, activity) in workers {
            if activity.status == Activity::Idle && activity.queue_length > 0 {
                let since = *self.stalled_since.entry(role).or_insert_with(Instant::now);
                if since.elapsed() >= stall_after && self.reported_stalls.insert(role) {
                    summary.stalled_roles.push(role);
                    requests.push(CollaborationRequest {
                        kind: "stalled_worker".to_string(),
                        message: format!(
                            "{} subtasks queued for {role} but no {role} worker is processing them",
                            activity.queue_length
                        ),
                        role: Some(role),
                        subtask_id: None,
                    });
                }
            } else {
                self.stalled_since.remove(&role);
                self.reported_stalls.remove(&role);
            }
        }

        let statuses = self.client.all_statuses().await.context("all_subtask_statuses")?;
        let mut failed: Vec<(String, TaskState)> = statuses
            .into_iter()
            .filter(|(id, s)| {
                matches!(s, TaskState::FailedByWorker | TaskState::ErrorProcessing)
                    && !self.seen_failures.contains(id)
            })
            .collect();
        failed.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, state) in failed {
            requests.push(CollaborationRequest {
                kind: "failed_subtask".to_string(),
                message: format!("Subtask {id} ended {state} and needs review"),
                role: None,
                subtask_id: Some(id.clone()),
            });
            self.seen_failures.insert(id.clone());
            summary.new_failures.push(id);
        }

        if let Some(path) = self.config.log_file.clone() {
            summary.log_errors = self.tail_log(&path).await;
            for line in &summary.log_errors {
                requests.push(CollaborationRequest {
                    kind: "log_error".to_string(),
                    message: line.clone(),
                    role: None,
                    subtask_id: None,
                });
            }
        }

        for request in &requests {
            match self.client.request_collaboration(request).await {
                Ok(()) => summary.requests_sent += 1,
                Err(e) => tracing::warn!("Could not file {} request: {e}", request.kind),
            }
        }
        self.requests_total += summary.requests_sent as u64;
        self.passes += 1;

        let report = SupervisorReport {
            status: "monitoring".to_string(),
            details: details(json!({
                "passes": self.passes,
                "stalled_roles": summary.stalled_roles,
                "new_failures": summary.new_failures.len(),
                "log_errors": summary.log_errors.len(),
                "requests_total": self.requests_total,
                "checked_at": chrono::Utc::now().to_rfc3339(),
            })),
        };
        self.client
            .submit_supervisor_report(&report)
            .await
            .context("supervisor_report")?;
        Ok(summary)
    }

    /// New matching lines since the last read, at most
    /// [`MAX_LOG_LINES_PER_PASS`]. A truncated file is read from the start.
    async fn tail_log(&mut self, path: &Path) -> Vec<String> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Cannot read {}: {e}", path.display());
                return Vec::new();
            }
        };
        let len = bytes.len() as u64;
        if len < self.log_offset {
            self.log_offset = 0;
        }
        let start = usize::try_from(self.log_offset).unwrap_or(bytes.len()).min(bytes.len());
        self.log_offset = len;

        String::from_utf8_lossy(&bytes[start..])
            .lines()
            .filter(|line| self.log_pattern.is_match(line))
            .take(MAX_LOG_LINES_PER_PASS)
            .map(|line| line.trim().to_string())
            .collect()
    }
}
