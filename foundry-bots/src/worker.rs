//! Role-worker: pull one subtask, generate, report, repeat.
//!
//! A worker never holds more than one subtask. Every pulled subtask ends in
//! exactly one report, failures included, so nothing vanishes from the ledger.

use std::sync::Arc;
use std::time::Duration;

use foundry_sdk::client::{BrokerApi, ClientError};
use foundry_sdk::paths;
use foundry_sdk::protocol::{Metrics, Report, Role, Subtask, TaskState};
use tokio::time::Instant;

use crate::config::{GenerationConfig, WorkerConfig};
use crate::llm::{self, Generator};
use crate::ticker::Ticker;

/// Built-in system prompt for a role. `{filename}` is substituted.
pub fn default_system_prompt(role: Role) -> &'static str {
    match role {
        Role::Executor => {
            "You are an expert programmer. Create the content for the file {filename} based on the following task description. Respond ONLY with the raw file content. Do NOT use markdown code blocks (```)."
        }
        Role::Tester => {
            "You are a testing expert. Generate unit tests for the code in file {filename}. Respond ONLY with the raw test code. Do NOT use markdown code blocks (```)."
        }
        Role::Documenter => {
            "You are a technical writer. Generate documentation (e.g., docstrings, comments) for the code in file {filename}. Respond ONLY with the raw documentation text. Do NOT use markdown code blocks (```)."
        }
    }
}

fn user_prompt(role: Role, subtask: &Subtask, code: &str) -> String {
    let file = &subtask.filename;
    match role {
        Role::Executor => format!(
            "Task Description: {}\n\nPlease generate the content for the file '{file}' based on this task.",
            subtask.text
        ),
        Role::Tester => format!(
            "Code for file '{file}':\n```\n{code}\n```\n\nPlease generate unit tests for this code."
        ),
        Role::Documenter => format!(
            "Code for file '{file}':\n```\n{code}\n```\n\nPlease generate documentation (e.g., docstrings, comments) for this code."
        ),
    }
}

pub struct Worker {
    role: Role,
    broker: Arc<dyn BrokerApi>,
    generator: Arc<dyn Generator>,
    config: WorkerConfig,
    generation: GenerationConfig,
}

impl Worker {
    pub fn new(
        role: Role,
        broker: Arc<dyn BrokerApi>,
        generator: Arc<dyn Generator>,
        config: WorkerConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            role,
            broker,
            generator,
            config,
            generation,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn system_prompt(&self, filename: &str) -> String {
        self.config
            .system_prompts
            .get(self.role.as_str())
            .map(String::as_str)
            .unwrap_or_else(|| default_system_prompt(self.role))
            .replace("{filename}", filename)
    }

    /// Turn one subtask into its report. Never fails: problems become a
    /// `failed_by_ai2` status update.
    pub async fn process(&self, subtask: &Subtask) -> Report {
        let fail = |message: String| {
            tracing::warn!("Subtask {} failed: {message}", subtask.id);
            Report::StatusUpdate {
                subtask_id: subtask.id.clone(),
                file: Some(subtask.filename.clone()).filter(|f| !f.is_empty()),
                status: Some(TaskState::FailedByWorker.into()),
                message: Some(message),
            }
        };

        if subtask.filename.trim().is_empty() {
            return fail("subtask has no filename".to_string());
        }
        if subtask.role != self.role {
            return fail(format!(
                "{} worker received a {} subtask",
                self.role, subtask.role
            ));
        }
        let code = match self.role {
            Role::Executor if subtask.text.trim().is_empty() => {
                return fail("executor subtask has no task description".to_string());
            }
            Role::Executor => "",
            _ => match subtask.code.as_deref() {
                Some(code) if !code.trim().is_empty() => code,
                _ => return fail(format!("no code provided for {}", subtask.filename)),
            },
        };

        let request = self.generation.request(
            self.system_prompt(&subtask.filename),
            user_prompt(self.role, subtask, code),
        );
        let started = Instant::now();
        let content = match self.generator.generate(&request).await {
            Ok(text) => llm::strip_code_fences(&text),
            Err(e) => return fail(format!("generation failed: {e}")),
        };
        if content.trim().is_empty() {
            return fail("generation returned only whitespace".to_string());
        }
        let elapsed = started.elapsed();
        tracing::info!(
            "Generated {} bytes for {} ({}) in {:.1}s",
            content.len(),
            subtask.filename,
            self.role,
            elapsed.as_secs_f64()
        );

        match self.role {
            Role::Executor => Report::Code {
                subtask_id: subtask.id.clone(),
                file: subtask.filename.clone(),
                content,
            },
            Role::Tester => {
                let metrics = Metrics::from([
                    ("generation_secs".to_string(), elapsed.as_secs_f64()),
                    ("content_bytes".to_string(), content.len() as f64),
                ]);
                Report::TestResult {
                    subtask_id: subtask.id.clone(),
                    file: paths::test_path_for(&subtask.filename),
                    content: Some(content),
                    metrics: Some(metrics),
                }
            }
            Role::Documenter => Report::Code {
                subtask_id: subtask.id.clone(),
                file: paths::doc_path_for(&subtask.filename),
                content,
            },
        }
    }

    /// Send a report, retrying a few times. Returns whether it was delivered.
    pub async fn submit(&self, report: &Report) -> bool {
        let attempts = self.config.report_attempts.max(1);
        for attempt in 1..=attempts {
            match self.broker.submit_report(report).await {
                Ok(()) => return true,
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Report for {} failed (attempt {attempt}/{attempts}): {e}",
                        report.subtask_id()
                    );
                    tokio::time::sleep(Duration::from_secs(self.config.report_retry_secs)).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Giving up on report for {} after {attempts} attempts: {e}",
                        report.subtask_id()
                    );
                }
            }
        }
        false
    }

    /// Pull and fully handle at most one subtask. `Ok(None)` means the queue
    /// was empty.
    pub async fn poll_once(&self) -> Result<Option<Report>, ClientError> {
        let Some(subtask) = self.broker.pull_task(self.role).await? else {
            return Ok(None);
        };
        if subtask.id.trim().is_empty() {
            tracing::error!("Pulled a subtask without an id for {}, dropping it", subtask.filename);
            return Ok(None);
        }
        tracing::info!("Processing {} ({}) [{}]", subtask.filename, self.role, subtask.id);

        let report = self.process(&subtask).await;
        self.submit(&report).await;
        Ok(Some(report))
    }

    /// Drain the queue, pausing only when it is empty or unreachable.
    pub async fn run(&self, ticker: &mut dyn Ticker) {
        tracing::info!("{} worker started", self.role);
        let idle = Duration::from_secs(self.config.idle_interval_secs);
        loop {
            match self.poll_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => tracing::debug!("No tasks for {}", self.role),
                Err(e) => tracing::warn!("Pull for {} failed: {e}", self.role),
            }
            ticker.wait(idle).await;
        }
    }
}
