//! Coordinator: turns the blueprint's file list into subtasks.
//!
//! Each management cycle:
//!
//! 1. Retryable entries (`fetch_failed`, `failed_to_send`) go back to `pending`.
//! 2. Reconcile active records against the broker ledger.
//! 3. Close out worker results (`accepted` / `review_needed`) at the broker.
//! 4. Expire records past the task timeout.
//! 5. Dispatch up to `min(done + desired_buffer, max_concurrent_tasks) - in_flight`
//!    entries, executor first. Tester and documenter subtasks carry the file's
//!    current content.
//! 6. Submit concurrently and settle each result.
//! 7. Check completion.
//!
//! The cycle itself never fails: broker errors leave entries re-dispatchable.
//! Only a missing project structure is fatal, and only at startup.

pub mod board;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use foundry_sdk::client::BrokerApi;
use foundry_sdk::id;
use foundry_sdk::protocol::{Report, Role, Subtask, TaskState};
use futures::future::join_all;
use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::ticker::Ticker;

pub use board::{Board, FileTaskState, Progress};

/// First pause between structure fetches; doubles up to [`MAX_STRUCTURE_BACKOFF`].
const INITIAL_STRUCTURE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_STRUCTURE_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no project structure after {0:?}")]
    StructureTimeout(Duration),
}

/// Where the coordinator process is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Initializing,
    WaitingForStructure,
    ProcessingTasks,
    Completed,
    Error,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessStatus::Initializing => "initializing",
            ProcessStatus::WaitingForStructure => "waiting_for_structure",
            ProcessStatus::ProcessingTasks => "processing_tasks",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Error => "error",
        })
    }
}

/// Instruction text for a role's subtask.
pub fn instruction(role: Role, file: &str, target: &str) -> String {
    match role {
        Role::Executor => format!(
            "Implement the required functionality in file: {file} based on the overall project goal: {target}"
        ),
        Role::Tester => format!("Generate unit tests for the code in file: {file}"),
        Role::Documenter => format!(
            "Generate documentation (e.g., docstrings, comments, README section) for the code in file: {file}"
        ),
    }
}

pub struct Coordinator {
    broker: Arc<dyn BrokerApi>,
    config: CoordinatorConfig,
    target: String,
    board: Board,
    status: ProcessStatus,
}

impl Coordinator {
    pub fn new(broker: Arc<dyn BrokerApi>, config: CoordinatorConfig, target: impl Into<String>) -> Self {
        Self {
            broker,
            config,
            target: target.into(),
            board: Board::default(),
            status: ProcessStatus::Initializing,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Start tracking `files` without fetching a structure.
    pub fn load_files(&mut self, files: Vec<String>) {
        tracing::info!("Tracking {} files", files.len());
        self.board = Board::new(files);
        self.status = ProcessStatus::ProcessingTasks;
    }

    /// Wait for the structure, then run cycles until every entry is terminal.
    pub async fn run(&mut self, ticker: &mut dyn Ticker) -> Result<(), CoordinatorError> {
        let files = match self.wait_for_structure(ticker).await {
            Ok(files) => files,
            Err(e) => {
                self.status = ProcessStatus::Error;
                tracing::error!("Coordinator failed to initialize: {e}");
                return Err(e);
            }
        };
        self.load_files(files);

        loop {
            if self.cycle().await == ProcessStatus::Completed {
                return Ok(());
            }
            ticker.wait(self.next_interval()).await;
        }
    }

    /// Poll the broker for a non-empty structure with exponential backoff.
    pub async fn wait_for_structure(
        &mut self,
        ticker: &mut dyn Ticker,
    ) -> Result<Vec<String>, CoordinatorError> {
        self.status = ProcessStatus::WaitingForStructure;
        let timeout = Duration::from_secs(self.config.structure_timeout_secs);
        let started = Instant::now();
        let mut backoff = INITIAL_STRUCTURE_BACKOFF;
        loop {
            match self.broker.fetch_structure().await {
                Ok(Some(structure)) => {
                    let files = structure.files();
                    tracing::info!("Project structure received: {} files", files.len());
                    return Ok(files);
                }
                Ok(None) => tracing::info!("No project structure yet, retrying in {backoff:?}"),
                Err(e) => tracing::warn!("Structure fetch failed: {e}, retrying in {backoff:?}"),
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(CoordinatorError::StructureTimeout(timeout));
            }
            ticker.wait(backoff.min(timeout - elapsed)).await;
            backoff = (backoff * 2).min(MAX_STRUCTURE_BACKOFF);
        }
    }

    /// Shorter pause while anything is in flight.
    pub fn next_interval(&self) -> Duration {
        if self.board.progress().in_flight > 0 {
            Duration::from_secs(self.config.active_interval_secs)
        } else {
            Duration::from_secs(self.config.idle_interval_secs)
        }
    }

    /// Concurrency target: `min(done + desired_buffer, max_concurrent_tasks)`.
    pub fn budget(&self, progress: Progress) -> usize {
        (progress.done + self.config.desired_buffer).min(self.config.max_concurrent_tasks)
    }

    /// Run one management cycle and return the resulting process status.
    pub async fn cycle(&mut self) -> ProcessStatus {
        if self.status == ProcessStatus::Completed {
            return self.status;
        }
        self.status = ProcessStatus::ProcessingTasks;

        let reset = self.board.reset_retryable();
        if reset > 0 {
            tracing::info!("Retrying {reset} entries");
        }

        self.reconcile().await;
        self.accept_results().await;
        self.expire_timed_out().await;
        self.board.skip_orphaned();
        self.dispatch().await;

        let progress = self.board.progress();
        tracing::info!(
            "Progress: {}/{} done ({:.1}%), {} in flight",
            progress.done,
            progress.total,
            progress.percent(),
            progress.in_flight
        );
        if progress.is_complete() {
            tracing::info!("All {} entries are terminal, job completed", progress.total);
            self.status = ProcessStatus::Completed;
        }
        self.status
    }

    // ── Reconciliation ─────────────────────────────────────────────────

    async fn reconcile(&mut self) {
        if self.board.active().is_empty() {
            return;
        }
        let statuses = match self.broker.all_statuses().await {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!("Status fetch failed, skipping reconciliation: {e}");
                return;
            }
        };

        for id in self.board.active_ids() {
            let Some(record) = self.board.active().get(&id).cloned() else {
                continue;
            };
            if self.board.file(&record.file).is_none() {
                tracing::warn!("Dropping active record {id} for unknown file {}", record.file);
                self.board.deactivate(&id);
                continue;
            }

            match statuses.get(&id) {
                Some(remote) => {
                    if let Some(r) = self.board.active_mut(&id) {
                        r.missing = 0;
                    }
                    // Queued but not yet pulled: local `sent` already says that.
                    if *remote == TaskState::Pending {
                        continue;
                    }
                    if self.board.state(&record.file, record.role) != Some(remote) {
                        tracing::info!("{} {} -> {remote} ({id})", record.file, record.role);
                        self.board.set(&record.file, record.role, remote.clone());
                    }
                    if remote.is_terminal() {
                        self.board.deactivate(&id);
                    }
                }
                None if record.missing == 0 => {
                    tracing::warn!(
                        "Subtask {id} ({} {}) missing from broker ledger",
                        record.file,
                        record.role
                    );
                    if let Some(r) = self.board.active_mut(&id) {
                        r.missing = 1;
                    }
                }
                None => {
                    tracing::warn!(
                        "Subtask {id} still missing, re-queueing {} {}",
                        record.file,
                        record.role
                    );
                    self.board.deactivate(&id);
                    self.board.set(&record.file, record.role, TaskState::Pending);
                    self.board.requeue(&record.file, record.role);
                }
            }
        }
    }

    /// Post the verdict for every result state; local state only moves once
    /// the broker has taken it.
    async fn accept_results(&mut self) {
        let verdicts: Vec<(String, board::ActiveTask, TaskState)> = self
            .board
            .active_ids()
            .into_iter()
            .filter_map(|id| {
                let record = self.board.active().get(&id)?.clone();
                let verdict = self.board.state(&record.file, record.role)?.verdict()?;
                Some((id, record, verdict))
            })
            .collect();
        if verdicts.is_empty() {
            return;
        }

        let broker = Arc::clone(&self.broker);
        let posts = verdicts.iter().map(|(id, record, verdict)| {
            let report = Report::StatusUpdate {
                subtask_id: id.clone(),
                file: Some(record.file.clone()),
                status: Some(verdict.as_str().to_string()),
                message: None,
            };
            let broker = Arc::clone(&broker);
            async move { broker.submit_report(&report).await }
        });
        let results = join_all(posts).await;

        for ((id, record, verdict), result) in verdicts.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    tracing::info!("{} {} {verdict} ({id})", record.file, record.role);
                    self.board.set(&record.file, record.role, verdict);
                    self.board.deactivate(&id);
                }
                Err(e) => tracing::warn!("Could not close out {id}, retrying next cycle: {e}"),
            }
        }
    }

    async fn expire_timed_out(&mut self) {
        let Some(secs) = self.config.task_timeout_secs else {
            return;
        };
        let timeout = Duration::from_secs(secs);
        let expired: Vec<(String, board::ActiveTask)> = self
            .board
            .active()
            .iter()
            .filter(|(_, r)| r.dispatched_at.elapsed() >= timeout)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();

        for (id, record) in expired {
            tracing::warn!(
                "Subtask {id} ({} {}) exceeded {timeout:?}, marking error_processing",
                record.file,
                record.role
            );
            self.board.deactivate(&id);
            self.board.set(&record.file, record.role, TaskState::ErrorProcessing);
            let report = Report::status(
                &id,
                TaskState::ErrorProcessing,
                Some(format!("no result after {}s", timeout.as_secs())),
            );
            if let Err(e) = self.broker.submit_report(&report).await {
                tracing::warn!("Could not record timeout of {id} at broker: {e}");
            }
        }
    }

    // ── Dispatch ───────────────────────────────────────────────────────

    async fn dispatch(&mut self) {
        let progress = self.board.progress();
        let target = self.budget(progress);
        let slots = target.saturating_sub(progress.in_flight);
        if slots == 0 {
            tracing::debug!("Budget full: {} in flight, target {target}", progress.in_flight);
            return;
        }
        let planned = self.board.plan(slots);
        if planned.is_empty() {
            return;
        }

        // Dependent roles need the executor's output.
        let broker = Arc::clone(&self.broker);
        let fetches = planned.iter().map(|(file, role)| {
            let broker = Arc::clone(&broker);
            let (file, role) = (file.clone(), *role);
            async move {
                if role == Role::Executor {
                    return Ok(None);
                }
                broker.file_content(&file).await
            }
        });
        let contents = join_all(fetches).await;

        let mut subtasks = Vec::new();
        for ((file, role), content) in planned.into_iter().zip(contents) {
            let code = match (role, content) {
                (Role::Executor, _) => None,
                (_, Ok(Some(code))) => Some(code),
                (_, Ok(None)) => {
                    tracing::warn!("No content for {file} yet, {role} fetch_failed");
                    self.fetch_failed(&file, role);
                    continue;
                }
                (_, Err(e)) => {
                    tracing::warn!("Content fetch for {file} failed: {e}");
                    self.fetch_failed(&file, role);
                    continue;
                }
            };
            subtasks.push(Subtask {
                id: id::generate(),
                text: instruction(role, &file, &self.target),
                role,
                filename: file,
                code,
            });
        }
        if subtasks.is_empty() {
            return;
        }

        let submissions = subtasks.iter().map(|s| {
            let broker = Arc::clone(&broker);
            async move { broker.submit_subtask(s).await }
        });
        let results = join_all(submissions).await;

        for (subtask, result) in subtasks.iter().zip(results) {
            match result {
                Ok(id) => {
                    tracing::info!("Dispatched {} {} as {id}", subtask.filename, subtask.role);
                    self.board.activate(id, &subtask.filename, subtask.role);
                }
                Err(e) => {
                    tracing::warn!(
                        "Submitting {} {} failed, will retry: {e}",
                        subtask.filename,
                        subtask.role
                    );
                    self.board.set(&subtask.filename, subtask.role, TaskState::FailedToSend);
                    self.board.requeue(&subtask.filename, subtask.role);
                }
            }
        }
    }

    fn fetch_failed(&mut self, file: &str, role: Role) {
        self.board.set(file, role, TaskState::FetchFailed);
        self.board.requeue(file, role);
    }
}
