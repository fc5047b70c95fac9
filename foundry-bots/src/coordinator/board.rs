//! The coordinator's local belief about every `(file, role)` entry.
//!
//! Pure bookkeeping: no I/O happens here. [`Board::plan`] enforces the
//! executor -> {tester, documenter} dependency; nothing else does.

use std::collections::{BTreeMap, HashMap, VecDeque};

use foundry_sdk::paths;
use foundry_sdk::protocol::{Role, TaskState};
use tokio::time::Instant;

/// Lifecycle of one file across the three roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTaskState {
    pub executor: TaskState,
    pub tester: TaskState,
    pub documenter: TaskState,
}

impl FileTaskState {
    /// Fresh entry; files without a testable extension never get a tester.
    pub fn new(file: &str) -> Self {
        Self {
            executor: TaskState::Pending,
            tester: if paths::is_testable(file) {
                TaskState::Pending
            } else {
                TaskState::Skipped
            },
            documenter: TaskState::Pending,
        }
    }

    pub fn get(&self, role: Role) -> &TaskState {
        match role {
            Role::Executor => &self.executor,
            Role::Tester => &self.tester,
            Role::Documenter => &self.documenter,
        }
    }

    pub fn set(&mut self, role: Role, state: TaskState) {
        match role {
            Role::Executor => self.executor = state,
            Role::Tester => self.tester = state,
            Role::Documenter => self.documenter = state,
        }
    }
}

/// A dispatched subtask the broker has acknowledged.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub file: String,
    pub role: Role,
    pub dispatched_at: Instant,
    /// Consecutive snapshots the id was absent from.
    pub missing: u32,
}

/// Counts over every `(file, role)` entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub in_flight: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done as f64 * 100.0 / self.total as f64
    }

    pub fn is_complete(&self) -> bool {
        self.done == self.total
    }
}

#[derive(Debug, Default)]
pub struct Board {
    /// Files in blueprint order.
    order: Vec<String>,
    files: HashMap<String, FileTaskState>,
    pending: HashMap<Role, VecDeque<String>>,
    active: HashMap<String, ActiveTask>,
}

impl Board {
    pub fn new(files: impl IntoIterator<Item = String>) -> Self {
        let mut board = Board::default();
        for file in files {
            if board.files.contains_key(&file) {
                continue;
            }
            let entry = FileTaskState::new(&file);
            for role in Role::ALL {
                if *entry.get(role) == TaskState::Pending {
                    board.pending.entry(role).or_default().push_back(file.clone());
                }
            }
            board.files.insert(file.clone(), entry);
            board.order.push(file);
        }
        board
    }

    pub fn file(&self, file: &str) -> Option<&FileTaskState> {
        self.files.get(file)
    }

    pub fn state(&self, file: &str, role: Role) -> Option<&TaskState> {
        self.files.get(file).map(|f| f.get(role))
    }

    /// Every file in blueprint order with its entry.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &FileTaskState)> {
        self.order
            .iter()
            .filter_map(|f| self.files.get(f).map(|s| (f.as_str(), s)))
    }

    pub fn set(&mut self, file: &str, role: Role, state: TaskState) {
        if let Some(entry) = self.files.get_mut(file) {
            entry.set(role, state);
        }
    }

    /// Put a file back on a role's pending queue (at most once).
    pub fn requeue(&mut self, file: &str, role: Role) {
        let queue = self.pending.entry(role).or_default();
        if !queue.iter().any(|f| f == file) {
            queue.push_back(file.to_string());
        }
    }

    pub fn queued(&self, role: Role) -> Vec<&str> {
        self.pending
            .get(&role)
            .map(|q| q.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress::default();
        for entry in self.files.values() {
            for role in Role::ALL {
                let state = entry.get(role);
                progress.total += 1;
                if state.is_terminal() {
                    progress.done += 1;
                } else if state.is_in_flight() {
                    progress.in_flight += 1;
                }
            }
        }
        progress
    }

    /// `fetch_failed` and `failed_to_send` go back to `pending`. Their files
    /// were requeued when the failure happened.
    pub fn reset_retryable(&mut self) -> usize {
        let mut reset = Vec::new();
        for (file, entry) in &mut self.files {
            for role in Role::ALL {
                if entry.get(role).is_retryable() {
                    entry.set(role, TaskState::Pending);
                    reset.push((file.clone(), role));
                }
            }
        }
        for (file, role) in &reset {
            self.requeue(file, *role);
        }
        reset.len()
    }

    /// Select up to `slots` entries to dispatch, executor first, and mark them
    /// `sending`.
    ///
    /// Tester and documenter entries whose executor has not finished stay
    /// queued. If the executor ended without output (failed or skipped), its
    /// dependents are skipped instead.
    pub fn plan(&mut self, slots: usize) -> Vec<(String, Role)> {
        let mut planned = Vec::new();
        for role in Role::ALL {
            let queue = self.pending.entry(role).or_default();
            let mut deferred = VecDeque::new();
            while planned.len() < slots {
                let Some(file) = queue.pop_front() else {
                    break;
                };
                let Some(entry) = self.files.get_mut(&file) else {
                    continue;
                };
                if *entry.get(role) != TaskState::Pending {
                    continue;
                }
                if role != Role::Executor {
                    if entry.executor.is_terminal() && !entry.executor.is_executor_done() {
                        tracing::info!("Skipping {role} for {file}: executor ended {}", entry.executor);
                        entry.set(role, TaskState::Skipped);
                        continue;
                    }
                    if !entry.executor.is_executor_done() {
                        deferred.push_back(file);
                        continue;
                    }
                }
                entry.set(role, TaskState::Sending);
                planned.push((file, role));
            }
            while let Some(file) = deferred.pop_back() {
                queue.push_front(file);
            }
        }
        planned
    }

    /// Skip dependents of executors that failed, without waiting for a dispatch
    /// slot. Keeps completion reachable when the budget is saturated.
    pub fn skip_orphaned(&mut self) {
        for (file, entry) in &mut self.files {
            if !(entry.executor.is_terminal() && !entry.executor.is_executor_done()) {
                continue;
            }
            for role in [Role::Tester, Role::Documenter] {
                if *entry.get(role) == TaskState::Pending {
                    tracing::info!("Skipping {role} for {file}: executor ended {}", entry.executor);
                    entry.set(role, TaskState::Skipped);
                }
            }
        }
    }

    // ── Active records ─────────────────────────────────────────────────

    pub fn activate(&mut self, id: String, file: &str, role: Role) {
        self.set(file, role, TaskState::Sent);
        self.active.insert(
            id,
            ActiveTask {
                file: file.to_string(),
                role,
                dispatched_at: Instant::now(),
                missing: 0,
            },
        );
    }

    pub fn active(&self) -> &HashMap<String, ActiveTask> {
        &self.active
    }

    pub fn active_mut(&mut self, id: &str) -> Option<&mut ActiveTask> {
        self.active.get_mut(id)
    }

    pub fn deactivate(&mut self, id: &str) -> Option<ActiveTask> {
        self.active.remove(id)
    }

    /// Active ids sorted, for deterministic iteration.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Per-file states keyed by file name, for logs and tests.
    pub fn snapshot(&self) -> BTreeMap<String, FileTaskState> {
        self.files.iter().map(|(f, s)| (f.clone(), s.clone())).collect()
    }
}
