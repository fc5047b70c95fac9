//! Queue store and status ledger.
//!
//! [`Broker`] is the single logical owner of the three role queues and the
//! ledger. All mutations go through one `parking_lot::Mutex`, so concurrent
//! submit/pull/report calls never lose updates. Repository writes triggered
//! by reports run as background tasks behind a separate async write lock and
//! never roll back a ledger transition.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use foundry_sdk::event::BrokerEvent;
use foundry_sdk::protocol::{
    default_metrics, Activity, BrokerStats, CollaborationRequest, Metrics, Report, Role,
    RoleActivity, Subtask, SupervisorReport, TaskState, UnknownRole,
};
use foundry_sdk::structure::ProjectStructure;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::db::Db;
use crate::repo::{self, VersionControl};

/// Why a subtask submission was refused.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    InvalidRole(#[from] UnknownRole),
    #[error("unsafe file path: {0}")]
    UnsafePath(String),
}

/// Outcome of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// The id was accepted before; nothing was enqueued.
    Duplicate,
}

/// A subtask as it arrives on the wire, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubtaskDraft {
    pub id: Option<String>,
    pub text: Option<String>,
    pub role: Option<String>,
    pub filename: Option<String>,
    pub code: Option<String>,
}

impl SubtaskDraft {
    /// Check required fields and the role. Path safety is checked by the broker.
    pub fn validate(self) -> Result<Subtask, SubmitError> {
        let required = |value: Option<String>, name: &'static str| {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or(SubmitError::MissingField(name))
        };
        let id = required(self.id, "id")?;
        let role = required(self.role, "role")?.parse::<Role>()?;
        let filename = required(self.filename, "filename")?;
        let text = required(self.text, "text")?;
        Ok(Subtask {
            id,
            text,
            role,
            filename,
            code: self.code,
        })
    }
}

/// Where a known subtask belongs.
#[derive(Debug, Clone)]
struct Origin {
    role: Role,
    filename: String,
}

#[derive(Default)]
struct Ledger {
    queues: HashMap<Role, VecDeque<Subtask>>,
    /// Every id ever accepted by `submit`, queued or not.
    origins: HashMap<String, Origin>,
    statuses: HashMap<String, TaskState>,
    /// (file, role) -> latest state of the most recent subtask for that slot.
    file_states: BTreeMap<String, BTreeMap<Role, TaskState>>,
    metrics: HashMap<String, Metrics>,
    last_poll: HashMap<Role, DateTime<Utc>>,
    structure: Option<ProjectStructure>,
    supervisor_report: Option<SupervisorReport>,
    collaboration: Vec<CollaborationRequest>,
    commits: u64,
    next_seq: i64,
}

impl Ledger {
    fn set_status(&mut self, id: &str, state: TaskState) {
        if let Some(origin) = self.origins.get(id) {
            self.file_states
                .entry(origin.filename.clone())
                .or_default()
                .insert(origin.role, state.clone());
        }
        self.statuses.insert(id.to_string(), state);
    }
}

pub struct Broker {
    ledger: Mutex<Ledger>,
    repo: Arc<dyn VersionControl>,
    /// Serializes "write file, stage, commit" across background writes.
    write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<BrokerEvent>,
    /// Database handle for persistence (None = in-memory only).
    db: Option<Mutex<Db>>,
}

impl Broker {
    pub fn new(repo: Arc<dyn VersionControl>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            ledger: Mutex::new(Ledger::default()),
            repo,
            write_lock: tokio::sync::Mutex::new(()),
            events,
            db: None,
        }
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = broadcast::channel(capacity.max(1)).0;
        self
    }

    /// Attach a database and restore queues and ledger from it.
    pub fn with_database(mut self, db: Db) -> rusqlite::Result<Self> {
        let snapshot = db.load()?;
        {
            let mut ledger = self.ledger.lock();
            for row in snapshot.subtasks {
                let subtask = row.subtask;
                ledger.next_seq = ledger.next_seq.max(row.seq + 1);
                ledger.origins.insert(
                    subtask.id.clone(),
                    Origin {
                        role: subtask.role,
                        filename: subtask.filename.clone(),
                    },
                );
                if let Some(state) = snapshot.statuses.get(&subtask.id) {
                    ledger
                        .file_states
                        .entry(subtask.filename.clone())
                        .or_default()
                        .insert(subtask.role, state.clone());
                }
                if row.queued {
                    ledger.queues.entry(subtask.role).or_default().push_back(subtask);
                }
            }
            ledger.statuses = snapshot.statuses;
            ledger.metrics = snapshot.metrics;
            ledger.structure = snapshot.structure;
            tracing::info!(
                "Restored {} subtasks ({} queued) from database",
                ledger.origins.len(),
                ledger.queues.values().map(VecDeque::len).sum::<usize>()
            );
        }
        self.db = Some(Mutex::new(db));
        Ok(self)
    }

    /// Run a closure with the database, if persistence is enabled.
    /// Logs errors but does not propagate them.
    fn with_db<F>(&self, f: F)
    where
        F: FnOnce(&Db) -> rusqlite::Result<()>,
    {
        if let Some(db) = &self.db {
            if let Err(e) = f(&db.lock()) {
                tracing::error!("Database error: {e}");
            }
        }
    }

    fn publish(&self, event: BrokerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Subscribe to queue, ledger and repository changes.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn repository(&self) -> &Arc<dyn VersionControl> {
        &self.repo
    }

    // ── Queue store ────────────────────────────────────────────────────

    /// Enqueue a validated subtask on its role's queue and mark it `pending`.
    pub fn submit(&self, subtask: Subtask) -> Result<Submission, SubmitError> {
        if repo::resolve_within(self.repo.root(), &subtask.filename).is_none() {
            return Err(SubmitError::UnsafePath(subtask.filename));
        }

        let mut ledger = self.ledger.lock();
        if ledger.origins.contains_key(&subtask.id) {
            tracing::warn!("Subtask {} already accepted, not queueing again", subtask.id);
            return Ok(Submission::Duplicate);
        }

        let seq = ledger.next_seq;
        ledger.next_seq += 1;
        ledger.origins.insert(
            subtask.id.clone(),
            Origin {
                role: subtask.role,
                filename: subtask.filename.clone(),
            },
        );
        ledger.set_status(&subtask.id, TaskState::Pending);
        self.with_db(|db| {
            db.insert_subtask(&subtask, seq)?;
            db.save_status(&subtask.id, &TaskState::Pending)
        });

        let (id, role) = (subtask.id.clone(), subtask.role);
        let queue = ledger.queues.entry(role).or_default();
        queue.push_back(subtask);
        tracing::info!("Subtask {id} queued for {role} (queue length {})", queue.len());
        drop(ledger);

        self.publish(BrokerEvent::Queued { id, role });
        Ok(Submission::Queued)
    }

    /// Pop the head of a role's queue, marking it `processing`. Never blocks.
    pub fn pull(&self, role: Role) -> Option<Subtask> {
        let mut ledger = self.ledger.lock();
        ledger.last_poll.insert(role, Utc::now());
        let subtask = ledger.queues.get_mut(&role)?.pop_front()?;
        ledger.set_status(&subtask.id, TaskState::Processing);
        self.with_db(|db| {
            db.dequeue_subtask(&subtask.id)?;
            db.save_status(&subtask.id, &TaskState::Processing)
        });
        drop(ledger);

        tracing::info!("Subtask {} pulled by {role}", subtask.id);
        self.publish(BrokerEvent::Pulled {
            id: subtask.id.clone(),
            role,
        });
        Some(subtask)
    }

    // ── Status ledger ──────────────────────────────────────────────────

    /// Upsert the ledger from a report. Last write wins; unknown ids are
    /// recorded like any other.
    pub fn record_report(&self, report: &Report) -> TaskState {
        let id = report.subtask_id();
        let state = report.ledger_state();

        let mut ledger = self.ledger.lock();
        if !ledger.origins.contains_key(id) {
            tracing::warn!("Report for unknown subtask {id}, recording anyway");
        }
        ledger.set_status(id, state.clone());

        if let Report::TestResult { metrics, .. } = report {
            let metrics = match metrics {
                Some(m) if !m.is_empty() => m.clone(),
                _ => {
                    tracing::warn!("Empty test metrics for subtask {id}");
                    default_metrics()
                }
            };
            self.with_db(|db| db.save_metrics(id, &metrics));
            ledger.metrics.insert(id.to_string(), metrics);
        }
        self.with_db(|db| db.save_status(id, &state));
        drop(ledger);

        match report {
            Report::StatusUpdate {
                message: Some(message),
                ..
            } => tracing::info!("Subtask {id} -> {state}: {message}"),
            _ => tracing::info!("Subtask {id} -> {state}"),
        }
        self.publish(BrokerEvent::StatusChanged {
            id: id.to_string(),
            status: state.clone(),
        });
        state
    }

    /// Record a report and schedule its repository write, if it carries one.
    ///
    /// The write runs in the background; the returned handle is only useful
    /// to callers that want to wait for it.
    pub fn apply_report(self: &Arc<Self>, report: &Report) -> (TaskState, Option<JoinHandle<()>>) {
        let state = self.record_report(report);
        let write = report.write_target().map(|(file, content)| {
            let broker = Arc::clone(self);
            let (file, content) = (file.to_string(), content.to_string());
            let id = report.subtask_id().to_string();
            tokio::spawn(async move { broker.write_and_commit(file, content, id).await })
        });
        (state, write)
    }

    async fn write_and_commit(self: Arc<Self>, file: String, content: String, subtask_id: String) {
        let _guard = self.write_lock.lock().await;
        let repo = Arc::clone(&self.repo);
        let message = format!("code update for {file} (subtask {subtask_id})");
        let path = file.clone();
        let result =
            tokio::task::spawn_blocking(move || repo.write_and_commit(&path, &content, &message))
                .await;
        match result {
            Ok(Ok(committed)) => {
                tracing::info!("Wrote {file} (subtask {subtask_id})");
                if committed {
                    self.ledger.lock().commits += 1;
                    self.publish(BrokerEvent::Committed { file });
                }
            }
            Ok(Err(e)) => tracing::error!("Failed to write {file} (subtask {subtask_id}): {e}"),
            Err(e) => tracing::error!("Write task for {file} panicked: {e}"),
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskState> {
        self.ledger.lock().statuses.get(id).cloned()
    }

    pub fn all_statuses(&self) -> HashMap<String, TaskState> {
        self.ledger.lock().statuses.clone()
    }

    pub fn file_statuses(&self) -> BTreeMap<String, BTreeMap<Role, TaskState>> {
        self.ledger.lock().file_states.clone()
    }

    pub fn metrics(&self, id: &str) -> Option<Metrics> {
        self.ledger.lock().metrics.get(id).cloned()
    }

    // ── Structure ──────────────────────────────────────────────────────

    pub fn set_structure(&self, structure: ProjectStructure) {
        let files = structure.files().len();
        self.with_db(|db| db.save_structure(&structure));
        self.ledger.lock().structure = Some(structure);
        tracing::info!("Project structure received ({files} files)");
        self.publish(BrokerEvent::StructureUpdated { files });
    }

    /// The submitted structure, or one scanned from the working tree.
    pub fn structure(&self) -> ProjectStructure {
        if let Some(structure) = self.ledger.lock().structure.clone() {
            return structure;
        }
        repo::scan_structure(self.repo.root()).unwrap_or_else(|e| {
            tracing::warn!("Could not scan repository structure: {e}");
            ProjectStructure::new()
        })
    }

    // ── Observability ──────────────────────────────────────────────────

    pub fn worker_status(&self) -> BTreeMap<Role, RoleActivity> {
        let ledger = self.ledger.lock();
        Role::ALL
            .into_iter()
            .map(|role| {
                let queue_length = ledger.queues.get(&role).map_or(0, VecDeque::len);
                let in_progress = ledger
                    .origins
                    .iter()
                    .filter(|(id, origin)| {
                        origin.role == role
                            && ledger.statuses.get(*id) == Some(&TaskState::Processing)
                    })
                    .count();
                let activity = RoleActivity {
                    status: if in_progress > 0 { Activity::Busy } else { Activity::Idle },
                    queue_length,
                    queue_empty: queue_length == 0,
                    in_progress,
                    last_poll: ledger.last_poll.get(&role).copied(),
                };
                (role, activity)
            })
            .collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let ledger = self.ledger.lock();
        let mut states = BTreeMap::new();
        for state in ledger.statuses.values() {
            *states.entry(state.as_str().to_string()).or_insert(0) += 1;
        }
        BrokerStats {
            queue_lengths: Role::ALL
                .into_iter()
                .map(|r| (r, ledger.queues.get(&r).map_or(0, VecDeque::len)))
                .collect(),
            states,
            commits: ledger.commits,
        }
    }

    pub fn set_supervisor_report(&self, report: SupervisorReport) {
        tracing::info!("Supervisor report: status '{}'", report.status);
        self.ledger.lock().supervisor_report = Some(report);
    }

    pub fn supervisor_report(&self) -> SupervisorReport {
        self.ledger
            .lock()
            .supervisor_report
            .clone()
            .unwrap_or_else(|| SupervisorReport {
                status: "pending".to_string(),
                details: Default::default(),
            })
    }

    pub fn add_collaboration(&self, request: CollaborationRequest) {
        tracing::info!("Collaboration request ({}): {}", request.kind, request.message);
        self.ledger.lock().collaboration.push(request);
    }

    pub fn collaboration(&self) -> Vec<CollaborationRequest> {
        self.ledger.lock().collaboration.clone()
    }

    /// Reset queues, ledger, metrics and reports. The structure survives.
    pub fn clear(&self) {
        {
            let mut ledger = self.ledger.lock();
            let structure = ledger.structure.take();
            *ledger = Ledger {
                structure,
                ..Ledger::default()
            };
        }
        self.with_db(|db| db.clear_ledger());
        tracing::warn!("Broker state cleared");
        self.publish(BrokerEvent::Cleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::PlainDirectory;

    fn test_broker() -> (tempfile::TempDir, Arc<Broker>) {
        let dir = tempfile::tempdir().unwrap();
        let repo = PlainDirectory::create(dir.path()).unwrap();
        (dir, Arc::new(Broker::new(Arc::new(repo))))
    }

    fn subtask(id: &str, role: Role, file: &str) -> Subtask {
        Subtask {
            id: id.to_string(),
            text: format!("Implement {file}"),
            role,
            filename: file.to_string(),
            code: None,
        }
    }

    #[test]
    fn draft_validation() {
        let draft = SubtaskDraft {
            id: Some("s1".into()),
            text: Some("do it".into()),
            role: Some("tester".into()),
            filename: Some("a.py".into()),
            code: Some("x = 1".into()),
        };
        let subtask = draft.clone().validate().unwrap();
        assert_eq!(subtask.role, Role::Tester);

        let missing = SubtaskDraft { filename: None, ..draft.clone() };
        assert!(matches!(missing.validate(), Err(SubmitError::MissingField("filename"))));

        let blank = SubtaskDraft { text: Some("  ".into()), ..draft.clone() };
        assert!(matches!(blank.validate(), Err(SubmitError::MissingField("text"))));

        let bad_role = SubtaskDraft { role: Some("reviewer".into()), ..draft };
        assert!(matches!(bad_role.validate(), Err(SubmitError::InvalidRole(_))));
    }

    #[test]
    fn queues_are_fifo_per_role() {
        let (_dir, broker) = test_broker();
        broker.submit(subtask("e1", Role::Executor, "a.py")).unwrap();
        broker.submit(subtask("t1", Role::Tester, "a.py")).unwrap();
        broker.submit(subtask("e2", Role::Executor, "b.py")).unwrap();

        assert_eq!(broker.pull(Role::Executor).unwrap().id, "e1");
        assert_eq!(broker.pull(Role::Executor).unwrap().id, "e2");
        assert!(broker.pull(Role::Executor).is_none());
        assert_eq!(broker.pull(Role::Tester).unwrap().id, "t1");
        assert!(broker.pull(Role::Documenter).is_none());
    }

    #[test]
    fn ids_are_delivered_at_most_once() {
        let (_dir, broker) = test_broker();
        assert_eq!(broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap(), Submission::Queued);
        assert_eq!(
            broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap(),
            Submission::Duplicate
        );
        assert!(broker.pull(Role::Executor).is_some());
        // Resubmitting after the pull must not make it deliverable again.
        assert_eq!(
            broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap(),
            Submission::Duplicate
        );
        assert!(broker.pull(Role::Executor).is_none());
    }

    #[test]
    fn unsafe_filenames_are_rejected() {
        let (_dir, broker) = test_broker();
        let err = broker.submit(subtask("s1", Role::Executor, "../../etc/passwd")).unwrap_err();
        assert!(matches!(err, SubmitError::UnsafePath(_)));
        assert!(broker.status("s1").is_none());
        assert!(broker.pull(Role::Executor).is_none());
    }

    #[test]
    fn ledger_tracks_subtask_and_file_slot() {
        let (_dir, broker) = test_broker();
        broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap();
        assert_eq!(broker.status("s1"), Some(TaskState::Pending));
        broker.pull(Role::Executor).unwrap();
        assert_eq!(broker.status("s1"), Some(TaskState::Processing));

        let state = broker.record_report(&Report::Code {
            subtask_id: "s1".into(),
            file: "a.py".into(),
            content: "x = 1".into(),
        });
        assert_eq!(state, TaskState::CodeReceived);
        assert_eq!(broker.file_statuses()["a.py"][&Role::Executor], TaskState::CodeReceived);
    }

    #[test]
    fn duplicate_reports_converge() {
        let (_dir, broker) = test_broker();
        let report = Report::status("s9", TaskState::FailedByWorker, Some("boom".into()));
        broker.record_report(&report);
        broker.record_report(&report);
        assert_eq!(broker.status("s9"), Some(TaskState::FailedByWorker));
        assert_eq!(broker.all_statuses().len(), 1);
    }

    #[test]
    fn empty_metrics_get_defaults() {
        let (_dir, broker) = test_broker();
        broker.record_report(&Report::TestResult {
            subtask_id: "t1".into(),
            file: "tests/a_test.py".into(),
            content: None,
            metrics: Some(Metrics::new()),
        });
        assert_eq!(broker.metrics("t1"), Some(default_metrics()));
        assert_eq!(broker.status("t1"), Some(TaskState::Tested));
    }

    #[tokio::test]
    async fn code_reports_are_written_in_background() {
        let (dir, broker) = test_broker();
        let mut events = broker.subscribe();
        let (state, write) = broker.apply_report(&Report::Code {
            subtask_id: "s1".into(),
            file: "src/a.py".into(),
            content: "x = 1".into(),
        });
        assert_eq!(state, TaskState::CodeReceived);
        write.expect("code reports schedule a write").await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("src/a.py")).unwrap(), "x = 1");
        assert!(matches!(events.recv().await.unwrap(), BrokerEvent::StatusChanged { .. }));
    }

    #[tokio::test]
    async fn failed_write_keeps_ledger_state() {
        let (_dir, broker) = test_broker();
        let (_, write) = broker.apply_report(&Report::Code {
            subtask_id: "s1".into(),
            file: "../outside.py".into(),
            content: "x".into(),
        });
        write.unwrap().await.unwrap();
        assert_eq!(broker.status("s1"), Some(TaskState::CodeReceived));
        assert_eq!(broker.stats().commits, 0);
    }

    #[test]
    fn worker_status_reflects_pulls() {
        let (_dir, broker) = test_broker();
        broker.submit(subtask("s1", Role::Tester, "a.py")).unwrap();
        broker.submit(subtask("s2", Role::Tester, "b.py")).unwrap();
        broker.pull(Role::Tester).unwrap();

        let status = broker.worker_status();
        let tester = &status[&Role::Tester];
        assert_eq!(tester.status, Activity::Busy);
        assert_eq!(tester.queue_length, 1);
        assert_eq!(tester.in_progress, 1);
        assert!(tester.last_poll.is_some());
        assert_eq!(status[&Role::Executor].status, Activity::Idle);
        assert!(status[&Role::Executor].last_poll.is_none());
    }

    #[test]
    fn clear_resets_everything_but_structure() {
        let (_dir, broker) = test_broker();
        broker.set_structure(ProjectStructure::new().with_file("a.py"));
        broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap();
        broker.add_collaboration(CollaborationRequest {
            kind: "error_fix".into(),
            message: "help".into(),
            role: None,
            subtask_id: None,
        });
        broker.clear();

        assert!(broker.all_statuses().is_empty());
        assert!(broker.pull(Role::Executor).is_none());
        assert!(broker.collaboration().is_empty());
        assert_eq!(broker.structure().files(), vec!["a.py"]);
        // Ids can be reused after a clear.
        assert_eq!(broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap(), Submission::Queued);
    }

    #[test]
    fn restores_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("broker.db");
        let repo: Arc<dyn VersionControl> =
            Arc::new(PlainDirectory::create(dir.path().join("repo")).unwrap());

        {
            let broker = Broker::new(Arc::clone(&repo)).with_database(Db::open(&db_path).unwrap()).unwrap();
            broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap();
            broker.submit(subtask("s2", Role::Executor, "b.py")).unwrap();
            broker.pull(Role::Executor).unwrap();
            broker.set_structure(ProjectStructure::new().with_file("a.py").with_file("b.py"));
        }

        let broker = Broker::new(repo).with_database(Db::open(&db_path).unwrap()).unwrap();
        assert_eq!(broker.status("s1"), Some(TaskState::Processing));
        assert_eq!(broker.pull(Role::Executor).unwrap().id, "s2");
        assert_eq!(broker.structure().files(), vec!["a.py", "b.py"]);
        assert_eq!(
            broker.submit(subtask("s1", Role::Executor, "a.py")).unwrap(),
            Submission::Duplicate
        );
    }
}
