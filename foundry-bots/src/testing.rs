//! In-memory test doubles for the broker and generators.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use foundry_sdk::client::{BrokerApi, ClientError, Result};
use foundry_sdk::protocol::{Report, Role, Subtask, TaskState};
use foundry_sdk::structure::ProjectStructure;

use crate::llm::{GenerateError, GenerateRequest, Generator};

#[derive(Default)]
pub struct FakeState {
    pub structure: Option<ProjectStructure>,
    /// Every accepted submission, in order.
    pub submitted: Vec<Subtask>,
    pub queues: HashMap<Role, VecDeque<Subtask>>,
    pub statuses: HashMap<String, TaskState>,
    pub files: HashMap<String, String>,
    pub reports: Vec<Report>,
    /// Fail every submission as if the request timed out.
    pub reject_submissions: bool,
    pub fail_status_fetch: bool,
    /// Fail this many upcoming report submissions.
    pub failing_reports: usize,
}

/// A broker that lives in the test process. Mirrors the real ledger rules
/// closely enough for coordinator and worker tests.
#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<FakeState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: &[&str]) -> Self {
        let mut structure = ProjectStructure::new();
        for file in files {
            structure = structure.with_file(*file);
        }
        let broker = Self::new();
        broker.state().structure = Some(structure);
        broker
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_status(&self, id: &str, state: TaskState) {
        self.state().statuses.insert(id.to_string(), state);
    }

    pub fn submitted(&self, role: Role) -> Vec<Subtask> {
        self.state()
            .submitted
            .iter()
            .filter(|s| s.role == role)
            .cloned()
            .collect()
    }

    pub fn submitted_for(&self, role: Role, file: &str) -> Vec<Subtask> {
        self.submitted(role)
            .into_iter()
            .filter(|s| s.filename == file)
            .collect()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.state().reports.clone()
    }
}

#[async_trait]
impl BrokerApi for FakeBroker {
    async fn fetch_structure(&self) -> Result<Option<ProjectStructure>> {
        Ok(self.state().structure.clone().filter(|s| !s.is_empty()))
    }

    async fn submit_subtask(&self, subtask: &Subtask) -> Result<String> {
        let mut state = self.state();
        if state.reject_submissions {
            return Err(ClientError::Unexpected("request timed out".into()));
        }
        state.submitted.push(subtask.clone());
        state
            .queues
            .entry(subtask.role)
            .or_default()
            .push_back(subtask.clone());
        state.statuses.insert(subtask.id.clone(), TaskState::Pending);
        Ok(subtask.id.clone())
    }

    async fn pull_task(&self, role: Role) -> Result<Option<Subtask>> {
        let mut state = self.state();
        let subtask = state.queues.get_mut(&role).and_then(VecDeque::pop_front);
        if let Some(s) = &subtask {
            state.statuses.insert(s.id.clone(), TaskState::Processing);
        }
        Ok(subtask)
    }

    async fn submit_report(&self, report: &Report) -> Result<()> {
        let mut state = self.state();
        if state.failing_reports > 0 {
            state.failing_reports -= 1;
            return Err(ClientError::Rejected {
                status: 503,
                body: "broker unavailable".into(),
            });
        }
        state
            .statuses
            .insert(report.subtask_id().to_string(), report.ledger_state());
        if let Some((file, content)) = report.write_target() {
            state.files.insert(file.to_string(), content.to_string());
        }
        state.reports.push(report.clone());
        Ok(())
    }

    async fn all_statuses(&self) -> Result<HashMap<String, TaskState>> {
        let state = self.state();
        if state.fail_status_fetch {
            return Err(ClientError::Unexpected("connection refused".into()));
        }
        Ok(state.statuses.clone())
    }

    async fn file_content(&self, path: &str) -> Result<Option<String>> {
        Ok(self.state().files.get(path).cloned())
    }
}

/// Replays canned results and records every request it saw.
/// An exhausted script fails like a backend that returned nothing.
pub struct ScriptedGenerator {
    name: String,
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    seen: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedGenerator {
    pub fn new(name: &str, script: Vec<std::result::Result<&str, &str>>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|r| r.map(String::from).map_err(String::from))
                    .collect(),
            ),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `text`.
    pub fn always(name: &str, text: &str) -> Self {
        Self::new(name, vec![Ok(text); 64])
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> std::result::Result<String, GenerateError> {
        self.seen.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(body)) => Err(GenerateError::Api {
                backend: self.name.clone(),
                status: 503,
                body,
            }),
            None => Err(GenerateError::Empty {
                backend: self.name.clone(),
            }),
        }
    }
}
