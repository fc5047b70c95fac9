//! End-to-end runs against an in-process broker: plan a structure, drive it
//! through the coordinator and one worker per role, then watch it with the
//! supervisor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foundry_bots::config::{CoordinatorConfig, GenerationConfig, SupervisorConfig, WorkerConfig};
use foundry_bots::coordinator::{Coordinator, ProcessStatus};
use foundry_bots::llm::{GenerateError, GenerateRequest, Generator};
use foundry_bots::supervisor::{self, Supervisor};
use foundry_bots::ticker::Ticker;
use foundry_bots::worker::Worker;
use foundry_sdk::client::{BrokerApi, BrokerClient};
use foundry_sdk::protocol::{Report, Role, Subtask, TaskState};
use foundry_server::broker::Broker;
use foundry_server::config::ServerConfig;
use foundry_server::server::Server;

const STRUCTURE: &str = r#"```json
{"src": {"app.py": null}, "README.md": null}
```"#;

/// Answers by role, recognised from the system prompt.
struct CannedGenerator;

#[async_trait]
impl Generator for CannedGenerator {
    fn name(&self) -> &str {
        "canned"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, GenerateError> {
        let text = if request.system.contains("software architect") {
            STRUCTURE
        } else if request.system.contains("testing expert") {
            "def test_main():\n    assert main() == 1\n"
        } else if request.system.contains("technical writer") {
            "# app\n\nPrints a greeting.\n"
        } else {
            "def main():\n    return 1\n"
        };
        Ok(text.to_string())
    }
}

/// Short real-time pause so spawned loops interleave.
struct FastTicker;

#[async_trait]
impl Ticker for FastTicker {
    async fn wait(&mut self, _period: Duration) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn start_broker() -> (BrokerClient, Arc<Broker>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        repo_dir: dir.path().join("repo"),
        ..Default::default()
    };
    let (addr, broker, _handle) = Server::new(config).start().await.unwrap();
    (BrokerClient::new(format!("http://{addr}")), broker, dir)
}

#[tokio::test]
async fn planned_project_runs_to_completion() {
    let (client, broker, _dir) = start_broker().await;
    let generator: Arc<dyn Generator> = Arc::new(CannedGenerator);

    let structure = supervisor::plan(&client, generator.as_ref(), &GenerationConfig::default(), "a greeter")
        .await
        .unwrap();
    assert_eq!(structure.files(), vec!["src/app.py", "README.md"]);
    assert_eq!(broker.supervisor_report().status, "structure_created");

    let api: Arc<dyn BrokerApi> = Arc::new(client.clone());
    let mut handles = Vec::new();
    for role in Role::ALL {
        let worker = Worker::new(
            role,
            Arc::clone(&api),
            Arc::clone(&generator),
            WorkerConfig::default(),
            GenerationConfig::default(),
        );
        handles.push(tokio::spawn(async move { worker.run(&mut FastTicker).await }));
    }

    let mut coordinator = Coordinator::new(Arc::clone(&api), CoordinatorConfig::default(), "a greeter");
    tokio::time::timeout(Duration::from_secs(20), coordinator.run(&mut FastTicker))
        .await
        .expect("pipeline did not finish")
        .unwrap();
    for handle in handles {
        handle.abort();
    }

    assert_eq!(coordinator.status(), ProcessStatus::Completed);
    let board = coordinator.board();
    let app = board.file("src/app.py").unwrap();
    assert_eq!(app.executor, TaskState::Accepted);
    assert_eq!(app.tester, TaskState::Accepted);
    assert_eq!(app.documenter, TaskState::Accepted);
    let readme = board.file("README.md").unwrap();
    assert_eq!(readme.executor, TaskState::Accepted);
    assert_eq!(readme.tester, TaskState::Skipped);
    assert_eq!(readme.documenter, TaskState::Accepted);

    let ledger = broker.file_statuses();
    assert_eq!(ledger["src/app.py"][&Role::Executor], TaskState::Accepted);
    assert!(!ledger["README.md"].contains_key(&Role::Tester));

    assert_eq!(
        client.file_content("src/app.py").await.unwrap().as_deref(),
        Some("def main():\n    return 1\n")
    );
    assert!(client.file_content("tests/src/app_test.py").await.unwrap().is_some());
    assert!(client.file_content("docs/src/app.py.md").await.unwrap().is_some());
    assert!(client.file_content("docs/README.md.md").await.unwrap().is_some());
}

#[tokio::test]
async fn supervisor_flags_stalls_failures_and_log_errors_once() {
    let (client, broker, dir) = start_broker().await;

    client
        .submit_subtask(&Subtask {
            id: "queued".into(),
            text: "Implement the required functionality in file: a.py".into(),
            role: Role::Executor,
            filename: "a.py".into(),
            code: None,
        })
        .await
        .unwrap();
    client
        .submit_subtask(&Subtask {
            id: "broken".into(),
            text: "Generate unit tests for the code in file: b.py".into(),
            role: Role::Tester,
            filename: "b.py".into(),
            code: Some("x = 1".into()),
        })
        .await
        .unwrap();
    client.pull_task(Role::Tester).await.unwrap().unwrap();
    client
        .submit_report(&Report::status("broken", TaskState::FailedByWorker, Some("no backend".into())))
        .await
        .unwrap();

    let log = dir.path().join("broker.log");
    std::fs::write(&log, "INFO listening\nERROR commit failed for a.py\n").unwrap();

    let mut supervisor = Supervisor::new(
        client.clone(),
        SupervisorConfig {
            stall_after_secs: 0,
            log_file: Some(log),
            ..SupervisorConfig::default()
        },
    )
    .unwrap();

    let first = supervisor.pass().await.unwrap();
    assert_eq!(first.stalled_roles, vec![Role::Executor]);
    assert_eq!(first.new_failures, vec!["broken"]);
    assert_eq!(first.log_errors, vec!["ERROR commit failed for a.py"]);
    assert_eq!(first.requests_sent, 3);

    let kinds: Vec<String> = broker.collaboration().into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec!["stalled_worker", "failed_subtask", "log_error"]);

    let report = broker.supervisor_report();
    assert_eq!(report.status, "monitoring");
    assert_eq!(report.details["passes"], 1);

    let second = supervisor.pass().await.unwrap();
    assert!(second.stalled_roles.is_empty());
    assert!(second.new_failures.is_empty());
    assert_eq!(second.requests_sent, 0);
    assert_eq!(broker.collaboration().len(), 3);
    assert_eq!(broker.supervisor_report().details["passes"], 2);
}
