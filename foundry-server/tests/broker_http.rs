//! Broker HTTP acceptance tests.
//!
//! Each test starts a broker on an ephemeral port over a throwaway git
//! repository and drives it through `reqwest` and the SDK client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use foundry_sdk::client::{BrokerApi, BrokerClient};
use foundry_sdk::protocol::{Report, Role, Subtask, TaskState};
use foundry_sdk::structure::ProjectStructure;
use foundry_server::broker::Broker;
use foundry_server::config::ServerConfig;
use foundry_server::server::Server;
use serde_json::{json, Value};

const TIMEOUT_MS: u64 = 5000;

struct TestBroker {
    url: String,
    client: BrokerClient,
    http: reqwest::Client,
    broker: Arc<Broker>,
    dir: tempfile::TempDir,
}

async fn start_server() -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        repo_dir: dir.path().join("repo"),
        ..Default::default()
    };
    let (addr, broker, _handle) = Server::new(config).start().await.unwrap();
    let url = format!("http://{addr}");
    TestBroker {
        client: BrokerClient::new(url.clone()),
        http: reqwest::Client::new(),
        url,
        broker,
        dir,
    }
}

fn subtask(id: &str, role: Role, file: &str) -> Subtask {
    Subtask {
        id: id.to_string(),
        text: format!("Implement the required functionality in file: {file}"),
        role,
        filename: file.to_string(),
        code: None,
    }
}

/// Poll until the broker has written `path`.
async fn wait_for_file(client: &BrokerClient, path: &str) -> String {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(content) = client.file_content(path).await.unwrap() {
            return content;
        }
        if start.elapsed() > Duration::from_millis(TIMEOUT_MS) {
            panic!("Timeout waiting for {path} to be written");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ── Structure ──────────────────────────────────────────────────────────

#[tokio::test]
async fn structure_round_trip() {
    let t = start_server().await;
    let structure: ProjectStructure =
        serde_json::from_str(r#"{"src": {"main.py": null, "utils.py": null}, "README.md": null}"#)
            .unwrap();

    t.client.submit_structure(&structure).await.unwrap();
    let fetched = t.client.fetch_structure().await.unwrap().unwrap();
    assert_eq!(fetched, structure);
    assert_eq!(fetched.files(), vec!["src/main.py", "src/utils.py", "README.md"]);
}

#[tokio::test]
async fn posted_structure_keeps_key_order() {
    let t = start_server().await;
    let resp = t
        .http
        .post(format!("{}/structure", t.url))
        .header("content-type", "application/json")
        .body(r#"{"structure":{"z.py":null,"a.py":null,"m":{"y.py":null,"b.py":null}}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let text = t
        .http
        .get(format!("{}/structure", t.url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, r#"{"structure":{"z.py":null,"a.py":null,"m":{"y.py":null,"b.py":null}}}"#);

    let fetched = t.client.fetch_structure().await.unwrap().unwrap();
    assert_eq!(fetched.files(), vec!["z.py", "a.py", "m/y.py", "m/b.py"]);
    assert_eq!(t.broker.structure().files(), fetched.files());
}

#[tokio::test]
async fn structure_is_empty_before_submission() {
    let t = start_server().await;
    let body: Value = t
        .http
        .get(format!("{}/structure", t.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"structure": {}}));
    assert!(t.client.fetch_structure().await.unwrap().is_none());
}

#[tokio::test]
async fn structure_must_be_an_object() {
    let t = start_server().await;
    for body in [
        json!({"structure": ["a.py"]}),
        json!({"structure": "a.py"}),
        json!({"structure": null}),
        json!({}),
    ] {
        let resp = t
            .http
            .post(format!("{}/structure", t.url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "body {body} should be rejected");
    }
}

// ── Submit / pull ──────────────────────────────────────────────────────

#[tokio::test]
async fn submit_acknowledges_and_pull_delivers() {
    let t = start_server().await;
    let resp: Value = t
        .http
        .post(format!("{}/subtask", t.url))
        .json(&json!({"subtask": {"id": "s1", "text": "t", "role": "executor", "filename": "a.py"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp, json!({"status": "subtask received", "id": "s1"}));
    assert_eq!(t.client.subtask_status("s1").await.unwrap(), Some(TaskState::Pending));

    let pulled = t.client.pull_task(Role::Executor).await.unwrap().unwrap();
    assert_eq!(pulled.id, "s1");
    assert_eq!(t.client.subtask_status("s1").await.unwrap(), Some(TaskState::Processing));
    assert!(t.client.pull_task(Role::Executor).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_queue_returns_message() {
    let t = start_server().await;
    let body: Value = t
        .http
        .get(format!("{}/task/tester", t.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"message": "No tasks available for tester"}));
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let t = start_server().await;
    let cases = [
        json!({"subtask": {"id": "s1", "text": "t", "role": "reviewer", "filename": "a.py"}}),
        json!({"subtask": {"id": "s2", "text": "t", "role": "executor", "filename": "../../etc/passwd"}}),
        json!({"subtask": {"id": "s3", "role": "executor", "filename": "a.py"}}),
        json!({"subtask": {"text": "t", "role": "executor", "filename": "a.py"}}),
    ];
    for body in cases {
        let resp = t
            .http
            .post(format!("{}/subtask", t.url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "body {body} should be rejected");
    }
    assert!(t.client.all_statuses().await.unwrap().is_empty());

    let resp = t.http.get(format!("{}/task/reviewer", t.url)).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn concurrent_pulls_never_duplicate() {
    let t = start_server().await;
    for i in 0..10 {
        t.client
            .submit_subtask(&subtask(&format!("s{i}"), Role::Executor, &format!("f{i}.py")))
            .await
            .unwrap();
    }
    // Resubmitting an accepted id must not create a second queue entry.
    t.client.submit_subtask(&subtask("s0", Role::Executor, "f0.py")).await.unwrap();

    let mut pulls = Vec::new();
    for _ in 0..30 {
        let client = t.client.clone();
        pulls.push(tokio::spawn(async move { client.pull_task(Role::Executor).await.unwrap() }));
    }
    let mut seen = HashSet::new();
    for pull in pulls {
        if let Some(task) = pull.await.unwrap() {
            assert!(seen.insert(task.id.clone()), "subtask {} delivered twice", task.id);
        }
    }
    assert_eq!(seen.len(), 10);
}

// ── Reports ────────────────────────────────────────────────────────────

#[tokio::test]
async fn code_report_updates_ledger_and_writes_file() {
    let t = start_server().await;
    t.client.submit_subtask(&subtask("s1", Role::Executor, "a.py")).await.unwrap();
    t.client.pull_task(Role::Executor).await.unwrap().unwrap();

    let report = Report::Code {
        subtask_id: "s1".into(),
        file: "a.py".into(),
        content: "x=1".into(),
    };
    t.client.submit_report(&report).await.unwrap();

    assert_eq!(t.client.subtask_status("s1").await.unwrap(), Some(TaskState::CodeReceived));
    let files = t.client.file_statuses().await.unwrap();
    assert_eq!(files["a.py"][&Role::Executor], TaskState::CodeReceived);
    assert_eq!(wait_for_file(&t.client, "a.py").await, "x=1");

    // The write landed as a git commit.
    let start = tokio::time::Instant::now();
    while t.client.stats().await.unwrap().commits == 0 {
        assert!(start.elapsed() < Duration::from_millis(TIMEOUT_MS), "no commit recorded");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let repo = git2::Repository::open(t.dir.path().join("repo")).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert_eq!(head.message(), Some("code update for a.py (subtask s1)"));
}

#[tokio::test]
async fn duplicate_reports_converge() {
    let t = start_server().await;
    let report = Report::TestResult {
        subtask_id: "t1".into(),
        file: "tests/a_test.py".into(),
        content: None,
        metrics: None,
    };
    t.client.submit_report(&report).await.unwrap();
    t.client.submit_report(&report).await.unwrap();

    let statuses = t.client.all_statuses().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses["t1"], TaskState::Tested);

    let metrics: Value = t
        .http
        .get(format!("{}/subtask_metrics/t1", t.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["metrics"], json!({"coverage": 0.0, "tests_passed": 0.0}));
}

#[tokio::test]
async fn status_update_defaults_to_updated() {
    let t = start_server().await;
    let resp = t
        .http
        .post(format!("{}/report", t.url))
        .json(&json!({"type": "status_update", "subtask_id": "x1", "message": "still working"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(t.client.subtask_status("x1").await.unwrap(), Some(TaskState::Updated));

    t.client
        .submit_report(&Report::status("x1", TaskState::FailedByWorker, Some("gave up".into())))
        .await
        .unwrap();
    assert_eq!(t.client.subtask_status("x1").await.unwrap(), Some(TaskState::FailedByWorker));
}

#[tokio::test]
async fn malformed_report_is_a_client_error() {
    let t = start_server().await;
    let resp = t
        .http
        .post(format!("{}/report", t.url))
        .json(&json!({"type": "verdict", "subtask_id": "x"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn unknown_subtask_status_is_404() {
    let t = start_server().await;
    let resp = t.http.get(format!("{}/subtask_status/nope", t.url)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(t.client.subtask_status("nope").await.unwrap(), None);
}

// ── File content ───────────────────────────────────────────────────────

#[tokio::test]
async fn file_content_status_codes() {
    let t = start_server().await;
    std::fs::create_dir_all(t.dir.path().join("repo/src")).unwrap();
    std::fs::write(t.dir.path().join("repo/src/a.py"), "print(1)").unwrap();

    let get = |path: &str| {
        t.http
            .get(format!("{}/file_content", t.url))
            .query(&[("path", path)])
            .send()
    };
    assert_eq!(get("src/a.py").await.unwrap().status(), 200);
    assert_eq!(get("../secret").await.unwrap().status(), 403);
    assert_eq!(get("src/missing.py").await.unwrap().status(), 404);
    assert_eq!(get("src").await.unwrap().status(), 400);

    assert_eq!(t.client.file_content("src/a.py").await.unwrap().as_deref(), Some("print(1)"));
    assert_eq!(t.client.file_content("src/missing.py").await.unwrap(), None);
}

// ── Supervisor surface ─────────────────────────────────────────────────

#[tokio::test]
async fn supervisor_report_requires_status() {
    let t = start_server().await;
    let resp = t
        .http
        .post(format!("{}/supervisor_report", t.url))
        .json(&json!({"details": {"x": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = t
        .http
        .get(format!("{}/supervisor_report", t.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "pending");

    t.http
        .post(format!("{}/supervisor_report", t.url))
        .json(&json!({"status": "monitoring", "details": {"passes": 3}}))
        .send()
        .await
        .unwrap();
    assert_eq!(t.broker.supervisor_report().status, "monitoring");
}

#[tokio::test]
async fn collaboration_and_clear() {
    let t = start_server().await;
    t.client.submit_subtask(&subtask("s1", Role::Documenter, "a.py")).await.unwrap();
    t.http
        .post(format!("{}/collaboration", t.url))
        .json(&json!({"kind": "error_fix", "message": "worker crashed"}))
        .send()
        .await
        .unwrap();

    let body: Value = t
        .http
        .get(format!("{}/collaboration", t.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["collaboration_requests"][0]["message"], "worker crashed");

    let worker_status = t.client.worker_status().await.unwrap();
    assert_eq!(worker_status[&Role::Documenter].queue_length, 1);

    t.http.post(format!("{}/clear", t.url)).send().await.unwrap();
    assert!(t.client.all_statuses().await.unwrap().is_empty());
    assert!(t.client.pull_task(Role::Documenter).await.unwrap().is_none());
}

#[tokio::test]
async fn health() {
    let t = start_server().await;
    t.client.health().await.unwrap();
}
