use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::DateTime;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::webhook::SECRET_HEADER;
use super::{AppState, build};
use crate::bot::agent::fake::FakeAgent;
use crate::bot::agent::{AgentContext, SCHEDULED_MARKER};
use crate::bot::dedup::UpdateDeduplicator;
use crate::bot::router::{MessageRouter, START_TEXT};
use crate::bot::tasks::TaskSupervisor;
use crate::bot::telegram::fake::FakeTelegram;
use crate::scheduler::{Scheduler, TIMESTAMP_FORMAT};

struct Harness {
    app: Router,
    telegram: Arc<FakeTelegram>,
    agent: Arc<FakeAgent>,
    tasks: TaskSupervisor,
    scheduler: Scheduler,
}

fn harness(secret: Option<&str>) -> Harness {
    let telegram = Arc::new(FakeTelegram::default());
    let agent = Arc::new(FakeAgent::new());
    let tasks = TaskSupervisor::new();
    let ctx = AgentContext {
        workdir: PathBuf::from("/tmp"),
        interactive_timeout: Duration::from_secs(300),
        scheduled_timeout: Duration::from_secs(600),
        skill: "/user-action".to_string(),
    };
    let tz = chrono_tz::Asia::Seoul;
    let scheduler = Scheduler::new(tz, agent.clone(), ctx.clone(), tasks.clone());
    let router = MessageRouter::standard(telegram.clone(), agent.clone(), ctx, Duration::from_secs(4));

    let state = AppState {
        webhook_secret: secret.map(str::to_string),
        bot_token_set: true,
        tz,
        telegram: telegram.clone(),
        dedup: Arc::new(UpdateDeduplicator::default()),
        router: Arc::new(router),
        scheduler: scheduler.clone(),
        tasks: tasks.clone(),
    };

    Harness { app: build(state), telegram, agent, tasks, scheduler }
}

impl Harness {
    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn webhook(&self, update: &Value) -> (StatusCode, Value) {
        self.call(json_request("POST", "/webhook", update)).await
    }
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

fn update(update_id: i64, chat_id: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": 100 + update_id,
            "date": 1769304660,
            "chat": {"id": chat_id, "type": "private"},
            "from": {"id": 7, "first_name": "Alice", "username": "alice"},
            "text": text
        }
    })
}

#[tokio::test]
async fn test_health() {
    let h = harness(None);
    let (status, body) = h.call(empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "bot_token_set": true}));
}

#[tokio::test]
async fn test_start_command_replies_without_agent() {
    let h = harness(None);
    let (status, body) = h.webhook(&update(1, 42, "/start")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    h.tasks.wait_idle().await;
    assert_eq!(h.telegram.texts(), vec![(42, START_TEXT.to_string())]);
    assert!(h.agent.prompts().is_empty());
}

#[tokio::test]
async fn test_duplicate_update_is_acknowledged_but_ignored() {
    let h = harness(None);
    h.webhook(&update(1, 42, "/start")).await;
    h.tasks.wait_idle().await;
    let calls_after_first = h.telegram.calls().len();

    let (status, body) = h.webhook(&update(1, 42, "/start")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
    h.tasks.wait_idle().await;

    assert_eq!(h.telegram.calls().len(), calls_after_first);
    assert_eq!(h.telegram.texts().len(), 1);
}

#[tokio::test]
async fn test_text_message_invokes_agent() {
    let h = harness(None);
    h.webhook(&update(2, 42, "what's the BTC price?")).await;
    h.tasks.wait_idle().await;

    let prompts = h.agent.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("/user-action\n\n"));
    assert!(prompts[0].contains("chat=\"42\""));
    assert!(prompts[0].contains("what's the BTC price?"));
    // Typing was signalled before the background dispatch
    assert!(h.telegram.action_count() >= 1);
}

#[tokio::test]
async fn test_wrong_secret_is_forbidden() {
    let h = harness(Some("s3cret"));

    let (status, body) = h.webhook(&update(3, 42, "/start")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"detail": "Forbidden"}));

    let mut request = json_request("POST", "/webhook", &update(3, 42, "/start"));
    request.headers_mut().insert(SECRET_HEADER, "wrong".parse().unwrap());
    let (status, _) = h.call(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    h.tasks.wait_idle().await;
    assert!(h.telegram.calls().is_empty());

    // Rejected requests do not consume the update id
    let mut request = json_request("POST", "/webhook", &update(3, 42, "/start"));
    request.headers_mut().insert(SECRET_HEADER, "s3cret".parse().unwrap());
    let (status, _) = h.call(request).await;
    assert_eq!(status, StatusCode::OK);
    h.tasks.wait_idle().await;
    assert_eq!(h.telegram.texts().len(), 1);
}

#[tokio::test]
async fn test_invalid_json_is_bad_request() {
    let h = harness(None);
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = h.call(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"detail": "Invalid JSON"}));
}

#[tokio::test]
async fn test_update_without_message_is_noop() {
    let h = harness(None);
    let edited = json!({
        "update_id": 9,
        "edited_message": {"message_id": 1, "chat": {"id": 42}, "text": "edit"}
    });
    let (status, body) = h.webhook(&edited).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    h.tasks.wait_idle().await;
    assert!(h.telegram.calls().is_empty());
    assert!(h.agent.prompts().is_empty());
}

#[tokio::test]
async fn test_add_and_list_cron_job() {
    let h = harness(None);
    let job = json!({"id": "daily-summary", "cron": "0 8 * * *", "content": "summarize"});
    let (status, body) = h.call(json_request("POST", "/scheduler/jobs", &job)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "id": "daily-summary"}));

    let (status, body) = h.call(empty_request("GET", "/scheduler/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], "daily-summary");
    assert_eq!(jobs[0]["content"], "summarize");

    let next_run = jobs[0]["next_run"].as_str().unwrap();
    let next = DateTime::parse_from_str(next_run, TIMESTAMP_FORMAT).unwrap();
    assert!(next >= h.scheduler.now());

    let (status, body) = h.call(empty_request("GET", "/scheduler/jobs/daily-summary")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trigger"], "cron[minute='0', hour='8', day='*', month='*', day_of_week='*']");
}

#[tokio::test]
async fn test_four_field_cron_is_rejected() {
    let h = harness(None);
    let job = json!({"id": "bad", "cron": "0 8 * *", "content": "x"});
    let (status, body) = h.call(json_request("POST", "/scheduler/jobs", &job)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().starts_with("cron format:"));

    let (_, body) = h.call(empty_request("GET", "/scheduler/jobs")).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let h = harness(None);
    for (method, uri) in [
        ("GET", "/scheduler/jobs/missing"),
        ("DELETE", "/scheduler/jobs/missing"),
        ("POST", "/scheduler/trigger/missing"),
    ] {
        let (status, body) = h.call(empty_request(method, uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(body, json!({"detail": "job not found: missing"}));
    }
}

#[tokio::test]
async fn test_one_shot_job_endpoint() {
    let h = harness(None);
    let run_at = (h.scheduler.now() + chrono::Duration::days(1))
        .format("%Y-%m-%d %H:%M")
        .to_string();
    let job = json!({"id": "reminder", "run_at": run_at, "content": "check the market"});
    let (status, body) = h.call(json_request("POST", "/scheduler/jobs/once", &job)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["id"], "reminder");
    assert_eq!(body["run_at"], format!("{run_at}:00+09:00"));

    let (_, body) = h.call(empty_request("GET", "/scheduler/jobs/reminder")).await;
    assert!(body["trigger"].as_str().unwrap().starts_with("date["));
}

#[tokio::test]
async fn test_one_shot_in_past_is_rejected() {
    let h = harness(None);
    let job = json!({"id": "late", "run_at": "2000-01-01 00:00", "content": "x"});
    let (status, body) = h.call(json_request("POST", "/scheduler/jobs/once", &job)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().starts_with("run time is in the past: "));
    assert!(h.scheduler.list_jobs().is_empty());
}

#[tokio::test]
async fn test_remove_job() {
    let h = harness(None);
    h.scheduler.add_cron_job("weekly", "0 9 * * 1", "report").unwrap();

    let (status, body) = h.call(empty_request("DELETE", "/scheduler/jobs/weekly")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "id": "weekly"}));
    assert!(h.scheduler.list_jobs().is_empty());
}

#[tokio::test]
async fn test_trigger_job_runs_in_background() {
    let h = harness(None);
    h.scheduler.add_cron_job("weekly", "0 9 * * 1", "weekly report").unwrap();
    h.scheduler.add_cron_job("empty", "0 9 * * 1", "").unwrap();

    let (status, body) = h.call(empty_request("POST", "/scheduler/trigger/weekly")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "triggered", "id": "weekly"}));

    h.tasks.wait_idle().await;
    let prompts = h.agent.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with(SCHEDULED_MARKER));
    assert!(prompts[0].ends_with("weekly report"));

    let (status, body) = h.call(empty_request("POST", "/scheduler/trigger/empty")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"detail": "job has no content"}));
}
