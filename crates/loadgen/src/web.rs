//! Control-plane HTTP server.
//!
//! Mutable state (the current run and the report log) sits behind one
//! readers-writer lock: reads take the read half, start/stop/report-append
//! take the write half. Deletion endpoints go straight to the cleanup
//! tracker and may run while a test is active.

use crate::page;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use loadgen_core::{metrics, CleanupTracker, Config, Generator};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    cleanup: CleanupTracker,
    scrape: reqwest::Client,
    inner: Arc<RwLock<ControlState>>,
}

#[derive(Default)]
struct ControlState {
    current: Option<TestRun>,
    reports: Vec<TestReport>,
    next_run_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum RunStatus {
    Running,
    Stopped,
    Completed,
    Error,
}

#[derive(Clone, Serialize)]
struct TestRun {
    users: usize,
    duration: String,
    ramp: String,
    status: RunStatus,
    start_time: DateTime<Utc>,
    #[serde(skip)]
    id: u64,
    #[serde(skip)]
    cancel: CancellationToken,
}

#[derive(Clone, Serialize)]
struct TestReport {
    id: u64,
    users: usize,
    duration: String,
    ramp: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    status: RunStatus,
    metrics: Value,
    tracked_users: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StartRequest {
    users: usize,
    duration: String,
    ramp: String,
}

#[derive(Debug, Deserialize)]
struct CountRequest {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct UsernameRequest {
    username: String,
}

impl ControlState {
    fn append_report(
        &mut self,
        run: &TestRun,
        end_time: DateTime<Utc>,
        status: RunStatus,
        metrics: Value,
        tracked_users: Vec<String>,
    ) {
        let id = self.reports.len() as u64 + 1;
        self.reports.push(TestReport {
            id,
            users: run.users,
            duration: run.duration.clone(),
            ramp: run.ramp.clone(),
            start_time: run.start_time,
            end_time,
            status,
            metrics,
            tracked_users,
        });
    }
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let cleanup = CleanupTracker::new(config.clone())?;
        let scrape = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config,
            cleanup,
            scrape,
            inner: Arc::new(RwLock::new(ControlState::default())),
        })
    }

    /// Scrape the exposition endpoint and pull out the well-known values.
    async fn collect_metrics(&self) -> Value {
        let url = format!("http://127.0.0.1:{}/metrics", self.config.metrics_port);
        let text = match self.scrape.get(&url).send().await {
            Ok(response) => match response.text().await {
                Ok(text) => text,
                Err(_) => return json!({"error": "could not read metrics"}),
            },
            Err(_) => return json!({"error": "could not collect metrics"}),
        };
        parse_metrics_text(&text)
    }

    async fn total_users(&self) -> i64 {
        let url = format!(
            "{}/api/users/dashboard",
            self.config.services.user_service.base_url
        );
        let Ok(response) = self.scrape.get(&url).send().await else {
            return 0;
        };
        let Ok(data) = response.json::<Value>().await else {
            return 0;
        };
        data.get("totalUsers").and_then(|t| t.as_i64()).unwrap_or(0)
    }
}

static RE_ACTIVE_USERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"loadgen_active_users\s+(\d+)").expect("active users pattern"));
static RE_WEBSOCKETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"loadgen_websocket_connections\s+(\d+)").expect("websocket pattern")
});
static RE_REQUESTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"loadgen_requests_total(?:.*?)\s+(\d+)").expect("requests pattern"));

fn parse_metrics_text(text: &str) -> Value {
    let mut parsed = serde_json::Map::new();
    parsed.insert("timestamp".into(), json!(Utc::now()));
    parsed.insert("status".into(), json!("collected"));

    if let Some(captures) = RE_ACTIVE_USERS.captures(text) {
        if let Ok(value) = captures[1].parse::<i64>() {
            parsed.insert("active_users".into(), json!(value));
        }
    }
    if let Some(captures) = RE_WEBSOCKETS.captures(text) {
        if let Ok(value) = captures[1].parse::<i64>() {
            parsed.insert("websocket_connections".into(), json!(value));
        }
    }
    // several series share the prefix; the last match is the aggregate
    if let Some(captures) = RE_REQUESTS.captures_iter(text).last() {
        if let Ok(value) = captures[1].parse::<i64>() {
            parsed.insert("total_requests".into(), json!(value));
        }
    }
    Value::Object(parsed)
}

/// A token that fires after `timeout`, bounding an operation without
/// dropping its in-flight work.
fn deadline_token(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let deadline = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        deadline.cancel();
    });
    token
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/status", get(status))
        .route("/api/overview", get(overview))
        .route("/api/reports", get(reports))
        .route("/api/reduce", post(reduce))
        .route("/api/delete-users", post(delete_users))
        .route("/api/delete-user", post(delete_user))
        .route("/metrics", get(metrics_proxy))
        .with_state(state)
}

/// Router for the exposition port.
pub fn metrics_router() -> Router {
    Router::new().route(
        "/metrics",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                metrics::render(),
            )
        }),
    )
}

pub async fn serve(config: Arc<Config>) -> Result<()> {
    let state = AppState::new(config.clone())?;
    let addr = format!("0.0.0.0:{}", config.web_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind control plane on {addr}"))?;
    info!("control plane on http://{addr}/");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn home() -> Html<&'static str> {
    Html(page::CONTROL_PAGE)
}

async fn start(State(state): State<AppState>, Json(req): Json<StartRequest>) -> Json<Value> {
    let cancel = CancellationToken::new();
    {
        let mut inner = state.inner.write().await;
        if let Some(current) = &inner.current {
            if current.status == RunStatus::Running {
                info!("replacing the running test");
                current.cancel.cancel();
            }
        }
        let id = inner.next_run_id;
        inner.next_run_id += 1;
        inner.current = Some(TestRun {
            users: req.users,
            duration: req.duration.clone(),
            ramp: req.ramp.clone(),
            status: RunStatus::Running,
            start_time: Utc::now(),
            id,
            cancel: cancel.clone(),
        });
        tokio::spawn(run_test(state.clone(), id, req, cancel));
    }
    Json(json!({"status": "started"}))
}

async fn run_test(state: AppState, run_id: u64, req: StartRequest, cancel: CancellationToken) {
    let duration = match humantime::parse_duration(&req.duration) {
        Ok(duration) => duration,
        Err(e) => {
            warn!("invalid test duration {:?}: {e}", req.duration);
            let mut inner = state.inner.write().await;
            if let Some(current) = inner.current.as_mut() {
                if current.id == run_id {
                    current.status = RunStatus::Error;
                }
            }
            return;
        }
    };

    let generator = Generator::new(
        state.config.clone(),
        req.users,
        duration,
        &req.ramp,
        state.cleanup.clone(),
    );
    generator.run(cancel).await;
    let end_time = Utc::now();

    let metrics = state.collect_metrics().await;
    let tracked = state.cleanup.tracked_users();
    let mut inner = state.inner.write().await;
    match inner.current.take() {
        Some(run) if run.id == run_id && run.status == RunStatus::Running => {
            inner.append_report(&run, end_time, RunStatus::Completed, metrics, tracked);
        }
        // a stop or a replacement start already settled this run
        other => inner.current = other,
    }
}

async fn stop(State(state): State<AppState>) -> Json<Value> {
    let running = {
        let inner = state.inner.read().await;
        inner
            .current
            .as_ref()
            .is_some_and(|c| c.status == RunStatus::Running)
    };
    if running {
        let metrics = state.collect_metrics().await;
        let tracked = state.cleanup.tracked_users();
        let mut inner = state.inner.write().await;
        if let Some(run) = inner.current.take() {
            if run.status == RunStatus::Running {
                run.cancel.cancel();
                let end_time = Utc::now();
                inner.append_report(&run, end_time, RunStatus::Stopped, metrics, tracked);
                info!("test stopped");
            } else {
                inner.current = Some(run);
            }
        }
    }
    Json(json!({"status": "stopped"}))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    match &inner.current {
        Some(run) => Json(json!(run)),
        None => Json(json!({"status": "stopped"})),
    }
}

async fn overview(State(state): State<AppState>) -> Json<Value> {
    let total_users = state.total_users().await;
    let metrics = state.collect_metrics().await;
    let tracked = state.cleanup.tracked_users();
    let tracked_count = tracked.len();
    Json(json!({
        "total_users": total_users,
        "tracked_users": tracked,
        "tracked_count": tracked_count,
        "metrics": metrics,
    }))
}

async fn reports(State(state): State<AppState>) -> Json<Value> {
    let inner = state.inner.read().await;
    let reports = &inner.reports;
    let last_five = &reports[reports.len().saturating_sub(5)..];
    Json(json!(last_five))
}

async fn reduce(State(state): State<AppState>, Json(req): Json<CountRequest>) -> Json<Value> {
    let cancel = deadline_token(Duration::from_secs(30));
    let (deleted, failed) = state.cleanup.delete_test_users(req.count, &cancel).await;
    Json(json!({
        "deleted_count": deleted.len(),
        "deleted_users": deleted,
        "failed_users": failed,
        "remaining": state.cleanup.tracked_count(),
        "status": "completed",
    }))
}

async fn delete_users(State(state): State<AppState>, Json(req): Json<CountRequest>) -> Json<Value> {
    let cancel = deadline_token(Duration::from_secs(60));
    let (deleted, failed) = state.cleanup.delete_concurrent(req.count, 10, &cancel).await;
    Json(json!({
        "deleted_count": deleted.len(),
        "deleted_users": deleted,
        "failed_users": failed,
        "remaining": state.cleanup.tracked_count(),
        "status": "completed",
    }))
}

async fn delete_user(
    State(state): State<AppState>,
    Json(req): Json<UsernameRequest>,
) -> Json<Value> {
    let cancel = deadline_token(Duration::from_secs(15));
    let (deleted, status_code) = state.cleanup.delete_one(&req.username, &cancel).await;
    Json(json!({
        "deleted": deleted,
        "status_code": status_code,
        "remaining": state.cleanup.tracked_count(),
    }))
}

async fn metrics_proxy(State(state): State<AppState>) -> Response {
    let url = format!("http://127.0.0.1:{}/metrics", state.config.metrics_port);
    match state.scrape.get(&url).send().await {
        Ok(response) => match response.text().await {
            Ok(text) => (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                text,
            )
                .into_response(),
            Err(_) => (StatusCode::BAD_GATEWAY, "could not fetch metrics").into_response(),
        },
        Err(_) => (StatusCode::BAD_GATEWAY, "could not fetch metrics").into_response(),
    }
}
