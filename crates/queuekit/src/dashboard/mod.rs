use std::fmt::Write as _;
use std::sync::Arc;

use axum::response::Html;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::error::QueueError;
use crate::jobs::{JobCounts, JobRecord, JobState};
use crate::registry::ManagedQueue;

mod page;

#[derive(Clone)]
pub struct DashboardEntry {
    pub name: String,
    pub dead_letter: bool,
    pub queue: Arc<dyn ManagedQueue>,
}

/// Read-only operational view over every registered queue.
#[derive(Clone)]
pub struct Dashboard {
    broker: Arc<dyn Broker>,
    entries: Arc<RwLock<Vec<DashboardEntry>>>,
}

impl Dashboard {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Add a queue binding. Returns `false` (and changes nothing) when a queue
    /// with this name is already registered.
    pub fn register(&self, name: &str, queue: Arc<dyn ManagedQueue>, dead_letter: bool) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.name == name) {
            return false;
        }
        entries.push(DashboardEntry {
            name: name.to_string(),
            dead_letter,
            queue,
        });
        true
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.entries.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn entry(&self, name: &str) -> Option<DashboardEntry> {
        self.entries.read().iter().find(|e| e.name == name).cloned()
    }

    fn snapshot(&self) -> Vec<DashboardEntry> {
        self.entries.read().clone()
    }

    /// Router mounted at `base_path` (for example `/admin/queues`).
    pub fn router(&self, base_path: &str) -> Router {
        let inner = Router::new()
            .route("/", get(index))
            .route("/api/queues", get(list_queues))
            .route("/api/queues/:name", get(get_queue))
            .route("/api/queues/:name/jobs", get(list_jobs))
            .route("/metrics", get(metrics_prom))
            .route("/health", get(health))
            .with_state(self.clone());

        let base = base_path.trim_end_matches('/');
        if base.is_empty() {
            inner
        } else if base.starts_with('/') {
            Router::new().nest(base, inner)
        } else {
            Router::new().nest(&format!("/{base}"), inner)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSummary {
    pub name: String,
    pub dead_letter: bool,
    pub paused: bool,
    pub counts: JobCounts,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

fn internal_err(e: QueueError) -> (StatusCode, String) {
    let status = if e.is_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, format!("queue error: {e}"))
}

fn not_found(name: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("unknown queue: {name}"))
}

async fn summarize(entry: &DashboardEntry) -> Result<QueueSummary, QueueError> {
    Ok(QueueSummary {
        name: entry.name.clone(),
        dead_letter: entry.dead_letter,
        paused: entry.queue.paused().await?,
        counts: entry.queue.counts().await?,
    })
}

async fn index() -> Html<&'static str> {
    Html(page::DASHBOARD_HTML)
}

async fn list_queues(
    State(dashboard): State<Dashboard>,
) -> Result<Json<Vec<QueueSummary>>, (StatusCode, String)> {
    let entries = dashboard.snapshot();
    let summaries = futures::future::try_join_all(entries.iter().map(summarize))
        .await
        .map_err(internal_err)?;
    Ok(Json(summaries))
}

async fn get_queue(
    State(dashboard): State<Dashboard>,
    Path(name): Path<String>,
) -> Result<Json<QueueSummary>, (StatusCode, String)> {
    let entry = dashboard.entry(&name).ok_or_else(|| not_found(&name))?;
    Ok(Json(summarize(&entry).await.map_err(internal_err)?))
}

async fn list_jobs(
    State(dashboard): State<Dashboard>,
    Path(name): Path<String>,
    Query(q): Query<JobsQuery>,
) -> Result<Json<Vec<JobRecord>>, (StatusCode, String)> {
    let entry = dashboard.entry(&name).ok_or_else(|| not_found(&name))?;

    let state = match q.state.as_deref() {
        None => JobState::Waiting,
        Some(raw) => JobState::parse(raw)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown job state: {raw}")))?,
    };
    let limit = q.limit.unwrap_or(50).clamp(1, 500);

    let jobs = entry
        .queue
        .jobs(state, limit)
        .await
        .map_err(internal_err)?;
    Ok(Json(jobs))
}

async fn metrics_prom(State(dashboard): State<Dashboard>) -> Response {
    // Prometheus text exposition, written by hand
    let mut body = String::new();
    body.push_str("# HELP queuekit_jobs Jobs per queue and state\n");
    body.push_str("# TYPE queuekit_jobs gauge\n");

    let mut paused_lines = String::new();
    for entry in dashboard.snapshot() {
        let summary = match summarize(&entry).await {
            Ok(s) => s,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("metrics error: {e}"),
                )
                    .into_response()
            }
        };
        for state in JobState::ALL {
            let _ = writeln!(
                body,
                "queuekit_jobs{{queue=\"{}\",state=\"{}\"}} {}",
                summary.name,
                state.as_str(),
                summary.counts.get(state)
            );
        }
        let _ = writeln!(
            paused_lines,
            "queuekit_queue_paused{{queue=\"{}\"}} {}",
            summary.name,
            u8::from(summary.paused)
        );
    }

    body.push_str("# HELP queuekit_queue_paused Whether the queue is paused\n");
    body.push_str("# TYPE queuekit_queue_paused gauge\n");
    body.push_str(&paused_lines);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn health(State(dashboard): State<Dashboard>) -> impl IntoResponse {
    match dashboard.broker.ping().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("broker: {e}")),
    }
}
