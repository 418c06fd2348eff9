use crate::error::MitmError;
use crate::hijack::{ControlMessage, HijackInfo, HijackTaskRegistry};
use crate::session::{SessionRegistry, SessionSummary};
use crate::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Shared counters, updated lock-free from the traffic path
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub active_connections: AtomicU64,
    pub hijack_tasks_registered: AtomicU64,
    pub requests_dropped: AtomicU64,
    pub responses_dropped: AtomicU64,
    pub flows_saved: AtomicU64,
    pub flows_dropped: AtomicU64,
    pub slow_rules: AtomicU64,
    pub hook_failures: AtomicU64,
    pub hook_timeouts: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub websocket_frames: AtomicU64,
}

/// Decrements `active_connections` when dropped
pub struct ActiveGuard(Arc<Metrics>);

impl Metrics {
    pub fn track_active(self: &Arc<Self>) -> ActiveGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveGuard(self.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub registry: Arc<HijackTaskRegistry>,
    pub sessions: Arc<SessionRegistry>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct MetricsResponse {
    total_requests: u64,
    active_connections: u64,
    hijack: HijackMetrics,
    flows: FlowMetrics,
    hooks: HookMetrics,
    slow_rules: u64,
    upstream_errors: u64,
    websocket_frames: u64,
}

#[derive(Serialize)]
struct HijackMetrics {
    enabled: bool,
    pending: usize,
    registered: u64,
    requests_dropped: u64,
    responses_dropped: u64,
}

#[derive(Serialize)]
struct FlowMetrics {
    saved: u64,
    dropped: u64,
}

#[derive(Serialize)]
struct HookMetrics {
    failures: u64,
    timeouts: u64,
}

#[derive(Serialize)]
struct ControlResponse {
    delivered: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/hijack/tasks", get(tasks_handler))
        .route("/hijack/control", post(control_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state)
}

pub async fn start_admin_server(port: u16, state: AdminState) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        MitmError::Network(format!("Failed to bind admin port {}: {}", port, e))
    })?;
    serve_admin(listener, state).await
}

pub async fn serve_admin(listener: tokio::net::TcpListener, state: AdminState) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .map_err(|e| MitmError::Network(format!("Admin server failed: {}", e)))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> Json<MetricsResponse> {
    let m = &state.metrics;
    Json(MetricsResponse {
        total_requests: m.total_requests.load(Ordering::Relaxed),
        active_connections: m.active_connections.load(Ordering::Relaxed),
        hijack: HijackMetrics {
            enabled: state.registry.can_register(),
            pending: state.registry.len(),
            registered: m.hijack_tasks_registered.load(Ordering::Relaxed),
            requests_dropped: m.requests_dropped.load(Ordering::Relaxed),
            responses_dropped: m.responses_dropped.load(Ordering::Relaxed),
        },
        flows: FlowMetrics {
            saved: m.flows_saved.load(Ordering::Relaxed),
            dropped: m.flows_dropped.load(Ordering::Relaxed),
        },
        hooks: HookMetrics {
            failures: m.hook_failures.load(Ordering::Relaxed),
            timeouts: m.hook_timeouts.load(Ordering::Relaxed),
        },
        slow_rules: m.slow_rules.load(Ordering::Relaxed),
        upstream_errors: m.upstream_errors.load(Ordering::Relaxed),
        websocket_frames: m.websocket_frames.load(Ordering::Relaxed),
    })
}

async fn tasks_handler(State(state): State<AdminState>) -> Json<Vec<HijackInfo>> {
    Json(state.registry.list())
}

async fn control_handler(
    State(state): State<AdminState>,
    Json(msg): Json<ControlMessage>,
) -> (StatusCode, Json<ControlResponse>) {
    let delivered = state.registry.unicast(msg);
    let status = if delivered {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(ControlResponse { delivered }))
}

async fn sessions_handler(State(state): State<AdminState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}
