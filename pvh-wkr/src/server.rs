//! HTTP API for the sandbox executor.
//!
//! Provides:
//! - `POST /v1/execute` - run one sandbox execution
//! - `/health` - liveness
//! - `/ready` - capacity and readiness

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use pvh_common::protocol::{ExecuteRequest, ExecuteResponse};
use pvh_common::types::ExecutionStatus;
use serde_json::json;

use crate::backend::SandboxBackend;
use crate::executor::SandboxExecutor;

/// Shared state for HTTP handlers.
pub struct HttpState<B: SandboxBackend> {
    pub executor: Arc<SandboxExecutor<B>>,
    pub version: &'static str,
    pub started_at: Instant,
    pub pid: u32,
}

pub fn create_router<B: SandboxBackend>(state: HttpState<B>) -> Router {
    Router::new()
        .route("/v1/execute", post(execute_handler::<B>))
        .route("/health", get(health_handler::<B>))
        .route("/ready", get(ready_handler::<B>))
        .with_state(Arc::new(state))
}

/// HTTP status for an execution outcome. The body is always an
/// [`ExecuteResponse`].
pub fn status_code_for(status: ExecutionStatus) -> StatusCode {
    match status {
        ExecutionStatus::Completed => StatusCode::OK,
        ExecutionStatus::PatchRejected | ExecutionStatus::Unresolvable => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ExecutionStatus::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ExecutionStatus::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        ExecutionStatus::InfrastructureError => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn execute_handler<B: SandboxBackend>(
    State(state): State<Arc<HttpState<B>>>,
    Json(request): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let response: ExecuteResponse = state.executor.execute(request).await;
    (status_code_for(response.status), Json(response))
}

async fn health_handler<B: SandboxBackend>(
    State(state): State<Arc<HttpState<B>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// 200 while the executor can admit another request, 503 otherwise.
async fn ready_handler<B: SandboxBackend>(
    State(state): State<Arc<HttpState<B>>>,
) -> impl IntoResponse {
    let report = state.executor.ready_report();
    let code = if report.status == "ready" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Bind `listen` and serve until the task is dropped or fails.
pub async fn start_server<B: SandboxBackend>(
    listen: &str,
    state: HttpState<B>,
) -> std::io::Result<tokio::task::JoinHandle<Result<(), std::io::Error>>> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;

    tracing::info!("Sandbox executor listening on {}", listener.local_addr()?);

    Ok(tokio::spawn(async move { axum::serve(listener, router).await }))
}
