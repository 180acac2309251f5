//! Client side of the sandbox executor protocol.

use std::future::Future;
use std::time::Duration;

use pvh_common::errors::{ErrorCode, RetryableError};
use pvh_common::protocol::{ExecuteRequest, ExecuteResponse};
use pvh_common::types::{ExecutionStatus, WorkerConfig, WorkerId};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("worker {worker} unreachable: {detail}")]
    Unreachable { worker: WorkerId, detail: String },

    #[error("worker {worker} did not answer within {after:?}")]
    Timeout { worker: WorkerId, after: Duration },

    #[error("worker {worker} sent an unusable response: {detail}")]
    Protocol { worker: WorkerId, detail: String },
}

impl RetryableError for ClientError {
    fn is_retryable(&self) -> bool {
        true
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::Unreachable { .. } => ErrorCode::WorkerUnreachable,
            Self::Timeout { .. } => ErrorCode::SandboxTimeout,
            Self::Protocol { .. } => ErrorCode::WorkerProtocolError,
        }
    }
}

/// Transport to sandbox executors.
pub trait SandboxClient: Send + Sync + 'static {
    /// Run one request on `worker`. Non-completed executions arrive as
    /// `Ok` responses with a non-`Completed` status; `Err` means the call
    /// itself failed.
    fn execute(
        &self,
        worker: &WorkerConfig,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<ExecuteResponse, ClientError>> + Send;

    /// Liveness probe.
    fn probe(
        &self,
        worker: &WorkerConfig,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

/// JSON over HTTP with `reqwest`.
#[derive(Clone, Default)]
pub struct HttpSandboxClient {
    http: reqwest::Client,
}

impl HttpSandboxClient {
    pub fn new() -> Self {
        Self::default()
    }
}

fn endpoint(worker: &WorkerConfig, path: &str) -> String {
    format!("{}{}", worker.address.trim_end_matches('/'), path)
}

fn transport_error(worker: &WorkerConfig, timeout: Duration, e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout {
            worker: worker.id.clone(),
            after: timeout,
        }
    } else {
        ClientError::Unreachable {
            worker: worker.id.clone(),
            detail: e.to_string(),
        }
    }
}

impl SandboxClient for HttpSandboxClient {
    async fn execute(
        &self,
        worker: &WorkerConfig,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecuteResponse, ClientError> {
        let response = self
            .http
            .post(endpoint(worker, "/v1/execute"))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(worker, timeout, e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(worker, timeout, e))?;
        debug!(worker_id = %worker.id, %status, bytes = body.len(), "Execute response");

        match serde_json::from_slice::<ExecuteResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            // A proxy in front of the executor may answer 429 on its own.
            Err(_) if status == StatusCode::TOO_MANY_REQUESTS => Ok(ExecuteResponse::failed(
                ExecutionStatus::Backpressure,
                ErrorCode::WorkerBackpressure,
                "worker answered 429",
            )),
            Err(e) => Err(ClientError::Protocol {
                worker: worker.id.clone(),
                detail: format!("HTTP {status}: {e}"),
            }),
        }
    }

    async fn probe(&self, worker: &WorkerConfig, timeout: Duration) -> Result<(), ClientError> {
        let response = self
            .http
            .get(endpoint(worker, "/health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(worker, timeout, e))?;

        if !response.status().is_success() {
            return Err(ClientError::Protocol {
                worker: worker.id.clone(),
                detail: format!("health answered HTTP {}", response.status()),
            });
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol {
                worker: worker.id.clone(),
                detail: e.to_string(),
            })?;
        if body["status"] == "healthy" {
            Ok(())
        } else {
            Err(ClientError::Protocol {
                worker: worker.id.clone(),
                detail: format!("health status {}", body["status"]),
            })
        }
    }
}
