//! Wire protocol between the orchestrator and sandbox executors.
//!
//! `POST /v1/execute` takes an [`ExecuteRequest`] and always answers with an
//! [`ExecuteResponse`] body, whatever the HTTP status, so clients decode a
//! single shape. `GET /ready` answers with a [`ReadyReport`].

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::types::{DependencyRepair, ExecutionStatus, TestResult};

/// How the executor should decide what to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Identifiers supplied with the job; an empty list counts as absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit: Option<Vec<String>>,
    /// Test-only diff used to derive targets.
    #[serde(default)]
    pub test_patch: String,
}

/// Which half of the before/after contract a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Before,
    After,
}

/// One sandbox execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub instance_id: String,
    pub repository: String,
    pub base_commit: String,
    /// Diff applied to the pristine checkout before running.
    pub patch: String,
    pub targets: TargetSpec,
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,
}

/// Error detail attached to non-completed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

/// Result of one sandbox execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: ExecutionStatus,
    #[serde(flatten)]
    pub result: TestResult,
    /// Framework selectors the run was scoped to.
    #[serde(default)]
    pub targets_run: Vec<String>,
    #[serde(default)]
    pub coarse_grained: bool,
    #[serde(default)]
    pub dependency_repairs: Vec<DependencyRepair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ExecuteResponse {
    pub fn completed(
        result: TestResult,
        targets_run: Vec<String>,
        coarse_grained: bool,
        dependency_repairs: Vec<DependencyRepair>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result,
            targets_run,
            coarse_grained,
            dependency_repairs,
            error: None,
        }
    }

    pub fn failed(status: ExecutionStatus, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            result: TestResult::default(),
            targets_run: Vec::new(),
            coarse_grained: false,
            dependency_repairs: Vec::new(),
            error: Some(ErrorBody {
                code,
                message: message.into(),
                retryable: status.is_retryable(),
            }),
        }
    }
}

/// Capacity and readiness of an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyReport {
    pub status: String,
    pub backend: String,
    pub capacity: u32,
    pub in_flight: u32,
    pub queued: u32,
    pub queue_depth: u32,
}
