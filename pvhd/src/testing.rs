//! Scripted executor client shared by the orchestrator tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use pvh_common::protocol::{ExecuteRequest, ExecuteResponse, RunPhase};
use pvh_common::types::{JobStatus, TestOutcome, TestResult, ValidationJob, WorkerConfig, WorkerId};

use crate::client::{ClientError, SandboxClient};

pub(crate) const TARGET: &str = "tests/test_calc.py::test_sub";

pub(crate) enum Reply {
    Respond(Result<ExecuteResponse, ClientError>),
    /// Never answer; the caller has to give up on the call.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub worker: WorkerId,
    pub instance_id: String,
    pub phase: Option<RunPhase>,
    pub patch: String,
    pub explicit: Option<Vec<String>>,
}

type Responder = dyn Fn(&WorkerConfig, &ExecuteRequest) -> Reply + Send + Sync;

pub(crate) struct ScriptedClient {
    responder: Box<Responder>,
    pub calls: Mutex<Vec<Call>>,
    /// Worker ids whose health probe fails.
    pub down: Mutex<HashSet<String>>,
}

impl ScriptedClient {
    pub fn new(responder: impl Fn(&WorkerConfig, &ExecuteRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            down: Mutex::new(HashSet::new()),
        }
    }

    /// Run A answers `before`, run B answers `after`, on any worker.
    pub fn contract(before: &'static [(&'static str, TestOutcome)], after: &'static [(&'static str, TestOutcome)]) -> Self {
        Self::new(move |_, request| {
            let outcomes = match request.phase {
                Some(RunPhase::After) => after,
                _ => before,
            };
            Reply::Respond(Ok(completed(&[TARGET], outcomes)))
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl SandboxClient for ScriptedClient {
    async fn execute(
        &self,
        worker: &WorkerConfig,
        request: &ExecuteRequest,
        _timeout: Duration,
    ) -> Result<ExecuteResponse, ClientError> {
        self.calls.lock().unwrap().push(Call {
            worker: worker.id.clone(),
            instance_id: request.instance_id.clone(),
            phase: request.phase,
            patch: request.patch.clone(),
            explicit: request.targets.explicit.clone(),
        });
        match (self.responder)(worker, request) {
            Reply::Respond(result) => result,
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn probe(&self, worker: &WorkerConfig, _timeout: Duration) -> Result<(), ClientError> {
        if self.down.lock().unwrap().contains(worker.id.as_str()) {
            Err(ClientError::Unreachable {
                worker: worker.id.clone(),
                detail: "connection refused".into(),
            })
        } else {
            Ok(())
        }
    }
}

/// A completed response with the given per-test outcomes.
pub(crate) fn completed(targets: &[&str], outcomes: &[(&str, TestOutcome)]) -> ExecuteResponse {
    let mut result = TestResult {
        duration: 0.4,
        ..Default::default()
    };
    for (name, outcome) in outcomes {
        match outcome {
            TestOutcome::Passed => result.passed += 1,
            TestOutcome::Failed => result.failed += 1,
            TestOutcome::Error => result.errors += 1,
            TestOutcome::Skipped => result.skipped += 1,
        }
        result.collected += 1;
        result.per_test.insert(name.to_string(), *outcome);
    }
    result.raw_output = format!("{} passed, {} failed", result.passed, result.failed);
    ExecuteResponse::completed(
        result,
        targets.iter().map(|t| t.to_string()).collect(),
        false,
        Vec::new(),
    )
}

pub(crate) fn worker(id: &str) -> WorkerConfig {
    WorkerConfig {
        id: WorkerId::new(id),
        address: format!("http://{id}:7600"),
        capacity: 2,
        affinity: Vec::new(),
        enabled: true,
    }
}

pub(crate) fn job(instance_id: &str) -> ValidationJob {
    ValidationJob {
        instance_id: instance_id.into(),
        repository: "acme/calc".into(),
        base_commit: "a".repeat(40),
        patch: "diff --git a/calc.py b/calc.py\n--- a/calc.py\n+++ b/calc.py\n@@ -1 +1,3 @@\n def add(a, b):\n+def sub(a, b):\n+    return a - b\n".into(),
        test_patch: "diff --git a/tests/test_calc.py b/tests/test_calc.py\n--- a/tests/test_calc.py\n+++ b/tests/test_calc.py\n@@ -1 +1,3 @@\n import calc\n+def test_sub():\n+    assert calc.sub(3, 1) == 2\n".into(),
        target_tests: None,
        timeout_secs: 60,
        attempts: 0,
        status: JobStatus::Pending,
    }
}
