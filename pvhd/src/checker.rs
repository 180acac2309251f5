//! Before/after validation contract.
//!
//! Run A applies only the test diff, run B the fix plus the test diff. The
//! two runs go to the same worker one after the other; each is a fresh
//! sandbox that the executor destroys before answering, so run A is gone
//! before run B starts. Run B is scoped to exactly the selectors run A used.

use std::sync::Arc;
use std::time::Duration;

use pvh_common::contract::evaluate;
use pvh_common::errors::RetryableError;
use pvh_common::patch::combine;
use pvh_common::protocol::{ExecuteRequest, ExecuteResponse, RunPhase, TargetSpec};
use pvh_common::types::{
    ContractVerdict, ExecutionStatus, RunStats, ValidationJob, VerdictKind, WorkerConfig,
};
use tracing::{debug, info};

use crate::client::{ClientError, SandboxClient};

/// How one attempt at a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// A definitive verdict; the job is done.
    Verdict(ContractVerdict),
    /// Transient failure that consumes an attempt.
    Retryable {
        kind: VerdictKind,
        detail: String,
        /// Whether the failure counts against the worker's health.
        worker_fault: bool,
        /// Run A, when it completed before the failure.
        before: Option<RunStats>,
    },
    /// The worker is full; try elsewhere without consuming an attempt.
    Backpressure { detail: String },
}

impl CheckOutcome {
    fn from_client_error(e: ClientError, before: Option<RunStats>) -> Self {
        let kind = match e {
            ClientError::Timeout { .. } => VerdictKind::Timeout,
            ClientError::Unreachable { .. } | ClientError::Protocol { .. } => {
                VerdictKind::InfrastructureError
            }
        };
        Self::Retryable {
            kind,
            detail: format!("{}: {}", e.code().code_string(), e),
            worker_fault: true,
            before,
        }
    }
}

/// Error detail of a non-completed response, prefixed with its code.
fn describe(response: &ExecuteResponse) -> String {
    match &response.error {
        Some(err) => format!("{}: {}", err.code.code_string(), err.message),
        None => format!("{:?}", response.status),
    }
}

/// Map a non-completed response onto an outcome.
fn interrupted(response: &ExecuteResponse, before: Option<RunStats>) -> CheckOutcome {
    let detail = describe(response);
    match response.status {
        ExecutionStatus::PatchRejected => CheckOutcome::Verdict(ContractVerdict {
            before,
            ..ContractVerdict::bare(VerdictKind::PatchRejected)
        }),
        ExecutionStatus::Unresolvable => CheckOutcome::Verdict(ContractVerdict {
            before,
            ..ContractVerdict::bare(VerdictKind::Unresolvable)
        }),
        ExecutionStatus::Timeout => CheckOutcome::Retryable {
            kind: VerdictKind::Timeout,
            detail,
            worker_fault: false,
            before,
        },
        ExecutionStatus::Backpressure => CheckOutcome::Backpressure { detail },
        ExecutionStatus::InfrastructureError | ExecutionStatus::Completed => {
            CheckOutcome::Retryable {
                kind: VerdictKind::InfrastructureError,
                detail,
                worker_fault: true,
                before,
            }
        }
    }
}

pub struct ContractChecker<C: SandboxClient> {
    client: Arc<C>,
    /// Added to the job timeout for each call to cover sandbox preparation.
    request_overhead: Duration,
}

impl<C: SandboxClient> ContractChecker<C> {
    pub fn new(client: Arc<C>, request_overhead: Duration) -> Self {
        Self {
            client,
            request_overhead,
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Run both halves of the contract for `job` on `worker`.
    pub async fn check(&self, worker: &WorkerConfig, job: &ValidationJob) -> CheckOutcome {
        let call_timeout = Duration::from_secs(job.timeout_secs) + self.request_overhead;

        let before_request = ExecuteRequest {
            instance_id: job.instance_id.clone(),
            repository: job.repository.clone(),
            base_commit: job.base_commit.clone(),
            patch: job.test_patch.clone(),
            targets: TargetSpec {
                explicit: job.target_tests.clone(),
                test_patch: job.test_patch.clone(),
            },
            timeout_secs: job.timeout_secs,
            phase: Some(RunPhase::Before),
        };
        let before = match self
            .client
            .execute(worker, &before_request, call_timeout)
            .await
        {
            Ok(response) if response.status == ExecutionStatus::Completed => response,
            Ok(response) => return interrupted(&response, None),
            Err(e) => return CheckOutcome::from_client_error(e, None),
        };
        let before_stats = RunStats::from_result(
            ExecutionStatus::Completed,
            &before.result,
            before.dependency_repairs.clone(),
        );
        debug!(
            instance_id = %job.instance_id,
            worker_id = %worker.id,
            passed = before.result.passed,
            failed = before.result.failed,
            errors = before.result.errors,
            "Run A completed"
        );

        let after_request = ExecuteRequest {
            patch: combine(&job.patch, &job.test_patch),
            targets: TargetSpec {
                explicit: Some(before.targets_run.clone()),
                test_patch: job.test_patch.clone(),
            },
            phase: Some(RunPhase::After),
            ..before_request
        };
        let after = match self
            .client
            .execute(worker, &after_request, call_timeout)
            .await
        {
            Ok(response) if response.status == ExecutionStatus::Completed => response,
            Ok(response) => return interrupted(&response, Some(before_stats)),
            Err(e) => return CheckOutcome::from_client_error(e, Some(before_stats)),
        };

        let evaluation = evaluate(&before.targets_run, &before.result, &after.result);
        info!(
            instance_id = %job.instance_id,
            worker_id = %worker.id,
            verdict = %evaluation.verdict,
            basis = ?evaluation.basis,
            "Contract evaluated"
        );

        CheckOutcome::Verdict(ContractVerdict {
            verdict: evaluation.verdict,
            before: Some(before_stats),
            after: Some(RunStats::from_result(
                ExecutionStatus::Completed,
                &after.result,
                after.dependency_repairs.clone(),
            )),
            basis: Some(evaluation.basis),
            targets: before.targets_run,
            coarse_grained: before.coarse_grained,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedClient, TARGET, completed, job, worker};
    use pvh_common::errors::ErrorCode;
    use pvh_common::types::{TestOutcome, VerdictBasis, WorkerId};

    fn checker(client: ScriptedClient) -> (Arc<ScriptedClient>, ContractChecker<ScriptedClient>) {
        let client = Arc::new(client);
        (client.clone(), ContractChecker::new(client, Duration::from_secs(5)))
    }

    fn verdict(outcome: CheckOutcome) -> ContractVerdict {
        match outcome {
            CheckOutcome::Verdict(v) => v,
            other => panic!("expected a verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_then_pass_meets_contract() {
        let (client, checker) = checker(ScriptedClient::contract(
            &[(TARGET, TestOutcome::Failed)],
            &[(TARGET, TestOutcome::Passed)],
        ));
        let job = job("acme__calc-1");

        let v = verdict(checker.check(&worker("w1"), &job).await);
        assert_eq!(v.verdict, VerdictKind::ContractMet);
        assert_eq!(v.basis, Some(VerdictBasis::PerTest));
        assert_eq!(v.targets, vec![TARGET.to_string()]);
        assert_eq!(v.before.as_ref().unwrap().failed, 1);
        assert_eq!(v.after.as_ref().unwrap().passed, 1);

        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].phase, Some(RunPhase::Before));
        assert_eq!(calls[0].patch, job.test_patch);
        assert!(calls[0].explicit.is_none());
        assert_eq!(calls[1].phase, Some(RunPhase::After));
        assert!(calls[1].patch.contains("def sub"));
        assert!(calls[1].patch.contains("def test_sub"));
        assert_eq!(calls[1].explicit, Some(vec![TARGET.to_string()]));
        assert!(calls.iter().all(|c| c.worker == WorkerId::new("w1")));
    }

    #[tokio::test]
    async fn passing_before_is_not_reproducible() {
        let (_, checker) = checker(ScriptedClient::contract(
            &[(TARGET, TestOutcome::Passed)],
            &[(TARGET, TestOutcome::Passed)],
        ));
        let v = verdict(checker.check(&worker("w1"), &job("a-1")).await);
        assert_eq!(v.verdict, VerdictKind::NotReproducible);
    }

    #[tokio::test]
    async fn failing_after_is_fix_incomplete() {
        let (_, checker) = checker(ScriptedClient::contract(
            &[(TARGET, TestOutcome::Failed)],
            &[(TARGET, TestOutcome::Error)],
        ));
        let v = verdict(checker.check(&worker("w1"), &job("a-1")).await);
        assert_eq!(v.verdict, VerdictKind::FixIncomplete);
    }

    #[tokio::test]
    async fn rejected_test_patch_is_terminal() {
        let (client, checker) = checker(ScriptedClient::new(|_, _| {
            Reply::Respond(Ok(ExecuteResponse::failed(
                ExecutionStatus::PatchRejected,
                ErrorCode::SandboxPatchRejected,
                "patch does not apply",
            )))
        }));
        let v = verdict(checker.check(&worker("w1"), &job("a-1")).await);
        assert_eq!(v.verdict, VerdictKind::PatchRejected);
        assert!(v.before.is_none());
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn run_b_timeout_keeps_run_a_stats() {
        let (_, checker) = checker(ScriptedClient::new(|_, request| {
            Reply::Respond(Ok(match request.phase {
                Some(RunPhase::After) => ExecuteResponse::failed(
                    ExecutionStatus::Timeout,
                    ErrorCode::SandboxTimeout,
                    "exceeded 60s",
                ),
                _ => completed(&[TARGET], &[(TARGET, TestOutcome::Failed)]),
            }))
        }));
        match checker.check(&worker("w1"), &job("a-1")).await {
            CheckOutcome::Retryable {
                kind,
                worker_fault,
                before,
                detail,
            } => {
                assert_eq!(kind, VerdictKind::Timeout);
                assert!(!worker_fault);
                assert_eq!(before.unwrap().failed, 1);
                assert!(detail.contains("exceeded 60s"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failures_blame_the_worker() {
        let (_, checker) = checker(ScriptedClient::new(|worker, _| {
            Reply::Respond(Err(ClientError::Unreachable {
                worker: worker.id.clone(),
                detail: "connection refused".into(),
            }))
        }));
        match checker.check(&worker("w1"), &job("a-1")).await {
            CheckOutcome::Retryable {
                kind, worker_fault, ..
            } => {
                assert_eq!(kind, VerdictKind::InfrastructureError);
                assert!(worker_fault);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn backpressure_passes_through() {
        let (_, checker) = checker(ScriptedClient::new(|_, _| {
            Reply::Respond(Ok(ExecuteResponse::failed(
                ExecutionStatus::Backpressure,
                ErrorCode::WorkerBackpressure,
                "at capacity",
            )))
        }));
        assert!(matches!(
            checker.check(&worker("w1"), &job("a-1")).await,
            CheckOutcome::Backpressure { .. }
        ));
    }
}
