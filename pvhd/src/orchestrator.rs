//! Job scheduling, retries and result persistence.
//!
//! Each job moves `Pending -> Dispatched -> {Terminal | Retrying -> Dispatched}`.
//! The loop reacts to three sources: attempt reports from spawned dispatch
//! tasks, health transitions from the [`HealthMonitor`], and a tick that
//! releases jobs whose backoff has elapsed. Every attempt is persisted
//! before the job's next transition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pvh_common::config::{OrchestratorConfig, PvhConfig};
use pvh_common::errors::ErrorCode;
use pvh_common::types::{
    ContractVerdict, JobStatus, RepoId, ResultRecord, RunStats, ValidationJob, VerdictKind,
    WorkerId, WorkerStatus,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::checker::{CheckOutcome, ContractChecker};
use crate::client::SandboxClient;
use crate::health::{HealthMonitor, HealthTransition};
use crate::history::{ResultStore, RunSummary, StoreError};
use crate::selection::select_worker;
use crate::workers::WorkerPool;

/// Scheduling knobs, resolved from `[orchestrator]`.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_attempts: u32,
    pub max_concurrent: usize,
    pub per_worker_ceiling: u32,
    pub retry_backoff: Duration,
    pub saturation_cooldown: Duration,
    pub no_worker_grace: Duration,
    pub request_overhead: Duration,
    pub tick: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            max_concurrent: config.max_concurrent.max(1),
            per_worker_ceiling: config.per_worker_ceiling.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            saturation_cooldown: Duration::from_millis(config.saturation_cooldown_ms),
            no_worker_grace: Duration::from_secs(config.no_worker_grace_secs),
            request_overhead: Duration::from_secs(config.request_overhead_secs),
            tick: Duration::from_millis(250),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Backoff before attempt `attempt + 1`, doubled per attempt with +/-25% jitter.
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(6));
    let jitter = 0.75 + rand::random::<f64>() * 0.5;
    exp.mul_f64(jitter)
}

struct JobEntry {
    job: ValidationJob,
    repo: RepoId,
    weight: f64,
    last_worker: Option<WorkerId>,
    not_before: Instant,
    waiting_since: Option<Instant>,
}

struct Flight {
    index: usize,
    worker: WorkerId,
    started: Instant,
    abort: AbortHandle,
}

struct Report {
    token: u64,
    /// `None` when the dispatch task ended without producing an outcome.
    outcome: Option<CheckOutcome>,
}

/// Sends a report when dropped, so a panicking or aborted task is never
/// silently lost.
struct ReportGuard {
    token: u64,
    tx: mpsc::UnboundedSender<Report>,
    sent: bool,
}

impl ReportGuard {
    fn send(mut self, outcome: CheckOutcome) {
        self.sent = true;
        let _ = self.tx.send(Report {
            token: self.token,
            outcome: Some(outcome),
        });
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Report {
                token: self.token,
                outcome: None,
            });
        }
    }
}

struct RunState {
    entries: Vec<JobEntry>,
    queue: VecDeque<usize>,
    flights: HashMap<u64, Flight>,
    remaining: usize,
    next_token: u64,
    tx: mpsc::UnboundedSender<Report>,
}

impl RunState {
    fn abort_all(&mut self) {
        for (_, flight) in self.flights.drain() {
            flight.abort.abort();
        }
    }
}

/// What to write for a failed or abandoned attempt.
struct Failure {
    kind: VerdictKind,
    detail: String,
    before: Option<RunStats>,
    /// End the job regardless of remaining attempts.
    terminal: bool,
}

pub struct Orchestrator<C: SandboxClient> {
    pool: WorkerPool,
    checker: Arc<ContractChecker<C>>,
    monitor: HealthMonitor<C>,
    store: Arc<ResultStore>,
    settings: OrchestratorSettings,
    config: PvhConfig,
}

impl<C: SandboxClient> Orchestrator<C> {
    pub fn new(
        pool: WorkerPool,
        client: Arc<C>,
        monitor: HealthMonitor<C>,
        store: Arc<ResultStore>,
        config: PvhConfig,
    ) -> Self {
        let settings = OrchestratorSettings::from_config(&config.orchestrator);
        Self {
            pool,
            checker: Arc::new(ContractChecker::new(client, settings.request_overhead)),
            monitor,
            store,
            settings,
            config,
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.checker = Arc::new(ContractChecker::new(
            self.checker.client().clone(),
            settings.request_overhead,
        ));
        self.settings = settings;
        self
    }

    /// Drive `jobs` until each has a terminal record.
    ///
    /// Jobs that already have a terminal record in the store are skipped.
    pub async fn run(&self, jobs: Vec<ValidationJob>) -> Result<RunSummary, StoreError> {
        let started_at = Utc::now();
        let instances: HashSet<String> = jobs.iter().map(|j| j.instance_id.clone()).collect();
        let done = self.store.terminal_instances();

        let now = Instant::now();
        let entries: Vec<JobEntry> = jobs
            .into_iter()
            .filter(|job| {
                let resumed = done.contains(&job.instance_id);
                if resumed {
                    debug!(instance_id = %job.instance_id, "Already terminal, skipping");
                }
                !resumed
            })
            .map(|job| JobEntry {
                repo: RepoId::parse(&job.repository),
                weight: self.config.weight_for(&job.repository),
                job,
                last_worker: None,
                not_before: now,
                waiting_since: None,
            })
            .collect();

        info!(
            jobs = instances.len(),
            pending = entries.len(),
            resumed = instances.len().saturating_sub(entries.len()),
            "Starting validation run"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = RunState {
            queue: (0..entries.len()).collect(),
            remaining: entries.len(),
            entries,
            flights: HashMap::new(),
            next_token: 0,
            tx,
        };

        let result = self.drive(&mut state, &mut rx).await;
        state.abort_all();
        result?;

        let summary = self
            .store
            .summary(Some(&instances), started_at, Utc::now());
        info!(
            terminal = summary.terminal,
            attempts = summary.attempts,
            duration_secs = summary.duration_secs,
            "Validation run finished"
        );
        Ok(summary)
    }

    async fn drive(
        &self,
        state: &mut RunState,
        rx: &mut mpsc::UnboundedReceiver<Report>,
    ) -> Result<(), StoreError> {
        let mut events = self.monitor.subscribe();
        let mut health_open = true;
        let mut ticker = interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.dispatch_ready(state).await?;
            if state.remaining == 0 {
                return Ok(());
            }

            tokio::select! {
                Some(report) = rx.recv() => {
                    self.handle_report(state, report).await?;
                }
                event = events.recv(), if health_open => match event {
                    Ok(transition) => self.handle_transition(state, transition).await?,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Health events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => health_open = false,
                },
                _ = ticker.tick() => {}
            }
        }
    }

    /// Start every queued job that is due and has an eligible worker.
    async fn dispatch_ready(&self, state: &mut RunState) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut pending = std::mem::take(&mut state.queue);
        let mut still_queued = VecDeque::with_capacity(pending.len());

        while let Some(index) = pending.pop_front() {
            if state.flights.len() >= self.settings.max_concurrent
                || state.entries[index].not_before > now
            {
                still_queued.push_back(index);
                continue;
            }

            let entry = &mut state.entries[index];
            let snapshots = self
                .pool
                .snapshots(&entry.repo.key, &entry.repo.slug, self.settings.per_worker_ceiling)
                .await;
            match select_worker(&snapshots, entry.last_worker.as_ref()) {
                Some(worker_id) => {
                    self.dispatch(state, index, worker_id).await;
                }
                None => {
                    let since = *entry.waiting_since.get_or_insert(now);
                    if now.duration_since(since) >= self.settings.no_worker_grace {
                        warn!(instance_id = %entry.job.instance_id, "No schedulable worker");
                        let worker = entry
                            .last_worker
                            .clone()
                            .unwrap_or_else(|| WorkerId::new("unassigned"));
                        let failure = self.no_worker_failure();
                        self.finish_failed(state, index, worker, now, failure).await?;
                    } else {
                        still_queued.push_back(index);
                    }
                }
            }
        }

        // Anything requeued while dispatching waits for the next pass.
        still_queued.append(&mut state.queue);
        state.queue = still_queued;
        Ok(())
    }

    async fn dispatch(&self, state: &mut RunState, index: usize, worker_id: WorkerId) {
        let Some(worker) = self.pool.get(&worker_id).await else {
            state.queue.push_back(index);
            return;
        };
        let entry = &mut state.entries[index];
        entry.job.status = JobStatus::Dispatched;
        self.pool
            .acquire(&worker_id, &entry.repo.key, entry.weight)
            .await;

        let token = state.next_token;
        state.next_token += 1;
        info!(
            instance_id = %entry.job.instance_id,
            worker_id = %worker_id,
            attempt = entry.job.attempts + 1,
            "Dispatching job"
        );

        let guard = ReportGuard {
            token,
            tx: state.tx.clone(),
            sent: false,
        };
        let checker = self.checker.clone();
        let job = entry.job.clone();
        let config = worker.config.clone();
        let handle = tokio::spawn(async move {
            let outcome = checker.check(&config, &job).await;
            guard.send(outcome);
        });

        state.flights.insert(
            token,
            Flight {
                index,
                worker: worker_id,
                started: Instant::now(),
                abort: handle.abort_handle(),
            },
        );
    }

    async fn handle_report(&self, state: &mut RunState, report: Report) -> Result<(), StoreError> {
        // Flights cancelled by a health transition were already accounted.
        let Some(flight) = state.flights.remove(&report.token) else {
            return Ok(());
        };
        let index = flight.index;
        self.pool
            .release(&flight.worker, state.entries[index].weight)
            .await;

        let outcome = report.outcome.unwrap_or_else(|| CheckOutcome::Retryable {
            kind: VerdictKind::InfrastructureError,
            detail: "dispatch task ended without a result".into(),
            worker_fault: false,
            before: None,
        });

        match outcome {
            CheckOutcome::Verdict(verdict) => {
                self.finish_verdict(state, index, flight.worker, flight.started, verdict)
                    .await
            }
            CheckOutcome::Backpressure { detail } => {
                debug!(
                    instance_id = %state.entries[index].job.instance_id,
                    worker_id = %flight.worker,
                    %detail,
                    "Worker pushed back, redistributing"
                );
                self.pool
                    .mark_saturated(&flight.worker, self.settings.saturation_cooldown)
                    .await;
                let entry = &mut state.entries[index];
                // A bounce is not progress; the grace clock keeps running.
                let since = *entry.waiting_since.get_or_insert(flight.started);
                if since.elapsed() >= self.settings.no_worker_grace {
                    warn!(
                        instance_id = %entry.job.instance_id,
                        worker_id = %flight.worker,
                        "Workers kept pushing back"
                    );
                    let failure = self.no_worker_failure();
                    return self
                        .finish_failed(state, index, flight.worker, flight.started, failure)
                        .await;
                }
                entry.job.status = JobStatus::Pending;
                entry.last_worker = Some(flight.worker);
                entry.not_before = Instant::now();
                state.queue.push_back(index);
                Ok(())
            }
            CheckOutcome::Retryable {
                kind,
                detail,
                worker_fault,
                before,
            } => {
                if worker_fault {
                    self.monitor.record_failure(&flight.worker, &detail).await;
                }
                let failure = Failure {
                    kind,
                    detail,
                    before,
                    terminal: false,
                };
                self.finish_failed(state, index, flight.worker, flight.started, failure)
                    .await
            }
        }
    }

    /// Requeue the in-flight jobs of a worker that became unreachable.
    async fn handle_transition(
        &self,
        state: &mut RunState,
        transition: HealthTransition,
    ) -> Result<(), StoreError> {
        if transition.to != WorkerStatus::Unreachable {
            return Ok(());
        }

        let stranded: Vec<u64> = state
            .flights
            .iter()
            .filter(|(_, f)| f.worker == transition.worker_id)
            .map(|(token, _)| *token)
            .collect();
        for token in stranded {
            let Some(flight) = state.flights.remove(&token) else {
                continue;
            };
            flight.abort.abort();
            self.pool
                .release(&flight.worker, state.entries[flight.index].weight)
                .await;
            warn!(
                instance_id = %state.entries[flight.index].job.instance_id,
                worker_id = %flight.worker,
                "Worker unreachable, requeueing in-flight job"
            );
            let failure = Failure {
                kind: VerdictKind::InfrastructureError,
                detail: format!(
                    "{}: worker became unreachable ({})",
                    ErrorCode::WorkerUnreachable.code_string(),
                    transition.reason
                ),
                before: None,
                terminal: false,
            };
            self.finish_failed(state, flight.index, flight.worker, flight.started, failure)
                .await?;
        }
        Ok(())
    }

    async fn finish_verdict(
        &self,
        state: &mut RunState,
        index: usize,
        worker: WorkerId,
        started: Instant,
        verdict: ContractVerdict,
    ) -> Result<(), StoreError> {
        let entry = &mut state.entries[index];
        let record = ResultRecord {
            instance_id: entry.job.instance_id.clone(),
            repository: entry.job.repository.clone(),
            attempt_number: entry.job.attempts + 1,
            verdict: verdict.verdict,
            terminal: true,
            before_stats: verdict.before,
            after_stats: verdict.after,
            duration: started.elapsed().as_secs_f64(),
            worker_identity: worker,
            timestamp: Utc::now().to_rfc3339(),
            coarse_grained: verdict.coarse_grained,
            targets: verdict.targets,
            error: None,
        };
        info!(
            instance_id = %record.instance_id,
            verdict = %record.verdict,
            attempt = record.attempt_number,
            "Job finished"
        );
        self.store.append(record).await?;
        entry.job.attempts += 1;
        entry.job.status = JobStatus::Terminal;
        state.remaining -= 1;
        Ok(())
    }

    fn no_worker_failure(&self) -> Failure {
        Failure {
            kind: VerdictKind::InfrastructureError,
            detail: format!(
                "{}: no schedulable worker within {:?}",
                ErrorCode::WorkerNoneAvailable.code_string(),
                self.settings.no_worker_grace
            ),
            before: None,
            terminal: true,
        }
    }

    /// Record a consumed attempt; retry or give up.
    async fn finish_failed(
        &self,
        state: &mut RunState,
        index: usize,
        worker: WorkerId,
        started: Instant,
        failure: Failure,
    ) -> Result<(), StoreError> {
        let entry = &mut state.entries[index];
        entry.job.attempts += 1;
        let attempt = entry.job.attempts;
        let terminal = failure.terminal || attempt >= self.settings.max_attempts;

        let record = ResultRecord {
            instance_id: entry.job.instance_id.clone(),
            repository: entry.job.repository.clone(),
            attempt_number: attempt,
            verdict: failure.kind,
            terminal,
            before_stats: failure.before,
            after_stats: None,
            duration: started.elapsed().as_secs_f64(),
            worker_identity: worker.clone(),
            timestamp: Utc::now().to_rfc3339(),
            coarse_grained: false,
            targets: Vec::new(),
            error: Some(failure.detail),
        };
        self.store.append(record).await?;

        if terminal {
            warn!(
                instance_id = %entry.job.instance_id,
                verdict = %failure.kind,
                attempt,
                "Attempts exhausted"
            );
            entry.job.status = JobStatus::Terminal;
            state.remaining -= 1;
        } else {
            let delay = backoff_for(self.settings.retry_backoff, attempt);
            info!(
                instance_id = %entry.job.instance_id,
                worker_id = %worker,
                attempt,
                ?delay,
                "Retrying job"
            );
            entry.job.status = JobStatus::Retrying;
            entry.last_worker = Some(worker);
            entry.waiting_since = None;
            entry.not_before = Instant::now() + delay;
            state.queue.push_back(index);
        }
        Ok(())
    }
}
