//! Sandbox executor: one request in, exactly one result out.
//!
//! Each request gets a pristine sandbox at its base commit, has its targets
//! resolved against that checkout, applies its patch, runs the adapter's
//! command under the request timeout, and destroys the sandbox on every exit
//! path.
//!
//! Admission is bounded: `capacity` requests run, `queue_depth` more may
//! wait, and anything beyond that is turned away immediately with
//! [`ExecutionStatus::Backpressure`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvh_common::adapter::{
    AdapterOptions, AdapterTable, ExecutionAdapter, RepairTable, build_adapter, missing_module,
};
use pvh_common::config::PvhConfig;
use pvh_common::errors::{ErrorCode, RetryableError};
use pvh_common::patch::{clean_patch, looks_like_diff};
use pvh_common::protocol::{ExecuteRequest, ExecuteResponse, ReadyReport};
use pvh_common::resolver::{self, CoarsePolicy, ResolutionPlan, ResolveInput};
use pvh_common::types::{AdapterKind, DependencyRepair, ExecutionStatus, RepoId, TestResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{PrepareRequest, Sandbox, SandboxBackend, SandboxError};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub capacity: u32,
    pub queue_depth: u32,
    pub prepare_timeout: Duration,
    pub coarse_policy: CoarsePolicy,
    pub adapter_options: AdapterOptions,
    pub adapters: AdapterTable,
    pub repair: RepairTable,
    pub dependency_repair: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&PvhConfig::default())
    }
}

impl ExecutorSettings {
    pub fn from_config(config: &PvhConfig) -> Self {
        let exec = &config.executor;
        Self {
            capacity: exec.capacity.max(1),
            queue_depth: exec.queue_depth,
            prepare_timeout: Duration::from_secs(exec.prepare_timeout_secs.max(1)),
            coarse_policy: exec.coarse_policy,
            adapter_options: exec.adapter.clone(),
            adapters: AdapterTable::with_overrides(&config.adapters),
            repair: RepairTable::with_overrides(&config.repair),
            dependency_repair: exec.dependency_repair,
        }
    }
}

// ============================================================================
// Capacity gate
// ============================================================================

/// Two-stage admission: a bounded ticket to be here at all, then a slot to
/// actually run.
pub struct CapacityGate {
    admitted: Arc<Semaphore>,
    running: Arc<Semaphore>,
    capacity: u32,
    queue_depth: u32,
}

/// Held for the whole life of an admitted request.
pub struct Admission {
    _ticket: OwnedSemaphorePermit,
}

impl CapacityGate {
    pub fn new(capacity: u32, queue_depth: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            admitted: Arc::new(Semaphore::new((capacity + queue_depth) as usize)),
            running: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            queue_depth,
        }
    }

    /// Admit without waiting, or `None` when the executor is full.
    pub fn try_admit(&self) -> Option<Admission> {
        self.admitted
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|ticket| Admission { _ticket: ticket })
    }

    /// Wait for a run slot. Only called while holding an [`Admission`], so
    /// the wait is bounded by `queue_depth`.
    pub async fn run_slot(&self, _admission: &Admission) -> Option<OwnedSemaphorePermit> {
        self.running.clone().acquire_owned().await.ok()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn in_flight(&self) -> u32 {
        self.capacity
            .saturating_sub(self.running.available_permits() as u32)
    }

    pub fn queued(&self) -> u32 {
        let admitted = (self.capacity + self.queue_depth)
            .saturating_sub(self.admitted.available_permits() as u32);
        admitted.saturating_sub(self.in_flight())
    }

    pub fn has_room(&self) -> bool {
        self.admitted.available_permits() > 0
    }
}

// ============================================================================
// Sandbox guard
// ============================================================================

/// Destroys its sandbox when dropped, unless released explicitly first.
///
/// The explicit path awaits the destroy; the drop path (cancellation,
/// panic) spawns it on the runtime.
struct SandboxGuard<B: SandboxBackend> {
    backend: Arc<B>,
    sandbox: Option<Sandbox>,
}

impl<B: SandboxBackend> SandboxGuard<B> {
    fn new(backend: Arc<B>, sandbox: Sandbox) -> Self {
        Self {
            backend,
            sandbox: Some(sandbox),
        }
    }

    async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take()
            && let Err(e) = self.backend.destroy(&sandbox).await
        {
            warn!(sandbox = %sandbox.describe(), "Failed to destroy sandbox: {}", e);
        }
    }
}

impl<B: SandboxBackend> Drop for SandboxGuard<B> {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.destroy(&sandbox).await {
                        warn!(sandbox = %sandbox.describe(), "Failed to destroy sandbox: {}", e);
                    }
                });
            }
            Err(_) => warn!(sandbox = %sandbox.describe(), "No runtime to destroy sandbox"),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

enum RunFailure {
    PatchRejected(String),
    Sandbox(SandboxError),
}

impl From<SandboxError> for RunFailure {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::PatchRejected(msg) => Self::PatchRejected(msg),
            other => Self::Sandbox(other),
        }
    }
}

pub struct SandboxExecutor<B: SandboxBackend> {
    backend: Arc<B>,
    settings: ExecutorSettings,
    gate: CapacityGate,
}

impl<B: SandboxBackend> SandboxExecutor<B> {
    pub fn new(backend: B, settings: ExecutorSettings) -> Self {
        let gate = CapacityGate::new(settings.capacity, settings.queue_depth);
        Self {
            backend: Arc::new(backend),
            settings,
            gate,
        }
    }

    pub fn gate(&self) -> &CapacityGate {
        &self.gate
    }

    pub fn ready_report(&self) -> ReadyReport {
        ReadyReport {
            status: if self.gate.has_room() { "ready" } else { "not-ready" }.to_string(),
            backend: self.backend.kind().to_string(),
            capacity: self.gate.capacity(),
            in_flight: self.gate.in_flight(),
            queued: self.gate.queued(),
            queue_depth: self.gate.queue_depth(),
        }
    }

    /// Run one request. Never fails: every outcome is a response.
    pub async fn execute(&self, request: ExecuteRequest) -> ExecuteResponse {
        let Some(admission) = self.gate.try_admit() else {
            info!(instance_id = %request.instance_id, "Rejecting request: executor at capacity");
            return ExecuteResponse::failed(
                ExecutionStatus::Backpressure,
                ErrorCode::WorkerBackpressure,
                format!(
                    "executor at capacity ({} running, {} queued)",
                    self.gate.in_flight(),
                    self.gate.queued()
                ),
            );
        };
        let Some(_slot) = self.gate.run_slot(&admission).await else {
            return ExecuteResponse::failed(
                ExecutionStatus::InfrastructureError,
                ErrorCode::SandboxRuntimeFailed,
                "executor is shutting down",
            );
        };

        let started = Instant::now();
        let response = self.execute_admitted(&request).await;
        info!(
            instance_id = %request.instance_id,
            phase = ?request.phase,
            status = ?response.status,
            passed = response.result.passed,
            failed = response.result.failed,
            errors = response.result.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        response
    }

    async fn execute_admitted(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let patch = clean_patch(&request.patch);
        if !patch.is_empty() && !looks_like_diff(&patch) {
            return ExecuteResponse::failed(
                ExecutionStatus::PatchRejected,
                ErrorCode::SandboxPatchRejected,
                "patch is not a git diff",
            );
        }

        let repo = RepoId::parse(&request.repository);
        let prepare = PrepareRequest {
            instance_id: request.instance_id.clone(),
            repo: repo.clone(),
            base_commit: request.base_commit.clone(),
        };

        let sandbox = match tokio::time::timeout(
            self.settings.prepare_timeout,
            self.backend.prepare(&prepare),
        )
        .await
        {
            Ok(Ok(sandbox)) => sandbox,
            Ok(Err(e)) => {
                warn!(instance_id = %request.instance_id, "Sandbox preparation failed: {}", e);
                return ExecuteResponse::failed(
                    ExecutionStatus::InfrastructureError,
                    e.code(),
                    e.to_string(),
                );
            }
            Err(_) => {
                warn!(instance_id = %request.instance_id, "Sandbox preparation timed out");
                return ExecuteResponse::failed(
                    ExecutionStatus::InfrastructureError,
                    ErrorCode::SandboxRuntimeFailed,
                    format!(
                        "sandbox preparation exceeded {}s",
                        self.settings.prepare_timeout.as_secs()
                    ),
                );
            }
        };
        debug!(instance_id = %request.instance_id, sandbox = %sandbox.describe(), "Sandbox ready");

        let guard = SandboxGuard::new(self.backend.clone(), sandbox.clone());
        let response = self.run_in_sandbox(&sandbox, request, &repo, &patch).await;
        guard.release().await;
        response
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &Sandbox,
        request: &ExecuteRequest,
        repo: &RepoId,
        patch: &str,
    ) -> ExecuteResponse {
        let resolution = match self.resolve(sandbox, request).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(e)) => {
                return ExecuteResponse::failed(
                    ExecutionStatus::Unresolvable,
                    ErrorCode::ResolutionUnresolvable,
                    e.to_string(),
                );
            }
            Err(e) => {
                return ExecuteResponse::failed(
                    ExecutionStatus::InfrastructureError,
                    e.code(),
                    e.to_string(),
                );
            }
        };

        let kind = self.settings.adapters.kind_for(repo);
        let has_manage_py = kind == AdapterKind::Django
            && self
                .backend
                .file_exists(sandbox, "manage.py")
                .await
                .unwrap_or(false);
        let adapter = build_adapter(kind, &self.settings.adapter_options, has_manage_py);

        let mut selectors: Vec<String> = Vec::new();
        for target in &resolution.targets {
            let selector = adapter.selector(target);
            if !selector.is_empty() && !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
        if selectors.is_empty() {
            return ExecuteResponse::failed(
                ExecutionStatus::Unresolvable,
                ErrorCode::ResolutionUnresolvable,
                format!("no target is addressable by the {kind:?} adapter"),
            );
        }

        let timeout = Duration::from_secs(request.timeout_secs.max(1));
        let run = self.patch_and_run(sandbox, patch, adapter.as_ref(), &selectors);
        match tokio::time::timeout(timeout, run).await {
            Err(_) => ExecuteResponse::failed(
                ExecutionStatus::Timeout,
                ErrorCode::SandboxTimeout,
                format!("execution exceeded {}s", timeout.as_secs()),
            ),
            Ok(Err(RunFailure::PatchRejected(detail))) => ExecuteResponse::failed(
                ExecutionStatus::PatchRejected,
                ErrorCode::SandboxPatchRejected,
                detail,
            ),
            Ok(Err(RunFailure::Sandbox(e))) => {
                let status = if matches!(e, SandboxError::Timeout(_)) {
                    ExecutionStatus::Timeout
                } else {
                    ExecutionStatus::InfrastructureError
                };
                ExecuteResponse::failed(status, e.code(), e.to_string())
            }
            Ok(Ok((result, repairs))) => {
                ExecuteResponse::completed(result, selectors, resolution.coarse_grained, repairs)
            }
        }
    }

    /// Resolve targets, listing directories in the pristine checkout when
    /// the plan asks for it. The outer error is infrastructure, the inner
    /// one is a definitive resolution failure.
    async fn resolve(
        &self,
        sandbox: &Sandbox,
        request: &ExecuteRequest,
    ) -> Result<Result<resolver::Resolution, resolver::ResolveError>, SandboxError> {
        let input = ResolveInput {
            test_patch: &request.targets.test_patch,
            explicit: request.targets.explicit.as_deref(),
        };
        let listing = match resolver::plan(&input, self.settings.coarse_policy) {
            Ok(ResolutionPlan::Resolved(resolution)) => return Ok(Ok(resolution)),
            Ok(ResolutionPlan::NeedsListing(listing)) => listing,
            Err(e) => return Ok(Err(e)),
        };

        let mut listings = BTreeMap::new();
        for dir in &listing.directories {
            let files = self.backend.list_files(sandbox, dir).await?;
            listings.insert(dir.clone(), files);
        }
        let resolution = resolver::complete(&listing, &listings);
        if let Ok(r) = &resolution {
            info!(
                instance_id = %request.instance_id,
                targets = r.targets.len(),
                "Widened data-only diff to neighbouring test files"
            );
        }
        Ok(resolution)
    }

    async fn patch_and_run(
        &self,
        sandbox: &Sandbox,
        patch: &str,
        adapter: &dyn ExecutionAdapter,
        selectors: &[String],
    ) -> Result<(TestResult, Vec<DependencyRepair>), RunFailure> {
        self.backend.apply_patch(sandbox, patch).await?;

        let invocation = adapter.build_command(selectors);
        let (mut result, success) = self.run_once(sandbox, adapter, &invocation).await?;
        let mut repairs = Vec::new();

        if !success
            && self.settings.dependency_repair
            && let Some(module) = missing_module(&result.raw_output)
            && !self.is_local_module(sandbox, &module).await
        {
            let package = self.settings.repair.package_for(&module);
            info!(sandbox = %sandbox.describe(), module, package, "Installing missing dependency");
            let install = self.backend.install_package(sandbox, &package).await?;
            let installed = install.success();
            repairs.push(DependencyRepair {
                module,
                package,
                installed,
            });
            if installed {
                // Exactly one re-run; a second failure stands as a test failure.
                let (rerun, _) = self.run_once(sandbox, adapter, &invocation).await?;
                result = rerun;
            } else {
                warn!(output = %install.output.trim(), "Dependency install failed");
            }
        }

        Ok((result, repairs))
    }

    async fn run_once(
        &self,
        sandbox: &Sandbox,
        adapter: &dyn ExecutionAdapter,
        invocation: &pvh_common::adapter::Invocation,
    ) -> Result<(TestResult, bool), SandboxError> {
        let started = Instant::now();
        let output = self.backend.run(sandbox, invocation).await?;
        let mut result = adapter.parse_output(&output.output);
        if result.duration <= 0.0 {
            result.duration = started.elapsed().as_secs_f64();
        }
        Ok((result, output.success()))
    }

    /// Whether a "missing" module is the project's own (a genuine import
    /// error) rather than a third-party dependency.
    async fn is_local_module(&self, sandbox: &Sandbox, module: &str) -> bool {
        for candidate in [format!("{module}/__init__.py"), format!("{module}.py")] {
            if self
                .backend
                .file_exists(sandbox, &candidate)
                .await
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }
}
