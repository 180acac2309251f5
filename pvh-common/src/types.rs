//! Common types used across PVH components.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a worker as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker answers probes and accepts new jobs.
    #[default]
    Healthy,
    /// Worker failed recent probes; no new jobs are scheduled to it.
    Degraded,
    /// Worker stopped answering; its in-flight jobs are requeued.
    Unreachable,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Static description of a sandbox executor in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: WorkerId,
    /// Base URL of the executor service, e.g. `http://10.0.0.5:7600`.
    pub address: String,
    /// Declared number of concurrent executions.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Repositories this worker is known to have warm caches for.
    #[serde(default)]
    pub affinity: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_capacity() -> u32 {
    4
}

fn default_enabled() -> bool {
    true
}

/// Repository identity.
///
/// Accepts `owner/name`, a clone URL, or a local path. The `key` is a
/// filesystem-safe name used for mirror directories and locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// Identity as submitted (`django/django`, URL, or path).
    pub slug: String,
    /// Location passed to `git clone`.
    pub url: String,
    /// Filesystem-safe cache key.
    pub key: String,
}

impl RepoId {
    pub fn parse(raw: &str) -> Self {
        let slug = raw.trim().trim_end_matches('/').to_string();

        if slug.starts_with('/') || slug.starts_with("./") || slug.starts_with("file://") {
            let path = slug.trim_start_matches("file://");
            let name = path
                .rsplit('/')
                .find(|s| !s.is_empty())
                .unwrap_or("repo")
                .trim_end_matches(".git");
            let digest = blake3::hash(path.as_bytes()).to_hex();
            return Self {
                url: path.to_string(),
                key: format!("local__{}__{}", sanitize(name), &digest[..12]),
                slug,
            };
        }

        if slug.contains("://") || slug.starts_with("git@") {
            let trimmed = slug.trim_end_matches(".git");
            let mut parts = trimmed.rsplit(['/', ':']).filter(|s| !s.is_empty());
            let name = parts.next().unwrap_or("repo");
            let owner = parts.next().unwrap_or("remote");
            return Self {
                url: slug.clone(),
                key: format!("{}__{}", sanitize(owner), sanitize(name)),
                slug,
            };
        }

        let (owner, name) = slug.split_once('/').unwrap_or(("local", slug.as_str()));
        Self {
            url: format!("https://github.com/{owner}/{name}.git"),
            key: format!("{}__{}", sanitize(owner), sanitize(name)),
            slug: slug.clone(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.slug)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Test-framework family an execution adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    Pytest,
    Django,
}

/// A single test selection produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestTarget {
    /// Identifier supplied verbatim by the submitter.
    Explicit { id: String },
    /// A test file, optionally narrowed to a class and/or function.
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        class: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function: Option<String>,
    },
    /// A whole directory (coarse-grained widening).
    Directory { path: String },
}

impl TestTarget {
    pub fn file(path: impl Into<String>) -> Self {
        Self::File {
            path: path.into(),
            class: None,
            function: None,
        }
    }

    pub fn narrowed(path: impl Into<String>, class: Option<String>, function: Option<String>) -> Self {
        Self::File {
            path: path.into(),
            class,
            function,
        }
    }
}

/// Outcome of one test as reported by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

/// Structured result of one test execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    #[serde(default)]
    pub skipped: u32,
    pub collected: u32,
    /// Wall-clock seconds for the test command.
    pub duration: f64,
    #[serde(default)]
    pub raw_output: String,
    /// Per-test outcomes keyed by the framework's test identifier.
    #[serde(default)]
    pub per_test: BTreeMap<String, TestOutcome>,
}

impl TestResult {
    /// Number of tests that actually ran to an outcome.
    pub fn executed(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.errors)
    }

    /// Aggregate success: something passed and nothing failed or errored.
    pub fn aggregate_passes(&self) -> bool {
        self.passed > 0 && self.failed == 0 && self.errors == 0
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errors > 0
    }

    /// The last `lines` lines of raw output.
    pub fn log_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.raw_output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// How a single sandbox execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Tests ran; counts are meaningful.
    Completed,
    /// The patch did not apply to the base commit.
    PatchRejected,
    /// No test targets could be derived.
    Unresolvable,
    /// The execution exceeded its timeout.
    Timeout,
    /// The executor is at capacity.
    Backpressure,
    /// Sandbox preparation or the runtime failed.
    InfrastructureError,
}

impl ExecutionStatus {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Backpressure | Self::InfrastructureError
        )
    }
}

/// A module installed by dependency auto-repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRepair {
    pub module: String,
    pub package: String,
    pub installed: bool,
}

/// Final verdict kind for a validation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// Targets fail before the fix and pass after it.
    ContractMet,
    /// A target already passes without the fix (or nothing failed).
    NotReproducible,
    /// A target still fails with the fix applied.
    FixIncomplete,
    /// No test target could be derived for the job.
    Unresolvable,
    /// Executions kept timing out until the attempt limit.
    Timeout,
    /// Infrastructure kept failing until the attempt limit.
    InfrastructureError,
    /// The candidate or test patch did not apply.
    PatchRejected,
}

impl VerdictKind {
    /// Verdicts that describe the patch rather than the infrastructure.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Self::Timeout | Self::InfrastructureError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContractMet => "contract_met",
            Self::NotReproducible => "not_reproducible",
            Self::FixIncomplete => "fix_incomplete",
            Self::Unresolvable => "unresolvable",
            Self::Timeout => "timeout",
            Self::InfrastructureError => "infrastructure_error",
            Self::PatchRejected => "patch_rejected",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the verdict was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictBasis {
    /// Per-test outcomes matched against every target.
    PerTest,
    /// The (passed, failed, errors) triple.
    Aggregate,
}

/// Condensed view of one run, stored in durable records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub status: ExecutionStatus,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub collected: u32,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_repairs: Vec<DependencyRepair>,
    /// Trailing lines of raw output.
    #[serde(default)]
    pub log_tail: String,
}

/// Lines of raw output kept in durable records.
pub const LOG_TAIL_LINES: usize = 50;

impl RunStats {
    pub fn from_result(
        status: ExecutionStatus,
        result: &TestResult,
        dependency_repairs: Vec<DependencyRepair>,
    ) -> Self {
        Self {
            status,
            passed: result.passed,
            failed: result.failed,
            errors: result.errors,
            skipped: result.skipped,
            collected: result.collected,
            duration: result.duration,
            dependency_repairs,
            log_tail: result.log_tail(LOG_TAIL_LINES),
        }
    }
}

/// Before/after outcome and derived verdict for one job attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractVerdict {
    pub verdict: VerdictKind,
    pub before: Option<RunStats>,
    pub after: Option<RunStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<VerdictBasis>,
    /// Test selectors both runs were scoped to.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub coarse_grained: bool,
}

impl ContractVerdict {
    /// A verdict reached without comparing two completed runs.
    pub fn bare(verdict: VerdictKind) -> Self {
        Self {
            verdict,
            before: None,
            after: None,
            basis: None,
            targets: Vec::new(),
            coarse_grained: false,
        }
    }
}

/// Lifecycle state of a validation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Dispatched,
    Retrying,
    Terminal,
}

/// A patch to validate against one defect instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationJob {
    pub instance_id: String,
    pub repository: String,
    pub base_commit: String,
    /// Candidate fix.
    pub patch: String,
    /// Diff that adds or changes the tests demonstrating the defect.
    pub test_patch: String,
    #[serde(default)]
    pub target_tests: Option<Vec<String>>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub status: JobStatus,
}

/// Durable, append-only record of one completed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub instance_id: String,
    pub repository: String,
    pub attempt_number: u32,
    pub verdict: VerdictKind,
    /// Whether this record ends the job.
    pub terminal: bool,
    pub before_stats: Option<RunStats>,
    pub after_stats: Option<RunStats>,
    /// Seconds spent on the attempt.
    pub duration: f64,
    pub worker_identity: WorkerId,
    pub timestamp: String,
    #[serde(default)]
    pub coarse_grained: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_from_slug() {
        let repo = RepoId::parse("django/django");
        assert_eq!(repo.url, "https://github.com/django/django.git");
        assert_eq!(repo.key, "django__django");
        assert_eq!(repo.to_string(), "django/django");
    }

    #[test]
    fn repo_id_from_url() {
        let repo = RepoId::parse("https://github.com/sympy/sympy.git");
        assert_eq!(repo.url, "https://github.com/sympy/sympy.git");
        assert_eq!(repo.key, "sympy__sympy");

        let ssh = RepoId::parse("git@github.com:psf/requests.git");
        assert_eq!(ssh.key, "psf__requests");
    }

    #[test]
    fn repo_id_from_local_path_is_stable_and_distinct() {
        let a = RepoId::parse("/srv/repos/project");
        let b = RepoId::parse("/other/project");
        assert_eq!(a.url, "/srv/repos/project");
        assert!(a.key.starts_with("local__project__"));
        assert_ne!(a.key, b.key);
        assert_eq!(a, RepoId::parse("/srv/repos/project/"));
    }

    #[test]
    fn aggregate_triple() {
        let mut r = TestResult {
            passed: 3,
            ..Default::default()
        };
        assert!(r.aggregate_passes());
        r.errors = 1;
        assert!(!r.aggregate_passes());
        assert!(r.has_failures());

        let empty = TestResult::default();
        assert!(!empty.aggregate_passes());
        assert!(!empty.has_failures());
        assert_eq!(empty.executed(), 0);
    }

    #[test]
    fn log_tail_keeps_last_lines() {
        let r = TestResult {
            raw_output: (1..=10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n"),
            ..Default::default()
        };
        assert_eq!(r.log_tail(3), "8\n9\n10");
        assert_eq!(r.log_tail(100).lines().count(), 10);
    }

    #[test]
    fn verdict_kind_serializes_snake_case() {
        let json = serde_json::to_string(&VerdictKind::ContractMet).unwrap();
        assert_eq!(json, "\"contract_met\"");
        assert!(VerdictKind::FixIncomplete.is_definitive());
        assert!(!VerdictKind::Timeout.is_definitive());
    }

    #[test]
    fn test_target_tagged_serialization() {
        let t = TestTarget::narrowed("tests/test_a.py", None, Some("test_x".into()));
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"], "file");
        assert_eq!(json["function"], "test_x");
        assert!(json.get("class").is_none());
    }

    #[test]
    fn worker_config_defaults() {
        let cfg: WorkerConfig =
            toml::from_str("id = \"w1\"\naddress = \"http://localhost:7600\"").unwrap();
        assert_eq!(cfg.capacity, 4);
        assert!(cfg.enabled);
        assert!(cfg.affinity.is_empty());
    }
}
