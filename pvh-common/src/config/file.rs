//! TOML configuration files.
//!
//! Two files are read:
//! - `pvh.toml`: `[orchestrator]`, `[executor]`, `[adapters]`, `[repair]`
//!   and `[complexity]` tables, all optional.
//! - `workers.toml`: the worker fleet as `[[workers]]` entries.
//!
//! Each is looked up at an explicit path first, then at the path named by an
//! environment variable, then under the user config directory.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::env::{EnvError, EnvOverrides, expand_home};
use crate::adapter::AdapterOptions;
use crate::errors::{ErrorCode, RetryableError};
use crate::resolver::CoarsePolicy;
use crate::types::{AdapterKind, WorkerConfig};

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid environment: {}", format_env_errors(.0))]
    Environment(Vec<EnvError>),

    #[error("no enabled workers configured in {}", .0.display())]
    NoWorkers(PathBuf),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RetryableError for ConfigError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Invalid(_) => ErrorCode::ConfigValidationError,
            Self::Environment(_) => ErrorCode::ConfigEnvError,
            Self::NoWorkers(_) => ErrorCode::ConfigNoWorkers,
        }
    }
}

/// Directory holding `pvh.toml` and `workers.toml` by default.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pvh"))
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pvh")
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Worker health probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive probe failures before a worker is degraded.
    pub degraded_after: u32,
    /// Consecutive probe failures before a worker is unreachable.
    pub unreachable_after: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            probe_timeout_secs: 5,
            degraded_after: 2,
            unreachable_after: 4,
        }
    }
}

/// `[orchestrator]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per job before an infrastructure failure becomes terminal.
    pub max_attempts: u32,
    /// Jobs in flight across the whole fleet.
    pub max_concurrent: usize,
    /// Jobs in flight on a single worker, further capped by its capacity.
    pub per_worker_ceiling: u32,
    pub retry_backoff_ms: u64,
    /// How long a worker that answered with backpressure is skipped.
    pub saturation_cooldown_ms: u64,
    /// How long a job waits for any schedulable worker before failing.
    pub no_worker_grace_secs: u64,
    /// Timeout for jobs that do not carry one.
    pub default_timeout_secs: u64,
    /// Added to the job timeout for each HTTP call to cover sandbox
    /// preparation on the executor.
    pub request_overhead_secs: u64,
    pub health: HealthSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_concurrent: 32,
            per_worker_ceiling: 4,
            retry_backoff_ms: 2_000,
            saturation_cooldown_ms: 5_000,
            no_worker_grace_secs: 300,
            default_timeout_secs: 1_800,
            request_overhead_secs: 900,
            health: HealthSettings::default(),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Which sandbox implementation an executor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Git worktrees on the host.
    #[default]
    Local,
    /// One container per attempt from a per-instance image.
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Container => f.write_str("container"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "container" | "docker" => Ok(Self::Container),
            other => Err(format!("unknown backend '{other}' (expected local or container)")),
        }
    }
}

/// `[executor]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub backend: BackendKind,
    pub listen: String,
    /// Root for mirrors and working copies.
    pub cache_dir: PathBuf,
    /// Concurrent executions.
    pub capacity: u32,
    /// Requests allowed to wait for a slot before backpressure.
    pub queue_depth: u32,
    /// Minimum age of a mirror before it is fetched again.
    pub refresh_interval_secs: u64,
    /// Bound on mirror and sandbox preparation, separate from the job timeout.
    pub prepare_timeout_secs: u64,
    /// Interpreter substituted for the adapters' `python`.
    pub python: String,
    /// Prepended to every command run in a container, e.g.
    /// `["conda", "run", "-n", "testbed"]`.
    pub command_prefix: Vec<String>,
    /// Image name with an `{instance_id}` placeholder.
    pub image_template: String,
    /// Instance id to pinned image digest.
    pub image_digests: BTreeMap<String, String>,
    /// Checkout location inside container images.
    pub container_workdir: String,
    pub docker: String,
    pub coarse_policy: CoarsePolicy,
    pub adapter: AdapterOptions,
    pub dependency_repair: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            listen: "0.0.0.0:7600".to_string(),
            cache_dir: default_cache_dir(),
            capacity: 4,
            queue_depth: 8,
            refresh_interval_secs: 300,
            prepare_timeout_secs: 900,
            python: "python".to_string(),
            command_prefix: Vec::new(),
            image_template: "ghcr.io/epoch-research/swe-bench.eval.x86_64.{instance_id}:latest"
                .to_string(),
            image_digests: BTreeMap::new(),
            container_workdir: "/testbed".to_string(),
            docker: "docker".to_string(),
            coarse_policy: CoarsePolicy::default(),
            adapter: AdapterOptions::default(),
            dependency_repair: true,
        }
    }
}

impl ExecutorConfig {
    /// Image reference for an instance, pinned by digest when one is known.
    pub fn image_for(&self, instance_id: &str) -> String {
        let image = self.image_template.replace("{instance_id}", &instance_id.to_lowercase());
        match self.image_digests.get(instance_id) {
            Some(digest) => {
                let name = image.rsplit_once(':').map_or(image.as_str(), |(n, tag)| {
                    if tag.contains('/') { image.as_str() } else { n }
                });
                format!("{name}@{digest}")
            }
            None => image,
        }
    }
}

// ============================================================================
// pvh.toml
// ============================================================================

/// Contents of `pvh.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvhConfig {
    pub orchestrator: OrchestratorConfig,
    pub executor: ExecutorConfig,
    /// Repository to adapter kind, merged over the built-in table.
    pub adapters: BTreeMap<String, AdapterKind>,
    /// Module name to package name, merged over the built-in repair table.
    pub repair: BTreeMap<String, String>,
    /// Repository to relative load weight used when balancing workers.
    pub complexity: BTreeMap<String, f64>,
}

impl Default for PvhConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            executor: ExecutorConfig::default(),
            adapters: BTreeMap::new(),
            repair: BTreeMap::new(),
            complexity: default_complexity(),
        }
    }
}

fn default_complexity() -> BTreeMap<String, f64> {
    [
        ("django/django", 3.0),
        ("sympy/sympy", 2.5),
        ("scikit-learn/scikit-learn", 2.5),
        ("matplotlib/matplotlib", 2.0),
        ("astropy/astropy", 2.0),
    ]
    .into_iter()
    .map(|(repo, weight)| (repo.to_string(), weight))
    .collect()
}

impl PvhConfig {
    /// Load `pvh.toml`, falling back to defaults when no file exists.
    ///
    /// An explicit path that does not exist is an error; the implicit
    /// locations are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match locate(explicit, "PVH_CONFIG", "pvh.toml")? {
            Some(path) => path,
            None => {
                tracing::debug!("No pvh.toml found, using defaults");
                return Ok(Self::default());
            }
        };
        let mut config: Self = read_toml(&path)?;
        config.executor.cache_dir = expand_home(&config.executor.cache_dir.to_string_lossy());
        for (repo, weight) in default_complexity() {
            config.complexity.entry(repo).or_insert(weight);
        }
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply `PVH_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let mut env = EnvOverrides::new();
        let orch = &mut self.orchestrator;
        let exec = &mut self.executor;

        if let Some(v) = env.number("MAX_ATTEMPTS", 1..=10) {
            orch.max_attempts = v as u32;
        }
        if let Some(v) = env.number("MAX_CONCURRENT", 1..=4096) {
            orch.max_concurrent = v as usize;
        }
        if let Some(v) = env.number("WORKER_CEILING", 1..=1024) {
            orch.per_worker_ceiling = v as u32;
        }
        if let Some(v) = env.number("DEFAULT_TIMEOUT_SECS", 1..=86_400) {
            orch.default_timeout_secs = v;
        }

        if let Some(kind) =
            env.choice("BACKEND", "local or container", |v| v.parse::<BackendKind>().ok())
        {
            exec.backend = kind;
        }
        if let Some(v) = env.text("LISTEN") {
            exec.listen = v;
        }
        if let Some(v) = env.path("CACHE_DIR") {
            exec.cache_dir = v;
        }
        if let Some(v) = env.number("CAPACITY", 1..=1024) {
            exec.capacity = v as u32;
        }
        if let Some(v) = env.number("QUEUE_DEPTH", 0..=4096) {
            exec.queue_depth = v as u32;
        }
        if let Some(v) = env.text("PYTHON") {
            exec.python = v;
        }
        if let Some(v) = env.flag("DEPENDENCY_REPAIR") {
            exec.dependency_repair = v;
        }

        let applied = env.into_result().map_err(ConfigError::Environment)?;
        if !applied.is_empty() {
            tracing::debug!(?applied, "Environment overrides applied");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let orch = &self.orchestrator;
        if orch.max_attempts == 0 {
            return Err(ConfigError::Invalid("orchestrator.max_attempts must be at least 1".into()));
        }
        if orch.max_concurrent == 0 {
            return Err(ConfigError::Invalid("orchestrator.max_concurrent must be at least 1".into()));
        }
        if orch.per_worker_ceiling == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.per_worker_ceiling must be at least 1".into(),
            ));
        }
        if orch.health.unreachable_after < orch.health.degraded_after {
            return Err(ConfigError::Invalid(
                "orchestrator.health.unreachable_after must not be below degraded_after".into(),
            ));
        }
        if self.executor.capacity == 0 {
            return Err(ConfigError::Invalid("executor.capacity must be at least 1".into()));
        }
        if !self.executor.image_template.contains("{instance_id}") {
            return Err(ConfigError::Invalid(
                "executor.image_template must contain {instance_id}".into(),
            ));
        }
        if let Some((repo, w)) = self.complexity.iter().find(|(_, w)| !w.is_finite() || **w <= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "complexity weight for {repo} must be positive, got {w}"
            )));
        }
        Ok(())
    }

    /// Load weight for a repository; unknown repositories weigh 1.0.
    pub fn weight_for(&self, repository: &str) -> f64 {
        let slug = repository.trim().trim_end_matches(".git").to_ascii_lowercase();
        self.complexity
            .iter()
            .find(|(name, _)| slug == name.as_str() || slug.ends_with(&format!("/{name}")))
            .map_or(1.0, |(_, w)| *w)
    }
}

// ============================================================================
// workers.toml
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// Load the enabled workers from `workers.toml`.
pub fn load_workers(explicit: Option<&Path>) -> Result<Vec<WorkerConfig>, ConfigError> {
    let path = match locate(explicit, "PVH_WORKERS", "workers.toml")? {
        Some(path) => path,
        None => {
            let expected = config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("workers.toml");
            return Err(ConfigError::NotFound(expected));
        }
    };
    let file: WorkersFile = read_toml(&path)?;
    validate_workers(&file.workers)?;

    let enabled: Vec<WorkerConfig> = file.workers.into_iter().filter(|w| w.enabled).collect();
    if enabled.is_empty() {
        return Err(ConfigError::NoWorkers(path));
    }
    Ok(enabled)
}

fn validate_workers(workers: &[WorkerConfig]) -> Result<(), ConfigError> {
    let mut seen = std::collections::BTreeSet::new();
    for worker in workers {
        if worker.id.as_str().is_empty() {
            return Err(ConfigError::Invalid("worker with empty id".into()));
        }
        if !seen.insert(worker.id.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate worker id {}", worker.id)));
        }
        if !(worker.address.starts_with("http://") || worker.address.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "worker {} address must be an http(s) URL, got '{}'",
                worker.id, worker.address
            )));
        }
        if worker.capacity == 0 {
            return Err(ConfigError::Invalid(format!(
                "worker {} capacity must be at least 1",
                worker.id
            )));
        }
    }
    Ok(())
}

fn locate(explicit: Option<&Path>, var: &str, file_name: &str) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        return if path.exists() {
            Ok(Some(path.to_path_buf()))
        } else {
            Err(ConfigError::NotFound(path.to_path_buf()))
        };
    }
    if let Ok(value) = env::var(var)
        && !value.is_empty()
    {
        let path = expand_home(&value);
        return if path.exists() {
            Ok(Some(path))
        } else {
            Err(ConfigError::NotFound(path))
        };
    }
    Ok(config_dir()
        .map(|dir| dir.join(file_name))
        .filter(|p| p.exists()))
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use serial_test::serial;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PvhConfig::default();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.max_attempts, 2);
        assert_eq!(config.executor.backend, BackendKind::Local);
        assert_eq!(config.weight_for("django/django"), 3.0);
        assert_eq!(config.weight_for("psf/requests"), 1.0);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "pvh.toml",
            r#"
[orchestrator]
max_attempts = 3

[orchestrator.health]
degraded_after = 1

[executor]
backend = "container"
command_prefix = ["conda", "run", "-n", "testbed"]
coarse_policy = "disabled"

[adapters]
"acme/webapp" = "django"

[repair]
lxml = "lxml"

[complexity]
"acme/webapp" = 4.0
"#,
        );

        let config = PvhConfig::load(Some(&path)).unwrap();
        assert_eq!(config.orchestrator.max_attempts, 3);
        assert_eq!(config.orchestrator.max_concurrent, 32);
        assert_eq!(config.orchestrator.health.degraded_after, 1);
        assert_eq!(config.orchestrator.health.unreachable_after, 4);
        assert_eq!(config.executor.backend, BackendKind::Container);
        assert_eq!(config.executor.coarse_policy, CoarsePolicy::Disabled);
        assert_eq!(config.executor.command_prefix.len(), 4);
        assert_eq!(config.adapters["acme/webapp"], AdapterKind::Django);
        assert_eq!(config.weight_for("acme/webapp"), 4.0);
        // Built-in weights survive a partial table.
        assert_eq!(config.weight_for("django/django"), 3.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let err = PvhConfig::load(Some(Path::new("/nonexistent/pvh.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        assert_eq!(err.code(), ErrorCode::ConfigNotFound);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "pvh.toml", "[orchestrator\nmax_attempts = ");
        let err = PvhConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("pvh.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PvhConfig::default();
        config.orchestrator.health.unreachable_after = 1;
        assert!(config.validate().is_err());

        let mut config = PvhConfig::default();
        config.executor.image_template = "static:latest".into();
        assert!(config.validate().is_err());

        let mut config = PvhConfig::default();
        config.complexity.insert("a/b".into(), 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_for_pins_digest() {
        let mut exec = ExecutorConfig::default();
        assert_eq!(
            exec.image_for("Django__django-11099"),
            "ghcr.io/epoch-research/swe-bench.eval.x86_64.django__django-11099:latest"
        );
        exec.image_digests
            .insert("django__django-11099".into(), "sha256:abc".into());
        assert_eq!(
            exec.image_for("django__django-11099"),
            "ghcr.io/epoch-research/swe-bench.eval.x86_64.django__django-11099@sha256:abc"
        );
    }

    #[test]
    fn test_load_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "workers.toml",
            r#"
[[workers]]
id = "wkr-1"
address = "http://10.0.0.5:7600"
capacity = 8
affinity = ["django/django"]

[[workers]]
id = "wkr-2"
address = "http://10.0.0.6:7600"

[[workers]]
id = "wkr-3"
address = "http://10.0.0.7:7600"
enabled = false
"#,
        );
        let workers = load_workers(Some(&path)).unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].capacity, 8);
        assert_eq!(workers[1].capacity, 4);
        assert_eq!(workers[0].affinity, vec!["django/django"]);
    }

    #[test]
    fn test_load_workers_rejects_duplicates_and_all_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let dup = write_file(
            dir.path(),
            "dup.toml",
            "[[workers]]\nid = \"a\"\naddress = \"http://x\"\n[[workers]]\nid = \"a\"\naddress = \"http://y\"\n",
        );
        assert!(matches!(
            load_workers(Some(&dup)).unwrap_err(),
            ConfigError::Invalid(_)
        ));

        let disabled = write_file(
            dir.path(),
            "disabled.toml",
            "[[workers]]\nid = \"a\"\naddress = \"http://x\"\nenabled = false\n",
        );
        assert!(matches!(
            load_workers(Some(&disabled)).unwrap_err(),
            ConfigError::NoWorkers(_)
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let _guard = env_test_lock();
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe {
            env::set_var("PVH_MAX_ATTEMPTS", "4");
            env::set_var("PVH_BACKEND", "container");
            env::set_var("PVH_CAPACITY", "12");
        }

        let mut config = PvhConfig::default();
        let result = config.apply_env_overrides();

        // SAFETY: env mutation is serialized by env_test_lock
        unsafe {
            env::remove_var("PVH_MAX_ATTEMPTS");
            env::remove_var("PVH_BACKEND");
            env::remove_var("PVH_CAPACITY");
        }

        result.unwrap();
        assert_eq!(config.orchestrator.max_attempts, 4);
        assert_eq!(config.executor.backend, BackendKind::Container);
        assert_eq!(config.executor.capacity, 12);
        assert_eq!(config.executor.queue_depth, 8);
    }

    #[test]
    #[serial]
    fn test_env_override_errors_are_collected() {
        let _guard = env_test_lock();
        // SAFETY: env mutation is serialized by env_test_lock
        unsafe {
            env::set_var("PVH_MAX_ATTEMPTS", "zero");
            env::set_var("PVH_CAPACITY", "0");
        }

        let mut config = PvhConfig::default();
        let result = config.apply_env_overrides();

        // SAFETY: env mutation is serialized by env_test_lock
        unsafe {
            env::remove_var("PVH_MAX_ATTEMPTS");
            env::remove_var("PVH_CAPACITY");
        }

        match result.unwrap_err() {
            ConfigError::Environment(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
