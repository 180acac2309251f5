//! Error Catalog for Patch Validation Helper
//!
//! Each error has a stable code (PVH-E001 through PVH-E599), a message and
//! remediation steps. Codes appear in durable result records and in HTTP
//! error bodies so failures can be grouped across a batch.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors           |
//! | E100-E199  | Repository  | Mirror and working-copy errors           |
//! | E200-E299  | Sandbox     | Patch application and execution errors   |
//! | E300-E399  | Resolution  | Test target and verdict derivation       |
//! | E400-E499  | Worker      | Scheduling, capacity and health          |
//! | E500-E599  | Internal    | Internal/unexpected errors               |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all PVH error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// No workers configured
    ConfigNoWorkers,
    /// Job file line could not be parsed
    ConfigInvalidJob,

    // =========================================================================
    // Repository Errors (E100-E199)
    // =========================================================================
    /// Remote could not be reached while cloning or fetching
    RepoFetchFailed,
    /// Local mirror is corrupt and was re-cloned
    RepoCacheCorruption,
    /// Disk full while writing the mirror or a working copy
    RepoResourceExhausted,
    /// Requested commit does not exist in the remote
    RepoCommitMissing,
    /// Working copy could not be created or removed
    RepoWorktreeFailed,

    // =========================================================================
    // Sandbox Errors (E200-E299)
    // =========================================================================
    /// Patch did not apply to the base commit
    SandboxPatchRejected,
    /// Execution exceeded its timeout
    SandboxTimeout,
    /// Container runtime failed
    SandboxRuntimeFailed,
    /// Container image could not be pulled
    SandboxImageUnavailable,
    /// Test command could not be spawned
    SandboxSpawnFailed,
    /// A missing dependency was installed and the run repeated
    SandboxDependencyMissing,

    // =========================================================================
    // Resolution Errors (E300-E399)
    // =========================================================================
    /// No test target could be derived from the job
    ResolutionUnresolvable,
    /// Per-test outcomes could not be mapped onto targets
    ResolutionContractAmbiguous,

    // =========================================================================
    // Worker Errors (E400-E499)
    // =========================================================================
    /// Executor is at capacity
    WorkerBackpressure,
    /// Executor did not answer
    WorkerUnreachable,
    /// No healthy worker remained for pending jobs
    WorkerNoneAvailable,
    /// Executor returned an unexpected response
    WorkerProtocolError,
    /// Attempt limit reached
    WorkerRetriesExhausted,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Result store could not be written
    InternalResultStore,
    /// Logging system error
    InternalLoggingError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigNoWorkers => 6,
            Self::ConfigInvalidJob => 7,

            Self::RepoFetchFailed => 100,
            Self::RepoCacheCorruption => 101,
            Self::RepoResourceExhausted => 102,
            Self::RepoCommitMissing => 103,
            Self::RepoWorktreeFailed => 104,

            Self::SandboxPatchRejected => 200,
            Self::SandboxTimeout => 201,
            Self::SandboxRuntimeFailed => 202,
            Self::SandboxImageUnavailable => 203,
            Self::SandboxSpawnFailed => 204,
            Self::SandboxDependencyMissing => 205,

            Self::ResolutionUnresolvable => 300,
            Self::ResolutionContractAmbiguous => 301,

            Self::WorkerBackpressure => 400,
            Self::WorkerUnreachable => 401,
            Self::WorkerNoneAvailable => 402,
            Self::WorkerProtocolError => 403,
            Self::WorkerRetriesExhausted => 404,

            Self::InternalResultStore => 500,
            Self::InternalLoggingError => 501,
        }
    }

    /// Returns the formatted code string (e.g. "PVH-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("PVH-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Repository,
            200..=299 => ErrorCategory::Sandbox,
            300..=399 => ErrorCategory::Resolution,
            400..=499 => ErrorCategory::Worker,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::ConfigNoWorkers => "No workers are configured",
            Self::ConfigInvalidJob => "Job file contains an invalid entry",

            Self::RepoFetchFailed => "Repository remote could not be reached",
            Self::RepoCacheCorruption => "Repository mirror is corrupt",
            Self::RepoResourceExhausted => "No space left for repository data",
            Self::RepoCommitMissing => "Base commit not found in repository",
            Self::RepoWorktreeFailed => "Working copy could not be created or removed",

            Self::SandboxPatchRejected => "Patch does not apply to the base commit",
            Self::SandboxTimeout => "Test execution exceeded its timeout",
            Self::SandboxRuntimeFailed => "Container runtime command failed",
            Self::SandboxImageUnavailable => "Container image could not be pulled",
            Self::SandboxSpawnFailed => "Test command could not be started",
            Self::SandboxDependencyMissing => "Test run failed on a missing module",

            Self::ResolutionUnresolvable => "No test targets could be derived",
            Self::ResolutionContractAmbiguous => {
                "Per-test outcomes could not be mapped; aggregate counts were used"
            }

            Self::WorkerBackpressure => "Executor is at capacity",
            Self::WorkerUnreachable => "Executor did not respond",
            Self::WorkerNoneAvailable => "No healthy worker is available",
            Self::WorkerProtocolError => "Executor returned an unexpected response",
            Self::WorkerRetriesExhausted => "Attempt limit reached",

            Self::InternalResultStore => "Result store could not be written",
            Self::InternalLoggingError => "Logging could not be initialised",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Pass --config with the path to pvh.toml",
                "Set PVH_CONFIG to a custom path",
                "Check ~/.config/pvh/pvh.toml",
            ],
            Self::ConfigReadError => &["Check file permissions on the configuration file"],
            Self::ConfigParseError => &["Validate the TOML syntax of the configuration file"],
            Self::ConfigValidationError => &["Review the reported field and its allowed range"],
            Self::ConfigEnvError => &["Unset or correct the reported PVH_* variable"],
            Self::ConfigNoWorkers => &[
                "Add [[workers]] entries to workers.toml",
                "Pass --workers-config with the fleet definition",
            ],
            Self::ConfigInvalidJob => &[
                "Each line must be a JSON object with instance_id, repository, base_commit, patch and test_patch",
            ],

            Self::RepoFetchFailed => &[
                "Check network access from the worker to the repository host",
                "The job is retried on another worker automatically",
            ],
            Self::RepoCacheCorruption => &["The mirror is removed and cloned again automatically"],
            Self::RepoResourceExhausted => &[
                "Free disk space under the executor cache directory",
                "Lower executor capacity to reduce concurrent working copies",
            ],
            Self::RepoCommitMissing => &["Verify base_commit exists in the repository"],
            Self::RepoWorktreeFailed => &[
                "Run 'git worktree prune' in the mirror",
                "Check permissions on the sandbox directory",
            ],

            Self::SandboxPatchRejected => &[
                "Regenerate the patch against the job's base commit",
                "Check the patch for truncated hunks or wrong paths",
            ],
            Self::SandboxTimeout => &["Raise timeout_secs for the job or narrow the target tests"],
            Self::SandboxRuntimeFailed => &["Check that the docker daemon is running on the worker"],
            Self::SandboxImageUnavailable => &["Check registry access and the image template"],
            Self::SandboxSpawnFailed => &["Check the configured python interpreter path"],
            Self::SandboxDependencyMissing => &[
                "Add the module to [repair.packages] if its package name differs",
            ],

            Self::ResolutionUnresolvable => &[
                "Supply target_tests explicitly for the job",
                "Enable coarse widening if the test diff only changes data files",
            ],
            Self::ResolutionContractAmbiguous => &["Use verbose runner output so per-test lines are reported"],

            Self::WorkerBackpressure => &["The job is redistributed automatically"],
            Self::WorkerUnreachable => &[
                "Check that pvh-wkr is running and reachable at the configured address",
            ],
            Self::WorkerNoneAvailable => &[
                "Start at least one executor and check /health on each worker",
            ],
            Self::WorkerProtocolError => &["Run matching pvhd and pvh-wkr versions"],
            Self::WorkerRetriesExhausted => &["Inspect the per-attempt records for the failure cause"],

            Self::InternalResultStore => &["Check disk space and permissions for the results file"],
            Self::InternalLoggingError => &["Check PVH_LOG_FILE and its directory permissions"],
        }
    }

    /// All error codes, for catalog listings and tests.
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigNoWorkers,
            Self::ConfigInvalidJob,
            Self::RepoFetchFailed,
            Self::RepoCacheCorruption,
            Self::RepoResourceExhausted,
            Self::RepoCommitMissing,
            Self::RepoWorktreeFailed,
            Self::SandboxPatchRejected,
            Self::SandboxTimeout,
            Self::SandboxRuntimeFailed,
            Self::SandboxImageUnavailable,
            Self::SandboxSpawnFailed,
            Self::SandboxDependencyMissing,
            Self::ResolutionUnresolvable,
            Self::ResolutionContractAmbiguous,
            Self::WorkerBackpressure,
            Self::WorkerUnreachable,
            Self::WorkerNoneAvailable,
            Self::WorkerProtocolError,
            Self::WorkerRetriesExhausted,
            Self::InternalResultStore,
            Self::InternalLoggingError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and setup errors (E001-E099)
    Config,
    /// Mirror and working-copy errors (E100-E199)
    Repository,
    /// Patch application and execution errors (E200-E299)
    Sandbox,
    /// Test target and verdict derivation errors (E300-E399)
    Resolution,
    /// Scheduling, capacity and health errors (E400-E499)
    Worker,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Repository => "Repository",
            Self::Sandbox => "Sandbox",
            Self::Resolution => "Resolution",
            Self::Worker => "Worker",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "PVH-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);
        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }
        output
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
