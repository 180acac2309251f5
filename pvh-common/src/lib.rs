//! Patch Validation Helper - Common Library
//!
//! Shared types, test target resolution, execution adapters and verdict
//! derivation used by the orchestrator (`pvhd`) and the sandbox executor
//! (`pvh-wkr`).

pub mod adapter;
pub mod config;
pub mod contract;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod patch;
pub mod protocol;
pub mod resolver;
pub mod types;

pub use adapter::{
    AdapterOptions, AdapterTable, ExecutionAdapter, Invocation, RepairTable, build_adapter,
};
pub use config::{
    BackendKind, ConfigError, ExecutorConfig, OrchestratorConfig, PvhConfig, load_workers,
};
pub use contract::{Evaluation, evaluate};
pub use errors::{ErrorCode, RetryableError};
pub use logging::{LogConfig, LogGuard, init_logging};
pub use protocol::{ExecuteRequest, ExecuteResponse, ReadyReport, RunPhase, TargetSpec};
pub use resolver::{CoarsePolicy, Resolution, ResolutionPlan, ResolveError, ResolveInput};
pub use types::{
    AdapterKind, ContractVerdict, DependencyRepair, ExecutionStatus, JobStatus, RepoId,
    ResultRecord, RunStats, TestOutcome, TestResult, TestTarget, ValidationJob, VerdictBasis,
    VerdictKind, WorkerConfig, WorkerId, WorkerStatus,
};
