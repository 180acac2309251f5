//! Patch Validation Helper - Sandbox Executor
//!
//! Runs one validation request at a time per slot: a pristine checkout at
//! the base commit, a patch applied to it, and the resolved tests run under
//! a deadline. Exposed over HTTP to the orchestrator.

pub mod backend;
pub mod cache;
pub mod executor;
pub mod server;
pub mod warm;

pub use backend::{AnyBackend, ContainerBackend, LocalBackend, SandboxBackend, SandboxError};
pub use cache::{CacheError, RepositoryCache};
pub use executor::{CapacityGate, ExecutorSettings, SandboxExecutor};
pub use server::{HttpState, create_router, start_server};
