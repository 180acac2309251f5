//! Sandbox backends.
//!
//! A backend owns the life of one [`Sandbox`]: create it pristine at a base
//! commit, apply a patch, run commands in it, and destroy it. The executor
//! drives every backend the same way; tests drive it with in-memory fakes.

pub mod container;
pub mod local;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use pvh_common::adapter::Invocation;
use pvh_common::config::BackendKind;
use pvh_common::errors::{ErrorCode, RetryableError};
use pvh_common::types::RepoId;
use thiserror::Error;

use crate::cache::CacheError;

pub use container::ContainerBackend;
pub use local::LocalBackend;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("patch did not apply: {0}")]
    PatchRejected(String),

    #[error("image {image} unavailable: {detail}")]
    ImageUnavailable { image: String, detail: String },

    #[error("container runtime failed: {0}")]
    Runtime(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl RetryableError for SandboxError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Cache(e) => e.is_retryable(),
            Self::PatchRejected(_) => false,
            _ => true,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::Cache(e) => e.code(),
            Self::PatchRejected(_) => ErrorCode::SandboxPatchRejected,
            Self::ImageUnavailable { .. } => ErrorCode::SandboxImageUnavailable,
            Self::Runtime(_) | Self::Io(_) => ErrorCode::SandboxRuntimeFailed,
            Self::Spawn { .. } => ErrorCode::SandboxSpawnFailed,
            Self::Timeout(_) => ErrorCode::SandboxTimeout,
        }
    }
}

/// What a sandbox is created from.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub instance_id: String,
    pub repo: RepoId,
    pub base_commit: String,
}

/// Where a sandbox lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxLocation {
    /// A worktree on the host, with a sibling directory for repaired
    /// dependencies.
    Worktree { path: PathBuf, deps: PathBuf },
    /// A running container and the checkout directory inside it.
    Container { name: String, workdir: String },
}

/// One execution attempt's working copy. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub instance_id: String,
    pub location: SandboxLocation,
}

impl Sandbox {
    pub fn describe(&self) -> String {
        match &self.location {
            SandboxLocation::Worktree { path, .. } => path.display().to_string(),
            SandboxLocation::Container { name, .. } => name.clone(),
        }
    }
}

/// Captured result of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    /// Standard output followed by standard error.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub(crate) fn from_process(output: std::process::Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        Self {
            exit_code: output.status.code(),
            output: text,
        }
    }
}

/// Isolated execution environment.
///
/// Futures are cancel-safe with respect to process lifetime: dropping a
/// `run` future kills the child. Cleanup of the sandbox itself is always
/// the caller's job through [`SandboxBackend::destroy`].
pub trait SandboxBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    fn prepare(
        &self,
        request: &PrepareRequest,
    ) -> impl Future<Output = Result<Sandbox, SandboxError>> + Send;

    /// Apply a unified diff to the pristine checkout. An empty patch is a
    /// no-op.
    fn apply_patch(
        &self,
        sandbox: &Sandbox,
        patch: &str,
    ) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// File names directly inside `dir` (relative to the checkout root).
    /// A missing directory lists as empty.
    fn list_files(
        &self,
        sandbox: &Sandbox,
        dir: &str,
    ) -> impl Future<Output = Result<Vec<String>, SandboxError>> + Send;

    fn file_exists(
        &self,
        sandbox: &Sandbox,
        path: &str,
    ) -> impl Future<Output = Result<bool, SandboxError>> + Send;

    fn run(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<CommandOutput, SandboxError>> + Send;

    /// Install a package where later runs in this sandbox will import it.
    fn install_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> impl Future<Output = Result<CommandOutput, SandboxError>> + Send;

    /// Release the sandbox. Destroying an already-destroyed sandbox
    /// succeeds.
    fn destroy(&self, sandbox: &Sandbox) -> impl Future<Output = Result<(), SandboxError>> + Send;
}

/// Backend chosen at startup from configuration.
pub enum AnyBackend {
    Local(LocalBackend),
    Container(ContainerBackend),
}

impl SandboxBackend for AnyBackend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Local(b) => b.kind(),
            Self::Container(b) => b.kind(),
        }
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<Sandbox, SandboxError> {
        match self {
            Self::Local(b) => b.prepare(request).await,
            Self::Container(b) => b.prepare(request).await,
        }
    }

    async fn apply_patch(&self, sandbox: &Sandbox, patch: &str) -> Result<(), SandboxError> {
        match self {
            Self::Local(b) => b.apply_patch(sandbox, patch).await,
            Self::Container(b) => b.apply_patch(sandbox, patch).await,
        }
    }

    async fn list_files(&self, sandbox: &Sandbox, dir: &str) -> Result<Vec<String>, SandboxError> {
        match self {
            Self::Local(b) => b.list_files(sandbox, dir).await,
            Self::Container(b) => b.list_files(sandbox, dir).await,
        }
    }

    async fn file_exists(&self, sandbox: &Sandbox, path: &str) -> Result<bool, SandboxError> {
        match self {
            Self::Local(b) => b.file_exists(sandbox, path).await,
            Self::Container(b) => b.file_exists(sandbox, path).await,
        }
    }

    async fn run(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
    ) -> Result<CommandOutput, SandboxError> {
        match self {
            Self::Local(b) => b.run(sandbox, invocation).await,
            Self::Container(b) => b.run(sandbox, invocation).await,
        }
    }

    async fn install_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> Result<CommandOutput, SandboxError> {
        match self {
            Self::Local(b) => b.install_package(sandbox, package).await,
            Self::Container(b) => b.install_package(sandbox, package).await,
        }
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        match self {
            Self::Local(b) => b.destroy(sandbox).await,
            Self::Container(b) => b.destroy(sandbox).await,
        }
    }
}

/// Run a process to completion, optionally feeding `stdin`, and capture its
/// output. The child is killed if the returned future is dropped.
pub(crate) async fn capture(
    mut cmd: tokio::process::Command,
    program: &str,
    stdin: Option<&str>,
) -> Result<CommandOutput, SandboxError> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput::from_process(output))
}

/// Substitute the configured interpreter for the adapters' placeholder.
pub(crate) fn resolve_argv(argv: &[String], python: &str) -> Vec<String> {
    argv.iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 && arg == pvh_common::adapter::PYTHON {
                python.to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Reject paths that would escape the checkout.
pub(crate) fn is_safe_relative(path: &str) -> bool {
    !path.starts_with('/') && !path.split('/').any(|part| part == "..")
}
