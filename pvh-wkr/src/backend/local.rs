//! Host backend: git worktrees from the repository cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pvh_common::adapter::Invocation;
use pvh_common::config::BackendKind;
use tokio::process::Command;
use tracing::debug;

use super::{
    CommandOutput, PrepareRequest, Sandbox, SandboxBackend, SandboxError, SandboxLocation,
    capture, is_safe_relative, resolve_argv,
};
use crate::cache::{RepositoryCache, deps_dir};

pub struct LocalBackend {
    cache: Arc<RepositoryCache>,
    python: String,
}

impl LocalBackend {
    pub fn new(cache: Arc<RepositoryCache>, python: impl Into<String>) -> Self {
        Self {
            cache,
            python: python.into(),
        }
    }

    pub fn cache(&self) -> &Arc<RepositoryCache> {
        &self.cache
    }
}

fn worktree(sandbox: &Sandbox) -> Result<(&Path, &Path), SandboxError> {
    match &sandbox.location {
        SandboxLocation::Worktree { path, deps } => Ok((path, deps)),
        SandboxLocation::Container { name, .. } => Err(SandboxError::Runtime(format!(
            "container sandbox {name} passed to the local backend"
        ))),
    }
}

fn join_relative(root: &Path, rel: &str) -> Result<PathBuf, SandboxError> {
    if !is_safe_relative(rel) {
        return Err(SandboxError::Runtime(format!(
            "path escapes the sandbox: {rel}"
        )));
    }
    let rel = rel.trim_matches('/');
    Ok(if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    })
}

impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<Sandbox, SandboxError> {
        let path = self
            .cache
            .create_sandbox(&request.repo, &request.base_commit)
            .await?;
        Ok(Sandbox {
            instance_id: request.instance_id.clone(),
            location: SandboxLocation::Worktree {
                deps: deps_dir(&path),
                path,
            },
        })
    }

    async fn apply_patch(&self, sandbox: &Sandbox, patch: &str) -> Result<(), SandboxError> {
        if patch.trim().is_empty() {
            return Ok(());
        }
        let (path, _) = worktree(sandbox)?;
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(path)
            .args(["apply", "--whitespace=nowarn", "-"]);
        let out = capture(cmd, "git", Some(patch)).await?;
        if out.success() {
            Ok(())
        } else {
            Err(SandboxError::PatchRejected(out.output.trim().to_string()))
        }
    }

    async fn list_files(&self, sandbox: &Sandbox, dir: &str) -> Result<Vec<String>, SandboxError> {
        let (path, _) = worktree(sandbox)?;
        let target = join_relative(path, dir)?;
        let mut entries = match tokio::fs::read_dir(&target).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn file_exists(&self, sandbox: &Sandbox, rel: &str) -> Result<bool, SandboxError> {
        let (path, _) = worktree(sandbox)?;
        Ok(tokio::fs::try_exists(join_relative(path, rel)?).await?)
    }

    async fn run(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
    ) -> Result<CommandOutput, SandboxError> {
        let (path, deps) = worktree(sandbox)?;
        let argv = resolve_argv(&invocation.argv, &self.python);
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::Runtime("empty command".into()));
        };

        let cwd = match &invocation.cwd {
            Some(rel) => join_relative(path, rel)?,
            None => path.to_path_buf(),
        };

        let mut pythonpath: Vec<PathBuf> = invocation
            .pythonpath
            .iter()
            .map(|rel| join_relative(path, rel))
            .collect::<Result<_, _>>()?;
        if deps.exists() {
            pythonpath.push(deps.to_path_buf());
        }
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            pythonpath.extend(std::env::split_paths(&existing));
        }

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&cwd).envs(invocation.env.iter().map(|(k, v)| (k, v)));
        if !pythonpath.is_empty() {
            let joined = std::env::join_paths(&pythonpath)
                .map_err(|e| SandboxError::Runtime(e.to_string()))?;
            cmd.env("PYTHONPATH", joined);
        }

        debug!(sandbox = %sandbox.describe(), argv = ?argv, "Running test command");
        capture(cmd, program, None).await
    }

    async fn install_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> Result<CommandOutput, SandboxError> {
        let (_, deps) = worktree(sandbox)?;
        tokio::fs::create_dir_all(deps).await?;
        let mut cmd = Command::new(&self.python);
        cmd.args([
            "-m",
            "pip",
            "install",
            "--quiet",
            "--disable-pip-version-check",
            "--no-input",
            "--target",
        ])
        .arg(deps)
        .arg(package);
        capture(cmd, &self.python, None).await
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        let (path, _) = worktree(sandbox)?;
        self.cache.destroy_sandbox(path).await?;
        Ok(())
    }
}
