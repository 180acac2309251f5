//! Container backend: a fresh container per attempt from the instance's
//! image, driven through the `docker` CLI.

use pvh_common::adapter::Invocation;
use pvh_common::config::{BackendKind, ExecutorConfig};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    CommandOutput, PrepareRequest, Sandbox, SandboxBackend, SandboxError, SandboxLocation,
    capture, is_safe_relative, resolve_argv,
};

/// Exit codes `docker` uses for its own failures rather than the command's.
const DOCKER_OWN_FAILURES: &[i32] = &[125, 126, 127];

pub struct ContainerBackend {
    config: ExecutorConfig,
}

impl ContainerBackend {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    async fn docker(&self, args: &[String], stdin: Option<&str>) -> Result<CommandOutput, SandboxError> {
        let mut cmd = Command::new(&self.config.docker);
        cmd.args(args);
        capture(cmd, &self.config.docker, stdin).await
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        let inspect = self
            .docker(&strings(&["image", "inspect", "--format", "{{.Id}}", image]), None)
            .await?;
        if inspect.success() {
            return Ok(());
        }

        info!(image, "Pulling image");
        let pull = self.docker(&strings(&["pull", "--quiet", image]), None).await?;
        if pull.success() {
            Ok(())
        } else {
            Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                detail: pull.output.trim().to_string(),
            })
        }
    }

    fn command_for(&self, argv: &[String]) -> Vec<String> {
        let mut full: Vec<String> = self.config.command_prefix.clone();
        full.extend(resolve_argv(argv, &self.config.python));
        full
    }

    fn container_path(&self, rel: &str) -> Result<String, SandboxError> {
        if !is_safe_relative(rel) {
            return Err(SandboxError::Runtime(format!(
                "path escapes the sandbox: {rel}"
            )));
        }
        let base = self.config.container_workdir.trim_end_matches('/');
        let rel = rel.trim_matches('/');
        Ok(if rel.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{rel}")
        })
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

fn container_name(sandbox: &Sandbox) -> Result<&str, SandboxError> {
    match &sandbox.location {
        SandboxLocation::Container { name, .. } => Ok(name),
        SandboxLocation::Worktree { path, .. } => Err(SandboxError::Runtime(format!(
            "worktree {} passed to the container backend",
            path.display()
        ))),
    }
}

/// Whether a failed `docker exec` failed in docker rather than in the
/// command.
fn runtime_failure(out: &CommandOutput) -> bool {
    out.exit_code.is_none_or(|code| DOCKER_OWN_FAILURES.contains(&code))
        || out.output.contains("Error response from daemon")
}

impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn prepare(&self, request: &PrepareRequest) -> Result<Sandbox, SandboxError> {
        let image = self.config.image_for(&request.instance_id);
        self.ensure_image(&image).await?;

        let name = format!("pvh-{}", uuid::Uuid::new_v4().simple());
        let args = strings(&[
            "run",
            "-d",
            "--rm",
            "--name",
            &name,
            "--label",
            "pvh.sandbox=1",
            &image,
            "sleep",
            "infinity",
        ]);
        let out = self.docker(&args, None).await?;
        if !out.success() {
            return Err(SandboxError::Runtime(format!(
                "failed to start container from {image}: {}",
                out.output.trim()
            )));
        }
        debug!(container = %name, image = %image, "Container started");

        Ok(Sandbox {
            instance_id: request.instance_id.clone(),
            location: SandboxLocation::Container {
                name,
                workdir: self.config.container_workdir.clone(),
            },
        })
    }

    async fn apply_patch(&self, sandbox: &Sandbox, patch: &str) -> Result<(), SandboxError> {
        if patch.trim().is_empty() {
            return Ok(());
        }
        let name = container_name(sandbox)?;
        let args = strings(&[
            "exec",
            "-i",
            "-w",
            &self.config.container_workdir,
            name,
            "git",
            "apply",
            "--whitespace=nowarn",
            "-",
        ]);
        let out = self.docker(&args, Some(patch)).await?;
        if out.success() {
            Ok(())
        } else if runtime_failure(&out) {
            Err(SandboxError::Runtime(out.output.trim().to_string()))
        } else {
            Err(SandboxError::PatchRejected(out.output.trim().to_string()))
        }
    }

    async fn list_files(&self, sandbox: &Sandbox, dir: &str) -> Result<Vec<String>, SandboxError> {
        let name = container_name(sandbox)?;
        let target = self.container_path(dir)?;
        let args = strings(&[
            "exec", name, "find", &target, "-mindepth", "1", "-maxdepth", "1", "-type", "f",
            "-printf", "%f\\n",
        ]);
        let out = self.docker(&args, None).await?;
        if !out.success() {
            if runtime_failure(&out) {
                return Err(SandboxError::Runtime(out.output.trim().to_string()));
            }
            // Missing directory.
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = out
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn file_exists(&self, sandbox: &Sandbox, path: &str) -> Result<bool, SandboxError> {
        let name = container_name(sandbox)?;
        let target = self.container_path(path)?;
        let out = self
            .docker(&strings(&["exec", name, "test", "-e", &target]), None)
            .await?;
        match out.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(SandboxError::Runtime(out.output.trim().to_string())),
        }
    }

    async fn run(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
    ) -> Result<CommandOutput, SandboxError> {
        let name = container_name(sandbox)?;
        let cwd = self.container_path(invocation.cwd.as_deref().unwrap_or(""))?;

        let mut args = strings(&["exec", "-w", &cwd]);
        for (key, value) in &invocation.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if !invocation.pythonpath.is_empty() {
            let entries: Vec<String> = invocation
                .pythonpath
                .iter()
                .map(|rel| self.container_path(rel))
                .collect::<Result<_, _>>()?;
            args.push("-e".to_string());
            args.push(format!("PYTHONPATH={}", entries.join(":")));
        }
        args.push(name.to_string());
        args.extend(self.command_for(&invocation.argv));

        debug!(container = name, argv = ?invocation.argv, "Running test command");
        let out = self.docker(&args, None).await?;
        if out.output.contains("Error response from daemon") {
            return Err(SandboxError::Runtime(out.output.trim().to_string()));
        }
        Ok(out)
    }

    async fn install_package(
        &self,
        sandbox: &Sandbox,
        package: &str,
    ) -> Result<CommandOutput, SandboxError> {
        let name = container_name(sandbox)?;
        let mut args = strings(&["exec", name]);
        args.extend(self.command_for(&strings(&[
            pvh_common::adapter::PYTHON,
            "-m",
            "pip",
            "install",
            "--quiet",
            "--disable-pip-version-check",
            "--no-input",
            package,
        ])));
        self.docker(&args, None).await
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        let name = container_name(sandbox)?;
        let out = self.docker(&strings(&["rm", "-f", name]), None).await?;
        if out.success() || out.output.contains("No such container") {
            return Ok(());
        }
        warn!(container = name, output = %out.output.trim(), "Container removal failed");
        Err(SandboxError::Runtime(out.output.trim().to_string()))
    }
}
