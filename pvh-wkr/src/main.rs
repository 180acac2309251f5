//! Patch Validation Helper - Sandbox Executor
//!
//! Serves `POST /v1/execute` for the orchestrator, or runs a single request
//! from the command line.

#![forbid(unsafe_code)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pvh_common::config::{BackendKind, PvhConfig};
use pvh_common::jobs::load_jobs;
use pvh_common::protocol::ExecuteRequest;
use pvh_common::{LogConfig, init_logging};
use pvh_wkr::{
    AnyBackend, ContainerBackend, ExecutorSettings, HttpState, LocalBackend, RepositoryCache,
    SandboxExecutor, start_server, warm,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pvh-wkr")]
#[command(author, version, about = "PVH sandbox executor - isolated test runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $PVH_CONFIG, then ~/.config/pvh/pvh.toml)
    #[arg(short, long, global = true, env = "PVH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve execution requests over HTTP
    Serve {
        /// Listen address (overrides configuration)
        #[arg(short, long)]
        listen: Option<String>,

        /// Sandbox backend: local or container
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },

    /// Fetch every base commit a job file needs into the repository cache
    Warm {
        /// JSONL job file
        #[arg(short, long)]
        jobs: PathBuf,

        /// Repositories fetched concurrently
        #[arg(short, long, default_value = "4")]
        parallel: usize,
    },

    /// Run one request (JSON file, or stdin when omitted) and print the response
    Execute {
        /// Request file
        request: Option<PathBuf>,

        /// Sandbox backend: local or container
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let mut config = PvhConfig::load(cli.config.as_deref())?;
    config.apply_env_overrides()?;
    config.validate()?;

    match cli.command {
        Commands::Serve { listen, backend } => {
            if let Some(listen) = listen {
                config.executor.listen = listen;
            }
            if let Some(kind) = backend {
                config.executor.backend = kind;
            }
            serve(config).await
        }
        Commands::Warm { jobs, parallel } => {
            let jobs = load_jobs(&jobs, config.orchestrator.default_timeout_secs)?;
            let cache = Arc::new(open_cache(&config));
            let reports = warm::warm(cache, &jobs, parallel).await;

            let failed: usize = reports.iter().map(|r| r.failures.len()).sum();
            for report in reports.iter().filter(|r| !r.is_clean()) {
                for (commit, error) in &report.failures {
                    eprintln!("{} @ {}: {}", report.repository, commit, error);
                }
            }
            println!(
                "Warmed {} repositories ({} commit failures)",
                reports.len(),
                failed
            );
            if failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Execute { request, backend } => {
            if let Some(kind) = backend {
                config.executor.backend = kind;
            }
            let raw = match &request {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let request: ExecuteRequest =
                serde_json::from_str(&raw).context("request is not a valid execute request")?;

            let executor = build_executor(&config);
            let response = executor.execute(request).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}

fn open_cache(config: &PvhConfig) -> RepositoryCache {
    RepositoryCache::new(
        &config.executor.cache_dir,
        Duration::from_secs(config.executor.refresh_interval_secs),
    )
}

fn build_executor(config: &PvhConfig) -> SandboxExecutor<AnyBackend> {
    let backend = match config.executor.backend {
        BackendKind::Local => AnyBackend::Local(LocalBackend::new(
            Arc::new(open_cache(config)),
            config.executor.python.clone(),
        )),
        BackendKind::Container => {
            AnyBackend::Container(ContainerBackend::new(config.executor.clone()))
        }
    };
    SandboxExecutor::new(backend, ExecutorSettings::from_config(config))
}

async fn serve(config: PvhConfig) -> Result<()> {
    info!(
        backend = %config.executor.backend,
        capacity = config.executor.capacity,
        queue_depth = config.executor.queue_depth,
        "Starting sandbox executor"
    );

    let state = HttpState {
        executor: Arc::new(build_executor(&config)),
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
        pid: std::process::id(),
    };
    let server = start_server(&config.executor.listen, state)
        .await
        .with_context(|| format!("failed to bind {}", config.executor.listen))?;

    tokio::select! {
        result = server => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; shutting down");
        }
    }
    Ok(())
}
