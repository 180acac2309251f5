//! Patch Validation Helper - Orchestrator
//!
//! Reads validation jobs, schedules each job's before/after runs across the
//! sandbox executor fleet, and appends one durable record per attempt.

#![forbid(unsafe_code)]

mod checker;
mod client;
mod health;
mod history;
mod orchestrator;
mod selection;
#[cfg(test)]
mod testing;
mod workers;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pvh_common::config::{PvhConfig, load_workers};
use pvh_common::jobs::load_jobs;
use pvh_common::{LogConfig, init_logging};
use tracing::{info, warn};

use crate::client::{HttpSandboxClient, SandboxClient};
use crate::health::{HealthConfig, HealthMonitor};
use crate::history::{ResultStore, RunSummary, summary_path_for};
use crate::orchestrator::Orchestrator;
use crate::workers::WorkerPool;

#[derive(Parser)]
#[command(name = "pvhd")]
#[command(author, version, about = "PVH orchestrator - distributed patch validation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $PVH_CONFIG, then ~/.config/pvh/pvh.toml)
    #[arg(short, long, global = true, env = "PVH_CONFIG")]
    config: Option<PathBuf>,

    /// Worker fleet file (defaults to $PVH_WORKERS, then ~/.config/pvh/workers.toml)
    #[arg(short, long, global = true, env = "PVH_WORKERS")]
    workers: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every job in a job file
    Run {
        /// JSONL job file
        #[arg(short, long)]
        jobs: PathBuf,

        /// Result store; existing terminal records are skipped on restart
        #[arg(short, long, default_value = "results.jsonl")]
        results: PathBuf,

        /// Summary output (defaults to <results>.summary.json)
        #[arg(short, long)]
        summary: Option<PathBuf>,

        /// Attempts per job before infrastructure failures become terminal
        #[arg(long)]
        max_attempts: Option<u32>,

        /// How long a job may wait for a schedulable worker, e.g. "5m"
        #[arg(long, value_parser = humantime::parse_duration)]
        no_worker_grace: Option<Duration>,
    },

    /// Summarise an existing result store
    Summary {
        /// Result store
        #[arg(short, long, default_value = "results.jsonl")]
        results: PathBuf,

        /// Only count instances from this job file
        #[arg(short, long)]
        jobs: Option<PathBuf>,
    },

    /// Probe every configured worker once
    Probe {
        /// Per-probe timeout, e.g. "3s"
        #[arg(short, long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,
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

    match cli.command {
        Commands::Run {
            jobs,
            results,
            summary,
            max_attempts,
            no_worker_grace,
        } => {
            if let Some(attempts) = max_attempts {
                config.orchestrator.max_attempts = attempts;
            }
            if let Some(grace) = no_worker_grace {
                config.orchestrator.no_worker_grace_secs = grace.as_secs();
            }
            config.validate()?;

            let jobs = load_jobs(&jobs, config.orchestrator.default_timeout_secs)
                .with_context(|| format!("failed to load jobs from {}", jobs.display()))?;
            let summary_path = summary.unwrap_or_else(|| summary_path_for(&results));
            let summary = run(config, cli.workers, jobs, &results).await?;

            summary
                .write_to(&summary_path)
                .with_context(|| format!("failed to write {}", summary_path.display()))?;
            print_summary(&summary);
            println!("Summary written to {}", summary_path.display());
            Ok(())
        }
        Commands::Summary { results, jobs } => {
            let store = ResultStore::open(&results)?;
            let instances: Option<HashSet<String>> = match jobs {
                Some(path) => Some(
                    load_jobs(&path, config.orchestrator.default_timeout_secs)?
                        .into_iter()
                        .map(|j| j.instance_id)
                        .collect(),
                ),
                None => None,
            };
            let now = Utc::now();
            let summary = store.summary(instances.as_ref(), now, now);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Probe { timeout } => {
            let workers = load_workers(cli.workers.as_deref())?;
            let client = HttpSandboxClient::new();
            let mut unreachable = 0;
            for worker in &workers {
                match client.probe(worker, timeout).await {
                    Ok(()) => println!("{:<16} {:<32} healthy", worker.id, worker.address),
                    Err(e) => {
                        unreachable += 1;
                        println!("{:<16} {:<32} unreachable ({})", worker.id, worker.address, e);
                    }
                }
            }
            if unreachable > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run(
    config: PvhConfig,
    workers_file: Option<PathBuf>,
    jobs: Vec<pvh_common::types::ValidationJob>,
    results: &std::path::Path,
) -> Result<RunSummary> {
    let workers = load_workers(workers_file.as_deref())?;

    let pool = WorkerPool::new();
    for worker in workers {
        info!(
            worker_id = %worker.id,
            address = %worker.address,
            capacity = worker.capacity,
            "Adding worker"
        );
        pool.add_worker(worker).await;
    }
    info!("Loaded {} workers", pool.len().await);

    let store = Arc::new(ResultStore::open(results)?);
    if !store.is_empty() {
        info!(
            records = store.len(),
            path = ?store.path(),
            "Resuming from existing result store"
        );
    }

    let client = Arc::new(HttpSandboxClient::new());
    let monitor = HealthMonitor::new(
        pool.clone(),
        client.clone(),
        HealthConfig::from(&config.orchestrator.health),
    );
    let watchdog = monitor.start();

    let orchestrator = Orchestrator::new(pool, client, monitor, store, config);
    let summary = tokio::select! {
        summary = orchestrator.run(jobs) => summary?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; completed attempts are in the result store");
            watchdog.abort();
            anyhow::bail!("interrupted");
        }
    };
    watchdog.abort();
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} jobs, {} terminal, {} attempts in {:.1}s",
        summary.total_jobs, summary.terminal, summary.attempts, summary.duration_secs
    );
    for (verdict, count) in &summary.by_verdict {
        println!("  {verdict:<22} {count}");
    }
    if summary.coarse_grained > 0 {
        println!("  ({} verdicts from widened targets)", summary.coarse_grained);
    }
    if summary.pending() > 0 {
        println!("  {} jobs without a terminal record", summary.pending());
    }
}
