//! Worker health monitoring.
//!
//! Probes every worker on an interval and counts consecutive failures:
//! `degraded_after` of them stop new scheduling, `unreachable_after` of them
//! mark the worker unreachable so its in-flight jobs are requeued. Every
//! status change is published as a [`HealthTransition`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pvh_common::config::HealthSettings;
use pvh_common::types::{WorkerId, WorkerStatus};
use tokio::sync::{RwLock, broadcast};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::client::SandboxClient;
use crate::workers::WorkerPool;

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub degraded_after: u32,
    pub unreachable_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(settings: &HealthSettings) -> Self {
        let degraded_after = settings.degraded_after.max(1);
        Self {
            check_interval: Duration::from_secs(settings.interval_secs.max(1)),
            check_timeout: Duration::from_secs(settings.probe_timeout_secs.max(1)),
            degraded_after,
            unreachable_after: settings.unreachable_after.max(degraded_after),
        }
    }
}

/// A worker's status changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub worker_id: WorkerId,
    pub from: WorkerStatus,
    pub to: WorkerStatus,
    pub reason: String,
}

/// Failure counting for one worker.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    consecutive_failures: u32,
    current_status: WorkerStatus,
    last_error: Option<String>,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe (or dispatch) outcome; returns the new status when
    /// it changed.
    pub fn update(&mut self, ok: bool, error: Option<String>, config: &HealthConfig) -> Option<WorkerStatus> {
        let prior = self.current_status;
        if ok {
            self.consecutive_failures = 0;
            self.last_error = None;
            self.current_status = WorkerStatus::Healthy;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_error = error;
            if self.consecutive_failures >= config.unreachable_after {
                self.current_status = WorkerStatus::Unreachable;
            } else if self.consecutive_failures >= config.degraded_after {
                self.current_status = WorkerStatus::Degraded;
            }
        }
        (prior != self.current_status).then_some(self.current_status)
    }

    pub fn status(&self) -> WorkerStatus {
        self.current_status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Watchdog over the worker pool.
pub struct HealthMonitor<C: SandboxClient> {
    pool: WorkerPool,
    client: Arc<C>,
    config: HealthConfig,
    health_states: Arc<RwLock<HashMap<WorkerId, WorkerHealth>>>,
    events: broadcast::Sender<HealthTransition>,
}

impl<C: SandboxClient> Clone for HealthMonitor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            health_states: self.health_states.clone(),
            events: self.events.clone(),
        }
    }
}

impl<C: SandboxClient> HealthMonitor<C> {
    pub fn new(pool: WorkerPool, client: Arc<C>, config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pool,
            client,
            config,
            health_states: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.events.subscribe()
    }

    /// Start the background probe loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(monitor.config.check_interval);
            info!(
                "Health monitor started (interval: {:?})",
                monitor.config.check_interval
            );
            loop {
                ticker.tick().await;
                monitor.check_all().await;
            }
        })
    }

    /// Probe every worker once, including unreachable ones so they can
    /// recover.
    pub async fn check_all(&self) {
        let workers = self.pool.all_workers().await;
        debug!("Checking health of {} workers", workers.len());

        let probes = workers.iter().map(|worker| async move {
            let result = self
                .client
                .probe(&worker.config, self.config.check_timeout)
                .await;
            (worker.config.id.clone(), result)
        });
        for (worker_id, result) in futures::future::join_all(probes).await {
            match result {
                Ok(()) => self.apply(&worker_id, true, None).await,
                Err(e) => {
                    warn!(worker_id = %worker_id, "Health probe failed: {}", e);
                    self.apply(&worker_id, false, Some(e.to_string())).await;
                }
            }
        }
    }

    /// Count an infrastructure failure observed while dispatching.
    pub async fn record_failure(&self, worker_id: &WorkerId, reason: &str) {
        self.apply(worker_id, false, Some(reason.to_string())).await;
    }

    pub async fn get_health(&self, worker_id: &WorkerId) -> Option<WorkerStatus> {
        self.health_states
            .read()
            .await
            .get(worker_id)
            .map(|h| h.status())
    }

    async fn apply(&self, worker_id: &WorkerId, ok: bool, error: Option<String>) {
        let (prior, changed, reason) = {
            let mut states = self.health_states.write().await;
            let health = states.entry(worker_id.clone()).or_default();
            let prior = health.status();
            let changed = health.update(ok, error, &self.config);
            let reason = health
                .last_error()
                .map(str::to_string)
                .unwrap_or_else(|| "probe succeeded".to_string());
            (prior, changed, reason)
        };

        let Some(to) = changed else {
            return;
        };
        self.pool.set_status(worker_id, to).await;
        info!(worker_id = %worker_id, from = %prior, to = %to, "Worker status changed");
        // No subscribers is fine.
        let _ = self.events.send(HealthTransition {
            worker_id: worker_id.clone(),
            from: prior,
            to,
            reason,
        });
    }
}
