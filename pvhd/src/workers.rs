//! Worker pool management.
//!
//! Tracks every configured sandbox executor, its health, and the load the
//! orchestrator has placed on it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pvh_common::types::{WorkerConfig, WorkerId, WorkerStatus};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::selection::WorkerSnapshot;

#[derive(Debug, Default)]
struct LoadState {
    in_flight: u32,
    weighted_load: f64,
    /// Repository keys this worker has executed, i.e. has warm mirrors for.
    seen_repos: HashSet<String>,
    saturated_until: Option<Instant>,
}

/// State of a single worker.
#[derive(Debug)]
pub struct WorkerState {
    pub config: WorkerConfig,
    status: RwLock<WorkerStatus>,
    load: Mutex<LoadState>,
}

impl WorkerState {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            status: RwLock::new(WorkerStatus::Healthy),
            load: Mutex::new(LoadState::default()),
        }
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.status.read().await
    }

    pub fn in_flight(&self) -> u32 {
        self.lock_load().in_flight
    }

    fn lock_load(&self) -> std::sync::MutexGuard<'_, LoadState> {
        self.load.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `repo_key` is in this worker's declared affinity or has
    /// already run here.
    fn knows_repo(&self, repo_key: &str, repo_slug: &str, load: &LoadState) -> bool {
        load.seen_repos.contains(repo_key)
            || self
                .config
                .affinity
                .iter()
                .any(|a| a == repo_slug || a == repo_key)
    }

    async fn snapshot(&self, repo_key: &str, repo_slug: &str, ceiling: u32, now: Instant) -> WorkerSnapshot {
        let status = self.status().await;
        let load = self.lock_load();
        WorkerSnapshot {
            id: self.config.id.clone(),
            status,
            ceiling: ceiling.min(self.config.capacity).max(1),
            in_flight: load.in_flight,
            weighted_load: load.weighted_load,
            knows_repo: self.knows_repo(repo_key, repo_slug, &load),
            saturated: load.saturated_until.is_some_and(|until| until > now),
        }
    }
}

/// Pool of all configured workers.
#[derive(Clone, Default)]
pub struct WorkerPool {
    workers: Arc<RwLock<HashMap<WorkerId, Arc<WorkerState>>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_worker(&self, config: WorkerConfig) {
        let id = config.id.clone();
        self.workers
            .write()
            .await
            .insert(id, Arc::new(WorkerState::new(config)));
    }

    pub async fn get(&self, id: &WorkerId) -> Option<Arc<WorkerState>> {
        self.workers.read().await.get(id).cloned()
    }

    /// All workers, ordered by id.
    pub async fn all_workers(&self) -> Vec<Arc<WorkerState>> {
        let mut all: Vec<_> = self.workers.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        all
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    pub async fn set_status(&self, id: &WorkerId, status: WorkerStatus) {
        if let Some(worker) = self.get(id).await {
            *worker.status.write().await = status;
        }
    }

    /// Scheduling view of every worker for one repository.
    pub async fn snapshots(&self, repo_key: &str, repo_slug: &str, ceiling: u32) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let mut out = Vec::new();
        for worker in self.all_workers().await {
            out.push(worker.snapshot(repo_key, repo_slug, ceiling, now).await);
        }
        out
    }

    /// Account a job placed on `id`.
    pub async fn acquire(&self, id: &WorkerId, repo_key: &str, weight: f64) {
        if let Some(worker) = self.get(id).await {
            let mut load = worker.lock_load();
            load.in_flight += 1;
            load.weighted_load += weight;
            load.seen_repos.insert(repo_key.to_string());
        }
    }

    /// Undo [`WorkerPool::acquire`].
    pub async fn release(&self, id: &WorkerId, weight: f64) {
        if let Some(worker) = self.get(id).await {
            let mut load = worker.lock_load();
            load.in_flight = load.in_flight.saturating_sub(1);
            load.weighted_load = (load.weighted_load - weight).max(0.0);
            if load.in_flight == 0 {
                load.weighted_load = 0.0;
            }
        }
    }

    /// Skip `id` for new jobs until `cooldown` has passed.
    pub async fn mark_saturated(&self, id: &WorkerId, cooldown: Duration) {
        if let Some(worker) = self.get(id).await {
            debug!(worker_id = %id, ?cooldown, "Worker saturated");
            worker.lock_load().saturated_until = Some(Instant::now() + cooldown);
        }
    }
}
