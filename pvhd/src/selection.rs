//! Worker selection.
//!
//! Eligible workers are healthy, under their ceiling and not cooling down
//! from a backpressure rejection. Among them, workers that already know the
//! repository win (warm mirrors), then the least weighted load relative to
//! ceiling, then fewest in-flight jobs, then id for determinism.

use std::cmp::Ordering;

use pvh_common::types::{WorkerId, WorkerStatus};

/// Scheduling view of one worker for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    /// Effective in-flight limit: `min(capacity, per-worker ceiling)`.
    pub ceiling: u32,
    pub in_flight: u32,
    pub weighted_load: f64,
    /// Declared affinity or previously executed this repository.
    pub knows_repo: bool,
    pub saturated: bool,
}

impl WorkerSnapshot {
    pub fn is_eligible(&self) -> bool {
        self.status == WorkerStatus::Healthy && !self.saturated && self.in_flight < self.ceiling
    }

    fn load_ratio(&self) -> f64 {
        self.weighted_load / f64::from(self.ceiling.max(1))
    }
}

fn rank(a: &WorkerSnapshot, b: &WorkerSnapshot) -> Ordering {
    b.knows_repo
        .cmp(&a.knows_repo)
        .then_with(|| a.load_ratio().total_cmp(&b.load_ratio()))
        .then_with(|| a.in_flight.cmp(&b.in_flight))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick a worker for a job, or `None` when nothing is eligible.
///
/// `avoid` names the worker the job last failed or was rejected on; it is
/// only chosen again when it is the sole eligible worker.
pub fn select_worker(snapshots: &[WorkerSnapshot], avoid: Option<&WorkerId>) -> Option<WorkerId> {
    let eligible: Vec<&WorkerSnapshot> = snapshots.iter().filter(|s| s.is_eligible()).collect();

    let preferred = eligible
        .iter()
        .copied()
        .filter(|s| Some(&s.id) != avoid)
        .min_by(|a, b| rank(a, b));

    preferred
        .or_else(|| eligible.iter().copied().min_by(|a, b| rank(a, b)))
        .map(|s| s.id.clone())
}
