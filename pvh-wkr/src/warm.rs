//! Cache warming: fetch every base commit a job file will need before the
//! run starts, so the first sandbox of each repository does not pay for the
//! clone.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use pvh_common::types::{RepoId, ValidationJob};
use tracing::{info, warn};

use crate::cache::{CacheError, RepositoryCache};

/// Per-repository outcome of a warm pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub repository: String,
    pub commits: usize,
    pub failures: Vec<(String, String)>,
}

impl WarmReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Distinct base commits per repository key, in first-seen order.
pub fn plan_warm(jobs: &[ValidationJob]) -> BTreeMap<String, (RepoId, Vec<String>)> {
    let mut plan: BTreeMap<String, (RepoId, Vec<String>)> = BTreeMap::new();
    for job in jobs {
        let repo = RepoId::parse(&job.repository);
        let entry = plan
            .entry(repo.key.clone())
            .or_insert_with(|| (repo, Vec::new()));
        if !entry.1.contains(&job.base_commit) {
            entry.1.push(job.base_commit.clone());
        }
    }
    plan
}

/// Warm the cache for `jobs`. Repositories proceed in parallel (at most
/// `parallelism` at once); commits within one repository are serial since
/// they share a mirror lock anyway.
pub async fn warm(
    cache: Arc<RepositoryCache>,
    jobs: &[ValidationJob],
    parallelism: usize,
) -> Vec<WarmReport> {
    let plan = plan_warm(jobs);
    info!(
        repositories = plan.len(),
        commits = plan.values().map(|(_, c)| c.len()).sum::<usize>(),
        "Warming repository cache"
    );

    stream::iter(plan.into_values())
        .map(|(repo, commits)| {
            let cache = cache.clone();
            async move { warm_repo(&cache, &repo, &commits).await }
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await
}

async fn warm_repo(cache: &RepositoryCache, repo: &RepoId, commits: &[String]) -> WarmReport {
    let mut report = WarmReport {
        repository: repo.slug.clone(),
        commits: commits.len(),
        failures: Vec::new(),
    };

    for commit in commits {
        match cache.ensure_commit(repo, commit).await {
            Ok(_) => {}
            Err(e @ CacheError::FetchError { .. }) => {
                // Remote unreachable: the remaining commits will fail the same way.
                warn!(repo = %repo.slug, "Warm aborted: {}", e);
                report.failures.push((commit.clone(), e.to_string()));
                break;
            }
            Err(e) => {
                warn!(repo = %repo.slug, commit = %commit, "Warm failed: {}", e);
                report.failures.push((commit.clone(), e.to_string()));
            }
        }
    }

    if report.is_clean() {
        info!(repo = %repo.slug, commits = report.commits, "Repository warm");
    }
    report
}
