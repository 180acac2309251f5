//! Repository cache: one bare mirror per repository, disposable worktrees
//! per execution.
//!
//! Mirrors live under `<root>/mirrors/<key>.git` and are created with
//! `git clone --mirror`. Working copies are `git worktree add --detach`
//! checkouts under `<root>/sandboxes/`, so they share the mirror's object
//! store and cost only the files they materialise.
//!
//! Fetching is the only step serialized per repository. Each mirror sits
//! behind its own async mutex; different repositories never wait on each
//! other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvh_common::errors::{ErrorCode, RetryableError};
use pvh_common::types::RepoId;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Suffix of the sibling directory holding packages installed by
/// dependency repair for a worktree.
pub const DEPS_SUFFIX: &str = ".deps";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to fetch {repo}: {detail}")]
    FetchError { repo: String, detail: String },

    #[error("mirror for {repo} is corrupt: {detail}")]
    Corruption { repo: String, detail: String },

    #[error("out of disk space while updating {repo}: {detail}")]
    ResourceExhausted { repo: String, detail: String },

    #[error("commit {commit} not found in {repo}")]
    CommitMissing { repo: String, commit: String },

    #[error("worktree operation failed for {}: {detail}", path.display())]
    Worktree { path: PathBuf, detail: String },

    #[error("invalid commit reference '{0}'")]
    InvalidCommit(String),

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

impl RetryableError for CacheError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::CommitMissing { .. } | Self::InvalidCommit(_))
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::FetchError { .. } | Self::Io(_) => ErrorCode::RepoFetchFailed,
            Self::Corruption { .. } => ErrorCode::RepoCacheCorruption,
            Self::ResourceExhausted { .. } => ErrorCode::RepoResourceExhausted,
            Self::CommitMissing { .. } | Self::InvalidCommit(_) => ErrorCode::RepoCommitMissing,
            Self::Worktree { .. } => ErrorCode::RepoWorktreeFailed,
        }
    }
}

/// Classify git stderr into a cache error.
pub fn classify_git_failure(repo: &str, stderr: &str) -> CacheError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr.trim().to_string();
    if lower.contains("no space left on device") || lower.contains("disk quota exceeded") {
        return CacheError::ResourceExhausted {
            repo: repo.to_string(),
            detail,
        };
    }
    const CORRUPTION_MARKERS: &[&str] = &[
        "corrupt",
        "bad object",
        "loose object",
        "packfile",
        "did not send all necessary objects",
        "not a git repository",
        "unable to read tree",
        "broken link",
    ];
    if CORRUPTION_MARKERS.iter().any(|m| lower.contains(m)) {
        return CacheError::Corruption {
            repo: repo.to_string(),
            detail,
        };
    }
    CacheError::FetchError {
        repo: repo.to_string(),
        detail,
    }
}

/// State for one repository's mirror.
#[derive(Debug)]
pub struct MirrorEntry {
    pub repo: RepoId,
    pub path: PathBuf,
    pub last_refresh: Option<Instant>,
}

impl MirrorEntry {
    fn is_present(&self) -> bool {
        self.path.join("HEAD").is_file()
    }

    fn is_stale(&self, interval: Duration) -> bool {
        self.last_refresh
            .is_none_or(|at| at.elapsed() >= interval)
    }
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn git(cwd: Option<&Path>, args: &[&str]) -> Result<GitOutput, CacheError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = cmd.output().await?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn validate_commit(commit: &str) -> Result<(), CacheError> {
    let ok = !commit.is_empty()
        && !commit.starts_with('-')
        && commit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidCommit(commit.to_string()))
    }
}

fn staging_prefix(key: &str) -> String {
    format!(".{key}.")
}

/// Shared mirror store for every repository this executor has seen.
pub struct RepositoryCache {
    mirrors_dir: PathBuf,
    sandboxes_dir: PathBuf,
    refresh_interval: Duration,
    entries: RwLock<HashMap<String, Arc<Mutex<MirrorEntry>>>>,
}

impl RepositoryCache {
    pub fn new(root: impl Into<PathBuf>, refresh_interval: Duration) -> Self {
        let root = root.into();
        Self {
            mirrors_dir: root.join("mirrors"),
            sandboxes_dir: root.join("sandboxes"),
            refresh_interval,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn mirror_path(&self, repo: &RepoId) -> PathBuf {
        self.mirrors_dir.join(format!("{}.git", repo.key))
    }

    async fn entry(&self, repo: &RepoId) -> Arc<Mutex<MirrorEntry>> {
        if let Some(entry) = self.entries.read().await.get(&repo.key) {
            return entry.clone();
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(repo.key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MirrorEntry {
                    repo: repo.clone(),
                    path: self.mirror_path(repo),
                    last_refresh: None,
                }))
            })
            .clone()
    }

    /// Make sure a current mirror exists and return its path.
    pub async fn ensure_mirror(&self, repo: &RepoId) -> Result<PathBuf, CacheError> {
        let entry = self.entry(repo).await;
        let mut guard = entry.lock().await;
        self.ensure_locked(&mut guard).await?;
        Ok(guard.path.clone())
    }

    /// Make sure `commit` is present in the mirror, fetching once if not.
    pub async fn ensure_commit(&self, repo: &RepoId, commit: &str) -> Result<PathBuf, CacheError> {
        validate_commit(commit)?;
        let entry = self.entry(repo).await;
        let mut guard = entry.lock().await;
        self.ensure_locked(&mut guard).await?;

        if !has_commit(&guard.path, commit).await? {
            info!(repo = %guard.repo, commit, "Commit missing from mirror, fetching");
            self.fetch(&mut guard).await?;
            if !has_commit(&guard.path, commit).await? {
                // Commits outside every ref are still fetchable by id from
                // most hosts.
                let out = git(Some(&guard.path), &["fetch", "--quiet", "origin", commit]).await?;
                if !out.success || !has_commit(&guard.path, commit).await? {
                    return Err(CacheError::CommitMissing {
                        repo: guard.repo.slug.clone(),
                        commit: commit.to_string(),
                    });
                }
            }
        }
        Ok(guard.path.clone())
    }

    async fn ensure_locked(&self, entry: &mut MirrorEntry) -> Result<(), CacheError> {
        if !entry.is_present() {
            return self.clone_mirror(entry).await;
        }
        if entry.is_stale(self.refresh_interval) {
            match self.fetch(entry).await {
                Err(CacheError::Corruption { detail, .. }) => {
                    warn!(repo = %entry.repo, %detail, "Mirror corrupt, re-cloning");
                    return self.clone_mirror(entry).await;
                }
                other => return other,
            }
        }
        Ok(())
    }

    async fn clone_mirror(&self, entry: &mut MirrorEntry) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.mirrors_dir).await?;
        if entry.path.exists() {
            tokio::fs::remove_dir_all(&entry.path).await?;
        }
        self.remove_stale_staging(&entry.repo.key).await?;

        let staging = self.mirrors_dir.join(format!(
            "{}{}",
            staging_prefix(&entry.repo.key),
            uuid::Uuid::new_v4().simple()
        ));
        let staging_str = staging.to_string_lossy().into_owned();
        info!(repo = %entry.repo, url = %entry.repo.url, "Cloning mirror");
        let started = Instant::now();
        let out = git(
            None,
            &["clone", "--mirror", "--quiet", &entry.repo.url, &staging_str],
        )
        .await?;
        if !out.success {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(classify_git_failure(&entry.repo.slug, &out.stderr));
        }
        tokio::fs::rename(&staging, &entry.path).await?;
        entry.last_refresh = Some(Instant::now());
        info!(
            repo = %entry.repo,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Mirror ready"
        );
        Ok(())
    }

    /// Drop staging clones left behind by interrupted clones of `key`.
    /// Callers hold the key's entry lock, so none of them is still in use.
    async fn remove_stale_staging(&self, key: &str) -> Result<usize, CacheError> {
        let prefix = staging_prefix(key);
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.mirrors_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.file_name().to_string_lossy().starts_with(&prefix) {
                tokio::fs::remove_dir_all(item.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            warn!(key, removed, "Removed stale staging clones");
        }
        Ok(removed)
    }

    async fn fetch(&self, entry: &mut MirrorEntry) -> Result<(), CacheError> {
        debug!(repo = %entry.repo, "Fetching mirror");
        let out = git(
            Some(&entry.path),
            &["fetch", "--all", "--tags", "--prune", "--quiet"],
        )
        .await?;
        if !out.success {
            return Err(classify_git_failure(&entry.repo.slug, &out.stderr));
        }
        entry.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Create a detached worktree of `commit`.
    pub async fn create_sandbox(&self, repo: &RepoId, commit: &str) -> Result<PathBuf, CacheError> {
        let mirror = self.ensure_commit(repo, commit).await?;
        tokio::fs::create_dir_all(&self.sandboxes_dir).await?;

        let path = self.sandboxes_dir.join(format!(
            "{}-{}",
            repo.key,
            uuid::Uuid::new_v4().simple()
        ));
        let path_str = path.to_string_lossy().into_owned();
        let out = git(
            Some(&mirror),
            &["worktree", "add", "--detach", "--quiet", &path_str, commit],
        )
        .await?;
        if !out.success {
            let _ = tokio::fs::remove_dir_all(&path).await;
            let err = classify_git_failure(&repo.slug, &out.stderr);
            return Err(match err {
                CacheError::FetchError { detail, .. } => CacheError::Worktree { path, detail },
                other => other,
            });
        }
        debug!(repo = %repo, commit, path = %path.display(), "Sandbox created");
        Ok(path)
    }

    /// Remove a worktree and everything attached to it. Removing a path that
    /// no longer exists succeeds.
    pub async fn destroy_sandbox(&self, path: &Path) -> Result<(), CacheError> {
        let deps = deps_dir(path);
        if deps.exists() {
            tokio::fs::remove_dir_all(&deps).await?;
        }
        if !path.exists() {
            return Ok(());
        }

        let mirror = owning_mirror(path).await;
        if let Some(mirror) = &mirror {
            let path_str = path.to_string_lossy().into_owned();
            let out = git(Some(mirror), &["worktree", "remove", "--force", &path_str]).await?;
            if !out.success {
                debug!(path = %path.display(), stderr = %out.stderr.trim(), "worktree remove failed");
            }
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| CacheError::Worktree {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                })?;
        }
        if let Some(mirror) = &mirror {
            let _ = git(Some(mirror), &["worktree", "prune"]).await?;
        }
        debug!(path = %path.display(), "Sandbox destroyed");
        Ok(())
    }

    /// Commit currently checked out in a worktree.
    pub async fn head_of(&self, sandbox: &Path) -> Result<String, CacheError> {
        let out = git(Some(sandbox), &["rev-parse", "HEAD"]).await?;
        if !out.success {
            return Err(CacheError::Worktree {
                path: sandbox.to_path_buf(),
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }
}

/// Sibling directory for packages installed into one worktree.
pub fn deps_dir(sandbox: &Path) -> PathBuf {
    let mut name = sandbox.as_os_str().to_owned();
    name.push(DEPS_SUFFIX);
    PathBuf::from(name)
}

async fn has_commit(mirror: &Path, commit: &str) -> Result<bool, CacheError> {
    let spec = format!("{commit}^{{commit}}");
    Ok(git(Some(mirror), &["cat-file", "-e", &spec]).await?.success)
}

/// Mirror that a worktree belongs to, read from its `.git` file
/// (`gitdir: <mirror>/worktrees/<name>`).
async fn owning_mirror(worktree: &Path) -> Option<PathBuf> {
    let content = tokio::fs::read_to_string(worktree.join(".git")).await.ok()?;
    let gitdir = content.trim().strip_prefix("gitdir:")?.trim();
    let admin = Path::new(gitdir);
    admin.parent()?.parent().map(Path::to_path_buf)
}
