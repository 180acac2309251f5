use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "pvh")
        .env("GIT_AUTHOR_EMAIL", "pvh@example.invalid")
        .env("GIT_COMMITTER_NAME", "pvh")
        .env("GIT_COMMITTER_EMAIL", "pvh@example.invalid")
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A throwaway upstream repository with a small Python project.
pub struct SourceRepo {
    _dir: TempDir,
    pub path: PathBuf,
}

impl SourceRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("calc");
        std::fs::create_dir_all(path.join("tests")).expect("mkdir");
        run_git(&path, &["init", "--quiet"]);
        run_git(&path, &["config", "commit.gpgsign", "false"]);
        Self { _dir: dir, path }
    }

    pub fn write(&self, rel: &str, content: &str) {
        let full = self.path.join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(full, content).expect("write");
    }

    /// Commit everything and return the new commit id.
    pub fn commit(&self, message: &str) -> String {
        run_git(&self.path, &["add", "-A"]);
        run_git(&self.path, &["commit", "--quiet", "-m", message]);
        run_git(&self.path, &["rev-parse", "HEAD"])
    }

    pub fn url(&self) -> String {
        self.path.display().to_string()
    }
}

pub fn git_in(dir: &Path, args: &[&str]) -> String {
    run_git(dir, args)
}
