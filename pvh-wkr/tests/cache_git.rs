//! Repository cache and local backend against real git repositories.
//!
//! Skipped when `git` is not installed.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::git::git_in;
use common::{SourceRepo, git_available, init_test_logging};
use pvh_common::adapter::Invocation;
use pvh_common::types::RepoId;
use pvh_wkr::backend::{PrepareRequest, SandboxLocation};
use pvh_wkr::{CacheError, LocalBackend, RepositoryCache, SandboxBackend, SandboxError};

const CALC: &str = "def add(a, b):\n    return a + b\n";
const CALC_TESTS: &str = "import calc\n\n\ndef test_add():\n    assert calc.add(1, 2) == 3\n";

fn upstream() -> (SourceRepo, String, String) {
    let repo = SourceRepo::new();
    repo.write("calc.py", CALC);
    repo.write("tests/test_calc.py", CALC_TESTS);
    let first = repo.commit("initial");
    repo.write("calc.py", "def add(a, b):\n    return a + b + 0\n");
    let second = repo.commit("second");
    (repo, first, second)
}

fn cache_in(dir: &tempfile::TempDir) -> Arc<RepositoryCache> {
    Arc::new(RepositoryCache::new(dir.path(), Duration::from_secs(300)))
}

#[tokio::test]
async fn sandbox_matches_mirror_at_commit() {
    if !git_available() {
        return;
    }
    init_test_logging();
    crate::test_log!("TEST START: sandbox_matches_mirror_at_commit");

    let (repo, first, _) = upstream();
    let root = tempfile::tempdir().unwrap();
    let cache = cache_in(&root);
    let id = RepoId::parse(&repo.url());

    let sandbox = cache.create_sandbox(&id, &first).await.unwrap();
    assert_eq!(cache.head_of(&sandbox).await.unwrap(), first);
    assert_eq!(git_in(&sandbox, &["status", "--porcelain"]), "");
    assert_eq!(git_in(&sandbox, &["diff", &first]), "");
    assert_eq!(
        std::fs::read_to_string(sandbox.join("calc.py")).unwrap(),
        CALC
    );

    cache.destroy_sandbox(&sandbox).await.unwrap();
    assert!(!sandbox.exists());
    // Second destroy is a no-op.
    cache.destroy_sandbox(&sandbox).await.unwrap();

    crate::test_log!("TEST PASS: sandbox_matches_mirror_at_commit");
}

#[tokio::test]
async fn concurrent_sandboxes_are_independent() {
    if !git_available() {
        return;
    }
    init_test_logging();

    let (repo, first, second) = upstream();
    let root = tempfile::tempdir().unwrap();
    let cache = cache_in(&root);
    let id = RepoId::parse(&repo.url());

    let (a, b) = tokio::join!(
        cache.create_sandbox(&id, &first),
        cache.create_sandbox(&id, &second)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);

    std::fs::write(a.join("calc.py"), "broken").unwrap();
    assert_eq!(cache.head_of(&b).await.unwrap(), second);
    assert_eq!(git_in(&b, &["status", "--porcelain"]), "");

    cache.destroy_sandbox(&a).await.unwrap();
    cache.destroy_sandbox(&b).await.unwrap();
}

#[tokio::test]
async fn commit_added_upstream_is_fetched() {
    if !git_available() {
        return;
    }
    init_test_logging();

    let (repo, first, _) = upstream();
    let root = tempfile::tempdir().unwrap();
    let cache = cache_in(&root);
    let id = RepoId::parse(&repo.url());

    cache.ensure_commit(&id, &first).await.unwrap();

    repo.write("tests/test_more.py", "def test_more():\n    pass\n");
    let third = repo.commit("third");
    let sandbox = cache.create_sandbox(&id, &third).await.unwrap();
    assert!(sandbox.join("tests/test_more.py").exists());
    cache.destroy_sandbox(&sandbox).await.unwrap();
}

#[tokio::test]
async fn unknown_commit_is_definitive() {
    if !git_available() {
        return;
    }
    init_test_logging();

    let (repo, _, _) = upstream();
    let root = tempfile::tempdir().unwrap();
    let cache = cache_in(&root);
    let id = RepoId::parse(&repo.url());

    let err = cache
        .ensure_commit(&id, "0123456789abcdef0123456789abcdef01234567")
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::CommitMissing { .. }), "got {err:?}");
}

#[tokio::test]
async fn local_backend_applies_patches_and_rejects_bad_ones() {
    if !git_available() {
        return;
    }
    init_test_logging();

    let (repo, first, _) = upstream();
    let root = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(cache_in(&root), "python3");
    let request = PrepareRequest {
        instance_id: "acme__calc-1".into(),
        repo: RepoId::parse(&repo.url()),
        base_commit: first,
    };

    let sandbox = backend.prepare(&request).await.unwrap();
    let SandboxLocation::Worktree { path, .. } = &sandbox.location else {
        panic!("local backend produced {:?}", sandbox.location);
    };

    let patch = "\
diff --git a/calc.py b/calc.py
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a + b
+    return b + a
";
    backend.apply_patch(&sandbox, patch).await.unwrap();
    assert!(std::fs::read_to_string(path.join("calc.py")).unwrap().contains("b + a"));

    let err = backend.apply_patch(&sandbox, patch).await.unwrap_err();
    assert!(matches!(err, SandboxError::PatchRejected(_)), "got {err:?}");

    assert_eq!(
        backend.list_files(&sandbox, "tests").await.unwrap(),
        vec!["test_calc.py"]
    );
    assert!(backend.list_files(&sandbox, "missing").await.unwrap().is_empty());
    assert!(backend.file_exists(&sandbox, "calc.py").await.unwrap());

    let out = backend
        .run(
            &sandbox,
            &Invocation {
                argv: vec!["git".into(), "status".into(), "--porcelain".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(out.success());
    assert!(out.output.contains("calc.py"));

    backend.destroy(&sandbox).await.unwrap();
    assert!(!path.exists());
    backend.destroy(&sandbox).await.unwrap();
}
