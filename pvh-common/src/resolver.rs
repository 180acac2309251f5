//! Test target resolution.
//!
//! Derives the minimal set of tests relevant to a patch. Resolution is split
//! in two phases so it stays a pure function of its inputs:
//!
//! 1. [`plan`] inspects the explicit identifiers and the diffs. It either
//!    resolves, fails with [`ResolveError::Unresolvable`], or asks for the
//!    contents of specific directories.
//! 2. [`complete`] finishes a plan once the executor has listed those
//!    directories in the pristine sandbox.
//!
//! Priority: explicit identifiers, then test files touched by the test diff
//! (narrowed to classes/functions when every hunk can be attributed), then
//! the coarse-grained widening policy for data-only diffs. There is no
//! "run everything" fallback.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::patch::{FileChange, FileDiff, Hunk, HunkLine, parse_diff};
use crate::types::TestTarget;

static CLASS_DEF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)class\s+(\w+)").expect("class regex is valid"));

static FUNC_DEF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)").expect("def regex is valid")
});

/// What to do when the test diff touches only non-test files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoarsePolicy {
    /// Treat the job as unresolvable.
    Disabled,
    /// Run the test files that sit next to the changed data files.
    #[default]
    DirectoryTestFiles,
    /// Run the containing directories as a whole.
    Directory,
}

/// Inputs to resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveInput<'a> {
    pub test_patch: &'a str,
    pub explicit: Option<&'a [String]>,
}

/// Where the resolved targets came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Explicit,
    TestDiff,
    Coarse,
}

/// A non-empty, ordered set of test targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub targets: Vec<TestTarget>,
    pub coarse_grained: bool,
    pub source: ResolutionSource,
}

/// Directories whose files must be listed to finish resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRequest {
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionPlan {
    Resolved(Resolution),
    NeedsListing(ListingRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no test targets could be derived: {reason}")]
    Unresolvable { reason: String },
}

impl ResolveError {
    fn unresolvable(reason: impl Into<String>) -> Self {
        Self::Unresolvable {
            reason: reason.into(),
        }
    }
}

/// Whether a path names a Python test module.
pub fn is_test_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.ends_with(".py") && (name.starts_with("test") || name.ends_with("_test.py"))
}

fn is_test_class(name: &str) -> bool {
    name.starts_with("Test")
        || name.ends_with("Test")
        || name.ends_with("Tests")
        || name.ends_with("TestCase")
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// First resolution phase.
pub fn plan(input: &ResolveInput<'_>, policy: CoarsePolicy) -> Result<ResolutionPlan, ResolveError> {
    if let Some(explicit) = input.explicit {
        let mut targets: Vec<TestTarget> = Vec::new();
        for id in explicit.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let target = TestTarget::Explicit { id: id.to_string() };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        if !targets.is_empty() {
            return Ok(ResolutionPlan::Resolved(Resolution {
                targets,
                coarse_grained: false,
                source: ResolutionSource::Explicit,
            }));
        }
    }

    // Only the test diff names targets; the fix may rewrite tests it
    // would then be judged by.
    let files = parse_diff(input.test_patch);
    if files.is_empty() {
        return Err(ResolveError::unresolvable("test diff touches no files"));
    }
    let source = ResolutionSource::TestDiff;

    let live: Vec<&FileDiff> = files
        .iter()
        .filter(|f| f.change != FileChange::Deleted && !f.binary)
        .collect();

    let mut targets: Vec<TestTarget> = Vec::new();
    for file in live.iter().filter(|f| is_test_file(f.path())) {
        for target in narrow_file(file) {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    if !targets.is_empty() {
        debug!(count = targets.len(), ?source, "Resolved test targets from diff");
        return Ok(ResolutionPlan::Resolved(Resolution {
            targets,
            coarse_grained: false,
            source,
        }));
    }

    let mut directories: Vec<String> = Vec::new();
    for file in &files {
        let dir = parent_dir(file.path());
        if !dir.is_empty() && !directories.iter().any(|d| d == dir) {
            directories.push(dir.to_string());
        }
    }

    match policy {
        CoarsePolicy::Disabled => Err(ResolveError::unresolvable(
            "diff touches no test files and coarse widening is disabled",
        )),
        _ if directories.is_empty() => Err(ResolveError::unresolvable(
            "diff touches no test files and only top-level paths",
        )),
        CoarsePolicy::Directory => Ok(ResolutionPlan::Resolved(Resolution {
            targets: directories
                .into_iter()
                .map(|path| TestTarget::Directory { path })
                .collect(),
            coarse_grained: true,
            source: ResolutionSource::Coarse,
        })),
        CoarsePolicy::DirectoryTestFiles => {
            Ok(ResolutionPlan::NeedsListing(ListingRequest { directories }))
        }
    }
}

/// Second resolution phase: pick the test files out of directory listings.
///
/// `listings` maps each requested directory to the file names it contains;
/// a directory missing from the map is treated as empty.
pub fn complete(
    request: &ListingRequest,
    listings: &BTreeMap<String, Vec<String>>,
) -> Result<Resolution, ResolveError> {
    let mut targets = Vec::new();
    for dir in &request.directories {
        let mut names: Vec<&String> = listings
            .get(dir)
            .map(|names| names.iter().filter(|n| is_test_file(n)).collect())
            .unwrap_or_default();
        names.sort();
        for name in names {
            let target = TestTarget::file(format!("{dir}/{name}"));
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    if targets.is_empty() {
        return Err(ResolveError::unresolvable(format!(
            "no test files next to changed data files in {}",
            request.directories.join(", ")
        )));
    }

    Ok(Resolution {
        targets,
        coarse_grained: true,
        source: ResolutionSource::Coarse,
    })
}

// ============================================================================
// Hunk narrowing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scope {
    class: Option<String>,
    function: Option<String>,
}

#[derive(Debug, Clone)]
struct FuncScope {
    name: String,
    indent: usize,
    class: Option<String>,
    class_known: bool,
}

fn indent_of(text: &str) -> usize {
    text.len() - text.trim_start().len()
}

fn func_scope(caps: &regex::Captures<'_>, class: &Option<String>) -> FuncScope {
    let indent = caps[1].len();
    FuncScope {
        name: caps[2].to_string(),
        indent,
        class: if indent == 0 { None } else { class.clone() },
        class_known: indent == 0 || class.is_some(),
    }
}

fn scope_of(func: &Option<FuncScope>, class: &Option<String>) -> Option<Scope> {
    match func {
        Some(f) if f.name.starts_with("test") => f.class_known.then(|| Scope {
            class: f.class.clone(),
            function: Some(f.name.clone()),
        }),
        _ => match class {
            Some(c) if is_test_class(c) => Some(Scope {
                class: Some(c.clone()),
                function: None,
            }),
            _ => None,
        },
    }
}

/// Attribute every change in a hunk to a test class or function.
///
/// Returns `None` when any change falls outside an addressable test scope.
fn narrow_hunk(hunk: &Hunk) -> Option<Vec<Scope>> {
    let mut class: Option<String> = None;
    let mut func: Option<FuncScope> = None;
    let mut live_defs: HashSet<String> = HashSet::new();

    if let Some(caps) = CLASS_DEF.captures(&hunk.context) {
        if caps[1].is_empty() {
            class = Some(caps[2].to_string());
        }
    } else if let Some(caps) = FUNC_DEF.captures(&hunk.context) {
        let scope = func_scope(&caps, &class);
        live_defs.insert(scope.name.clone());
        func = Some(scope);
    }

    let mut scopes: Vec<Scope> = Vec::new();
    let mut pending_decorator = false;

    for line in &hunk.lines {
        let (text, changed, removed) = match line {
            HunkLine::Context(t) => (t.as_str(), false, false),
            HunkLine::Added(t) => (t.as_str(), true, false),
            HunkLine::Removed(t) => (t.as_str(), true, true),
        };
        let trimmed = text.trim_start();

        if removed {
            if let Some(caps) = FUNC_DEF.captures(text) {
                let gone = func_scope(&caps, &class);
                let scope = scope_of(&Some(gone), &class)?;
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
                continue;
            }
            if CLASS_DEF.is_match(text) {
                return None;
            }
        } else if !trimmed.is_empty() {
            let indent = indent_of(text);
            if let Some(caps) = CLASS_DEF.captures(text).filter(|c| c[1].is_empty()) {
                class = Some(caps[2].to_string());
                func = None;
            } else if let Some(caps) = FUNC_DEF.captures(text) {
                let scope = func_scope(&caps, &class);
                live_defs.insert(scope.name.clone());
                func = Some(scope);
                if pending_decorator {
                    let attributed = scope_of(&func, &class)?;
                    if !scopes.contains(&attributed) {
                        scopes.push(attributed);
                    }
                    pending_decorator = false;
                }
            } else if trimmed.starts_with('@') || trimmed.starts_with('#') {
                // Decorators and comments do not close a scope.
            } else if indent == 0 {
                class = None;
                func = None;
            } else if func.as_ref().is_some_and(|f| indent <= f.indent) {
                func = None;
            }
        }

        if !changed || trimmed.is_empty() {
            continue;
        }

        if !removed && trimmed.starts_with('@') {
            pending_decorator = true;
            continue;
        }

        let scope = scope_of(&func, &class)?;
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }

    if pending_decorator || scopes.is_empty() {
        return None;
    }

    // A function that no longer exists after the change cannot be selected.
    if scopes
        .iter()
        .filter_map(|s| s.function.as_ref())
        .any(|name| !live_defs.contains(name))
    {
        return None;
    }

    Some(scopes)
}

fn narrow_file(file: &FileDiff) -> Vec<TestTarget> {
    let path = file.path().to_string();
    if file.change == FileChange::Added || file.hunks.is_empty() {
        return vec![TestTarget::file(path)];
    }

    let mut scopes: Vec<Scope> = Vec::new();
    for hunk in &file.hunks {
        match narrow_hunk(hunk) {
            Some(found) => {
                for scope in found {
                    if !scopes.contains(&scope) {
                        scopes.push(scope);
                    }
                }
            }
            None => return vec![TestTarget::file(path)],
        }
    }

    let whole_classes: Vec<String> = scopes
        .iter()
        .filter(|s| s.function.is_none())
        .filter_map(|s| s.class.clone())
        .collect();

    scopes
        .into_iter()
        .filter(|s| {
            s.function.is_none()
                || s.class.as_ref().is_none_or(|c| !whole_classes.contains(c))
        })
        .map(|s| TestTarget::narrowed(path.clone(), s.class, s.function))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(test_patch: &str) -> Result<ResolutionPlan, ResolveError> {
        plan(
            &ResolveInput {
                test_patch,
                explicit: None,
            },
            CoarsePolicy::default(),
        )
    }

    fn resolved_targets(test_patch: &str) -> Vec<TestTarget> {
        match resolve(test_patch) {
            Ok(ResolutionPlan::Resolved(r)) => r.targets,
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn explicit_identifiers_win() {
        let ids = vec!["tests/test_a.py::test_x".to_string(), " ".to_string()];
        let result = plan(
            &ResolveInput {
                test_patch: "",
                explicit: Some(&ids),
            },
            CoarsePolicy::Disabled,
        )
        .unwrap();
        let ResolutionPlan::Resolved(r) = result else {
            panic!("expected resolution");
        };
        assert_eq!(r.source, ResolutionSource::Explicit);
        assert_eq!(
            r.targets,
            vec![TestTarget::Explicit {
                id: "tests/test_a.py::test_x".into()
            }]
        );
    }

    #[test]
    fn empty_explicit_list_counts_as_absent() {
        let ids: Vec<String> = Vec::new();
        let diff = "diff --git a/tests/test_a.py b/tests/test_a.py\nnew file mode 100644\n--- /dev/null\n+++ b/tests/test_a.py\n@@ -0,0 +1,2 @@\n+def test_a():\n+    pass\n";
        let result = plan(
            &ResolveInput {
                test_patch: diff,
                explicit: Some(&ids),
            },
            CoarsePolicy::default(),
        )
        .unwrap();
        let ResolutionPlan::Resolved(r) = result else {
            panic!("expected resolution");
        };
        assert_eq!(r.source, ResolutionSource::TestDiff);
        assert_eq!(r.targets, vec![TestTarget::file("tests/test_a.py")]);
    }

    #[test]
    fn narrows_to_added_method_in_test_class() {
        let diff = "\
diff --git a/tests/test_core.py b/tests/test_core.py
--- a/tests/test_core.py
+++ b/tests/test_core.py
@@ -10,6 +10,10 @@ class TestCore:
     def test_existing(self):
         assert True

+    def test_new_behavior(self):
+        assert core.fixed()
+
";
        assert_eq!(
            resolved_targets(diff),
            vec![TestTarget::narrowed(
                "tests/test_core.py",
                Some("TestCore".into()),
                Some("test_new_behavior".into())
            )]
        );
    }

    #[test]
    fn narrows_module_level_function_from_header() {
        let diff = "\
diff --git a/pkg/tests/test_util.py b/pkg/tests/test_util.py
--- a/pkg/tests/test_util.py
+++ b/pkg/tests/test_util.py
@@ -3,4 +3,4 @@ def test_parse():
     value = parse('x')
-    assert value == 1
+    assert value == 2
";
        assert_eq!(
            resolved_targets(diff),
            vec![TestTarget::narrowed(
                "pkg/tests/test_util.py",
                None,
                Some("test_parse".into())
            )]
        );
    }

    #[test]
    fn class_body_change_targets_class() {
        let diff = "\
diff --git a/tests/admin/tests.py b/tests/admin/tests.py
--- a/tests/admin/tests.py
+++ b/tests/admin/tests.py
@@ -40,3 +40,3 @@ class AdminViewTests(TestCase):
         response = self.client.get(url)
-        self.assertEqual(response.status_code, 200)
+        self.assertEqual(response.status_code, 302)
";
        assert_eq!(
            resolved_targets(diff),
            vec![TestTarget::narrowed(
                "tests/admin/tests.py",
                Some("AdminViewTests".into()),
                None
            )]
        );
    }

    #[test]
    fn unattributable_hunk_widens_to_file() {
        let diff = "\
diff --git a/tests/test_io.py b/tests/test_io.py
--- a/tests/test_io.py
+++ b/tests/test_io.py
@@ -1,3 +1,4 @@
 import os
+import json

@@ -20,3 +21,4 @@ def test_read():
     data = read()
+    assert data
";
        assert_eq!(resolved_targets(diff), vec![TestTarget::file("tests/test_io.py")]);
    }

    #[test]
    fn indented_method_without_known_class_widens() {
        let diff = "\
diff --git a/tests/test_m.py b/tests/test_m.py
--- a/tests/test_m.py
+++ b/tests/test_m.py
@@ -50,3 +50,3 @@     def test_method(self):
         x = 1
-        assert x == 2
+        assert x == 1
";
        assert_eq!(resolved_targets(diff), vec![TestTarget::file("tests/test_m.py")]);
    }

    #[test]
    fn decorator_attaches_to_following_function() {
        let diff = "\
diff --git a/tests/test_p.py b/tests/test_p.py
--- a/tests/test_p.py
+++ b/tests/test_p.py
@@ -5,2 +5,3 @@ import pytest

+@pytest.mark.parametrize('x', [1, 2])
 def test_values(x):
";
        assert_eq!(
            resolved_targets(diff),
            vec![TestTarget::narrowed(
                "tests/test_p.py",
                None,
                Some("test_values".into())
            )]
        );
    }

    #[test]
    fn removed_test_function_widens() {
        let diff = "\
diff --git a/tests/test_r.py b/tests/test_r.py
--- a/tests/test_r.py
+++ b/tests/test_r.py
@@ -5,3 +5,0 @@ import pytest
-def test_gone():
-    assert False
-
";
        assert_eq!(resolved_targets(diff), vec![TestTarget::file("tests/test_r.py")]);
    }

    #[test]
    fn data_only_diff_requests_listing() {
        let diff = "diff --git a/tests/fixtures/sample.json b/tests/fixtures/sample.json\n--- a/tests/fixtures/sample.json\n+++ b/tests/fixtures/sample.json\n@@ -1 +1 @@\n-{}\n+{\"a\": 1}\n";
        let plan = resolve(diff).unwrap();
        let ResolutionPlan::NeedsListing(request) = plan else {
            panic!("expected listing request");
        };
        assert_eq!(request.directories, vec!["tests/fixtures"]);

        let mut listings = BTreeMap::new();
        listings.insert(
            "tests/fixtures".to_string(),
            vec!["sample.json".into(), "test_fixtures.py".into(), "conftest.py".into()],
        );
        let r = complete(&request, &listings).unwrap();
        assert!(r.coarse_grained);
        assert_eq!(r.source, ResolutionSource::Coarse);
        assert_eq!(r.targets, vec![TestTarget::file("tests/fixtures/test_fixtures.py")]);
    }

    #[test]
    fn data_only_diff_with_no_neighbouring_tests_is_unresolvable() {
        let request = ListingRequest {
            directories: vec!["docs".into()],
        };
        let listings = BTreeMap::from([("docs".to_string(), vec!["index.rst".to_string()])]);
        assert!(matches!(
            complete(&request, &listings),
            Err(ResolveError::Unresolvable { .. })
        ));
    }

    #[test]
    fn coarse_disabled_is_unresolvable() {
        let diff = "diff --git a/tests/conftest.py b/tests/conftest.py\n--- a/tests/conftest.py\n+++ b/tests/conftest.py\n@@ -1 +1 @@\n-a = 1\n+a = 2\n";
        let result = plan(
            &ResolveInput {
                test_patch: diff,
                explicit: None,
            },
            CoarsePolicy::Disabled,
        );
        assert!(matches!(result, Err(ResolveError::Unresolvable { .. })));
    }

    #[test]
    fn coarse_directory_policy_targets_directories() {
        let diff = "diff --git a/tests/conftest.py b/tests/conftest.py\n--- a/tests/conftest.py\n+++ b/tests/conftest.py\n@@ -1 +1 @@\n-a = 1\n+a = 2\n";
        let result = plan(
            &ResolveInput {
                test_patch: diff,
                explicit: None,
            },
            CoarsePolicy::Directory,
        )
        .unwrap();
        let ResolutionPlan::Resolved(r) = result else {
            panic!("expected resolution");
        };
        assert!(r.coarse_grained);
        assert_eq!(
            r.targets,
            vec![TestTarget::Directory {
                path: "tests".into()
            }]
        );
    }

    #[test]
    fn top_level_data_file_is_unresolvable() {
        let diff = "diff --git a/setup.cfg b/setup.cfg\n--- a/setup.cfg\n+++ b/setup.cfg\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(matches!(resolve(diff), Err(ResolveError::Unresolvable { .. })));
    }

    #[test]
    fn blank_explicit_ids_and_empty_test_diff_is_unresolvable() {
        // The explicit list is empty too, so it counts as absent.
        let none: Vec<String> = vec!["  ".to_string()];
        let result = plan(
            &ResolveInput {
                test_patch: "",
                explicit: Some(&none),
            },
            CoarsePolicy::default(),
        );
        assert!(matches!(result, Err(ResolveError::Unresolvable { .. })));
    }

    #[test]
    fn nothing_at_all_is_unresolvable() {
        assert!(matches!(resolve(""), Err(ResolveError::Unresolvable { .. })));
    }

    #[test]
    fn test_file_classification() {
        assert!(is_test_file("tests/test_x.py"));
        assert!(is_test_file("sympy/core/tests/test_basic.py"));
        assert!(is_test_file("tests/admin_views/tests.py"));
        assert!(is_test_file("pkg/io_test.py"));
        assert!(!is_test_file("tests/conftest.py"));
        assert!(!is_test_file("tests/__init__.py"));
        assert!(!is_test_file("tests/data/test_input.json"));
    }
}
