//! Adapter for Django-style suites addressed by dotted module labels.
//!
//! Django's own repository runs `tests/runtests.py` from the `tests`
//! directory; projects with a `manage.py` use `manage.py test` instead.
//! Labels are module paths relative to the test root, e.g.
//! `tests/admin_views/tests.py` becomes `admin_views.tests`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::pytest::merge_outcome;
use super::{ExecutionAdapter, Invocation, PYTHON};
use crate::types::{AdapterKind, TestOutcome, TestResult, TestTarget};

static TEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\w.]+) \(([\w.]+)\)(.*)$").expect("django test line regex is valid")
});

static RAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Ran (\d+) tests? in ([\d.]+)s").expect("django ran regex is valid")
});

static FINAL_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(OK|FAILED)(?: \((.*)\))?\s*$").expect("django status regex is valid")
});

static STATUS_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(failures|errors|skipped|expected failures|unexpected successes)=(\d+)")
        .expect("django count regex is valid")
});

/// Django test entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DjangoEntry {
    /// `tests/runtests.py`, run from the test root.
    RunTests,
    /// `manage.py test`, run from the repository root.
    ManagePy,
}

pub struct DjangoAdapter {
    test_root: String,
    entry: DjangoEntry,
}

impl DjangoAdapter {
    pub fn new(test_root: String, has_manage_py: bool) -> Self {
        let test_root = test_root.trim_matches('/').to_string();
        let entry = if has_manage_py {
            DjangoEntry::ManagePy
        } else {
            DjangoEntry::RunTests
        };
        Self { test_root, entry }
    }

    pub fn entry(&self) -> DjangoEntry {
        self.entry
    }

    fn module_label(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        let relative = if self.entry == DjangoEntry::RunTests {
            path.strip_prefix(&self.test_root)
                .and_then(|rest| if rest.is_empty() { Some("") } else { rest.strip_prefix('/') })
                .unwrap_or(path)
        } else {
            path
        };
        let relative = relative.strip_suffix(".py").unwrap_or(relative);
        let relative = relative.strip_suffix("/__init__").unwrap_or(relative);
        relative.replace('/', ".")
    }
}

/// Normalise `test_x (pkg.mod.Class)` and `test_x (pkg.mod.Class.test_x)` to
/// `pkg.mod.Class.test_x`.
fn dotted_label(name: &str, inner: &str) -> String {
    if inner.starts_with("unittest.loader._FailedTest") {
        return name.to_string();
    }
    if inner.ends_with(&format!(".{name}")) {
        inner.to_string()
    } else {
        format!("{inner}.{name}")
    }
}

fn outcome_from(status: &str) -> Option<TestOutcome> {
    let status = status.trim();
    if status.starts_with("ok") {
        Some(TestOutcome::Passed)
    } else if status.starts_with("FAIL") || status.starts_with("unexpected success") {
        Some(TestOutcome::Failed)
    } else if status.starts_with("ERROR") {
        Some(TestOutcome::Error)
    } else if status.starts_with("skipped") || status.starts_with("expected failure") {
        Some(TestOutcome::Skipped)
    } else {
        None
    }
}

fn status_after_dots(text: &str) -> Option<&str> {
    text.rsplit_once(" ... ").map(|(_, status)| status)
}

impl ExecutionAdapter for DjangoAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Django
    }

    fn selector(&self, target: &TestTarget) -> String {
        match target {
            TestTarget::Explicit { id } => match TEST_LINE.captures(id.trim()) {
                Some(caps) if caps[3].trim().is_empty() => dotted_label(&caps[1], &caps[2]),
                _ => id.trim().to_string(),
            },
            TestTarget::File {
                path,
                class,
                function,
            } => {
                let mut label = self.module_label(path);
                if label.is_empty() {
                    return label;
                }
                if let Some(class) = class {
                    label.push('.');
                    label.push_str(class);
                    if let Some(function) = function {
                        label.push('.');
                        label.push_str(function);
                    }
                }
                label
            }
            TestTarget::Directory { path } => self.module_label(path),
        }
    }

    fn build_command(&self, selectors: &[String]) -> Invocation {
        let (mut argv, cwd, pythonpath) = match self.entry {
            DjangoEntry::RunTests => (
                vec![
                    PYTHON.to_string(),
                    "runtests.py".to_string(),
                    "--verbosity=2".to_string(),
                    "--noinput".to_string(),
                    "--parallel=1".to_string(),
                ],
                Some(self.test_root.clone()),
                vec![".".to_string()],
            ),
            DjangoEntry::ManagePy => (
                vec![
                    PYTHON.to_string(),
                    "manage.py".to_string(),
                    "test".to_string(),
                    "--verbosity=2".to_string(),
                    "--noinput".to_string(),
                ],
                None,
                Vec::new(),
            ),
        };
        argv.extend(selectors.iter().cloned());

        Invocation {
            argv,
            env: vec![
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
                ("PYTHONNOUSERSITE".to_string(), "1".to_string()),
            ],
            cwd,
            pythonpath,
        }
    }

    fn parse_output(&self, raw: &str) -> TestResult {
        let mut per_test = BTreeMap::new();
        let mut pending: Option<String> = None;
        let mut ran: Option<(u32, f64)> = None;
        let mut final_status: Option<(bool, BTreeMap<String, u32>)> = None;

        for line in raw.lines() {
            if let Some(caps) = TEST_LINE.captures(line) {
                let label = dotted_label(&caps[1], &caps[2]);
                match status_after_dots(&caps[3]).and_then(outcome_from) {
                    Some(outcome) => {
                        merge_outcome(&mut per_test, label, outcome);
                        pending = None;
                    }
                    // Docstring on the next line carries the status.
                    None => pending = Some(label),
                }
                continue;
            }

            if let Some(label) = pending.take() {
                if let Some(outcome) = status_after_dots(line).and_then(outcome_from) {
                    merge_outcome(&mut per_test, label, outcome);
                    continue;
                }
            }

            if let Some(caps) = RAN.captures(line) {
                let total = caps[1].parse().unwrap_or(0);
                let secs = caps[2].parse().unwrap_or(0.0);
                ran = Some((total, secs));
                continue;
            }

            if ran.is_some() {
                if let Some(caps) = FINAL_STATUS.captures(line) {
                    let counts = caps
                        .get(2)
                        .map(|m| {
                            STATUS_COUNT
                                .captures_iter(m.as_str())
                                .map(|c| (c[1].to_string(), c[2].parse().unwrap_or(0)))
                                .collect()
                        })
                        .unwrap_or_default();
                    final_status = Some((&caps[1] == "OK", counts));
                }
            }
        }

        let mut result = TestResult {
            raw_output: raw.to_string(),
            ..Default::default()
        };

        match (ran, final_status) {
            (Some((total, secs)), Some((_, counts))) => {
                let get = |k: &str| counts.get(k).copied().unwrap_or(0);
                result.failed = get("failures").saturating_add(get("unexpected successes"));
                result.errors = get("errors");
                result.skipped = get("skipped").saturating_add(get("expected failures"));
                result.passed = total.saturating_sub(
                    result
                        .failed
                        .saturating_add(result.errors)
                        .saturating_add(result.skipped),
                );
                result.collected = total;
                result.duration = secs;
            }
            (ran, _) => {
                for outcome in per_test.values() {
                    match outcome {
                        TestOutcome::Passed => result.passed += 1,
                        TestOutcome::Failed => result.failed += 1,
                        TestOutcome::Error => result.errors += 1,
                        TestOutcome::Skipped => result.skipped += 1,
                    }
                }
                result.collected = ran.map_or(per_test.len() as u32, |(total, _)| total);
                result.duration = ran.map_or(0.0, |(_, secs)| secs);
                // A crash before the runner reported anything is an error,
                // never a vacuous pass.
                if result.executed() == 0 && raw.contains("Traceback") {
                    result.errors = 1;
                }
            }
        }

        result.per_test = per_test;
        result
    }
}
