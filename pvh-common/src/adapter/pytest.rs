//! Generic adapter for pytest-compatible suites.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{ExecutionAdapter, Invocation, PYTHON};
use crate::types::{AdapterKind, TestOutcome, TestResult, TestTarget};

static VERBOSE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+::\S+)\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\b")
        .expect("verbose line regex is valid")
});

static SHORT_SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(PASSED|FAILED|ERROR|XFAIL|XPASS) (\S+\.py\S*)")
        .expect("short summary regex is valid")
});

static ELAPSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bin (\d+(?:\.\d+)?)s\b").expect("elapsed regex is valid")
});

static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed|deselected|warnings?)\b")
        .expect("count regex is valid")
});

static COLLECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"collected (\d+) items?").expect("collected regex is valid"));

pub struct PytestAdapter {
    extra_args: Vec<String>,
}

impl PytestAdapter {
    pub fn new(extra_args: Vec<String>) -> Self {
        Self { extra_args }
    }
}

/// Keep the worst outcome when a test reports more than once
/// (e.g. passed in call, errored in teardown).
pub(crate) fn merge_outcome(map: &mut BTreeMap<String, TestOutcome>, key: String, outcome: TestOutcome) {
    fn rank(o: TestOutcome) -> u8 {
        match o {
            TestOutcome::Skipped => 0,
            TestOutcome::Passed => 1,
            TestOutcome::Failed => 2,
            TestOutcome::Error => 3,
        }
    }
    map.entry(key)
        .and_modify(|existing| {
            if rank(outcome) > rank(*existing) {
                *existing = outcome;
            }
        })
        .or_insert(outcome);
}

fn outcome_from(word: &str) -> TestOutcome {
    match word {
        "PASSED" | "XPASS" => TestOutcome::Passed,
        "FAILED" => TestOutcome::Failed,
        "ERROR" => TestOutcome::Error,
        _ => TestOutcome::Skipped,
    }
}

#[derive(Debug, Default)]
struct Summary {
    passed: u32,
    failed: u32,
    errors: u32,
    skipped: u32,
    elapsed: f64,
}

/// Pick the summary line: the last line carrying both an elapsed time and
/// outcome counts. Every line is checked; a line that merely mentions
/// "tests" is never enough.
fn find_summary(raw: &str) -> Option<Summary> {
    raw.lines().rev().find_map(|line| {
        let body = line.trim().trim_matches('=').trim();
        let elapsed = ELAPSED.captures(body)?;
        let no_tests = body.contains("no tests ran");
        if !no_tests && !COUNT.is_match(body) {
            return None;
        }

        let mut summary = Summary {
            elapsed: elapsed[1].parse().unwrap_or(0.0),
            ..Default::default()
        };
        for caps in COUNT.captures_iter(body) {
            let n: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passed" | "xpassed" => summary.passed = summary.passed.saturating_add(n),
                "failed" => summary.failed = summary.failed.saturating_add(n),
                "error" | "errors" => summary.errors = summary.errors.saturating_add(n),
                "skipped" | "xfailed" => summary.skipped = summary.skipped.saturating_add(n),
                _ => {}
            }
        }
        Some(summary)
    })
}

impl ExecutionAdapter for PytestAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Pytest
    }

    fn selector(&self, target: &TestTarget) -> String {
        match target {
            TestTarget::Explicit { id } => id.clone(),
            TestTarget::File {
                path,
                class,
                function,
            } => {
                let mut s = path.clone();
                for part in [class, function].into_iter().flatten() {
                    s.push_str("::");
                    s.push_str(part);
                }
                s
            }
            TestTarget::Directory { path } => path.clone(),
        }
    }

    fn build_command(&self, selectors: &[String]) -> Invocation {
        let mut argv: Vec<String> = [PYTHON, "-m", "pytest", "-rA", "-v", "--tb=short", "-p", "no:cacheprovider"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        argv.extend(self.extra_args.iter().cloned());
        argv.extend(selectors.iter().cloned());

        Invocation {
            argv,
            env: vec![
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
                ("PYTHONNOUSERSITE".to_string(), "1".to_string()),
            ],
            cwd: None,
            pythonpath: Vec::new(),
        }
    }

    fn parse_output(&self, raw: &str) -> TestResult {
        let mut per_test = BTreeMap::new();
        for line in raw.lines() {
            if let Some(caps) = VERBOSE_LINE.captures(line) {
                merge_outcome(&mut per_test, caps[1].to_string(), outcome_from(&caps[2]));
            } else if let Some(caps) = SHORT_SUMMARY_LINE.captures(line) {
                merge_outcome(&mut per_test, caps[2].to_string(), outcome_from(&caps[1]));
            }
        }

        let mut result = TestResult {
            raw_output: raw.to_string(),
            ..Default::default()
        };

        match find_summary(raw) {
            Some(summary) => {
                result.passed = summary.passed;
                result.failed = summary.failed;
                result.errors = summary.errors;
                result.skipped = summary.skipped;
                result.duration = summary.elapsed;
            }
            None => {
                for outcome in per_test.values() {
                    match outcome {
                        TestOutcome::Passed => result.passed += 1,
                        TestOutcome::Failed => result.failed += 1,
                        TestOutcome::Error => result.errors += 1,
                        TestOutcome::Skipped => result.skipped += 1,
                    }
                }
            }
        }

        if raw.contains("ERROR collecting")
            || raw.contains("INTERNALERROR>")
            || raw.contains("ImportError while importing test module")
        {
            result.errors = result.errors.max(1);
        }

        let reported = result
            .passed
            .saturating_add(result.failed)
            .saturating_add(result.skipped);
        result.collected = COLLECTED
            .captures_iter(raw)
            .last()
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0)
            .max(reported)
            .max(per_test.len() as u32);
        result.per_test = per_test;
        result
    }
}
