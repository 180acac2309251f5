//! Verdict derivation for the before/after validation contract.
//!
//! Run A applies only the test diff; run B applies the fix and the test
//! diff. A patch meets the contract when every target fails in A and passes
//! in B. Per-test outcomes are preferred; when they cannot be mapped onto the
//! targets the aggregate `(passed > 0, failed == 0, errors == 0)` triple is
//! used instead, never a single counter. On that path run A only counts as
//! reproducing the bug when nothing in it passed.

use serde::{Deserialize, Serialize};

use crate::types::{TestOutcome, TestResult, VerdictBasis, VerdictKind};

/// State of one target within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// At least one matching test passed and none failed.
    Passing,
    /// A matching test failed or errored.
    Failing,
    /// Every matching test was skipped.
    Skipped,
    /// No reported test matches the target.
    Missing,
}

/// Whether a per-test key belongs to a selector.
///
/// `tests/a.py` covers `tests/a.py::test_x`, `pkg.tests` covers
/// `pkg.tests.T.test_x`, and `a.py::test_p` covers `a.py::test_p[1]`.
pub fn selector_covers(selector: &str, key: &str) -> bool {
    if selector.is_empty() {
        return false;
    }
    match key.strip_prefix(selector) {
        Some("") => true,
        Some(rest) => rest.starts_with("::") || rest.starts_with('.') || rest.starts_with('[') || rest.starts_with('/'),
        None => false,
    }
}

pub fn target_state(selector: &str, result: &TestResult) -> TargetState {
    let mut any = false;
    let mut passed = false;
    for (_, outcome) in result
        .per_test
        .iter()
        .filter(|(key, _)| selector_covers(selector, key))
    {
        any = true;
        match outcome {
            TestOutcome::Failed | TestOutcome::Error => return TargetState::Failing,
            TestOutcome::Passed => passed = true,
            TestOutcome::Skipped => {}
        }
    }
    match (any, passed) {
        (false, _) => TargetState::Missing,
        (true, true) => TargetState::Passing,
        (true, false) => TargetState::Skipped,
    }
}

/// Per-target comparison, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetComparison {
    pub selector: String,
    pub before: TargetState,
    pub after: TargetState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: VerdictKind,
    pub basis: VerdictBasis,
    pub targets: Vec<TargetComparison>,
}

/// Derive the contract verdict for two completed runs.
pub fn evaluate(selectors: &[String], before: &TestResult, after: &TestResult) -> Evaluation {
    let targets: Vec<TargetComparison> = selectors
        .iter()
        .map(|s| TargetComparison {
            selector: s.clone(),
            before: target_state(s, before),
            after: target_state(s, after),
        })
        .collect();

    let mappable = !targets.is_empty()
        && targets
            .iter()
            .all(|t| t.before != TargetState::Missing || t.after != TargetState::Missing);

    // A run in which nothing executed is never read as "failed".
    if before.executed() == 0 {
        let basis = if mappable {
            VerdictBasis::PerTest
        } else {
            VerdictBasis::Aggregate
        };
        return Evaluation {
            verdict: VerdictKind::NotReproducible,
            basis,
            targets,
        };
    }

    let verdict = if mappable {
        per_test_verdict(&targets, before)
    } else {
        aggregate_verdict(before, after)
    };

    Evaluation {
        verdict,
        basis: if mappable {
            VerdictBasis::PerTest
        } else {
            VerdictBasis::Aggregate
        },
        targets,
    }
}

fn per_test_verdict(targets: &[TargetComparison], before: &TestResult) -> VerdictKind {
    let failed_before = |t: &TargetComparison| match t.before {
        TargetState::Failing => true,
        // Collection errors hide individual tests.
        TargetState::Missing => before.errors > 0,
        TargetState::Passing | TargetState::Skipped => false,
    };

    if !targets.iter().all(failed_before) {
        return VerdictKind::NotReproducible;
    }
    if targets.iter().any(|t| t.after != TargetState::Passing) {
        return VerdictKind::FixIncomplete;
    }
    VerdictKind::ContractMet
}

fn aggregate_verdict(before: &TestResult, after: &TestResult) -> VerdictKind {
    // Counters cannot tell which test failed; any pass in A may be a target.
    if before.passed > 0 || !before.has_failures() {
        return VerdictKind::NotReproducible;
    }
    if !after.aggregate_passes() {
        return VerdictKind::FixIncomplete;
    }
    VerdictKind::ContractMet
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn run(outcomes: &[(&str, TestOutcome)]) -> TestResult {
        let per_test: BTreeMap<String, TestOutcome> = outcomes
            .iter()
            .map(|(k, o)| ((*k).to_string(), *o))
            .collect();
        let mut r = TestResult::default();
        for o in per_test.values() {
            match o {
                TestOutcome::Passed => r.passed += 1,
                TestOutcome::Failed => r.failed += 1,
                TestOutcome::Error => r.errors += 1,
                TestOutcome::Skipped => r.skipped += 1,
            }
        }
        r.collected = per_test.len() as u32;
        r.per_test = per_test;
        r
    }

    fn sel(s: &str) -> Vec<String> {
        vec![s.to_string()]
    }

    #[test]
    fn fails_then_passes_meets_contract() {
        let before = run(&[("t.py::test_foo", TestOutcome::Failed)]);
        let after = run(&[("t.py::test_foo", TestOutcome::Passed)]);
        let e = evaluate(&sel("t.py::test_foo"), &before, &after);
        assert_eq!(e.verdict, VerdictKind::ContractMet);
        assert_eq!(e.basis, VerdictBasis::PerTest);
    }

    #[test]
    fn passing_before_is_not_reproducible() {
        let before = run(&[("t.py::test_foo", TestOutcome::Passed)]);
        let after = run(&[("t.py::test_foo", TestOutcome::Passed)]);
        assert_eq!(
            evaluate(&sel("t.py::test_foo"), &before, &after).verdict,
            VerdictKind::NotReproducible
        );
    }

    #[test]
    fn failing_after_is_fix_incomplete() {
        let before = run(&[("t.py::test_foo", TestOutcome::Failed)]);
        let after = run(&[("t.py::test_foo", TestOutcome::Failed)]);
        assert_eq!(
            evaluate(&sel("t.py::test_foo"), &before, &after).verdict,
            VerdictKind::FixIncomplete
        );
    }

    #[test]
    fn not_reproducible_takes_precedence() {
        let before = run(&[
            ("t.py::test_a", TestOutcome::Passed),
            ("t.py::test_b", TestOutcome::Failed),
        ]);
        let after = run(&[
            ("t.py::test_a", TestOutcome::Failed),
            ("t.py::test_b", TestOutcome::Failed),
        ]);
        let selectors = vec!["t.py::test_a".to_string(), "t.py::test_b".to_string()];
        assert_eq!(
            evaluate(&selectors, &before, &after).verdict,
            VerdictKind::NotReproducible
        );
    }

    #[test]
    fn file_selector_aggregates_its_tests() {
        let before = run(&[
            ("t.py::test_a", TestOutcome::Passed),
            ("t.py::test_b", TestOutcome::Failed),
        ]);
        let after = run(&[
            ("t.py::test_a", TestOutcome::Passed),
            ("t.py::test_b", TestOutcome::Passed),
        ]);
        assert_eq!(
            evaluate(&sel("t.py"), &before, &after).verdict,
            VerdictKind::ContractMet
        );
    }

    #[test]
    fn collection_error_before_counts_as_failure() {
        let before = run(&[("t.py", TestOutcome::Error)]);
        let after = run(&[("t.py::test_new", TestOutcome::Passed)]);
        let e = evaluate(&sel("t.py::test_new"), &before, &after);
        assert_eq!(e.targets[0].before, TargetState::Missing);
        assert_eq!(e.verdict, VerdictKind::ContractMet);
    }

    #[test]
    fn missing_after_is_fix_incomplete() {
        let before = run(&[("t.py::test_a", TestOutcome::Failed)]);
        let after = run(&[("t.py::test_other", TestOutcome::Passed)]);
        assert_eq!(
            evaluate(&sel("t.py::test_a"), &before, &after).verdict,
            VerdictKind::FixIncomplete
        );
    }

    #[test]
    fn empty_before_run_is_never_read_as_failure() {
        let before = TestResult::default();
        let after = run(&[("t.py::test_a", TestOutcome::Passed)]);
        assert_eq!(
            evaluate(&sel("t.py::test_a"), &before, &after).verdict,
            VerdictKind::NotReproducible
        );
    }

    #[test]
    fn aggregate_fallback_uses_triple() {
        let before = TestResult {
            failed: 2,
            ..Default::default()
        };
        let mut after = TestResult {
            passed: 2,
            ..Default::default()
        };
        let e = evaluate(&sel("label"), &before, &after);
        assert_eq!(e.basis, VerdictBasis::Aggregate);
        assert_eq!(e.verdict, VerdictKind::ContractMet);

        after.errors = 1;
        assert_eq!(
            evaluate(&sel("label"), &before, &after).verdict,
            VerdictKind::FixIncomplete
        );

        // Passed alone is not enough for run B.
        let skipped_only = TestResult {
            skipped: 3,
            ..Default::default()
        };
        assert_eq!(
            evaluate(&sel("label"), &before, &skipped_only).verdict,
            VerdictKind::FixIncomplete
        );
    }

    #[test]
    fn aggregate_mixed_run_a_is_not_reproducible() {
        // Four passes and one failure: the target may be among the passes.
        let before = TestResult {
            passed: 4,
            failed: 1,
            ..Default::default()
        };
        let after = TestResult {
            passed: 5,
            ..Default::default()
        };
        let e = evaluate(&sel("tests/test_x.py"), &before, &after);
        assert_eq!(e.basis, VerdictBasis::Aggregate);
        assert_eq!(e.verdict, VerdictKind::NotReproducible);
    }

    #[test]
    fn aggregate_before_without_failures_is_not_reproducible() {
        let before = TestResult {
            passed: 2,
            ..Default::default()
        };
        let after = before.clone();
        assert_eq!(
            evaluate(&sel("x"), &before, &after).verdict,
            VerdictKind::NotReproducible
        );
    }

    #[test]
    fn selector_matching_rules() {
        assert!(selector_covers("t.py", "t.py::test_a"));
        assert!(selector_covers("t.py::test_p", "t.py::test_p[1]"));
        assert!(selector_covers("pkg.tests", "pkg.tests.T.test_a"));
        assert!(selector_covers("tests/io", "tests/io/test_a.py::test_b"));
        assert!(!selector_covers("pkg.tests", "pkg.tests_extra.T.test_a"));
        assert!(!selector_covers("t.py::test_a", "t.py::test_ab"));
        assert!(!selector_covers("", "anything"));
    }
}
