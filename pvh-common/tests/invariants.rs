//! Property tests for patch hygiene, target resolution, output parsing and
//! verdict derivation.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use pvh_common::adapter::{DjangoAdapter, ExecutionAdapter, PytestAdapter};
use pvh_common::contract::{TargetState, evaluate, target_state};
use pvh_common::patch::{clean_patch, combine};
use pvh_common::resolver::{self, CoarsePolicy, ResolutionPlan, ResolveInput};
use pvh_common::types::{TestOutcome, TestResult, TestTarget, VerdictKind};

fn outcome_strategy() -> impl Strategy<Value = TestOutcome> {
    prop_oneof![
        Just(TestOutcome::Passed),
        Just(TestOutcome::Failed),
        Just(TestOutcome::Error),
        Just(TestOutcome::Skipped),
    ]
}

/// A run over `tests/test_mod.py` with up to six named tests.
fn run_strategy() -> impl Strategy<Value = TestResult> {
    (
        prop::collection::btree_map(0u8..6, outcome_strategy(), 0..6),
        0u32..3,
    )
        .prop_map(|(outcomes, extra_errors)| {
            let mut result = TestResult::default();
            for (i, outcome) in outcomes {
                match outcome {
                    TestOutcome::Passed => result.passed += 1,
                    TestOutcome::Failed => result.failed += 1,
                    TestOutcome::Error => result.errors += 1,
                    TestOutcome::Skipped => result.skipped += 1,
                }
                result
                    .per_test
                    .insert(format!("tests/test_mod.py::test_{i}"), outcome);
            }
            result.errors += extra_errors;
            result.collected = result.per_test.len() as u32;
            result
        })
}

proptest! {
    #[test]
    fn clean_patch_is_idempotent(raw in "[a-z @+\\-`\r\n ]{0,200}") {
        let once = clean_patch(&raw);
        prop_assert_eq!(clean_patch(&once), once.clone());
        prop_assert!(!once.contains('\r'));
        prop_assert!(once.is_empty() || once.ends_with('\n'));
    }

    #[test]
    fn combine_keeps_both_sides(fix in "[a-z]{1,20}", tests in "[a-z]{1,20}") {
        let combined = combine(&fix, &tests);
        prop_assert!(combined.starts_with(&fix));
        prop_assert!(combined.trim_end().ends_with(&tests));
    }

    #[test]
    fn explicit_targets_are_trimmed_and_unique(ids in prop::collection::vec("[ a-z_/.:]{0,12}", 0..8)) {
        let input = ResolveInput { test_patch: "", explicit: Some(&ids) };
        let expected: BTreeSet<&str> = ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();

        match resolver::plan(&input, CoarsePolicy::DirectoryTestFiles) {
            Ok(ResolutionPlan::Resolved(resolution)) => {
                prop_assert_eq!(resolution.targets.len(), expected.len());
                prop_assert!(!resolution.coarse_grained);
                for target in &resolution.targets {
                    match target {
                        TestTarget::Explicit { id } => prop_assert!(expected.contains(id.as_str())),
                        other => prop_assert!(false, "unexpected target {:?}", other),
                    }
                }
            }
            Ok(ResolutionPlan::NeedsListing(_)) => prop_assert!(false, "explicit ids never need a listing"),
            // Blank lists count as absent and the empty diffs give nothing.
            Err(_) => prop_assert!(expected.is_empty()),
        }
    }

    #[test]
    fn contract_met_requires_fail_then_pass(before in run_strategy(), after in run_strategy(), picks in prop::collection::btree_set(0u8..6, 1..4)) {
        let selectors: Vec<String> = picks.iter().map(|i| format!("tests/test_mod.py::test_{i}")).collect();
        let evaluation = evaluate(&selectors, &before, &after);

        if evaluation.verdict == VerdictKind::ContractMet {
            prop_assert!(before.executed() > 0);
            for selector in &selectors {
                let was = target_state(selector, &before);
                prop_assert!(
                    was == TargetState::Failing || (was == TargetState::Missing && before.errors > 0),
                    "{} was {:?} before", selector, was
                );
                prop_assert_eq!(target_state(selector, &after), TargetState::Passing);
            }
        }
        prop_assert!(matches!(
            evaluation.verdict,
            VerdictKind::ContractMet | VerdictKind::NotReproducible | VerdictKind::FixIncomplete
        ));
    }

    #[test]
    fn empty_before_run_is_never_a_failure(after in run_strategy()) {
        let before = TestResult::default();
        let selectors = vec!["tests/test_mod.py".to_string()];
        prop_assert_eq!(evaluate(&selectors, &before, &after).verdict, VerdictKind::NotReproducible);
    }

    #[test]
    fn aggregate_contract_met_requires_a_clean_failure(
        before in (0u32..5, 0u32..5, 0u32..5),
        after in (0u32..5, 0u32..5, 0u32..5),
    ) {
        // No per-test outcomes: the verdict rests on counters alone.
        let counts = |(passed, failed, errors): (u32, u32, u32)| TestResult {
            passed,
            failed,
            errors,
            collected: passed + failed + errors,
            ..Default::default()
        };
        let (before, after) = (counts(before), counts(after));
        let selectors = vec!["tests/test_mod.py".to_string()];

        if evaluate(&selectors, &before, &after).verdict == VerdictKind::ContractMet {
            prop_assert_eq!(before.passed, 0);
            prop_assert!(before.failed + before.errors > 0);
            prop_assert!(after.passed > 0 && after.failed == 0 && after.errors == 0);
        }
    }

    #[test]
    fn test_diff_without_files_is_unresolvable(ids in prop::collection::vec(" {0,3}", 0..3)) {
        for policy in [CoarsePolicy::Disabled, CoarsePolicy::Directory, CoarsePolicy::DirectoryTestFiles] {
            let input = ResolveInput { test_patch: "", explicit: Some(&ids) };
            prop_assert!(resolver::plan(&input, policy).is_err());
            let input = ResolveInput { test_patch: "not a diff at all\n", explicit: None };
            prop_assert!(resolver::plan(&input, policy).is_err());
        }
    }

    #[test]
    fn pytest_parser_accepts_arbitrary_output(raw in "(?s).{0,400}") {
        let result = PytestAdapter::new(Vec::new()).parse_output(&raw);
        prop_assert!(result.collected >= result.per_test.len() as u32);
        prop_assert_eq!(result.raw_output, raw);
    }

    #[test]
    fn django_parser_accepts_arbitrary_output(raw in "(?s).{0,400}") {
        let result = DjangoAdapter::new("tests".to_string(), false).parse_output(&raw);
        prop_assert_eq!(result.raw_output, raw);
    }

    #[test]
    fn pytest_summary_counts_round_trip(passed in 0u32..50, failed in 0u32..50, secs in 0u32..500) {
        prop_assume!(passed + failed > 0);
        let mut parts = Vec::new();
        if failed > 0 {
            parts.push(format!("{failed} failed"));
        }
        if passed > 0 {
            parts.push(format!("{passed} passed"));
        }
        let raw = format!(
            "collected {} items\nsome tests here\n===== {} in {}.00s =====\n",
            passed + failed,
            parts.join(", "),
            secs
        );
        let result = PytestAdapter::new(Vec::new()).parse_output(&raw);
        prop_assert_eq!((result.passed, result.failed, result.errors), (passed, failed, 0));
        prop_assert_eq!(result.collected, passed + failed);
    }
}

#[test]
fn data_only_diff_widens_to_listed_test_files() {
    let test_patch = "\
diff --git a/tests/fixtures/data.json b/tests/fixtures/data.json
--- a/tests/fixtures/data.json
+++ b/tests/fixtures/data.json
@@ -1 +1 @@
-{}
+{\"a\": 1}
";
    let input = ResolveInput {
        test_patch,
        explicit: None,
    };

    let request = match resolver::plan(&input, CoarsePolicy::DirectoryTestFiles).unwrap() {
        ResolutionPlan::NeedsListing(request) => request,
        other => panic!("expected a listing request, got {other:?}"),
    };
    assert_eq!(request.directories, vec!["tests/fixtures"]);

    let mut listings = BTreeMap::new();
    listings.insert(
        "tests/fixtures".to_string(),
        vec![
            "data.json".to_string(),
            "test_loader.py".to_string(),
            "conftest.py".to_string(),
        ],
    );
    let resolution = resolver::complete(&request, &listings).unwrap();
    assert!(resolution.coarse_grained);
    assert_eq!(
        resolution.targets,
        vec![TestTarget::file("tests/fixtures/test_loader.py")]
    );

    // Nothing next to the data: unresolvable, never "run everything".
    let empty = BTreeMap::new();
    assert!(resolver::complete(&request, &empty).is_err());
    assert!(resolver::plan(&input, CoarsePolicy::Disabled).is_err());
}
