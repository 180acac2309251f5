//! Execution adapters.
//!
//! One adapter per test-framework family. An adapter turns resolved
//! [`TestTarget`]s into a command line and turns the framework's output back
//! into a [`TestResult`]. Adapters never touch the filesystem; anything they
//! need to know about the sandbox is passed in when they are built.

pub mod django;
pub mod pytest;
pub mod repair;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{AdapterKind, RepoId, TestResult, TestTarget};

pub use django::DjangoAdapter;
pub use pytest::PytestAdapter;
pub use repair::{RepairTable, missing_module};

/// Interpreter placeholder; executors substitute their configured Python.
pub const PYTHON: &str = "python";

/// A command to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    /// Program and arguments. `argv[0]` is [`PYTHON`] for every adapter.
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory relative to the sandbox root.
    pub cwd: Option<String>,
    /// Entries to prepend to `PYTHONPATH`, relative to the sandbox root.
    pub pythonpath: Vec<String>,
}

/// Framework-specific command construction and output parsing.
pub trait ExecutionAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Render a target as the identifier the framework accepts on its
    /// command line. Returns an empty string when the target cannot be
    /// addressed without widening to the whole suite.
    fn selector(&self, target: &TestTarget) -> String;

    fn build_command(&self, selectors: &[String]) -> Invocation;

    fn parse_output(&self, raw: &str) -> TestResult;
}

/// Options shared by all adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    /// Directory dotted test labels are relative to.
    pub test_root: String,
    /// Extra arguments appended to pytest invocations.
    pub pytest_args: Vec<String>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            test_root: "tests".to_string(),
            pytest_args: Vec::new(),
        }
    }
}

/// Build the adapter for a framework family.
///
/// `has_manage_py` selects the Django entry point and is ignored otherwise.
pub fn build_adapter(
    kind: AdapterKind,
    options: &AdapterOptions,
    has_manage_py: bool,
) -> Box<dyn ExecutionAdapter> {
    match kind {
        AdapterKind::Pytest => Box::new(PytestAdapter::new(options.pytest_args.clone())),
        AdapterKind::Django => {
            Box::new(DjangoAdapter::new(options.test_root.clone(), has_manage_py))
        }
    }
}

/// Maps repositories to adapter kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTable {
    by_repo: BTreeMap<String, AdapterKind>,
    fallback: AdapterKind,
}

impl Default for AdapterTable {
    fn default() -> Self {
        let mut by_repo = BTreeMap::new();
        by_repo.insert("django/django".to_string(), AdapterKind::Django);
        Self {
            by_repo,
            fallback: AdapterKind::Pytest,
        }
    }
}

impl AdapterTable {
    /// Default table extended (or overridden) by configured entries.
    pub fn with_overrides(overrides: &BTreeMap<String, AdapterKind>) -> Self {
        let mut table = Self::default();
        for (repo, kind) in overrides {
            table.by_repo.insert(repo.to_ascii_lowercase(), *kind);
        }
        table
    }

    pub fn kind_for(&self, repo: &RepoId) -> AdapterKind {
        let slug = repo.slug.to_ascii_lowercase();
        let slug = slug.trim_end_matches(".git");
        self.by_repo
            .iter()
            .find(|(name, _)| slug == name.as_str() || slug.ends_with(&format!("/{name}")))
            .map_or(self.fallback, |(_, kind)| *kind)
    }
}
