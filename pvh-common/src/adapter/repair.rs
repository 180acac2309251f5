//! Dependency auto-repair.
//!
//! When a run dies on a missing module, the executor installs the package
//! that provides it and re-runs exactly once. Import names do not always
//! match distribution names, so the mapping is an explicit table.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:ModuleNotFoundError|ImportError): No module named '?([A-Za-z_][\w.]*)'?")
        .expect("missing module regex is valid")
});

/// Top-level name of the first module reported missing in `raw`.
pub fn missing_module(raw: &str) -> Option<String> {
    MISSING_MODULE
        .captures(raw)
        .and_then(|caps| caps[1].split('.').next().map(str::to_string))
        .filter(|m| !m.is_empty())
}

const DEFAULT_PACKAGES: &[(&str, &str)] = &[
    ("PIL", "Pillow"),
    ("yaml", "PyYAML"),
    ("backports", "backports.zoneinfo"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("sklearn", "scikit-learn"),
    ("attr", "attrs"),
    ("jinja2", "Jinja2"),
    ("pytz", "pytz"),
    ("numpy", "numpy"),
    ("sqlparse", "sqlparse"),
    ("asgiref", "asgiref"),
];

/// Module name to installable package name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairTable {
    packages: BTreeMap<String, String>,
}

impl Default for RepairTable {
    fn default() -> Self {
        Self {
            packages: DEFAULT_PACKAGES
                .iter()
                .map(|(m, p)| ((*m).to_string(), (*p).to_string()))
                .collect(),
        }
    }
}

impl RepairTable {
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut table = Self::default();
        table
            .packages
            .extend(overrides.iter().map(|(m, p)| (m.clone(), p.clone())));
        table
    }

    /// Package to install for `module`; unknown modules install under
    /// their own name.
    pub fn package_for(&self, module: &str) -> String {
        self.packages
            .get(module)
            .cloned()
            .unwrap_or_else(|| module.to_string())
    }
}
