//! `PVH_*` environment overrides.
//!
//! Every reader returns `None` when the variable is unset or empty, so the
//! caller keeps its file value. Bad values are collected rather than failing
//! on the first one, so a misconfigured host sees every problem at once.

use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Reads overrides for one configuration pass.
#[derive(Debug, Default)]
pub struct EnvOverrides {
    errors: Vec<EnvError>,
    applied: Vec<String>,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Variables that produced a usable value, in read order.
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    pub fn into_result(self) -> Result<Vec<String>, Vec<EnvError>> {
        if self.errors.is_empty() {
            Ok(self.applied)
        } else {
            Err(self.errors)
        }
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var = format!("PVH_{name}");
        match env::var(&var) {
            Ok(value) if !value.trim().is_empty() => Some((var, value)),
            _ => None,
        }
    }

    fn accept<T>(&mut self, var: String, value: T) -> Option<T> {
        debug!(var = %var, "Applying environment override");
        self.applied.push(var);
        Some(value)
    }

    fn reject(&mut self, var: String, expected: &str, value: String) {
        self.errors.push(EnvError::InvalidValue {
            var,
            expected: expected.to_string(),
            value,
        });
    }

    pub fn text(&mut self, name: &str) -> Option<String> {
        let (var, value) = self.raw(name)?;
        self.accept(var, value)
    }

    /// A path with a leading `~/` expanded.
    pub fn path(&mut self, name: &str) -> Option<PathBuf> {
        let (var, value) = self.raw(name)?;
        self.accept(var, expand_home(value.trim()))
    }

    pub fn number(&mut self, name: &str, range: RangeInclusive<u64>) -> Option<u64> {
        let (var, value) = self.raw(name)?;
        match value.trim().parse::<u64>() {
            Ok(n) if range.contains(&n) => self.accept(var, n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n,
                    min: *range.start(),
                    max: *range.end(),
                });
                None
            }
            Err(_) => {
                self.reject(var, "unsigned integer", value);
                None
            }
        }
    }

    /// Accepts 1/true/yes/on and 0/false/no/off.
    pub fn flag(&mut self, name: &str) -> Option<bool> {
        let (var, value) = self.raw(name)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => self.accept(var, true),
            "0" | "false" | "no" | "off" => self.accept(var, false),
            _ => {
                self.reject(var, "boolean (true/false/1/0/yes/no)", value);
                None
            }
        }
    }

    /// A value from a fixed vocabulary, such as a backend kind.
    pub fn choice<T>(
        &mut self,
        name: &str,
        expected: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Option<T> {
        let (var, value) = self.raw(name)?;
        match parse(value.trim()) {
            Some(parsed) => self.accept(var, parsed),
            None => {
                self.reject(var, expected, value);
                None
            }
        }
    }

    /// A bare `tracing` level, lowercased.
    pub fn log_level(&mut self, name: &str) -> Option<String> {
        self.choice(name, "trace, debug, info, warn, error or off", |v| {
            let lower = v.to_ascii_lowercase();
            matches!(
                lower.as_str(),
                "trace" | "debug" | "info" | "warn" | "error" | "off"
            )
            .then_some(lower)
        })
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(stripped) => match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use serial_test::serial;

    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = env_test_lock();
        for (key, value) in vars {
            // SAFETY: env mutation is serialized by env_test_lock
            unsafe { env::set_var(key, value) };
        }
        let result = f();
        for (key, _) in vars {
            // SAFETY: env mutation is serialized by env_test_lock
            unsafe { env::remove_var(key) };
        }
        result
    }

    #[test]
    #[serial]
    fn test_unset_and_blank_keep_file_values() {
        let (text, number) = with_env(&[("PVH_LISTEN", "  ")], || {
            let mut env = EnvOverrides::new();
            (env.text("LISTEN"), env.number("MAX_ATTEMPTS", 1..=10))
        });
        assert_eq!(text, None);
        assert_eq!(number, None);
    }

    #[test]
    #[serial]
    fn test_number_range_is_enforced() {
        let env = with_env(&[("PVH_CAPACITY", "5000"), ("PVH_QUEUE_DEPTH", " 8 ")], || {
            let mut env = EnvOverrides::new();
            assert_eq!(env.number("CAPACITY", 1..=1024), None);
            assert_eq!(env.number("QUEUE_DEPTH", 0..=4096), Some(8));
            env
        });
        assert_eq!(env.applied(), ["PVH_QUEUE_DEPTH"]);
        assert!(matches!(
            env.errors(),
            [EnvError::OutOfRange { value: 5000, max: 1024, .. }]
        ));
        assert!(env.into_result().is_err());
    }

    #[test]
    #[serial]
    fn test_flag_values() {
        for (raw, expected) in [("yes", Some(true)), ("OFF", Some(false)), ("1", Some(true))] {
            let value = with_env(&[("PVH_DEPENDENCY_REPAIR", raw)], || {
                EnvOverrides::new().flag("DEPENDENCY_REPAIR")
            });
            assert_eq!(value, expected, "for '{raw}'");
        }

        let env = with_env(&[("PVH_DEPENDENCY_REPAIR", "maybe")], || {
            let mut env = EnvOverrides::new();
            assert_eq!(env.flag("DEPENDENCY_REPAIR"), None);
            env
        });
        assert_eq!(env.errors().len(), 1);
    }

    #[test]
    #[serial]
    fn test_log_level_and_choice() {
        let env = with_env(
            &[("PVH_LOG_LEVEL", "DEBUG"), ("PVH_LOG_FORMAT", "xml")],
            || {
                let mut env = EnvOverrides::new();
                assert_eq!(env.log_level("LOG_LEVEL").as_deref(), Some("debug"));
                let format = env.choice("LOG_FORMAT", "pretty, compact or json", |v| {
                    (v == "json").then_some(())
                });
                assert_eq!(format, None);
                env
            },
        );
        let errors = env.into_result().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("PVH_LOG_FORMAT"));
    }

    #[test]
    #[serial]
    fn test_path_expands_home() {
        let path = with_env(&[("PVH_CACHE_DIR", "~/pvh-cache")], || {
            EnvOverrides::new().path("CACHE_DIR")
        });
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, Some(home.join("pvh-cache")));
        }
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
}
