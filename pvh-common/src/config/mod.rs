//! Configuration system for PVH.
//!
//! TOML files for the orchestrator, executors and the worker fleet, with
//! `PVH_*` environment overrides on top.

pub mod env;
pub mod file;

pub use env::{EnvError, EnvOverrides};
pub use file::{
    BackendKind, ConfigError, ExecutorConfig, HealthSettings, OrchestratorConfig, PvhConfig,
    WorkersFile, config_dir, load_workers,
};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
