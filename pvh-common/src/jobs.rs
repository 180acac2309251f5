//! Job files: one validation job per JSON line.
//!
//! SWE-bench field names are accepted: `repo` for `repository`,
//! `FAIL_TO_PASS` for `target_tests` (as a list or a JSON-encoded string),
//! `model_patch` for `patch`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::errors::{ErrorCode, RetryableError};
use crate::types::{JobStatus, ValidationJob};

#[derive(Debug, Error)]
pub enum JobFileError {
    #[error("failed to read job file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Invalid { line: usize, message: String },
}

impl RetryableError for JobFileError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Invalid { .. } => ErrorCode::ConfigInvalidJob,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobLine {
    instance_id: String,
    #[serde(alias = "repo")]
    repository: String,
    base_commit: String,
    #[serde(default, alias = "model_patch")]
    patch: String,
    #[serde(default)]
    test_patch: String,
    #[serde(default, alias = "FAIL_TO_PASS", deserialize_with = "list_or_encoded")]
    target_tests: Option<Vec<String>>,
    #[serde(default, alias = "timeout")]
    timeout_secs: Option<u64>,
}

/// Accept `["a", "b"]`, `"[\"a\", \"b\"]"`, a bare `"a"`, or null.
fn list_or_encoded<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::List(list)) => Some(list),
        Some(Raw::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else if trimmed.starts_with('[') {
                Some(serde_json::from_str(trimmed).map_err(serde::de::Error::custom)?)
            } else {
                Some(vec![trimmed.to_string()])
            }
        }
    })
}

/// Parse job file content. Blank lines and `#` comments are skipped.
pub fn parse_jobs(content: &str, default_timeout_secs: u64) -> Result<Vec<ValidationJob>, JobFileError> {
    let mut jobs = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: JobLine = serde_json::from_str(trimmed).map_err(|e| JobFileError::Invalid {
            line,
            message: e.to_string(),
        })?;

        let invalid = |message: &str| JobFileError::Invalid {
            line,
            message: message.to_string(),
        };
        if parsed.instance_id.trim().is_empty() {
            return Err(invalid("instance_id is empty"));
        }
        if parsed.repository.trim().is_empty() {
            return Err(invalid("repository is empty"));
        }
        if parsed.base_commit.trim().is_empty() {
            return Err(invalid("base_commit is empty"));
        }
        if !seen.insert(parsed.instance_id.clone()) {
            return Err(JobFileError::Invalid {
                line,
                message: format!("duplicate instance_id {}", parsed.instance_id),
            });
        }

        jobs.push(ValidationJob {
            instance_id: parsed.instance_id,
            repository: parsed.repository.trim().to_string(),
            base_commit: parsed.base_commit.trim().to_string(),
            patch: parsed.patch,
            test_patch: parsed.test_patch,
            target_tests: parsed.target_tests.filter(|t| !t.is_empty()),
            timeout_secs: parsed
                .timeout_secs
                .filter(|t| *t > 0)
                .unwrap_or(default_timeout_secs),
            attempts: 0,
            status: JobStatus::Pending,
        });
    }

    Ok(jobs)
}

pub fn load_jobs(path: &Path, default_timeout_secs: u64) -> Result<Vec<ValidationJob>, JobFileError> {
    let content = std::fs::read_to_string(path).map_err(|source| JobFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_jobs(&content, default_timeout_secs)
}
