//! Durable result store.
//!
//! Every completed attempt is appended to a JSONL file, flushed and synced
//! before the orchestrator moves on. Records are never rewritten; the last
//! terminal record of an instance is its verdict.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use pvh_common::errors::{ErrorCode, RetryableError};
use pvh_common::types::ResultRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions as AsyncOpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode result record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RetryableError for StoreError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn code(&self) -> ErrorCode {
        ErrorCode::InternalResultStore
    }
}

/// Append-only store of [`ResultRecord`]s.
#[derive(Debug, Default)]
pub struct ResultStore {
    path: Option<PathBuf>,
    records: RwLock<Vec<ResultRecord>>,
}

impl ResultStore {
    /// A store that keeps records in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or start) the store at `path`, loading existing records.
    ///
    /// Lines that fail to parse, such as a torn final write, are skipped.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut records = Vec::new();
        match File::open(path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line.map_err(io_err)?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ResultRecord>(&line) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!("Skipping invalid result line: {}", e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(e)),
        }

        debug!("Loaded {} result records from {:?}", records.len(), path);
        Ok(Self {
            path: Some(path.to_path_buf()),
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist one record. Returns only after the line is on disk.
    pub async fn append(&self, record: ResultRecord) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            let io_err = |source| StoreError::Io {
                path: path.clone(),
                source,
            };
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');

            let mut file = AsyncOpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(io_err)?;
            file.write_all(line.as_bytes()).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
            file.sync_data().await.map_err(io_err)?;
        }

        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instances that already have a terminal record.
    pub fn terminal_instances(&self) -> HashSet<String> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.terminal)
            .map(|r| r.instance_id.clone())
            .collect()
    }

    /// Summarise the records of `instances` (all records when `None`).
    pub fn summary(
        &self,
        instances: Option<&HashSet<String>>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> RunSummary {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let wanted = |r: &&ResultRecord| instances.is_none_or(|set| set.contains(&r.instance_id));

        let mut summary = RunSummary {
            total_jobs: 0,
            terminal: 0,
            attempts: 0,
            coarse_grained: 0,
            by_verdict: BTreeMap::new(),
            by_repository: BTreeMap::new(),
            by_worker: BTreeMap::new(),
            duration_secs: (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            started_at: started_at.to_rfc3339(),
            finished_at: finished_at.to_rfc3339(),
        };

        let mut seen = HashSet::new();
        let mut finals: BTreeMap<&str, &ResultRecord> = BTreeMap::new();
        for record in records.iter().filter(wanted) {
            seen.insert(record.instance_id.as_str());
            summary.attempts += 1;
            if record.terminal {
                finals.insert(record.instance_id.as_str(), record);
            }
        }
        summary.total_jobs = instances.map_or(seen.len(), HashSet::len);

        for record in finals.values() {
            summary.terminal += 1;
            if record.coarse_grained {
                summary.coarse_grained += 1;
            }
            let verdict = record.verdict.as_str().to_string();
            *summary.by_verdict.entry(verdict.clone()).or_default() += 1;
            *summary
                .by_repository
                .entry(record.repository.clone())
                .or_default()
                .entry(verdict)
                .or_default() += 1;
            *summary
                .by_worker
                .entry(record.worker_identity.to_string())
                .or_default() += 1;
        }
        summary
    }
}

/// Totals for one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_jobs: usize,
    /// Jobs with a terminal record.
    pub terminal: usize,
    /// Records written, terminal or not.
    pub attempts: usize,
    pub coarse_grained: usize,
    pub by_verdict: BTreeMap<String, usize>,
    pub by_repository: BTreeMap<String, BTreeMap<String, usize>>,
    /// Terminal records per worker.
    pub by_worker: BTreeMap<String, usize>,
    pub duration_secs: f64,
    pub started_at: String,
    pub finished_at: String,
}

impl RunSummary {
    /// Jobs that never reached a terminal record.
    pub fn pending(&self) -> usize {
        self.total_jobs.saturating_sub(self.terminal)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `results.jsonl` -> `results.summary.json`.
pub fn summary_path_for(results: &Path) -> PathBuf {
    results.with_extension("summary.json")
}
