use crate::record::{ClassLabel, ImageRecord, SplitName};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use thiserror::Error;

pub const NORMALIZED_MANIFEST: &str = "normalized.manifest";
pub const DEDUP_MANIFEST: &str = "dedup.manifest";
pub const SPLIT_MANIFEST: &str = "split.manifest";
const LATEST_POINTER: &str = "LATEST";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed entry at {path}:{line}: {cause}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        cause: serde_json::Error,
    },

    #[error("no completed run recorded under {0}")]
    NoRuns(PathBuf),
}

/// Run identifier derived from the wall clock; manifests of later runs sort
/// after earlier ones.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%dT%H%M%SZ"))
}

/// One line of `normalized.manifest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub run_id: String,
    pub recorded_at: String,
    #[serde(flatten)]
    pub record: ImageRecord,
}

/// Why a record is excluded from the final dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionReason {
    Duplicate,
    Corrupt,
}

/// One line of `dedup.manifest`: the normalized record columns plus
/// fingerprint, group and survivor annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRow {
    pub run_id: String,
    pub canonical_path: PathBuf,
    pub content_fingerprint: Option<String>,
    pub perceptual_fingerprint: Option<String>,
    /// `None` only for corrupt records, which belong to no group.
    pub group_id: Option<String>,
    pub survivor: bool,
    pub excluded: Option<ExclusionReason>,
}

/// One line of `split.manifest`. Carries no timestamp so that a fixed seed
/// and corpus reproduce identical rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRow {
    pub run_id: String,
    pub canonical_path: PathBuf,
    pub class_label: ClassLabel,
    pub split: SplitName,
}

/// Versioned manifest persistence: each run writes JSON-lines files under
/// `manifests/{run_id}/`, append-only, with a `LATEST` pointer for chained
/// stage re-runs.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join(run_id)
    }

    pub fn manifest_path(&self, run_id: &str, name: &str) -> PathBuf {
        self.run_dir(run_id).join(name)
    }

    /// Append rows to a run's manifest, one JSON object per line.
    pub fn append_rows<T: Serialize>(
        &self,
        run_id: &str,
        name: &str,
        rows: &[T],
    ) -> Result<(), ManifestError> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)?;

        let path = dir.join(name);
        let mut out = OpenOptions::new().create(true).append(true).open(&path)?;
        for row in rows {
            let line = serde_json::to_string(row).map_err(|cause| ManifestError::Malformed {
                path: path.clone(),
                line: 0,
                cause,
            })?;
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    /// Read all rows of a run's manifest back.
    pub fn read_rows<T: DeserializeOwned>(
        &self,
        run_id: &str,
        name: &str,
    ) -> Result<Vec<T>, ManifestError> {
        let path = self.manifest_path(run_id, name);
        let file = File::open(&path)?;
        let reader = BufReader::new(file);

        let mut rows = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line).map_err(|cause| ManifestError::Malformed {
                path: path.clone(),
                line: index + 1,
                cause,
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn mark_latest(&self, run_id: &str) -> Result<(), ManifestError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(LATEST_POINTER), run_id)?;
        Ok(())
    }

    pub fn latest_run(&self) -> Result<String, ManifestError> {
        let pointer = self.dir.join(LATEST_POINTER);
        if !pointer.exists() {
            return Err(ManifestError::NoRuns(self.dir.clone()));
        }
        Ok(fs::read_to_string(pointer)?.trim().to_string())
    }

    /// Resolve an explicitly requested run id, defaulting to the latest.
    pub fn resolve_run(&self, explicit: Option<&str>) -> Result<String, ManifestError> {
        match explicit {
            Some(run_id) => Ok(run_id.to_string()),
            None => self.latest_run(),
        }
    }
}
