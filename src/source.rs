//! Raw measurement sources
//!
//! A source knows which series exist and hands out their raw samples. The
//! analysis never talks to a telemetry backend directly; [`JsonDirSource`]
//! reads samples exported to disk as `<dir>/<branch>/<platform>/<test>.json`.

use crate::datum::RawSample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by a data source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed samples in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown series {0}")]
    UnknownSeries(SeriesKey),
}

/// Identity of a series: branch × platform × test
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub branch: String,
    pub platform: String,
    pub test: String,
}

impl SeriesKey {
    pub fn new(
        branch: impl Into<String>,
        platform: impl Into<String>,
        test: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            platform: platform.into(),
            test: test.into(),
        }
    }

    /// Same series under another platform name
    pub fn with_platform(&self, platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.branch, self.platform, self.test)
    }
}

/// Caller-owned supplier of raw samples
pub trait DataSource: Sync {
    /// Series with samples newer than `since` (all series when `None`)
    fn list_series(&self, since: Option<i64>) -> Result<Vec<SeriesKey>, SourceError>;

    /// Samples of `series` produced at or after `start_time`, in any order
    fn fetch(&self, series: &SeriesKey, start_time: i64) -> Result<Vec<RawSample>, SourceError>;
}

/// Samples stored as JSON arrays under a directory tree
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    root: PathBuf,
}

impl JsonDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_path(&self, series: &SeriesKey) -> PathBuf {
        self.root
            .join(&series.branch)
            .join(&series.platform)
            .join(format!("{}.json", series.test))
    }

    fn read_samples(path: &Path) -> Result<Vec<RawSample>, SourceError> {
        let bytes = fs::read(path).map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SourceError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Store `samples` for `series`, replacing any previous file
    pub fn write_series(&self, series: &SeriesKey, samples: &[RawSample]) -> Result<(), SourceError> {
        let path = self.series_path(series);
        let io_err = |source| SourceError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(samples).map_err(|source| SourceError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(&path, bytes).map_err(io_err)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, SourceError> {
    let entries = fs::read_dir(dir).map_err(|source| SourceError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            out.push((name.to_string(), path.clone()));
        }
    }
    out.sort();
    Ok(out)
}

impl DataSource for JsonDirSource {
    fn list_series(&self, since: Option<i64>) -> Result<Vec<SeriesKey>, SourceError> {
        let mut series = Vec::new();

        for (branch, branch_dir) in subdirs(&self.root)?.into_iter().filter(|(_, p)| p.is_dir()) {
            for (platform, platform_dir) in subdirs(&branch_dir)?.into_iter().filter(|(_, p)| p.is_dir()) {
                for (file, path) in subdirs(&platform_dir)? {
                    let Some(test) = file.strip_suffix(".json") else {
                        continue;
                    };
                    if let Some(since) = since {
                        // Unreadable files are listed; the error surfaces on fetch
                        let fresh = Self::read_samples(&path)
                            .map(|samples| samples.iter().any(|s| s.testrun_timestamp > since))
                            .unwrap_or(true);
                        if !fresh {
                            continue;
                        }
                    }
                    series.push(SeriesKey::new(&branch, &platform, test));
                }
            }
        }

        tracing::debug!("Found {} series under {}", series.len(), self.root.display());
        Ok(series)
    }

    fn fetch(&self, series: &SeriesKey, start_time: i64) -> Result<Vec<RawSample>, SourceError> {
        let path = self.series_path(series);
        if !path.exists() {
            return Err(SourceError::UnknownSeries(series.clone()));
        }
        let mut samples = Self::read_samples(&path)?;
        samples.retain(|s| s.testrun_timestamp >= start_time);
        Ok(samples)
    }
}
