//! Analysis configuration
//!
//! Loaded from TOML. Every key has a default so a partial file (or no file at
//! all) is valid; [`AnalysisConfig::validate`] rejects values that would make
//! the run meaningless before any series is touched.

use crate::detector::{DetectorParams, MachineParams};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DAY_SECS: i64 = 24 * 3600;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("invalid pattern in {key}: {source}")]
    Pattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub analysis: AnalysisSection,
    pub cache: CacheSection,
    pub pushlog: PushLogSection,
    /// Platform display aliases
    pub platforms: BTreeMap<String, String>,
    pub branches: BTreeMap<String, BranchSection>,
}

/// Detector parameters and notification policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub back_window: usize,
    pub fore_window: usize,
    pub threshold: f64,
    /// Enables the per-machine check when present
    pub machine_threshold: Option<f64>,
    pub machine_history_size: usize,
    /// Minimum relative change (%) worth notifying about
    pub percentage_threshold: Option<f64>,
    /// Minimum relative change (%) for tests matching `high_percentage_tests`
    pub high_percentage_threshold: Option<f64>,
    pub ignore_percentage_tests: Vec<String>,
    pub high_percentage_tests: Vec<String>,
    /// Tests where a higher value is better
    pub reversed_tests: Vec<String>,
    pub ignore_tests: Vec<String>,
    /// Trailing window re-examined for notifications on every run
    pub rescan_window_secs: i64,
    /// How far back history is fetched when no start time is given
    pub history_secs: i64,
    pub machine_cooldown_secs: i64,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            back_window: 12,
            fore_window: 12,
            threshold: 9.0,
            machine_threshold: None,
            machine_history_size: 5,
            percentage_threshold: None,
            high_percentage_threshold: None,
            ignore_percentage_tests: Vec::new(),
            high_percentage_tests: Vec::new(),
            reversed_tests: Vec::new(),
            ignore_tests: Vec::new(),
            rescan_window_secs: 7 * DAY_SECS,
            history_secs: 30 * DAY_SECS,
            machine_cooldown_secs: 7 * DAY_SECS,
        }
    }
}

/// Locations of the persisted stores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub warning_history: PathBuf,
    pub pushlog: PathBuf,
    pub last_run_file: PathBuf,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            warning_history: PathBuf::from("warning_history.json"),
            pushlog: PathBuf::from("pushlog.json"),
            last_run_file: PathBuf::from("lastrun.json"),
        }
    }
}

impl CacheSection {
    /// Resolve relative store paths against `dir`
    pub fn rooted_at(&self, dir: &Path) -> Self {
        Self {
            warning_history: dir.join(&self.warning_history),
            pushlog: dir.join(&self.pushlog),
            last_run_file: dir.join(&self.last_run_file),
        }
    }
}

/// Push-log service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushLogSection {
    /// Base URL of the Mercurial server; offline when absent
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    /// Revisions per request
    pub batch_size: usize,
}

impl Default for PushLogSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 60,
            batch_size: 50,
        }
    }
}

/// Per-branch overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchSection {
    /// Repository path on the push-log server; defaults to the branch name
    pub repo_path: Option<String>,
    pub ignore_tests: Vec<String>,
}

impl AnalysisConfig {
    /// Load and parse a TOML file (does not validate)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Windows, thresholds and the machine check
        self.detector_params(false).validate()?;

        let a = &self.analysis;
        for (key, value) in [
            ("percentage_threshold", a.percentage_threshold),
            ("high_percentage_threshold", a.high_percentage_threshold),
        ] {
            if let Some(v) = value {
                if !(v.is_finite() && v >= 0.0) {
                    return Err(invalid(key, format!("must be non-negative, got {}", v)));
                }
            }
        }
        if a.rescan_window_secs < 0 {
            return Err(invalid("rescan_window_secs", "must be non-negative"));
        }
        if a.history_secs <= 0 {
            return Err(invalid("history_secs", "must be > 0"));
        }
        if a.machine_cooldown_secs < 0 {
            return Err(invalid("machine_cooldown_secs", "must be non-negative"));
        }
        if self.pushlog.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        if self.pushlog.timeout_secs == 0 {
            return Err(invalid("timeout_secs", "must be > 0"));
        }

        self.matchers().map(|_| ())
    }

    /// Detector parameters for one test
    pub fn detector_params(&self, reversed: bool) -> DetectorParams {
        let a = &self.analysis;
        DetectorParams {
            back_window: a.back_window,
            fore_window: a.fore_window,
            threshold: a.threshold,
            machine: a.machine_threshold.map(|threshold| MachineParams {
                threshold,
                history_size: a.machine_history_size,
            }),
            lower_is_better: !reversed,
        }
    }

    /// Compile every test-name pattern list
    pub fn matchers(&self) -> Result<TestMatchers, ConfigError> {
        let a = &self.analysis;
        let mut branch_ignore = HashMap::new();
        for (branch, section) in &self.branches {
            if !section.ignore_tests.is_empty() {
                let key = format!("branches.{}.ignore_tests", branch);
                branch_ignore.insert(branch.clone(), compile(&key, &section.ignore_tests)?);
            }
        }

        Ok(TestMatchers {
            ignore: compile("ignore_tests", &a.ignore_tests)?,
            branch_ignore,
            reversed: compile("reversed_tests", &a.reversed_tests)?,
            ignore_percentage: compile("ignore_percentage_tests", &a.ignore_percentage_tests)?,
            high_percentage: compile("high_percentage_tests", &a.high_percentage_tests)?,
        })
    }

    /// Display name for a platform
    pub fn platform_alias<'a>(&'a self, platform: &'a str) -> &'a str {
        self.platforms
            .get(platform)
            .map(String::as_str)
            .unwrap_or(platform)
    }

    /// Push-log repository path for a branch
    pub fn repo_path<'a>(&'a self, branch: &'a str) -> &'a str {
        self.branches
            .get(branch)
            .and_then(|b| b.repo_path.as_deref())
            .unwrap_or(branch)
    }

    /// Branch → repository path map for every configured branch
    pub fn repo_paths(&self) -> HashMap<String, String> {
        self.branches
            .keys()
            .map(|b| (b.clone(), self.repo_path(b).to_string()))
            .collect()
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn compile(key: &str, patterns: &[String]) -> Result<RegexSet, ConfigError> {
    RegexSet::new(patterns).map_err(|source| ConfigError::Pattern {
        key: key.to_string(),
        source,
    })
}

/// Compiled test-name filters
#[derive(Debug, Clone)]
pub struct TestMatchers {
    ignore: RegexSet,
    branch_ignore: HashMap<String, RegexSet>,
    reversed: RegexSet,
    ignore_percentage: RegexSet,
    high_percentage: RegexSet,
}

impl TestMatchers {
    /// Skip this series entirely
    pub fn is_ignored(&self, branch: &str, test: &str) -> bool {
        self.ignore.is_match(test)
            || self
                .branch_ignore
                .get(branch)
                .is_some_and(|set| set.is_match(test))
    }

    /// Higher values are better for this test
    pub fn is_reversed(&self, test: &str) -> bool {
        self.reversed.is_match(test)
    }

    /// Percentage floors do not apply to this test
    pub fn ignores_percentage(&self, test: &str) -> bool {
        self.ignore_percentage.is_match(test)
    }

    pub fn is_high_percentage(&self, test: &str) -> bool {
        self.high_percentage.is_match(test)
    }
}
