//! Process-level analysis state
//!
//! An [`Analysis`] owns everything that outlives a single series: the
//! validated configuration, the revision index, the alert ledger and the
//! high-water mark of the previous run. It is opened once, run once and
//! saved once.

use crate::config::{AnalysisConfig, ConfigError};
use crate::ledger::AlertLedger;
use crate::persist::{self, PersistError};
use crate::pushlog::{PushLogSource, RevisionIndex};
use crate::runner::{RunOptions, RunSummary, SeriesRunner};
use crate::source::{DataSource, SeriesKey, SourceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted high-water mark
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    /// Newest `testrun_timestamp` processed by the last clean run
    pub last_run: i64,
}

/// One analysis run over a data source
pub struct Analysis<D, P> {
    config: AnalysisConfig,
    source: D,
    index: RevisionIndex<P>,
    ledger: AlertLedger,
    last_run_path: PathBuf,
    last_run: i64,
    /// High-water mark reached by this run, saved only if the run was clean
    pending_last_run: Option<i64>,
}

impl<D, P> Analysis<D, P>
where
    D: DataSource,
    P: PushLogSource,
{
    /// Validate `config` and load the persisted stores
    ///
    /// Ledger entries older than `now - history_secs` are dropped on load.
    pub fn open(config: AnalysisConfig, source: D, pushlog: P, now: i64) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = &config.cache;
        let index = RevisionIndex::load(pushlog, config.pushlog.batch_size, &cache.pushlog);
        let ledger = AlertLedger::load(
            &cache.warning_history,
            now - config.analysis.history_secs,
            config.analysis.machine_cooldown_secs,
        );

        let last_run = match persist::load_json::<LastRun>(&cache.last_run_file) {
            Ok(marker) => marker.last_run,
            Err(e) => {
                tracing::debug!("Couldn't load last run time: {}", e);
                0
            }
        };
        if last_run > 0 {
            tracing::debug!("Using {} as our last_run", last_run);
        }

        Ok(Self {
            last_run_path: cache.last_run_file.clone(),
            config,
            source,
            index,
            ledger,
            last_run,
            pending_last_run: None,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn ledger(&self) -> &AlertLedger {
        &self.ledger
    }

    pub fn index(&self) -> &RevisionIndex<P> {
        &self.index
    }

    /// High-water mark loaded from the previous run (0 when none)
    pub fn last_run(&self) -> i64 {
        self.last_run
    }

    /// Start time used when the caller gives none
    pub fn default_start_time(&self, now: i64) -> i64 {
        now - self.config.analysis.history_secs
    }

    /// Series with new data since the last run, narrowed to `branches` and
    /// `tests` when those are non-empty
    pub fn list_series(&self, branches: &[String], tests: &[String]) -> Result<Vec<SeriesKey>, SourceError> {
        let since = (self.last_run > 0).then_some(self.last_run);
        let mut series = self.source.list_series(since)?;
        series.retain(|s| {
            (branches.is_empty() || branches.contains(&s.branch))
                && (tests.is_empty() || tests.contains(&s.test))
        });
        Ok(series)
    }

    /// Run every series in `series`
    pub fn run(&mut self, series: &[SeriesKey], opts: &RunOptions) -> Result<RunSummary, ConfigError> {
        let summary = {
            let runner = SeriesRunner::new(&self.config, &self.source, &self.index, &self.ledger)?;
            runner.run_all(series, opts)
        };

        if let Some(latest) = summary.latest_testrun.filter(|&t| t > self.last_run) {
            if summary.is_clean() {
                tracing::debug!("Setting last_run to {}", latest);
                self.pending_last_run = Some(latest);
            } else {
                tracing::warn!("Run had failures, keeping last_run at {}", self.last_run);
            }
        }

        Ok(summary)
    }

    /// Flush every store
    ///
    /// Each store is attempted even when an earlier one fails; the first
    /// failure is returned.
    pub fn save(&self) -> Result<(), PersistError> {
        let mut first_error = None;

        let results = [
            ("push log cache", self.index.save()),
            ("warning history", self.ledger.save()),
            ("last run", self.save_last_run()),
        ];
        for (what, result) in results {
            if let Err(e) = result {
                tracing::error!("Error saving {}: {}", what, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn save_last_run(&self) -> Result<(), PersistError> {
        match self.pending_last_run {
            Some(last_run) => persist::save_json_atomic(&self.last_run_path, &LastRun { last_run }),
            None => Ok(()),
        }
    }
}
