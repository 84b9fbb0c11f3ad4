//! Series orchestration
//!
//! One series goes through: fetch raw samples → resolve push times → sort into
//! push order → classify → notification policy → ledger. Series share no data
//! except the revision index and the ledger, so [`SeriesRunner::run_all`]
//! spreads them over scoped worker threads and returns events in series order.

use crate::config::{AnalysisConfig, ConfigError, TestMatchers};
use crate::datum::{sort_by_push_order, PerfDatum, PointState};
use crate::detector::ChangeDetector;
use crate::ledger::AlertLedger;
use crate::pushlog::{PushLogSource, RevisionIndex};
use crate::source::{DataSource, SeriesKey, SourceError};
use crate::stats::percentage_change;
use crossbeam::channel;
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A change someone should hear about
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifyEvent {
    /// Series with its platform alias applied
    pub series: SeriesKey,
    pub state: PointState,
    pub point: PerfDatum,
    /// Most recent earlier `good` point, for before/after comparison
    pub previous_good: PerfDatum,
    /// Comparison point from another machine, for `machine` events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_other: Option<PerfDatum>,
    /// Relative change between the windows (%)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage_change: Option<f64>,
}

/// Per-run settings
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Oldest sample to fetch
    pub start_time: i64,
    /// Reference time for the re-scan window and machine cooldowns
    pub now: i64,
    /// Record warnings without emitting events
    pub catchup: bool,
    /// Worker threads
    pub jobs: usize,
}

/// Result of processing one series
#[derive(Debug, Clone, Default)]
pub struct SeriesOutcome {
    pub series: Option<SeriesKey>,
    pub skipped: bool,
    pub points: usize,
    pub changes: usize,
    pub events: Vec<NotifyEvent>,
    /// Newest `testrun_timestamp` seen
    pub latest_testrun: Option<i64>,
    /// identity → newest `testrun_timestamp`
    pub machines_seen: BTreeMap<String, i64>,
}

/// Result of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub events: Vec<NotifyEvent>,
    pub series_processed: usize,
    pub series_skipped: usize,
    pub series_failed: usize,
    pub latest_testrun: Option<i64>,
}

impl RunSummary {
    /// True when every series was processed or deliberately skipped
    pub fn is_clean(&self) -> bool {
        self.series_failed == 0
    }
}

/// Runs series through detection and the alert ledger
pub struct SeriesRunner<'a, D, P> {
    config: &'a AnalysisConfig,
    matchers: TestMatchers,
    detector: ChangeDetector,
    reversed_detector: ChangeDetector,
    source: &'a D,
    index: &'a RevisionIndex<P>,
    ledger: &'a AlertLedger,
}

impl<'a, D, P> SeriesRunner<'a, D, P>
where
    D: DataSource,
    P: PushLogSource,
{
    pub fn new(
        config: &'a AnalysisConfig,
        source: &'a D,
        index: &'a RevisionIndex<P>,
        ledger: &'a AlertLedger,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            config,
            matchers: config.matchers()?,
            detector: ChangeDetector::new(config.detector_params(false))?,
            reversed_detector: ChangeDetector::new(config.detector_params(true))?,
            source,
            index,
            ledger,
        })
    }

    fn detector_for(&self, test: &str) -> &ChangeDetector {
        if self.matchers.is_reversed(test) {
            &self.reversed_detector
        } else {
            &self.detector
        }
    }

    /// Attach push times and sort into push order
    fn push_ordered(&self, series: &SeriesKey, mut data: Vec<PerfDatum>) -> Vec<PerfDatum> {
        let revisions: Vec<String> = data
            .iter()
            .filter_map(|d| d.revision.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if !revisions.is_empty() {
            let times = self.index.resolve_push_times(&series.branch, &revisions);
            if times.len() < revisions.len() {
                tracing::debug!(
                    "{}: {} of {} revisions unresolved, using arrival order for them",
                    series,
                    revisions.len() - times.len(),
                    revisions.len()
                );
            }
            for d in &mut data {
                if let Some(&t) = d.revision.as_ref().and_then(|r| times.get(r)) {
                    d.push_timestamp = Some(t);
                }
            }
        }

        sort_by_push_order(&mut data);
        data
    }

    /// Percentage floors from the configuration
    fn passes_percentage_floor(&self, test: &str, point: &PerfDatum) -> bool {
        if self.matchers.ignores_percentage(test) {
            return true;
        }
        let Some(change) = point
            .classification()
            .and_then(|c| percentage_change(c.historical_stats.avg, c.forward_stats.avg))
        else {
            return true;
        };

        let a = &self.config.analysis;
        if a.percentage_threshold.is_some_and(|floor| change < floor) {
            return false;
        }
        if self.matchers.is_high_percentage(test)
            && a.high_percentage_threshold.is_some_and(|floor| change < floor)
        {
            return false;
        }
        true
    }

    /// Process one series end to end
    pub fn run_series(&self, series: &SeriesKey, opts: &RunOptions) -> Result<SeriesOutcome, SourceError> {
        if self.matchers.is_ignored(&series.branch, &series.test) {
            tracing::debug!("Skipping {}", series);
            return Ok(SeriesOutcome {
                series: Some(series.clone()),
                skipped: true,
                ..SeriesOutcome::default()
            });
        }

        tracing::info!("Processing {}", series);
        let samples = self.source.fetch(series, opts.start_time)?;
        let data: Vec<PerfDatum> = samples.into_iter().map(PerfDatum::from).collect();

        let mut outcome = SeriesOutcome {
            series: Some(series.clone()),
            points: data.len(),
            latest_testrun: data.iter().map(|d| d.testrun_timestamp).max(),
            ..SeriesOutcome::default()
        };
        for d in &data {
            if let Some(identity) = &d.identity {
                let seen = outcome.machines_seen.entry(identity.clone()).or_insert(i64::MIN);
                *seen = (*seen).max(d.testrun_timestamp);
            }
        }
        if data.is_empty() {
            return Ok(outcome);
        }

        let ordered = self.push_ordered(series, data);
        let analyzed = self.detector_for(&series.test).analyze(&ordered);

        let display = series.with_platform(self.config.platform_alias(&series.platform));
        let cutoff = opts.now - self.config.analysis.rescan_window_secs;
        let mut last_good: Option<&PerfDatum> = None;

        for d in &analyzed {
            let state = d.state();
            if state == PointState::Good {
                last_good = Some(d);
                continue;
            }
            outcome.changes += 1;

            // Older changes were dealt with by earlier runs
            if d.testrun_timestamp < cutoff {
                continue;
            }
            let Some(previous_good) = last_good else {
                tracing::debug!("{}: {} at {} has no earlier good point", series, state, d.testrun_timestamp);
                continue;
            };
            if !self.passes_percentage_floor(&series.test, d) {
                continue;
            }
            if !self.ledger.claim(d, &display, opts.now) {
                continue;
            }
            if opts.catchup {
                continue;
            }

            let last_other = d
                .classification()
                .and_then(|c| c.last_other)
                .and_then(|i| analyzed.get(i))
                .cloned();

            outcome.events.push(NotifyEvent {
                series: display.clone(),
                state,
                point: d.clone(),
                previous_good: previous_good.clone(),
                last_other,
                percentage_change: d
                    .classification()
                    .and_then(|c| percentage_change(c.historical_stats.avg, c.forward_stats.avg)),
            });
        }

        if !outcome.events.is_empty() {
            tracing::info!("{}: {} new warnings", series, outcome.events.len());
        }
        Ok(outcome)
    }

    /// Process every series, `opts.jobs` at a time
    ///
    /// Events come back in the order of `series`, whatever order the workers
    /// finish in. A failing series is logged and counted; it never stops the
    /// others.
    pub fn run_all(&self, series: &[SeriesKey], opts: &RunOptions) -> RunSummary {
        let mut summary = RunSummary::default();
        if series.is_empty() {
            return summary;
        }

        let queue = ArrayQueue::new(series.len());
        for job in series.iter().enumerate() {
            // Capacity equals the job count
            let _ = queue.push(job);
        }

        let workers = opts.jobs.clamp(1, series.len());
        let (tx, rx) = channel::unbounded();

        let scoped = crossbeam::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move |_| {
                    while let Some((i, key)) = queue.pop() {
                        if tx.send((i, self.run_series(key, opts))).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        if scoped.is_err() {
            tracing::error!("A series worker panicked");
        }

        let mut results: Vec<Option<Result<SeriesOutcome, SourceError>>> =
            (0..series.len()).map(|_| None).collect();
        for (i, result) in rx.iter() {
            results[i] = Some(result);
        }

        let mut machines_seen: BTreeMap<String, i64> = BTreeMap::new();

        for (key, result) in series.iter().zip(results) {
            match result {
                Some(Ok(outcome)) if outcome.skipped => summary.series_skipped += 1,
                Some(Ok(outcome)) => {
                    summary.series_processed += 1;
                    summary.latest_testrun = summary.latest_testrun.max(outcome.latest_testrun);
                    for (machine, ts) in outcome.machines_seen {
                        let seen = machines_seen.entry(machine).or_insert(ts);
                        *seen = (*seen).max(ts);
                    }
                    summary.events.extend(outcome.events);
                }
                Some(Err(e)) => {
                    tracing::warn!("Failed to process {}: {}", key, e);
                    summary.series_failed += 1;
                }
                None => {
                    tracing::warn!("No result for {}", key);
                    summary.series_failed += 1;
                }
            }
        }

        self.update_machine_activity(&machines_seen, opts);

        tracing::info!(
            "Processed {} series ({} skipped, {} failed), {} warnings",
            summary.series_processed,
            summary.series_skipped,
            summary.series_failed,
            summary.events.len()
        );
        summary
    }

    fn update_machine_activity(&self, machines_seen: &BTreeMap<String, i64>, opts: &RunOptions) {
        let cutoff = opts.now - self.config.analysis.rescan_window_secs;
        for (machine, &last_seen) in machines_seen {
            if last_seen < cutoff {
                self.ledger.note_inactive(machine, last_seen);
            } else {
                self.ledger.note_active(machine);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::RawSample;
    use crate::ledger::DEFAULT_COOLDOWN_SECS;
    use crate::pushlog::OfflinePushLog;
    use std::collections::HashMap;

    const NOW: i64 = 1_700_000_000;
    const HOUR: i64 = 3600;

    /// Series held in memory
    #[derive(Default)]
    struct MemorySource {
        series: HashMap<SeriesKey, Vec<RawSample>>,
    }

    impl MemorySource {
        fn insert(&mut self, key: SeriesKey, samples: Vec<RawSample>) {
            self.series.insert(key, samples);
        }
    }

    impl DataSource for MemorySource {
        fn list_series(&self, _since: Option<i64>) -> Result<Vec<SeriesKey>, SourceError> {
            let mut keys: Vec<SeriesKey> = self.series.keys().cloned().collect();
            keys.sort();
            Ok(keys)
        }

        fn fetch(&self, series: &SeriesKey, start_time: i64) -> Result<Vec<RawSample>, SourceError> {
            let samples = self
                .series
                .get(series)
                .ok_or_else(|| SourceError::UnknownSeries(series.clone()))?;
            Ok(samples
                .iter()
                .filter(|s| s.testrun_timestamp >= start_time)
                .cloned()
                .collect())
        }
    }

    /// Hourly samples ending one hour before NOW
    fn hourly(values: &[f64]) -> Vec<RawSample> {
        let n = values.len() as i64;
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| RawSample {
                identity: Some("talos-r3-fed-001".to_string()),
                value,
                testrun_timestamp: NOW - (n - i as i64) * HOUR,
                revision: None,
                buildid: Some(format!("build{}", i)),
            })
            .collect()
    }

    fn step(before: f64, after: f64, n_before: usize, n_after: usize) -> Vec<f64> {
        let mut v = vec![before; n_before];
        v.extend(vec![after; n_after]);
        v
    }

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.analysis.back_window = 5;
        config.analysis.fore_window = 5;
        config.analysis.threshold = 3.0;
        config
    }

    fn opts() -> RunOptions {
        RunOptions {
            start_time: 0,
            now: NOW,
            catchup: false,
            jobs: 2,
        }
    }

    fn key(test: &str) -> SeriesKey {
        SeriesKey::new("mozilla-central", "Linux", test)
    }

    #[test]
    fn test_step_emits_one_event_with_previous_good() {
        let mut source = MemorySource::default();
        source.insert(key("Ts"), hourly(&step(100.0, 150.0, 10, 10)));
        let config = config();
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let outcome = runner.run_series(&key("Ts"), &opts()).unwrap();
        assert_eq!(outcome.points, 20);
        assert_eq!(outcome.events.len(), 1);

        let event = &outcome.events[0];
        assert_eq!(event.state, PointState::Regression);
        assert_eq!(event.point.value, 150.0);
        assert_eq!(event.previous_good.value, 100.0);
        assert_eq!(event.point.buildid.as_deref(), Some("build10"));
        assert_eq!(event.percentage_change, Some(50.0));
    }

    #[test]
    fn test_second_run_does_not_repeat_event() {
        let mut source = MemorySource::default();
        source.insert(key("Ts"), hourly(&step(100.0, 150.0, 10, 10)));
        let config = config();
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        assert_eq!(runner.run_series(&key("Ts"), &opts()).unwrap().events.len(), 1);
        assert!(runner.run_series(&key("Ts"), &opts()).unwrap().events.is_empty());
    }

    #[test]
    fn test_catchup_records_without_emitting() {
        let mut source = MemorySource::default();
        source.insert(key("Ts"), hourly(&step(100.0, 150.0, 10, 10)));
        let config = config();
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let catchup = RunOptions {
            catchup: true,
            ..opts()
        };
        assert!(runner.run_series(&key("Ts"), &catchup).unwrap().events.is_empty());
        assert_eq!(ledger.snapshot().warning_count(), 1);
        assert!(runner.run_series(&key("Ts"), &opts()).unwrap().events.is_empty());
    }

    #[test]
    fn test_changes_outside_rescan_window_not_notified() {
        let mut source = MemorySource::default();
        source.insert(key("Ts"), hourly(&step(100.0, 150.0, 10, 10)));
        let mut config = config();
        // Only the last 5 hours are re-examined; the step is 10 hours old
        config.analysis.rescan_window_secs = 5 * HOUR;
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let outcome = runner.run_series(&key("Ts"), &opts()).unwrap();
        assert_eq!(outcome.changes, 1);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_reversed_test_reports_improvement() {
        let mut source = MemorySource::default();
        source.insert(key("Dromaeo (CSS)"), hourly(&step(100.0, 150.0, 10, 10)));
        let mut config = config();
        config.analysis.reversed_tests = vec!["^Dromaeo".to_string()];
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let outcome = runner.run_series(&key("Dromaeo (CSS)"), &opts()).unwrap();
        assert_eq!(outcome.events[0].state, PointState::Improvement);
    }

    #[test]
    fn test_percentage_floor_suppresses_small_changes() {
        let mut source = MemorySource::default();
        source.insert(key("Ts"), hourly(&step(100.0, 101.0, 10, 10)));
        source.insert(key("Paint"), hourly(&step(100.0, 105.0, 10, 10)));
        source.insert(key("Dromaeo"), hourly(&step(100.0, 101.0, 10, 10)));
        let mut config = config();
        config.analysis.percentage_threshold = Some(2.0);
        config.analysis.high_percentage_threshold = Some(10.0);
        config.analysis.high_percentage_tests = vec!["^Paint$".to_string()];
        config.analysis.ignore_percentage_tests = vec!["^Dromaeo".to_string()];
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        // 1% change, below the 2% floor
        assert!(runner.run_series(&key("Ts"), &opts()).unwrap().events.is_empty());
        // 5% change, below the 10% floor for high-percentage tests
        assert!(runner.run_series(&key("Paint"), &opts()).unwrap().events.is_empty());
        // Exempt from floors
        assert_eq!(runner.run_series(&key("Dromaeo"), &opts()).unwrap().events.len(), 1);
    }

    #[test]
    fn test_ignored_test_is_skipped() {
        let mut source = MemorySource::default();
        source.insert(key("Tp5 (Memset)"), hourly(&step(100.0, 150.0, 10, 10)));
        let mut config = config();
        config.analysis.ignore_tests = vec!["Memset".to_string()];
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let outcome = runner.run_series(&key("Tp5 (Memset)"), &opts()).unwrap();
        assert!(outcome.skipped);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_platform_alias_applied_to_events_and_ledger() {
        let series = SeriesKey::new("mozilla-central", "WINNT 6.1", "Ts");
        let mut source = MemorySource::default();
        source.insert(series.clone(), hourly(&step(100.0, 150.0, 10, 10)));
        let mut config = config();
        config.platforms.insert("WINNT 6.1".to_string(), "Win7".to_string());
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let outcome = runner.run_series(&series, &opts()).unwrap();
        assert_eq!(outcome.events[0].series.platform, "Win7");
        assert!(ledger.snapshot().warnings["mozilla-central"].contains_key("Win7"));
    }

    #[test]
    fn test_previous_good_may_predate_rescan_window() {
        let mut source = MemorySource::default();
        source.insert(key("Ts"), hourly(&step(100.0, 150.0, 10, 10)));
        let mut config = config();
        // The step (10h old) is re-examined; the good point before it (11h) is not
        config.analysis.rescan_window_secs = 10 * HOUR + HOUR / 2;
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let outcome = runner.run_series(&key("Ts"), &opts()).unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].previous_good.testrun_timestamp, NOW - 11 * HOUR);
    }

    #[test]
    fn test_run_all_preserves_series_order_and_counts_failures() {
        let mut source = MemorySource::default();
        for test in ["A", "B", "C", "D"] {
            source.insert(key(test), hourly(&step(100.0, 150.0, 10, 10)));
        }
        let config = config();
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let series = vec![key("D"), key("missing"), key("B"), key("A"), key("C")];
        let summary = runner.run_all(&series, &RunOptions { jobs: 3, ..opts() });

        let order: Vec<&str> = summary.events.iter().map(|e| e.series.test.as_str()).collect();
        assert_eq!(order, vec!["D", "B", "A", "C"]);
        assert_eq!(summary.series_processed, 4);
        assert_eq!(summary.series_failed, 1);
        assert!(!summary.is_clean());
        assert_eq!(summary.latest_testrun, Some(NOW - HOUR));
    }

    #[test]
    fn test_run_all_tracks_inactive_machines() {
        let mut source = MemorySource::default();
        let mut samples = hourly(&[100.0; 10]);
        let mut stale = hourly(&[100.0; 3]);
        for s in &mut stale {
            s.identity = Some("talos-r3-fed-009".to_string());
            s.testrun_timestamp -= 30 * 24 * HOUR;
        }
        samples.extend(stale);
        source.insert(key("Ts"), samples);

        let config = config();
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        ledger.note_inactive("talos-r3-fed-001", NOW - 90 * 24 * HOUR);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        runner.run_all(&[key("Ts")], &opts());

        let inactive = ledger.inactive_machines();
        assert!(inactive.contains_key("talos-r3-fed-009"));
        assert!(!inactive.contains_key("talos-r3-fed-001"));
    }

    #[test]
    fn test_run_all_empty() {
        let source = MemorySource::default();
        let config = config();
        let index = RevisionIndex::new(OfflinePushLog, 50);
        let ledger = AlertLedger::in_memory(DEFAULT_COOLDOWN_SECS);
        let runner = SeriesRunner::new(&config, &source, &index, &ledger).unwrap();

        let summary = runner.run_all(&[], &opts());
        assert!(summary.is_clean());
        assert!(summary.events.is_empty());
    }
}
