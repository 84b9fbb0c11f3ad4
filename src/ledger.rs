//! Alert deduplication ledger
//!
//! Remembers which change-points were already reported, per series, keyed by
//! `(buildid, testrun_timestamp)`. Machine issues get an additional per-machine
//! cooldown so one broken device produces one report per cooldown window
//! rather than one per test.
//!
//! All mutation happens in memory behind a mutex; [`AlertLedger::save`] writes
//! the whole ledger once, atomically.

use crate::datum::{PerfDatum, PointState};
use crate::persist::{self, PersistError};
use crate::source::SeriesKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Default machine cooldown (7 days)
pub const DEFAULT_COOLDOWN_SECS: i64 = 7 * 24 * 3600;

/// Identity of one reported change-point
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WarningKey(pub Option<String>, pub i64);

impl WarningKey {
    pub fn for_point(point: &PerfDatum) -> Self {
        Self(point.buildid.clone(), point.testrun_timestamp)
    }

    pub fn timestamp(&self) -> i64 {
        self.1
    }
}

type TestWarnings = BTreeMap<String, BTreeSet<WarningKey>>;
type PlatformWarnings = BTreeMap<String, TestWarnings>;

/// Serialized form of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerState {
    /// branch → platform → test → warned keys
    pub warnings: BTreeMap<String, PlatformWarnings>,
    /// machine → last time a machine warning was sent
    pub bad_machines: BTreeMap<String, i64>,
    /// machine → last time it reported data, while it is silent
    pub inactive_machines: BTreeMap<String, i64>,
}

impl LedgerState {
    fn series(&self, series: &SeriesKey) -> Option<&BTreeSet<WarningKey>> {
        self.warnings
            .get(&series.branch)?
            .get(&series.platform)?
            .get(&series.test)
    }

    fn series_mut(&mut self, series: &SeriesKey) -> &mut BTreeSet<WarningKey> {
        self.warnings
            .entry(series.branch.clone())
            .or_default()
            .entry(series.platform.clone())
            .or_default()
            .entry(series.test.clone())
            .or_default()
    }

    /// Drop everything older than `cutoff`; returns the number of entries removed
    pub fn prune(&mut self, cutoff: i64) -> usize {
        let mut removed = 0;

        for platforms in self.warnings.values_mut() {
            for tests in platforms.values_mut() {
                for keys in tests.values_mut() {
                    let before = keys.len();
                    keys.retain(|k| k.timestamp() >= cutoff);
                    removed += before - keys.len();
                }
                tests.retain(|_, keys| !keys.is_empty());
            }
            platforms.retain(|_, tests| !tests.is_empty());
        }
        self.warnings.retain(|_, platforms| !platforms.is_empty());

        for machines in [&mut self.bad_machines, &mut self.inactive_machines] {
            let before = machines.len();
            machines.retain(|_, ts| *ts >= cutoff);
            removed += before - machines.len();
        }

        removed
    }

    /// Total number of warned keys across all series
    pub fn warning_count(&self) -> usize {
        self.warnings
            .values()
            .flat_map(|p| p.values())
            .flat_map(|t| t.values())
            .map(BTreeSet::len)
            .sum()
    }
}

/// Deduplication ledger shared by all series of a run
#[derive(Debug)]
pub struct AlertLedger {
    path: Option<PathBuf>,
    cooldown_secs: i64,
    state: Mutex<LedgerState>,
}

impl AlertLedger {
    /// In-memory ledger that is never written anywhere
    pub fn in_memory(cooldown_secs: i64) -> Self {
        Self::from_state(LedgerState::default(), None, cooldown_secs)
    }

    pub fn from_state(state: LedgerState, path: Option<PathBuf>, cooldown_secs: i64) -> Self {
        Self {
            path,
            cooldown_secs,
            state: Mutex::new(state),
        }
    }

    /// Load the ledger from `path` and prune entries older than `cutoff`
    ///
    /// An unreadable ledger is replaced by an empty one: the worst outcome is
    /// a repeated warning.
    pub fn load(path: impl AsRef<Path>, cutoff: i64, cooldown_secs: i64) -> Self {
        let path = path.as_ref();
        tracing::debug!("Loading warning history from {}", path.display());

        let mut state: LedgerState = persist::load_json_or_default(path, "warning history");
        let removed = state.prune(cutoff);
        if removed > 0 {
            tracing::debug!("Pruned {} warnings older than {}", removed, cutoff);
        }

        Self::from_state(state, Some(path.to_path_buf()), cooldown_secs)
    }

    pub fn cooldown_secs(&self) -> i64 {
        self.cooldown_secs
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic elsewhere cannot leave a half-applied insert behind
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Should `point` be reported now?
    pub fn should_warn(&self, point: &PerfDatum, series: &SeriesKey) -> bool {
        self.should_warn_at(point, series, crate::unix_now())
    }

    pub fn should_warn_at(&self, point: &PerfDatum, series: &SeriesKey, now: i64) -> bool {
        let state = self.lock();
        Self::check(&state, point, series, now, self.cooldown_secs)
    }

    fn check(
        state: &LedgerState,
        point: &PerfDatum,
        series: &SeriesKey,
        now: i64,
        cooldown_secs: i64,
    ) -> bool {
        let key = WarningKey::for_point(point);
        if state.series(series).is_some_and(|keys| keys.contains(&key)) {
            return false;
        }
        !Self::machine_cooling_down(state, point, now, cooldown_secs)
    }

    /// Was the machine behind a `machine` point reported within the cooldown?
    fn machine_cooling_down(
        state: &LedgerState,
        point: &PerfDatum,
        now: i64,
        cooldown_secs: i64,
    ) -> bool {
        if point.state() != PointState::Machine {
            return false;
        }
        point
            .identity
            .as_deref()
            .and_then(|machine| state.bad_machines.get(machine))
            .is_some_and(|&last| last > now - cooldown_secs)
    }

    /// Mark `point` as reported (idempotent)
    pub fn record_warned(&self, point: &PerfDatum, series: &SeriesKey) {
        self.record_warned_at(point, series, crate::unix_now());
    }

    pub fn record_warned_at(&self, point: &PerfDatum, series: &SeriesKey, now: i64) {
        let mut state = self.lock();
        Self::record(&mut state, point, series, now);
    }

    fn record(state: &mut LedgerState, point: &PerfDatum, series: &SeriesKey, now: i64) {
        state.series_mut(series).insert(WarningKey::for_point(point));

        if point.state() == PointState::Machine {
            if let Some(machine) = point.identity.as_deref() {
                state.bad_machines.insert(machine.to_string(), now);
            }
        }
    }

    /// Check and record in one critical section
    ///
    /// Returns true when the caller should report `point`. A new point is
    /// recorded even when the machine cooldown suppresses it, so it is never
    /// reported once the cooldown has passed.
    pub fn claim(&self, point: &PerfDatum, series: &SeriesKey, now: i64) -> bool {
        let mut state = self.lock();
        let cooling_down = Self::machine_cooling_down(&state, point, now, self.cooldown_secs);

        if !state.series_mut(series).insert(WarningKey::for_point(point)) {
            return false;
        }
        if cooling_down {
            tracing::debug!(
                "Suppressing machine warning for {:?} in {}",
                point.identity,
                series
            );
            return false;
        }

        Self::record(&mut state, point, series, now);
        true
    }

    /// Drop entries older than `cutoff`
    pub fn prune(&self, cutoff: i64) -> usize {
        self.lock().prune(cutoff)
    }

    /// Note that `machine` has been silent since `last_seen`
    pub fn note_inactive(&self, machine: &str, last_seen: i64) {
        let mut state = self.lock();
        if !state.inactive_machines.contains_key(machine) {
            tracing::info!("Machine {} inactive since {}", machine, last_seen);
        }
        state
            .inactive_machines
            .insert(machine.to_string(), last_seen);
    }

    /// Forget an inactive mark once `machine` reports again
    pub fn note_active(&self, machine: &str) {
        if self.lock().inactive_machines.remove(machine).is_some() {
            tracing::info!("Machine {} is reporting again", machine);
        }
    }

    pub fn inactive_machines(&self) -> BTreeMap<String, i64> {
        self.lock().inactive_machines.clone()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> LedgerState {
        self.lock().clone()
    }

    /// Write the ledger atomically; a no-op for in-memory ledgers
    pub fn save(&self) -> Result<(), PersistError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = self.snapshot();
        tracing::debug!(
            "Saving {} warnings to {}",
            state.warning_count(),
            path.display()
        );
        persist::save_json_atomic(path, &state)
    }
}
