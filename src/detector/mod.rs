// Windowed change-point detection for push-ordered series
//
// Every point of a series is compared against two windows of the aggregate
// (non machine-flagged) sequence: the B points before it and the F points
// starting at it. Welch's t between those windows is the evidence for a shift
// at that point.
//
// - Contiguous runs of points above threshold describe one shift; only the
//   peak of the run is reported.
// - After a reported shift the historical window is re-based at the shift, so
//   later points are measured against the new level and the same shift is
//   never reported twice.
// - When a machine threshold is configured, a point that departs from its own
//   machine's recent history while the other machines around it did not move
//   the same way is classified `machine` and kept out of the aggregate.
//
// The detector holds only parameters; `analyze` is a pure function of its
// input.

mod machine;

use crate::config::ConfigError;
use crate::datum::{Classification, PerfDatum, PointState, WindowStats};
use crate::stats::{point_stats, welch_t, window_stats};
use machine::MachineHistories;

/// Parameters of the per-machine check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineParams {
    /// Separation (MT) above which a point departs from its machine
    pub threshold: f64,
    /// Values kept per machine (MH)
    pub history_size: usize,
}

/// Detector parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Historical window size (B)
    pub back_window: usize,
    /// Forward window size (F)
    pub fore_window: usize,
    /// Separation (T) at which a point becomes a change-point
    pub threshold: f64,
    pub machine: Option<MachineParams>,
    /// Lower values are better (timings); false for scores
    pub lower_is_better: bool,
}

impl DetectorParams {
    pub fn new(back_window: usize, fore_window: usize, threshold: f64) -> Self {
        Self {
            back_window,
            fore_window,
            threshold,
            machine: None,
            lower_is_better: true,
        }
    }

    pub fn with_machine(mut self, threshold: f64, history_size: usize) -> Self {
        self.machine = Some(MachineParams {
            threshold,
            history_size,
        });
        self
    }

    pub fn higher_is_better(mut self) -> Self {
        self.lower_is_better = false;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.back_window == 0 {
            return Err(ConfigError::Invalid {
                key: "back_window",
                reason: "must be > 0".to_string(),
            });
        }
        if self.fore_window == 0 {
            return Err(ConfigError::Invalid {
                key: "fore_window",
                reason: "must be > 0".to_string(),
            });
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "threshold",
                reason: format!("must be a positive number, got {}", self.threshold),
            });
        }
        if let Some(m) = self.machine {
            if !(m.threshold.is_finite() && m.threshold > 0.0) {
                return Err(ConfigError::Invalid {
                    key: "machine_threshold",
                    reason: format!("must be a positive number, got {}", m.threshold),
                });
            }
            if m.history_size == 0 {
                return Err(ConfigError::Invalid {
                    key: "machine_history_size",
                    reason: "must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Windowed change-point detector
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    params: DetectorParams,
}

/// Outcome of the per-machine screen for one point
#[derive(Debug, Clone, Copy, Default)]
struct MachineCheck {
    machine_t: f64,
    flagged: bool,
    baseline: WindowStats,
    last_other: Option<usize>,
}

/// Windows and separation at one aggregate position
#[derive(Debug, Clone, Copy)]
struct WindowScan {
    historical: WindowStats,
    forward: WindowStats,
    t: f64,
    change: bool,
}

impl ChangeDetector {
    pub fn new(params: DetectorParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Classify a push-ordered series
    ///
    /// Returns one classified datum per input datum, in input order. Existing
    /// classifications on the input are ignored, so replaying the output
    /// yields the same result.
    ///
    /// # Example
    /// ```
    /// use perfalert::datum::{PerfDatum, PointState};
    /// use perfalert::detector::{ChangeDetector, DetectorParams};
    ///
    /// let series: Vec<PerfDatum> = (0..20)
    ///     .map(|i| PerfDatum::new(i, if i < 10 { 100.0 } else { 150.0 }))
    ///     .collect();
    ///
    /// let detector = ChangeDetector::new(DetectorParams::new(5, 5, 3.0)).unwrap();
    /// let out = detector.analyze(&series);
    /// assert_eq!(out[10].state(), PointState::Regression);
    /// assert_eq!(out.iter().filter(|d| d.state().is_change()).count(), 1);
    /// ```
    pub fn analyze(&self, points: &[PerfDatum]) -> Vec<PerfDatum> {
        let data: Vec<PerfDatum> = points.iter().map(PerfDatum::unclassified).collect();

        let checks = self.screen_machines(&data);

        let aggregate: Vec<usize> = (0..data.len()).filter(|&i| !checks[i].flagged).collect();
        let values: Vec<f64> = aggregate.iter().map(|&i| data[i].value).collect();
        let scans = self.scan(&values);

        let mut classifications: Vec<Option<Classification>> = vec![None; data.len()];
        for (&i, scan) in aggregate.iter().zip(&scans) {
            classifications[i] = Some(Classification {
                state: self.direction(scan),
                historical_stats: scan.historical,
                forward_stats: scan.forward,
                t: scan.t,
                machine_t: checks[i].machine_t,
                last_other: None,
            });
        }
        for (i, check) in checks.iter().enumerate().filter(|(_, c)| c.flagged) {
            classifications[i] = Some(Classification {
                state: PointState::Machine,
                historical_stats: check.baseline,
                forward_stats: point_stats(data[i].value),
                t: 0.0,
                machine_t: check.machine_t,
                last_other: check.last_other,
            });
        }

        data.into_iter()
            .zip(classifications)
            .map(|(d, c)| match c {
                Some(c) => d.classified(c),
                None => d,
            })
            .collect()
    }

    fn direction(&self, scan: &WindowScan) -> PointState {
        if !scan.change {
            return PointState::Good;
        }
        let dropped = scan.forward.avg < scan.historical.avg;
        if dropped == self.params.lower_is_better {
            PointState::Improvement
        } else {
            PointState::Regression
        }
    }

    fn is_candidate(&self, t: f64) -> bool {
        t >= self.params.threshold
    }

    /// Walk the aggregate values, reporting the peak of each run of candidates
    fn scan(&self, values: &[f64]) -> Vec<WindowScan> {
        let n = values.len();
        let mut out = Vec::with_capacity(n);
        let mut baseline_start = 0;
        let mut g = 0;

        while g < n {
            let first = self.window_at(values, g, baseline_start);
            if !self.is_candidate(first.t) {
                out.push(first);
                g += 1;
                continue;
            }

            // Collect the run measured against the current baseline
            let mut run = vec![first];
            while g + run.len() < n {
                let next = self.window_at(values, g + run.len(), baseline_start);
                if !self.is_candidate(next.t) {
                    break;
                }
                run.push(next);
            }

            let peak = run
                .iter()
                .enumerate()
                .fold(0, |best, (k, s)| if s.t > run[best].t { k } else { best });

            for (k, mut s) in run.into_iter().enumerate().take(peak + 1) {
                s.change = k == peak;
                out.push(s);
            }

            baseline_start = g + peak;
            g = baseline_start + 1;
        }

        out
    }

    fn window_at(&self, values: &[f64], g: usize, baseline_start: usize) -> WindowScan {
        let b = self.params.back_window;
        let f = self.params.fore_window;

        let hist_lo = g.saturating_sub(b).max(baseline_start);
        let fwd_hi = (g + f).min(values.len());

        let historical = window_stats(&values[hist_lo..g]);
        let forward = window_stats(&values[g..fwd_hi]);

        // Short windows near the edges or just after a shift are not evidence
        let t = if historical.n == b && forward.n == f {
            welch_t(&historical, &forward)
        } else {
            0.0
        };

        WindowScan {
            historical,
            forward,
            t,
            change: false,
        }
    }

    fn screen_machines(&self, data: &[PerfDatum]) -> Vec<MachineCheck> {
        let mut checks = vec![MachineCheck::default(); data.len()];
        let Some(params) = self.params.machine else {
            return checks;
        };

        let mut histories = MachineHistories::new(params.history_size);

        for (i, d) in data.iter().enumerate() {
            let Some(identity) = d.identity.as_deref() else {
                continue;
            };

            if let Some(baseline) = histories.baseline(identity) {
                let machine_t = welch_t(&baseline, &point_stats(d.value));
                checks[i].machine_t = machine_t;
                checks[i].baseline = baseline;

                if machine_t > params.threshold
                    && self.departs_from_peers(data, &checks, &histories, i, &baseline)
                {
                    checks[i].flagged = true;
                    checks[i].last_other = last_other(data, &checks, i, identity);
                    continue;
                }
            }

            histories.record(identity, d.value);
        }

        checks
    }

    /// Does point `i` also stand apart from the other machines around it?
    ///
    /// Every value is taken relative to its own machine's baseline, so fixed
    /// per-machine offsets cancel: during a real shift the peers move with
    /// this machine (their baselines may already have absorbed part of the
    /// move), while a faulty machine moves alone. Peers
    /// are the next F points from other machines with a full history; at the
    /// tail of the series the previous F unflagged ones stand in. Without
    /// peers a machine fault cannot be told apart from a real shift and the
    /// answer is no.
    fn departs_from_peers(
        &self,
        data: &[PerfDatum],
        checks: &[MachineCheck],
        histories: &MachineHistories,
        i: usize,
        baseline: &WindowStats,
    ) -> bool {
        let Some(params) = self.params.machine else {
            return false;
        };
        let f = self.params.fore_window;
        let identity = data[i].identity.as_deref();

        let residual = |d: &PerfDatum| -> Option<f64> {
            let peer = d.identity.as_deref().filter(|&p| Some(p) != identity)?;
            histories.baseline(peer).map(|b| d.value - b.avg)
        };

        let mut peers: Vec<f64> = data[i + 1..].iter().filter_map(&residual).take(f).collect();

        if peers.is_empty() {
            peers = (0..i)
                .rev()
                .filter(|&j| !checks[j].flagged)
                .filter_map(|j| residual(&data[j]))
                .take(f)
                .collect();
        }

        if peers.is_empty() {
            return false;
        }

        let own = data[i].value - baseline.avg;
        let peers = window_stats(&peers);

        // Peers explain less than half of this machine's move
        let unexplained = 2.0 * (own - peers.avg).abs() > own.abs();
        unexplained && welch_t(&peers, &point_stats(own)) > params.threshold
    }
}

/// Most recent earlier point from another machine that was not itself flagged
fn last_other(
    data: &[PerfDatum],
    checks: &[MachineCheck],
    i: usize,
    identity: &str,
) -> Option<usize> {
    (0..i)
        .rev()
        .find(|&j| data[j].identity.as_deref() != Some(identity) && !checks[j].flagged)
}
