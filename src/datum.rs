//! Measurement data model
//!
//! A [`PerfDatum`] is one measurement of one series. Raw fields come from the
//! data source; the [`Classification`] is attached only by the change detector
//! and is never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Classification outcome for a single point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointState {
    /// No change-point at this position
    Good,
    /// The metric got worse starting at this point
    Regression,
    /// The metric got better starting at this point
    Improvement,
    /// The point deviates from its own machine's history but not from its peers
    Machine,
}

impl PointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointState::Good => "good",
            PointState::Regression => "regression",
            PointState::Improvement => "improvement",
            PointState::Machine => "machine",
        }
    }

    /// True for every state a human may need to hear about
    pub fn is_change(&self) -> bool {
        !matches!(self, PointState::Good)
    }
}

impl fmt::Display for PointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mean, sample variance and size of one window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub avg: f64,
    pub variance: f64,
    pub n: usize,
}

/// Everything the detector derives for one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub state: PointState,
    pub historical_stats: WindowStats,
    pub forward_stats: WindowStats,
    /// Separation between the historical and forward windows
    pub t: f64,
    /// Separation between this point and its own machine's history
    pub machine_t: f64,
    /// Index (in the analyzed sequence) of the comparison point for `Machine` points
    pub last_other: Option<usize>,
}

/// A raw sample as delivered by a data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub value: f64,
    pub testrun_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildid: Option<String>,
}

/// One measurement of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfDatum {
    /// Producing machine; `None` for single-machine series
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Wall-clock time the measurement was produced
    pub testrun_timestamp: i64,
    /// Push time of the measured revision, once resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<Classification>,
}

impl PerfDatum {
    pub fn new(testrun_timestamp: i64, value: f64) -> Self {
        Self {
            identity: None,
            testrun_timestamp,
            push_timestamp: None,
            revision: None,
            value,
            buildid: None,
            classification: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_push_timestamp(mut self, push_timestamp: i64) -> Self {
        self.push_timestamp = Some(push_timestamp);
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_buildid(mut self, buildid: impl Into<String>) -> Self {
        self.buildid = Some(buildid.into());
        self
    }

    /// Position in push order; arrival time stands in while the push is unknown
    pub fn order_key(&self) -> i64 {
        self.push_timestamp.unwrap_or(self.testrun_timestamp)
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    /// `Good` until classified
    pub fn state(&self) -> PointState {
        self.classification
            .as_ref()
            .map_or(PointState::Good, |c| c.state)
    }

    pub fn is_classified(&self) -> bool {
        self.classification.is_some()
    }

    /// Unclassified copy of this datum; the detector starts from these
    pub(crate) fn unclassified(&self) -> Self {
        Self {
            classification: None,
            ..self.clone()
        }
    }

    pub(crate) fn classified(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }
}

impl From<RawSample> for PerfDatum {
    fn from(sample: RawSample) -> Self {
        Self {
            identity: sample.identity,
            testrun_timestamp: sample.testrun_timestamp,
            push_timestamp: None,
            revision: sample.revision,
            value: sample.value,
            buildid: sample.buildid,
            classification: None,
        }
    }
}

/// Push order with arrival order breaking ties
pub fn push_order(a: &PerfDatum, b: &PerfDatum) -> Ordering {
    a.order_key()
        .cmp(&b.order_key())
        .then_with(|| a.testrun_timestamp.cmp(&b.testrun_timestamp))
}

/// Stable sort into push order
pub fn sort_by_push_order(points: &mut [PerfDatum]) {
    points.sort_by(push_order);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Attach a bare classification with the given state
    pub(crate) fn classified(datum: PerfDatum, state: PointState) -> PerfDatum {
        datum.classified(Classification {
            state,
            historical_stats: WindowStats::default(),
            forward_stats: WindowStats::default(),
            t: 0.0,
            machine_t: 0.0,
            last_other: None,
        })
    }
}
