// Per-machine rolling baselines
//
// Each identity keeps the last `capacity` values it produced that were not
// themselves flagged. A faulty machine therefore keeps being measured against
// its healthy past instead of absorbing its own bad values.

use crate::datum::WindowStats;
use crate::stats::window_stats;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub(crate) struct MachineHistories {
    capacity: usize,
    histories: HashMap<String, VecDeque<f64>>,
}

impl MachineHistories {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            histories: HashMap::new(),
        }
    }

    /// Statistics of a full history, `None` until `capacity` values were seen
    pub(crate) fn baseline(&self, identity: &str) -> Option<WindowStats> {
        let history = self.histories.get(identity)?;
        if history.len() < self.capacity {
            return None;
        }
        let values: Vec<f64> = history.iter().copied().collect();
        Some(window_stats(&values))
    }

    pub(crate) fn record(&mut self, identity: &str, value: f64) {
        let history = self
            .histories
            .entry(identity.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity + 1));
        history.push_back(value);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self, identity: &str) -> usize {
        self.histories.get(identity).map_or(0, VecDeque::len)
    }
}
