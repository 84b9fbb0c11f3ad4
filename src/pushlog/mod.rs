// Revision → push time index
//
// Measurements name the revision they were built from; analysis needs the
// time that revision was pushed. The index answers from a persistent
// per-branch cache and asks a `PushLogSource` only for revisions it has never
// seen. Cached entries are never evicted.
//
// Lookups are soft: a failed or malformed fetch leaves the affected revisions
// unresolved and the caller falls back to arrival order for those points.
//
// Locking: the cache sits behind an RwLock. Lookups of resolved entries share
// the read lock; a fetch happens with no lock held and its results are merged
// under a short write lock.

mod http;
pub mod json;

pub use http::{HgPushLog, OfflinePushLog};
pub use json::{parse_pushes, Changeset, Push};

use crate::persist::{self, PersistError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Length of the short revision form used as cache key
pub const SHORT_REV_LEN: usize = 12;

/// Errors from a push-log source
#[derive(Error, Debug)]
pub enum PushLogError {
    #[error("push log request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push log returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("malformed push log response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no push log service configured")]
    Unavailable,
}

/// Read access to push-log data for a branch
pub trait PushLogSource: Send + Sync {
    /// Pushes containing any of `revisions`
    fn fetch_changesets(&self, branch: &str, revisions: &[String]) -> Result<Vec<Push>, PushLogError>;

    /// Pushes between `from` and `to`, inclusive
    fn fetch_range(&self, branch: &str, from: &str, to: &str) -> Result<Vec<Push>, PushLogError>;
}

impl<T: PushLogSource + ?Sized> PushLogSource for Box<T> {
    fn fetch_changesets(&self, branch: &str, revisions: &[String]) -> Result<Vec<Push>, PushLogError> {
        (**self).fetch_changesets(branch, revisions)
    }

    fn fetch_range(&self, branch: &str, from: &str, to: &str) -> Result<Vec<Push>, PushLogError> {
        (**self).fetch_range(branch, from, to)
    }
}

/// Push metadata for one changeset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    /// Push time
    pub date: i64,
    pub author: String,
    pub pusher: String,
    pub comments: String,
}

/// Cached data for one branch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchCache {
    /// short revision → metadata
    pub changes: BTreeMap<String, ChangeInfo>,
    /// "from-to" → short revisions in push order
    pub ranges: BTreeMap<String, Vec<String>>,
}

impl BranchCache {
    fn merge(&mut self, pushes: &[Push]) {
        for push in pushes {
            for change in &push.changesets {
                self.changes.insert(
                    short_revision(&change.node),
                    ChangeInfo {
                        date: push.date,
                        author: change.author.clone(),
                        pusher: push.user.clone(),
                        comments: change.desc.clone(),
                    },
                );
            }
        }
    }
}

/// Serialized form of the index: branch → cache
pub type PushLogState = BTreeMap<String, BranchCache>;

/// Left-pad with `0` to the short length
///
/// Some producers drop leading zeros from revision ids.
pub fn pad_revision(revision: &str) -> String {
    let len = revision.chars().count();
    if len >= SHORT_REV_LEN {
        return revision.to_string();
    }
    let mut padded = "0".repeat(SHORT_REV_LEN - len);
    padded.push_str(revision);
    padded
}

/// Cache key for a revision: padded, then cut to the short length
pub fn short_revision(revision: &str) -> String {
    pad_revision(revision).chars().take(SHORT_REV_LEN).collect()
}

/// Cached revision → push time lookup
#[derive(Debug)]
pub struct RevisionIndex<S> {
    source: S,
    batch_size: usize,
    path: Option<PathBuf>,
    state: RwLock<PushLogState>,
}

impl<S: PushLogSource> RevisionIndex<S> {
    /// In-memory index over `source`
    pub fn new(source: S, batch_size: usize) -> Self {
        Self::from_state(source, batch_size, PushLogState::default(), None)
    }

    pub fn from_state(
        source: S,
        batch_size: usize,
        state: PushLogState,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            path,
            state: RwLock::new(state),
        }
    }

    /// Load the cache from `path`; an unreadable cache starts empty
    pub fn load(source: S, batch_size: usize, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let state: PushLogState = persist::load_json_or_default(path, "push log cache");
        tracing::debug!(
            "Loaded push log cache for {} branches from {}",
            state.len(),
            path.display()
        );
        Self::from_state(source, batch_size, state, Some(path.to_path_buf()))
    }

    fn read(&self) -> RwLockReadGuard<'_, PushLogState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PushLogState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn cached_date(&self, branch: &str, short: &str) -> Option<i64> {
        self.read()
            .get(branch)
            .and_then(|b| b.changes.get(short))
            .map(|c| c.date)
    }

    /// Push time for each revision that could be resolved
    ///
    /// Keys are the revision strings exactly as passed in. Revisions that are
    /// not cached are fetched in batches; a failed batch is logged and its
    /// revisions are left out of the result.
    pub fn resolve_push_times(&self, branch: &str, revisions: &[String]) -> HashMap<String, i64> {
        let mut resolved = HashMap::with_capacity(revisions.len());
        // padded revision → original spellings
        let mut missing: BTreeMap<String, Vec<&String>> = BTreeMap::new();

        {
            let state = self.read();
            let changes = state.get(branch).map(|b| &b.changes);
            for revision in revisions {
                let padded = pad_revision(revision);
                let short = short_revision(&padded);
                match changes.and_then(|c| c.get(&short)) {
                    Some(info) => {
                        resolved.insert(revision.clone(), info.date);
                    }
                    None => missing.entry(padded).or_default().push(revision),
                }
            }
        }

        if missing.is_empty() {
            return resolved;
        }

        tracing::debug!("Fetching {} changesets for {}", missing.len(), branch);
        let to_query: Vec<String> = missing.keys().cloned().collect();

        for chunk in to_query.chunks(self.batch_size) {
            let pushes = match self.source.fetch_changesets(branch, chunk) {
                Ok(pushes) => pushes,
                Err(e) => {
                    tracing::warn!(
                        "Couldn't resolve {} changesets on {}: {}",
                        chunk.len(),
                        branch,
                        e
                    );
                    continue;
                }
            };

            self.write()
                .entry(branch.to_string())
                .or_default()
                .merge(&pushes);

            for padded in chunk {
                let short = short_revision(padded);
                match self.cached_date(branch, &short) {
                    Some(date) => {
                        for original in missing.get(padded).into_iter().flatten() {
                            resolved.insert((*original).clone(), date);
                        }
                    }
                    None => tracing::debug!("{} not found in push data", short),
                }
            }
        }

        resolved
    }

    /// Short revisions from `from` to `to` inclusive, in push order
    ///
    /// Successful fetches are cached by the `(from, to)` pair. A failure
    /// yields an empty list and is retried on the next call.
    pub fn resolve_range(&self, branch: &str, from: &str, to: &str) -> Vec<String> {
        let key = format!("{}-{}", from, to);

        if let Some(range) = self.read().get(branch).and_then(|b| b.ranges.get(&key)) {
            return range.clone();
        }

        tracing::debug!("Fetching changesets from {} to {}", from, to);
        let mut pushes = match self.source.fetch_range(branch, from, to) {
            Ok(pushes) => pushes,
            Err(e) => {
                tracing::warn!("Couldn't fetch range {} on {}: {}", key, branch, e);
                return Vec::new();
            }
        };

        pushes.sort_by_key(|p| p.date);
        let range: Vec<String> = pushes
            .iter()
            .flat_map(|p| p.changesets.iter().map(|c| short_revision(&c.node)))
            .collect();

        let mut state = self.write();
        let cache = state.entry(branch.to_string()).or_default();
        cache.merge(&pushes);
        cache.ranges.insert(key, range.clone());

        range
    }

    /// Metadata of a cached revision
    pub fn metadata(&self, branch: &str, revision: &str) -> Option<ChangeInfo> {
        self.read()
            .get(branch)
            .and_then(|b| b.changes.get(&short_revision(revision)))
            .cloned()
    }

    /// Copy of the current cache
    pub fn snapshot(&self) -> PushLogState {
        self.read().clone()
    }

    /// Write the cache atomically; a no-op for in-memory indexes
    pub fn save(&self) -> Result<(), PersistError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = self.snapshot();
        tracing::debug!("Saving push log cache to {}", path.display());
        persist::save_json_atomic(path, &state)
    }
}

#[cfg(test)]
mod tests;
