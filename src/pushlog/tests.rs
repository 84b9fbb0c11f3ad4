use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

/// In-memory push log that counts requests
#[derive(Default)]
struct FakePushLog {
    pushes: Vec<Push>,
    fail: bool,
    changeset_calls: AtomicUsize,
    range_calls: AtomicUsize,
    batches: Mutex<Vec<usize>>,
}

impl FakePushLog {
    fn with_pushes(pushes: Vec<Push>) -> Self {
        Self {
            pushes,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.changeset_calls.load(Ordering::SeqCst) + self.range_calls.load(Ordering::SeqCst)
    }
}

impl PushLogSource for &FakePushLog {
    fn fetch_changesets(&self, _branch: &str, revisions: &[String]) -> Result<Vec<Push>, PushLogError> {
        self.changeset_calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(revisions.len());
        if self.fail {
            return Err(PushLogError::Unavailable);
        }
        Ok(self
            .pushes
            .iter()
            .filter(|p| {
                p.changesets
                    .iter()
                    .any(|c| revisions.iter().any(|r| c.node.starts_with(r.as_str())))
            })
            .cloned()
            .collect())
    }

    fn fetch_range(&self, _branch: &str, _from: &str, _to: &str) -> Result<Vec<Push>, PushLogError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PushLogError::Unavailable);
        }
        Ok(self.pushes.clone())
    }
}

fn node(prefix: &str) -> String {
    format!("{:0<40}", prefix)
}

fn push(id: u32, date: i64, nodes: &[&str]) -> Push {
    Push {
        id: id.to_string(),
        date,
        user: format!("pusher{}@example.com", id),
        changesets: nodes
            .iter()
            .map(|n| Changeset {
                node: node(n),
                author: format!("Author of {}", n),
                desc: format!("Bug {} - change", id),
            })
            .collect(),
    }
}

fn fixture() -> FakePushLog {
    FakePushLog::with_pushes(vec![
        push(1, 1000, &["aaaaaaaaaaaa"]),
        push(2, 2000, &["bbbbbbbbbbbb", "cccccccccccc"]),
        push(3, 3000, &["0000000000dd"]),
    ])
}

fn revs(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_resolve_fetches_missing_and_caches() {
    let source = fixture();
    let index = RevisionIndex::new(&source, 50);

    let times = index.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa", "cccccccccccc"]));
    assert_eq!(times.get("aaaaaaaaaaaa"), Some(&1000));
    assert_eq!(times.get("cccccccccccc"), Some(&2000));
    assert_eq!(source.calls(), 1);

    // Second lookup, plus a revision merged from the same push
    let again = index.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa", "bbbbbbbbbbbb"]));
    assert_eq!(again.get("bbbbbbbbbbbb"), Some(&2000));
    assert_eq!(source.calls(), 1);
}

#[test]
fn test_long_revisions_keyed_by_original_string() {
    let source = fixture();
    let index = RevisionIndex::new(&source, 50);

    let full = node("bbbbbbbbbbbb");
    let times = index.resolve_push_times("m-c", &[full.clone()]);
    assert_eq!(times.get(&full), Some(&2000));
    assert_eq!(index.metadata("m-c", &full).unwrap().pusher, "pusher2@example.com");
}

#[test]
fn test_stripped_leading_zeros_are_restored() {
    let source = fixture();
    let index = RevisionIndex::new(&source, 50);

    let times = index.resolve_push_times("m-c", &revs(&["dd"]));
    assert_eq!(times.get("dd"), Some(&3000));
}

#[test]
fn test_unknown_revision_is_absent() {
    let source = fixture();
    let index = RevisionIndex::new(&source, 50);

    let times = index.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa", "ffffffffffff"]));
    assert_eq!(times.len(), 1);
    assert!(!times.contains_key("ffffffffffff"));
}

#[test]
fn test_requests_are_batched() {
    let source = FakePushLog::default();
    let index = RevisionIndex::new(&source, 2);

    let many = revs(&["1", "2", "3", "4", "5"]);
    index.resolve_push_times("m-c", &many);

    assert_eq!(*source.batches.lock().unwrap(), vec![2, 2, 1]);
}

#[test]
fn test_fetch_failure_is_soft() {
    let source = FakePushLog::failing();
    let index = RevisionIndex::new(&source, 50);

    let times = index.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa"]));
    assert!(times.is_empty());
    assert!(index.snapshot().get("m-c").is_none());
}

#[test]
fn test_cache_survives_persist_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pushlog.json");

    let source = fixture();
    let index = RevisionIndex::load(&source, 50, &path);
    let first = index.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa", "cccccccccccc"]));
    index.save().unwrap();

    // Reload against a source that would fail if it were asked
    let offline = FakePushLog::failing();
    let reloaded = RevisionIndex::load(&offline, 50, &path);
    let second = reloaded.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa", "cccccccccccc"]));

    assert_eq!(first, second);
    assert_eq!(offline.calls(), 0);
    assert_eq!(reloaded.snapshot(), index.snapshot());
}

#[test]
fn test_range_is_ordered_and_cached() {
    let source = FakePushLog::with_pushes(vec![
        push(2, 2000, &["bbbbbbbbbbbb", "cccccccccccc"]),
        push(1, 1000, &["aaaaaaaaaaaa"]),
    ]);
    let index = RevisionIndex::new(&source, 50);

    let range = index.resolve_range("m-c", "aaaaaaaaaaaa", "cccccccccccc");
    assert_eq!(range, revs(&["aaaaaaaaaaaa", "bbbbbbbbbbbb", "cccccccccccc"]));

    let again = index.resolve_range("m-c", "aaaaaaaaaaaa", "cccccccccccc");
    assert_eq!(again, range);
    assert_eq!(source.range_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_range_populates_metadata() {
    let source = fixture();
    let index = RevisionIndex::new(&source, 50);

    index.resolve_range("m-c", "aaaaaaaaaaaa", "0000000000dd");
    let info = index.metadata("m-c", "cccccccccccc").unwrap();
    assert_eq!(info.date, 2000);
    assert_eq!(info.author, "Author of cccccccccccc");
    assert_eq!(info.comments, "Bug 2 - change");

    // Lookups now hit the cache
    index.resolve_push_times("m-c", &revs(&["bbbbbbbbbbbb"]));
    assert_eq!(source.changeset_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_range_failure_not_cached() {
    let source = FakePushLog::failing();
    let index = RevisionIndex::new(&source, 50);

    assert!(index.resolve_range("m-c", "a", "b").is_empty());
    assert!(index.resolve_range("m-c", "a", "b").is_empty());
    assert_eq!(source.range_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_branches_are_independent() {
    let source = fixture();
    let index = RevisionIndex::new(&source, 50);

    index.resolve_push_times("m-c", &revs(&["aaaaaaaaaaaa"]));
    index.resolve_push_times("try", &revs(&["aaaaaaaaaaaa"]));

    assert_eq!(source.calls(), 2);
    assert!(index.metadata("try", "aaaaaaaaaaaa").is_some());
}

#[test]
fn test_revision_normalisation() {
    assert_eq!(pad_revision("abc"), "000000000abc");
    assert_eq!(short_revision("abc"), "000000000abc");
    assert_eq!(short_revision(&node("0123456789ab")), "0123456789ab");
    assert_eq!(pad_revision(&node("x")).len(), 40);
}
