//! Debounced, retryable set of paths waiting to be compacted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::compress::CompressionAlgorithm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub path: PathBuf,
    pub algorithm: CompressionAlgorithm,
    /// Last event time, or the earliest retry time after a failure.
    pub timestamp: Instant,
}

/// Pending work keyed by path, behind one lock.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<HashMap<PathBuf, PendingEntry>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a create or change. Repeated events collapse into one entry;
    /// a deferred retry time is never moved earlier.
    pub fn changed(&self, path: PathBuf, algorithm: CompressionAlgorithm, now: Instant) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&path) {
            Some(entry) => {
                entry.timestamp = entry.timestamp.max(now);
                entry.algorithm = algorithm;
            }
            None => {
                entries.insert(
                    path.clone(),
                    PendingEntry {
                        path,
                        algorithm,
                        timestamp: now,
                    },
                );
            }
        }
    }

    /// Move a pending entry from `from` to `to`, keeping its timestamp.
    /// Without one, `to` is recorded as a fresh change.
    pub fn renamed(&self, from: &Path, to: PathBuf, algorithm: CompressionAlgorithm, now: Instant) {
        let mut entries = self.entries.lock();
        let entry = match entries.remove(from) {
            Some(mut entry) => {
                entry.path = to.clone();
                if let Some(existing) = entries.get(&to) {
                    entry.timestamp = entry.timestamp.max(existing.timestamp);
                }
                entry
            }
            None => match entries.get(&to) {
                Some(existing) => PendingEntry {
                    timestamp: existing.timestamp.max(now),
                    ..existing.clone()
                },
                None => PendingEntry {
                    path: to.clone(),
                    algorithm,
                    timestamp: now,
                },
            },
        };
        entries.insert(to, entry);
    }

    pub fn deleted(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    /// Defer `path` until `until`, as after a failed first attempt.
    pub fn defer(&self, path: PathBuf, algorithm: CompressionAlgorithm, until: Instant) {
        self.changed(path, algorithm, until);
    }

    /// Entries quiet for longer than `debounce`, oldest first.
    pub fn ready(&self, debounce: Duration, now: Instant) -> Vec<PendingEntry> {
        let mut ready: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|entry| now.saturating_duration_since(entry.timestamp) > debounce)
            .cloned()
            .collect();
        ready.sort_by_key(|entry| entry.timestamp);
        ready
    }

    /// Time until the next entry becomes ready, if any are pending.
    pub fn next_ready_in(&self, debounce: Duration, now: Instant) -> Option<Duration> {
        self.entries
            .lock()
            .values()
            .map(|entry| (entry.timestamp + debounce).saturating_duration_since(now))
            .min()
    }

    /// Remove a processed entry unless a newer event arrived meanwhile.
    pub fn complete(&self, processed: &PendingEntry) {
        let mut entries = self.entries.lock();
        if entries
            .get(&processed.path)
            .is_some_and(|current| current.timestamp == processed.timestamp)
        {
            entries.remove(&processed.path);
        }
    }

    /// Push a failed entry's timestamp to `now + backoff`.
    pub fn retry_later(&self, failed: &PendingEntry, backoff: Duration, now: Instant) {
        if let Some(entry) = self.entries.lock().get_mut(&failed.path) {
            entry.timestamp = entry.timestamp.max(now + backoff);
        }
    }

    pub fn get(&self, path: &Path) -> Option<PendingEntry> {
        self.entries.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LZX: CompressionAlgorithm = CompressionAlgorithm::Lzx;
    const DEBOUNCE: Duration = Duration::from_secs(1);

    #[test]
    fn rapid_changes_collapse_to_last_event() {
        let queue = PendingQueue::new();
        let start = Instant::now();
        for ms in [0, 100, 250, 400] {
            queue.changed(PathBuf::from("/d/a"), LZX, start + Duration::from_millis(ms));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.get(Path::new("/d/a")).unwrap().timestamp,
            start + Duration::from_millis(400)
        );
        assert!(queue.ready(DEBOUNCE, start + Duration::from_millis(1300)).is_empty());
        assert_eq!(queue.ready(DEBOUNCE, start + Duration::from_millis(1401)).len(), 1);
    }

    #[test]
    fn rename_keeps_original_timestamp() {
        let queue = PendingQueue::new();
        let start = Instant::now();
        queue.changed(PathBuf::from("/d/a.tmp"), LZX, start);
        queue.renamed(
            Path::new("/d/a.tmp"),
            PathBuf::from("/d/a.doc"),
            LZX,
            start + Duration::from_secs(30),
        );

        assert!(queue.get(Path::new("/d/a.tmp")).is_none());
        let moved = queue.get(Path::new("/d/a.doc")).unwrap();
        assert_eq!(moved.timestamp, start);
        assert_eq!(moved.path, PathBuf::from("/d/a.doc"));
    }

    #[test]
    fn rename_without_pending_entry_is_a_change() {
        let queue = PendingQueue::new();
        let now = Instant::now();
        queue.renamed(Path::new("/d/x"), PathBuf::from("/d/y"), LZX, now);
        assert_eq!(queue.get(Path::new("/d/y")).unwrap().timestamp, now);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn delete_removes_any_state() {
        let queue = PendingQueue::new();
        let now = Instant::now();
        queue.changed(PathBuf::from("/d/a"), LZX, now);
        let entry = queue.get(Path::new("/d/a")).unwrap();
        queue.retry_later(&entry, Duration::from_secs(60), now);
        queue.deleted(Path::new("/d/a"));
        assert!(queue.is_empty());
    }

    #[test]
    fn failure_backs_off_and_changes_do_not_shorten_it() {
        let queue = PendingQueue::new();
        let start = Instant::now();
        let backoff = Duration::from_secs(60);
        queue.changed(PathBuf::from("/d/a"), LZX, start);

        let attempt = start + Duration::from_secs(2);
        let entry = queue.ready(DEBOUNCE, attempt).pop().unwrap();
        queue.retry_later(&entry, backoff, attempt);
        queue.changed(PathBuf::from("/d/a"), LZX, attempt + Duration::from_secs(5));

        assert_eq!(queue.get(Path::new("/d/a")).unwrap().timestamp, attempt + backoff);
        assert!(queue.ready(DEBOUNCE, attempt + backoff).is_empty());
        assert_eq!(queue.ready(DEBOUNCE, attempt + backoff + DEBOUNCE * 2).len(), 1);
        assert_eq!(
            queue.next_ready_in(DEBOUNCE, attempt),
            Some(backoff + DEBOUNCE)
        );
    }

    #[test]
    fn completion_keeps_entries_touched_during_processing() {
        let queue = PendingQueue::new();
        let start = Instant::now();
        queue.changed(PathBuf::from("/d/a"), LZX, start);
        queue.changed(PathBuf::from("/d/b"), LZX, start);
        let snapshot = queue.ready(DEBOUNCE, start + Duration::from_secs(2));

        queue.changed(PathBuf::from("/d/b"), LZX, start + Duration::from_secs(3));
        for entry in &snapshot {
            queue.complete(entry);
        }
        assert!(queue.get(Path::new("/d/a")).is_none());
        assert!(queue.get(Path::new("/d/b")).is_some());
    }
}
