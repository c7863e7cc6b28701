//! Whole-tree compression with a discovery thread feeding a worker thread.
//!
//! The producer walks the tree depth-first, applies directory compression on
//! the way down and queues every file. The consumer drains the queue one file
//! at a time. Progress is tracked in bytes on disk so the totals line up with
//! what the user sees in Explorer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use jwalk::{Parallelism, WalkDir};
use parking_lot::Mutex;

use super::{Compactor, CompressOutcome, CompressionAlgorithm};
use crate::error::{CompactError, CompactResult};
use crate::platform::{CompressionBackend, FileAttributes};
use crate::signal::StopSignal;
use crate::volume::ClusterSize;

/// Interval at which an idle consumer re-checks the queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A file discovered by the producer.
#[derive(Debug, Clone)]
pub struct FileWorkItem {
    pub path: PathBuf,
    pub attributes: FileAttributes,
    /// Length rounded up to whole clusters.
    pub on_disk: u64,
}

/// Snapshot handed to the per-item callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraversalProgress {
    /// On-disk bytes of every file discovered so far.
    pub total_bytes: u64,
    /// On-disk bytes of every file finished before the current one.
    pub completed_bytes: u64,
    pub discovery_finished: bool,
    /// File the consumer is working on (or just finished, inside the callback).
    pub current: Option<PathBuf>,
    pub files_done: u64,
    pub failures: u64,
}

impl TraversalProgress {
    /// Completed fraction in `[0, 1]`; meaningful once discovery has finished.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.completed_bytes as f64 / self.total_bytes as f64).min(1.0)
    }
}

#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub algorithm: CompressionAlgorithm,
    pub min_ratio: f64,
    /// When unset only the root's own files are visited.
    pub recursive: bool,
    pub poll_interval: Duration,
    /// Optional external cancellation (Ctrl-C, service shutdown).
    pub stop: Option<StopSignal>,
}

impl TraversalOptions {
    pub fn new(algorithm: CompressionAlgorithm, min_ratio: f64) -> Self {
        Self {
            algorithm,
            min_ratio,
            recursive: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    pending: VecDeque<FileWorkItem>,
    current: Option<FileWorkItem>,
    total_bytes: u64,
    completed_bytes: u64,
    discovery_finished: bool,
    cancelled: bool,
    files_done: u64,
    failures: u64,
}

impl Shared {
    fn snapshot(&self) -> TraversalProgress {
        TraversalProgress {
            total_bytes: self.total_bytes,
            completed_bytes: self.completed_bytes,
            discovery_finished: self.discovery_finished,
            current: self.current.as_ref().map(|item| item.path.clone()),
            files_done: self.files_done,
            failures: self.failures,
        }
    }
}

/// Compress every file under `root`, calling `on_item` after each one.
///
/// Returning `false` from the callback discards all pending work and ends the
/// traversal after the current item. Per-file failures are logged and counted;
/// only failing to resolve the root is an error.
///
/// Discovery runs on a scoped thread while the calling thread consumes, so
/// returning means both sides have finished.
pub fn compress_tree<B, F>(
    compactor: &Compactor<B>,
    root: &Path,
    options: &TraversalOptions,
    mut on_item: F,
) -> CompactResult<TraversalProgress>
where
    B: CompressionBackend,
    F: FnMut(&TraversalProgress) -> bool,
{
    let attrs = compactor
        .backend()
        .attributes(root)
        .map_err(|e| CompactError::os("query attributes", root, e))?;
    if !attrs.is_dir {
        return Err(CompactError::Walk {
            path: root.to_path_buf(),
            message: "not a directory".to_string(),
        });
    }
    let cluster = compactor.cluster_size(root)?;

    tracing::info!(root = %root.display(), algorithm = %options.algorithm, "Starting tree compression");

    let shared = Mutex::new(Shared::default());
    thread::scope(|scope| {
        scope.spawn(|| produce(compactor, root, options, cluster, &shared));
        consume(compactor, options, cluster, &shared, &mut on_item);
    });

    let progress = shared.into_inner().snapshot();
    tracing::info!(
        files = progress.files_done,
        failures = progress.failures,
        completed_bytes = progress.completed_bytes,
        "Tree compression finished"
    );
    Ok(progress)
}

fn stop_requested(options: &TraversalOptions) -> bool {
    options.stop.as_ref().is_some_and(StopSignal::is_stopped)
}

fn produce<B: CompressionBackend>(
    compactor: &Compactor<B>,
    root: &Path,
    options: &TraversalOptions,
    cluster: ClusterSize,
    shared: &Mutex<Shared>,
) {
    let mut walk = walk_directories_first(root);
    if !options.recursive {
        walk = walk.max_depth(1);
    }
    for entry in walk {
        if shared.lock().cancelled || stop_requested(options) {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if let Err(e) = compactor.apply_directory(&path, options.algorithm) {
                tracing::debug!(path = %path.display(), "Directory compression not applied: {}", e);
            }
        } else if file_type.is_file() {
            match compactor.backend().attributes(&path) {
                Ok(attributes) => {
                    let on_disk = cluster.length_on_disk(attributes.length);
                    let mut state = shared.lock();
                    state.total_bytes += on_disk;
                    state.pending.push_back(FileWorkItem {
                        path,
                        attributes,
                        on_disk,
                    });
                }
                Err(e) => tracing::warn!(path = %path.display(), "Cannot read attributes: {}", e),
            }
        }
    }

    shared.lock().discovery_finished = true;
    tracing::debug!(root = %root.display(), "Discovery finished");
}

fn consume<B, F>(
    compactor: &Compactor<B>,
    options: &TraversalOptions,
    cluster: ClusterSize,
    shared: &Mutex<Shared>,
    on_item: &mut F,
) where
    B: CompressionBackend,
    F: FnMut(&TraversalProgress) -> bool,
{
    loop {
        let Some(item) = next_item(options, shared) else {
            break;
        };

        let result = compactor.apply(&item.path, options.algorithm, cluster, options.min_ratio);
        let progress = {
            let mut state = shared.lock();
            state.files_done += 1;
            match &result {
                Ok(outcome) => log_outcome(&item.path, outcome),
                Err(e) => {
                    state.failures += 1;
                    tracing::warn!("{}", e);
                }
            }
            state.snapshot()
        };

        if !on_item(&progress) {
            tracing::info!("Traversal stopped by caller");
            let mut state = shared.lock();
            state.pending.clear();
            state.cancelled = true;
        }
    }
}

/// Take the next item, first crediting the one just finished.
fn next_item(options: &TraversalOptions, shared: &Mutex<Shared>) -> Option<FileWorkItem> {
    let mut state = shared.lock();
    if let Some(done) = state.current.take() {
        state.completed_bytes += done.on_disk;
    }
    loop {
        if !state.cancelled && stop_requested(options) {
            state.pending.clear();
            state.cancelled = true;
        }
        if state.cancelled {
            return None;
        }
        if let Some(item) = state.pending.pop_front() {
            state.current = Some(item.clone());
            return Some(item);
        }
        if state.discovery_finished {
            return None;
        }
        parking_lot::MutexGuard::unlocked(&mut state, || thread::sleep(options.poll_interval));
    }
}

fn log_outcome(path: &Path, outcome: &CompressOutcome) {
    match outcome {
        CompressOutcome::Applied { ratio } => {
            tracing::debug!(path = %path.display(), ratio, "Compressed")
        }
        CompressOutcome::Rejected { ratio } => {
            tracing::debug!(path = %path.display(), ratio, "Left uncompressed")
        }
        CompressOutcome::Skipped | CompressOutcome::Decompressed => {}
    }
}

/// Serial pre-order walk that yields a directory's subdirectories before its
/// files, each group sorted by name.
pub(crate) fn walk_directories_first(root: &Path) -> WalkDir {
    WalkDir::new(root)
        .parallelism(Parallelism::Serial)
        .skip_hidden(false)
        .follow_links(false)
        .process_read_dir(|_depth, _path, _state, children| {
            children.sort_by(|a, b| match (a, b) {
                (Ok(a), Ok(b)) => b
                    .file_type
                    .is_dir()
                    .cmp(&a.file_type.is_dir())
                    .then_with(|| a.file_name.cmp(&b.file_name)),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => std::cmp::Ordering::Equal,
            });
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::MemoryFs;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/nested")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("top.bin"), vec![7u8; 10_000]).unwrap();
        fs::write(dir.path().join("a/one.bin"), vec![1u8; 20_000]).unwrap();
        fs::write(dir.path().join("a/nested/two.bin"), vec![2u8; 5_000]).unwrap();
        fs::write(dir.path().join("b/three.bin"), vec![3u8; 100]).unwrap();
        dir
    }

    fn options() -> TraversalOptions {
        TraversalOptions {
            poll_interval: Duration::from_millis(5),
            ..TraversalOptions::new(CompressionAlgorithm::Lzx, 1.0)
        }
    }

    #[test]
    fn accounting_never_exceeds_total() {
        let dir = tree();
        let compactor = Compactor::new(MemoryFs::new(), None);
        let mut seen = Vec::new();

        let progress = compress_tree(&compactor, dir.path(), &options(), |p| {
            seen.push(p.clone());
            true
        })
        .unwrap();

        // 10_000 -> 3 clusters, 20_000 -> 5, 5_000 -> 2, 100 -> 1
        let expected = (3 + 5 + 2 + 1) * 4096;
        assert_eq!(seen.len(), 4);
        assert_eq!(progress.files_done, 4);
        assert_eq!(progress.failures, 0);
        assert!(progress.discovery_finished);
        assert_eq!(progress.total_bytes, expected);
        assert_eq!(progress.completed_bytes, expected);
        assert_eq!(progress.current, None);
        for snapshot in &seen {
            assert!(snapshot.completed_bytes <= snapshot.total_bytes);
            assert!(snapshot.current.is_some());
        }
        assert!(seen.windows(2).all(|w| w[0].completed_bytes <= w[1].completed_bytes));
    }

    #[test]
    fn completed_bytes_credit_only_finished_items() {
        let dir = tree();
        let compactor = Compactor::new(MemoryFs::new(), None);
        let on_disk = |path: &Path| match path.file_name().and_then(|n| n.to_str()) {
            Some("top.bin") => 3 * 4096,
            Some("one.bin") => 5 * 4096,
            Some("two.bin") => 2 * 4096,
            Some("three.bin") => 4096,
            other => panic!("unexpected file {other:?}"),
        };
        let mut finished = 0u64;
        let mut previous: Option<PathBuf> = None;
        let mut calls = 0;

        let progress = compress_tree(&compactor, dir.path(), &options(), |p| {
            if let Some(done) = previous.take() {
                finished += on_disk(&done);
            }
            assert_eq!(p.completed_bytes, finished);
            previous = p.current.clone();
            calls += 1;
            true
        })
        .unwrap();

        assert_eq!(calls, 4);
        let last = previous.map(|p| on_disk(&p)).unwrap_or(0);
        assert_eq!(progress.completed_bytes, finished + last);
        assert_eq!(progress.completed_bytes, progress.total_bytes);
    }

    #[test]
    fn stopping_discards_pending_work() {
        let dir = tree();
        let compactor = Compactor::new(MemoryFs::new(), None);

        let progress = compress_tree(&compactor, dir.path(), &options(), |_| false).unwrap();

        assert_eq!(progress.files_done, 1);
        assert_eq!(progress.current, None);
        assert!(progress.completed_bytes > 0);
    }

    #[test]
    fn external_stop_ends_traversal() {
        let dir = tree();
        let compactor = Compactor::new(MemoryFs::new(), None);
        let stop = StopSignal::new();
        stop.stop();
        let opts = TraversalOptions {
            stop: Some(stop),
            ..options()
        };

        let progress = compress_tree(&compactor, dir.path(), &opts, |_| true).unwrap();
        assert_eq!(progress.files_done, 0);
    }

    #[test]
    fn failures_are_counted_and_traversal_continues() {
        let dir = tree();
        let fs = MemoryFs::new();
        fs.fail_times(dir.path().join("a/one.bin"), 5);
        let compactor = Compactor::new(fs, None);

        let progress = compress_tree(&compactor, dir.path(), &options(), |_| true).unwrap();
        assert_eq!(progress.files_done, 4);
        assert_eq!(progress.failures, 1);
    }

    #[test]
    fn protected_tree_is_refused_per_file() {
        let dir = tree();
        let compactor = Compactor::new(MemoryFs::new(), Some(dir.path().join("a")));

        let progress = compress_tree(&compactor, dir.path(), &options(), |_| true).unwrap();
        assert_eq!(progress.failures, 2);
        assert!(compactor
            .backend()
            .file(&dir.path().join("top.bin"))
            .unwrap()
            .external
            .is_some());
    }

    #[test]
    fn non_recursive_run_stays_at_top_level() {
        let dir = tree();
        let compactor = Compactor::new(MemoryFs::new(), None);
        let opts = TraversalOptions {
            recursive: false,
            ..options()
        };

        let progress = compress_tree(&compactor, dir.path(), &opts, |_| true).unwrap();
        assert_eq!(progress.files_done, 1);
        assert_eq!(progress.total_bytes, 3 * 4096);
    }

    #[test]
    fn walk_yields_directories_before_files() {
        let dir = tree();
        let names: Vec<_> = walk_directories_first(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .map(|e| e.path().strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        let pos = |p: &str| names.iter().position(|n| n == Path::new(p)).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("top.bin"));
        assert!(pos("a/nested") < pos("a/one.bin"));
        assert!(pos("a/nested/two.bin") < pos("a/one.bin"));
    }

    #[test]
    fn fraction_is_clamped() {
        let progress = TraversalProgress {
            total_bytes: 100,
            completed_bytes: 50,
            ..TraversalProgress::default()
        };
        assert_eq!(progress.fraction(), 0.5);
        assert_eq!(TraversalProgress::default().fraction(), 1.0);
    }
}
