//! One watched directory tree: initial sweep, then live notifications.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::WatchContext;
use crate::compress::traversal::walk_directories_first;
use crate::config::WatchEntry;
use crate::platform::{self, CompressionBackend};
use crate::signal::StopSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Disabled,
    /// The initial sweep is running; notifications are not yet enabled.
    Initializing,
    Live,
}

/// A filesystem change reduced to what the pending queue needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Changed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    Deleted(PathBuf),
}

/// Turns `notify` events into [`Change`]s, pairing split rename halves.
#[derive(Debug, Default)]
pub struct EventTranslator {
    rename_from: Option<PathBuf>,
}

impl EventTranslator {
    pub fn translate(&mut self, event: &Event) -> Vec<Change> {
        let mut changes = Vec::new();
        match &event.kind {
            EventKind::Create(_) => {
                changes.extend(event.paths.iter().cloned().map(Change::Changed));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    changes.push(Change::Renamed {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(orphan) = self.rename_from.take() {
                    changes.push(Change::Deleted(orphan));
                }
                self.rename_from = event.paths.first().cloned();
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for to in &event.paths {
                    match self.rename_from.take() {
                        Some(from) => changes.push(Change::Renamed {
                            from,
                            to: to.clone(),
                        }),
                        None => changes.push(Change::Changed(to.clone())),
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.exists() {
                        changes.push(Change::Changed(path.clone()));
                    } else {
                        changes.push(Change::Deleted(path.clone()));
                    }
                }
            }
            EventKind::Modify(_) => {
                changes.extend(event.paths.iter().cloned().map(Change::Changed));
            }
            EventKind::Remove(_) => {
                changes.extend(event.paths.iter().cloned().map(Change::Deleted));
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
        changes
    }
}

/// A watched root and its background state.
pub struct RootWatcher {
    entry: WatchEntry,
    state: Arc<Mutex<WatchState>>,
    stop: StopSignal,
    initializer: Option<JoinHandle<()>>,
    notifier: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl RootWatcher {
    /// Start the initial sweep on a low-priority thread. Notifications are
    /// enabled once it completes.
    pub(crate) fn enable<B>(entry: WatchEntry, context: Arc<WatchContext<B>>) -> io::Result<Self>
    where
        B: CompressionBackend + 'static,
    {
        let state = Arc::new(Mutex::new(WatchState::Initializing));
        let stop = StopSignal::new();
        let notifier = Arc::new(Mutex::new(None));

        let initializer = {
            let entry = entry.clone();
            let state = Arc::clone(&state);
            let stop = stop.clone();
            let notifier = Arc::clone(&notifier);
            thread::Builder::new()
                .name(format!("watch-init-{}", entry.path.display()))
                .spawn(move || {
                    platform::lower_thread_priority();
                    if !initialize(&entry, &context, &stop) {
                        return;
                    }
                    match start_notifications(&entry, &context, &stop) {
                        Ok(watcher) => {
                            *notifier.lock() = Some(watcher);
                            *state.lock() = WatchState::Live;
                            tracing::info!(root = %entry.path.display(), "Watching for changes");
                        }
                        Err(e) => {
                            *state.lock() = WatchState::Disabled;
                            tracing::error!(
                                root = %entry.path.display(),
                                "Cannot watch for changes: {}",
                                e
                            );
                        }
                    }
                })?
        };

        Ok(Self {
            entry,
            state,
            stop,
            initializer: Some(initializer),
            notifier,
        })
    }

    pub fn entry(&self) -> &WatchEntry {
        &self.entry
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }

    /// Stop the sweep, wait for its thread and drop the notification handle.
    pub fn disable(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.initializer.take() {
            if handle.join().is_err() {
                tracing::warn!(root = %self.entry.path.display(), "Initializer thread panicked");
            }
        }
        self.notifier.lock().take();
        *self.state.lock() = WatchState::Disabled;
    }
}

impl Drop for RootWatcher {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Compact everything already under the root, subdirectories before files.
/// Returns `false` if stopped part-way.
fn initialize<B: CompressionBackend>(
    entry: &WatchEntry,
    context: &WatchContext<B>,
    stop: &StopSignal,
) -> bool {
    let started = Instant::now();
    tracing::info!(root = %entry.path.display(), algorithm = %entry.algorithm, "Initializing watch root");

    let mut walk = walk_directories_first(&entry.path);
    if !entry.recursive {
        walk = walk.max_depth(1);
    }

    let mut files = 0u64;
    for item in walk {
        if stop.is_stopped() || context.is_stopping() {
            tracing::info!(root = %entry.path.display(), files, "Initialization interrupted");
            return false;
        }
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", entry.path.display(), e);
                continue;
            }
        };
        let path = item.path();
        if item.file_type().is_dir() {
            if let Err(e) = context.compactor.apply_directory(&path, entry.algorithm) {
                tracing::debug!(path = %path.display(), "Directory compression not applied: {}", e);
            }
        } else if item.file_type().is_file() {
            files += 1;
            if !context.process_initial(path, entry.algorithm) {
                return false;
            }
        }
    }

    tracing::info!(
        root = %entry.path.display(),
        files,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Watch root initialized"
    );
    true
}

fn start_notifications<B>(
    entry: &WatchEntry,
    context: &Arc<WatchContext<B>>,
    stop: &StopSignal,
) -> notify::Result<RecommendedWatcher>
where
    B: CompressionBackend + 'static,
{
    let context = Arc::clone(context);
    let stop = stop.clone();
    let algorithm = entry.algorithm;
    let root = entry.path.clone();
    let mut translator = EventTranslator::default();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if stop.is_stopped() || context.is_stopping() {
                return;
            }
            for change in translator.translate(&event) {
                context.record(change, algorithm, Instant::now());
            }
        }
        Err(e) => tracing::warn!(root = %root.display(), "Watch error: {}", e),
    })?;

    let mode = if entry.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(&entry.path, mode)?;
    Ok(watcher)
}
