//! Keeps watched trees compacted as files change.
//!
//! Each [`WatchEntry`] gets a [`RootWatcher`] that sweeps the existing tree
//! once and then feeds change notifications into a shared [`PendingQueue`].
//! A reconciler thread picks up entries that have been quiet for the debounce
//! window and compacts them behind the drive's idle gate. Files are only
//! touched while their archive attribute is set; it is cleared on success.

pub mod pending;
pub mod root;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::compress::{Compactor, CompressionAlgorithm};
use crate::config::{Settings, WatchEntry};
use crate::error::{CompactError, CompactResult};
use crate::monitor::{IdleThresholds, MonitorRegistry};
use crate::platform::{self, CompressionBackend};
use crate::signal::{StopSignal, Wakeup};
use crate::volume;

pub use pending::{PendingEntry, PendingQueue};
pub use root::{Change, RootWatcher, WatchState};

#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub retry_backoff: Duration,
    /// Longest sleep between sweeps; notifications cut it short.
    pub reconcile_interval: Duration,
    pub idle: IdleThresholds,
    pub min_ratio: f64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for WatchOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            debounce: settings.debounce(),
            retry_backoff: settings.retry_backoff(),
            reconcile_interval: settings.reconcile_interval(),
            idle: settings.idle_thresholds(),
            min_ratio: settings.min_ratio,
        }
    }
}

/// Counts from one reconciler sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub completed: usize,
    pub failed: usize,
    /// Entries dropped without retry (protected paths).
    pub dropped: usize,
}

/// State shared by the reconciler, the root initializers and the
/// notification callbacks.
pub(crate) struct WatchContext<B> {
    pub(crate) compactor: Compactor<B>,
    pub(crate) monitors: Arc<MonitorRegistry>,
    pub(crate) pending: PendingQueue,
    pub(crate) options: WatchOptions,
    pub(crate) stop: StopSignal,
    pub(crate) wakeup: Wakeup,
}

impl<B: CompressionBackend> WatchContext<B> {
    pub(crate) fn new(compactor: Compactor<B>, monitors: Arc<MonitorRegistry>, options: WatchOptions) -> Self {
        Self {
            compactor,
            monitors,
            pending: PendingQueue::new(),
            options,
            stop: StopSignal::new(),
            wakeup: Wakeup::new(),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Apply a notification to the pending queue and wake the reconciler.
    pub(crate) fn record(&self, change: Change, algorithm: CompressionAlgorithm, now: Instant) {
        match change {
            Change::Changed(path) => {
                tracing::trace!(path = %path.display(), "Change queued");
                self.pending.changed(path, algorithm, now);
            }
            Change::Renamed { from, to } => {
                tracing::trace!(from = %from.display(), to = %to.display(), "Rename queued");
                self.pending.renamed(&from, to, algorithm, now);
            }
            Change::Deleted(path) => {
                self.pending.deleted(&path);
                return;
            }
        }
        self.wakeup.notify();
    }

    /// Compact one path if it still needs it.
    ///
    /// `Ok(true)` when there is nothing left to do (including missing files
    /// and files whose archive flag is already clear), `Ok(false)` when
    /// stopped while waiting for the disk to go idle.
    pub(crate) fn process(&self, path: &Path, algorithm: CompressionAlgorithm) -> CompactResult<bool> {
        let backend = self.compactor.backend();
        let attrs = match backend.attributes(path) {
            Ok(attrs) => attrs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(CompactError::os("query attributes", path, e)),
        };
        if attrs.is_dir {
            self.compactor.apply_directory(path, algorithm)?;
            return Ok(true);
        }
        if !attrs.archive {
            return Ok(true);
        }

        let monitor = match self.monitors.for_path(path) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                tracing::warn!(path = %path.display(), "No disk monitor, compacting ungated: {}", e);
                None
            }
        };
        let _work = monitor.as_ref().map(|m| m.lock_work());

        // Another worker may have finished this file while we waited for the lock.
        match backend.attributes(path) {
            Ok(attrs) if attrs.archive => {}
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(CompactError::os("query attributes", path, e)),
        }

        if let Some(monitor) = &monitor {
            if !monitor.wait_idle(self.options.idle, &self.stop) {
                return Ok(false);
            }
        }

        let outcome = self
            .compactor
            .apply_file(path, algorithm, self.options.min_ratio)?;
        backend
            .set_archive(path, false)
            .map_err(|e| CompactError::os("clear archive flag", path, e))?;
        tracing::debug!(path = %path.display(), %algorithm, ?outcome, "Compacted");
        Ok(true)
    }

    /// Used by the initial sweep. Failures are queued for a later retry.
    /// Returns `false` once stopping.
    pub(crate) fn process_initial(&self, path: PathBuf, algorithm: CompressionAlgorithm) -> bool {
        match self.process(&path, algorithm) {
            Ok(done) => done,
            Err(e) if e.is_retryable() => {
                tracing::warn!("{}; retrying later", e);
                self.pending
                    .defer(path, algorithm, Instant::now() + self.options.retry_backoff);
                !self.is_stopping()
            }
            Err(e) => {
                tracing::debug!("{}", e);
                !self.is_stopping()
            }
        }
    }

    /// Process every entry that has been quiet past the debounce window.
    pub(crate) fn reconcile(&self, now: Instant) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for entry in self.pending.ready(self.options.debounce, now) {
            if self.is_stopping() {
                break;
            }
            match self.process(&entry.path, entry.algorithm) {
                Ok(true) => {
                    self.pending.complete(&entry);
                    summary.completed += 1;
                }
                Ok(false) => break,
                Err(e) if !e.is_retryable() => {
                    tracing::warn!("{}", e);
                    self.pending.complete(&entry);
                    summary.dropped += 1;
                }
                Err(e) => {
                    tracing::warn!("{}; retrying in {:?}", e, self.options.retry_backoff);
                    self.pending
                        .retry_later(&entry, self.options.retry_backoff, Instant::now());
                    summary.failed += 1;
                }
            }
        }
        if summary != ReconcileSummary::default() {
            tracing::debug!(?summary, remaining = self.pending.len(), "Reconcile sweep finished");
        }
        summary
    }

    fn run_reconciler(&self) {
        platform::lower_thread_priority();
        while !self.is_stopping() {
            let now = Instant::now();
            self.reconcile(now);
            let sleep = self
                .pending
                .next_ready_in(self.options.debounce, Instant::now())
                .map(|d| d + Duration::from_millis(1))
                .unwrap_or(self.options.reconcile_interval)
                .min(self.options.reconcile_interval);
            self.wakeup.wait(sleep);
        }
        tracing::debug!("Reconciler stopped");
    }
}

/// Owns the watched roots and the reconciler thread.
pub struct WatchScheduler<B: CompressionBackend + 'static> {
    context: Arc<WatchContext<B>>,
    roots: Vec<RootWatcher>,
    reconciler: Option<JoinHandle<()>>,
}

impl<B: CompressionBackend + 'static> WatchScheduler<B> {
    pub fn new(compactor: Compactor<B>, monitors: Arc<MonitorRegistry>, options: WatchOptions) -> Self {
        Self {
            context: Arc::new(WatchContext::new(compactor, monitors, options)),
            roots: Vec::new(),
            reconciler: None,
        }
    }

    /// Start the reconciler thread. Calling it again is a no-op.
    pub fn start(&mut self) -> io::Result<()> {
        if self.reconciler.is_some() {
            return Ok(());
        }
        let context = Arc::clone(&self.context);
        self.reconciler = Some(
            thread::Builder::new()
                .name("watch-reconciler".to_string())
                .spawn(move || context.run_reconciler())?,
        );
        tracing::info!(roots = self.roots.len(), "Watch scheduler started");
        Ok(())
    }

    /// Begin watching `entry`; its initial sweep starts immediately.
    pub fn watch(&mut self, mut entry: WatchEntry) -> io::Result<()> {
        entry.path = volume::normalize(&entry.path);
        let root = RootWatcher::enable(entry, Arc::clone(&self.context))?;
        self.roots.push(root);
        Ok(())
    }

    pub fn roots(&self) -> &[RootWatcher] {
        &self.roots
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.context.pending
    }

    pub fn compactor(&self) -> &Compactor<B> {
        &self.context.compactor
    }

    /// Run one sweep on the calling thread.
    pub fn reconcile_now(&self) -> ReconcileSummary {
        self.context.reconcile(Instant::now())
    }

    /// Signal every background thread and wait for all of them.
    pub fn stop(&mut self) {
        if self.context.is_stopping() && self.reconciler.is_none() && self.roots.is_empty() {
            return;
        }
        tracing::info!("Stopping watch scheduler");
        self.context.stop.stop();
        self.context.wakeup.notify();
        for root in &mut self.roots {
            root.disable();
        }
        self.roots.clear();
        if let Some(handle) = self.reconciler.take() {
            if handle.join().is_err() {
                tracing::warn!("Reconciler thread panicked");
            }
        }
    }
}

impl<B: CompressionBackend + 'static> Drop for WatchScheduler<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
