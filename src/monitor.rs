//! Per-device utilization sampling and the idle admission gate.
//!
//! Each monitored drive gets one [`DiskMonitor`] whose sampling thread keeps
//! the last few utilization readings in a ring. Background work calls
//! [`DiskMonitor::wait_idle`] before touching a file so it backs off while the
//! disk is busy with foreground I/O.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::platform::{self, UtilizationSource};
use crate::signal::StopSignal;
use crate::volume;

pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(1000);
pub const DEFAULT_SAMPLE_WINDOW: usize = 5;

/// Counter instance used when a drive has no dedicated mapping.
pub const TOTAL_INSTANCE: &str = "_Total";

/// Utilization limits, in percent, under which a disk counts as idle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleThresholds {
    /// The window mean must stay below this.
    pub avg: f32,
    /// No single sample may exceed this.
    pub max: f32,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        Self {
            avg: 75.0,
            max: 95.0,
        }
    }
}

/// `true` when no sample exceeds `max` and the mean is below `avg`.
pub fn is_idle(samples: &[f32], thresholds: IdleThresholds) -> bool {
    if samples.iter().any(|&s| s > thresholds.max) {
        return false;
    }
    if samples.is_empty() {
        return true;
    }
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    mean < thresholds.avg
}

/// Fixed-size ring of the most recent samples.
///
/// Single writer (the sampling thread), any number of readers. Readers may
/// see a window that is one period out of date.
#[derive(Debug)]
pub struct IdleSamples {
    slots: Box<[AtomicU32]>,
    next: AtomicUsize,
}

impl IdleSamples {
    /// A window of `size` samples, initially all zero.
    pub fn new(size: usize) -> Self {
        let slots = (0..size.max(1)).map(|_| AtomicU32::new(0f32.to_bits())).collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// Overwrite the oldest sample.
    pub fn push(&self, value: f32) {
        let index = self.next.load(Ordering::Relaxed) % self.slots.len();
        self.slots[index].store(value.to_bits(), Ordering::Relaxed);
        self.next.store(index + 1, Ordering::Release);
    }

    pub fn values(&self) -> Vec<f32> {
        self.slots
            .iter()
            .map(|slot| f32::from_bits(slot.load(Ordering::Acquire)))
            .collect()
    }

    pub fn is_idle(&self, thresholds: IdleThresholds) -> bool {
        is_idle(&self.values(), thresholds)
    }
}

/// Utilization monitor for one drive.
#[derive(Debug)]
pub struct DiskMonitor {
    key: char,
    period: Duration,
    samples: Arc<IdleSamples>,
    stop: StopSignal,
    sampler: Mutex<Option<JoinHandle<()>>>,
    work: Mutex<()>,
}

impl DiskMonitor {
    /// Start sampling `source` every `period` into a ring of `window` slots.
    pub fn start(
        key: char,
        mut source: Box<dyn UtilizationSource>,
        period: Duration,
        window: usize,
    ) -> io::Result<Self> {
        let samples = Arc::new(IdleSamples::new(window));
        let stop = StopSignal::new();

        let thread_samples = Arc::clone(&samples);
        let thread_stop = stop.clone();
        let sampler = thread::Builder::new()
            .name(format!("disk-monitor-{key}"))
            .spawn(move || loop {
                match source.sample() {
                    Ok(value) => thread_samples.push(value),
                    Err(e) => tracing::debug!(drive = %key, "Utilization sample failed: {}", e),
                }
                if thread_stop.wait(period) {
                    break;
                }
            })?;

        tracing::debug!(drive = %key, ?period, window, "Disk monitor started");
        Ok(Self {
            key,
            period,
            samples,
            stop,
            sampler: Mutex::new(Some(sampler)),
            work: Mutex::new(()),
        })
    }

    pub fn key(&self) -> char {
        self.key
    }

    pub fn samples(&self) -> Vec<f32> {
        self.samples.values()
    }

    pub fn is_idle(&self, thresholds: IdleThresholds) -> bool {
        self.samples.is_idle(thresholds)
    }

    /// Block until the disk is idle, re-checking once per sampling period.
    /// Returns `false` if `cancel` fired first.
    pub fn wait_idle(&self, thresholds: IdleThresholds, cancel: &StopSignal) -> bool {
        while !self.is_idle(thresholds) {
            if cancel.wait(self.period) {
                return false;
            }
        }
        !cancel.is_stopped()
    }

    /// Serializes compression work on this drive. Hold the guard across the
    /// idle check and the work it admits.
    pub fn lock_work(&self) -> MutexGuard<'_, ()> {
        self.work.lock()
    }

    /// Stop the sampling thread and wait for it to exit.
    pub fn stop(&self) {
        self.stop.stop();
        if let Some(handle) = self.sampler.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(drive = %self.key, "Disk monitor thread panicked");
            }
        }
    }
}

impl Drop for DiskMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

type SourceFactory = dyn Fn(char) -> io::Result<Box<dyn UtilizationSource>> + Send + Sync;

/// Get-or-create map from drive key to its monitor.
pub struct MonitorRegistry {
    period: Duration,
    window: usize,
    factory: Box<SourceFactory>,
    monitors: Mutex<HashMap<char, Arc<DiskMonitor>>>,
}

impl MonitorRegistry {
    pub fn new<F>(period: Duration, window: usize, factory: F) -> Self
    where
        F: Fn(char) -> io::Result<Box<dyn UtilizationSource>> + Send + Sync + 'static,
    {
        Self {
            period,
            window,
            factory: Box::new(factory),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Registry backed by the platform's disk counters. Drives missing from
    /// `counters`, or whose counter cannot be opened, use [`TOTAL_INSTANCE`].
    pub fn native(period: Duration, window: usize, counters: HashMap<char, String>) -> Self {
        Self::new(period, window, move |key| {
            let instance = counters
                .get(&key.to_ascii_uppercase())
                .map(String::as_str)
                .unwrap_or(TOTAL_INSTANCE);
            match platform::utilization_source(instance) {
                Ok(source) => Ok(source),
                Err(e) if instance != TOTAL_INSTANCE => {
                    tracing::warn!(
                        drive = %key,
                        "Counter instance '{}' unavailable ({}), using {}",
                        instance,
                        e,
                        TOTAL_INSTANCE
                    );
                    platform::utilization_source(TOTAL_INSTANCE)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// The monitor for `key`, started on first request.
    pub fn get(&self, key: char) -> io::Result<Arc<DiskMonitor>> {
        let key = key.to_ascii_uppercase();
        let mut monitors = self.monitors.lock();
        if let Some(monitor) = monitors.get(&key) {
            return Ok(Arc::clone(monitor));
        }
        let source = (self.factory)(key)?;
        let monitor = Arc::new(DiskMonitor::start(key, source, self.period, self.window)?);
        monitors.insert(key, Arc::clone(&monitor));
        Ok(monitor)
    }

    /// The monitor for the drive holding `path`.
    pub fn for_path(&self, path: &Path) -> io::Result<Arc<DiskMonitor>> {
        self.get(volume::device_key(path))
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every sampling thread.
    pub fn shutdown(&self) {
        let monitors: Vec<_> = self.monitors.lock().drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.stop();
        }
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("period", &self.period)
            .field("window", &self.window)
            .field("monitors", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::ScriptedSource;
    use proptest::prelude::*;
    use std::time::Instant;

    const FAST: Duration = Duration::from_millis(5);

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn single_spike_disqualifies_low_average() {
        let thresholds = IdleThresholds::default();
        assert!(!is_idle(&[0.0, 0.0, 0.0, 0.0, 96.0], thresholds));
        assert!(is_idle(&[0.0, 0.0, 0.0, 0.0, 95.0], thresholds));
        assert!(!is_idle(&[80.0, 80.0, 80.0, 80.0, 80.0], thresholds));
    }

    proptest! {
        #[test]
        fn idle_matches_definition(
            samples in prop::collection::vec(0.0f32..100.0, 1..10),
            avg in 0.0f32..100.0,
            max in 0.0f32..100.0,
        ) {
            let thresholds = IdleThresholds { avg, max };
            let mean = samples.iter().sum::<f32>() / samples.len() as f32;
            let expected = samples.iter().all(|&s| s <= max) && mean < avg;
            prop_assert_eq!(is_idle(&samples, thresholds), expected);
        }
    }

    #[test]
    fn ring_overwrites_oldest() {
        let ring = IdleSamples::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            ring.push(value);
        }
        assert_eq!(ring.values(), vec![4.0, 2.0, 3.0]);
    }

    #[test]
    fn wait_idle_returns_once_load_drops() {
        let source = ScriptedSource::new(&[99.0, 99.0, 99.0, 10.0]);
        let monitor = DiskMonitor::start('C', Box::new(source), FAST, 3).unwrap();
        let cancel = StopSignal::new();

        assert!(wait_for(|| monitor.samples().contains(&99.0)));
        assert!(monitor.wait_idle(IdleThresholds::default(), &cancel));
        assert!(monitor.samples().iter().all(|&s| s <= 95.0));
    }

    #[test]
    fn wait_idle_is_cancellable() {
        let monitor = DiskMonitor::start('D', Box::new(ScriptedSource::new(&[100.0])), FAST, 3).unwrap();
        assert!(wait_for(|| !monitor.is_idle(IdleThresholds::default())));

        let cancel = StopSignal::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.stop();
        });
        assert!(!monitor.wait_idle(IdleThresholds::default(), &cancel));
        canceller.join().unwrap();
    }

    #[test]
    fn registry_shares_one_monitor_per_drive() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let registry = Arc::new(MonitorRegistry::new(FAST, 3, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource::new(&[0.0])) as Box<dyn UtilizationSource>)
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get('c').unwrap())
            })
            .collect();
        let monitors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(monitors.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(monitors[0].key(), 'C');
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let other = registry.get('D').unwrap();
        assert!(!Arc::ptr_eq(&other, &monitors[0]));
        assert_eq!(registry.len(), 2);
        registry.shutdown();
        assert!(registry.is_empty());
    }

    #[test]
    fn stopped_monitor_no_longer_samples() {
        let source = ScriptedSource::new(&[10.0]);
        let monitor = DiskMonitor::start('C', Box::new(source.clone()), FAST, 3).unwrap();
        assert!(wait_for(|| monitor.samples().contains(&10.0)));

        source.set(&[20.0]);
        assert!(wait_for(|| monitor.samples().contains(&20.0)));

        monitor.stop();
        let frozen = monitor.samples();
        source.set(&[30.0, 40.0, 50.0]);
        thread::sleep(FAST * 10);
        assert_eq!(monitor.samples(), frozen);
    }

    #[test]
    fn registry_shutdown_stops_sampling() {
        let source = ScriptedSource::new(&[10.0]);
        let factory_source = source.clone();
        let registry = MonitorRegistry::new(FAST, 3, move |_| {
            Ok(Box::new(factory_source.clone()) as Box<dyn UtilizationSource>)
        });
        let monitor = registry.get('C').unwrap();
        assert!(wait_for(|| monitor.samples().contains(&10.0)));

        registry.shutdown();
        let frozen = monitor.samples();
        source.set(&[60.0, 70.0, 80.0]);
        thread::sleep(FAST * 10);
        assert_eq!(monitor.samples(), frozen);
    }

    #[test]
    fn paths_on_one_drive_share_a_monitor() {
        let registry = MonitorRegistry::new(FAST, 3, |_| {
            Ok(Box::new(ScriptedSource::new(&[0.0])) as Box<dyn UtilizationSource>)
        });
        let verbatim = registry.for_path(Path::new(r"\\?\d:\Data\a.bin")).unwrap();
        let plain = registry.for_path(Path::new(r"D:\Other\b.bin")).unwrap();
        let other = registry.for_path(Path::new(r"E:\c.bin")).unwrap();

        assert!(Arc::ptr_eq(&verbatim, &plain));
        assert_eq!(verbatim.key(), 'D');
        assert!(!Arc::ptr_eq(&verbatim, &other));
        registry.shutdown();
    }

    #[test]
    fn factory_failure_is_not_cached() {
        let registry = MonitorRegistry::new(FAST, 3, |_| Err(io::Error::from(io::ErrorKind::NotFound)));
        assert!(registry.get('E').is_err());
        assert!(registry.is_empty());
    }
}
