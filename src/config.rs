//! Tunables and persisted watch entries.
//!
//! One TOML file holds both: a `[settings]` table deserialized into
//! [`Settings`] and a flat `[watchers]` key-value table that [`TomlStore`]
//! exposes through [`ConfigStore`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compress::CompressionAlgorithm;
use crate::error::ConfigError;
use crate::monitor::{IdleThresholds, DEFAULT_SAMPLE_PERIOD, DEFAULT_SAMPLE_WINDOW};

const WATCHER_PREFIX: &str = "Watcher";
const PATH_NAME: &str = "PathName";
const SUB_FOLDER: &str = "SubFolder";
const ALGORITHM: &str = "Algorithm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Compression is kept only when on-disk clusters after / before is at most this.
    pub min_ratio: f64,
    /// Never modified. Defaults to `%SystemRoot%`.
    pub protected_root: Option<PathBuf>,
    pub debounce_ms: u64,
    pub retry_backoff_ms: u64,
    pub reconcile_interval_ms: u64,
    pub idle_avg_threshold: f32,
    pub idle_max_threshold: f32,
    pub sample_period_ms: u64,
    pub sample_window: usize,
    pub poll_interval_ms: u64,
    /// Drive letter to physical-disk counter instance, e.g. `C = "0 C:"`.
    pub device_counters: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        let idle = IdleThresholds::default();
        Self {
            min_ratio: 1.0,
            protected_root: Some(default_protected_root()),
            debounce_ms: 1_000,
            retry_backoff_ms: 60_000,
            reconcile_interval_ms: 60_000,
            idle_avg_threshold: idle.avg,
            idle_max_threshold: idle.max,
            sample_period_ms: DEFAULT_SAMPLE_PERIOD.as_millis() as u64,
            sample_window: DEFAULT_SAMPLE_WINDOW,
            poll_interval_ms: 100,
            device_counters: BTreeMap::new(),
        }
    }
}

fn default_protected_root() -> PathBuf {
    std::env::var_os("SystemRoot")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Windows"))
}

impl Settings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_thresholds(&self) -> IdleThresholds {
        IdleThresholds {
            avg: self.idle_avg_threshold,
            max: self.idle_max_threshold,
        }
    }

    /// `device_counters` keyed by upper-case drive letter.
    pub fn counter_instances(&self) -> HashMap<char, String> {
        self.device_counters
            .iter()
            .filter_map(|(drive, instance)| {
                let letter = drive.chars().next()?.to_ascii_uppercase();
                Some((letter, instance.clone()))
            })
            .collect()
    }
}

/// A watched directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    pub path: PathBuf,
    pub recursive: bool,
    pub algorithm: CompressionAlgorithm,
}

/// Ordered string key-value store holding the watch entries.
pub trait ConfigStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn remove(&mut self, key: &str);
}

fn watcher_key(index: usize, field: &str) -> String {
    format!("{WATCHER_PREFIX}{index}.{field}")
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Entries `Watcher1`, `Watcher2`, ... up to the first index without a path.
/// Entries with an unknown algorithm are skipped.
pub fn load_watch_entries<S: ConfigStore + ?Sized>(store: &S) -> Vec<WatchEntry> {
    let mut entries = Vec::new();
    for index in 1.. {
        let Some(path) = store.get(&watcher_key(index, PATH_NAME)) else {
            break;
        };
        let recursive = store
            .get(&watcher_key(index, SUB_FOLDER))
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        let algorithm = store.get(&watcher_key(index, ALGORITHM)).unwrap_or_default();
        match algorithm.parse() {
            Ok(algorithm) => entries.push(WatchEntry {
                path: PathBuf::from(path),
                recursive,
                algorithm,
            }),
            Err(e) => tracing::warn!(index, path = %path, "Skipping watch entry: {}", e),
        }
    }
    entries
}

/// Replace all stored entries with `entries`.
pub fn save_watch_entries<S: ConfigStore + ?Sized>(store: &mut S, entries: &[WatchEntry]) {
    for (i, entry) in entries.iter().enumerate() {
        let index = i + 1;
        store.set(&watcher_key(index, PATH_NAME), &entry.path.to_string_lossy());
        store.set(
            &watcher_key(index, SUB_FOLDER),
            if entry.recursive { "true" } else { "false" },
        );
        store.set(&watcher_key(index, ALGORITHM), entry.algorithm.name());
    }
    let mut index = entries.len() + 1;
    while store.get(&watcher_key(index, PATH_NAME)).is_some() {
        for field in [PATH_NAME, SUB_FOLDER, ALGORITHM] {
            store.remove(&watcher_key(index, field));
        }
        index += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    watchers: BTreeMap<String, String>,
}

/// TOML-file-backed store. Changes are kept in memory until [`TomlStore::save`].
#[derive(Debug)]
pub struct TomlStore {
    path: PathBuf,
    file: ConfigFile,
}

impl TomlStore {
    /// Open `path`; a missing file starts out empty with default settings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let file = read_config_file(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.file.settings
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(&self.file)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        std::fs::write(&self.path, text).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl ConfigStore for TomlStore {
    fn get(&self, key: &str) -> Option<String> {
        self.file.watchers.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.file.watchers.insert(key.to_string(), value.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.file.watchers.remove(key);
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `[settings]` from `path`, or defaults if the file does not exist.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    Ok(read_config_file(path)?.settings)
}
