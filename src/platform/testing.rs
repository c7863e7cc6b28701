//! Scripted in-memory backends for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    BitmapChunk, CompressionBackend, DefragBackend, Extent, ExtentChunk, ExternalAlgorithm,
    FileAttributes, NativeCompression, UtilizationSource,
};
use crate::error::ERROR_ACCESS_DENIED;
use crate::volume::ClusterSize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetNative(PathBuf, NativeCompression),
    SetExternal(PathBuf, ExternalAlgorithm),
    DeleteExternal(PathBuf),
    SetReadOnly(PathBuf, bool),
    SetArchive(PathBuf, bool),
}

#[derive(Debug, Clone)]
pub struct FakeFile {
    pub attrs: FileAttributes,
    pub native: NativeCompression,
    pub external: Option<ExternalAlgorithm>,
    /// Bytes allocated while any compression is active.
    pub compressed_len: u64,
}

impl FakeFile {
    pub fn new(length: u64) -> Self {
        Self {
            attrs: FileAttributes {
                length,
                archive: true,
                ..FileAttributes::default()
            },
            native: NativeCompression::None,
            external: None,
            compressed_len: length / 2,
        }
    }

    pub fn dir() -> Self {
        let mut file = Self::new(0);
        file.attrs.is_dir = true;
        file
    }
}

/// Compression backend keeping per-path state in memory. Paths it does not
/// know are synthesized from the real filesystem on first use, so tests can
/// walk a `tempfile` tree.
#[derive(Debug)]
pub struct MemoryFs {
    cluster: ClusterSize,
    files: Mutex<HashMap<PathBuf, FakeFile>>,
    calls: Mutex<Vec<Call>>,
    /// Remaining injected failures of compression changes per path.
    failures: Mutex<HashMap<PathBuf, usize>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::with_cluster(ClusterSize::DEFAULT)
    }

    pub fn with_cluster(cluster: ClusterSize) -> Self {
        Self {
            cluster,
            files: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, path: impl Into<PathBuf>, file: FakeFile) {
        self.files.lock().insert(path.into(), file);
    }

    pub fn file(&self, path: &Path) -> Option<FakeFile> {
        self.files.lock().get(path).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn fail_times(&self, path: impl Into<PathBuf>, times: usize) {
        self.failures.lock().insert(path.into(), times);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn with_file<T>(&self, path: &Path, f: impl FnOnce(&mut FakeFile) -> T) -> io::Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(path) {
            let meta = std::fs::metadata(path)?;
            let mut file = if meta.is_dir() {
                FakeFile::dir()
            } else {
                FakeFile::new(meta.len())
            };
            file.attrs.read_only = meta.permissions().readonly();
            files.insert(path.to_path_buf(), file);
        }
        let file = files
            .get_mut(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(f(file))
    }

    fn change(&self, path: &Path, call: Call, f: impl FnOnce(&mut FakeFile)) -> io::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = self.change_inner(path, call, f);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn change_inner(&self, path: &Path, call: Call, f: impl FnOnce(&mut FakeFile)) -> io::Result<()> {
        if let Some(remaining) = self.failures.lock().get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::from_raw_os_error(32));
            }
        }
        self.with_file(path, f)?;
        self.calls.lock().push(call);
        Ok(())
    }
}

impl CompressionBackend for MemoryFs {
    fn cluster_size(&self, _path: &Path) -> io::Result<ClusterSize> {
        Ok(self.cluster)
    }

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
        self.with_file(path, |f| f.attrs)
    }

    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
        self.with_file(path, |f| f.attrs.read_only = read_only)?;
        self.calls
            .lock()
            .push(Call::SetReadOnly(path.to_path_buf(), read_only));
        Ok(())
    }

    fn set_archive(&self, path: &Path, archive: bool) -> io::Result<()> {
        self.with_file(path, |f| f.attrs.archive = archive)?;
        self.calls
            .lock()
            .push(Call::SetArchive(path.to_path_buf(), archive));
        Ok(())
    }

    fn native_compression(&self, path: &Path) -> io::Result<NativeCompression> {
        self.with_file(path, |f| f.native)
    }

    fn set_native_compression(&self, path: &Path, value: NativeCompression) -> io::Result<()> {
        self.change(path, Call::SetNative(path.to_path_buf(), value), |f| {
            f.native = value;
        })
    }

    fn external_backing(&self, path: &Path) -> io::Result<Option<ExternalAlgorithm>> {
        self.with_file(path, |f| f.external)
    }

    fn set_external_backing(&self, path: &Path, algorithm: ExternalAlgorithm) -> io::Result<()> {
        self.change(path, Call::SetExternal(path.to_path_buf(), algorithm), |f| {
            f.external = Some(algorithm)
        })
    }

    fn delete_external_backing(&self, path: &Path) -> io::Result<()> {
        self.change(path, Call::DeleteExternal(path.to_path_buf()), |f| {
            f.external = None
        })
    }

    fn compressed_size(&self, path: &Path) -> io::Result<u64> {
        self.with_file(path, |f| {
            if f.native == NativeCompression::Lznt1 || f.external.is_some() {
                f.compressed_len
            } else {
                f.attrs.length
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub vcn: u64,
    pub lcn: u64,
    pub count: u32,
}

/// Defrag backend serving a fixed bitmap and per-file extent lists in chunks.
#[derive(Debug)]
pub struct MemoryVolume {
    bitmap: Vec<u8>,
    cluster_count: u64,
    /// Bytes of bitmap returned per read.
    chunk_bytes: usize,
    files: HashMap<PathBuf, Vec<Extent>>,
    extents_per_chunk: usize,
    immovable: HashSet<PathBuf>,
    pub volume_unavailable: bool,
    moves: Mutex<Vec<(PathBuf, Move)>>,
    /// Zero-based index of a move to reject as stale, consumed on use.
    stale_move: Mutex<Option<usize>>,
    bitmap_reads: AtomicUsize,
}

impl MemoryVolume {
    /// `allocated` lists `(start, count)` cluster ranges that are in use.
    pub fn new(cluster_count: u64, allocated: &[(u64, u64)]) -> Self {
        let mut bitmap = vec![0u8; cluster_count.div_ceil(8) as usize];
        for &(start, count) in allocated {
            for lcn in start..start + count {
                bitmap[(lcn / 8) as usize] |= 1 << (lcn % 8);
            }
        }
        Self {
            bitmap,
            cluster_count,
            chunk_bytes: 64,
            files: HashMap::new(),
            extents_per_chunk: 2,
            immovable: HashSet::new(),
            volume_unavailable: false,
            moves: Mutex::new(Vec::new()),
            stale_move: Mutex::new(None),
            bitmap_reads: AtomicUsize::new(0),
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, extents: Vec<Extent>) -> Self {
        self.files.insert(path.into(), extents);
        self
    }

    pub fn with_immovable(mut self, path: impl Into<PathBuf>) -> Self {
        self.immovable.insert(path.into());
        self
    }

    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }

    pub fn reject_move_as_stale(&self, index: usize) {
        *self.stale_move.lock() = Some(index);
    }

    pub fn moves(&self) -> Vec<Move> {
        self.moves.lock().iter().map(|(_, m)| *m).collect()
    }

    pub fn bitmap_reads(&self) -> usize {
        self.bitmap_reads.load(Ordering::SeqCst)
    }
}

impl DefragBackend for MemoryVolume {
    type Volume = ();
    type File = PathBuf;

    fn open_volume(&self, _path: &Path) -> io::Result<()> {
        if self.volume_unavailable {
            return Err(io::Error::from_raw_os_error(ERROR_ACCESS_DENIED));
        }
        Ok(())
    }

    fn open_file_for_move(&self, path: &Path) -> io::Result<PathBuf> {
        if self.immovable.contains(path) {
            return Err(io::Error::from_raw_os_error(ERROR_ACCESS_DENIED));
        }
        self.open_file_for_query(path)
    }

    fn open_file_for_query(&self, path: &Path) -> io::Result<PathBuf> {
        if self.files.contains_key(path) {
            Ok(path.to_path_buf())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn read_bitmap(&self, _volume: &(), starting_lcn: u64) -> io::Result<BitmapChunk> {
        self.bitmap_reads.fetch_add(1, Ordering::SeqCst);
        // Chunks start on a byte boundary, like the real control code.
        let start_byte = (starting_lcn / 8) as usize;
        let end_byte = (start_byte + self.chunk_bytes).min(self.bitmap.len());
        let chunk_start = start_byte as u64 * 8;
        let more = end_byte < self.bitmap.len();
        let cluster_count = (self.cluster_count - chunk_start).min((end_byte - start_byte) as u64 * 8);
        Ok(BitmapChunk {
            starting_lcn: chunk_start,
            cluster_count,
            bits: self.bitmap[start_byte..end_byte].to_vec(),
            more,
        })
    }

    fn read_extents(&self, file: &PathBuf, starting_vcn: u64) -> io::Result<ExtentChunk> {
        let extents = self
            .files
            .get(file)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let first = extents
            .iter()
            .position(|e| e.next_vcn > starting_vcn)
            .unwrap_or(extents.len());
        let last = (first + self.extents_per_chunk).min(extents.len());
        let chunk_vcn = if first == 0 {
            0
        } else {
            extents[first - 1].next_vcn
        };
        Ok(ExtentChunk {
            starting_vcn: chunk_vcn,
            extents: extents[first..last].to_vec(),
            more: last < extents.len(),
        })
    }

    fn move_clusters(
        &self,
        _volume: &(),
        file: &PathBuf,
        starting_vcn: u64,
        target_lcn: u64,
        cluster_count: u32,
    ) -> io::Result<()> {
        let mut moves = self.moves.lock();
        let mut stale = self.stale_move.lock();
        if *stale == Some(moves.len()) {
            *stale = None;
            return Err(io::Error::from_raw_os_error(ERROR_ACCESS_DENIED));
        }
        moves.push((
            file.clone(),
            Move {
                vcn: starting_vcn,
                lcn: target_lcn,
                count: cluster_count,
            },
        ));
        Ok(())
    }
}

/// Utilization source replaying scripted values, then repeating the last one.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    values: Arc<Mutex<VecDeque<f32>>>,
    last: Arc<Mutex<f32>>,
}

impl ScriptedSource {
    pub fn new(values: &[f32]) -> Self {
        Self {
            values: Arc::new(Mutex::new(values.iter().copied().collect())),
            last: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Replace the remaining script.
    pub fn set(&self, values: &[f32]) {
        *self.values.lock() = values.iter().copied().collect();
    }
}

impl UtilizationSource for ScriptedSource {
    fn sample(&mut self) -> io::Result<f32> {
        let mut last = self.last.lock();
        if let Some(value) = self.values.lock().pop_front() {
            *last = value;
        }
        Ok(*last)
    }
}
