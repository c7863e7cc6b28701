//! OS primitives consumed by the engines.
//!
//! The engines only talk to the filesystem through these traits. On Windows
//! they are backed by `DeviceIoControl` and friends ([`windows`]); elsewhere a
//! stub stands in ([`fallback`]).

use std::io;
use std::path::Path;

use crate::volume::ClusterSize;

#[cfg(not(windows))]
pub mod fallback;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(windows)]
pub mod windows;

/// Attribute bits the engines care about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub length: u64,
    pub is_dir: bool,
    pub read_only: bool,
    /// Set by the filesystem on every write; used as the "needs processing" marker.
    pub archive: bool,
}

/// Native NTFS compression state (`COMPRESSION_FORMAT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeCompression {
    None,
    Lznt1,
}

impl NativeCompression {
    pub fn format(self) -> u16 {
        match self {
            Self::None => 0x0000,
            Self::Lznt1 => 0x0002,
        }
    }

    /// `COMPRESSION_FORMAT_DEFAULT` (1) is reported as LZNT1.
    pub fn from_format(format: u16) -> Self {
        match format {
            0 => Self::None,
            _ => Self::Lznt1,
        }
    }
}

/// Windows Overlay Filter compressed-backing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalAlgorithm {
    Xpress4k,
    Lzx,
    Xpress8k,
    Xpress16k,
}

impl ExternalAlgorithm {
    /// `FILE_PROVIDER_COMPRESSION_*` value.
    pub fn code(self) -> u32 {
        match self {
            Self::Xpress4k => 0,
            Self::Lzx => 1,
            Self::Xpress8k => 2,
            Self::Xpress16k => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Xpress4k),
            1 => Some(Self::Lzx),
            2 => Some(Self::Xpress8k),
            3 => Some(Self::Xpress16k),
            _ => None,
        }
    }
}

/// Per-file compression primitives.
///
/// Every mutating call opens the target itself, so a failure never leaves a
/// handle behind.
pub trait CompressionBackend: Send + Sync {
    /// Allocation unit of the volume holding `path`.
    fn cluster_size(&self, path: &Path) -> io::Result<ClusterSize>;

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes>;

    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()>;

    fn set_archive(&self, path: &Path, archive: bool) -> io::Result<()>;

    /// Works on files and directories alike.
    fn native_compression(&self, path: &Path) -> io::Result<NativeCompression>;

    fn set_native_compression(&self, path: &Path, value: NativeCompression) -> io::Result<()>;

    /// `None` when the file has no compressed backing.
    fn external_backing(&self, path: &Path) -> io::Result<Option<ExternalAlgorithm>>;

    fn set_external_backing(&self, path: &Path, algorithm: ExternalAlgorithm) -> io::Result<()>;

    /// Succeeds when there is no backing to delete.
    fn delete_external_backing(&self, path: &Path) -> io::Result<()>;

    /// Bytes actually allocated for the file's data (`GetCompressedFileSize`).
    fn compressed_size(&self, path: &Path) -> io::Result<u64>;
}

/// One chunk of a volume's allocation bitmap.
///
/// Bit `i` of `bits` describes cluster `starting_lcn + i`, least significant
/// bit first; a set bit is allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapChunk {
    pub starting_lcn: u64,
    /// Number of valid bits in `bits`.
    pub cluster_count: u64,
    pub bits: Vec<u8>,
    /// More chunks follow (`ERROR_MORE_DATA`).
    pub more: bool,
}

/// A contiguous run of a file's data: clusters `[previous next_vcn, next_vcn)`
/// of the file live at `lcn`. Sparse runs occupy no clusters and have no `lcn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub next_vcn: u64,
    pub lcn: Option<u64>,
}

impl Extent {
    pub fn allocated(next_vcn: u64, lcn: u64) -> Self {
        Self {
            next_vcn,
            lcn: Some(lcn),
        }
    }
}

/// One chunk of a file's retrieval pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentChunk {
    pub starting_vcn: u64,
    pub extents: Vec<Extent>,
    pub more: bool,
}

/// Cluster relocation primitives.
pub trait DefragBackend: Send + Sync {
    type Volume;
    type File;

    /// Open the volume holding `path` for bitmap reads and cluster moves.
    fn open_volume(&self, path: &Path) -> io::Result<Self::Volume>;

    /// Open a file with the access cluster moves need.
    fn open_file_for_move(&self, path: &Path) -> io::Result<Self::File>;

    /// Open a file only to read its extents; succeeds for some files that
    /// cannot be moved.
    fn open_file_for_query(&self, path: &Path) -> io::Result<Self::File>;

    fn read_bitmap(&self, volume: &Self::Volume, starting_lcn: u64) -> io::Result<BitmapChunk>;

    fn read_extents(&self, file: &Self::File, starting_vcn: u64) -> io::Result<ExtentChunk>;

    /// Move `cluster_count` clusters starting at `starting_vcn` of `file` to
    /// `target_lcn` on `volume`.
    fn move_clusters(
        &self,
        volume: &Self::Volume,
        file: &Self::File,
        starting_vcn: u64,
        target_lcn: u64,
        cluster_count: u32,
    ) -> io::Result<()>;
}

/// Instantaneous busy percentage of one physical disk.
pub trait UtilizationSource: Send {
    fn sample(&mut self) -> io::Result<f32>;
}

/// The backends for the current platform.
#[cfg(windows)]
pub type NativeBackend = windows::Win32Backend;
#[cfg(not(windows))]
pub type NativeBackend = fallback::UnsupportedBackend;

/// Utilization source for the counter `instance` (e.g. `0 C:` or `_Total`).
pub fn utilization_source(instance: &str) -> io::Result<Box<dyn UtilizationSource>> {
    #[cfg(windows)]
    {
        Ok(Box::new(windows::DiskTimeCounter::open(instance)?))
    }
    #[cfg(not(windows))]
    {
        Ok(Box::new(fallback::IdleSource::new(instance)))
    }
}

/// Drop the calling thread to the lowest scheduling priority.
pub fn lower_thread_priority() {
    #[cfg(windows)]
    windows::lower_thread_priority();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_algorithm_codes_round_trip() {
        for alg in [
            ExternalAlgorithm::Xpress4k,
            ExternalAlgorithm::Lzx,
            ExternalAlgorithm::Xpress8k,
            ExternalAlgorithm::Xpress16k,
        ] {
            assert_eq!(ExternalAlgorithm::from_code(alg.code()), Some(alg));
        }
        assert_eq!(ExternalAlgorithm::from_code(7), None);
    }

    #[test]
    fn default_native_format_reads_as_lznt1() {
        assert_eq!(NativeCompression::from_format(1), NativeCompression::Lznt1);
        assert_eq!(NativeCompression::from_format(0), NativeCompression::None);
    }
}
