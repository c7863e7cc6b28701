//! Per-file compression decisions.
//!
//! [`Compactor::apply`] moves a file to the requested on-disk representation
//! and keeps the result only when it actually saves clusters.

pub mod traversal;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompactError, CompactResult, ConfigError};
use crate::platform::{CompressionBackend, ExternalAlgorithm, NativeCompression};
use crate::volume::{self, ClusterSize};

/// Requested on-disk representation of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionAlgorithm {
    /// No compressed backing and no NTFS compression.
    None,
    /// Native NTFS compression.
    Lznt1,
    Xpress4k,
    Xpress8k,
    Xpress16k,
    Lzx,
}

/// Which primitive a [`CompressionAlgorithm`] maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Uncompressed,
    Native(NativeCompression),
    External(ExternalAlgorithm),
}

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 6] = [
        Self::None,
        Self::Lznt1,
        Self::Xpress4k,
        Self::Xpress8k,
        Self::Xpress16k,
        Self::Lzx,
    ];

    pub fn representation(self) -> Representation {
        match self {
            Self::None => Representation::Uncompressed,
            Self::Lznt1 => Representation::Native(NativeCompression::Lznt1),
            Self::Xpress4k => Representation::External(ExternalAlgorithm::Xpress4k),
            Self::Xpress8k => Representation::External(ExternalAlgorithm::Xpress8k),
            Self::Xpress16k => Representation::External(ExternalAlgorithm::Xpress16k),
            Self::Lzx => Representation::External(ExternalAlgorithm::Lzx),
        }
    }

    /// Directories only carry native compression, which new children inherit.
    pub fn directory_compression(self) -> NativeCompression {
        match self {
            Self::Lznt1 => NativeCompression::Lznt1,
            _ => NativeCompression::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Lznt1 => "LZNT1",
            Self::Xpress4k => "XPRESS4K",
            Self::Xpress8k => "XPRESS8K",
            Self::Xpress16k => "XPRESS16K",
            Self::Lzx => "LZX",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::InvalidAlgorithm(s.to_string()))
    }
}

impl TryFrom<String> for CompressionAlgorithm {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompressionAlgorithm> for String {
    fn from(value: CompressionAlgorithm) -> Self {
        value.name().to_string()
    }
}

/// What [`Compactor::apply`] did. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressOutcome {
    /// The file fits in one cluster; nothing can be gained.
    Skipped,
    /// All compression was removed as requested.
    Decompressed,
    /// Compression was applied and kept. `ratio` is clusters after / before.
    Applied { ratio: f64 },
    /// Compression did not reach the minimum gain and was rolled back.
    Rejected { ratio: f64 },
}

/// Applies compression decisions through a [`CompressionBackend`].
pub struct Compactor<B> {
    backend: B,
    protected_root: Option<PathBuf>,
}

impl<B: CompressionBackend> Compactor<B> {
    /// `protected_root` (normally the Windows directory) is never opened for write.
    pub fn new(backend: B, protected_root: Option<PathBuf>) -> Self {
        Self {
            backend,
            protected_root,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn protected_root(&self) -> Option<&Path> {
        self.protected_root.as_deref()
    }

    pub fn cluster_size(&self, path: &Path) -> CompactResult<ClusterSize> {
        self.backend
            .cluster_size(path)
            .map_err(|e| CompactError::os("query cluster size", path, e))
    }

    /// Refuse paths under the protected root.
    pub fn check_writable(&self, path: &Path) -> CompactResult<()> {
        match &self.protected_root {
            Some(root) if volume::is_within(path, root) => Err(CompactError::Refused {
                path: path.to_path_buf(),
            }),
            _ => Ok(()),
        }
    }

    /// Resolve the cluster size and apply `algorithm` to one file.
    pub fn apply_file(
        &self,
        path: &Path,
        algorithm: CompressionAlgorithm,
        min_ratio: f64,
    ) -> CompactResult<CompressOutcome> {
        let cluster = self.cluster_size(path)?;
        self.apply(path, algorithm, cluster, min_ratio)
    }

    /// Move `path` to `algorithm`, rolling back to uncompressed when the
    /// achieved ratio (on-disk clusters after / before) exceeds `min_ratio`.
    ///
    /// A read-only file is made writable for the duration of the call and
    /// restored on every exit path.
    pub fn apply(
        &self,
        path: &Path,
        algorithm: CompressionAlgorithm,
        cluster: ClusterSize,
        min_ratio: f64,
    ) -> CompactResult<CompressOutcome> {
        let attrs = self
            .backend
            .attributes(path)
            .map_err(|e| CompactError::os("query attributes", path, e))?;

        if attrs.length <= cluster.bytes() {
            tracing::debug!(path = %path.display(), length = attrs.length, "Skipping sub-cluster file");
            return Ok(CompressOutcome::Skipped);
        }

        self.check_writable(path)?;
        let _writable = ReadOnlyGuard::acquire(&self.backend, path, attrs.read_only)?;

        let outcome = match algorithm.representation() {
            Representation::Uncompressed => {
                self.remove_compression(path)?;
                CompressOutcome::Decompressed
            }
            Representation::Native(native) => {
                self.delete_backing(path)?;
                self.set_native(path, native)?;
                self.judge(path, attrs.length, cluster, min_ratio)?
            }
            Representation::External(external) => {
                // A file cannot be both natively compressed and externally backed.
                self.set_native(path, NativeCompression::None)?;
                let current = self
                    .backend
                    .external_backing(path)
                    .map_err(|e| CompactError::os("query external backing", path, e))?;
                if current != Some(external) {
                    self.backend
                        .set_external_backing(path, external)
                        .map_err(|e| CompactError::os("set external backing", path, e))?;
                }
                self.judge(path, attrs.length, cluster, min_ratio)?
            }
        };

        tracing::debug!(path = %path.display(), %algorithm, ?outcome, "Compression applied");
        Ok(outcome)
    }

    /// Set the native compression a directory passes on to new children.
    pub fn apply_directory(&self, path: &Path, algorithm: CompressionAlgorithm) -> CompactResult<()> {
        self.check_writable(path)?;
        self.set_native(path, algorithm.directory_compression())
    }

    fn judge(
        &self,
        path: &Path,
        length: u64,
        cluster: ClusterSize,
        min_ratio: f64,
    ) -> CompactResult<CompressOutcome> {
        let compressed = self
            .backend
            .compressed_size(path)
            .map_err(|e| CompactError::os("query compressed size", path, e))?;
        let before = cluster.length_on_disk(length);
        let after = cluster.length_on_disk(compressed);
        let ratio = after as f64 / before as f64;

        if ratio > min_ratio {
            tracing::debug!(
                path = %path.display(),
                ratio,
                min_ratio,
                "Compression not worth it, rolling back"
            );
            self.remove_compression(path)?;
            Ok(CompressOutcome::Rejected { ratio })
        } else {
            Ok(CompressOutcome::Applied { ratio })
        }
    }

    fn remove_compression(&self, path: &Path) -> CompactResult<()> {
        self.delete_backing(path)?;
        self.set_native(path, NativeCompression::None)
    }

    fn delete_backing(&self, path: &Path) -> CompactResult<()> {
        let current = self
            .backend
            .external_backing(path)
            .map_err(|e| CompactError::os("query external backing", path, e))?;
        if current.is_some() {
            self.backend
                .delete_external_backing(path)
                .map_err(|e| CompactError::os("delete external backing", path, e))?;
        }
        Ok(())
    }

    fn set_native(&self, path: &Path, value: NativeCompression) -> CompactResult<()> {
        let current = self
            .backend
            .native_compression(path)
            .map_err(|e| CompactError::os("query compression", path, e))?;
        if current != value {
            self.backend
                .set_native_compression(path, value)
                .map_err(|e| CompactError::os("set compression", path, e))?;
        }
        Ok(())
    }
}

/// Clears the read-only attribute and puts it back on drop.
struct ReadOnlyGuard<'a, B: CompressionBackend> {
    backend: &'a B,
    path: &'a Path,
    restore: bool,
}

impl<'a, B: CompressionBackend> ReadOnlyGuard<'a, B> {
    fn acquire(backend: &'a B, path: &'a Path, read_only: bool) -> CompactResult<Self> {
        if read_only {
            backend
                .set_read_only(path, false)
                .map_err(|e| CompactError::os("clear read-only", path, e))?;
        }
        Ok(Self {
            backend,
            path,
            restore: read_only,
        })
    }
}

impl<B: CompressionBackend> Drop for ReadOnlyGuard<'_, B> {
    fn drop(&mut self) {
        if self.restore {
            if let Err(e) = self.backend.set_read_only(self.path, true) {
                tracing::warn!(path = %self.path.display(), "Failed to restore read-only: {}", e);
            }
        }
    }
}
