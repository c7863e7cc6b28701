//! Whole-file relocation into one free run.
//!
//! [`Defragmenter::defragment`] snapshots the volume bitmap, picks the first
//! free run large enough for the file and moves the file's extents into it
//! back to back.

pub mod bitmap;
pub mod extents;
pub mod report;

use std::path::{Path, PathBuf};

use crate::error::{DefragError, DefragResult, ERROR_ACCESS_DENIED};
use crate::platform::DefragBackend;
use crate::volume;

pub use bitmap::FreeRun;
pub use extents::{ExtentList, ExtentRun};
pub use report::{analyze_tree, FileFragmentation};

/// Largest cluster count a single move request can carry.
const MAX_MOVE_CLUSTERS: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragOutcome {
    /// The file now occupies `clusters` clusters starting at `target_lcn`.
    Relocated {
        extents: usize,
        clusters: u64,
        target_lcn: u64,
    },
    /// Zero or one allocated extent; nothing to do.
    NotFragmented,
    /// No free run can hold the whole file.
    NoContiguousSpace { clusters: u64 },
}

pub struct Defragmenter<B> {
    backend: B,
    protected_root: Option<PathBuf>,
}

impl<B: DefragBackend> Defragmenter<B> {
    pub fn new(backend: B, protected_root: Option<PathBuf>) -> Self {
        Self {
            backend,
            protected_root,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Make `path` contiguous.
    ///
    /// A [`DefragError::StaleMap`] means the bitmap snapshot went out of date
    /// mid-run; the file may be partially moved and the call can be repeated.
    pub fn defragment(&self, path: &Path) -> DefragResult<DefragOutcome> {
        if let Some(root) = &self.protected_root {
            if volume::is_within(path, root) {
                return Err(DefragError::Refused {
                    path: path.to_path_buf(),
                });
            }
        }

        let volume = self.backend.open_volume(path).map_err(|source| DefragError::Setup {
            path: path.to_path_buf(),
            source,
        })?;
        let file = self
            .backend
            .open_file_for_move(path)
            .map_err(|source| DefragError::Setup {
                path: path.to_path_buf(),
                source,
            })?;

        let extents = extents::read_extents(&self.backend, &file)
            .map_err(|e| DefragError::os("read retrieval pointers", path, e))?;
        if extents.is_contiguous() {
            tracing::debug!(path = %path.display(), "Already contiguous");
            return Ok(DefragOutcome::NotFragmented);
        }

        let clusters = extents.allocated_clusters();
        let free = bitmap::read_free_runs(&self.backend, &volume)
            .map_err(|e| DefragError::os("read volume bitmap", path, e))?;
        let Some(target) = bitmap::first_fit(&free, clusters) else {
            tracing::info!(path = %path.display(), clusters, "No free run large enough");
            return Ok(DefragOutcome::NoContiguousSpace { clusters });
        };

        let mut cursor = target.start;
        for run in extents.allocated() {
            let mut vcn = run.vcn;
            let mut remaining = run.clusters;
            while remaining > 0 {
                let count = remaining.min(MAX_MOVE_CLUSTERS);
                self.backend
                    .move_clusters(&volume, &file, vcn, cursor, count as u32)
                    .map_err(|source| {
                        if source.raw_os_error() == Some(ERROR_ACCESS_DENIED) {
                            DefragError::StaleMap {
                                vcn,
                                lcn: cursor,
                                source,
                            }
                        } else {
                            DefragError::os("move clusters", path, source)
                        }
                    })?;
                vcn += count;
                cursor += count;
                remaining -= count;
            }
        }

        let fragments = extents.fragments();
        tracing::info!(
            path = %path.display(),
            extents = fragments,
            clusters,
            target_lcn = target.start,
            "File relocated"
        );
        Ok(DefragOutcome::Relocated {
            extents: fragments,
            clusters,
            target_lcn: target.start,
        })
    }

    /// [`Self::defragment`], re-reading the bitmap after a stale snapshot.
    /// `attempts` counts the first try; zero is treated as one.
    pub fn defragment_with_retry(&self, path: &Path, attempts: usize) -> DefragResult<DefragOutcome> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.defragment(path) {
                Err(e) if e.is_stale_map() && attempt < attempts => {
                    tracing::debug!(path = %path.display(), attempt, "{}, retrying", e);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
