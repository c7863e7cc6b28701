//! Fragmentation survey of a directory tree.

use std::io;
use std::path::{Path, PathBuf};

use jwalk::WalkDir;
use rayon::prelude::*;

use super::extents;
use crate::platform::DefragBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFragmentation {
    pub path: PathBuf,
    /// Allocated extents.
    pub extents: usize,
    pub clusters: u64,
    /// The file could be opened for relocation.
    pub movable: bool,
}

/// Read the extent map of every file under `root`, most fragmented first.
///
/// Files whose extents cannot be read are left out.
pub fn analyze_tree<B: DefragBackend>(backend: &B, root: &Path) -> Vec<FileFragmentation> {
    let files: Vec<PathBuf> = WalkDir::new(root)
        .skip_hidden(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(entry.path()),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                None
            }
        })
        .collect();

    tracing::debug!(root = %root.display(), files = files.len(), "Analyzing fragmentation");

    let mut report: Vec<FileFragmentation> = files
        .par_iter()
        .filter_map(|path| match analyze_file(backend, path) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(path = %path.display(), "Cannot read extents: {}", e);
                None
            }
        })
        .collect();

    report.sort_by(|a, b| b.extents.cmp(&a.extents).then_with(|| a.path.cmp(&b.path)));
    report
}

pub fn analyze_file<B: DefragBackend>(backend: &B, path: &Path) -> io::Result<FileFragmentation> {
    let file = backend.open_file_for_query(path)?;
    let list = extents::read_extents(backend, &file)?;
    drop(file);
    let movable = backend.open_file_for_move(path).is_ok();
    Ok(FileFragmentation {
        path: path.to_path_buf(),
        extents: list.fragments(),
        clusters: list.allocated_clusters(),
        movable,
    })
}
