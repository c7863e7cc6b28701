//! Non-Windows stubs. NTFS compression and cluster relocation only exist on
//! Windows; everything here reports `Unsupported` so the engines fail per item
//! and keep running.

use std::io;
use std::path::Path;

use super::{
    BitmapChunk, CompressionBackend, DefragBackend, ExtentChunk, ExternalAlgorithm, FileAttributes,
    NativeCompression, UtilizationSource,
};
use crate::volume::ClusterSize;

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is only available on Windows"),
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl CompressionBackend for UnsupportedBackend {
    fn cluster_size(&self, _path: &Path) -> io::Result<ClusterSize> {
        Ok(ClusterSize::DEFAULT)
    }

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
        let meta = std::fs::metadata(path)?;
        Ok(FileAttributes {
            length: meta.len(),
            is_dir: meta.is_dir(),
            read_only: meta.permissions().readonly(),
            archive: false,
        })
    }

    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_readonly(read_only);
        std::fs::set_permissions(path, permissions)
    }

    fn set_archive(&self, _path: &Path, _archive: bool) -> io::Result<()> {
        Err(unsupported("the archive attribute"))
    }

    fn native_compression(&self, _path: &Path) -> io::Result<NativeCompression> {
        Ok(NativeCompression::None)
    }

    fn set_native_compression(&self, _path: &Path, _value: NativeCompression) -> io::Result<()> {
        Err(unsupported("NTFS compression"))
    }

    fn external_backing(&self, _path: &Path) -> io::Result<Option<ExternalAlgorithm>> {
        Ok(None)
    }

    fn set_external_backing(&self, _path: &Path, _algorithm: ExternalAlgorithm) -> io::Result<()> {
        Err(unsupported("WOF compression"))
    }

    fn delete_external_backing(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn compressed_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

impl DefragBackend for UnsupportedBackend {
    type Volume = ();
    type File = ();

    fn open_volume(&self, _path: &Path) -> io::Result<()> {
        Err(unsupported("raw volume access"))
    }

    fn open_file_for_move(&self, _path: &Path) -> io::Result<()> {
        Err(unsupported("cluster relocation"))
    }

    fn open_file_for_query(&self, _path: &Path) -> io::Result<()> {
        Err(unsupported("retrieval pointers"))
    }

    fn read_bitmap(&self, _volume: &(), _starting_lcn: u64) -> io::Result<BitmapChunk> {
        Err(unsupported("the volume bitmap"))
    }

    fn read_extents(&self, _file: &(), _starting_vcn: u64) -> io::Result<ExtentChunk> {
        Err(unsupported("retrieval pointers"))
    }

    fn move_clusters(
        &self,
        _volume: &(),
        _file: &(),
        _starting_vcn: u64,
        _target_lcn: u64,
        _cluster_count: u32,
    ) -> io::Result<()> {
        Err(unsupported("cluster relocation"))
    }
}

/// Reports every disk as idle.
#[derive(Debug)]
pub struct IdleSource;

impl IdleSource {
    pub fn new(instance: &str) -> Self {
        tracing::warn!(
            "Disk utilization counters only available on Windows, treating '{}' as idle",
            instance
        );
        Self
    }
}

impl UtilizationSource for IdleSource {
    fn sample(&mut self) -> io::Result<f32> {
        Ok(0.0)
    }
}
