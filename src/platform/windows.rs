//! Win32 implementation of the OS primitives: FSCTL compression, WOF external
//! backing, retrieval pointers, volume bitmap, cluster moves and PDH disk
//! counters.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, GetCompressedFileSizeW, GetDiskFreeSpaceW, GetFileAttributesW,
    SetFileAttributesW, FILE_FLAGS_AND_ATTRIBUTES, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_DELETE,
    FILE_SHARE_MODE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Performance::{
    PdhAddEnglishCounterW, PdhCloseQuery, PdhCollectQueryData, PdhGetFormattedCounterValue,
    PdhOpenQueryW, PDH_FMT_COUNTERVALUE, PDH_FMT_DOUBLE, PDH_HCOUNTER, PDH_HQUERY,
};
use windows::Win32::System::Threading::{GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_LOWEST};
use windows::Win32::System::IO::DeviceIoControl;

use super::{
    BitmapChunk, CompressionBackend, DefragBackend, Extent, ExtentChunk, ExternalAlgorithm,
    FileAttributes, NativeCompression, UtilizationSource,
};
use crate::volume::{volume_device_path, volume_root, ClusterSize};

// winioctl.h
const FSCTL_GET_COMPRESSION: u32 = 0x0009_003C;
const FSCTL_SET_COMPRESSION: u32 = 0x0009_C040;
const FSCTL_GET_VOLUME_BITMAP: u32 = 0x0009_006F;
const FSCTL_GET_RETRIEVAL_POINTERS: u32 = 0x0009_0073;
const FSCTL_MOVE_FILE: u32 = 0x0009_0074;
const FSCTL_SET_EXTERNAL_BACKING: u32 = 0x0009_030C;
const FSCTL_GET_EXTERNAL_BACKING: u32 = 0x0009_0310;
const FSCTL_DELETE_EXTERNAL_BACKING: u32 = 0x0009_0314;

const ERROR_HANDLE_EOF: i32 = 38;
const ERROR_MORE_DATA: i32 = 234;
const ERROR_OBJECT_NOT_EXTERNALLY_BACKED: i32 = 342;

const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
/// Bits `SetFileAttributesW` accepts.
const SETTABLE_ATTRIBUTES: u32 = 0x0000_31A7;
const INVALID_FILE_ATTRIBUTES: u32 = u32::MAX;
const INVALID_FILE_SIZE: u32 = u32::MAX;

const FILE_READ_DATA: u32 = 0x0001;
const FILE_READ_ATTRIBUTES: u32 = 0x0080;
const DELETE: u32 = 0x0001_0000;
const SYNCHRONIZE: u32 = 0x0010_0000;

const WOF_CURRENT_VERSION: u32 = 1;
const WOF_PROVIDER_FILE: u32 = 2;
const FILE_PROVIDER_CURRENT_VERSION: u32 = 1;

/// Output buffer for bitmap and retrieval-pointer reads.
const IOCTL_BUFFER_SIZE: usize = 64 * 1024;
/// `VOLUME_BITMAP_BUFFER` header: StartingLcn, BitmapSize.
const BITMAP_HEADER: usize = 16;
/// `RETRIEVAL_POINTERS_BUFFER` header: ExtentCount (+ padding), StartingVcn.
const RETRIEVAL_HEADER: usize = 16;
const RETRIEVAL_EXTENT: usize = 16;

/// `WOF_EXTERNAL_INFO` immediately followed by `FILE_PROVIDER_EXTERNAL_INFO_V1`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct WofFileCompressionInfo {
    wof_version: u32,
    wof_provider: u32,
    file_version: u32,
    algorithm: u32,
    flags: u32,
}

/// MOVE_FILE_DATA
#[repr(C)]
struct MoveFileData {
    file_handle: HANDLE,
    starting_vcn: i64,
    starting_lcn: i64,
    cluster_count: u32,
}

/// Handle closed on drop.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

// Kernel handles are process-wide.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn wide_str(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Map a `windows` error onto `io::Error`, keeping the Win32 code when there is one.
fn to_io(error: windows::core::Error) -> io::Error {
    let hr = error.code().0 as u32;
    if hr & 0xFFFF_0000 == 0x8007_0000 {
        io::Error::from_raw_os_error((hr & 0xFFFF) as i32)
    } else {
        io::Error::new(io::ErrorKind::Other, error)
    }
}

fn open_wide(
    wide_path: &[u16],
    access: u32,
    share: FILE_SHARE_MODE,
    flags: FILE_FLAGS_AND_ATTRIBUTES,
) -> io::Result<OwnedHandle> {
    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide_path.as_ptr()),
            access,
            share,
            None,
            OPEN_EXISTING,
            flags,
            None,
        )
    }
    .map_err(to_io)?;

    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedHandle(handle))
}

fn open(path: &Path, access: u32, share: FILE_SHARE_MODE) -> io::Result<OwnedHandle> {
    open_wide(&wide(path), access, share, FILE_FLAG_BACKUP_SEMANTICS)
}

/// Issue a control code. Returns the bytes written to `output` alongside the
/// call result so `ERROR_MORE_DATA` replies can still be parsed.
fn control(
    handle: &OwnedHandle,
    code: u32,
    input: Option<(*const c_void, usize)>,
    output: &mut [u8],
) -> (io::Result<()>, usize) {
    let mut returned: u32 = 0;
    let (in_ptr, in_len) = match input {
        Some((ptr, len)) => (Some(ptr), len as u32),
        None => (None, 0),
    };
    let out_len = output.len() as u32;
    let out_ptr = (!output.is_empty()).then(|| output.as_mut_ptr() as *mut c_void);
    let result = unsafe {
        DeviceIoControl(
            handle.raw(),
            code,
            in_ptr,
            in_len,
            out_ptr,
            out_len,
            Some(&mut returned),
            None,
        )
    };
    (result.map_err(to_io), returned as usize)
}

fn raw_attributes(path: &Path) -> io::Result<u32> {
    let wide_path = wide(path);
    let bits = unsafe { GetFileAttributesW(PCWSTR(wide_path.as_ptr())) };
    if bits == INVALID_FILE_ATTRIBUTES {
        return Err(io::Error::last_os_error());
    }
    Ok(bits)
}

fn update_attribute(path: &Path, bit: u32, set: bool) -> io::Result<()> {
    let current = raw_attributes(path)?;
    let updated = if set { current | bit } else { current & !bit };
    if updated == current {
        return Ok(());
    }
    let mut settable = updated & SETTABLE_ATTRIBUTES;
    if settable == 0 {
        settable = FILE_ATTRIBUTE_NORMAL;
    }
    let wide_path = wide(path);
    unsafe { SetFileAttributesW(PCWSTR(wide_path.as_ptr()), FILE_FLAGS_AND_ATTRIBUTES(settable)) }
        .map_err(to_io)
}

/// Win32 filesystem backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Backend;

impl Win32Backend {
    /// Directories are opened shared; files are opened exclusively for writes.
    fn open_for_write(&self, path: &Path, access: u32) -> io::Result<OwnedHandle> {
        let is_dir = raw_attributes(path)? & FILE_ATTRIBUTE_DIRECTORY != 0;
        let share = if is_dir {
            FILE_SHARE_READ | FILE_SHARE_WRITE
        } else {
            FILE_SHARE_MODE(0)
        };
        open(path, access, share)
    }

    fn open_for_query(&self, path: &Path) -> io::Result<OwnedHandle> {
        open(path, GENERIC_READ.0, FILE_SHARE_READ | FILE_SHARE_WRITE)
    }
}

impl CompressionBackend for Win32Backend {
    fn cluster_size(&self, path: &Path) -> io::Result<ClusterSize> {
        let root = volume_root(path).map(|r| wide_str(&r));
        let root_ptr = root
            .as_ref()
            .map(|r| PCWSTR(r.as_ptr()))
            .unwrap_or(PCWSTR::null());

        let mut sectors_per_cluster: u32 = 0;
        let mut bytes_per_sector: u32 = 0;
        unsafe {
            GetDiskFreeSpaceW(
                root_ptr,
                Some(&mut sectors_per_cluster),
                Some(&mut bytes_per_sector),
                None,
                None,
            )
        }
        .map_err(to_io)?;

        let bytes = sectors_per_cluster as u64 * bytes_per_sector as u64;
        ClusterSize::new(bytes).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("volume reports invalid cluster size {bytes}"),
            )
        })
    }

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
        let bits = raw_attributes(path)?;
        let is_dir = bits & FILE_ATTRIBUTE_DIRECTORY != 0;
        let length = if is_dir { 0 } else { std::fs::metadata(path)?.len() };
        Ok(FileAttributes {
            length,
            is_dir,
            read_only: bits & FILE_ATTRIBUTE_READONLY != 0,
            archive: bits & FILE_ATTRIBUTE_ARCHIVE != 0,
        })
    }

    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
        update_attribute(path, FILE_ATTRIBUTE_READONLY, read_only)
    }

    fn set_archive(&self, path: &Path, archive: bool) -> io::Result<()> {
        update_attribute(path, FILE_ATTRIBUTE_ARCHIVE, archive)
    }

    fn native_compression(&self, path: &Path) -> io::Result<NativeCompression> {
        let handle = self.open_for_query(path)?;
        let mut format = [0u8; 2];
        let (result, _) = control(&handle, FSCTL_GET_COMPRESSION, None, &mut format);
        result?;
        Ok(NativeCompression::from_format(u16::from_le_bytes(format)))
    }

    fn set_native_compression(&self, path: &Path, value: NativeCompression) -> io::Result<()> {
        let handle = self.open_for_write(path, GENERIC_READ.0 | GENERIC_WRITE.0)?;
        let format: u16 = value.format();
        let (result, _) = control(
            &handle,
            FSCTL_SET_COMPRESSION,
            Some((&format as *const u16 as *const c_void, mem::size_of::<u16>())),
            &mut [],
        );
        result
    }

    fn external_backing(&self, path: &Path) -> io::Result<Option<ExternalAlgorithm>> {
        let handle = self.open_for_query(path)?;
        let mut out = [0u8; mem::size_of::<WofFileCompressionInfo>()];
        let (result, _) = control(&handle, FSCTL_GET_EXTERNAL_BACKING, None, &mut out);
        match result {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(ERROR_OBJECT_NOT_EXTERNALLY_BACKED) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }
        if read_u32_le(&out, 4) != WOF_PROVIDER_FILE {
            return Ok(None);
        }
        Ok(ExternalAlgorithm::from_code(read_u32_le(&out, 12)))
    }

    fn set_external_backing(&self, path: &Path, algorithm: ExternalAlgorithm) -> io::Result<()> {
        let handle = self.open_for_write(path, GENERIC_READ.0)?;
        let info = WofFileCompressionInfo {
            wof_version: WOF_CURRENT_VERSION,
            wof_provider: WOF_PROVIDER_FILE,
            file_version: FILE_PROVIDER_CURRENT_VERSION,
            algorithm: algorithm.code(),
            flags: 0,
        };
        let (result, _) = control(
            &handle,
            FSCTL_SET_EXTERNAL_BACKING,
            Some((
                &info as *const WofFileCompressionInfo as *const c_void,
                mem::size_of::<WofFileCompressionInfo>(),
            )),
            &mut [],
        );
        result
    }

    fn delete_external_backing(&self, path: &Path) -> io::Result<()> {
        let handle = self.open_for_write(path, GENERIC_READ.0 | GENERIC_WRITE.0)?;
        let (result, _) = control(&handle, FSCTL_DELETE_EXTERNAL_BACKING, None, &mut []);
        match result {
            Err(e) if e.raw_os_error() == Some(ERROR_OBJECT_NOT_EXTERNALLY_BACKED) => Ok(()),
            other => other,
        }
    }

    fn compressed_size(&self, path: &Path) -> io::Result<u64> {
        let wide_path = wide(path);
        let mut high: u32 = 0;
        let low = unsafe { GetCompressedFileSizeW(PCWSTR(wide_path.as_ptr()), Some(&mut high)) };
        if low == INVALID_FILE_SIZE {
            let error = io::Error::last_os_error();
            if error.raw_os_error().unwrap_or(0) != 0 {
                return Err(error);
            }
        }
        Ok(((high as u64) << 32) | low as u64)
    }
}

impl DefragBackend for Win32Backend {
    type Volume = OwnedHandle;
    type File = OwnedHandle;

    fn open_volume(&self, path: &Path) -> io::Result<OwnedHandle> {
        let device = volume_device_path(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no drive letter", path.display()),
            )
        })?;
        tracing::debug!("Opening volume: {}", device);
        open_wide(
            &wide_str(&device),
            GENERIC_READ.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            FILE_FLAGS_AND_ATTRIBUTES(0),
        )
    }

    fn open_file_for_move(&self, path: &Path) -> io::Result<OwnedHandle> {
        open(
            path,
            FILE_READ_DATA | FILE_READ_ATTRIBUTES | DELETE | SYNCHRONIZE,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
        )
    }

    fn open_file_for_query(&self, path: &Path) -> io::Result<OwnedHandle> {
        open(
            path,
            FILE_READ_ATTRIBUTES | SYNCHRONIZE,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
        )
    }

    fn read_bitmap(&self, volume: &OwnedHandle, starting_lcn: u64) -> io::Result<BitmapChunk> {
        let input = starting_lcn as i64;
        let mut buffer = vec![0u8; IOCTL_BUFFER_SIZE];
        let (result, returned) = control(
            volume,
            FSCTL_GET_VOLUME_BITMAP,
            Some((&input as *const i64 as *const c_void, mem::size_of::<i64>())),
            &mut buffer,
        );
        let more = match result {
            Ok(()) => false,
            Err(e) if e.raw_os_error() == Some(ERROR_MORE_DATA) => true,
            Err(e) => return Err(e),
        };
        if returned < BITMAP_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short volume bitmap reply",
            ));
        }

        let chunk_start = read_u64_le(&buffer, 0);
        let bitmap_size = read_u64_le(&buffer, 8);
        let bytes = returned - BITMAP_HEADER;
        buffer.truncate(returned);
        let bits = buffer.split_off(BITMAP_HEADER);

        Ok(BitmapChunk {
            starting_lcn: chunk_start,
            cluster_count: bitmap_size.min(bytes as u64 * 8),
            bits,
            more,
        })
    }

    fn read_extents(&self, file: &OwnedHandle, starting_vcn: u64) -> io::Result<ExtentChunk> {
        let input = starting_vcn as i64;
        let mut buffer = vec![0u8; IOCTL_BUFFER_SIZE];
        let (result, returned) = control(
            file,
            FSCTL_GET_RETRIEVAL_POINTERS,
            Some((&input as *const i64 as *const c_void, mem::size_of::<i64>())),
            &mut buffer,
        );
        let more = match result {
            Ok(()) => false,
            Err(e) if e.raw_os_error() == Some(ERROR_MORE_DATA) => true,
            // Resident data: no clusters at all.
            Err(e) if e.raw_os_error() == Some(ERROR_HANDLE_EOF) => {
                return Ok(ExtentChunk {
                    starting_vcn,
                    extents: Vec::new(),
                    more: false,
                })
            }
            Err(e) => return Err(e),
        };
        if returned < RETRIEVAL_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short retrieval pointers reply",
            ));
        }

        let count = read_u32_le(&buffer, 0) as usize;
        let available = (returned - RETRIEVAL_HEADER) / RETRIEVAL_EXTENT;
        let extents = (0..count.min(available))
            .map(|i| {
                let offset = RETRIEVAL_HEADER + i * RETRIEVAL_EXTENT;
                Extent {
                    next_vcn: read_u64_le(&buffer, offset),
                    lcn: match read_u64_le(&buffer, offset + 8) as i64 {
                        lcn if lcn < 0 => None,
                        lcn => Some(lcn as u64),
                    },
                }
            })
            .collect();

        Ok(ExtentChunk {
            starting_vcn: read_u64_le(&buffer, 8),
            extents,
            more,
        })
    }

    fn move_clusters(
        &self,
        volume: &OwnedHandle,
        file: &OwnedHandle,
        starting_vcn: u64,
        target_lcn: u64,
        cluster_count: u32,
    ) -> io::Result<()> {
        let request = MoveFileData {
            file_handle: file.raw(),
            starting_vcn: starting_vcn as i64,
            starting_lcn: target_lcn as i64,
            cluster_count,
        };
        let (result, _) = control(
            volume,
            FSCTL_MOVE_FILE,
            Some((
                &request as *const MoveFileData as *const c_void,
                mem::size_of::<MoveFileData>(),
            )),
            &mut [],
        );
        result
    }
}

/// `\PhysicalDisk(<instance>)\% Disk Time` sampled through PDH.
pub struct DiskTimeCounter {
    query: PDH_HQUERY,
    counter: PDH_HCOUNTER,
}

// PDH query handles are not tied to the opening thread.
unsafe impl Send for DiskTimeCounter {}

impl DiskTimeCounter {
    pub fn open(instance: &str) -> io::Result<Self> {
        let path = wide_str(&format!("\\PhysicalDisk({instance})\\% Disk Time"));
        let mut query = PDH_HQUERY::default();
        let mut counter = PDH_HCOUNTER::default();

        let status = unsafe { PdhOpenQueryW(PCWSTR::null(), 0, &mut query) };
        pdh_status(status, "PdhOpenQuery")?;

        let status = unsafe { PdhAddEnglishCounterW(query, PCWSTR(path.as_ptr()), 0, &mut counter) };
        if let Err(e) = pdh_status(status, "PdhAddEnglishCounter") {
            unsafe {
                PdhCloseQuery(query);
            }
            return Err(e);
        }

        let this = Self { query, counter };
        // Rate counters need two collections before the first value.
        let status = unsafe { PdhCollectQueryData(this.query) };
        pdh_status(status, "PdhCollectQueryData")?;
        tracing::debug!("Opened disk time counter for instance '{}'", instance);
        Ok(this)
    }
}

impl UtilizationSource for DiskTimeCounter {
    fn sample(&mut self) -> io::Result<f32> {
        let status = unsafe { PdhCollectQueryData(self.query) };
        pdh_status(status, "PdhCollectQueryData")?;

        let mut value = PDH_FMT_COUNTERVALUE::default();
        let status =
            unsafe { PdhGetFormattedCounterValue(self.counter, PDH_FMT_DOUBLE, None, &mut value) };
        pdh_status(status, "PdhGetFormattedCounterValue")?;

        let percent = unsafe { value.Anonymous.doubleValue };
        Ok(percent.clamp(0.0, 100.0) as f32)
    }
}

impl Drop for DiskTimeCounter {
    fn drop(&mut self) {
        unsafe {
            PdhCloseQuery(self.query);
        }
    }
}

fn pdh_status(status: u32, what: &str) -> io::Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{what} failed with status {status:#010x}"),
        ))
    }
}

pub fn lower_thread_priority() {
    unsafe {
        if let Err(e) = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_LOWEST) {
            tracing::debug!("SetThreadPriority failed: {}", e);
        }
    }
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ])
}
