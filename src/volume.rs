//! Volume geometry: allocation unit size and on-disk length accounting.

use std::path::{Component, Path, PathBuf, Prefix};

/// A volume's allocation unit in bytes. Always a non-zero power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterSize(u64);

impl ClusterSize {
    /// The NTFS default for volumes up to 16 TB.
    pub const DEFAULT: ClusterSize = ClusterSize(4096);

    pub fn new(bytes: u64) -> Option<Self> {
        (bytes > 0 && bytes.is_power_of_two()).then_some(Self(bytes))
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Round `length` up to the next multiple of the cluster size.
    pub fn length_on_disk(self, length: u64) -> u64 {
        let mask = self.0 - 1;
        if length & mask == 0 {
            length
        } else {
            (length & !mask).saturating_add(self.0)
        }
    }

    /// Number of clusters needed to hold `length` bytes.
    pub fn clusters(self, length: u64) -> u64 {
        self.length_on_disk(length) / self.0
    }
}

impl Default for ClusterSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Absolute, lexically normalized form of `path`.
///
/// `.` and `..` are resolved without touching the filesystem and verbatim
/// drive prefixes (`\\?\C:`) are rewritten to plain `C:`, so two spellings of
/// the same location compare equal.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(prefix) => match prefix.kind() {
                Prefix::VerbatimDisk(letter) => {
                    normalized.push(format!("{}:", letter.to_ascii_uppercase() as char))
                }
                _ => normalized.push(component.as_os_str()),
            },
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    normalized
}

/// Uppercased drive letter of `path`, from its `C:` or `\\?\C:` prefix.
pub fn drive_letter(path: &Path) -> Option<char> {
    if let Some(Component::Prefix(prefix)) = path.components().next() {
        if let Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) = prefix.kind() {
            return Some(letter.to_ascii_uppercase() as char);
        }
    }
    // Drive-letter spellings are plain names on non-Windows hosts.
    let text = path.to_string_lossy();
    let text = text.strip_prefix(r"\\?\").unwrap_or(&text);
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            Some(letter.to_ascii_uppercase())
        }
        _ => None,
    }
}

/// Drive letter of `path`, resolving relative paths against the current directory.
fn resolved_drive_letter(path: &Path) -> Option<char> {
    drive_letter(path).or_else(|| drive_letter(&normalize(path)))
}

/// Key identifying the device a path lives on: its uppercased drive letter.
///
/// Paths without a drive letter (UNC shares, UNIX paths in tests) all share
/// the `\\` key and serialize on one lock.
pub fn device_key(path: &Path) -> char {
    resolved_drive_letter(path).unwrap_or('\\')
}

/// `\\.\X:` device path for the volume holding `path`, if it has a drive letter.
pub fn volume_device_path(path: &Path) -> Option<String> {
    resolved_drive_letter(path).map(|letter| format!("\\\\.\\{letter}:"))
}

/// `X:\` root of the volume holding `path`, if it has a drive letter.
pub fn volume_root(path: &Path) -> Option<String> {
    resolved_drive_letter(path).map(|letter| format!("{letter}:\\"))
}

/// Case-insensitive component-wise test that `path` lies at or below `root`.
///
/// Both sides are normalized first, so `C:\Temp\..\Windows` and
/// `\\?\C:\Windows` are inside `C:\Windows`. NTFS names compare
/// case-insensitively, so `c:\WINDOWS\System32` is too.
pub fn is_within(path: &Path, root: &Path) -> bool {
    if root.as_os_str().is_empty() {
        return false;
    }
    let path = normalize(path);
    let root = normalize(root);
    let lower = |c: Component<'_>| c.as_os_str().to_string_lossy().to_lowercase();
    let mut path_components = path.components().map(lower);
    let mut root_components = root.components().map(lower);
    root_components.all(|r| path_components.next().as_deref() == Some(r.as_str()))
}
