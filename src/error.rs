//! Error types for compaction, relocation and configuration.
//!
//! Expected outcomes (a file that was too small to shrink, a compression
//! rolled back because it did not pay off, a file that was already
//! contiguous) are not errors; they are reported through
//! [`crate::compress::CompressOutcome`] and [`crate::defrag::DefragOutcome`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Win32 `ERROR_ACCESS_DENIED`. `FSCTL_MOVE_FILE` reports it when the
/// destination clusters were allocated after the bitmap snapshot was taken.
pub const ERROR_ACCESS_DENIED: i32 = 5;

/// Result alias for compression operations.
pub type CompactResult<T> = Result<T, CompactError>;

/// Result alias for relocation operations.
pub type DefragResult<T> = Result<T, DefragError>;

#[derive(Debug, Error)]
pub enum CompactError {
    /// The path lies under the protected system directory and is never
    /// opened for write.
    #[error("refusing to modify protected system path {}", path.display())]
    Refused { path: PathBuf },

    /// An OS primitive failed. The original file attributes have been
    /// restored by the time this is returned.
    #[error("{op} failed for {}: {source}", path.display())]
    Os {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Directory enumeration failed.
    #[error("failed to enumerate {}: {message}", path.display())]
    Walk { path: PathBuf, message: String },
}

impl CompactError {
    pub(crate) fn os(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Os {
            op,
            path: path.into(),
            source,
        }
    }

    /// Refusals are final; everything else may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Refused { .. })
    }

    /// Raw OS error code carried by the failure, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DefragError {
    /// The volume or the file could not be opened. No relocation was attempted.
    #[error("cannot open {} for relocation: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A move targeted clusters that are no longer free. Re-read the volume
    /// bitmap and try again.
    #[error("volume bitmap is stale: moving vcn {vcn} to lcn {lcn} was rejected")]
    StaleMap {
        vcn: u64,
        lcn: u64,
        #[source]
        source: io::Error,
    },

    #[error("refusing to relocate protected system path {}", path.display())]
    Refused { path: PathBuf },

    #[error("{op} failed for {}: {source}", path.display())]
    Os {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DefragError {
    pub(crate) fn os(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Os {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_stale_map(&self) -> bool {
        matches!(self, Self::StaleMap { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown compression algorithm '{0}'")]
    InvalidAlgorithm(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_is_not_retryable() {
        let refused = CompactError::Refused {
            path: PathBuf::from(r"C:\Windows\notepad.exe"),
        };
        assert!(!refused.is_retryable());

        let os = CompactError::os(
            "set compression",
            r"D:\data\a.bin",
            io::Error::from_raw_os_error(32),
        );
        assert!(os.is_retryable());
        assert_eq!(os.os_code(), Some(32));
    }

    #[test]
    fn stale_map_is_distinct() {
        let stale = DefragError::StaleMap {
            vcn: 0,
            lcn: 1000,
            source: io::Error::from_raw_os_error(ERROR_ACCESS_DENIED),
        };
        assert!(stale.is_stale_map());
        let setup = DefragError::Setup {
            path: PathBuf::from(r"\\.\C:"),
            source: io::Error::from_raw_os_error(ERROR_ACCESS_DENIED),
        };
        assert!(!setup.is_stale_map());
    }
}
