// Public library interface for ntfs-compactor
// The CLI and the debug tools are thin layers over these modules

pub mod compress;
pub mod config;
pub mod defrag;
pub mod error;
pub mod format;
pub mod monitor;
pub mod platform;
pub mod signal;
pub mod volume;
pub mod watch;

pub use compress::{Compactor, CompressOutcome, CompressionAlgorithm};
pub use defrag::{DefragOutcome, Defragmenter};
pub use error::{CompactError, ConfigError, DefragError};
pub use watch::WatchScheduler;
