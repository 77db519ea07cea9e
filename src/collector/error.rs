//! Error type shared by the file reader, the pattern matcher and the monitors.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for collection failures.
///
/// Cloneable so that a [`Buffer`](crate::collector::Buffer) can keep its last
/// error around and hand out copies to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    /// The path does not exist.
    NotFound(PathBuf),
    /// The caller lacks read (or write) permission.
    PermissionDenied(PathBuf),
    /// Contents exceed the configured buffer limit.
    Overflow { path: PathBuf, limit: usize },
    /// The path is empty or otherwise unusable.
    InvalidPath(String),
    /// A bounded retry ran out of time.
    Timeout { path: PathBuf, waited: Duration },
    /// Read or write failure not otherwise classified.
    Io { path: PathBuf, message: String },
    /// Malformed extraction pattern.
    Pattern { pattern: String, message: String },
    /// Uncategorized OS-level failure.
    System { path: PathBuf, code: i32 },
    /// Content was read but could not be interpreted.
    Parse(String),
}

impl CollectError {
    /// Classifies an OS error raised while touching `path`.
    pub fn from_io(path: &Path, err: &io::Error) -> Self {
        let path = path.to_path_buf();
        match err.raw_os_error() {
            Some(libc::ENOENT) => return CollectError::NotFound(path),
            Some(libc::EACCES) | Some(libc::EPERM) => return CollectError::PermissionDenied(path),
            Some(libc::EINVAL) => {
                return CollectError::InvalidPath(path.display().to_string());
            }
            Some(libc::EIO) => {
                return CollectError::Io {
                    path,
                    message: err.to_string(),
                };
            }
            Some(code) => return CollectError::System { path, code },
            None => {}
        }

        match err.kind() {
            io::ErrorKind::NotFound => CollectError::NotFound(path),
            io::ErrorKind::PermissionDenied => CollectError::PermissionDenied(path),
            io::ErrorKind::InvalidInput => CollectError::InvalidPath(path.display().to_string()),
            _ => CollectError::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    /// Returns `true` for errors caused by an interface that simply is not
    /// there (as opposed to one that exists but misbehaves).
    pub fn is_absent(&self) -> bool {
        matches!(self, CollectError::NotFound(_))
    }
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::NotFound(path) => write!(f, "{} not found", path.display()),
            CollectError::PermissionDenied(path) => {
                write!(f, "permission denied: {}", path.display())
            }
            CollectError::Overflow { path, limit } => write!(
                f,
                "{} exceeds buffer limit of {} bytes",
                path.display(),
                limit
            ),
            CollectError::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
            CollectError::Timeout { path, waited } => write!(
                f,
                "timed out after {} ms accessing {}",
                waited.as_millis(),
                path.display()
            ),
            CollectError::Io { path, message } => {
                write!(f, "I/O error on {}: {}", path.display(), message)
            }
            CollectError::Pattern { pattern, message } => {
                write!(f, "invalid pattern '{}': {}", pattern, message)
            }
            CollectError::System { path, code } => {
                write!(f, "system error {} on {}", code, path.display())
            }
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<io::Error> for CollectError {
    fn from(e: io::Error) -> Self {
        CollectError::from_io(Path::new(""), &e)
    }
}
