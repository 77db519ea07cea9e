//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The monitors read kernel interfaces only through the `FileSystem` trait, so
//! they work against the real `/proc` and `/sys` trees on Linux and against
//! [`MockFs`](crate::collector::MockFs) fixtures in tests.

use std::path::{Path, PathBuf};

use crate::collector::buffer::{Buffer, BufferConfig};
use crate::collector::error::CollectError;

/// Abstraction for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> Result<String, CollectError>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CollectError>;

    /// Replaces the contents of an existing file (kernel control files).
    fn write(&self, path: &Path, contents: &str) -> Result<(), CollectError>;
}

/// Real filesystem implementation backed by [`Buffer`].
///
/// Every call uses a fresh buffer, so concurrent refreshes never share byte
/// storage.
#[derive(Debug, Default, Clone)]
pub struct RealFs {
    config: BufferConfig,
}

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BufferConfig) -> Self {
        Self { config }
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> Result<String, CollectError> {
        let buffer = Buffer::open(path, self.config.clone())?;
        Ok(buffer.text())
    }

    fn exists(&self, path: &Path) -> bool {
        Buffer::exists(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CollectError> {
        let entries = std::fs::read_dir(path).map_err(|e| CollectError::from_io(path, &e))?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry.map_err(|e| CollectError::from_io(path, &e))?.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), CollectError> {
        // Control files must already exist; never create them.
        let config = self.config.clone().with_create_if_missing(false);
        Buffer::with_config(config).write(path, contents.as_bytes())
    }
}
