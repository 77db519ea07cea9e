//! In-memory file buffer for kernel text interfaces.
//!
//! Kernel pseudo-files under `/proc` and `/sys` report a zero length through
//! `stat` yet contain data, so the size of a read is discovered by reading
//! rather than trusted from metadata. Regular files above
//! [`BufferConfig::mmap_threshold`] are memory-mapped and copied out, so the
//! buffer always owns its bytes; everything else (and any file that fails to
//! map) goes through chunked buffered reads.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collector::error::CollectError;

/// Interval between attempts in [`Buffer::try_read`] / [`Buffer::try_write`].
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Tunables for a [`Buffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Largest content a buffer accepts; larger reads fail with `Overflow`.
    pub max_buffer_size: usize,
    /// Files whose metadata size is above this are memory-mapped first.
    pub mmap_threshold: u64,
    /// Chunk size for buffered reads.
    pub read_ahead: usize,
    /// Treat a missing path as valid (it is created empty on access).
    pub create_if_missing: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1024 * 1024,
            mmap_threshold: 64 * 1024,
            read_ahead: 4096,
            create_if_missing: false,
        }
    }
}

impl BufferConfig {
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn with_mmap_threshold(mut self, threshold: u64) -> Self {
        self.mmap_threshold = threshold;
        self
    }

    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead.max(1);
        self
    }

    pub fn with_create_if_missing(mut self, enable: bool) -> Self {
        self.create_if_missing = enable;
        self
    }
}

#[derive(Debug, Default)]
struct BufferState {
    path: Option<PathBuf>,
    contents: Vec<u8>,
    /// Last load went through a memory mapping.
    mapped: bool,
    valid: bool,
    last_error: Option<CollectError>,
    last_update: Option<DateTime<Utc>>,
}

/// Thread-safe buffer holding the contents of at most one file.
///
/// Accessors share a read lock; `read`, `refresh`, `clear` and the write
/// operations hold the write lock for their whole duration.
#[derive(Debug, Default)]
pub struct Buffer {
    config: BufferConfig,
    state: RwLock<BufferState>,
}

impl Buffer {
    /// Creates an empty buffer with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BufferConfig) -> Self {
        Self {
            config,
            state: RwLock::default(),
        }
    }

    /// Creates a buffer and immediately loads `path` into it.
    pub fn open(path: impl AsRef<Path>, config: BufferConfig) -> Result<Self, CollectError> {
        let buffer = Self::with_config(config);
        buffer.read(path)?;
        Ok(buffer)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn set_max_buffer_size(&mut self, size: usize) {
        self.config.max_buffer_size = size;
    }

    pub fn set_create_if_missing(&mut self, enable: bool) {
        self.config.create_if_missing = enable;
    }

    /// Loads `path` into the buffer.
    ///
    /// On failure the previous contents stay in place and only the last error
    /// is updated.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<(), CollectError> {
        let mut state = self.write_state();
        self.load_into(&mut state, path.as_ref())
    }

    /// Like [`read`](Self::read), but keeps retrying while access is denied.
    ///
    /// Any other failure is returned immediately. Once `timeout` has elapsed
    /// the call fails with [`CollectError::Timeout`].
    pub fn try_read(&self, path: impl AsRef<Path>, timeout: Duration) -> Result<(), CollectError> {
        let path = path.as_ref();
        self.retry(path, timeout, || self.read(path))
    }

    /// Re-reads the currently loaded path.
    pub fn refresh(&self) -> Result<(), CollectError> {
        let mut state = self.write_state();
        let Some(path) = state.path.clone() else {
            let err = CollectError::InvalidPath(String::new());
            state.last_error = Some(err.clone());
            return Err(err);
        };
        self.load_into(&mut state, &path)
    }

    /// Drops the contents and forgets the current path.
    pub fn clear(&self) {
        let mut state = self.write_state();
        *state = BufferState::default();
    }

    /// Replaces the contents of `path` with `data`.
    ///
    /// If `path` is the file currently held, the buffer is updated as well.
    pub fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<(), CollectError> {
        self.store(path.as_ref(), data, false)
    }

    /// Appends `data` to `path`.
    pub fn append(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<(), CollectError> {
        self.store(path.as_ref(), data, true)
    }

    /// Like [`write`](Self::write), retrying while access is denied.
    pub fn try_write(
        &self,
        path: impl AsRef<Path>,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), CollectError> {
        let path = path.as_ref();
        self.retry(path, timeout, || self.write(path, data))
    }

    pub fn is_valid(&self) -> bool {
        self.read_state().valid
    }

    pub fn last_error(&self) -> Option<CollectError> {
        self.read_state().last_error.clone()
    }

    /// Returns a copy of the raw bytes.
    pub fn data(&self) -> Vec<u8> {
        self.read_state().contents.clone()
    }

    /// Returns the contents as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.read_state().contents).into_owned()
    }

    /// Splits the contents on `\n`. A trailing newline does not produce an
    /// empty last element.
    pub fn lines(&self) -> Vec<String> {
        let state = self.read_state();
        split_lines(&String::from_utf8_lossy(&state.contents))
            .map(str::to_string)
            .collect()
    }

    /// Returns line `n` (zero-based), or `None` if out of range.
    pub fn line(&self, n: usize) -> Option<String> {
        let state = self.read_state();
        split_lines(&String::from_utf8_lossy(&state.contents))
            .nth(n)
            .map(str::to_string)
    }

    pub fn size(&self) -> usize {
        self.read_state().contents.len()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.read_state().path.clone()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.read_state().last_update
    }

    /// Whether the current contents were loaded through a memory mapping.
    pub fn is_mapped(&self) -> bool {
        self.read_state().mapped
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    fn load_into(&self, state: &mut BufferState, path: &Path) -> Result<(), CollectError> {
        match self.load(path) {
            Ok((contents, mapped)) => {
                state.contents = contents;
                state.mapped = mapped;
                state.path = Some(path.to_path_buf());
                state.valid = true;
                state.last_error = None;
                state.last_update = Some(Utc::now());
                Ok(())
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Returns the file bytes and whether they were read through a mapping.
    /// A mapping is copied out and dropped before returning, so a file that
    /// shrinks afterwards cannot invalidate the buffer.
    fn load(&self, path: &Path) -> Result<(Vec<u8>, bool), CollectError> {
        let metadata = self.validate(path)?;
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.config.create_if_missing => {
                File::create(path).map_err(|e| CollectError::from_io(path, &e))?;
                return Ok((Vec::new(), false));
            }
            Err(e) => return Err(CollectError::from_io(path, &e)),
        };

        let reported = metadata.map(|m| m.len()).unwrap_or(0);
        if reported > self.config.mmap_threshold {
            if reported > self.config.max_buffer_size as u64 {
                return Err(self.overflow(path));
            }
            // SAFETY: the mapping is read-only and dropped right after the copy.
            // The state lock is held, so no write through this buffer can
            // truncate the file while it is mapped.
            match unsafe { Mmap::map(&file) } {
                Ok(map) if map.len() <= self.config.max_buffer_size => {
                    return Ok((map.to_vec(), true));
                }
                Ok(_) => return Err(self.overflow(path)),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "mmap failed, falling back to buffered read");
                }
            }
        }

        self.read_chunked(file, path).map(|data| (data, false))
    }

    fn read_chunked(&self, mut file: File, path: &Path) -> Result<Vec<u8>, CollectError> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; self.config.read_ahead.max(1)];
        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CollectError::from_io(path, &e)),
            };
            if data.len() + n > self.config.max_buffer_size {
                return Err(self.overflow(path));
            }
            data.extend_from_slice(&chunk[..n]);
        }
        Ok(data)
    }

    /// Checks the path before any I/O. Returns metadata when the path exists.
    fn validate(&self, path: &Path) -> Result<Option<fs::Metadata>, CollectError> {
        if path.as_os_str().is_empty() {
            return Err(CollectError::InvalidPath(String::new()));
        }
        match fs::metadata(path) {
            Ok(m) if m.is_dir() => Err(CollectError::InvalidPath(path.display().to_string())),
            Ok(m) => {
                check_readable(path)?;
                Ok(Some(m))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.config.create_if_missing => {
                Ok(None)
            }
            Err(e) => Err(CollectError::from_io(path, &e)),
        }
    }

    fn store(&self, path: &Path, data: &[u8], append: bool) -> Result<(), CollectError> {
        let mut state = self.write_state();
        let result = self.write_file(path, data, append);
        match &result {
            Ok(()) if state.path.as_deref() == Some(path) => {
                if !append {
                    state.contents.clear();
                }
                state.contents.extend_from_slice(data);
                state.mapped = false;
                state.valid = true;
                state.last_update = Some(Utc::now());
                state.last_error = None;
            }
            Ok(()) => state.last_error = None,
            Err(err) => state.last_error = Some(err.clone()),
        }
        result
    }

    fn write_file(&self, path: &Path, data: &[u8], append: bool) -> Result<(), CollectError> {
        if path.as_os_str().is_empty() {
            return Err(CollectError::InvalidPath(String::new()));
        }
        let mut options = OpenOptions::new();
        options.create(self.config.create_if_missing);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let mut file = options
            .open(path)
            .map_err(|e| CollectError::from_io(path, &e))?;
        file.write_all(data)
            .and_then(|()| file.flush())
            .map_err(|e| CollectError::from_io(path, &e))
    }

    fn retry(
        &self,
        path: &Path,
        timeout: Duration,
        mut attempt: impl FnMut() -> Result<(), CollectError>,
    ) -> Result<(), CollectError> {
        let start = Instant::now();
        loop {
            match attempt() {
                Err(CollectError::PermissionDenied(_)) => {}
                other => return other,
            }
            let waited = start.elapsed();
            if waited >= timeout {
                let err = CollectError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                };
                self.write_state().last_error = Some(err.clone());
                return Err(err);
            }
            thread::sleep(RETRY_INTERVAL.min(timeout - waited));
        }
    }

    fn overflow(&self, path: &Path) -> CollectError {
        CollectError::Overflow {
            path: path.to_path_buf(),
            limit: self.config.max_buffer_size,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, BufferState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, BufferState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read permission check against the effective ids, before any open.
fn check_readable(path: &Path) -> Result<(), CollectError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CollectError::InvalidPath(path.display().to_string()))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the whole call.
    let rc = unsafe {
        libc::faccessat(libc::AT_FDCWD, c_path.as_ptr(), libc::R_OK, libc::AT_EACCESS)
    };
    if rc == 0 {
        return Ok(());
    }
    match io::Error::last_os_error() {
        e if e.raw_os_error() == Some(libc::EACCES) => {
            Err(CollectError::PermissionDenied(path.to_path_buf()))
        }
        // Anything else is left for the open to report.
        _ => Ok(()),
    }
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    let empty = text.is_empty();
    body.split('\n').filter(move |_| !empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_buffered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let bytes: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        std::fs::write(&path, &bytes).unwrap();

        let buffer = Buffer::with_config(BufferConfig::default().with_read_ahead(7));
        buffer.read(&path).unwrap();

        assert!(buffer.is_valid());
        assert!(!buffer.is_mapped());
        assert_eq!(buffer.data(), bytes);
        assert_eq!(buffer.size(), bytes.len());
        assert_eq!(buffer.path().as_deref(), Some(path.as_path()));
        assert!(buffer.last_update().is_some());
    }

    #[test]
    fn test_round_trip_mapped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let bytes: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &bytes).unwrap();

        let buffer = Buffer::with_config(BufferConfig::default().with_mmap_threshold(1024));
        buffer.read(&path).unwrap();

        assert!(buffer.is_mapped());
        assert_eq!(buffer.data(), bytes);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let buffer = Buffer::open(&path, BufferConfig::default()).unwrap();
        assert!(buffer.is_valid());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.lines().is_empty());
        assert_eq!(buffer.line(0), None);
    }

    #[test]
    fn test_overflow_keeps_previous_state() {
        let dir = tempdir().unwrap();
        let small = dir.path().join("small");
        let big = dir.path().join("big");
        std::fs::write(&small, b"keep me\n").unwrap();
        std::fs::write(&big, vec![b'x'; 4096]).unwrap();

        let buffer = Buffer::with_config(BufferConfig::default().with_max_buffer_size(1024));
        buffer.read(&small).unwrap();

        let err = buffer.read(&big).unwrap_err();
        assert!(matches!(err, CollectError::Overflow { limit: 1024, .. }));
        assert_eq!(buffer.text(), "keep me\n");
        assert_eq!(buffer.path().as_deref(), Some(small.as_path()));
        assert!(buffer.is_valid());
        assert_eq!(buffer.last_error(), Some(err));
    }

    #[test]
    fn test_overflow_on_mapped_path() {
        let dir = tempdir().unwrap();
        let big = dir.path().join("big");
        std::fs::write(&big, vec![b'x'; 8192]).unwrap();

        let config = BufferConfig::default()
            .with_max_buffer_size(4096)
            .with_mmap_threshold(1024);
        let buffer = Buffer::with_config(config);
        assert!(matches!(
            buffer.read(&big),
            Err(CollectError::Overflow { .. })
        ));
        assert!(!buffer.is_valid());
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_missing_file() {
        let buffer = Buffer::new();
        let err = buffer.read("/nonexistent/kernstat/file").unwrap_err();
        assert!(matches!(err, CollectError::NotFound(_)));
        assert!(!buffer.is_valid());
        assert!(matches!(buffer.last_error(), Some(CollectError::NotFound(_))));
    }

    #[test]
    fn test_invalid_paths() {
        let buffer = Buffer::new();
        assert!(matches!(buffer.read(""), Err(CollectError::InvalidPath(_))));

        let dir = tempdir().unwrap();
        assert!(matches!(
            buffer.read(dir.path()),
            Err(CollectError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_create_if_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh");

        let buffer = Buffer::with_config(BufferConfig::default().with_create_if_missing(true));
        buffer.read(&path).unwrap();
        assert!(buffer.is_valid());
        assert_eq!(buffer.size(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_lines_and_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines");
        std::fs::write(&path, "first\nsecond\n\nfourth\n").unwrap();

        let buffer = Buffer::open(&path, BufferConfig::default()).unwrap();
        assert_eq!(buffer.lines(), vec!["first", "second", "", "fourth"]);
        assert_eq!(buffer.line(1).as_deref(), Some("second"));
        assert_eq!(buffer.line(2).as_deref(), Some(""));
        assert_eq!(buffer.line(4), None);
    }

    #[test]
    fn test_lines_without_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines");
        std::fs::write(&path, "a\nb").unwrap();

        let buffer = Buffer::open(&path, BufferConfig::default()).unwrap();
        assert_eq!(buffer.lines(), vec!["a", "b"]);
    }

    #[test]
    fn test_clear_and_refresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counter");
        std::fs::write(&path, "1\n").unwrap();

        let buffer = Buffer::open(&path, BufferConfig::default()).unwrap();
        std::fs::write(&path, "2\n").unwrap();
        buffer.refresh().unwrap();
        assert_eq!(buffer.text(), "2\n");

        buffer.clear();
        assert!(!buffer.is_valid());
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.path(), None);
        assert!(matches!(buffer.refresh(), Err(CollectError::InvalidPath(_))));
    }

    #[test]
    fn test_write_updates_current_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scaling_governor");
        std::fs::write(&path, "powersave\n").unwrap();

        let buffer = Buffer::open(&path, BufferConfig::default()).unwrap();
        buffer.write(&path, b"userspace\n").unwrap();
        assert_eq!(buffer.text(), "userspace\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "userspace\n");

        buffer.append(&path, b"extra\n").unwrap();
        assert_eq!(buffer.lines(), vec!["userspace", "extra"]);
    }

    #[test]
    fn test_write_missing_target() {
        let buffer = Buffer::new();
        let err = buffer
            .write("/nonexistent/kernstat/online", b"1")
            .unwrap_err();
        assert!(matches!(err, CollectError::NotFound(_)));
    }

    #[test]
    fn test_try_read_does_not_retry_not_found() {
        let buffer = Buffer::new();
        let start = Instant::now();
        let err = buffer
            .try_read("/nonexistent/kernstat/file", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, CollectError::NotFound(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_try_read_times_out_on_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "hidden").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users bypass file modes; nothing to test then.
        if File::open(&path).is_ok() {
            return;
        }

        let buffer = Buffer::new();
        let err = buffer
            .try_read(&path, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, CollectError::Timeout { .. }));
        assert!(!buffer.is_valid());
    }

    #[test]
    fn test_try_read_succeeds_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ok");
        std::fs::write(&path, "fine").unwrap();

        let buffer = Buffer::new();
        buffer.try_read(&path, Duration::from_millis(50)).unwrap();
        assert_eq!(buffer.text(), "fine");
    }

    #[test]
    fn test_mapped_contents_survive_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shrinking");
        let bytes = vec![b'k'; 200_000];
        std::fs::write(&path, &bytes).unwrap();

        let buffer = Buffer::new();
        buffer.read(&path).unwrap();
        assert!(buffer.is_mapped());

        std::fs::write(&path, b"short").unwrap();
        assert_eq!(buffer.size(), bytes.len());
        assert_eq!(buffer.data(), bytes);
        assert_eq!(buffer.lines().len(), 1);

        buffer.refresh().unwrap();
        assert!(!buffer.is_mapped());
        assert_eq!(buffer.text(), "short");
    }

    #[test]
    fn test_write_over_mapped_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("control");
        std::fs::write(&path, vec![b'0'; 100_000]).unwrap();

        let buffer = Buffer::new();
        buffer.read(&path).unwrap();
        assert!(buffer.is_mapped());

        buffer.write(&path, b"1").unwrap();
        assert!(!buffer.is_mapped());
        assert_eq!(buffer.data(), b"1");
    }

    #[test]
    fn test_read_permission_checked_first() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, "value\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o200)).unwrap();

        if File::open(&path).is_ok() {
            return;
        }

        let buffer = Buffer::new();
        let err = buffer.read(&path).unwrap_err();
        assert_eq!(err, CollectError::PermissionDenied(path.clone()));
        assert_eq!(buffer.last_error(), Some(err));
    }

    #[test]
    fn test_try_read_retries_until_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("restored");
        std::fs::write(&path, "granted\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        if File::open(&path).is_ok() {
            return;
        }

        let restore = path.clone();
        let restorer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            std::fs::set_permissions(&restore, std::fs::Permissions::from_mode(0o644)).unwrap();
        });

        let buffer = Buffer::new();
        let result = buffer.try_read(&path, Duration::from_secs(2));
        restorer.join().unwrap();

        assert_eq!(result, Ok(()));
        assert_eq!(buffer.text(), "granted\n");
        assert_eq!(buffer.last_error(), None);
    }
}
