//! In-memory mock filesystem for testing monitors without real `/proc` and `/sys`.
//!
//! `MockFs` simulates a filesystem in memory. Clones share the same tree, so a
//! test can keep a handle and inspect what a monitor wrote to a control file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::collector::error::CollectError;
use crate::collector::traits::FileSystem;

#[derive(Debug, Default)]
struct Tree {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Paths whose reads fail with `PermissionDenied`.
    unreadable: HashSet<PathBuf>,
    /// Paths whose writes fail with `PermissionDenied`.
    read_only: HashSet<PathBuf>,
}

impl Tree {
    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    tree: Arc<RwLock<Tree>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.tree_mut();
        tree.add_parents(&path);
        tree.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut tree = self.tree_mut();
        tree.add_parents(&path);
        tree.directories.insert(path);
    }

    /// Removes a file, simulating an interface that disappeared.
    pub fn remove_file(&mut self, path: impl AsRef<Path>) {
        self.tree_mut().files.remove(path.as_ref());
    }

    /// Makes reads of `path` fail with `PermissionDenied`.
    pub fn deny_read(&mut self, path: impl AsRef<Path>) {
        self.tree_mut()
            .unreadable
            .insert(path.as_ref().to_path_buf());
    }

    /// Makes writes to `path` fail with `PermissionDenied`.
    pub fn set_read_only(&mut self, path: impl AsRef<Path>) {
        self.tree_mut()
            .read_only
            .insert(path.as_ref().to_path_buf());
    }

    /// Returns the current contents of a file, if present.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.tree().files.get(path.as_ref()).cloned()
    }

    fn tree(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tree_mut(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> Result<String, CollectError> {
        let tree = self.tree();
        if tree.unreadable.contains(path) {
            return Err(CollectError::PermissionDenied(path.to_path_buf()));
        }
        tree.files
            .get(path)
            .cloned()
            .ok_or_else(|| CollectError::NotFound(path.to_path_buf()))
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree();
        tree.files.contains_key(path) || tree.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CollectError> {
        let tree = self.tree();
        if !tree.directories.contains(path) {
            return Err(CollectError::NotFound(path.to_path_buf()));
        }

        let mut entries = HashSet::new();

        // Find all files and directories that are direct children
        for file_path in tree.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }

        for dir_path in &tree.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }

        let mut entries: Vec<PathBuf> = entries.into_iter().collect();
        entries.sort();
        Ok(entries)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), CollectError> {
        let mut tree = self.tree_mut();
        if tree.read_only.contains(path) {
            return Err(CollectError::PermissionDenied(path.to_path_buf()));
        }
        match tree.files.get_mut(path) {
            Some(existing) => {
                *existing = contents.to_string();
                Ok(())
            }
            None => Err(CollectError::NotFound(path.to_path_buf())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_add_file() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/meminfo", "MemTotal: 16384 kB\n");

        assert!(fs.exists(Path::new("/proc/meminfo")));
        assert!(fs.exists(Path::new("/proc")));

        let content = fs.read_to_string(Path::new("/proc/meminfo")).unwrap();
        assert_eq!(content, "MemTotal: 16384 kB\n");
    }

    #[test]
    fn test_mock_fs_read_dir() {
        let mut fs = MockFs::new();
        fs.add_file("/sys/devices/system/node/node0/meminfo", "a");
        fs.add_file("/sys/devices/system/node/node0/distance", "10");
        fs.add_file("/sys/devices/system/node/node1/meminfo", "b");
        fs.add_file("/sys/devices/system/node/possible", "0-1");

        let nodes = fs.read_dir(Path::new("/sys/devices/system/node")).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], PathBuf::from("/sys/devices/system/node/node0"));

        let node0 = fs
            .read_dir(Path::new("/sys/devices/system/node/node0"))
            .unwrap();
        assert_eq!(node0.len(), 2);
    }

    #[test]
    fn test_mock_fs_not_found() {
        let fs = MockFs::new();
        let result = fs.read_to_string(Path::new("/nonexistent"));
        assert!(matches!(result, Err(CollectError::NotFound(_))));
        assert!(matches!(
            fs.read_dir(Path::new("/nonexistent")),
            Err(CollectError::NotFound(_))
        ));
    }

    #[test]
    fn test_mock_fs_write_is_shared_between_clones() {
        let mut fs = MockFs::new();
        fs.add_file("/sys/devices/system/cpu/cpu1/online", "1\n");

        let handle = fs.clone();
        fs.write(Path::new("/sys/devices/system/cpu/cpu1/online"), "0")
            .unwrap();
        assert_eq!(
            handle.file("/sys/devices/system/cpu/cpu1/online").as_deref(),
            Some("0")
        );
    }

    #[test]
    fn test_mock_fs_write_failures() {
        let mut fs = MockFs::new();
        fs.add_file("/sys/class/thermal/thermal_zone0/trip_point_0_temp", "90000");
        fs.set_read_only("/sys/class/thermal/thermal_zone0/trip_point_0_temp");

        assert!(matches!(
            fs.write(
                Path::new("/sys/class/thermal/thermal_zone0/trip_point_0_temp"),
                "80000"
            ),
            Err(CollectError::PermissionDenied(_))
        ));
        assert!(matches!(
            fs.write(Path::new("/sys/missing"), "1"),
            Err(CollectError::NotFound(_))
        ));
    }

    #[test]
    fn test_mock_fs_deny_read() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/zoneinfo", "Node 0, zone Normal\n");
        fs.deny_read("/proc/zoneinfo");
        assert!(matches!(
            fs.read_to_string(Path::new("/proc/zoneinfo")),
            Err(CollectError::PermissionDenied(_))
        ));
    }
}
