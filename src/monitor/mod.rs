//! Stateful monitors holding the most recent memory and processor snapshots.
//!
//! Each monitor is explicitly constructed and owned by the caller. Snapshots
//! are published as `Arc`s behind an `RwLock`, so a reader sees either the
//! previous snapshot or the new one in full. Refreshes and mutations on one
//! monitor are serialized by a separate mutex, which keeps readers off the
//! refresh path entirely.
//!
//! # Usage
//!
//! ```
//! use kernstat::collector::MockFs;
//! use kernstat::monitor::{MemoryMonitor, MonitorConfig};
//!
//! let monitor = MemoryMonitor::new(MockFs::typical_system(), MonitorConfig::default());
//! let stats = monitor.refresh();
//! assert_eq!(stats.used, stats.total - stats.free);
//! ```

mod memory;
mod processor;
mod worker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collector::CollectError;

pub use memory::MemoryMonitor;
pub use processor::ProcessorMonitor;

/// Where the monitors look for kernel interfaces and how often the
/// continuous loop refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Mount point of procfs.
    pub proc_path: PathBuf,
    /// Mount point of sysfs.
    pub sys_path: PathBuf,
    /// Interval used by `start_monitoring`.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
            sys_path: PathBuf::from("/sys"),
            interval: Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    pub fn with_proc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_path = path.into();
        self
    }

    pub fn with_sys_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sys_path = path.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub(crate) fn proc(&self, relative: &str) -> PathBuf {
        self.proc_path.join(relative)
    }

    pub(crate) fn sys(&self, relative: &str) -> PathBuf {
        self.sys_path.join(relative)
    }
}

/// Logs a refresh section that failed and will keep its previous values.
pub(crate) fn section_failed(section: &str, path: &Path, err: &CollectError) {
    if err.is_absent() {
        debug!(section, path = %path.display(), error = %err, "interface unavailable");
    } else {
        warn!(section, path = %path.display(), error = %err, "refresh section failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.proc_path, PathBuf::from("/proc"));
        assert_eq!(config.sys_path, PathBuf::from("/sys"));
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.proc("meminfo"), PathBuf::from("/proc/meminfo"));
    }

    #[test]
    fn test_config_builders() {
        let config = MonitorConfig::default()
            .with_proc_path("/host/proc")
            .with_sys_path("/host/sys")
            .with_interval(Duration::from_millis(250));
        assert_eq!(
            config.sys("class/thermal"),
            PathBuf::from("/host/sys/class/thermal")
        );
        assert_eq!(config.proc("stat"), PathBuf::from("/host/proc/stat"));
        assert_eq!(config.interval, Duration::from_millis(250));
    }
}
