//! Memory subsystem monitor.
//!
//! A refresh reads `/proc/meminfo`, `/proc/swaps`, `/proc/zoneinfo`, the
//! NUMA node directories and the huge page pools, in that order. Every
//! section is tolerated on its own: a section that fails keeps the values of
//! the previous snapshot while the others are updated.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::worker::MonitorLoop;
use super::{MonitorConfig, section_failed};
use crate::collector::procfs::parser;
use crate::collector::{CollectError, FileSystem, PatternMatcher};
use crate::model::{HugePages, MemoryStats, NumaNodeStats, ZoneStats};

const KB: u64 = 1024;

struct Inner<F> {
    fs: F,
    config: MonitorConfig,
    matcher: Arc<PatternMatcher>,
    snapshot: RwLock<Arc<MemoryStats>>,
    refresh_lock: Mutex<()>,
}

/// Monitor for memory totals, zones, NUMA nodes and huge pages.
pub struct MemoryMonitor<F: FileSystem + 'static> {
    inner: Arc<Inner<F>>,
    worker: MonitorLoop,
}

impl<F: FileSystem + 'static> MemoryMonitor<F> {
    /// Creates a monitor with an empty snapshot. Nothing is read until the
    /// first [`refresh`](Self::refresh).
    pub fn new(fs: F, config: MonitorConfig) -> Self {
        Self::with_matcher(fs, config, PatternMatcher::shared())
    }

    /// Like [`new`](Self::new) with a private pattern matcher.
    pub fn with_matcher(fs: F, config: MonitorConfig, matcher: Arc<PatternMatcher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                fs,
                config,
                matcher,
                snapshot: RwLock::new(Arc::new(MemoryStats::default())),
                refresh_lock: Mutex::new(()),
            }),
            worker: MonitorLoop::new("memory"),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Returns the most recent snapshot without refreshing.
    pub fn snapshot(&self) -> Arc<MemoryStats> {
        self.inner.snapshot()
    }

    /// Re-reads every section and publishes the new snapshot.
    pub fn refresh(&self) -> Arc<MemoryStats> {
        self.inner.refresh()
    }

    /// Refreshes on a one-shot background thread.
    pub fn snapshot_async(&self) -> JoinHandle<Arc<MemoryStats>> {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.refresh())
    }

    /// Starts refreshing every `interval`, handing each new snapshot to
    /// `callback`. A no-op returning `false` while a loop is already active.
    pub fn start_continuous_monitoring<C>(&self, mut callback: C, interval: Duration) -> bool
    where
        C: FnMut(Arc<MemoryStats>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.worker
            .start(interval, move || callback(inner.refresh()))
    }

    /// [`start_continuous_monitoring`](Self::start_continuous_monitoring)
    /// with the configured interval.
    pub fn start_monitoring<C>(&self, callback: C) -> bool
    where
        C: FnMut(Arc<MemoryStats>) + Send + 'static,
    {
        self.start_continuous_monitoring(callback, self.inner.config.interval)
    }

    /// Stops the loop and waits for it to exit. Safe to call when idle.
    pub fn stop_monitoring(&self) {
        self.worker.stop();
    }

    pub fn is_monitoring(&self) -> bool {
        self.worker.is_running()
    }

    pub fn zone_stats(&self) -> BTreeMap<String, ZoneStats> {
        self.snapshot().zones.clone()
    }

    pub fn zone(&self, name: &str) -> Option<ZoneStats> {
        self.snapshot().zones.get(name).cloned()
    }

    pub fn numa_stats(&self) -> BTreeMap<u32, NumaNodeStats> {
        self.snapshot().numa_nodes.clone()
    }

    pub fn numa_node(&self, id: u32) -> Option<NumaNodeStats> {
        self.snapshot().numa_nodes.get(&id).cloned()
    }

    pub fn huge_pages(&self) -> HugePages {
        self.snapshot().huge_pages.clone()
    }
}

impl<F: FileSystem> Inner<F> {
    fn snapshot(&self) -> Arc<MemoryStats> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn refresh(&self) -> Arc<MemoryStats> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.snapshot()).clone();

        let meminfo = self.config.proc("meminfo");
        if let Err(e) = self.read_meminfo(&meminfo, &mut next) {
            section_failed("meminfo", &meminfo, &e);
        }
        let swaps = self.config.proc("swaps");
        if let Err(e) = self.read_swaps(&swaps, &mut next) {
            section_failed("swaps", &swaps, &e);
        }
        let zoneinfo = self.config.proc("zoneinfo");
        if let Err(e) = self.read_zoneinfo(&zoneinfo, &mut next) {
            section_failed("zoneinfo", &zoneinfo, &e);
        }
        let nodes = self.config.sys("devices/system/node");
        if let Err(e) = self.read_numa(&nodes, &mut next) {
            section_failed("numa", &nodes, &e);
        }
        let hugepages = self.config.sys("kernel/mm/hugepages");
        if let Err(e) = self.read_hugepages(&hugepages, &mut next) {
            section_failed("hugepages", &hugepages, &e);
        }

        next.updated_at = Some(Utc::now());
        let next = Arc::new(next);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
        next
    }

    fn read_meminfo(&self, path: &Path, stats: &mut MemoryStats) -> Result<(), CollectError> {
        let content = self.fs.read_to_string(path)?;
        let values = parser::parse_meminfo(&self.matcher, &content)?;
        if !values.contains_key("MemTotal") {
            return Err(CollectError::Parse("meminfo has no MemTotal".to_string()));
        }
        let kb = |key: &str| values.get(key).copied().unwrap_or(0) * KB;
        let count = |key: &str| values.get(key).copied().unwrap_or(0);

        stats.total = kb("MemTotal");
        stats.free = kb("MemFree");
        stats.used = stats.total.saturating_sub(stats.free);
        stats.available = kb("MemAvailable");
        stats.cached = kb("Cached");
        stats.buffers = kb("Buffers");
        stats.swap_total = kb("SwapTotal");
        stats.swap_free = kb("SwapFree");
        stats.swap_used = stats.swap_total.saturating_sub(stats.swap_free);

        let detail = &mut stats.detail;
        detail.active = kb("Active");
        detail.inactive = kb("Inactive");
        detail.active_anon = kb("Active(anon)");
        detail.inactive_anon = kb("Inactive(anon)");
        detail.active_file = kb("Active(file)");
        detail.inactive_file = kb("Inactive(file)");
        detail.unevictable = kb("Unevictable");
        detail.mlocked = kb("Mlocked");
        detail.anon_pages = kb("AnonPages");
        detail.mapped = kb("Mapped");
        detail.shmem = kb("Shmem");
        detail.slab = kb("Slab");
        detail.dirty = kb("Dirty");
        detail.writeback = kb("Writeback");
        detail.high_total = kb("HighTotal");
        detail.high_free = kb("HighFree");
        detail.low_total = kb("LowTotal");
        detail.low_free = kb("LowFree");
        detail.direct_map_4k = kb("DirectMap4k");
        detail.direct_map_2m = kb("DirectMap2M");
        detail.direct_map_1g = kb("DirectMap1G");

        stats.huge_pages = HugePages {
            total: count("HugePages_Total"),
            free: count("HugePages_Free"),
            reserved: count("HugePages_Rsvd"),
            surplus: count("HugePages_Surp"),
            page_size: kb("Hugepagesize"),
        };
        Ok(())
    }

    fn read_swaps(&self, path: &Path, stats: &mut MemoryStats) -> Result<(), CollectError> {
        let content = self.fs.read_to_string(path)?;
        let totals = parser::parse_swaps(&content)?;
        stats.swap_total = totals.size_kb * KB;
        stats.swap_used = (totals.used_kb * KB).min(stats.swap_total);
        stats.swap_free = stats.swap_total - stats.swap_used;
        Ok(())
    }

    fn read_zoneinfo(&self, path: &Path, stats: &mut MemoryStats) -> Result<(), CollectError> {
        let content = self.fs.read_to_string(path)?;
        stats.zones = parser::parse_zoneinfo(&self.matcher, &content)?;
        Ok(())
    }

    fn read_numa(&self, dir: &Path, stats: &mut MemoryStats) -> Result<(), CollectError> {
        let mut nodes = BTreeMap::new();
        for entry in self.fs.read_dir(dir)? {
            let Some(id) = node_id(&entry) else {
                continue;
            };
            match self.read_node(id, &entry) {
                Ok(node) => {
                    nodes.insert(id, node);
                }
                Err(e) => {
                    section_failed("numa", &entry, &e);
                    if let Some(previous) = stats.numa_nodes.get(&id) {
                        nodes.insert(id, previous.clone());
                    }
                }
            }
        }
        stats.numa_nodes = nodes;
        Ok(())
    }

    fn read_node(&self, id: u32, dir: &Path) -> Result<NumaNodeStats, CollectError> {
        let content = self.fs.read_to_string(&dir.join("meminfo"))?;
        let values = parser::parse_meminfo(&self.matcher, &content)?;
        let total = values.get("MemTotal").copied().unwrap_or(0) * KB;
        let free = values.get("MemFree").copied().unwrap_or(0) * KB;

        let distance_path = dir.join("distance");
        let distances = match self.fs.read_to_string(&distance_path) {
            Ok(content) => parser::parse_node_distance(&content)?,
            Err(e) => {
                section_failed("numa distance", &distance_path, &e);
                Vec::new()
            }
        };

        Ok(NumaNodeStats {
            id,
            total,
            free,
            used: total.saturating_sub(free),
            distances,
        })
    }

    /// Sysfs pool counters override the meminfo `HugePages_*` lines. The pool
    /// matching the default huge page size wins; otherwise the smallest.
    fn read_hugepages(&self, dir: &Path, stats: &mut MemoryStats) -> Result<(), CollectError> {
        let mut pools: HashMap<u64, &Path> = HashMap::new();
        let entries = self.fs.read_dir(dir)?;
        for entry in &entries {
            if let Some(size) = hugepage_size(entry) {
                pools.insert(size, entry.as_path());
            }
        }

        let default_size = stats.huge_pages.page_size;
        let chosen = pools
            .get(&default_size)
            .map(|path| (default_size, *path))
            .or_else(|| pools.iter().min_by_key(|(size, _)| **size).map(|(s, p)| (*s, *p)));
        let Some((page_size, pool)) = chosen else {
            debug!(path = %dir.display(), "no huge page pools");
            return Ok(());
        };

        let read = |name: &str| -> Result<u64, CollectError> {
            let content = self.fs.read_to_string(&pool.join(name))?;
            parser::parse_u64(&content)
        };
        stats.huge_pages = HugePages {
            total: read("nr_hugepages")?,
            free: read("free_hugepages")?,
            reserved: read("resv_hugepages")?,
            surplus: read("surplus_hugepages")?,
            page_size,
        };
        Ok(())
    }
}

/// `node3` -> 3. Other entries (`possible`, `online`, ...) are skipped.
fn node_id(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("node")?
        .parse()
        .ok()
}

/// `hugepages-2048kB` -> page size in bytes.
fn hugepage_size(path: &Path) -> Option<u64> {
    let kb: u64 = path
        .file_name()?
        .to_str()?
        .strip_prefix("hugepages-")?
        .strip_suffix("kB")?
        .parse()
        .ok()?;
    Some(kb * KB)
}
