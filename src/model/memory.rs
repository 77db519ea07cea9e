//! Memory subsystem snapshot.
//!
//! Byte quantities are converted from the kernel's kB at parse time. Zone
//! watermarks and huge-page counts stay in page units.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time memory statistics.
///
/// Source: `/proc/meminfo`, `/proc/swaps`, `/proc/zoneinfo`,
/// `/sys/devices/system/node/node*/`, `/sys/kernel/mm/hugepages/`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct MemoryStats {
    /// Total usable RAM (bytes).
    /// Source: `/proc/meminfo` MemTotal
    pub total: u64,

    /// Completely unused RAM (bytes).
    /// Source: `/proc/meminfo` MemFree
    pub free: u64,

    /// `total - free` (bytes).
    pub used: u64,

    /// Estimate of memory available for new workloads (bytes).
    /// Source: `/proc/meminfo` MemAvailable
    pub available: u64,

    /// Page cache (bytes).
    /// Source: `/proc/meminfo` Cached
    pub cached: u64,

    /// Block device buffers (bytes).
    /// Source: `/proc/meminfo` Buffers
    pub buffers: u64,

    /// Total swap space (bytes).
    /// Source: `/proc/swaps` Size column, or `/proc/meminfo` SwapTotal
    pub swap_total: u64,

    /// Unused swap space (bytes).
    pub swap_free: u64,

    /// `swap_total - swap_free` (bytes).
    pub swap_used: u64,

    /// Detailed accounting from `/proc/meminfo`.
    pub detail: MemoryDetail,

    /// Huge page pool for the default huge page size.
    pub huge_pages: HugePages,

    /// Zone name to zone statistics. Empty when `/proc/zoneinfo` is absent.
    pub zones: BTreeMap<String, ZoneStats>,

    /// NUMA node id to node statistics. Empty on non-NUMA kernels.
    pub numa_nodes: BTreeMap<u32, NumaNodeStats>,

    /// Time of the refresh that produced this snapshot.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fine-grained `/proc/meminfo` accounting, all in bytes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct MemoryDetail {
    pub active: u64,
    pub inactive: u64,
    pub active_anon: u64,
    pub inactive_anon: u64,
    pub active_file: u64,
    pub inactive_file: u64,
    pub unevictable: u64,
    pub mlocked: u64,
    pub anon_pages: u64,
    pub mapped: u64,
    pub shmem: u64,
    pub slab: u64,
    pub dirty: u64,
    pub writeback: u64,
    /// HighTotal, present on 32-bit kernels only.
    pub high_total: u64,
    pub high_free: u64,
    pub low_total: u64,
    pub low_free: u64,
    pub direct_map_4k: u64,
    pub direct_map_2m: u64,
    pub direct_map_1g: u64,
}

/// Huge page pool.
///
/// Source: `/proc/meminfo` HugePages_* and Hugepagesize, overridden by
/// `/sys/kernel/mm/hugepages/hugepages-<size>kB/` when present.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct HugePages {
    /// Pages in the pool.
    pub total: u64,
    /// Pages not yet allocated.
    pub free: u64,
    /// Pages committed but not yet faulted in.
    pub reserved: u64,
    /// Pages above `nr_hugepages` (overcommit).
    pub surplus: u64,
    /// Size of one huge page (bytes).
    pub page_size: u64,
}

/// Per-zone statistics from `/proc/zoneinfo`, in pages.
///
/// A zone name that appears on several NUMA nodes accumulates the counters of
/// all of them; `nodes` lists the contributing node ids.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ZoneStats {
    pub name: String,
    pub nodes: Vec<u32>,
    pub pages_free: u64,
    pub min: u64,
    pub low: u64,
    pub high: u64,
    pub spanned: u64,
    pub present: u64,
    pub managed: u64,
    /// Lowmem reserve against allocations targeting higher zones.
    pub protection: Vec<u64>,
    /// Remaining per-zone counters (`nr_free_pages`, `nr_zone_active_anon`, ...).
    pub counters: BTreeMap<String, u64>,
}

impl ZoneStats {
    /// Adds the values of another node's instance of the same zone.
    pub fn merge(&mut self, other: &ZoneStats) {
        for node in &other.nodes {
            if !self.nodes.contains(node) {
                self.nodes.push(*node);
            }
        }
        self.pages_free += other.pages_free;
        self.min += other.min;
        self.low += other.low;
        self.high += other.high;
        self.spanned += other.spanned;
        self.present += other.present;
        self.managed += other.managed;
        if self.protection.len() < other.protection.len() {
            self.protection.resize(other.protection.len(), 0);
        }
        for (mine, theirs) in self.protection.iter_mut().zip(&other.protection) {
            *mine += theirs;
        }
        for (key, value) in &other.counters {
            *self.counters.entry(key.clone()).or_insert(0) += value;
        }
    }
}

/// Per-node memory totals.
///
/// Source: `/sys/devices/system/node/nodeN/meminfo` and `distance`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct NumaNodeStats {
    pub id: u32,
    /// Bytes.
    pub total: u64,
    /// Bytes.
    pub free: u64,
    /// `total - free` (bytes).
    pub used: u64,
    /// Relative access cost to every node, indexed by node id.
    pub distances: Vec<u32>,
}
