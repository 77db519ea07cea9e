//! Snapshot types published by the monitors.
//!
//! All types derive `Serialize`/`Deserialize` so callers can ship snapshots
//! to their own storage or transport.

mod memory;
mod processor;

pub use memory::{HugePages, MemoryDetail, MemoryStats, NumaNodeStats, ZoneStats};
pub use processor::{
    Architecture, CacheInfo, CacheType, CoreInfo, CpuStats, CpuTimes, Governor, PackageInfo,
    ProcessorSnapshot, ThermalState, Vendor,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_processor_snapshot_serializes_to_json() {
        let core = CoreInfo {
            id: 0,
            online: true,
            governor: Governor::Schedutil,
            caches: BTreeMap::from([(
                CacheType::L1Data,
                CacheInfo {
                    size: 32 * 1024,
                    shared_with: vec![0, 1],
                    shared: true,
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        let snapshot = ProcessorSnapshot {
            cores: vec![core],
            ..Default::default()
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"L1Data\""));
        assert!(json.contains("\"Schedutil\""));

        let back: ProcessorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_memory_snapshot_json_keys() {
        let mut stats = MemoryStats::default();
        stats.numa_nodes.insert(
            1,
            NumaNodeStats {
                id: 1,
                total: 4096,
                free: 1024,
                used: 3072,
                distances: vec![21, 10],
            },
        );
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["numa_nodes"]["1"]["used"], 3072);
        assert!(json["updated_at"].is_null());
    }
}
