//! Processor subsystem snapshot.
//!
//! Topology (cores, packages, caches) is discovered once; frequency, governor,
//! temperature, power and utilization are overwritten on every refresh.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// CPU vendor, classified from the `vendor_id` string.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum Vendor {
    Intel,
    Amd,
    Arm,
    Ibm,
    #[default]
    Unknown,
}

impl Vendor {
    /// Substring classification. `GenuineIntel` is Intel, `AuthenticAMD` is AMD.
    pub fn from_vendor_id(id: &str) -> Self {
        if id.contains("Intel") {
            Vendor::Intel
        } else if id.contains("AMD") {
            Vendor::Amd
        } else if id.contains("ARM") {
            Vendor::Arm
        } else if id.contains("IBM") {
            Vendor::Ibm
        } else {
            Vendor::Unknown
        }
    }
}

/// Instruction set architecture of the running kernel.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum Architecture {
    X86_64,
    Arm64,
    Arm,
    Ppc64,
    S390x,
    RiscV64,
    #[default]
    Unknown,
}

impl Architecture {
    /// Architecture this crate was compiled for.
    pub fn current() -> Self {
        Self::from_arch(std::env::consts::ARCH)
    }

    pub fn from_arch(arch: &str) -> Self {
        match arch {
            "x86_64" => Architecture::X86_64,
            "aarch64" => Architecture::Arm64,
            "arm" => Architecture::Arm,
            "powerpc64" => Architecture::Ppc64,
            "s390x" => Architecture::S390x,
            "riscv64" => Architecture::RiscV64,
            _ => Architecture::Unknown,
        }
    }
}

/// cpufreq scaling governor.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum Governor {
    Performance,
    Powersave,
    /// Manual governor; the only one that accepts `scaling_setspeed` writes.
    Userspace,
    Ondemand,
    Conservative,
    Schedutil,
    #[default]
    Unknown,
}

impl Governor {
    /// Name as written to `scaling_governor`, `None` for [`Governor::Unknown`].
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Governor::Performance => Some("performance"),
            Governor::Powersave => Some("powersave"),
            Governor::Userspace => Some("userspace"),
            Governor::Ondemand => Some("ondemand"),
            Governor::Conservative => Some("conservative"),
            Governor::Schedutil => Some("schedutil"),
            Governor::Unknown => None,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "performance" => Governor::Performance,
            "powersave" => Governor::Powersave,
            "userspace" => Governor::Userspace,
            "ondemand" => Governor::Ondemand,
            "conservative" => Governor::Conservative,
            "schedutil" => Governor::Schedutil,
            _ => Governor::Unknown,
        }
    }
}

/// Thermal state derived from a temperature reading.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThermalState {
    Normal,
    Warning,
    Critical,
    Emergency,
    /// No sensor reading.
    #[default]
    Unknown,
}

impl ThermalState {
    pub fn from_celsius(celsius: Option<f64>) -> Self {
        match celsius {
            None => ThermalState::Unknown,
            Some(t) if t < 70.0 => ThermalState::Normal,
            Some(t) if t < 85.0 => ThermalState::Warning,
            Some(t) if t < 95.0 => ThermalState::Critical,
            Some(_) => ThermalState::Emergency,
        }
    }
}

/// Cache level and type.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheType {
    L1Instruction,
    L1Data,
    L2,
    L3,
    L4,
}

impl CacheType {
    /// Classifies a sysfs cache index from its `level` and `type` files.
    pub fn classify(level: u8, kind: &str) -> Option<Self> {
        match (level, kind.trim()) {
            (1, "Instruction") => Some(CacheType::L1Instruction),
            (1, "Data") => Some(CacheType::L1Data),
            (2, _) => Some(CacheType::L2),
            (3, _) => Some(CacheType::L3),
            (4, _) => Some(CacheType::L4),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            CacheType::L1Instruction | CacheType::L1Data => 1,
            CacheType::L2 => 2,
            CacheType::L3 => 3,
            CacheType::L4 => 4,
        }
    }
}

/// One CPU cache as seen by a core.
///
/// Source: `/sys/devices/system/cpu/cpuN/cache/indexM/`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CacheInfo {
    /// Total size (bytes).
    pub size: u64,
    /// Source: `coherency_line_size`
    pub line_size: u32,
    /// Source: `ways_of_associativity`
    pub associativity: u32,
    /// Source: `number_of_sets`
    pub sets: u32,
    /// True when more than one logical core uses this cache.
    pub shared: bool,
    /// Logical core ids sharing this cache, from `shared_cpu_list`.
    pub shared_with: Vec<u32>,
}

/// One logical core.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CoreInfo {
    /// Logical CPU id (`processor` in `/proc/cpuinfo`).
    pub id: u32,
    pub online: bool,
    /// Physical package this core belongs to.
    pub package_id: u32,
    /// Physical core id within the package.
    pub core_id: u32,
    pub model_name: String,
    /// Hz. Zero when cpufreq is unavailable.
    pub current_frequency: u64,
    pub min_frequency: u64,
    pub max_frequency: u64,
    /// Hz, from `scaling_available_frequencies`.
    pub available_frequencies: Vec<u64>,
    pub governor: Governor,
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    pub thermal_state: ThermalState,
    /// First trip point of the core's thermal zone (degrees Celsius).
    pub thermal_limit: Option<f64>,
    /// Percent in [0, 100].
    pub utilization: f64,
    pub caches: BTreeMap<CacheType, CacheInfo>,
}

/// One physical package (socket).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct PackageInfo {
    pub id: u32,
    pub vendor: Vendor,
    pub architecture: Architecture,
    pub model_name: String,
    /// Physical cores.
    pub cores: u32,
    /// Logical CPUs; always `>= cores`.
    pub threads: u32,
    pub core_ids: Vec<u32>,
    /// Hottest member core (degrees Celsius).
    pub temperature: Option<f64>,
    pub thermal_state: ThermalState,
    /// Cumulative energy counter (microjoules).
    /// Source: `/sys/class/powercap/intel-rapl:N/energy_uj`
    pub energy_uj: Option<u64>,
    /// Average power draw since the previous refresh (watts).
    pub power_watts: f64,
    /// Long-term power limit (watts).
    /// Source: `/sys/class/powercap/intel-rapl:N/constraint_0_power_limit_uw`
    pub power_limit_watts: Option<f64>,
}

/// Tick counters from one `/proc/stat` cpu line.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

impl CpuTimes {
    /// Ticks counted towards utilization. Guest time is already part of user.
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    /// `100 * (1 - (idle + iowait) / total)`, clamped to [0, 100].
    pub fn utilization(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let busy = 1.0 - self.idle_total() as f64 / total as f64;
        (busy * 100.0).clamp(0.0, 100.0)
    }
}

/// System-wide CPU statistics.
///
/// Source: `/proc/stat`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CpuStats {
    /// Aggregate counters since boot.
    pub times: CpuTimes,
    /// Percent in [0, 100].
    pub utilization: f64,
    /// Per logical CPU, in `/proc/stat` order.
    pub per_core: Vec<f64>,
}

/// Point-in-time processor state.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ProcessorSnapshot {
    /// Sorted by core id.
    pub cores: Vec<CoreInfo>,
    /// Sorted by package id.
    pub packages: Vec<PackageInfo>,
    pub stats: CpuStats,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProcessorSnapshot {
    pub fn core(&self, id: u32) -> Option<&CoreInfo> {
        self.cores.iter().find(|c| c.id == id)
    }

    pub fn core_mut(&mut self, id: u32) -> Option<&mut CoreInfo> {
        self.cores.iter_mut().find(|c| c.id == id)
    }

    pub fn package(&self, id: u32) -> Option<&PackageInfo> {
        self.packages.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_fifteen_percent() {
        let times = CpuTimes {
            user: 100,
            system: 50,
            idle: 850,
            ..Default::default()
        };
        assert_eq!(times.total(), 1000);
        assert_eq!(times.idle_total(), 850);
        assert!((times.utilization() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_utilization_zero_total() {
        assert_eq!(CpuTimes::default().utilization(), 0.0);
    }

    #[test]
    fn test_utilization_counts_iowait_as_idle() {
        let times = CpuTimes {
            user: 50,
            idle: 25,
            iowait: 25,
            ..Default::default()
        };
        assert!((times.utilization() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_vendor_classification() {
        assert_eq!(Vendor::from_vendor_id("GenuineIntel"), Vendor::Intel);
        assert_eq!(Vendor::from_vendor_id("AuthenticAMD"), Vendor::Amd);
        assert_eq!(Vendor::from_vendor_id("ARM"), Vendor::Arm);
        assert_eq!(Vendor::from_vendor_id("IBM/S390"), Vendor::Ibm);
        assert_eq!(Vendor::from_vendor_id("HygonGenuine"), Vendor::Unknown);
    }

    #[test]
    fn test_thermal_state_thresholds() {
        assert_eq!(ThermalState::from_celsius(None), ThermalState::Unknown);
        assert_eq!(ThermalState::from_celsius(Some(45.0)), ThermalState::Normal);
        assert_eq!(ThermalState::from_celsius(Some(70.0)), ThermalState::Warning);
        assert_eq!(ThermalState::from_celsius(Some(84.9)), ThermalState::Warning);
        assert_eq!(ThermalState::from_celsius(Some(90.0)), ThermalState::Critical);
        assert_eq!(ThermalState::from_celsius(Some(95.0)), ThermalState::Emergency);
    }

    #[test]
    fn test_governor_names() {
        for governor in [
            Governor::Performance,
            Governor::Powersave,
            Governor::Userspace,
            Governor::Ondemand,
            Governor::Conservative,
            Governor::Schedutil,
        ] {
            let name = governor.as_str().unwrap();
            assert_eq!(Governor::from_name(name), governor);
        }
        assert_eq!(Governor::from_name("userspace\n"), Governor::Userspace);
        assert_eq!(Governor::from_name("menu"), Governor::Unknown);
        assert_eq!(Governor::Unknown.as_str(), None);
    }

    #[test]
    fn test_cache_classification() {
        assert_eq!(
            CacheType::classify(1, "Instruction\n"),
            Some(CacheType::L1Instruction)
        );
        assert_eq!(CacheType::classify(1, "Data"), Some(CacheType::L1Data));
        assert_eq!(CacheType::classify(3, "Unified"), Some(CacheType::L3));
        assert_eq!(CacheType::classify(1, "Unified"), None);
        assert_eq!(CacheType::L1Data.level(), 1);
    }

    #[test]
    fn test_architecture_from_arch() {
        assert_eq!(Architecture::from_arch("x86_64"), Architecture::X86_64);
        assert_eq!(Architecture::from_arch("aarch64"), Architecture::Arm64);
        assert_eq!(Architecture::from_arch("mips"), Architecture::Unknown);
    }
}
