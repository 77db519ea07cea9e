//! Processor subsystem monitor.
//!
//! Topology (logical cores, packages, caches) is discovered once when the
//! monitor is created. A refresh re-reads cpufreq, thermal zones, RAPL power
//! domains and `/proc/stat`. Mutations write kernel control files and update
//! the published snapshot only after the write succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use super::worker::MonitorLoop;
use super::{MonitorConfig, section_failed};
use crate::collector::procfs::{CpuInfoRecord, parser};
use crate::collector::{CollectError, FileSystem, PatternMatcher};
use crate::model::{
    Architecture, CacheInfo, CacheType, CoreInfo, CpuStats, Governor, PackageInfo,
    ProcessorSnapshot, ThermalState, Vendor,
};

/// cpufreq reports kHz.
const KHZ: u64 = 1000;

/// Energy counter sample used to derive power between refreshes.
#[derive(Debug, Clone, Copy)]
struct EnergySample {
    energy_uj: u64,
    at: Instant,
}

/// State only touched while holding the refresh lock.
#[derive(Debug, Default)]
struct RefreshState {
    energy: HashMap<u32, EnergySample>,
}

struct Inner<F> {
    fs: F,
    config: MonitorConfig,
    matcher: Arc<PatternMatcher>,
    snapshot: RwLock<Arc<ProcessorSnapshot>>,
    refresh_lock: Mutex<RefreshState>,
}

/// Monitor for per-core and per-package processor state.
pub struct ProcessorMonitor<F: FileSystem + 'static> {
    inner: Arc<Inner<F>>,
    worker: MonitorLoop,
}

impl<F: FileSystem + 'static> ProcessorMonitor<F> {
    /// Discovers the topology and performs the first refresh.
    pub fn new(fs: F, config: MonitorConfig) -> Self {
        Self::with_matcher(fs, config, PatternMatcher::shared())
    }

    /// Like [`new`](Self::new) with a private pattern matcher.
    pub fn with_matcher(fs: F, config: MonitorConfig, matcher: Arc<PatternMatcher>) -> Self {
        let mut inner = Inner {
            fs,
            config,
            matcher,
            snapshot: RwLock::new(Arc::new(ProcessorSnapshot::default())),
            refresh_lock: Mutex::new(RefreshState::default()),
        };
        let topology = inner.discover();
        inner.snapshot = RwLock::new(Arc::new(topology));

        let inner = Arc::new(inner);
        inner.refresh();
        Self {
            inner,
            worker: MonitorLoop::new("processor"),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Returns the most recent snapshot without refreshing.
    pub fn snapshot(&self) -> Arc<ProcessorSnapshot> {
        self.inner.snapshot()
    }

    /// Re-reads the dynamic fields and publishes the new snapshot.
    pub fn refresh(&self) -> Arc<ProcessorSnapshot> {
        self.inner.refresh()
    }

    /// Refreshes on a one-shot background thread.
    pub fn snapshot_async(&self) -> JoinHandle<Arc<ProcessorSnapshot>> {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.refresh())
    }

    /// Starts refreshing every `interval`, handing each new snapshot to
    /// `callback`. A no-op returning `false` while a loop is already active.
    pub fn start_continuous_monitoring<C>(&self, mut callback: C, interval: Duration) -> bool
    where
        C: FnMut(Arc<ProcessorSnapshot>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.worker
            .start(interval, move || callback(inner.refresh()))
    }

    /// [`start_continuous_monitoring`](Self::start_continuous_monitoring)
    /// with the configured interval.
    pub fn start_monitoring<C>(&self, callback: C) -> bool
    where
        C: FnMut(Arc<ProcessorSnapshot>) + Send + 'static,
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

    // Topology and state accessors. All read the current snapshot.

    /// System-wide tick counters and utilization.
    pub fn stats(&self) -> CpuStats {
        self.snapshot().stats.clone()
    }

    pub fn all_cores(&self) -> Vec<CoreInfo> {
        self.snapshot().cores.clone()
    }

    pub fn core(&self, id: u32) -> Option<CoreInfo> {
        self.snapshot().core(id).cloned()
    }

    pub fn all_packages(&self) -> Vec<PackageInfo> {
        self.snapshot().packages.clone()
    }

    pub fn package(&self, id: u32) -> Option<PackageInfo> {
        self.snapshot().package(id).cloned()
    }

    /// Caches visible to `core`, empty for an unknown core.
    pub fn cache_info(&self, core: u32) -> BTreeMap<CacheType, CacheInfo> {
        self.snapshot()
            .core(core)
            .map(|c| c.caches.clone())
            .unwrap_or_default()
    }

    pub fn cache(&self, core: u32, cache: CacheType) -> Option<CacheInfo> {
        self.snapshot().core(core)?.caches.get(&cache).cloned()
    }

    pub fn model_name(&self) -> String {
        let snapshot = self.snapshot();
        snapshot
            .packages
            .first()
            .map(|p| p.model_name.clone())
            .unwrap_or_default()
    }

    pub fn vendor(&self) -> Vendor {
        self.snapshot()
            .packages
            .first()
            .map(|p| p.vendor)
            .unwrap_or_default()
    }

    pub fn architecture(&self) -> Architecture {
        self.snapshot()
            .packages
            .first()
            .map(|p| p.architecture)
            .unwrap_or_else(Architecture::current)
    }

    /// Physical cores over all packages.
    pub fn num_cores(&self) -> u32 {
        self.snapshot().packages.iter().map(|p| p.cores).sum()
    }

    /// Logical CPUs.
    pub fn num_threads(&self) -> u32 {
        self.snapshot().cores.len() as u32
    }

    pub fn num_packages(&self) -> u32 {
        self.snapshot().packages.len() as u32
    }

    /// Core id to temperature (degrees Celsius), for cores with a sensor.
    pub fn temperatures(&self) -> BTreeMap<u32, f64> {
        self.snapshot()
            .cores
            .iter()
            .filter_map(|c| c.temperature.map(|t| (c.id, t)))
            .collect()
    }

    /// Worst package state; `Unknown` when no package has a sensor.
    pub fn thermal_state(&self) -> ThermalState {
        self.snapshot()
            .packages
            .iter()
            .map(|p| p.thermal_state)
            .filter(|s| *s != ThermalState::Unknown)
            .max()
            .unwrap_or(ThermalState::Unknown)
    }

    /// Scaling frequencies (Hz) of the first core that reports any.
    pub fn available_frequencies(&self) -> Vec<u64> {
        self.snapshot()
            .cores
            .iter()
            .find(|c| !c.available_frequencies.is_empty())
            .map(|c| c.available_frequencies.clone())
            .unwrap_or_default()
    }

    /// Power draw over all packages since the previous refresh (watts).
    pub fn power_consumption(&self) -> f64 {
        self.snapshot().packages.iter().map(|p| p.power_watts).sum()
    }

    /// Sum of package power limits (watts).
    pub fn power_limit(&self) -> f64 {
        self.snapshot()
            .packages
            .iter()
            .filter_map(|p| p.power_limit_watts)
            .sum()
    }

    // Mutations. Each returns `false` when the control file is missing or the
    // kernel rejects the write; the snapshot is then left untouched.

    /// Brings a core online or takes it offline via `cpuN/online`.
    pub fn set_core_online(&self, id: u32, online: bool) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock_refresh();
        if inner.snapshot().core(id).is_none() {
            warn!(core = id, "set_core_online: unknown core");
            return false;
        }

        let path = inner.cpu_path(id, "online");
        if !inner.write_control(&path, if online { "1" } else { "0" }) {
            return false;
        }
        inner.update(|snapshot| {
            if let Some(core) = snapshot.core_mut(id) {
                core.online = online;
            }
        });
        true
    }

    pub fn set_core_governor(&self, id: u32, governor: Governor) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock_refresh();
        let Some(name) = governor.as_str() else {
            warn!(core = id, "set_core_governor: unknown governor");
            return false;
        };
        if inner.snapshot().core(id).is_none() {
            warn!(core = id, "set_core_governor: unknown core");
            return false;
        }

        let path = inner.cpu_path(id, "cpufreq/scaling_governor");
        if !inner.write_control(&path, name) {
            return false;
        }
        inner.update(|snapshot| {
            if let Some(core) = snapshot.core_mut(id) {
                core.governor = governor;
            }
        });
        true
    }

    /// Sets the frequency (Hz) of a core running the `userspace` governor.
    pub fn set_frequency(&self, id: u32, hz: u64) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock_refresh();
        match inner.snapshot().core(id) {
            Some(core) if core.governor == Governor::Userspace => {}
            Some(core) => {
                warn!(core = id, governor = ?core.governor, "set_frequency requires the userspace governor");
                return false;
            }
            None => {
                warn!(core = id, "set_frequency: unknown core");
                return false;
            }
        }

        let path = inner.cpu_path(id, "cpufreq/scaling_setspeed");
        if !inner.write_control(&path, &(hz / KHZ).to_string()) {
            return false;
        }
        inner.update(|snapshot| {
            if let Some(core) = snapshot.core_mut(id) {
                core.current_frequency = hz;
            }
        });
        true
    }

    /// Sets the scaling limits (Hz) of a core.
    ///
    /// The bound that keeps `min <= max` valid at every step is written
    /// first. If the second write fails the first one is reverted.
    pub fn set_frequency_range(&self, id: u32, min_hz: u64, max_hz: u64) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock_refresh();
        if min_hz > max_hz {
            warn!(core = id, min_hz, max_hz, "set_frequency_range: min above max");
            return false;
        }
        let Some(core) = inner.snapshot().core(id).cloned() else {
            warn!(core = id, "set_frequency_range: unknown core");
            return false;
        };

        let min_path = inner.cpu_path(id, "cpufreq/scaling_min_freq");
        let max_path = inner.cpu_path(id, "cpufreq/scaling_max_freq");
        let raising = min_hz > core.max_frequency;
        let (first, second) = if raising {
            ((&max_path, max_hz, core.max_frequency), (&min_path, min_hz))
        } else {
            ((&min_path, min_hz, core.min_frequency), (&max_path, max_hz))
        };

        if !inner.write_control(first.0, &(first.1 / KHZ).to_string()) {
            return false;
        }
        if !inner.write_control(second.0, &(second.1 / KHZ).to_string()) {
            if !inner.write_control(first.0, &(first.2 / KHZ).to_string()) {
                warn!(core = id, path = %first.0.display(), "could not revert frequency limit");
            }
            return false;
        }

        inner.update(|snapshot| {
            if let Some(core) = snapshot.core_mut(id) {
                core.min_frequency = min_hz;
                core.max_frequency = max_hz;
            }
        });
        true
    }

    /// Writes the first trip point of every per-core thermal zone.
    /// Succeeds if at least one zone accepted the limit.
    pub fn set_thermal_limit(&self, celsius: f64) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock_refresh();
        if !celsius.is_finite() {
            warn!(celsius, "set_thermal_limit: invalid temperature");
            return false;
        }

        let millidegrees = (celsius * 1000.0).round() as i64;
        let mut accepted = Vec::new();
        for core in &inner.snapshot().cores {
            let path = inner.thermal_path(core.id, "trip_point_0_temp");
            if !inner.fs.exists(&path) {
                continue;
            }
            if inner.write_control(&path, &millidegrees.to_string()) {
                accepted.push(core.id);
            }
        }
        if accepted.is_empty() {
            return false;
        }

        inner.update(|snapshot| {
            for id in &accepted {
                if let Some(core) = snapshot.core_mut(*id) {
                    core.thermal_limit = Some(celsius);
                }
            }
        });
        true
    }

    /// Writes the long-term RAPL limit of every package.
    /// Succeeds if at least one package accepted the limit.
    pub fn set_power_limit(&self, watts: f64) -> bool {
        let inner = &self.inner;
        let _guard = inner.lock_refresh();
        if !watts.is_finite() || watts <= 0.0 {
            warn!(watts, "set_power_limit: invalid limit");
            return false;
        }

        let microwatts = (watts * 1_000_000.0).round() as u64;
        let mut accepted = Vec::new();
        for package in &inner.snapshot().packages {
            let path = inner.rapl_path(package.id, "constraint_0_power_limit_uw");
            if !inner.fs.exists(&path) {
                continue;
            }
            if inner.write_control(&path, &microwatts.to_string()) {
                accepted.push(package.id);
            }
        }
        if accepted.is_empty() {
            return false;
        }

        inner.update(|snapshot| {
            for package in snapshot.packages.iter_mut() {
                if accepted.contains(&package.id) {
                    package.power_limit_watts = Some(watts);
                }
            }
        });
        true
    }
}

impl<F: FileSystem> Inner<F> {
    fn snapshot(&self) -> Arc<ProcessorSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish(&self, snapshot: ProcessorSnapshot) -> Arc<ProcessorSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        snapshot
    }

    /// Applies `change` to a copy of the snapshot and publishes it. Callers
    /// hold the refresh lock.
    fn update(&self, change: impl FnOnce(&mut ProcessorSnapshot)) {
        let mut next = (*self.snapshot()).clone();
        change(&mut next);
        self.publish(next);
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cpu_path(&self, cpu: u32, relative: &str) -> PathBuf {
        self.config
            .sys(&format!("devices/system/cpu/cpu{}/{}", cpu, relative))
    }

    fn thermal_path(&self, cpu: u32, relative: &str) -> PathBuf {
        self.config
            .sys(&format!("class/thermal/thermal_zone{}/{}", cpu, relative))
    }

    fn rapl_path(&self, package: u32, relative: &str) -> PathBuf {
        self.config
            .sys(&format!("class/powercap/intel-rapl:{}/{}", package, relative))
    }

    fn write_control(&self, path: &Path, value: &str) -> bool {
        match self.fs.write(path, value) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), value, error = %e, "control write rejected");
                false
            }
        }
    }

    fn read_u64(&self, path: &Path) -> Result<u64, CollectError> {
        parser::parse_u64(&self.fs.read_to_string(path)?)
    }

    /// Builds the static part of the snapshot from `/proc/cpuinfo` and the
    /// per-cpu sysfs directories.
    fn discover(&self) -> ProcessorSnapshot {
        let cpuinfo = self.config.proc("cpuinfo");
        let records = match self
            .fs
            .read_to_string(&cpuinfo)
            .and_then(|content| parser::parse_cpuinfo(&self.matcher, &content))
        {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %cpuinfo.display(), error = %e, "cannot discover processor topology");
                Vec::new()
            }
        };

        let mut cores: Vec<CoreInfo> = records
            .iter()
            .map(|record| CoreInfo {
                id: record.processor,
                online: self.read_online(record.processor),
                package_id: record.physical_id.unwrap_or(0),
                core_id: record.core_id.unwrap_or(record.processor),
                model_name: record.model_name.clone(),
                caches: self.read_caches(record.processor),
                ..Default::default()
            })
            .collect();
        cores.sort_by_key(|c| c.id);

        let packages = build_packages(&records, &cores);
        debug!(
            cores = cores.len(),
            packages = packages.len(),
            "processor topology discovered"
        );

        ProcessorSnapshot {
            cores,
            packages,
            ..Default::default()
        }
    }

    /// A missing `online` file means the core cannot be hot-unplugged.
    fn read_online(&self, cpu: u32) -> bool {
        let path = self.cpu_path(cpu, "online");
        match self.read_u64(&path) {
            Ok(value) => value != 0,
            Err(e) => {
                if !e.is_absent() {
                    section_failed("online", &path, &e);
                }
                true
            }
        }
    }

    fn read_caches(&self, cpu: u32) -> BTreeMap<CacheType, CacheInfo> {
        let dir = self.cpu_path(cpu, "cache");
        let entries = match self.fs.read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                section_failed("cache", &dir, &e);
                return BTreeMap::new();
            }
        };

        let mut caches = BTreeMap::new();
        for index in entries {
            let is_index = index
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("index"));
            if !is_index {
                continue;
            }
            match self.read_cache_index(&index) {
                Ok(Some((kind, info))) => {
                    caches.insert(kind, info);
                }
                Ok(None) => {}
                Err(e) => section_failed("cache", &index, &e),
            }
        }
        caches
    }

    fn read_cache_index(&self, dir: &Path) -> Result<Option<(CacheType, CacheInfo)>, CollectError> {
        let level = self.read_u64(&dir.join("level"))?;
        let kind = self.fs.read_to_string(&dir.join("type"))?;
        let Some(cache_type) = u8::try_from(level)
            .ok()
            .and_then(|level| CacheType::classify(level, &kind))
        else {
            return Ok(None);
        };

        let optional = |name: &str| -> u32 {
            self.read_u64(&dir.join(name))
                .ok()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };
        let size = match self.fs.read_to_string(&dir.join("size")) {
            Ok(content) => parser::parse_cache_size(&content)?,
            Err(_) => 0,
        };
        let shared_with = match self.fs.read_to_string(&dir.join("shared_cpu_list")) {
            Ok(content) => parser::parse_cpu_list(&content)?,
            Err(_) => Vec::new(),
        };

        Ok(Some((
            cache_type,
            CacheInfo {
                size,
                line_size: optional("coherency_line_size"),
                associativity: optional("ways_of_associativity"),
                sets: optional("number_of_sets"),
                shared: shared_with.len() > 1,
                shared_with,
            },
        )))
    }

    fn refresh(&self) -> Arc<ProcessorSnapshot> {
        let mut state = self.lock_refresh();
        let mut next = (*self.snapshot()).clone();

        for core in next.cores.iter_mut() {
            self.refresh_frequency(core);
            self.refresh_thermal(core);
        }

        let stat = self.config.proc("stat");
        match self
            .fs
            .read_to_string(&stat)
            .and_then(|content| parser::parse_stat_cpus(&self.matcher, &content))
        {
            Ok(parsed) => {
                let per_cpu: HashMap<u32, f64> = parsed
                    .per_cpu
                    .iter()
                    .map(|(id, times)| (*id, times.utilization()))
                    .collect();
                for core in next.cores.iter_mut() {
                    // Offline cores have no line in /proc/stat.
                    core.utilization = per_cpu.get(&core.id).copied().unwrap_or(0.0);
                }
                next.stats = CpuStats {
                    times: parsed.total,
                    utilization: parsed.total.utilization(),
                    per_core: parsed.per_cpu.iter().map(|(_, t)| t.utilization()).collect(),
                };
            }
            Err(e) => section_failed("stat", &stat, &e),
        }

        let now = Instant::now();
        let cores = next.cores.clone();
        for package in next.packages.iter_mut() {
            let members = cores.iter().filter(|c| c.package_id == package.id);
            package.temperature = members
                .filter_map(|c| c.temperature)
                .fold(None, |max: Option<f64>, t| Some(max.map_or(t, |m| m.max(t))));
            package.thermal_state = ThermalState::from_celsius(package.temperature);
            self.refresh_power(package, &mut state, now);
        }

        next.updated_at = Some(Utc::now());
        self.publish(next)
    }

    fn refresh_frequency(&self, core: &mut CoreInfo) {
        let dir = self.cpu_path(core.id, "cpufreq");
        if !self.fs.exists(&dir) {
            core.current_frequency = 0;
            core.min_frequency = 0;
            core.max_frequency = 0;
            core.available_frequencies.clear();
            core.governor = Governor::Unknown;
            return;
        }

        let fields = [
            ("scaling_cur_freq", &mut core.current_frequency),
            ("scaling_min_freq", &mut core.min_frequency),
            ("scaling_max_freq", &mut core.max_frequency),
        ];
        for (name, field) in fields {
            let path = dir.join(name);
            match self.read_u64(&path) {
                Ok(khz) => *field = khz * KHZ,
                Err(e) => section_failed("cpufreq", &path, &e),
            }
        }

        let available = dir.join("scaling_available_frequencies");
        match self
            .fs
            .read_to_string(&available)
            .and_then(|content| parser::parse_u64_list(&content))
        {
            Ok(list) => core.available_frequencies = list.into_iter().map(|khz| khz * KHZ).collect(),
            // Not every driver exposes the list.
            Err(e) => debug!(path = %available.display(), error = %e, "no available frequencies"),
        }

        let governor = dir.join("scaling_governor");
        match self.fs.read_to_string(&governor) {
            Ok(name) => core.governor = Governor::from_name(&name),
            Err(e) => section_failed("cpufreq", &governor, &e),
        }
    }

    fn refresh_thermal(&self, core: &mut CoreInfo) {
        let temp = self.thermal_path(core.id, "temp");
        match self
            .fs
            .read_to_string(&temp)
            .and_then(|content| parser::parse_i64(&content))
        {
            Ok(millidegrees) => core.temperature = Some(millidegrees as f64 / 1000.0),
            Err(e) if e.is_absent() => core.temperature = None,
            Err(e) => section_failed("thermal", &temp, &e),
        }
        core.thermal_state = ThermalState::from_celsius(core.temperature);

        let trip = self.thermal_path(core.id, "trip_point_0_temp");
        match self
            .fs
            .read_to_string(&trip)
            .and_then(|content| parser::parse_i64(&content))
        {
            Ok(millidegrees) => core.thermal_limit = Some(millidegrees as f64 / 1000.0),
            Err(e) if e.is_absent() => core.thermal_limit = None,
            Err(e) => section_failed("thermal", &trip, &e),
        }
    }

    fn refresh_power(&self, package: &mut PackageInfo, state: &mut RefreshState, now: Instant) {
        let energy = self.rapl_path(package.id, "energy_uj");
        match self.read_u64(&energy) {
            Ok(energy_uj) => {
                let sample = EnergySample { energy_uj, at: now };
                package.power_watts = match state.energy.insert(package.id, sample) {
                    Some(previous) => average_power(previous, sample),
                    None => 0.0,
                };
                package.energy_uj = Some(energy_uj);
            }
            Err(e) => {
                if e.is_absent() {
                    package.energy_uj = None;
                    package.power_watts = 0.0;
                }
                section_failed("power", &energy, &e);
            }
        }

        let limit = self.rapl_path(package.id, "constraint_0_power_limit_uw");
        match self.read_u64(&limit) {
            Ok(microwatts) => package.power_limit_watts = Some(microwatts as f64 / 1_000_000.0),
            Err(e) if e.is_absent() => package.power_limit_watts = None,
            Err(e) => section_failed("power", &limit, &e),
        }
    }
}

/// Watts between two energy samples. A counter wrap yields 0 for one interval.
fn average_power(previous: EnergySample, current: EnergySample) -> f64 {
    let elapsed = current.at.duration_since(previous.at).as_secs_f64();
    if elapsed <= 0.0 || current.energy_uj < previous.energy_uj {
        return 0.0;
    }
    (current.energy_uj - previous.energy_uj) as f64 / 1_000_000.0 / elapsed
}

/// Groups cores by package. Physical cores are the distinct core ids, falling
/// back to `cpu cores` and then to the thread count.
fn build_packages(records: &[CpuInfoRecord], cores: &[CoreInfo]) -> Vec<PackageInfo> {
    let architecture = Architecture::current();
    let mut packages: BTreeMap<u32, PackageInfo> = BTreeMap::new();
    let mut core_ids: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    let mut has_core_id: BTreeMap<u32, bool> = BTreeMap::new();
    let mut cpu_cores: BTreeMap<u32, u32> = BTreeMap::new();

    for (record, core) in records_by_core(records, cores) {
        let package = packages.entry(core.package_id).or_insert_with(|| PackageInfo {
            id: core.package_id,
            vendor: Vendor::from_vendor_id(&record.vendor_id),
            architecture,
            model_name: record.model_name.clone(),
            ..Default::default()
        });
        package.core_ids.push(core.id);
        package.threads += 1;

        core_ids.entry(core.package_id).or_default().insert(core.core_id);
        *has_core_id.entry(core.package_id).or_insert(true) &= record.core_id.is_some();
        if let Some(n) = record.cpu_cores {
            cpu_cores.entry(core.package_id).or_insert(n);
        }
    }

    for (id, package) in packages.iter_mut() {
        let physical = if has_core_id.get(id).copied().unwrap_or(false) {
            core_ids.get(id).map(|ids| ids.len() as u32).unwrap_or(0)
        } else {
            cpu_cores.get(id).copied().unwrap_or(package.threads)
        };
        package.cores = physical.clamp(1, package.threads.max(1));
    }

    packages.into_values().collect()
}

fn records_by_core<'a>(
    records: &'a [CpuInfoRecord],
    cores: &'a [CoreInfo],
) -> impl Iterator<Item = (&'a CpuInfoRecord, &'a CoreInfo)> {
    cores.iter().filter_map(move |core| {
        records
            .iter()
            .find(|r| r.processor == core.id)
            .map(|record| (record, core))
    })
}
