//! Pre-built mock filesystem scenarios for testing.
//!
//! These scenarios provide realistic `/proc` and `/sys` states for testing
//! the monitors under various system conditions.

use super::filesystem::MockFs;

const CPU_SYS: &str = "/sys/devices/system/cpu";

impl MockFs {
    /// Creates a typical two-node machine with one 4-thread Intel package.
    ///
    /// Includes: meminfo, swaps, zoneinfo, two NUMA nodes, a 2 MiB huge page
    /// pool, cpuinfo, per-cpu caches, cpufreq, thermal zones, `/proc/stat`
    /// and a RAPL power domain. cpu1 runs the `userspace` governor.
    pub fn typical_system() -> Self {
        let mut fs = Self::new();

        fs.add_file(
            "/proc/meminfo",
            "\
MemTotal:       16384000 kB
MemFree:         4096000 kB
MemAvailable:    8192000 kB
Buffers:          512000 kB
Cached:          2048000 kB
SwapCached:            0 kB
Active:          4096000 kB
Inactive:        2048000 kB
Active(anon):    3000000 kB
Inactive(anon):   500000 kB
Active(file):    1096000 kB
Inactive(file):  1548000 kB
Unevictable:        1024 kB
Mlocked:            1024 kB
SwapTotal:       4194300 kB
SwapFree:        4193276 kB
Dirty:              1024 kB
Writeback:             0 kB
AnonPages:       3400000 kB
Mapped:           400000 kB
Shmem:            100000 kB
Slab:             512000 kB
HugePages_Total:      16
HugePages_Free:        8
HugePages_Rsvd:        2
HugePages_Surp:        0
Hugepagesize:       2048 kB
DirectMap4k:      200000 kB
DirectMap2M:     8000000 kB
DirectMap1G:     9000000 kB
",
        );
        fs.add_file(
            "/proc/swaps",
            "\
Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority
/dev/sda2                               partition\t4194300\t\t1024\t\t-2
",
        );
        fs.add_file(
            "/proc/zoneinfo",
            "\
Node 0, zone      DMA
  per-node stats
      nr_inactive_anon 125000
      nr_active_anon 750000
  pages free     3840
        boost    0
        min      12
        low      15
        high     18
        spanned  4095
        present  3998
        managed  3840
        protection: (0, 2712, 7890, 7890)
      nr_free_pages 3840
  pagesets
    cpu: 0
              count: 0
              high:  0
              batch: 1
  node_unreclaimable:  0
  start_pfn:           1
Node 0, zone   Normal
  pages free     508160
        boost    0
        min      8000
        low      10000
        high     12000
        spanned  2097152
        present  2097152
        managed  2044000
        protection: (0, 0, 0, 0)
      nr_free_pages 508160
      nr_zone_active_anon 700000
Node 1, zone   Normal
  per-node stats
      nr_inactive_anon 100000
  pages free     512000
        boost    0
        min      8000
        low      10000
        high     12000
        spanned  2097152
        present  2097152
        managed  2048000
        protection: (0, 0, 0, 0)
      nr_free_pages 512000
      nr_zone_active_anon 50000
",
        );

        // NUMA topology
        fs.add_file("/sys/devices/system/node/possible", "0-1\n");
        for (node, distance) in [(0, "10 21\n"), (1, "21 10\n")] {
            fs.add_file(
                format!("/sys/devices/system/node/node{}/meminfo", node),
                format!(
                    "\
Node {node} MemTotal:       8192000 kB
Node {node} MemFree:        2048000 kB
Node {node} MemUsed:        6144000 kB
Node {node} Active:         2048000 kB
"
                ),
            );
            fs.add_file(
                format!("/sys/devices/system/node/node{}/distance", node),
                distance,
            );
        }

        // Huge pages
        let huge = "/sys/kernel/mm/hugepages/hugepages-2048kB";
        fs.add_file(format!("{}/nr_hugepages", huge), "16\n");
        fs.add_file(format!("{}/free_hugepages", huge), "8\n");
        fs.add_file(format!("{}/resv_hugepages", huge), "2\n");
        fs.add_file(format!("{}/surplus_hugepages", huge), "0\n");

        // Processor
        fs.add_file("/proc/cpuinfo", cpuinfo(&[(0, 0), (0, 1), (0, 0), (0, 1)]));
        fs.add_file(
            "/proc/stat",
            "\
cpu  100 0 50 850 0 0 0 0 0 0
cpu0 40 0 20 190 0 0 0 0 0 0
cpu1 30 0 10 210 0 0 0 0 0 0
cpu2 20 0 10 220 0 0 0 0 0 0
cpu3 10 0 10 230 0 0 0 0 0 0
intr 1000000 50 0 0 0 0 0 0 0 1 0
ctxt 500000
btime 1700000000
processes 10000
procs_running 2
procs_blocked 0
",
        );

        let temps = [45000, 52000, 71000, 48000];
        for cpu in 0..4u32 {
            let base = format!("{}/cpu{}", CPU_SYS, cpu);
            // cpu0 cannot be hot-unplugged and has no online file
            if cpu != 0 {
                fs.add_file(format!("{}/online", base), "1\n");
            }

            let governor = if cpu == 1 { "userspace" } else { "powersave" };
            let cpufreq = format!("{}/cpufreq", base);
            fs.add_file(format!("{}/scaling_cur_freq", cpufreq), "2400000\n");
            fs.add_file(format!("{}/scaling_min_freq", cpufreq), "1200000\n");
            fs.add_file(format!("{}/scaling_max_freq", cpufreq), "3000000\n");
            fs.add_file(
                format!("{}/scaling_available_frequencies", cpufreq),
                "3000000 2400000 1200000 \n",
            );
            fs.add_file(
                format!("{}/scaling_governor", cpufreq),
                format!("{}\n", governor),
            );
            fs.add_file(format!("{}/scaling_setspeed", cpufreq), "<unsupported>\n");

            // Hyperthread siblings share L1/L2; everyone shares L3.
            let siblings = if cpu % 2 == 0 { "0,2" } else { "1,3" };
            let caches = [
                ("index0", "1", "Data", "32K", "8", "64", siblings),
                ("index1", "1", "Instruction", "32K", "8", "64", siblings),
                ("index2", "2", "Unified", "256K", "4", "1024", siblings),
                ("index3", "3", "Unified", "8192K", "16", "8192", "0-3"),
            ];
            for (index, level, kind, size, ways, sets, shared) in caches {
                let dir = format!("{}/cache/{}", base, index);
                fs.add_file(format!("{}/level", dir), format!("{}\n", level));
                fs.add_file(format!("{}/type", dir), format!("{}\n", kind));
                fs.add_file(format!("{}/size", dir), format!("{}\n", size));
                fs.add_file(format!("{}/coherency_line_size", dir), "64\n");
                fs.add_file(format!("{}/ways_of_associativity", dir), format!("{}\n", ways));
                fs.add_file(format!("{}/number_of_sets", dir), format!("{}\n", sets));
                fs.add_file(format!("{}/shared_cpu_list", dir), format!("{}\n", shared));
            }

            let zone = format!("/sys/class/thermal/thermal_zone{}", cpu);
            fs.add_file(format!("{}/temp", zone), format!("{}\n", temps[cpu as usize]));
            fs.add_file(format!("{}/trip_point_0_temp", zone), "95000\n");
        }

        let rapl = "/sys/class/powercap/intel-rapl:0";
        fs.add_file(format!("{}/energy_uj", rapl), "123456789\n");
        fs.add_file(format!("{}/constraint_0_power_limit_uw", rapl), "65000000\n");

        fs
    }

    /// Creates a two-socket variant of [`typical_system`](Self::typical_system):
    /// cpu0/cpu1 on package 0, cpu2/cpu3 on package 1, two cores each without SMT.
    pub fn dual_package() -> Self {
        let mut fs = Self::typical_system();
        fs.add_file("/proc/cpuinfo", cpuinfo(&[(0, 0), (0, 1), (1, 0), (1, 1)]));
        let rapl = "/sys/class/powercap/intel-rapl:1";
        fs.add_file(format!("{}/energy_uj", rapl), "987654321\n");
        fs.add_file(format!("{}/constraint_0_power_limit_uw", rapl), "65000000\n");
        fs
    }

    /// Creates a machine exposing only `/proc/meminfo`, `/proc/cpuinfo` and
    /// `/proc/stat`: no swap, zones, NUMA, huge pages, cpufreq, thermal or
    /// power interfaces.
    pub fn minimal_system() -> Self {
        let mut fs = Self::new();
        fs.add_file(
            "/proc/meminfo",
            "\
MemTotal:        2048000 kB
MemFree:         1024000 kB
MemAvailable:    1536000 kB
Buffers:               0 kB
Cached:           256000 kB
",
        );
        fs.add_file("/proc/cpuinfo", "processor\t: 0\nBogoMIPS\t: 48.00\n\n");
        fs.add_file("/proc/stat", "cpu  10 0 10 80 0 0 0 0 0 0\ncpu0 10 0 10 80 0 0 0 0 0 0\n");
        fs
    }
}

/// Renders `/proc/cpuinfo` with one block per `(physical id, core id)` pair.
fn cpuinfo(topology: &[(u32, u32)]) -> String {
    let packages = topology
        .iter()
        .map(|(pkg, _)| *pkg)
        .collect::<std::collections::BTreeSet<_>>()
        .len()
        .max(1);
    let per_package = topology.len() / packages;
    let mut out = String::new();
    for (cpu, (pkg, core)) in topology.iter().enumerate() {
        out.push_str(&format!(
            "\
processor\t: {cpu}
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 79
model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
physical id\t: {pkg}
siblings\t: {per_package}
core id\t\t: {core}
cpu cores\t: 2

"
        ));
    }
    out
}
