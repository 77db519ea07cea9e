//! Parsers for `/proc` and `/sys` text interfaces.
//!
//! These are pure functions over file content, testable with string inputs.
//! Line-oriented formats go through the shared [`PatternMatcher`] so each
//! pattern is compiled once per process.

use std::collections::{BTreeMap, HashMap};

use crate::collector::error::CollectError;
use crate::collector::pattern::{PatternMatcher, Patterns};
use crate::model::{CpuTimes, ZoneStats};

fn parse_num<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, CollectError> {
    field
        .trim()
        .parse()
        .map_err(|_| CollectError::Parse(format!("invalid {} value '{}'", what, field.trim())))
}

/// Parses a single-value sysfs file (`scaling_cur_freq`, `temp`, `energy_uj`, ...).
pub fn parse_u64(content: &str) -> Result<u64, CollectError> {
    let token = content
        .split_whitespace()
        .next()
        .ok_or_else(|| CollectError::Parse("empty value".to_string()))?;
    parse_num(token, "numeric")
}

/// Parses a signed single-value file. Thermal sensors may report below zero.
pub fn parse_i64(content: &str) -> Result<i64, CollectError> {
    let token = content
        .split_whitespace()
        .next()
        .ok_or_else(|| CollectError::Parse("empty value".to_string()))?;
    parse_num(token, "numeric")
}

/// Parses a whitespace-separated list (`scaling_available_frequencies`, `distance`).
pub fn parse_u64_list(content: &str) -> Result<Vec<u64>, CollectError> {
    content
        .split_whitespace()
        .map(|s| parse_num(s, "list"))
        .collect()
}

/// Parses kernel cpu-list syntax such as `0-3,8,10-11`.
pub fn parse_cpu_list(content: &str) -> Result<Vec<u32>, CollectError> {
    let mut cpus = Vec::new();
    for part in content.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = parse_num(start, "cpu range")?;
                let end: u32 = parse_num(end, "cpu range")?;
                if end < start {
                    return Err(CollectError::Parse(format!("reversed cpu range '{}'", part)));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(parse_num(part, "cpu id")?),
        }
    }
    Ok(cpus)
}

/// Parses a cache size such as `32K` or `8M` into bytes.
pub fn parse_cache_size(content: &str) -> Result<u64, CollectError> {
    let s = content.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('K') => (&s[..s.len() - 1], 1024),
        Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = parse_num(digits, "cache size")?;
    Ok(value * multiplier)
}

/// Parses `/proc/meminfo` (or a node's `meminfo`) into raw values.
///
/// Values are returned as the kernel prints them: kB for sizes, plain counts
/// for the `HugePages_*` fields.
pub fn parse_meminfo(
    matcher: &PatternMatcher,
    content: &str,
) -> Result<HashMap<String, u64>, CollectError> {
    let raw = matcher.match_to_map_in(content, Patterns::MEMINFO_KEY, Patterns::MEMINFO_VALUE)?;
    let mut values = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        let parsed = parse_num(&value, &key)?;
        values.insert(key, parsed);
    }
    Ok(values)
}

/// Swap totals summed over every `/proc/swaps` row, in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapTotals {
    pub size_kb: u64,
    pub used_kb: u64,
    pub devices: usize,
}

/// Parses `/proc/swaps`.
pub fn parse_swaps(content: &str) -> Result<SwapTotals, CollectError> {
    let mut totals = SwapTotals::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() || parts[0] == "Filename" {
            continue;
        }
        if parts.len() < 4 {
            return Err(CollectError::Parse(format!("short swaps row '{}'", line)));
        }
        let size: u64 = parse_num(parts[2], "swap size")?;
        let used: u64 = parse_num(parts[3], "swap used")?;
        totals.size_kb += size;
        totals.used_kb += used;
        totals.devices += 1;
    }

    Ok(totals)
}

/// Parses `/proc/zoneinfo` into per-zone statistics, merging zones that share
/// a name across NUMA nodes.
///
/// Counters are only taken from the zone section that follows `pages free`;
/// the `per-node stats` block printed before it belongs to the node, not the
/// zone.
pub fn parse_zoneinfo(
    matcher: &PatternMatcher,
    content: &str,
) -> Result<BTreeMap<String, ZoneStats>, CollectError> {
    let header = matcher.compile(Patterns::ZONE_HEADER)?;
    let pages_free = matcher.compile(Patterns::ZONE_PAGES_FREE)?;
    let protection = matcher.compile(Patterns::ZONE_PROTECTION)?;
    let counter = matcher.compile(Patterns::ZONE_COUNTER)?;

    let mut zones: BTreeMap<String, ZoneStats> = BTreeMap::new();
    let mut current: Option<ZoneStats> = None;
    let mut in_zone = false;

    for line in content.lines() {
        if let Some(caps) = header.captures(line) {
            if let Some(zone) = current.take() {
                insert_zone(&mut zones, zone);
            }
            current = Some(ZoneStats {
                name: caps[2].to_string(),
                nodes: vec![parse_num(&caps[1], "zone node")?],
                ..Default::default()
            });
            in_zone = false;
            continue;
        }

        let Some(zone) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = pages_free.captures(line) {
            zone.pages_free = parse_num(&caps[1], "pages free")?;
            in_zone = true;
        } else if !in_zone {
            continue;
        } else if let Some(caps) = protection.captures(line) {
            zone.protection = caps[1]
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_num(s, "protection"))
                .collect::<Result<_, _>>()?;
        } else if let Some(caps) = counter.captures(line) {
            let value: u64 = parse_num(&caps[2], &caps[1])?;
            match &caps[1] {
                "min" => zone.min = value,
                "low" => zone.low = value,
                "high" => zone.high = value,
                "spanned" => zone.spanned = value,
                "present" => zone.present = value,
                "managed" => zone.managed = value,
                name => {
                    zone.counters.insert(name.to_string(), value);
                }
            }
        }
    }

    if let Some(zone) = current.take() {
        insert_zone(&mut zones, zone);
    }

    Ok(zones)
}

fn insert_zone(zones: &mut BTreeMap<String, ZoneStats>, zone: ZoneStats) {
    match zones.get_mut(&zone.name) {
        Some(existing) => existing.merge(&zone),
        None => {
            zones.insert(zone.name.clone(), zone);
        }
    }
}

/// Parses a NUMA node `distance` file.
pub fn parse_node_distance(content: &str) -> Result<Vec<u32>, CollectError> {
    content
        .split_whitespace()
        .map(|s| parse_num(s, "node distance"))
        .collect()
}

/// One logical CPU block from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfoRecord {
    pub processor: u32,
    pub physical_id: Option<u32>,
    pub core_id: Option<u32>,
    pub siblings: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub model_name: String,
    pub vendor_id: String,
}

/// Parses `/proc/cpuinfo`; each `processor` line starts a new record.
pub fn parse_cpuinfo(
    matcher: &PatternMatcher,
    content: &str,
) -> Result<Vec<CpuInfoRecord>, CollectError> {
    let processor = matcher.compile(Patterns::CPU_PROCESSOR)?;
    let physical_id = matcher.compile(Patterns::CPU_PHYSICAL_ID)?;
    let core_id = matcher.compile(Patterns::CPU_CORE_ID)?;
    let siblings = matcher.compile(Patterns::CPU_SIBLINGS)?;
    let cpu_cores = matcher.compile(Patterns::CPU_CORES)?;
    let model_name = matcher.compile(Patterns::CPU_MODEL_NAME)?;
    let vendor_id = matcher.compile(Patterns::CPU_VENDOR_ID)?;

    let mut records = Vec::new();
    let mut current: Option<CpuInfoRecord> = None;

    for line in content.lines() {
        if let Some(caps) = processor.captures(line) {
            if let Some(record) = current.take() {
                records.push(record);
            }
            current = Some(CpuInfoRecord {
                processor: parse_num(&caps[1], "processor")?,
                ..Default::default()
            });
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = physical_id.captures(line) {
            record.physical_id = Some(parse_num(&caps[1], "physical id")?);
        } else if let Some(caps) = core_id.captures(line) {
            record.core_id = Some(parse_num(&caps[1], "core id")?);
        } else if let Some(caps) = siblings.captures(line) {
            record.siblings = Some(parse_num(&caps[1], "siblings")?);
        } else if let Some(caps) = cpu_cores.captures(line) {
            record.cpu_cores = Some(parse_num(&caps[1], "cpu cores")?);
        } else if let Some(caps) = model_name.captures(line) {
            record.model_name = caps[1].trim().to_string();
        } else if let Some(caps) = vendor_id.captures(line) {
            record.vendor_id = caps[1].trim().to_string();
        }
    }

    if let Some(record) = current.take() {
        records.push(record);
    }

    Ok(records)
}

/// CPU tick counters from `/proc/stat`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatCpus {
    /// Aggregate `cpu` line.
    pub total: CpuTimes,
    /// `cpuN` lines in file order.
    pub per_cpu: Vec<(u32, CpuTimes)>,
}

/// Parses the `cpu` lines of `/proc/stat`. Columns missing on older kernels
/// read as zero.
pub fn parse_stat_cpus(matcher: &PatternMatcher, content: &str) -> Result<StatCpus, CollectError> {
    let mut stat = StatCpus::default();
    let mut seen_total = false;

    let mut error = None;
    matcher.for_each_match_in(content, Patterns::STAT_CPU, |_, caps| {
        if error.is_some() {
            return;
        }
        let fields: Result<Vec<u64>, CollectError> = caps[2]
            .split_whitespace()
            .map(|s| parse_num(s, "cpu ticks"))
            .collect();
        let fields = match fields {
            Ok(fields) => fields,
            Err(e) => {
                error = Some(e);
                return;
            }
        };
        let get = |idx: usize| fields.get(idx).copied().unwrap_or(0);
        let times = CpuTimes {
            user: get(0),
            nice: get(1),
            system: get(2),
            idle: get(3),
            iowait: get(4),
            irq: get(5),
            softirq: get(6),
            steal: get(7),
            guest: get(8),
            guest_nice: get(9),
        };

        if caps[1].is_empty() {
            stat.total = times;
            seen_total = true;
        } else {
            match parse_num(&caps[1], "cpu id") {
                Ok(id) => stat.per_cpu.push((id, times)),
                Err(e) => error = Some(e),
            }
        }
    })?;

    if let Some(e) = error {
        return Err(e);
    }
    if !seen_total {
        return Err(CollectError::Parse("no aggregate cpu line".to_string()));
    }
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse_u64("2400000\n").unwrap(), 2_400_000);
        assert_eq!(parse_i64("-5000\n").unwrap(), -5000);
        assert!(matches!(parse_u64(""), Err(CollectError::Parse(_))));
        assert!(matches!(parse_u64("abc"), Err(CollectError::Parse(_))));
        assert_eq!(
            parse_u64_list("3000000 2400000 1200000 \n").unwrap(),
            vec![3_000_000, 2_400_000, 1_200_000]
        );
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,6\n").unwrap(), vec![0, 1, 2, 3, 6]);
        assert_eq!(parse_cpu_list("2").unwrap(), vec![2]);
        assert_eq!(parse_cpu_list("\n").unwrap(), Vec::<u32>::new());
        assert!(parse_cpu_list("3-1").is_err());
    }

    #[test]
    fn test_parse_cache_size() {
        assert_eq!(parse_cache_size("32K\n").unwrap(), 32 * 1024);
        assert_eq!(parse_cache_size("8M").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_cache_size("512").unwrap(), 512);
        assert!(parse_cache_size("K").is_err());
    }

    #[test]
    fn test_parse_meminfo() {
        let matcher = PatternMatcher::new();
        let content = "\
MemTotal:       16384000 kB
MemFree:         4096000 kB
Active(file):    1000000 kB
HugePages_Total:      16
Hugepagesize:       2048 kB
";
        let values = parse_meminfo(&matcher, content).unwrap();
        assert_eq!(values["MemTotal"], 16384000);
        assert_eq!(values["MemFree"], 4096000);
        assert_eq!(values["Active(file)"], 1000000);
        assert_eq!(values["HugePages_Total"], 16);
        assert_eq!(values["Hugepagesize"], 2048);
    }

    #[test]
    fn test_parse_swaps() {
        let content = "\
Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority
/dev/sda2                               partition\t4194300\t\t1024\t\t-2
/swapfile                               file\t\t2097148\t\t0\t\t-3
";
        let totals = parse_swaps(content).unwrap();
        assert_eq!(totals.size_kb, 4194300 + 2097148);
        assert_eq!(totals.used_kb, 1024);
        assert_eq!(totals.devices, 2);

        let empty = parse_swaps("Filename Type Size Used Priority\n").unwrap();
        assert_eq!(empty, SwapTotals::default());
    }

    #[test]
    fn test_parse_zoneinfo() {
        let matcher = PatternMatcher::new();
        let content = "\
Node 0, zone      DMA
  per-node stats
      nr_inactive_anon 5000
  pages free     3840
        boost    0
        min      12
        low      15
        high     18
        spanned  4095
        present  3998
        managed  3840
        protection: (0, 2712, 15751, 15751)
      nr_free_pages 3840
  pagesets
    cpu: 0
              count: 0
              high:  0
              batch: 1
  node_unreclaimable:  0
Node 0, zone   Normal
  pages free     100000
        min      5000
        low      6000
        high     7000
        spanned  1000000
        present  1000000
        managed  980000
        protection: (0, 0, 0, 0)
      nr_free_pages 100000
Node 1, zone   Normal
  pages free     50000
        min      2500
        low      3000
        high     3500
        spanned  500000
        present  500000
        managed  490000
        protection: (0, 0, 0, 0)
      nr_free_pages 50000
";
        let zones = parse_zoneinfo(&matcher, content).unwrap();
        assert_eq!(zones.len(), 2);

        let dma = &zones["DMA"];
        assert_eq!(dma.nodes, vec![0]);
        assert_eq!(dma.pages_free, 3840);
        assert_eq!(dma.min, 12);
        assert_eq!(dma.high, 18);
        assert_eq!(dma.managed, 3840);
        assert_eq!(dma.protection, vec![0, 2712, 15751, 15751]);
        assert_eq!(dma.counters["boost"], 0);
        assert_eq!(dma.counters["nr_free_pages"], 3840);
        // Node-level counters before "pages free" are not zone counters.
        assert!(!dma.counters.contains_key("nr_inactive_anon"));

        let normal = &zones["Normal"];
        assert_eq!(normal.nodes, vec![0, 1]);
        assert_eq!(normal.pages_free, 150000);
        assert_eq!(normal.min, 7500);
        assert_eq!(normal.counters["nr_free_pages"], 150000);
    }

    #[test]
    fn test_parse_zoneinfo_empty() {
        let matcher = PatternMatcher::new();
        assert!(parse_zoneinfo(&matcher, "").unwrap().is_empty());
    }

    #[test]
    fn test_parse_node_distance() {
        assert_eq!(parse_node_distance("10 21\n").unwrap(), vec![10, 21]);
        assert!(parse_node_distance("10 x").is_err());
    }

    #[test]
    fn test_parse_cpuinfo() {
        let matcher = PatternMatcher::new();
        let content = "\
processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
physical id\t: 0
siblings\t: 2
core id\t\t: 0
cpu cores\t: 1

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz
physical id\t: 0
siblings\t: 2
core id\t\t: 0
cpu cores\t: 1

";
        let records = parse_cpuinfo(&matcher, content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].processor, 1);
        assert_eq!(records[1].physical_id, Some(0));
        assert_eq!(records[1].core_id, Some(0));
        assert_eq!(records[0].siblings, Some(2));
        assert_eq!(records[0].cpu_cores, Some(1));
        assert_eq!(records[0].vendor_id, "GenuineIntel");
        assert_eq!(
            records[0].model_name,
            "Intel(R) Xeon(R) CPU E5-2680 v4 @ 2.40GHz"
        );
    }

    #[test]
    fn test_parse_cpuinfo_without_topology() {
        // ARM kernels print neither physical id nor model name per cpu.
        let matcher = PatternMatcher::new();
        let content = "processor\t: 0\nBogoMIPS\t: 48.00\n\nprocessor\t: 1\nBogoMIPS\t: 48.00\n";
        let records = parse_cpuinfo(&matcher, content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].physical_id, None);
        assert!(records[0].model_name.is_empty());
    }

    #[test]
    fn test_parse_stat_cpus() {
        let matcher = PatternMatcher::new();
        let content = "\
cpu  100 0 50 850 0 0 0 0 0 0
cpu0 60 0 20 420 0 0 0 0 0 0
cpu1 40 0 30 430 0 0 0
intr 1000000 50 0
ctxt 500000
";
        let stat = parse_stat_cpus(&matcher, content).unwrap();
        assert_eq!(stat.total.total(), 1000);
        assert!((stat.total.utilization() - 15.0).abs() < 1e-9);
        assert_eq!(stat.per_cpu.len(), 2);
        assert_eq!(stat.per_cpu[1].0, 1);
        assert_eq!(stat.per_cpu[1].1.system, 30);
        assert_eq!(stat.per_cpu[1].1.guest, 0);
    }

    #[test]
    fn test_parse_stat_cpus_errors() {
        let matcher = PatternMatcher::new();
        assert!(matches!(
            parse_stat_cpus(&matcher, "intr 1 2 3\n"),
            Err(CollectError::Parse(_))
        ));
        assert!(matches!(
            parse_stat_cpus(&matcher, "cpu  1 x 3\n"),
            Err(CollectError::Parse(_))
        ));
    }
}
