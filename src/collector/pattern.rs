//! Regex-based line matcher with a compiled-pattern cache.
//!
//! Kernel text interfaces are polled at sub-second intervals, so every
//! pattern is compiled once and memoized by its exact text. The cache is
//! shared read-mostly state: lookups take a read lock, inserting a freshly
//! compiled pattern takes the write lock. Compiled patterns are handed out as
//! `Arc<Regex>`, so a [`PatternMatcher::clear_cache`] never disturbs a match
//! that already resolved its regex.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::collector::buffer::{Buffer, BufferConfig};
use crate::collector::error::CollectError;

/// Named patterns for the fields the monitors extract.
pub struct Patterns;

impl Patterns {
    // /proc/cpuinfo
    pub const CPU_PROCESSOR: &'static str = r"^processor\s*:\s*(\d+)";
    pub const CPU_PHYSICAL_ID: &'static str = r"^physical id\s*:\s*(\d+)";
    pub const CPU_CORE_ID: &'static str = r"^core id\s*:\s*(\d+)";
    pub const CPU_SIBLINGS: &'static str = r"^siblings\s*:\s*(\d+)";
    pub const CPU_CORES: &'static str = r"^cpu cores\s*:\s*(\d+)";
    pub const CPU_MODEL_NAME: &'static str = r"^model name\s*:\s*(.+)";
    pub const CPU_VENDOR_ID: &'static str = r"^vendor_id\s*:\s*(.+)";

    // /proc/meminfo and /sys/devices/system/node/nodeN/meminfo
    pub const MEMINFO_KEY: &'static str = r"^(?:Node\s+\d+\s+)?([A-Za-z0-9_()]+):";
    pub const MEMINFO_VALUE: &'static str = r":\s+(\d+)";
    pub const MEM_TOTAL: &'static str = r"MemTotal:\s+(\d+)";
    pub const MEM_FREE: &'static str = r"MemFree:\s+(\d+)";

    // /proc/zoneinfo
    pub const ZONE_HEADER: &'static str = r"^Node\s+(\d+),\s+zone\s+(\S+)";
    pub const ZONE_PAGES_FREE: &'static str = r"^\s*pages free\s+(\d+)";
    pub const ZONE_COUNTER: &'static str = r"^\s*([a-z_]+)\s+(\d+)\s*$";
    pub const ZONE_PROTECTION: &'static str = r"^\s*protection:\s*\(([^)]*)\)";

    // /proc/stat
    pub const STAT_CPU: &'static str = r"^cpu(\d*)\s+(.*)$";
}

/// Outcome of matching one line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    /// First capture group if the pattern has one, otherwise the whole match.
    pub value: String,
}

impl MatchResult {
    fn hit(value: impl Into<String>) -> Self {
        Self {
            matched: true,
            value: value.into(),
        }
    }
}

static SHARED: LazyLock<Arc<PatternMatcher>> = LazyLock::new(|| Arc::new(PatternMatcher::new()));

/// Thread-safe matcher with memoized regex compilation.
#[derive(Debug, Default)]
pub struct PatternMatcher {
    cache: RwLock<HashMap<String, Arc<Regex>>>,
    buffer_config: BufferConfig,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `config` for the file scans (`match_all`, `extract`, ...).
    pub fn with_buffer_config(config: BufferConfig) -> Self {
        Self {
            cache: RwLock::default(),
            buffer_config: config,
        }
    }

    /// Returns the process-wide matcher.
    pub fn shared() -> Arc<PatternMatcher> {
        Arc::clone(&SHARED)
    }

    /// Returns the compiled form of `pattern`, compiling it on first use.
    pub fn compile(&self, pattern: &str) -> Result<Arc<Regex>, CollectError> {
        if let Some(re) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
        {
            return Ok(Arc::clone(re));
        }

        let compiled = Regex::new(pattern).map_err(|e| CollectError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache
            .entry(pattern.to_string())
            .or_insert_with(|| Arc::new(compiled));
        Ok(Arc::clone(entry))
    }

    /// Matches a single line.
    ///
    /// A valid pattern that does not match yields `matched == false` and an
    /// empty value; only a malformed pattern is an error.
    pub fn match_line(&self, line: &str, pattern: &str) -> Result<MatchResult, CollectError> {
        let re = self.compile(pattern)?;
        Ok(first_capture(&re, line)
            .map(MatchResult::hit)
            .unwrap_or_default())
    }

    /// Returns every capture group (group 0 excluded) of the first match.
    pub fn capture_groups(
        &self,
        line: &str,
        pattern: &str,
    ) -> Result<Option<Vec<String>>, CollectError> {
        let re = self.compile(pattern)?;
        Ok(re.captures(line).map(|caps| {
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect()
        }))
    }

    /// Applies every pattern to every line of `content`; one result per hit.
    pub fn match_all_in(
        &self,
        content: &str,
        patterns: &[&str],
    ) -> Result<Vec<MatchResult>, CollectError> {
        let compiled = patterns
            .iter()
            .map(|p| self.compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::new();
        for line in content.lines() {
            for re in &compiled {
                if let Some(value) = first_capture(re, line) {
                    results.push(MatchResult::hit(value));
                }
            }
        }
        Ok(results)
    }

    /// Collects the captured value of every matching line of `content`.
    pub fn extract_in(&self, content: &str, pattern: &str) -> Result<Vec<String>, CollectError> {
        let re = self.compile(pattern)?;
        Ok(content
            .lines()
            .filter_map(|line| first_capture(&re, line))
            .collect())
    }

    /// Pairs key and value matches found on the same line. The first
    /// occurrence of a key wins.
    pub fn match_to_map_in(
        &self,
        content: &str,
        key_pattern: &str,
        value_pattern: &str,
    ) -> Result<HashMap<String, String>, CollectError> {
        let key_re = self.compile(key_pattern)?;
        let value_re = self.compile(value_pattern)?;

        let mut map = HashMap::new();
        for line in content.lines() {
            if let (Some(key), Some(value)) =
                (first_capture(&key_re, line), first_capture(&value_re, line))
            {
                map.entry(key).or_insert(value);
            }
        }
        Ok(map)
    }

    /// Calls `handler` with each matching line and its captures.
    pub fn for_each_match_in<F>(
        &self,
        content: &str,
        pattern: &str,
        mut handler: F,
    ) -> Result<(), CollectError>
    where
        F: FnMut(&str, &Captures<'_>),
    {
        let re = self.compile(pattern)?;
        for line in content.lines() {
            if let Some(caps) = re.captures(line) {
                handler(line, &caps);
            }
        }
        Ok(())
    }

    /// File variant of [`match_all_in`](Self::match_all_in).
    pub fn match_all(
        &self,
        path: impl AsRef<Path>,
        patterns: &[&str],
    ) -> Result<Vec<MatchResult>, CollectError> {
        let content = self.read_file(path.as_ref())?;
        self.match_all_in(&content, patterns)
    }

    /// File variant of [`extract_in`](Self::extract_in).
    pub fn extract(
        &self,
        path: impl AsRef<Path>,
        pattern: &str,
    ) -> Result<Vec<String>, CollectError> {
        let content = self.read_file(path.as_ref())?;
        self.extract_in(&content, pattern)
    }

    /// File variant of [`match_to_map_in`](Self::match_to_map_in).
    pub fn match_to_map(
        &self,
        path: impl AsRef<Path>,
        key_pattern: &str,
        value_pattern: &str,
    ) -> Result<HashMap<String, String>, CollectError> {
        let content = self.read_file(path.as_ref())?;
        self.match_to_map_in(&content, key_pattern, value_pattern)
    }

    /// File variant of [`for_each_match_in`](Self::for_each_match_in).
    pub fn for_each_match<F>(
        &self,
        path: impl AsRef<Path>,
        pattern: &str,
        handler: F,
    ) -> Result<(), CollectError>
    where
        F: FnMut(&str, &Captures<'_>),
    {
        let content = self.read_file(path.as_ref())?;
        self.for_each_match_in(&content, pattern, handler)
    }

    /// Drops all memoized patterns.
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of memoized patterns.
    pub fn cached_patterns(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn read_file(&self, path: &Path) -> Result<String, CollectError> {
        let buffer = Buffer::open(path, self.buffer_config.clone())?;
        Ok(buffer.text())
    }
}

fn first_capture(re: &Regex, line: &str) -> Option<String> {
    let caps = re.captures(line)?;
    let m = if caps.len() > 1 {
        caps.get(1).map(|m| m.as_str()).unwrap_or("")
    } else {
        caps.get(0).map(|m| m.as_str()).unwrap_or("")
    };
    Some(m.to_string())
}
