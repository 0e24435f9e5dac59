pub mod report;

use std::collections::HashMap;
use std::fmt;

use crate::driver::DeviceId;

/// Where a timing was measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Synchronous host-side call timing.
    Host,
    /// Device execution timing from profiling counters.
    Device(DeviceId),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Device(d) => d.fmt(f),
        }
    }
}

/// Call count and elapsed-time statistics for one call-site tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingStats {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl TimingStats {
    /// Statistics holding a single observation.
    pub const fn first(elapsed_ns: u64) -> Self {
        Self {
            count: 1,
            sum_ns: elapsed_ns,
            min_ns: elapsed_ns,
            max_ns: elapsed_ns,
        }
    }

    /// Fold one more observation in.
    pub fn record(&mut self, elapsed_ns: u64) {
        self.count += 1;
        self.sum_ns = self.sum_ns.saturating_add(elapsed_ns);
        if elapsed_ns < self.min_ns {
            self.min_ns = elapsed_ns;
        }
        if elapsed_ns > self.max_ns {
            self.max_ns = elapsed_ns;
        }
    }

    /// Mean elapsed time, rounded down.
    pub fn average_ns(&self) -> u64 {
        self.sum_ns / self.count.max(1)
    }
}

/// Statistics for one scope, sorted by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeReport {
    pub scope: Scope,
    pub entries: Vec<(String, TimingStats)>,
    /// Sum of `sum_ns` across every tag in the scope.
    pub total_ns: u64,
}

impl ScopeReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Share of the scope total taken by `stats`, in percent.
    pub fn percent_of_total(&self, stats: &TimingStats) -> f64 {
        if self.total_ns == 0 {
            return 0.0;
        }
        stats.sum_ns as f64 * 100.0 / self.total_ns as f64
    }
}

/// Accumulates per-call-site timing statistics for the host and each device.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    host: HashMap<String, TimingStats>,
    devices: HashMap<DeviceId, HashMap<String, TimingStats>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one elapsed time and return the updated statistics.
    pub fn update(&mut self, scope: Scope, tag: &str, elapsed_ns: u64) -> TimingStats {
        let map = match scope {
            Scope::Host => &mut self.host,
            Scope::Device(device) => self.devices.entry(device).or_default(),
        };

        if let Some(stats) = map.get_mut(tag) {
            stats.record(elapsed_ns);
            return *stats;
        }

        let stats = TimingStats::first(elapsed_ns);
        map.insert(tag.to_string(), stats);
        stats
    }

    /// Look up the statistics for one tag.
    pub fn get(&self, scope: Scope, tag: &str) -> Option<TimingStats> {
        self.scope_map(scope)?.get(tag).copied()
    }

    /// Devices that have at least one recorded sample, in ascending order.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(d, _)| *d)
            .collect();
        devices.sort_unstable();
        devices
    }

    /// Tag-sorted statistics and total for one scope.
    pub fn report(&self, scope: Scope) -> ScopeReport {
        let mut entries: Vec<(String, TimingStats)> = self
            .scope_map(scope)
            .map(|m| m.iter().map(|(tag, s)| (tag.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let total_ns = entries
            .iter()
            .fold(0u64, |acc, (_, s)| acc.saturating_add(s.sum_ns));

        ScopeReport {
            scope,
            entries,
            total_ns,
        }
    }

    fn scope_map(&self, scope: Scope) -> Option<&HashMap<String, TimingStats>> {
        match scope {
            Scope::Host => Some(&self.host),
            Scope::Device(device) => self.devices.get(&device),
        }
    }
}
