use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// In-process counters exposed at `/metrics`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    RequestsStarted,
    RequestsCompleted,
    RequestsFailed,
    RequestsCancelled,
    RequestsRejected,
    RunTimeouts,
    EngineRetries,
    DelegationFreezes,
    DelegationRecoveries,
    ToolUnavailable,
    StreamParseErrors,
    ConfigurationLeaks,
    NamesAssigned,
    NamingFailures,
    MemoryLookupFailures,
}

impl Counter {
    pub const ALL: [Counter; 15] = [
        Self::RequestsStarted,
        Self::RequestsCompleted,
        Self::RequestsFailed,
        Self::RequestsCancelled,
        Self::RequestsRejected,
        Self::RunTimeouts,
        Self::EngineRetries,
        Self::DelegationFreezes,
        Self::DelegationRecoveries,
        Self::ToolUnavailable,
        Self::StreamParseErrors,
        Self::ConfigurationLeaks,
        Self::NamesAssigned,
        Self::NamingFailures,
        Self::MemoryLookupFailures,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestsStarted => "requests_started",
            Self::RequestsCompleted => "requests_completed",
            Self::RequestsFailed => "requests_failed",
            Self::RequestsCancelled => "requests_cancelled",
            Self::RequestsRejected => "requests_rejected",
            Self::RunTimeouts => "run_timeouts",
            Self::EngineRetries => "engine_retries",
            Self::DelegationFreezes => "delegation_freezes",
            Self::DelegationRecoveries => "delegation_recoveries",
            Self::ToolUnavailable => "tool_unavailable",
            Self::StreamParseErrors => "stream_parse_errors",
            Self::ConfigurationLeaks => "configuration_leaks",
            Self::NamesAssigned => "names_assigned",
            Self::NamingFailures => "naming_failures",
            Self::MemoryLookupFailures => "memory_lookup_failures",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Observations kept for percentile computation.
const HISTOGRAM_WINDOW: usize = 1024;

struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(HISTOGRAM_WINDOW)),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            window: n as u64,
            mean: sorted.iter().sum::<f64>() / n as f64,
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
            max: sorted[n - 1],
        }
    }
}

/// Summary of the most recent observations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Total observations since start.
    pub count: u64,
    /// Observations the percentiles were computed from.
    pub window: u64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub run_duration_secs: HistogramSummary,
    pub active_runs: u64,
}

pub struct Diagnostics {
    counters: [AtomicU64; Counter::ALL.len()],
    active_runs: AtomicU64,
    run_duration: Histogram,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            active_runs: AtomicU64::new(0),
            run_duration: Histogram::new(),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn run_started(&self) {
        self.active_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_finished(&self, elapsed: Duration) {
        let _ = self
            .active_runs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.run_duration.observe(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            counters: Counter::ALL
                .iter()
                .map(|c| (c.name().to_string(), self.get(*c)))
                .collect(),
            run_duration_secs: self.run_duration.summary(),
            active_runs: self.active_runs.load(Ordering::Relaxed),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_indices_match_all() {
        for (i, c) in Counter::ALL.iter().enumerate() {
            assert_eq!(c.index(), i, "{} out of order", c.name());
        }
    }

    #[test]
    fn counters_increment_independently() {
        let d = Diagnostics::new();
        d.incr(Counter::DelegationFreezes);
        d.incr(Counter::DelegationFreezes);
        d.incr(Counter::StreamParseErrors);
        assert_eq!(d.get(Counter::DelegationFreezes), 2);
        assert_eq!(d.get(Counter::StreamParseErrors), 1);
        assert_eq!(d.get(Counter::ConfigurationLeaks), 0);
    }

    #[test]
    fn snapshot_lists_every_counter() {
        let d = Diagnostics::new();
        d.incr(Counter::RequestsStarted);
        let snap = d.snapshot();
        assert_eq!(snap.counters.len(), Counter::ALL.len());
        assert_eq!(snap.counters["requests_started"], 1);
    }

    #[test]
    fn run_tracking() {
        let d = Diagnostics::new();
        d.run_started();
        d.run_started();
        d.run_finished(Duration::from_secs(2));
        let snap = d.snapshot();
        assert_eq!(snap.active_runs, 1);
        assert_eq!(snap.run_duration_secs.count, 1);
        assert_eq!(snap.run_duration_secs.p50, 2.0);

        d.run_finished(Duration::from_secs(4));
        d.run_finished(Duration::from_secs(6));
        assert_eq!(d.snapshot().active_runs, 0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let h = Histogram::new();
        for i in 0..(HISTOGRAM_WINDOW + 10) {
            h.observe(i as f64);
        }
        let s = h.summary();
        assert_eq!(s.count, (HISTOGRAM_WINDOW + 10) as u64);
        assert_eq!(s.window, HISTOGRAM_WINDOW as u64);
        assert_eq!(s.max, (HISTOGRAM_WINDOW + 9) as f64);
    }

    #[test]
    fn empty_histogram_summary() {
        assert_eq!(Histogram::new().summary(), HistogramSummary::default());
    }
}
