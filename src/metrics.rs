//! Fabric-wide counters and latency histograms.
//!
//! Counters are plain atomics behind a named registry; components
//! record drops, debounces, evaluation errors and the like, and the
//! health reporter serializes periodic snapshots.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-bucket latency histogram in microseconds.
///
/// Buckets are powers of two up to ~67s; recording is lock-free.
pub struct LatencyHistogram {
    buckets: [AtomicU64; 27],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, value_us: u64) {
        let idx = (64 - value_us.max(1).leading_zeros() as usize - 1).min(self.buckets.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(value_us, Ordering::Relaxed);
        self.max_us.fetch_max(value_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_us(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum_us.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Approximate quantile from bucket upper bounds.
    pub fn quantile_us(&self, q: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * q).ceil() as u64;
        let mut seen = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return 1u64 << (idx + 1);
            }
        }
        self.max_us.load(Ordering::Relaxed)
    }

    pub fn p50(&self) -> u64 {
        self.quantile_us(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.quantile_us(0.99)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            mean_us: self.mean_us(),
            p50_us: self.p50(),
            p99_us: self.p99(),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Named monotonic counters.
#[derive(Default)]
pub struct CounterRegistry {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (creating on first use) a counter handle. Handles are
    /// cheap to clone and safe to cache in hot paths.
    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn increment(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, name: &str, value: u64) {
        self.counter(name).fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        let mut entries: Vec<CounterSnapshot> = self
            .counters
            .read()
            .iter()
            .map(|(name, value)| CounterSnapshot {
                name: name.clone(),
                value: value.load(Ordering::Relaxed),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CounterSnapshot {
    pub name: String,
    pub value: u64,
}

/// Shared metrics handle passed to every component.
pub type Metrics = Arc<CounterRegistry>;

pub fn new_metrics() -> Metrics {
    Arc::new(CounterRegistry::new())
}

/// Counter names used across components. Kept in one place so the
/// stats CLI and tests do not drift from the recording sites.
pub mod names {
    pub const BUS_DROPPED_EVENTS: &str = "bus.dropped_events";
    pub const BUS_LATE_EVENTS: &str = "bus.late_events";
    pub const BUS_ORDERED_OVERFLOW: &str = "bus.ordered_buffer_overflow";
    pub const STORE_EVICTED: &str = "store.evicted_events";
    pub const PATTERN_EVAL_ERRORS: &str = "patterns.eval_errors";
    pub const PATTERN_MATCHES: &str = "patterns.matches";
    pub const FUSION_RULE_FAILURES: &str = "fusion.rule_failures";
    pub const FUSION_QUEUE_DROPS: &str = "fusion.queue_drops";
    pub const FUSION_CACHE_EVICTIONS: &str = "fusion.cache_evictions";
    pub const HNSW_INSERTS: &str = "hnsw.inserts";
    pub const HNSW_PRUNED: &str = "hnsw.pruned_nodes";
    pub const HNSW_PERSIST_FAILURES: &str = "hnsw.persist_failures";
    pub const HNSW_EMERGENCY_PRUNES: &str = "hnsw.emergency_prunes";
    pub const ALGEDONIC_DEBOUNCED: &str = "algedonic.debounced";
    pub const ALGEDONIC_BYPASSED: &str = "algedonic.bypassed";
    pub const ROUTER_STUB_ROUTED: &str = "router.stub_routed";
    pub const ROUTER_RETRIES: &str = "router.retries";
    pub const ROUTER_CIRCUIT_OPEN: &str = "router.circuit_open";
}
