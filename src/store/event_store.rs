//! HLC-keyed event retention with windowed queries.

use crate::clock::HlcTimestamp;
use crate::metrics::{names, Metrics};
use crate::models::Event;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Optional predicate applied inside windowed queries.
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreStats {
    pub total_events: usize,
    pub topics: usize,
    pub evicted_total: u64,
    pub oldest_physical_ms: Option<u64>,
    pub newest_physical_ms: Option<u64>,
}

struct StoreInner {
    by_time: BTreeMap<HlcTimestamp, Arc<Event>>,
    by_topic: HashMap<String, VecDeque<HlcTimestamp>>,
    evicted_total: u64,
}

/// Bounded time-indexed store. Owners mutate through `append`; reads
/// hand out shared event references, never mutable access.
pub struct EventStore {
    inner: RwLock<StoreInner>,
    retention_ms: u64,
    topic_cap: usize,
    metrics: Metrics,
}

impl EventStore {
    pub fn new(retention_ms: u64, topic_cap: usize, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner {
                by_time: BTreeMap::new(),
                by_topic: HashMap::new(),
                evicted_total: 0,
            }),
            retention_ms,
            topic_cap: topic_cap.max(1),
            metrics,
        })
    }

    /// Append an event. O(log n) on the time index. Lazily evicts
    /// expired events and enforces the per-topic cap (drop-oldest).
    pub fn append(&self, event: Arc<Event>) {
        let mut inner = self.inner.write();

        let ts = event.timestamp.clone();
        let topic = event.topic.clone();
        inner.by_time.insert(ts.clone(), event);
        inner.by_topic.entry(topic.clone()).or_default().push_back(ts.clone());

        // Per-topic hard cap: drop the oldest entries for this topic.
        let mut over_cap: Vec<HlcTimestamp> = Vec::new();
        if let Some(index) = inner.by_topic.get_mut(&topic) {
            while index.len() > self.topic_cap {
                if let Some(old) = index.pop_front() {
                    over_cap.push(old);
                }
            }
        }
        for old in over_cap {
            inner.by_time.remove(&old);
            inner.evicted_total += 1;
            self.metrics.increment(names::STORE_EVICTED);
        }

        // Rolling retention keyed off the newest physical time.
        let cutoff = ts.physical_ms.saturating_sub(self.retention_ms);
        self.evict_before(&mut inner, cutoff);
    }

    fn evict_before(&self, inner: &mut StoreInner, cutoff_ms: u64) {
        let bound = HlcTimestamp::new(cutoff_ms, 0, "");
        let expired: Vec<HlcTimestamp> = inner
            .by_time
            .range(..bound)
            .map(|(ts, _)| ts.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        for ts in &expired {
            if let Some(event) = inner.by_time.remove(ts) {
                if let Some(index) = inner.by_topic.get_mut(&event.topic) {
                    index.retain(|t| t != ts);
                    if index.is_empty() {
                        inner.by_topic.remove(&event.topic);
                    }
                }
            }
        }
        inner.evicted_total += expired.len() as u64;
        self.metrics.add(names::STORE_EVICTED, expired.len() as u64);
        debug!(count = expired.len(), cutoff_ms, "evicted expired events");
    }

    /// Events with `start <= ts < end`, optionally filtered.
    pub fn events_in_window(
        &self,
        start: &HlcTimestamp,
        end: &HlcTimestamp,
        filter: Option<&EventFilter>,
    ) -> Vec<Arc<Event>> {
        let inner = self.inner.read();
        inner
            .by_time
            .range(start.clone()..end.clone())
            .map(|(_, event)| event.clone())
            .filter(|event| filter.map(|f| f(event)).unwrap_or(true))
            .collect()
    }

    /// Events in the physical window `[now_ms - window_ms, now_ms]`,
    /// the common shape for temporal predicates.
    pub fn events_in_physical_window(
        &self,
        now_ms: u64,
        window_ms: u64,
        filter: Option<&EventFilter>,
    ) -> Vec<Arc<Event>> {
        let start = HlcTimestamp::new(now_ms.saturating_sub(window_ms), 0, "");
        // Exclusive upper bound one past the current millisecond.
        let end = HlcTimestamp::new(now_ms + 1, 0, "");
        self.events_in_window(&start, &end, filter)
    }

    /// Last `k` events on a topic, oldest first.
    pub fn recent(&self, topic: &str, k: usize) -> Vec<Arc<Event>> {
        let inner = self.inner.read();
        let Some(index) = inner.by_topic.get(topic) else {
            return Vec::new();
        };
        index
            .iter()
            .rev()
            .take(k)
            .filter_map(|ts| inner.by_time.get(ts).cloned())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_time.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            total_events: inner.by_time.len(),
            topics: inner.by_topic.len(),
            evicted_total: inner.evicted_total,
            oldest_physical_ms: inner.by_time.keys().next().map(|ts| ts.physical_ms),
            newest_physical_ms: inner.by_time.keys().next_back().map(|ts| ts.physical_ms),
        }
    }
}
