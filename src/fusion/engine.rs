//! Semantic fusion engine: the owner of the enriched FIFO, context
//! graph, pattern cache, and causal chain list.
//!
//! Ingestion enriches events with derived tags and queues them. The
//! fuse tick extracts a bounded batch, fires fusion rules, runs the
//! pattern detectors, and updates causal chains. A slower cleanup tick
//! expires stale contexts and cache entries. A panicking fusion rule
//! is isolated to that rule for that batch.

use super::causal::{detect_chains, merge_chains, CausalChain};
use super::detectors::{detect_all, DetectedPattern};
use super::rules::{FusedContext, FusionRule};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::metrics::{names, Metrics};
use crate::models::{payload, topics, Event, EventBuilder, EventMetadata, PayloadValue};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keywords scanned in string payload values during enrichment.
const SEMANTIC_KEYWORDS: &[&str] = &[
    "error", "failure", "overload", "recover", "timeout", "critical", "degraded",
];

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub queue_cap: usize,
    pub fuse_interval: Duration,
    /// Events extracted from the FIFO per tick.
    pub batch_max: usize,
    pub pattern_cache_cap: usize,
    pub pattern_ttl_ms: u64,
    pub chain_cap: usize,
    pub context_ttl_ms: u64,
    pub cleanup_interval: Duration,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            queue_cap: 10_000,
            fuse_interval: Duration::from_millis(500),
            batch_max: 50,
            pattern_cache_cap: 1_000,
            pattern_ttl_ms: 3_600_000,
            chain_cap: 100,
            context_ttl_ms: 3_600_000,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

struct CacheEntry {
    pattern: DetectedPattern,
    expires_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FusionTickReport {
    pub extracted: usize,
    pub rules_fired: usize,
    pub rules_failed: usize,
    pub patterns_detected: usize,
    pub chains_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FusionSnapshot {
    pub queue_len: usize,
    pub contexts: Vec<FusedContext>,
    pub cached_patterns: usize,
    pub chains: Vec<CausalChain>,
}

pub struct SemanticFusionEngine {
    bus: Arc<EventBus>,
    clock: Arc<Clock>,
    metrics: Metrics,
    config: FusionConfig,
    rules: Vec<FusionRule>,
    /// Longest lookback any consumer of the window needs.
    max_window_ms: u64,
    queue: Mutex<VecDeque<Arc<Event>>>,
    window: Mutex<VecDeque<Arc<Event>>>,
    contexts: RwLock<HashMap<String, FusedContext>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    chains: Mutex<Vec<CausalChain>>,
    /// Patterns inserted into the cache since the last drain; feeds
    /// the vector index.
    fresh_patterns: Mutex<Vec<DetectedPattern>>,
}

impl SemanticFusionEngine {
    pub fn new(
        bus: Arc<EventBus>,
        clock: Arc<Clock>,
        metrics: Metrics,
        config: FusionConfig,
        rules: Vec<FusionRule>,
    ) -> Arc<Self> {
        let max_window_ms = rules
            .iter()
            .map(|r| r.window_ms)
            .max()
            .unwrap_or(0)
            .max(60_000);
        Arc::new(Self {
            bus,
            clock,
            metrics,
            config,
            rules,
            max_window_ms,
            queue: Mutex::new(VecDeque::new()),
            window: Mutex::new(VecDeque::new()),
            contexts: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            chains: Mutex::new(Vec::new()),
            fresh_patterns: Mutex::new(Vec::new()),
        })
    }

    /// Topics the engine wants from the bus: the union of every
    /// rule's triggers (targeted subscriptions, not the firehose).
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .rules
            .iter()
            .flat_map(|r| r.trigger_event_types.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Enrich an event and queue it for the next fuse tick.
    pub fn ingest(&self, event: &Arc<Event>) {
        let enriched = self.enrich(event);
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.queue_cap {
            queue.pop_front();
            self.metrics.increment(names::FUSION_QUEUE_DROPS);
        }
        queue.push_back(enriched);
    }

    /// Derive semantic tags: the subsystem, payload keys, and any
    /// recognized keywords in string values.
    fn enrich(&self, event: &Arc<Event>) -> Arc<Event> {
        let mut tags = event.metadata.tags.clone();
        let mut add = |tag: String| {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        };

        add(event.metadata.subsystem.tag().to_string());
        for key in event.payload.keys() {
            add(key.to_string());
        }
        if let PayloadValue::Map(map) = &event.payload {
            for value in map.values() {
                if let Some(text) = value.as_str() {
                    let lower = text.to_lowercase();
                    for keyword in SEMANTIC_KEYWORDS {
                        if lower.contains(keyword) {
                            add((*keyword).to_string());
                        }
                    }
                }
            }
        }

        if tags == event.metadata.tags {
            return event.clone();
        }
        Arc::new(Event {
            id: event.id.clone(),
            topic: event.topic.clone(),
            timestamp: event.timestamp.clone(),
            payload: event.payload.clone(),
            metadata: EventMetadata {
                source: event.metadata.source.clone(),
                priority: event.metadata.priority,
                subsystem: event.metadata.subsystem,
                tags,
            },
        })
    }

    /// One fusion pass. Public so tests and the owner loop share the
    /// exact same code path.
    pub fn fuse_tick(&self) -> FusionTickReport {
        let now_ms = self.clock.now().physical_ms;
        let mut report = FusionTickReport::default();

        // 1. Extract a bounded batch from the FIFO into the window.
        let batch: Vec<Arc<Event>> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.config.batch_max);
            queue.drain(..take).collect()
        };
        report.extracted = batch.len();

        let window_snapshot: Vec<Arc<Event>> = {
            let mut window = self.window.lock();
            window.extend(batch);
            let cutoff = now_ms.saturating_sub(self.max_window_ms);
            while window
                .front()
                .map(|e| e.timestamp.physical_ms < cutoff)
                .unwrap_or(false)
            {
                window.pop_front();
            }
            let mut snapshot: Vec<Arc<Event>> = window.iter().cloned().collect();
            snapshot.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            snapshot
        };

        // 2. Fire fusion rules over their windows.
        for rule in &self.rules {
            let cutoff = now_ms.saturating_sub(rule.window_ms);
            let matching: Vec<Arc<Event>> = window_snapshot
                .iter()
                .filter(|e| e.timestamp.physical_ms >= cutoff && rule.matches(e))
                .cloned()
                .collect();
            if matching.len() < 2 {
                continue;
            }
            let fuse_fn = rule.fuse_fn.clone();
            match catch_unwind(AssertUnwindSafe(|| fuse_fn(&matching))) {
                Ok(context) => {
                    self.publish_fusion_complete(rule, &context);
                    self.contexts.write().insert(rule.name.clone(), context);
                    report.rules_fired += 1;
                }
                Err(_) => {
                    self.metrics.increment(names::FUSION_RULE_FAILURES);
                    warn!(rule = %rule.name, "fusion rule panicked, skipping batch");
                    report.rules_failed += 1;
                }
            }
        }

        // 3. Pattern detectors feed the cache.
        let detected = detect_all(&window_snapshot, now_ms);
        report.patterns_detected = detected.len();
        self.cache_patterns(detected, now_ms);

        // 4. Causal chains.
        let fresh_chains = detect_chains(&window_snapshot, now_ms);
        {
            let mut chains = self.chains.lock();
            let known: Vec<String> = chains.iter().map(|c| c.topic_key()).collect();
            for chain in &fresh_chains {
                if !known.contains(&chain.topic_key()) {
                    self.publish_chain(chain);
                }
            }
            merge_chains(&mut chains, fresh_chains, self.config.chain_cap);
            report.chains_total = chains.len();
        }

        // 5. Cross-reference contexts with patterns and chains.
        self.enrich_contexts();

        debug!(
            extracted = report.extracted,
            fired = report.rules_fired,
            patterns = report.patterns_detected,
            chains = report.chains_total,
            "fuse tick"
        );
        report
    }

    fn cache_patterns(&self, detected: Vec<DetectedPattern>, now_ms: u64) {
        let mut cache = self.cache.lock();
        let mut fresh = self.fresh_patterns.lock();

        for pattern in detected {
            let expires_at_ms = now_ms + self.config.pattern_ttl_ms;
            let is_new = !cache.contains_key(&pattern.id);
            cache.insert(
                pattern.id.clone(),
                CacheEntry {
                    pattern: pattern.clone(),
                    expires_at_ms,
                },
            );
            if is_new {
                fresh.push(pattern);
            }
        }

        // TTL expiry, then capacity eviction by oldest detection.
        let before = cache.len();
        cache.retain(|_, entry| entry.expires_at_ms > now_ms);
        let expired = before - cache.len();
        if expired > 0 {
            self.metrics.add(names::FUSION_CACHE_EVICTIONS, expired as u64);
        }
        while cache.len() > self.config.pattern_cache_cap {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.pattern.detected_at_ms)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    cache.remove(&id);
                    self.metrics.increment(names::FUSION_CACHE_EVICTIONS);
                }
                None => break,
            }
        }
    }

    fn enrich_contexts(&self) {
        let cache = self.cache.lock();
        let chains = self.chains.lock();
        let mut contexts = self.contexts.write();

        for rule in &self.rules {
            let Some(context) = contexts.get_mut(&rule.name) else {
                continue;
            };
            let mut related_patterns: Vec<String> = cache
                .values()
                .filter(|entry| {
                    entry
                        .pattern
                        .topic
                        .as_ref()
                        .map(|topic| {
                            rule.trigger_event_types
                                .iter()
                                .any(|trigger| topic.contains(trigger.as_str()))
                        })
                        .unwrap_or(false)
                })
                .map(|entry| entry.pattern.id.clone())
                .collect();
            related_patterns.sort();
            context.related_patterns = related_patterns;

            let mut related_chains: Vec<String> = chains
                .iter()
                .filter(|chain| {
                    chain
                        .links
                        .iter()
                        .any(|link| rule.trigger_event_types.contains(&link.topic))
                })
                .map(|chain| chain.id.clone())
                .collect();
            related_chains.sort();
            context.related_chains = related_chains;
        }
    }

    /// Expire stale contexts and cache entries. Runs on the slow tick.
    pub fn cleanup_tick(&self) {
        let now_ms = self.clock.now().physical_ms;
        {
            let mut contexts = self.contexts.write();
            let before = contexts.len();
            contexts
                .retain(|_, ctx| now_ms.saturating_sub(ctx.created_at_ms) <= self.config.context_ttl_ms);
            let dropped = before - contexts.len();
            if dropped > 0 {
                debug!(dropped, "expired fused contexts");
            }
        }
        {
            let mut cache = self.cache.lock();
            let before = cache.len();
            cache.retain(|_, entry| entry.expires_at_ms > now_ms);
            let expired = before - cache.len();
            if expired > 0 {
                self.metrics.add(names::FUSION_CACHE_EVICTIONS, expired as u64);
            }
        }
    }

    fn publish_fusion_complete(&self, rule: &FusionRule, context: &FusedContext) {
        let fields: PayloadValue = serde_json::to_value(&context.fields)
            .map(PayloadValue::from)
            .unwrap_or(PayloadValue::Null);
        self.bus.publish_draft(
            EventBuilder::new(topics::FUSION_COMPLETE)
                .source("semantic_fusion")
                .payload(payload(vec![
                    ("rule_name", PayloadValue::Str(rule.name.clone())),
                    ("context", fields),
                    (
                        "source_event_ids",
                        PayloadValue::List(
                            context
                                .source_event_ids
                                .iter()
                                .map(|id| PayloadValue::Str(id.clone()))
                                .collect(),
                        ),
                    ),
                ])),
        );
    }

    fn publish_chain(&self, chain: &CausalChain) {
        self.bus.publish_draft(
            EventBuilder::new(topics::CAUSAL_CHAIN)
                .source("semantic_fusion")
                .payload(payload(vec![
                    ("chain_id", PayloadValue::Str(chain.id.clone())),
                    ("topic_key", PayloadValue::Str(chain.topic_key())),
                    ("confidence", PayloadValue::F64(chain.confidence)),
                ])),
        );
    }

    /// Newly cached patterns since the last call (vector index feed).
    pub fn drain_fresh_patterns(&self) -> Vec<DetectedPattern> {
        std::mem::take(&mut *self.fresh_patterns.lock())
    }

    pub fn snapshot(&self) -> FusionSnapshot {
        let mut contexts: Vec<FusedContext> = self.contexts.read().values().cloned().collect();
        contexts.sort_by(|a, b| a.context_type.cmp(&b.context_type));
        FusionSnapshot {
            queue_len: self.queue.lock().len(),
            contexts,
            cached_patterns: self.cache.lock().len(),
            chains: self.chains.lock().clone(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn cached_pattern_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn fuse_interval(&self) -> Duration {
        self.config.fuse_interval
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_metrics;
    use crate::models::Priority;

    fn engine_with(
        rules: Vec<FusionRule>,
        config: FusionConfig,
    ) -> (Arc<SemanticFusionEngine>, Arc<EventBus>, Arc<Clock>, Metrics) {
        let clock = Arc::new(Clock::new("n"));
        let metrics = new_metrics();
        let bus = EventBus::new(clock.clone(), metrics.clone(), 256);
        let engine =
            SemanticFusionEngine::new(bus.clone(), clock.clone(), metrics.clone(), config, rules);
        (engine, bus, clock, metrics)
    }

    fn live_event(clock: &Clock, topic: &str, fields: Vec<(&str, PayloadValue)>) -> Arc<Event> {
        Arc::new(
            EventBuilder::new(topic)
                .payload(payload(fields))
                .source("test")
                .priority(Priority::Normal)
                .build(clock.now()),
        )
    }

    #[tokio::test]
    async fn test_enrichment_adds_semantic_tags() {
        let (engine, _bus, clock, _m) = engine_with(vec![], FusionConfig::default());
        let event = live_event(
            &clock,
            "s1_ops_load",
            vec![
                ("load", PayloadValue::F64(0.9)),
                (
                    "status",
                    PayloadValue::Str("critical overload detected".into()),
                ),
            ],
        );
        engine.ingest(&event);

        let queued = engine.queue.lock().front().cloned().unwrap();
        assert!(queued.has_tag("s1"));
        assert!(queued.has_tag("load"));
        assert!(queued.has_tag("critical"));
        assert!(queued.has_tag("overload"));
    }

    #[tokio::test]
    async fn test_queue_cap_drops_oldest() {
        let config = FusionConfig {
            queue_cap: 5,
            ..Default::default()
        };
        let (engine, _bus, clock, metrics) = engine_with(vec![], config);
        for i in 0..10 {
            engine.ingest(&live_event(
                &clock,
                "t",
                vec![("i", PayloadValue::I64(i))],
            ));
        }
        assert_eq!(engine.queue_len(), 5);
        assert_eq!(metrics.get(names::FUSION_QUEUE_DROPS), 5);
    }

    #[tokio::test]
    async fn test_rule_fires_and_publishes() {
        let rules = super::super::rules::builtin_rules();
        let (engine, bus, clock, _m) = engine_with(rules, FusionConfig::default());
        let mut sub = bus.subscribe(topics::FUSION_COMPLETE, Default::default());

        engine.ingest(&live_event(
            &clock,
            "s1_ops_load",
            vec![("load", PayloadValue::F64(0.7))],
        ));
        engine.ingest(&live_event(
            &clock,
            "s1_ops_load",
            vec![("load", PayloadValue::F64(0.9))],
        ));

        let report = engine.fuse_tick();
        assert_eq!(report.extracted, 2);
        assert!(report.rules_fired >= 1);

        let delivery = sub
            .recv_timeout(Duration::from_secs(1))
            .await
            .expect("fusion event");
        let events = delivery.into_events();
        assert_eq!(
            events[0].event.field("rule_name"),
            Some(PayloadValue::Str("operational_stress".into()))
        );

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.contexts.len(), 1);
        assert_eq!(snapshot.contexts[0].context_type, "operational_stress");
    }

    #[tokio::test]
    async fn test_rule_needs_two_events() {
        let rules = super::super::rules::builtin_rules();
        let (engine, _bus, clock, _m) = engine_with(rules, FusionConfig::default());
        engine.ingest(&live_event(
            &clock,
            "s1_ops_load",
            vec![("load", PayloadValue::F64(0.7))],
        ));
        let report = engine.fuse_tick();
        assert_eq!(report.rules_fired, 0);
    }

    #[tokio::test]
    async fn test_panicking_rule_is_isolated() {
        let panicking = FusionRule::new("explodes", &["s1_ops_load"], 10_000, |_| {
            panic!("rule bug")
        });
        let healthy = super::super::rules::builtin_rules().remove(0);
        let (engine, _bus, clock, metrics) =
            engine_with(vec![panicking, healthy], FusionConfig::default());

        for _ in 0..2 {
            engine.ingest(&live_event(
                &clock,
                "s1_ops_load",
                vec![("load", PayloadValue::F64(0.5))],
            ));
        }
        let report = engine.fuse_tick();
        assert_eq!(report.rules_failed, 1);
        assert_eq!(report.rules_fired, 1);
        assert_eq!(metrics.get(names::FUSION_RULE_FAILURES), 1);
    }

    #[tokio::test]
    async fn test_pattern_cache_cap_enforced() {
        let config = FusionConfig {
            pattern_cache_cap: 3,
            ..Default::default()
        };
        let (engine, _bus, clock, _m) = engine_with(vec![], config);

        // Five distinct bursty topics -> five frequency patterns.
        for topic in ["a", "b", "c", "d", "e"] {
            for _ in 0..5 {
                engine.ingest(&live_event(&clock, topic, vec![]));
            }
        }
        engine.fuse_tick();
        assert!(engine.cached_pattern_count() <= 3);
    }

    #[tokio::test]
    async fn test_causal_chains_detected_and_capped() {
        let (engine, _bus, clock, _m) = engine_with(vec![], FusionConfig::default());
        // Three tightly spaced events sharing a tag via payload keys.
        for topic in ["alpha", "beta", "gamma"] {
            engine.ingest(&Arc::new(
                EventBuilder::new(topic)
                    .payload(payload(vec![("pressure", PayloadValue::F64(1.0))]))
                    .build(clock.now()),
            ));
        }
        engine.fuse_tick();
        let snapshot = engine.snapshot();
        assert!(
            !snapshot.chains.is_empty(),
            "expected a causal chain over shared payload-key tags"
        );
        assert!(snapshot.chains[0].confidence > 0.5);
    }

    #[tokio::test]
    async fn test_cleanup_expires_contexts() {
        let config = FusionConfig {
            context_ttl_ms: 0,
            ..Default::default()
        };
        let rules = super::super::rules::builtin_rules();
        let (engine, _bus, clock, _m) = engine_with(rules, config);
        for _ in 0..2 {
            engine.ingest(&live_event(
                &clock,
                "s1_ops_load",
                vec![("load", PayloadValue::F64(0.5))],
            ));
        }
        engine.fuse_tick();
        assert_eq!(engine.snapshot().contexts.len(), 1);

        // TTL of zero: the next cleanup drops everything older than now.
        std::thread::sleep(Duration::from_millis(2));
        engine.cleanup_tick();
        assert_eq!(engine.snapshot().contexts.len(), 0);
    }

    #[tokio::test]
    async fn test_fresh_patterns_drained_once() {
        let (engine, _bus, clock, _m) = engine_with(vec![], FusionConfig::default());
        for _ in 0..6 {
            engine.ingest(&live_event(&clock, "busy", vec![]));
        }
        engine.fuse_tick();
        let fresh = engine.drain_fresh_patterns();
        assert!(!fresh.is_empty());
        assert!(engine.drain_fresh_patterns().is_empty());
    }
}
