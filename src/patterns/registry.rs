//! Pattern registry: the library of active patterns, their stats, and
//! their algedonic couplings.
//!
//! Evaluation walks active patterns in severity order and returns the
//! matches in that order. Matches with a bound algedonic mapping emit
//! a signal, debounced per pattern.

use super::compile::{compile, CompileError, CompiledPattern};
use super::library::PatternDefinition;
use super::matcher::{Outcome, PatternEvaluator};
use super::spec::MatchContext;
use crate::algedonic::{AlgedonicChannel, AlgedonicSignal};
use crate::bus::EventBus;
use crate::clock::HlcTimestamp;
use crate::metrics::{names, HistogramSnapshot, LatencyHistogram, Metrics};
use crate::models::{payload, topics, EventBuilder, PayloadValue, Priority};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub use crate::algedonic::Urgency;

/// Minimum gap between algedonic firings of the same pattern.
const ALGEDONIC_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// How a matched pattern couples into the algedonic channel.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct AlgedonicMapping {
    /// Pain level in [0, 1]; the emitted signal has valence -pain.
    pub pain_level: f64,
    pub urgency: Urgency,
    pub bypass_hierarchy: bool,
    pub target: String,
}

/// A successful match, in registry evaluation order.
#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    pub pattern_name: String,
    pub pattern_kind: &'static str,
    pub severity: Severity,
    pub context: MatchContext,
    pub detected_at: HlcTimestamp,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatternStats {
    pub name: String,
    pub severity: Severity,
    pub active: bool,
    pub matches: u64,
    pub no_matches: u64,
    pub last_match: Option<HlcTimestamp>,
    pub eval_latency: HistogramSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub active: usize,
    pub patterns: Vec<PatternStats>,
}

struct Entry {
    severity: Severity,
    compiled: Arc<CompiledPattern>,
    mapping: Option<AlgedonicMapping>,
    active: bool,
    matches: u64,
    no_matches: u64,
    last_match: Option<HlcTimestamp>,
    latency: LatencyHistogram,
}

pub struct PatternRegistry {
    evaluator: PatternEvaluator,
    bus: Arc<EventBus>,
    algedonic: Arc<AlgedonicChannel>,
    metrics: Metrics,
    entries: RwLock<HashMap<String, Entry>>,
    aliases: RwLock<HashMap<String, String>>,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl PatternRegistry {
    pub fn new(
        evaluator: PatternEvaluator,
        bus: Arc<EventBus>,
        algedonic: Arc<AlgedonicChannel>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            evaluator,
            bus,
            algedonic,
            metrics,
            entries: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            last_fired: Mutex::new(HashMap::new()),
        })
    }

    /// Register a pattern definition. Critical patterns activate on
    /// load; everything else starts inactive.
    pub fn register(&self, def: PatternDefinition) -> Result<(), CompileError> {
        let compiled = Arc::new(compile(def.spec)?);
        let active = def.severity == Severity::Critical;
        let mut entries = self.entries.write();
        entries.insert(
            def.name.clone(),
            Entry {
                severity: def.severity,
                compiled,
                mapping: def.mapping,
                active,
                matches: 0,
                no_matches: 0,
                last_match: None,
                latency: LatencyHistogram::new(),
            },
        );
        drop(entries);

        let mut aliases = self.aliases.write();
        for alias in def.aliases {
            aliases.insert(alias, def.name.clone());
        }
        info!(name = %def.name, severity = ?def.severity, active, "pattern registered");
        Ok(())
    }

    /// Load every pattern in a named domain library.
    pub fn load_domain(&self, domain: &str) -> Result<usize, CompileError> {
        let defs = super::library::domain_patterns(domain);
        let count = defs.len();
        for def in defs {
            self.register(def)?;
        }
        Ok(count)
    }

    /// Load the critical pattern set (auto-activated).
    pub fn load_critical(&self) -> Result<usize, CompileError> {
        let defs = super::library::critical_patterns();
        let count = defs.len();
        for def in defs {
            self.register(def)?;
        }
        Ok(count)
    }

    fn resolve(&self, name: &str) -> String {
        self.aliases
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn activate(&self, name: &str) -> bool {
        let canonical = self.resolve(name);
        let mut entries = self.entries.write();
        match entries.get_mut(&canonical) {
            Some(entry) => {
                entry.active = true;
                debug!(name = %canonical, "pattern activated");
                true
            }
            None => false,
        }
    }

    pub fn deactivate(&self, name: &str) -> bool {
        let canonical = self.resolve(name);
        let mut entries = self.entries.write();
        match entries.get_mut(&canonical) {
            Some(entry) => {
                entry.active = false;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        let canonical = self.resolve(name);
        self.entries
            .read()
            .get(&canonical)
            .map(|e| e.active)
            .unwrap_or(false)
    }

    /// Evaluate all active patterns against an event, highest severity
    /// first. Returns matches in evaluation order.
    pub fn evaluate(&self, event: &crate::models::Event) -> Vec<PatternMatch> {
        // Snapshot the active set so evaluation runs without the lock.
        let active: Vec<(String, Severity, Arc<CompiledPattern>, Option<AlgedonicMapping>)> = {
            let entries = self.entries.read();
            let mut active: Vec<_> = entries
                .iter()
                .filter(|(_, e)| e.active)
                .map(|(name, e)| {
                    (
                        name.clone(),
                        e.severity,
                        e.compiled.clone(),
                        e.mapping.clone(),
                    )
                })
                .collect();
            active.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            active
        };

        let mut matches = Vec::new();
        for (name, severity, compiled, mapping) in active {
            let started = Instant::now();
            let outcome = self.evaluator.evaluate(&compiled, event);
            let elapsed_us = started.elapsed().as_micros() as u64;

            {
                let mut entries = self.entries.write();
                if let Some(entry) = entries.get_mut(&name) {
                    entry.latency.record(elapsed_us);
                    match &outcome {
                        Outcome::Match(_) => {
                            entry.matches += 1;
                            entry.last_match = Some(event.timestamp.clone());
                        }
                        Outcome::NoMatch => entry.no_matches += 1,
                    }
                }
            }

            if let Outcome::Match(context) = outcome {
                self.metrics.increment(names::PATTERN_MATCHES);
                let confidence = context
                    .bindings
                    .get("r_squared")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0);
                let matched = PatternMatch {
                    pattern_name: name.clone(),
                    pattern_kind: compiled.kind_name(),
                    severity,
                    context,
                    detected_at: event.timestamp.clone(),
                    confidence,
                };
                self.publish_match(&matched);
                if let Some(mapping) = mapping {
                    self.fire_algedonic(&name, &mapping, &matched);
                }
                matches.push(matched);
            }
        }
        matches
    }

    fn publish_match(&self, matched: &PatternMatch) {
        let context_value: PayloadValue = serde_json::to_value(&matched.context)
            .map(PayloadValue::from)
            .unwrap_or(PayloadValue::Null);
        self.bus.publish_draft(
            EventBuilder::new(topics::PATTERN_MATCH)
                .source("pattern_registry")
                .priority(match matched.severity {
                    Severity::Critical => Priority::Critical,
                    Severity::High => Priority::High,
                    _ => Priority::Normal,
                })
                .payload(payload(vec![
                    (
                        "pattern_name",
                        PayloadValue::Str(matched.pattern_name.clone()),
                    ),
                    (
                        "pattern_kind",
                        PayloadValue::Str(matched.pattern_kind.to_string()),
                    ),
                    ("context", context_value),
                    (
                        "detected_at",
                        PayloadValue::Str(matched.detected_at.to_string()),
                    ),
                    ("confidence", PayloadValue::F64(matched.confidence)),
                ])),
        );
    }

    fn fire_algedonic(&self, name: &str, mapping: &AlgedonicMapping, matched: &PatternMatch) {
        {
            let mut last_fired = self.last_fired.lock();
            let now = Instant::now();
            if let Some(last) = last_fired.get(name) {
                if now.duration_since(*last) < ALGEDONIC_DEBOUNCE {
                    self.metrics.increment(names::ALGEDONIC_DEBOUNCED);
                    return;
                }
            }
            last_fired.insert(name.to_string(), now);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "pattern_name".to_string(),
            PayloadValue::Str(name.to_string()),
        );
        metadata.insert(
            "confidence".to_string(),
            PayloadValue::F64(matched.confidence),
        );

        self.algedonic.emit(AlgedonicSignal {
            valence: -mapping.pain_level.clamp(0.0, 1.0),
            intensity: mapping.pain_level.clamp(0.0, 1.0),
            source: format!("pattern:{name}"),
            subsystem: crate::models::Subsystem::S4Intelligence,
            urgency: mapping.urgency,
            bypass_hierarchy: mapping.bypass_hierarchy,
            target: mapping.target.clone(),
            metadata,
            timestamp: matched.detected_at.clone(),
        });
    }

    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.read();
        let mut patterns: Vec<PatternStats> = entries
            .iter()
            .map(|(name, entry)| PatternStats {
                name: name.clone(),
                severity: entry.severity,
                active: entry.active,
                matches: entry.matches,
                no_matches: entry.no_matches,
                last_match: entry.last_match.clone(),
                eval_latency: entry.latency.snapshot(),
            })
            .collect();
        patterns.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.name.cmp(&b.name)));
        RegistryStats {
            registered: entries.len(),
            active: entries.values().filter(|e| e.active).count(),
            patterns,
        }
    }
}
