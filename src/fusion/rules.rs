//! Fusion rules: declarative mappings from sets of event topics plus a
//! time window to a derived semantic context.

use crate::models::{Event, PayloadValue};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// A derived context produced by one rule firing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FusedContext {
    pub context_type: String,
    pub fields: BTreeMap<String, PayloadValue>,
    pub source_event_ids: Vec<String>,
    pub created_at_ms: u64,
    /// Filled by context enrichment after detection passes.
    #[serde(default)]
    pub related_patterns: Vec<String>,
    #[serde(default)]
    pub related_chains: Vec<String>,
}

impl FusedContext {
    pub fn new(context_type: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            context_type: context_type.into(),
            fields: BTreeMap::new(),
            source_event_ids: Vec::new(),
            created_at_ms,
            related_patterns: Vec::new(),
            related_chains: Vec::new(),
        }
    }

    pub fn field(mut self, key: &str, value: PayloadValue) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

pub type FuseFn = Arc<dyn Fn(&[Arc<Event>]) -> FusedContext + Send + Sync>;

/// Static fusion rule: fires when at least two trigger events fall
/// inside the window.
#[derive(Clone)]
pub struct FusionRule {
    pub name: String,
    pub trigger_event_types: HashSet<String>,
    pub window_ms: u64,
    pub fuse_fn: FuseFn,
}

impl FusionRule {
    pub fn new(
        name: &str,
        topics: &[&str],
        window_ms: u64,
        fuse_fn: impl Fn(&[Arc<Event>]) -> FusedContext + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            trigger_event_types: topics.iter().map(|t| t.to_string()).collect(),
            window_ms: window_ms.max(1),
            fuse_fn: Arc::new(fuse_fn),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.trigger_event_types.contains(&event.topic)
    }
}

impl std::fmt::Debug for FusionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionRule")
            .field("name", &self.name)
            .field("triggers", &self.trigger_event_types)
            .field("window_ms", &self.window_ms)
            .finish()
    }
}

fn numeric_fields(events: &[Arc<Event>]) -> BTreeMap<String, Vec<f64>> {
    let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for event in events {
        if let PayloadValue::Map(map) = &event.payload {
            for (key, value) in map {
                if let Some(v) = value.as_f64() {
                    samples.entry(key.clone()).or_default().push(v);
                }
            }
        }
    }
    samples
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn base_context(context_type: &str, events: &[Arc<Event>]) -> FusedContext {
    let created = events
        .iter()
        .map(|e| e.timestamp.physical_ms)
        .max()
        .unwrap_or(0);
    let mut ctx = FusedContext::new(context_type, created);
    ctx.source_event_ids = events.iter().map(|e| e.id.clone()).collect();
    ctx.fields.insert(
        "event_count".to_string(),
        PayloadValue::I64(events.len() as i64),
    );
    ctx
}

/// Built-in fusion rules for the VSM topic families.
pub fn builtin_rules() -> Vec<FusionRule> {
    vec![
        // Operational stress: S1 load readings fused with S3 control
        // interventions inside a ten-second window.
        FusionRule::new(
            "operational_stress",
            &["s1_ops_load", "s3_control_adjust"],
            10_000,
            |events| {
                let mut ctx = base_context("operational_stress", events);
                let samples = numeric_fields(events);
                if let Some(loads) = samples.get("load") {
                    ctx.fields
                        .insert("mean_load".to_string(), PayloadValue::F64(mean(loads)));
                    ctx.fields.insert(
                        "peak_load".to_string(),
                        PayloadValue::F64(loads.iter().cloned().fold(f64::MIN, f64::max)),
                    );
                }
                ctx.fields.insert(
                    "interventions".to_string(),
                    PayloadValue::I64(
                        events.iter().filter(|e| e.topic == "s3_control_adjust").count() as i64,
                    ),
                );
                ctx
            },
        ),
        // Environmental picture: external sensor readings over a
        // thirty-second window.
        FusionRule::new(
            "environmental_picture",
            &["sensor_reading", "sensor_temp", "sensor_pressure"],
            30_000,
            |events| {
                let mut ctx = base_context("environmental_picture", events);
                for (field, values) in numeric_fields(events) {
                    ctx.fields.insert(
                        format!("mean_{field}"),
                        PayloadValue::F64(mean(&values)),
                    );
                }
                let mut sources: Vec<String> = events
                    .iter()
                    .map(|e| e.metadata.source.clone())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                sources.sort();
                ctx.fields.insert(
                    "sources".to_string(),
                    PayloadValue::List(sources.into_iter().map(PayloadValue::Str).collect()),
                );
                ctx
            },
        ),
        // Failure cascade picture: component failures and recoveries
        // inside one minute.
        FusionRule::new(
            "failure_picture",
            &["component_failure", "component_recovered"],
            60_000,
            |events| {
                let mut ctx = base_context("failure_picture", events);
                let failures = events
                    .iter()
                    .filter(|e| e.topic == "component_failure")
                    .count();
                let recoveries = events
                    .iter()
                    .filter(|e| e.topic == "component_recovered")
                    .count();
                ctx.fields
                    .insert("failures".to_string(), PayloadValue::I64(failures as i64));
                ctx.fields.insert(
                    "recoveries".to_string(),
                    PayloadValue::I64(recoveries as i64),
                );
                ctx.fields.insert(
                    "net_degradation".to_string(),
                    PayloadValue::I64(failures as i64 - recoveries as i64),
                );
                ctx
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HlcTimestamp;
    use crate::models::{payload, EventBuilder};

    fn event(ms: u64, topic: &str, fields: Vec<(&str, PayloadValue)>) -> Arc<Event> {
        Arc::new(
            EventBuilder::new(topic)
                .payload(payload(fields))
                .source("test")
                .build(HlcTimestamp::new(ms, 0, "n")),
        )
    }

    #[test]
    fn test_rule_matches_topics() {
        let rules = builtin_rules();
        let stress = &rules[0];
        assert!(stress.matches(&event(1, "s1_ops_load", vec![])));
        assert!(!stress.matches(&event(1, "sensor_temp", vec![])));
    }

    #[test]
    fn test_operational_stress_fusion() {
        let rules = builtin_rules();
        let events = vec![
            event(1_000, "s1_ops_load", vec![("load", PayloadValue::F64(0.6))]),
            event(1_500, "s1_ops_load", vec![("load", PayloadValue::F64(0.8))]),
            event(2_000, "s3_control_adjust", vec![]),
        ];
        let ctx = (rules[0].fuse_fn)(&events);
        assert_eq!(ctx.context_type, "operational_stress");
        assert_eq!(ctx.source_event_ids.len(), 3);
        assert_eq!(ctx.created_at_ms, 2_000);
        assert_eq!(
            ctx.fields.get("mean_load").and_then(|v| v.as_f64()),
            Some(0.7)
        );
        assert_eq!(
            ctx.fields.get("interventions"),
            Some(&PayloadValue::I64(1))
        );
    }

    #[test]
    fn test_failure_picture_counts() {
        let rules = builtin_rules();
        let events = vec![
            event(1, "component_failure", vec![]),
            event(2, "component_failure", vec![]),
            event(3, "component_recovered", vec![]),
        ];
        let ctx = (rules[2].fuse_fn)(&events);
        assert_eq!(ctx.fields.get("failures"), Some(&PayloadValue::I64(2)));
        assert_eq!(
            ctx.fields.get("net_degradation"),
            Some(&PayloadValue::I64(1))
        );
    }
}
