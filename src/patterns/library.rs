//! Built-in domain pattern libraries and their algedonic couplings.

use super::registry::{AlgedonicMapping, Severity, Urgency};
use super::spec::{CompareOp, EventCondition, PatternSpec, TrendDirection, ValueSpec};
use std::collections::BTreeMap;

/// A loadable pattern definition.
#[derive(Debug, Clone)]
pub struct PatternDefinition {
    pub name: String,
    pub severity: Severity,
    pub spec: PatternSpec,
    pub mapping: Option<AlgedonicMapping>,
    pub aliases: Vec<String>,
}

fn conditions(pairs: Vec<(&str, ValueSpec)>) -> BTreeMap<String, ValueSpec> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn topic_event(topic: &str) -> EventCondition {
    EventCondition {
        topic: Some(topic.to_string()),
        conditions: BTreeMap::new(),
    }
}

/// Critical patterns, auto-activated on load.
pub fn critical_patterns() -> Vec<PatternDefinition> {
    vec![
        PatternDefinition {
            name: "variety_overflow".to_string(),
            severity: Severity::Critical,
            spec: PatternSpec::Simple {
                conditions: conditions(vec![(
                    "variety_pressure",
                    ValueSpec::Gte { value: 0.8 },
                )]),
            },
            mapping: Some(AlgedonicMapping {
                pain_level: 0.95,
                urgency: Urgency::Critical,
                bypass_hierarchy: true,
                target: "s5".to_string(),
            }),
            aliases: vec!["system_overload".to_string()],
        },
        PatternDefinition {
            name: "persistence_failure".to_string(),
            severity: Severity::Critical,
            spec: PatternSpec::Simple {
                conditions: conditions(vec![
                    (
                        "topic",
                        ValueSpec::Eq {
                            value: crate::models::PayloadValue::Str(
                                "index_persist_failed".to_string(),
                            ),
                        },
                    ),
                ]),
            },
            mapping: Some(AlgedonicMapping {
                pain_level: 0.85,
                urgency: Urgency::High,
                bypass_hierarchy: true,
                target: "s3".to_string(),
            }),
            aliases: vec![],
        },
        PatternDefinition {
            name: "cascade_failure".to_string(),
            severity: Severity::Critical,
            spec: PatternSpec::Sequence {
                events: vec![
                    topic_event("component_failure"),
                    topic_event("component_failure"),
                    topic_event("component_failure"),
                ],
                max_sequence_time_ms: 10_000,
            },
            mapping: Some(AlgedonicMapping {
                pain_level: 1.0,
                urgency: Urgency::Critical,
                bypass_hierarchy: true,
                target: "s5".to_string(),
            }),
            aliases: vec![],
        },
    ]
}

/// Named domain libraries. Unknown domains load nothing.
pub fn domain_patterns(domain: &str) -> Vec<PatternDefinition> {
    match domain {
        "operations" => operations_patterns(),
        "coordination" => coordination_patterns(),
        "intelligence" => intelligence_patterns(),
        _ => Vec::new(),
    }
}

fn operations_patterns() -> Vec<PatternDefinition> {
    vec![
        PatternDefinition {
            name: "thermal_runaway".to_string(),
            severity: Severity::High,
            spec: PatternSpec::Trend {
                field: "temperature".to_string(),
                direction: TrendDirection::Increasing,
                window_ms: 120_000,
                min_points: 5,
                threshold: 0.05,
            },
            mapping: Some(AlgedonicMapping {
                pain_level: 0.7,
                urgency: Urgency::High,
                bypass_hierarchy: false,
                target: "s3".to_string(),
            }),
            aliases: vec![],
        },
        PatternDefinition {
            name: "resource_exhaustion".to_string(),
            severity: Severity::High,
            spec: PatternSpec::Threshold {
                field: "utilization".to_string(),
                op: CompareOp::Gte,
                value: 0.95,
                count: 5,
                window_ms: 60_000,
            },
            mapping: Some(AlgedonicMapping {
                pain_level: 0.6,
                urgency: Urgency::Medium,
                bypass_hierarchy: false,
                target: "s3".to_string(),
            }),
            aliases: vec![],
        },
        PatternDefinition {
            name: "operational_recovery".to_string(),
            severity: Severity::Medium,
            spec: PatternSpec::Sequence {
                events: vec![topic_event("component_failure"), topic_event("component_recovered")],
                max_sequence_time_ms: 60_000,
            },
            mapping: None,
            aliases: vec![],
        },
    ]
}

fn coordination_patterns() -> Vec<PatternDefinition> {
    vec![
        PatternDefinition {
            name: "oscillation".to_string(),
            severity: Severity::Medium,
            spec: PatternSpec::Within {
                window_ms: 30_000,
                events: vec![topic_event("s2_damping_applied"), topic_event("s2_damping_released")],
            },
            mapping: None,
            aliases: vec![],
        },
        PatternDefinition {
            name: "coordination_gap".to_string(),
            severity: Severity::Medium,
            spec: PatternSpec::And {
                children: vec![
                    PatternSpec::Simple {
                        conditions: conditions(vec![(
                            "metadata.subsystem",
                            ValueSpec::In {
                                values: vec![
                                    crate::models::PayloadValue::Str("s1".to_string()),
                                    crate::models::PayloadValue::Str("s2".to_string()),
                                ],
                            },
                        )]),
                    },
                    PatternSpec::Simple {
                        conditions: conditions(vec![("conflict", ValueSpec::Eq {
                            value: crate::models::PayloadValue::Bool(true),
                        })]),
                    },
                ],
            },
            mapping: None,
            aliases: vec![],
        },
    ]
}

fn intelligence_patterns() -> Vec<PatternDefinition> {
    vec![PatternDefinition {
        name: "environmental_shift".to_string(),
        severity: Severity::High,
        spec: PatternSpec::Or {
            children: vec![
                PatternSpec::Trend {
                    field: "external_signal".to_string(),
                    direction: TrendDirection::Increasing,
                    window_ms: 300_000,
                    min_points: 10,
                    threshold: 0.1,
                },
                PatternSpec::Trend {
                    field: "external_signal".to_string(),
                    direction: TrendDirection::Decreasing,
                    window_ms: 300_000,
                    min_points: 10,
                    threshold: 0.1,
                },
            ],
        },
        mapping: None,
        aliases: vec![],
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::compile::compile;

    #[test]
    fn test_all_library_patterns_compile() {
        let mut all = critical_patterns();
        for domain in ["operations", "coordination", "intelligence"] {
            all.extend(domain_patterns(domain));
        }
        assert!(!all.is_empty());
        for def in all {
            compile(def.spec).unwrap_or_else(|e| panic!("{} failed: {e}", def.name));
        }
    }

    #[test]
    fn test_unknown_domain_is_empty() {
        assert!(domain_patterns("nope").is_empty());
    }

    #[test]
    fn test_variety_overflow_carries_alias() {
        let critical = critical_patterns();
        let overflow = critical
            .iter()
            .find(|d| d.name == "variety_overflow")
            .unwrap();
        assert_eq!(overflow.aliases, vec!["system_overload".to_string()]);
        assert!(overflow.mapping.as_ref().unwrap().bypass_hierarchy);
    }
}
