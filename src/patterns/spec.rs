//! Pattern DSL: the declarative spec producers register, and the
//! match context evaluation hands back.

use crate::models::PayloadValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_threshold_window_ms() -> u64 {
    60_000
}

fn default_min_points() -> usize {
    5
}

fn default_trend_threshold() -> f64 {
    0.01
}

/// Comparison operator for threshold predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl CompareOp {
    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Gt => left > right,
            CompareOp::Lt => left < right,
            CompareOp::Gte => left >= right,
            CompareOp::Lte => left <= right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// Value predicate on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueSpec {
    Eq { value: PayloadValue },
    Gt { value: f64 },
    Lt { value: f64 },
    Gte { value: f64 },
    Lte { value: f64 },
    In { values: Vec<PayloadValue> },
    Regex { pattern: String },
    Contains { value: String },
    Range { min: f64, max: f64 },
}

/// A per-event condition used by `within` and `sequence`: an optional
/// topic filter plus field predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub conditions: BTreeMap<String, ValueSpec>,
}

/// The declarative pattern tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternSpec {
    Simple {
        conditions: BTreeMap<String, ValueSpec>,
    },
    And {
        children: Vec<PatternSpec>,
    },
    Or {
        children: Vec<PatternSpec>,
    },
    Not {
        child: Box<PatternSpec>,
    },
    Within {
        window_ms: u64,
        events: Vec<EventCondition>,
    },
    Sequence {
        events: Vec<EventCondition>,
        max_sequence_time_ms: u64,
    },
    Threshold {
        field: String,
        op: CompareOp,
        value: f64,
        count: usize,
        #[serde(default = "default_threshold_window_ms")]
        window_ms: u64,
    },
    Trend {
        field: String,
        direction: TrendDirection,
        window_ms: u64,
        #[serde(default = "default_min_points")]
        min_points: usize,
        #[serde(default = "default_trend_threshold")]
        threshold: f64,
    },
}

impl PatternSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PatternSpec::Simple { .. } => "simple",
            PatternSpec::And { .. } => "and",
            PatternSpec::Or { .. } => "or",
            PatternSpec::Not { .. } => "not",
            PatternSpec::Within { .. } => "within",
            PatternSpec::Sequence { .. } => "sequence",
            PatternSpec::Threshold { .. } => "threshold",
            PatternSpec::Trend { .. } => "trend",
        }
    }
}

/// Bindings captured during a successful evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MatchContext {
    /// Logical operator that produced this context, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// Captured field bindings and structured evaluation details.
    #[serde(default)]
    pub bindings: BTreeMap<String, PayloadValue>,
}

impl MatchContext {
    pub fn with_operator(operator: &str) -> Self {
        Self {
            operator: Some(operator.to_string()),
            bindings: BTreeMap::new(),
        }
    }

    pub fn bind(&mut self, key: impl Into<String>, value: PayloadValue) {
        self.bindings.insert(key.into(), value);
    }

    /// Union another context into this one. On key collisions the
    /// existing binding wins; operators concatenate left to right.
    pub fn merge(&mut self, other: MatchContext) {
        for (key, value) in other.bindings {
            self.bindings.entry(key).or_insert(value);
        }
        if let Some(op) = other.operator {
            self.operator = match self.operator.take() {
                Some(existing) if existing != op => Some(format!("{existing},{op}")),
                Some(existing) => Some(existing),
                None => Some(op),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_json_roundtrip() {
        let json = r#"{
            "kind": "and",
            "children": [
                {"kind": "simple", "conditions": {"temperature": {"op": "gt", "value": 90.0}}},
                {"kind": "threshold", "field": "load", "op": "gte", "value": 0.8, "count": 3}
            ]
        }"#;
        let spec: PatternSpec = serde_json::from_str(json).unwrap();
        match &spec {
            PatternSpec::And { children } => {
                assert_eq!(children.len(), 2);
                match &children[1] {
                    PatternSpec::Threshold { window_ms, .. } => {
                        assert_eq!(*window_ms, 60_000);
                    }
                    other => panic!("unexpected child: {other:?}"),
                }
            }
            other => panic!("unexpected spec: {other:?}"),
        }

        let rendered = serde_json::to_string(&spec).unwrap();
        let reparsed: PatternSpec = serde_json::from_str(&rendered).unwrap();
        assert_eq!(reparsed, spec);
    }

    #[test]
    fn test_context_merge_prefers_existing() {
        let mut a = MatchContext::default();
        a.bind("x", PayloadValue::I64(1));
        let mut b = MatchContext::with_operator("or");
        b.bind("x", PayloadValue::I64(2));
        b.bind("y", PayloadValue::I64(3));
        a.merge(b);
        assert_eq!(a.bindings.get("x"), Some(&PayloadValue::I64(1)));
        assert_eq!(a.bindings.get("y"), Some(&PayloadValue::I64(3)));
        assert_eq!(a.operator.as_deref(), Some("or"));
    }

    #[test]
    fn test_compare_op() {
        assert!(CompareOp::Gt.holds(2.0, 1.0));
        assert!(!CompareOp::Gt.holds(1.0, 1.0));
        assert!(CompareOp::Gte.holds(1.0, 1.0));
        assert!(CompareOp::Lte.holds(0.5, 1.0));
        assert!(CompareOp::Eq.holds(1.0, 1.0));
    }
}
