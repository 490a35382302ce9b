//! Pattern evaluation against live events.
//!
//! Logical nodes evaluate on the event alone; temporal and statistical
//! nodes consult the event store over their window. A failure inside
//! one pattern never escapes: the evaluator logs, counts, and reports
//! no-match.

use super::compile::{CompiledEventCondition, CompiledNode, CompiledPattern, CompiledValueSpec};
use super::spec::MatchContext;
use super::temporal;
use crate::metrics::{names, Metrics};
use crate::models::{Event, PayloadValue};
use crate::store::EventStore;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Result of matching one pattern against one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Match(MatchContext),
    NoMatch,
}

impl Outcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Outcome::Match(_))
    }

    pub fn context(self) -> Option<MatchContext> {
        match self {
            Outcome::Match(ctx) => Some(ctx),
            Outcome::NoMatch => None,
        }
    }
}

/// Internal evaluation failure, surfaced to callers as NoMatch.
#[derive(Debug)]
pub enum EvalError {
    Temporal(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Temporal(reason) => write!(f, "temporal evaluation failed: {reason}"),
        }
    }
}

pub struct PatternEvaluator {
    store: Arc<EventStore>,
    metrics: Metrics,
}

impl PatternEvaluator {
    pub fn new(store: Arc<EventStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Match a compiled pattern against an event. Errors are isolated:
    /// logged with a counter increment, reported as NoMatch.
    pub fn evaluate(&self, pattern: &CompiledPattern, event: &Event) -> Outcome {
        match self.eval_node(&pattern.node, event) {
            Ok(Some(ctx)) => Outcome::Match(ctx),
            Ok(None) => Outcome::NoMatch,
            Err(error) => {
                self.metrics.increment(names::PATTERN_EVAL_ERRORS);
                warn!(kind = pattern.kind_name(), %error, "pattern evaluation error");
                Outcome::NoMatch
            }
        }
    }

    fn eval_node(
        &self,
        node: &CompiledNode,
        event: &Event,
    ) -> Result<Option<MatchContext>, EvalError> {
        match node {
            CompiledNode::Simple { conditions } => Ok(eval_simple(conditions, event)),
            CompiledNode::And(children) => {
                // Short-circuit; merged context is the union of all
                // child contexts. Empty and[] is vacuously true.
                let mut merged = MatchContext::with_operator("and");
                for child in children {
                    match self.eval_node(child, event)? {
                        Some(ctx) => merged.merge(ctx),
                        None => return Ok(None),
                    }
                }
                Ok(Some(merged))
            }
            CompiledNode::Or(children) => {
                // Context is the union of matched children only.
                let mut merged = MatchContext::with_operator("or");
                let mut any = false;
                for child in children {
                    if let Some(ctx) = self.eval_node(child, event)? {
                        merged.merge(ctx);
                        any = true;
                    }
                }
                Ok(any.then_some(merged))
            }
            CompiledNode::Not(child) => match self.eval_node(child, event)? {
                Some(_) => Ok(None),
                None => Ok(Some(MatchContext::with_operator("not"))),
            },
            CompiledNode::Within {
                window_ms,
                conditions,
            } => temporal::eval_within(&self.store, event, *window_ms, conditions),
            CompiledNode::Sequence {
                max_sequence_time_ms,
                conditions,
            } => temporal::eval_sequence(&self.store, event, *max_sequence_time_ms, conditions),
            CompiledNode::Threshold {
                field,
                op,
                value,
                count,
                window_ms,
            } => temporal::eval_threshold(&self.store, event, field, *op, *value, *count, *window_ms),
            CompiledNode::Trend {
                field,
                direction,
                window_ms,
                min_points,
                threshold,
            } => temporal::eval_trend(
                &self.store,
                event,
                field,
                *direction,
                *window_ms,
                *min_points,
                *threshold,
            ),
        }
    }
}

/// All (field, value spec) pairs must hold. Missing field is no-match.
/// Matched field values are captured as bindings.
pub(super) fn eval_simple(
    conditions: &[(String, CompiledValueSpec)],
    event: &Event,
) -> Option<MatchContext> {
    let mut ctx = MatchContext::default();
    for (field, spec) in conditions {
        let value = event.field(field)?;
        if !value_matches(spec, &value) {
            return None;
        }
        ctx.bind(field.clone(), value);
    }
    Some(ctx)
}

/// Whether an event satisfies a per-event condition (topic + fields).
pub(super) fn event_condition_matches(cond: &CompiledEventCondition, event: &Event) -> bool {
    if let Some(topic) = &cond.topic {
        if &event.topic != topic {
            return false;
        }
    }
    eval_simple(&cond.conditions, event).is_some()
}

/// Value predicate semantics. Type mismatches yield false, not errors.
pub(super) fn value_matches(spec: &CompiledValueSpec, value: &PayloadValue) -> bool {
    match spec {
        CompiledValueSpec::Eq(expected) => value.loosely_equals(expected),
        CompiledValueSpec::Gt(rhs) => value.as_f64().map(|v| v > *rhs).unwrap_or(false),
        CompiledValueSpec::Lt(rhs) => value.as_f64().map(|v| v < *rhs).unwrap_or(false),
        CompiledValueSpec::Gte(rhs) => value.as_f64().map(|v| v >= *rhs).unwrap_or(false),
        CompiledValueSpec::Lte(rhs) => value.as_f64().map(|v| v <= *rhs).unwrap_or(false),
        CompiledValueSpec::In(allowed) => allowed.iter().any(|a| value.loosely_equals(a)),
        CompiledValueSpec::Regex(regex) => {
            value.as_str().map(|s| regex.is_match(s)).unwrap_or(false)
        }
        CompiledValueSpec::Contains(needle) => value
            .as_str()
            .map(|s| s.contains(needle.as_str()))
            .unwrap_or(false),
        CompiledValueSpec::Range { min, max } => value
            .as_f64()
            .map(|v| v >= *min && v <= *max)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::metrics::new_metrics;
    use crate::models::{payload, EventBuilder};
    use crate::patterns::spec::{PatternSpec, ValueSpec};
    use crate::patterns::compile::compile;
    use std::collections::BTreeMap;

    fn evaluator() -> (PatternEvaluator, Clock) {
        let (evaluator, clock, _) = evaluator_with_metrics();
        (evaluator, clock)
    }

    fn evaluator_with_metrics() -> (PatternEvaluator, Clock, Metrics) {
        let metrics = new_metrics();
        let store = EventStore::new(3_600_000, 10_000, metrics.clone());
        (
            PatternEvaluator::new(store, metrics.clone()),
            Clock::new("n"),
            metrics,
        )
    }

    fn simple_spec(pairs: Vec<(&str, ValueSpec)>) -> PatternSpec {
        PatternSpec::Simple {
            conditions: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn temp_event(clock: &Clock, temp: f64) -> Event {
        EventBuilder::new("sensor_temp")
            .payload(payload(vec![
                ("temperature", PayloadValue::F64(temp)),
                ("unit", PayloadValue::Str("celsius".into())),
            ]))
            .build(clock.now())
    }

    #[test]
    fn test_simple_match_and_bindings() {
        let (evaluator, clock) = evaluator();
        let pattern = compile(simple_spec(vec![(
            "temperature",
            ValueSpec::Gt { value: 90.0 },
        )]))
        .unwrap();

        let outcome = evaluator.evaluate(&pattern, &temp_event(&clock, 95.0));
        let ctx = outcome.context().unwrap();
        assert_eq!(
            ctx.bindings.get("temperature"),
            Some(&PayloadValue::F64(95.0))
        );

        assert!(!evaluator
            .evaluate(&pattern, &temp_event(&clock, 85.0))
            .is_match());
    }

    #[test]
    fn test_missing_field_is_no_match() {
        let (evaluator, clock) = evaluator();
        let pattern = compile(simple_spec(vec![(
            "pressure",
            ValueSpec::Gt { value: 1.0 },
        )]))
        .unwrap();
        assert!(!evaluator
            .evaluate(&pattern, &temp_event(&clock, 95.0))
            .is_match());
    }

    #[test]
    fn test_type_mismatch_is_no_match_not_error() {
        let (evaluator, clock, metrics) = evaluator_with_metrics();
        // Numeric comparison on a string field: no match, no error count.
        let pattern = compile(simple_spec(vec![("unit", ValueSpec::Gt { value: 1.0 })])).unwrap();
        assert!(!evaluator
            .evaluate(&pattern, &temp_event(&clock, 95.0))
            .is_match());
        assert_eq!(metrics.get(names::PATTERN_EVAL_ERRORS), 0);
    }

    #[test]
    fn test_and_semantics() {
        let (evaluator, clock) = evaluator();
        let both = compile(PatternSpec::And {
            children: vec![
                simple_spec(vec![("temperature", ValueSpec::Gt { value: 90.0 })]),
                simple_spec(vec![(
                    "unit",
                    ValueSpec::Eq {
                        value: PayloadValue::Str("celsius".into()),
                    },
                )]),
            ],
        })
        .unwrap();
        let ctx = evaluator
            .evaluate(&both, &temp_event(&clock, 95.0))
            .context()
            .unwrap();
        assert_eq!(ctx.operator.as_deref(), Some("and"));
        assert_eq!(ctx.bindings.len(), 2);

        // Empty and[] is vacuously true.
        let empty = compile(PatternSpec::And { children: vec![] }).unwrap();
        assert!(evaluator
            .evaluate(&empty, &temp_event(&clock, 10.0))
            .is_match());
    }

    #[test]
    fn test_or_context_only_from_matched() {
        let (evaluator, clock) = evaluator();
        let either = compile(PatternSpec::Or {
            children: vec![
                simple_spec(vec![("temperature", ValueSpec::Gt { value: 90.0 })]),
                simple_spec(vec![("missing", ValueSpec::Gt { value: 0.0 })]),
            ],
        })
        .unwrap();
        let ctx = evaluator
            .evaluate(&either, &temp_event(&clock, 95.0))
            .context()
            .unwrap();
        assert!(ctx.bindings.contains_key("temperature"));
        assert!(!ctx.bindings.contains_key("missing"));
    }

    #[test]
    fn test_not_inverts() {
        let (evaluator, clock) = evaluator();
        let pattern = compile(PatternSpec::Not {
            child: Box::new(simple_spec(vec![(
                "temperature",
                ValueSpec::Gt { value: 90.0 },
            )])),
        })
        .unwrap();
        assert!(!evaluator
            .evaluate(&pattern, &temp_event(&clock, 95.0))
            .is_match());
        let ctx = evaluator
            .evaluate(&pattern, &temp_event(&clock, 50.0))
            .context()
            .unwrap();
        assert_eq!(ctx.operator.as_deref(), Some("not"));
    }

    #[test]
    fn test_regex_and_in_and_range() {
        let (evaluator, clock) = evaluator();
        let pattern = compile(simple_spec(vec![
            (
                "unit",
                ValueSpec::Regex {
                    pattern: "^cel".into(),
                },
            ),
            (
                "temperature",
                ValueSpec::Range {
                    min: 90.0,
                    max: 100.0,
                },
            ),
        ]))
        .unwrap();
        assert!(evaluator
            .evaluate(&pattern, &temp_event(&clock, 95.0))
            .is_match());

        let in_pattern = compile(simple_spec(vec![(
            "unit",
            ValueSpec::In {
                values: vec![
                    PayloadValue::Str("kelvin".into()),
                    PayloadValue::Str("celsius".into()),
                ],
            },
        )]))
        .unwrap();
        assert!(evaluator
            .evaluate(&in_pattern, &temp_event(&clock, 95.0))
            .is_match());
    }
}
