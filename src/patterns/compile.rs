//! Spec validation and lowering into an immutable evaluator tree.

use super::spec::{CompareOp, EventCondition, PatternSpec, TrendDirection, ValueSpec};
use regex::Regex;
use std::fmt;

#[derive(Debug)]
pub enum CompileError {
    InvalidSpec(String),
    RegexCompile { pattern: String, error: regex::Error },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSpec(reason) => write!(f, "invalid pattern spec: {reason}"),
            Self::RegexCompile { pattern, error } => {
                write!(f, "regex '{pattern}' failed to compile: {error}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// A value predicate with any regex pre-compiled.
#[derive(Debug, Clone)]
pub enum CompiledValueSpec {
    Eq(crate::models::PayloadValue),
    Gt(f64),
    Lt(f64),
    Gte(f64),
    Lte(f64),
    In(Vec<crate::models::PayloadValue>),
    Regex(Regex),
    Contains(String),
    Range { min: f64, max: f64 },
}

#[derive(Debug, Clone)]
pub struct CompiledEventCondition {
    pub topic: Option<String>,
    pub conditions: Vec<(String, CompiledValueSpec)>,
}

/// Lowered evaluator tree. Shape is fixed after compile.
#[derive(Debug, Clone)]
pub enum CompiledNode {
    Simple {
        conditions: Vec<(String, CompiledValueSpec)>,
    },
    And(Vec<CompiledNode>),
    Or(Vec<CompiledNode>),
    Not(Box<CompiledNode>),
    Within {
        window_ms: u64,
        conditions: Vec<CompiledEventCondition>,
    },
    Sequence {
        max_sequence_time_ms: u64,
        conditions: Vec<CompiledEventCondition>,
    },
    Threshold {
        field: String,
        op: CompareOp,
        value: f64,
        count: usize,
        window_ms: u64,
    },
    Trend {
        field: String,
        direction: TrendDirection,
        window_ms: u64,
        min_points: usize,
        threshold: f64,
    },
}

/// A compiled pattern: the evaluator tree plus the original spec for
/// introspection and serialization.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub spec: PatternSpec,
    pub node: CompiledNode,
}

impl CompiledPattern {
    pub fn kind_name(&self) -> &'static str {
        self.spec.kind_name()
    }
}

pub fn compile(spec: PatternSpec) -> Result<CompiledPattern, CompileError> {
    let node = lower(&spec)?;
    Ok(CompiledPattern { spec, node })
}

fn lower(spec: &PatternSpec) -> Result<CompiledNode, CompileError> {
    match spec {
        PatternSpec::Simple { conditions } => Ok(CompiledNode::Simple {
            conditions: lower_conditions(conditions)?,
        }),
        PatternSpec::And { children } => Ok(CompiledNode::And(
            children.iter().map(lower).collect::<Result<_, _>>()?,
        )),
        PatternSpec::Or { children } => {
            if children.is_empty() {
                return Err(CompileError::InvalidSpec(
                    "or requires at least one child".into(),
                ));
            }
            Ok(CompiledNode::Or(
                children.iter().map(lower).collect::<Result<_, _>>()?,
            ))
        }
        PatternSpec::Not { child } => Ok(CompiledNode::Not(Box::new(lower(child)?))),
        PatternSpec::Within { window_ms, events } => {
            if *window_ms == 0 {
                return Err(CompileError::InvalidSpec("within window must be positive".into()));
            }
            if events.is_empty() {
                return Err(CompileError::InvalidSpec(
                    "within requires at least one event condition".into(),
                ));
            }
            Ok(CompiledNode::Within {
                window_ms: *window_ms,
                conditions: lower_event_conditions(events)?,
            })
        }
        PatternSpec::Sequence {
            events,
            max_sequence_time_ms,
        } => {
            if events.len() < 2 {
                return Err(CompileError::InvalidSpec(
                    "sequence requires at least two event conditions".into(),
                ));
            }
            if *max_sequence_time_ms == 0 {
                return Err(CompileError::InvalidSpec(
                    "sequence max_sequence_time_ms must be positive".into(),
                ));
            }
            Ok(CompiledNode::Sequence {
                max_sequence_time_ms: *max_sequence_time_ms,
                conditions: lower_event_conditions(events)?,
            })
        }
        PatternSpec::Threshold {
            field,
            op,
            value,
            count,
            window_ms,
        } => {
            if field.is_empty() {
                return Err(CompileError::InvalidSpec("threshold field is empty".into()));
            }
            if *window_ms == 0 {
                return Err(CompileError::InvalidSpec(
                    "threshold window must be positive".into(),
                ));
            }
            Ok(CompiledNode::Threshold {
                field: field.clone(),
                op: *op,
                value: *value,
                count: *count,
                window_ms: *window_ms,
            })
        }
        PatternSpec::Trend {
            field,
            direction,
            window_ms,
            min_points,
            threshold,
        } => {
            if field.is_empty() {
                return Err(CompileError::InvalidSpec("trend field is empty".into()));
            }
            if *window_ms == 0 {
                return Err(CompileError::InvalidSpec("trend window must be positive".into()));
            }
            if *min_points < 2 {
                return Err(CompileError::InvalidSpec(
                    "trend min_points must be at least 2".into(),
                ));
            }
            if *threshold < 0.0 {
                return Err(CompileError::InvalidSpec(
                    "trend threshold must be non-negative".into(),
                ));
            }
            Ok(CompiledNode::Trend {
                field: field.clone(),
                direction: *direction,
                window_ms: *window_ms,
                min_points: *min_points,
                threshold: *threshold,
            })
        }
    }
}

fn lower_conditions(
    conditions: &std::collections::BTreeMap<String, ValueSpec>,
) -> Result<Vec<(String, CompiledValueSpec)>, CompileError> {
    conditions
        .iter()
        .map(|(field, spec)| {
            if field.is_empty() {
                return Err(CompileError::InvalidSpec("empty field path".into()));
            }
            Ok((field.clone(), lower_value_spec(spec)?))
        })
        .collect()
}

fn lower_event_conditions(
    events: &[EventCondition],
) -> Result<Vec<CompiledEventCondition>, CompileError> {
    events
        .iter()
        .map(|cond| {
            Ok(CompiledEventCondition {
                topic: cond.topic.clone(),
                conditions: lower_conditions(&cond.conditions)?,
            })
        })
        .collect()
}

fn lower_value_spec(spec: &ValueSpec) -> Result<CompiledValueSpec, CompileError> {
    Ok(match spec {
        ValueSpec::Eq { value } => CompiledValueSpec::Eq(value.clone()),
        ValueSpec::Gt { value } => CompiledValueSpec::Gt(*value),
        ValueSpec::Lt { value } => CompiledValueSpec::Lt(*value),
        ValueSpec::Gte { value } => CompiledValueSpec::Gte(*value),
        ValueSpec::Lte { value } => CompiledValueSpec::Lte(*value),
        ValueSpec::In { values } => {
            if values.is_empty() {
                return Err(CompileError::InvalidSpec("in() list is empty".into()));
            }
            CompiledValueSpec::In(values.clone())
        }
        ValueSpec::Regex { pattern } => {
            let regex = Regex::new(pattern).map_err(|error| CompileError::RegexCompile {
                pattern: pattern.clone(),
                error,
            })?;
            CompiledValueSpec::Regex(regex)
        }
        ValueSpec::Contains { value } => CompiledValueSpec::Contains(value.clone()),
        ValueSpec::Range { min, max } => {
            if min > max {
                return Err(CompileError::InvalidSpec(format!(
                    "range min {min} exceeds max {max}"
                )));
            }
            CompiledValueSpec::Range {
                min: *min,
                max: *max,
            }
        }
    })
}
