//! Temporal and statistical predicates over event store windows.
//!
//! All predicates anchor their window at the triggering event's
//! physical time; the triggering event itself participates if the
//! store already holds it.

use super::compile::CompiledEventCondition;
use super::matcher::{event_condition_matches, EvalError};
use super::spec::{CompareOp, MatchContext, TrendDirection};
use crate::models::{Event, PayloadValue};
use crate::store::EventStore;
use std::sync::Arc;

/// `within`: every child condition must have at least one matching
/// event inside `[now - window, now]`.
pub(super) fn eval_within(
    store: &Arc<EventStore>,
    event: &Event,
    window_ms: u64,
    conditions: &[CompiledEventCondition],
) -> Result<Option<MatchContext>, EvalError> {
    let now_ms = event.timestamp.physical_ms;
    let window = store.events_in_physical_window(now_ms, window_ms, None);

    let mut counts = Vec::with_capacity(conditions.len());
    for cond in conditions {
        let hits = window
            .iter()
            .filter(|e| event_condition_matches(cond, e))
            .count();
        counts.push(hits);
    }

    let mut ctx = MatchContext::with_operator("within");
    ctx.bind("window_ms", PayloadValue::I64(window_ms as i64));
    ctx.bind(
        "condition_matches",
        PayloadValue::List(counts.iter().map(|c| PayloadValue::I64(*c as i64)).collect()),
    );

    if counts.iter().all(|&c| c >= 1) {
        Ok(Some(ctx))
    } else {
        Ok(None)
    }
}

/// `sequence`: find the earliest strictly-increasing chain of events
/// matching the conditions in order, with the whole chain inside
/// `max_sequence_time_ms` of its start.
pub(super) fn eval_sequence(
    store: &Arc<EventStore>,
    event: &Event,
    max_sequence_time_ms: u64,
    conditions: &[CompiledEventCondition],
) -> Result<Option<MatchContext>, EvalError> {
    let now_ms = event.timestamp.physical_ms;
    // Window is already HLC-sorted by the store's time index.
    let window = store.events_in_physical_window(now_ms, max_sequence_time_ms, None);

    let chain = find_earliest_chain(&window, conditions, max_sequence_time_ms);
    match chain {
        Some(chain) => {
            let mut ctx = MatchContext::with_operator("sequence");
            ctx.bind(
                "chain_event_ids",
                PayloadValue::List(
                    chain
                        .iter()
                        .map(|e| PayloadValue::Str(e.id.clone()))
                        .collect(),
                ),
            );
            let span = chain
                .last()
                .map(|l| l.timestamp.physical_ms - chain[0].timestamp.physical_ms)
                .unwrap_or(0);
            ctx.bind("sequence_span_ms", PayloadValue::I64(span as i64));
            Ok(Some(ctx))
        }
        None => Ok(None),
    }
}

/// Greedy earliest-chain search. Candidate starts are tried in HLC
/// order, so the first complete chain is the earliest-starting one.
fn find_earliest_chain<'a>(
    window: &'a [Arc<Event>],
    conditions: &[CompiledEventCondition],
    max_sequence_time_ms: u64,
) -> Option<Vec<&'a Arc<Event>>> {
    let first_cond = conditions.first()?;
    let starts = window
        .iter()
        .enumerate()
        .filter(|(_, e)| event_condition_matches(first_cond, e));

    'starts: for (start_idx, start) in starts {
        let deadline = start.timestamp.physical_ms + max_sequence_time_ms;
        let mut chain = vec![start];
        let mut cursor = start_idx;
        for cond in &conditions[1..] {
            let Some(last_ts) = chain.last().map(|l| l.timestamp.clone()) else {
                continue 'starts;
            };
            let next = window[cursor + 1..].iter().enumerate().find(|(_, e)| {
                e.timestamp > last_ts
                    && e.timestamp.physical_ms <= deadline
                    && event_condition_matches(cond, e)
            });
            match next {
                Some((offset, e)) => {
                    cursor += 1 + offset;
                    chain.push(e);
                }
                None => continue 'starts,
            }
        }
        return Some(chain);
    }
    None
}

/// `threshold`: count numeric samples of `field` in the window that
/// satisfy `(op, value)`; match iff count >= required. With no
/// extractable samples there is nothing to threshold: no match.
pub(super) fn eval_threshold(
    store: &Arc<EventStore>,
    event: &Event,
    field: &str,
    op: CompareOp,
    value: f64,
    required: usize,
    window_ms: u64,
) -> Result<Option<MatchContext>, EvalError> {
    let now_ms = event.timestamp.physical_ms;
    let window = store.events_in_physical_window(now_ms, window_ms, None);

    let samples: Vec<f64> = window
        .iter()
        .filter_map(|e| e.field(field).and_then(|v| v.as_f64()))
        .collect();
    if samples.is_empty() {
        return Ok(None);
    }

    let actual = samples.iter().filter(|&&v| op.holds(v, value)).count();

    let mut ctx = MatchContext::with_operator("threshold");
    ctx.bind("field", PayloadValue::Str(field.to_string()));
    ctx.bind("required_matches", PayloadValue::I64(required as i64));
    ctx.bind("actual_matches", PayloadValue::I64(actual as i64));
    ctx.bind("window_ms", PayloadValue::I64(window_ms as i64));

    if actual >= required {
        Ok(Some(ctx))
    } else {
        Ok(None)
    }
}

/// `trend`: ordinary least squares over `(ts, value)` samples. Slope
/// is per second; confidence is R².
pub(super) fn eval_trend(
    store: &Arc<EventStore>,
    event: &Event,
    field: &str,
    direction: TrendDirection,
    window_ms: u64,
    min_points: usize,
    threshold: f64,
) -> Result<Option<MatchContext>, EvalError> {
    let now_ms = event.timestamp.physical_ms;
    let window = store.events_in_physical_window(now_ms, window_ms, None);

    let series: Vec<(f64, f64)> = window
        .iter()
        .filter_map(|e| {
            e.field(field)
                .and_then(|v| v.as_f64())
                .map(|v| (e.timestamp.physical_ms as f64 / 1_000.0, v))
        })
        .collect();

    let mut ctx = MatchContext::with_operator("trend");
    ctx.bind("field", PayloadValue::Str(field.to_string()));
    ctx.bind("window_ms", PayloadValue::I64(window_ms as i64));
    ctx.bind("points", PayloadValue::I64(series.len() as i64));

    if series.len() < min_points {
        ctx.bind("insufficient_data", PayloadValue::Bool(true));
        return Ok(None);
    }

    let Some(fit) = least_squares(&series) else {
        // Degenerate series (zero time variance) has no slope.
        return Err(EvalError::Temporal(format!(
            "degenerate time series for field '{field}'"
        )));
    };

    ctx.bind("trend_slope", PayloadValue::F64(fit.slope));
    ctx.bind("r_squared", PayloadValue::F64(fit.r_squared));

    let holds = match direction {
        TrendDirection::Increasing => fit.slope > threshold,
        TrendDirection::Decreasing => fit.slope < -threshold,
        TrendDirection::Stable => fit.slope.abs() <= threshold,
    };

    if holds {
        Ok(Some(ctx))
    } else {
        Ok(None)
    }
}

pub(crate) struct LeastSquaresFit {
    pub(crate) slope: f64,
    pub(crate) r_squared: f64,
}

/// Shared by the trend predicate and the fusion trend detector.
pub(crate) fn least_squares(series: &[(f64, f64)]) -> Option<LeastSquaresFit> {
    let n = series.len() as f64;
    let mean_x = series.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = series.iter().map(|(_, y)| y).sum::<f64>() / n;

    let ss_xx: f64 = series.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if ss_xx == 0.0 {
        return None;
    }
    let ss_xy: f64 = series
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let ss_yy: f64 = series.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();

    let slope = ss_xy / ss_xx;
    // A flat series fits its own mean perfectly.
    let r_squared = if ss_yy == 0.0 {
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };

    Some(LeastSquaresFit { slope, r_squared })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HlcTimestamp;
    use crate::metrics::new_metrics;
    use crate::models::{payload, EventBuilder};
    use crate::patterns::compile::compile;
    use crate::patterns::matcher::PatternEvaluator;
    use crate::patterns::spec::{EventCondition, PatternSpec};
    use std::collections::BTreeMap;

    fn setup() -> (PatternEvaluator, Arc<EventStore>) {
        let metrics = new_metrics();
        let store = EventStore::new(3_600_000, 10_000, metrics.clone());
        (PatternEvaluator::new(store.clone(), metrics), store)
    }

    fn at(ms: u64, topic: &str, fields: Vec<(&str, PayloadValue)>) -> Arc<Event> {
        Arc::new(
            EventBuilder::new(topic)
                .payload(payload(fields))
                .tag("x")
                .build(HlcTimestamp::new(ms, 0, "n")),
        )
    }

    fn topic_cond(topic: &str) -> EventCondition {
        EventCondition {
            topic: Some(topic.to_string()),
            conditions: BTreeMap::new(),
        }
    }

    #[test]
    fn test_within_requires_every_child() {
        let (evaluator, store) = setup();
        store.append(at(1_000, "a", vec![]));
        store.append(at(1_200, "b", vec![]));
        let trigger = at(1_400, "b", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Within {
            window_ms: 1_000,
            events: vec![topic_cond("a"), topic_cond("b")],
        })
        .unwrap();
        assert!(evaluator.evaluate(&pattern, &trigger).is_match());

        let missing = compile(PatternSpec::Within {
            window_ms: 1_000,
            events: vec![topic_cond("a"), topic_cond("c")],
        })
        .unwrap();
        assert!(!evaluator.evaluate(&missing, &trigger).is_match());
    }

    #[test]
    fn test_within_window_excludes_old_events() {
        let (evaluator, store) = setup();
        store.append(at(100, "a", vec![]));
        let trigger = at(5_000, "b", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Within {
            window_ms: 1_000,
            events: vec![topic_cond("a")],
        })
        .unwrap();
        assert!(!evaluator.evaluate(&pattern, &trigger).is_match());
    }

    #[test]
    fn test_sequence_within_bound() {
        let (evaluator, store) = setup();
        store.append(at(0, "a", vec![]));
        store.append(at(200, "b", vec![]));
        let trigger = at(400, "c", vec![]);
        store.append(trigger.clone());

        let seq = |max_ms: u64| {
            compile(PatternSpec::Sequence {
                events: vec![topic_cond("a"), topic_cond("b"), topic_cond("c")],
                max_sequence_time_ms: max_ms,
            })
            .unwrap()
        };

        let outcome = evaluator.evaluate(&seq(1_000), &trigger);
        let ctx = outcome.context().unwrap();
        assert_eq!(
            ctx.bindings.get("sequence_span_ms"),
            Some(&PayloadValue::I64(400))
        );

        // Same events, tighter bound: 400ms span exceeds 300ms.
        assert!(!evaluator.evaluate(&seq(300), &trigger).is_match());
    }

    #[test]
    fn test_sequence_requires_order() {
        let (evaluator, store) = setup();
        store.append(at(0, "b", vec![]));
        store.append(at(200, "a", vec![]));
        let trigger = at(400, "probe", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Sequence {
            events: vec![topic_cond("a"), topic_cond("b")],
            max_sequence_time_ms: 1_000,
        })
        .unwrap();
        assert!(!evaluator.evaluate(&pattern, &trigger).is_match());
    }

    #[test]
    fn test_sequence_picks_earliest_chain() {
        let (evaluator, store) = setup();
        store.append(at(0, "a", vec![]));
        store.append(at(100, "a", vec![]));
        store.append(at(200, "b", vec![]));
        let trigger = at(300, "probe", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Sequence {
            events: vec![topic_cond("a"), topic_cond("b")],
            max_sequence_time_ms: 1_000,
        })
        .unwrap();
        let ctx = evaluator.evaluate(&pattern, &trigger).context().unwrap();
        // Chain starts at the earliest `a` (t=0), spanning 200ms.
        assert_eq!(
            ctx.bindings.get("sequence_span_ms"),
            Some(&PayloadValue::I64(200))
        );
    }

    #[test]
    fn test_threshold_counting() {
        let (evaluator, store) = setup();
        // 12 temperature readings, six exceed 90.
        for (idx, temp) in (85..97).enumerate() {
            store.append(at(
                1_000 + idx as u64 * 1_000,
                "sensor",
                vec![("temperature", PayloadValue::I64(temp))],
            ));
        }
        let trigger = at(13_000, "probe", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Threshold {
            field: "temperature".into(),
            op: CompareOp::Gt,
            value: 90.0,
            count: 5,
            window_ms: 60_000,
        })
        .unwrap();
        let ctx = evaluator.evaluate(&pattern, &trigger).context().unwrap();
        assert_eq!(
            ctx.bindings.get("actual_matches"),
            Some(&PayloadValue::I64(6))
        );
    }

    #[test]
    fn test_threshold_zero_count_matches_when_extractable() {
        let (evaluator, store) = setup();
        store.append(at(1_000, "sensor", vec![("v", PayloadValue::I64(1))]));
        let trigger = at(1_500, "probe", vec![]);
        store.append(trigger.clone());

        let zero = compile(PatternSpec::Threshold {
            field: "v".into(),
            op: CompareOp::Gt,
            value: 1_000.0,
            count: 0,
            window_ms: 60_000,
        })
        .unwrap();
        assert!(evaluator.evaluate(&zero, &trigger).is_match());

        // Field never present: nothing extractable, no match.
        let absent = compile(PatternSpec::Threshold {
            field: "missing".into(),
            op: CompareOp::Gt,
            value: 0.0,
            count: 0,
            window_ms: 60_000,
        })
        .unwrap();
        assert!(!evaluator.evaluate(&absent, &trigger).is_match());
    }

    #[test]
    fn test_trend_increasing() {
        let (evaluator, store) = setup();
        for i in 0..10u64 {
            store.append(at(
                i * 1_000,
                "sensor",
                vec![("load", PayloadValue::F64(i as f64 * 0.1))],
            ));
        }
        let trigger = at(9_500, "probe", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Trend {
            field: "load".into(),
            direction: TrendDirection::Increasing,
            window_ms: 60_000,
            min_points: 5,
            threshold: 0.01,
        })
        .unwrap();
        let ctx = evaluator.evaluate(&pattern, &trigger).context().unwrap();
        let slope = ctx.bindings.get("trend_slope").and_then(|v| v.as_f64()).unwrap();
        let r2 = ctx.bindings.get("r_squared").and_then(|v| v.as_f64()).unwrap();
        assert!(slope > 0.05, "slope {slope}");
        assert!(r2 > 0.99, "r² {r2}");

        let decreasing = compile(PatternSpec::Trend {
            field: "load".into(),
            direction: TrendDirection::Decreasing,
            window_ms: 60_000,
            min_points: 5,
            threshold: 0.01,
        })
        .unwrap();
        assert!(!evaluator.evaluate(&decreasing, &trigger).is_match());
    }

    #[test]
    fn test_trend_insufficient_data() {
        let (evaluator, store) = setup();
        store.append(at(1_000, "sensor", vec![("load", PayloadValue::F64(1.0))]));
        let trigger = at(1_100, "probe", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Trend {
            field: "load".into(),
            direction: TrendDirection::Increasing,
            window_ms: 60_000,
            min_points: 5,
            threshold: 0.01,
        })
        .unwrap();
        assert!(!evaluator.evaluate(&pattern, &trigger).is_match());
    }

    #[test]
    fn test_trend_stable_flat_series() {
        let (evaluator, store) = setup();
        for i in 0..6u64 {
            store.append(at(
                i * 1_000,
                "sensor",
                vec![("load", PayloadValue::F64(0.5))],
            ));
        }
        let trigger = at(5_500, "probe", vec![]);
        store.append(trigger.clone());

        let pattern = compile(PatternSpec::Trend {
            field: "load".into(),
            direction: TrendDirection::Stable,
            window_ms: 60_000,
            min_points: 5,
            threshold: 0.01,
        })
        .unwrap();
        let ctx = evaluator.evaluate(&pattern, &trigger).context().unwrap();
        assert_eq!(ctx.bindings.get("r_squared"), Some(&PayloadValue::F64(1.0)));
    }
}
