//! Pattern detectors run by the fusion engine on each tick.
//!
//! Detectors are pure functions over the current enriched window:
//! frequency bursts, repeated sequences, topic correlation, numeric
//! anomalies, trends, and periodicity. Detected patterns feed the
//! pattern cache and the vector index.

use crate::models::{payload, Event, PayloadValue};
use crate::patterns::temporal::least_squares;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Dimension of the feature-hash embedding used for indexing patterns.
pub const PATTERN_VECTOR_DIM: usize = 32;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectedPattern {
    pub id: String,
    pub pattern_type: String,
    /// Topic the pattern is anchored to, when there is one.
    pub topic: Option<String>,
    pub body: PayloadValue,
    pub detected_at_ms: u64,
    pub confidence: f64,
}

impl DetectedPattern {
    fn new(
        pattern_type: &str,
        topic: Option<String>,
        body: PayloadValue,
        detected_at_ms: u64,
        confidence: f64,
    ) -> Self {
        // Deterministic id over type + anchor so re-detections of the
        // same phenomenon collapse into one cache entry.
        let mut hasher = Sha256::new();
        hasher.update(pattern_type.as_bytes());
        if let Some(topic) = &topic {
            hasher.update(topic.as_bytes());
        }
        let id = hex::encode(&hasher.finalize()[..8]);
        Self {
            id,
            pattern_type: pattern_type.to_string(),
            topic,
            body,
            detected_at_ms,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Run every detector over the window. Events must be HLC-sorted.
pub fn detect_all(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut patterns = Vec::new();
    patterns.extend(detect_frequency(events, now_ms));
    patterns.extend(detect_sequence(events, now_ms));
    patterns.extend(detect_correlation(events, now_ms));
    patterns.extend(detect_anomaly(events, now_ms));
    patterns.extend(detect_trend(events, now_ms));
    patterns.extend(detect_periodic(events, now_ms));
    patterns
}

/// Bursts: topics with at least five events in the window.
fn detect_frequency(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for event in events {
        *counts.entry(event.topic.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count >= 5)
        .map(|(topic, count)| {
            DetectedPattern::new(
                "frequency",
                Some(topic.to_string()),
                payload(vec![("count", PayloadValue::I64(count as i64))]),
                now_ms,
                (count as f64 / 20.0).min(1.0),
            )
        })
        .collect()
}

/// Repeated bigrams: topic A immediately followed by topic B at least
/// three times.
fn detect_sequence(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut bigrams: HashMap<(String, String), usize> = HashMap::new();
    for pair in events.windows(2) {
        if pair[0].topic != pair[1].topic {
            *bigrams
                .entry((pair[0].topic.clone(), pair[1].topic.clone()))
                .or_default() += 1;
        }
    }
    bigrams
        .into_iter()
        .filter(|(_, count)| *count >= 3)
        .map(|((from, to), count)| {
            DetectedPattern::new(
                "sequence",
                Some(format!("{from}>{to}")),
                payload(vec![
                    ("from", PayloadValue::Str(from)),
                    ("to", PayloadValue::Str(to)),
                    ("occurrences", PayloadValue::I64(count as i64)),
                ]),
                now_ms,
                (count as f64 / 10.0).min(1.0),
            )
        })
        .collect()
}

/// Co-occurrence: distinct topic pairs landing within one second of
/// each other at least three times.
fn detect_correlation(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut pairs: HashMap<(String, String), usize> = HashMap::new();
    for (i, a) in events.iter().enumerate() {
        for b in events[i + 1..].iter() {
            let gap = b.timestamp.physical_ms.saturating_sub(a.timestamp.physical_ms);
            if gap > 1_000 {
                break;
            }
            if a.topic == b.topic {
                continue;
            }
            let key = if a.topic < b.topic {
                (a.topic.clone(), b.topic.clone())
            } else {
                (b.topic.clone(), a.topic.clone())
            };
            *pairs.entry(key).or_default() += 1;
        }
    }
    pairs
        .into_iter()
        .filter(|(_, count)| *count >= 3)
        .map(|((a, b), count)| {
            DetectedPattern::new(
                "correlation",
                Some(format!("{a}+{b}")),
                payload(vec![
                    ("topic_a", PayloadValue::Str(a)),
                    ("topic_b", PayloadValue::Str(b)),
                    ("co_occurrences", PayloadValue::I64(count as i64)),
                ]),
                now_ms,
                (count as f64 / 10.0).min(1.0),
            )
        })
        .collect()
}

/// Outliers: numeric payload samples more than three standard
/// deviations from their field mean.
fn detect_anomaly(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut samples: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for event in events {
        if let PayloadValue::Map(map) = &event.payload {
            for (key, value) in map {
                if let Some(v) = value.as_f64() {
                    samples
                        .entry(key.clone())
                        .or_default()
                        .push((event.id.clone(), v));
                }
            }
        }
    }

    let mut patterns = Vec::new();
    for (field, values) in samples {
        if values.len() < 5 {
            continue;
        }
        let n = values.len() as f64;
        let mean = values.iter().map(|(_, v)| v).sum::<f64>() / n;
        let variance = values.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            continue;
        }
        for (event_id, value) in &values {
            let z = (value - mean).abs() / std_dev;
            if z > 3.0 {
                patterns.push(DetectedPattern::new(
                    "anomaly",
                    Some(field.clone()),
                    payload(vec![
                        ("field", PayloadValue::Str(field.clone())),
                        ("event_id", PayloadValue::Str(event_id.clone())),
                        ("value", PayloadValue::F64(*value)),
                        ("z_score", PayloadValue::F64(z)),
                    ]),
                    now_ms,
                    (z / 6.0).min(1.0),
                ));
            }
        }
    }
    patterns
}

/// Monotonic drifts: per-topic numeric fields with a significant OLS
/// slope and a decent fit.
fn detect_trend(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut series: BTreeMap<(String, String), Vec<(f64, f64)>> = BTreeMap::new();
    for event in events {
        if let PayloadValue::Map(map) = &event.payload {
            for (key, value) in map {
                if let Some(v) = value.as_f64() {
                    series
                        .entry((event.topic.clone(), key.clone()))
                        .or_default()
                        .push((event.timestamp.physical_ms as f64 / 1_000.0, v));
                }
            }
        }
    }

    let mut patterns = Vec::new();
    for ((topic, field), points) in series {
        if points.len() < 5 {
            continue;
        }
        let Some(fit) = least_squares(&points) else {
            continue;
        };
        if fit.slope.abs() > 0.01 && fit.r_squared > 0.6 {
            patterns.push(DetectedPattern::new(
                "trend",
                Some(format!("{topic}.{field}")),
                payload(vec![
                    ("topic", PayloadValue::Str(topic.clone())),
                    ("field", PayloadValue::Str(field.clone())),
                    ("slope", PayloadValue::F64(fit.slope)),
                    ("r_squared", PayloadValue::F64(fit.r_squared)),
                ]),
                now_ms,
                fit.r_squared,
            ));
        }
    }
    patterns
}

/// Regular cadence: topics whose inter-arrival times have a low
/// coefficient of variation.
fn detect_periodic(events: &[Arc<Event>], now_ms: u64) -> Vec<DetectedPattern> {
    let mut arrivals: HashMap<&str, Vec<u64>> = HashMap::new();
    for event in events {
        arrivals
            .entry(event.topic.as_str())
            .or_default()
            .push(event.timestamp.physical_ms);
    }

    let mut patterns = Vec::new();
    for (topic, times) in arrivals {
        if times.len() < 4 {
            continue;
        }
        let gaps: Vec<f64> = times.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        let n = gaps.len() as f64;
        let mean = gaps.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            continue;
        }
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;
        let cv = variance.sqrt() / mean;
        if cv < 0.2 {
            patterns.push(DetectedPattern::new(
                "periodic",
                Some(topic.to_string()),
                payload(vec![
                    ("period_ms", PayloadValue::F64(mean)),
                    ("coefficient_of_variation", PayloadValue::F64(cv)),
                    ("cycles", PayloadValue::I64(gaps.len() as i64)),
                ]),
                now_ms,
                1.0 - cv,
            ));
        }
    }
    patterns
}

/// Feature-hash embedding of a detected pattern for the vector index.
/// Deterministic: the same pattern type, anchor, and body fields land
/// on the same vector.
pub fn pattern_vector(pattern: &DetectedPattern) -> Vec<f32> {
    fn stamp(vector: &mut [f32], token: &str, weight: f32) {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % PATTERN_VECTOR_DIM;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    let mut vector = vec![0.0f32; PATTERN_VECTOR_DIM];
    stamp(&mut vector, &format!("type:{}", pattern.pattern_type), 2.0);
    if let Some(topic) = &pattern.topic {
        stamp(&mut vector, &format!("topic:{topic}"), 1.5);
    }
    if let PayloadValue::Map(map) = &pattern.body {
        for (key, value) in map {
            stamp(&mut vector, &format!("field:{key}"), 0.5);
            if let Some(v) = value.as_f64() {
                let bucket_token = format!("bucket:{key}:{}", (v.abs().ln_1p() as i64));
                stamp(&mut vector, &bucket_token, 0.5);
            }
        }
    }

    // L2 normalize so cosine distance is meaningful.
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
