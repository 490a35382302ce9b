//! Core event model shared across the fabric.
//!
//! Payloads arrive as untyped maps from heterogeneous producers, so
//! they are modeled as a tagged value type with path lookups. Field
//! access that misses or mismatches yields `None`; pattern evaluation
//! treats that as no-match, never as an error.

use crate::clock::HlcTimestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known fabric topics.
pub mod topics {
    pub const FUSION_COMPLETE: &str = "semantic_fusion_complete";
    pub const PATTERN_MATCH: &str = "pattern_match";
    pub const ALGEDONIC_SIGNAL: &str = "algedonic_signal";
    pub const HEALTH_CHECK_RESPONSE: &str = "health_check_response";
    pub const CAUSAL_CHAIN: &str = "causal_chain_detected";
}

/// Tagged payload value. Maps use `BTreeMap` so canonical serialization
/// (and therefore content hashing) is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    /// Look up a dot-separated path (`a.b.c`) through nested maps.
    pub fn lookup(&self, path: &str) -> Option<&PayloadValue> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                PayloadValue::Map(map) => {
                    current = map.get(segment)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    /// Numeric view. Both integer and float payloads coerce; anything
    /// else is not a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::I64(v) => Some(*v as f64),
            PayloadValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Top-level keys, for semantic tag derivation. Non-maps have none.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            PayloadValue::Map(map) => map.keys().map(|k| k.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Loose equality used by the `eq` predicate: numbers compare
    /// across I64/F64, everything else compares within its own tag.
    pub fn loosely_equals(&self, other: &PayloadValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PayloadValue::Null,
            serde_json::Value::Bool(b) => PayloadValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PayloadValue::I64(i)
                } else {
                    PayloadValue::F64(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => PayloadValue::Str(s),
            serde_json::Value::Array(items) => {
                PayloadValue::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                PayloadValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Convenience constructor for map payloads.
pub fn payload(entries: Vec<(&str, PayloadValue)>) -> PayloadValue {
    PayloadValue::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// Event priority, ordered so `Critical` compares greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// VSM subsystem a producer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    S1Operations,
    S2Coordination,
    S3Control,
    S4Intelligence,
    S5Policy,
    #[default]
    External,
}

impl Subsystem {
    /// Derive a subsystem from a topic prefix (`s1_`, `s2_`, ...).
    pub fn from_topic(topic: &str) -> Self {
        match topic.get(..3) {
            Some("s1_") => Subsystem::S1Operations,
            Some("s2_") => Subsystem::S2Coordination,
            Some("s3_") => Subsystem::S3Control,
            Some("s4_") => Subsystem::S4Intelligence,
            Some("s5_") => Subsystem::S5Policy,
            _ => Subsystem::External,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Subsystem::S1Operations => "s1",
            Subsystem::S2Coordination => "s2",
            Subsystem::S3Control => "s3",
            Subsystem::S4Intelligence => "s4",
            Subsystem::S5Policy => "s5",
            Subsystem::External => "external",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventMetadata {
    pub source: String,
    pub priority: Priority,
    pub subsystem: Subsystem,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// An immutable fabric event. Published once; subscribers receive
/// shared read-only references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub timestamp: HlcTimestamp,
    pub payload: PayloadValue,
    pub metadata: EventMetadata,
}

impl Event {
    /// Build an event, deriving the id as a content hash over topic,
    /// canonical payload and timestamp.
    pub fn new(
        topic: impl Into<String>,
        timestamp: HlcTimestamp,
        payload: PayloadValue,
        metadata: EventMetadata,
    ) -> Self {
        let topic = topic.into();
        let id = content_hash(&topic, &payload, &timestamp);
        Self {
            id,
            topic,
            timestamp,
            payload,
            metadata,
        }
    }

    /// Field lookup on the payload; `metadata.` paths read from the
    /// event metadata instead.
    pub fn field(&self, path: &str) -> Option<PayloadValue> {
        if let Some(rest) = path.strip_prefix("metadata.") {
            return match rest {
                "source" => Some(PayloadValue::Str(self.metadata.source.clone())),
                "subsystem" => Some(PayloadValue::Str(self.metadata.subsystem.tag().to_string())),
                "priority" => Some(PayloadValue::Str(
                    format!("{:?}", self.metadata.priority).to_lowercase(),
                )),
                _ => None,
            };
        }
        if path == "topic" {
            return Some(PayloadValue::Str(self.topic.clone()));
        }
        self.payload.lookup(path).cloned()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }

    /// Semantic tags shared with another event.
    pub fn shared_tags<'a>(&'a self, other: &'a Event) -> Vec<&'a str> {
        self.metadata
            .tags
            .iter()
            .filter(|t| other.metadata.tags.contains(t))
            .map(|t| t.as_str())
            .collect()
    }
}

fn content_hash(topic: &str, payload: &PayloadValue, timestamp: &HlcTimestamp) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(b"\x1f");
    // BTreeMap-backed maps make this canonical for equal payloads.
    if let Ok(canonical) = serde_json::to_vec(payload) {
        hasher.update(&canonical);
    }
    hasher.update(b"\x1f");
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Builder used by producers and throughout the test suites.
#[derive(Debug, Default)]
pub struct EventBuilder {
    topic: String,
    payload: Option<PayloadValue>,
    source: String,
    priority: Priority,
    subsystem: Option<Subsystem>,
    tags: Vec<String>,
}

impl EventBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn payload(mut self, payload: PayloadValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn subsystem(mut self, subsystem: Subsystem) -> Self {
        self.subsystem = Some(subsystem);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn build(self, timestamp: HlcTimestamp) -> Event {
        let subsystem = self
            .subsystem
            .unwrap_or_else(|| Subsystem::from_topic(&self.topic));
        Event::new(
            self.topic,
            timestamp,
            self.payload.unwrap_or(PayloadValue::Null),
            EventMetadata {
                source: self.source,
                priority: self.priority,
                subsystem,
                tags: self.tags,
            },
        )
    }
}
