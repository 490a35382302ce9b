//! Causal chain detection over the enriched event window.
//!
//! A chain is a triple of events, strictly increasing in HLC, with
//! both inter-event gaps at most 500 ms and at least one semantic tag
//! shared between each adjacent pair. Confidence blends timing
//! tightness with tag overlap.

use crate::models::Event;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum tolerated gap between adjacent chain events.
pub const MAX_CHAIN_GAP_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainLink {
    pub event_id: String,
    pub topic: String,
    pub physical_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CausalChain {
    pub id: String,
    pub links: Vec<ChainLink>,
    pub confidence: f64,
    pub detected_at_ms: u64,
    /// Tags shared across the chain's adjacent pairs.
    pub tags: Vec<String>,
}

impl CausalChain {
    /// Topic sequence used for deduplication: two chains over the same
    /// topic trajectory are the same phenomenon.
    pub fn topic_key(&self) -> String {
        self.links
            .iter()
            .map(|l| l.topic.as_str())
            .collect::<Vec<_>>()
            .join(">")
    }
}

fn shared_tags(a: &Event, b: &Event) -> Vec<String> {
    a.shared_tags(b).into_iter().map(String::from).collect()
}

fn jaccard(a: &Event, b: &Event) -> f64 {
    let tags_a: HashSet<&str> = a.metadata.tags.iter().map(|t| t.as_str()).collect();
    let tags_b: HashSet<&str> = b.metadata.tags.iter().map(|t| t.as_str()).collect();
    let union = tags_a.union(&tags_b).count();
    if union == 0 {
        return 0.0;
    }
    tags_a.intersection(&tags_b).count() as f64 / union as f64
}

/// Slide a window of three over the (HLC-sorted) events and keep
/// qualifying triples.
pub fn detect_chains(events: &[Arc<Event>], now_ms: u64) -> Vec<CausalChain> {
    let mut chains = Vec::new();
    if events.len() < 3 {
        return chains;
    }

    for triple in events.windows(3) {
        let (a, b, c) = (&triple[0], &triple[1], &triple[2]);
        if !(a.timestamp < b.timestamp && b.timestamp < c.timestamp) {
            continue;
        }
        let gap_ab = b.timestamp.physical_ms.saturating_sub(a.timestamp.physical_ms);
        let gap_bc = c.timestamp.physical_ms.saturating_sub(b.timestamp.physical_ms);
        if gap_ab > MAX_CHAIN_GAP_MS || gap_bc > MAX_CHAIN_GAP_MS {
            continue;
        }

        let shared_ab = shared_tags(a, b);
        let shared_bc = shared_tags(b, c);
        if shared_ab.is_empty() || shared_bc.is_empty() {
            continue;
        }

        let avg_gap = (gap_ab + gap_bc) as f64 / 2.0;
        let time_consistency = 1.0 - (avg_gap / MAX_CHAIN_GAP_MS as f64);
        let semantic_similarity = (jaccard(a, b) + jaccard(b, c)) / 2.0;
        let confidence = (time_consistency + semantic_similarity) / 2.0;

        let mut tags: Vec<String> = shared_ab;
        for tag in shared_bc {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        chains.push(CausalChain {
            id: Uuid::new_v4().to_string(),
            links: triple
                .iter()
                .map(|e| ChainLink {
                    event_id: e.id.clone(),
                    topic: e.topic.clone(),
                    physical_ms: e.timestamp.physical_ms,
                })
                .collect(),
            confidence,
            detected_at_ms: now_ms,
            tags,
        });
    }
    chains
}

/// Merge new chains into the running list: dedupe by topic trajectory
/// (highest confidence wins) and cap to `max_chains`, dropping the
/// lowest-confidence entries first.
pub fn merge_chains(existing: &mut Vec<CausalChain>, fresh: Vec<CausalChain>, max_chains: usize) {
    for chain in fresh {
        let key = chain.topic_key();
        match existing.iter_mut().find(|c| c.topic_key() == key) {
            Some(current) => {
                if chain.confidence > current.confidence {
                    *current = chain;
                }
            }
            None => existing.push(chain),
        }
    }
    if existing.len() > max_chains {
        existing.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        existing.truncate(max_chains);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HlcTimestamp;
    use crate::models::EventBuilder;

    fn tagged(ms: u64, topic: &str, tags: &[&str]) -> Arc<Event> {
        let mut builder = EventBuilder::new(topic);
        for tag in tags {
            builder = builder.tag(*tag);
        }
        Arc::new(builder.build(HlcTimestamp::new(ms, 0, "n")))
    }

    #[test]
    fn test_detects_tight_tagged_triple() {
        let events = vec![
            tagged(0, "a", &["thermal"]),
            tagged(200, "b", &["thermal"]),
            tagged(400, "c", &["thermal"]),
        ];
        let chains = detect_chains(&events, 1_000);
        assert_eq!(chains.len(), 1);
        let chain = &chains[0];
        assert_eq!(chain.links.len(), 3);
        assert_eq!(chain.topic_key(), "a>b>c");
        assert!(chain.tags.contains(&"thermal".to_string()));
        // gaps of 200ms: time consistency 0.6; identical single tags:
        // similarity 1.0; confidence 0.8.
        assert!((chain.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_wide_gaps() {
        let events = vec![
            tagged(0, "a", &["x"]),
            tagged(600, "b", &["x"]),
            tagged(700, "c", &["x"]),
        ];
        assert!(detect_chains(&events, 1_000).is_empty());
    }

    #[test]
    fn test_rejects_disjoint_tags() {
        let events = vec![
            tagged(0, "a", &["x"]),
            tagged(100, "b", &["y"]),
            tagged(200, "c", &["y"]),
        ];
        assert!(detect_chains(&events, 1_000).is_empty());
    }

    #[test]
    fn test_merge_dedupes_by_topic_key() {
        let make = |confidence: f64| CausalChain {
            id: Uuid::new_v4().to_string(),
            links: vec![
                ChainLink {
                    event_id: "1".into(),
                    topic: "a".into(),
                    physical_ms: 0,
                },
                ChainLink {
                    event_id: "2".into(),
                    topic: "b".into(),
                    physical_ms: 100,
                },
                ChainLink {
                    event_id: "3".into(),
                    topic: "c".into(),
                    physical_ms: 200,
                },
            ],
            confidence,
            detected_at_ms: 0,
            tags: vec![],
        };
        let mut existing = vec![make(0.5)];
        merge_chains(&mut existing, vec![make(0.9), make(0.3)], 100);
        assert_eq!(existing.len(), 1);
        assert!((existing[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_cap_keeps_highest_confidence() {
        let mut existing = Vec::new();
        let fresh: Vec<CausalChain> = (0..10)
            .map(|i| CausalChain {
                id: Uuid::new_v4().to_string(),
                links: vec![ChainLink {
                    event_id: format!("{i}"),
                    topic: format!("t{i}"),
                    physical_ms: 0,
                }],
                confidence: i as f64 / 10.0,
                detected_at_ms: 0,
                tags: vec![],
            })
            .collect();
        merge_chains(&mut existing, fresh, 3);
        assert_eq!(existing.len(), 3);
        assert!(existing.iter().all(|c| c.confidence >= 0.7));
    }
}
