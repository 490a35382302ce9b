//! Index maintenance: compaction, age-based pruning, and variety
//! pressure relief.

use super::index::HnswIndex;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CompactionStats {
    pub orphans_removed: usize,
    pub nodes_repruned: usize,
    pub tombstones_swept: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PruneStats {
    pub nodes_removed: usize,
    pub entry_point_replaced: bool,
    pub remaining: usize,
}

impl HnswIndex {
    /// Remove orphan nodes (no neighbors at any level, not the entry
    /// point), re-prune nodes whose neighbor lists have grown past
    /// 1.5x their cap, and sweep tombstoned slots.
    pub fn compact(&mut self) -> CompactionStats {
        let mut stats = CompactionStats::default();

        let entry = self.entry_point();
        let orphans: Vec<u64> = self
            .graph()
            .iter_live()
            .filter(|record| record.is_orphan() && Some(record.id) != entry)
            .map(|record| record.id)
            .collect();
        // A single-node index is legitimately edge-free.
        if self.len() > 1 {
            for id in orphans {
                self.graph_mut().remove(id);
                stats.orphans_removed += 1;
            }
        }

        let params = *self.params();
        let overgrown: Vec<(u64, u16)> = self
            .graph()
            .iter_live()
            .flat_map(|record| {
                record
                    .neighbors
                    .iter()
                    .enumerate()
                    .filter(|(level, neighbors)| {
                        neighbors.len() as f64 > 1.5 * params.cap_at(*level as u16) as f64
                    })
                    .map(|(level, _)| (record.id, level as u16))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (id, level) in overgrown {
            self.force_prune_neighbors(id, level);
            stats.nodes_repruned += 1;
        }

        stats.tombstones_swept = self.graph_mut().sweep_tombstones();
        info!(
            orphans = stats.orphans_removed,
            repruned = stats.nodes_repruned,
            swept = stats.tombstones_swept,
            "index compaction complete"
        );
        stats
    }

    /// Trim a neighbor list down to its cap, keeping the closest and
    /// fixing reverse edges.
    fn force_prune_neighbors(&mut self, id: u64, level: u16) {
        let cap = self.params().cap_at(level);
        let Some(record) = self.graph().get(id) else { return };
        let base = record.vector.clone();
        let neighbors = record
            .neighbors
            .get(level as usize)
            .cloned()
            .unwrap_or_default();
        if neighbors.len() <= cap {
            return;
        }
        let metric = self.metric();
        let mut scored: Vec<(f32, u64)> = neighbors
            .iter()
            .filter_map(|&n| {
                self.graph()
                    .get(n)
                    .map(|r| (metric.distance(&base, &r.vector), n))
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let keep: Vec<u64> = scored.iter().take(cap).map(|&(_, n)| n).collect();
        for &(_, n) in scored.iter().skip(cap) {
            self.graph_mut().remove_edge(n, id, level);
        }
        self.graph_mut().set_neighbors(id, level, keep);
    }

    /// Remove every node older than `max_age_ms` relative to `now_ms`.
    /// Reverse edges are fixed up per removal; the entry point is
    /// re-elected if it was pruned.
    pub fn prune_max_age(&mut self, max_age_ms: u64, now_ms: u64) -> PruneStats {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let old_entry = self.entry_point();

        let expired: Vec<u64> = self
            .graph()
            .iter_live()
            .filter(|record| record.metadata.inserted_at_ms < cutoff)
            .map(|record| record.id)
            .collect();

        for id in &expired {
            self.graph_mut().remove(*id);
        }

        let stats = PruneStats {
            nodes_removed: expired.len(),
            entry_point_replaced: old_entry.is_some() && self.entry_point() != old_entry,
            remaining: self.len(),
        };
        if stats.nodes_removed > 0 {
            info!(
                removed = stats.nodes_removed,
                remaining = stats.remaining,
                entry_replaced = stats.entry_point_replaced,
                "age-based prune complete"
            );
        }
        stats
    }

    /// Ratio of stored patterns to the configured capacity.
    pub fn variety_pressure(&self, max_patterns: usize) -> f64 {
        if max_patterns == 0 {
            return 1.0;
        }
        self.len() as f64 / max_patterns as f64
    }

    /// Relieve variety pressure: drop low-confidence nodes first, then
    /// the oldest, until occupancy falls to `target_ratio` of
    /// `max_patterns`. Returns how many nodes were removed.
    pub fn emergency_prune(
        &mut self,
        max_patterns: usize,
        target_ratio: f64,
        confidence_threshold: f64,
    ) -> usize {
        let target = ((max_patterns as f64) * target_ratio).floor() as usize;
        if self.len() <= target {
            return 0;
        }
        let mut to_remove = self.len() - target;
        let mut removed = 0usize;

        // Low-confidence victims first (everything under the threshold
        // sorts ahead of it), oldest within equal confidence.
        let mut victims: Vec<(f64, u64, u64)> = self
            .graph()
            .iter_live()
            .map(|r| (r.metadata.confidence, r.metadata.inserted_at_ms, r.id))
            .collect();
        victims.sort_by(|a, b| {
            let a_low = a.0 < confidence_threshold;
            let b_low = b.0 < confidence_threshold;
            b_low
                .cmp(&a_low)
                .then(a.1.cmp(&b.1))
                .then(a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        });

        for (_, _, id) in victims {
            if to_remove == 0 {
                break;
            }
            self.graph_mut().remove(id);
            removed += 1;
            to_remove -= 1;
        }

        warn!(
            removed,
            remaining = self.len(),
            "emergency prune relieved variety pressure"
        );
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::graph::NodeMetadata;
    use crate::hnsw::index::{DistanceMetric, HnswParams};
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn meta(ms: u64, confidence: f64) -> NodeMetadata {
        NodeMetadata {
            inserted_at_ms: ms,
            confidence,
            tags: vec![],
        }
    }

    fn populated(n: u64, seed: u64) -> HnswIndex {
        let mut index = HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Cosine, seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for i in 0..n {
            let v: Vec<f32> = (0..4).map(|_| rng.gen_range(-1.0..1.0)).collect();
            index.insert(v, meta(1_000 + i, 0.9)).unwrap();
        }
        index
    }

    #[test]
    fn test_prune_removes_old_nodes() {
        let mut index = HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Cosine, 1);
        index.insert(vec![1.0, 0.0], meta(1_000, 1.0)).unwrap();
        index.insert(vec![0.0, 1.0], meta(50_000, 1.0)).unwrap();

        let stats = index.prune_max_age(10_000, 55_000);
        assert_eq!(stats.nodes_removed, 1);
        assert_eq!(stats.remaining, 1);
        let hits = index.search(&[0.0, 1.0], 2, None);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_prune_sole_entry_point_empties_index() {
        let mut index = HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Cosine, 1);
        index.insert(vec![1.0, 0.0], meta(1_000, 1.0)).unwrap();

        let stats = index.prune_max_age(10, 1_000_000);
        assert_eq!(stats.nodes_removed, 1);
        assert_eq!(index.entry_point(), None);
        assert!(index.is_empty());

        // Insert after emptying re-initializes the entry point.
        let id = index.insert(vec![0.5, 0.5], meta(2_000, 1.0)).unwrap();
        assert_eq!(index.entry_point(), Some(id));
        assert_eq!(index.search(&[0.5, 0.5], 1, None)[0].node_id, id);
    }

    #[test]
    fn test_prune_reelects_entry_point() {
        let mut index = populated(60, 31);
        let entry = index.entry_point().unwrap();
        let entry_ms = index.node_metadata(entry).unwrap().inserted_at_ms;

        // Prune only the entry node's vintage and older.
        let stats = index.prune_max_age(0, entry_ms + 1);
        assert!(stats.nodes_removed >= 1);
        if stats.remaining > 0 {
            let new_entry = index.entry_point().unwrap();
            assert_ne!(new_entry, entry);
        }
    }

    #[test]
    fn test_compact_removes_orphans() {
        let mut index = populated(30, 37);
        // Manufacture an orphan by clearing a node's edges both ways.
        let victim = index
            .graph()
            .iter_live()
            .find(|r| Some(r.id) != index.entry_point())
            .map(|r| r.id)
            .unwrap();
        let levels: Vec<(u16, Vec<u64>)> = index
            .graph()
            .get(victim)
            .map(|r| {
                r.neighbors
                    .iter()
                    .enumerate()
                    .map(|(l, n)| (l as u16, n.clone()))
                    .collect()
            })
            .unwrap();
        for (level, neighbors) in levels {
            for n in neighbors {
                index.graph_mut().remove_edge(victim, n, level);
                index.graph_mut().remove_edge(n, victim, level);
            }
        }

        let stats = index.compact();
        assert!(stats.orphans_removed >= 1);
        assert!(!index.graph().contains(victim));
        assert_eq!(index.graph().tombstone_count(), 0);
    }

    #[test]
    fn test_compact_single_node_keeps_it() {
        let mut index = HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Cosine, 1);
        let id = index.insert(vec![1.0], meta(1, 1.0)).unwrap();
        let stats = index.compact();
        assert_eq!(stats.orphans_removed, 0);
        assert!(index.graph().contains(id));
    }

    #[test]
    fn test_variety_pressure_and_emergency_prune() {
        let mut index = HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Cosine, 41);
        for i in 0..10u64 {
            let confidence = if i < 4 { 0.2 } else { 0.95 };
            index
                .insert(vec![i as f32, 1.0], meta(1_000 + i, confidence))
                .unwrap();
        }
        assert!((index.variety_pressure(10) - 1.0).abs() < f64::EPSILON);

        let removed = index.emergency_prune(10, 0.5, 0.5);
        assert_eq!(removed, 5);
        assert_eq!(index.len(), 5);
        // The low-confidence nodes went first.
        for record in index.graph().iter_live() {
            if record.metadata.confidence < 0.5 {
                panic!("low-confidence node survived emergency prune");
            }
        }
        assert!(index.variety_pressure(10) <= 0.5);
    }

    #[test]
    fn test_symmetry_preserved_after_prune() {
        let mut index = populated(80, 43);
        index.prune_max_age(0, 1_000 + 40);

        let graph = index.graph();
        for record in graph.iter_live() {
            for (level, neighbors) in record.neighbors.iter().enumerate() {
                for &neighbor in neighbors {
                    assert!(graph.contains(neighbor), "dangling edge to {neighbor}");
                    assert!(
                        graph.neighbors(neighbor, level as u16).contains(&record.id),
                        "asymmetric edge after prune"
                    );
                }
            }
        }
    }
}
