//! HNSW insertion and search.

use super::graph::{GraphArena, NodeMetadata};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    /// Wire tag used in the snapshot header.
    pub fn tag(&self) -> u8 {
        match self {
            DistanceMetric::Cosine => 1,
            DistanceMetric::Euclidean => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DistanceMetric::Cosine),
            2 => Some(DistanceMetric::Euclidean),
            _ => None,
        }
    }

    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
        }
    }
}

#[inline]
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).max(0.0)
}

#[inline]
fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max neighbors per node above level 0.
    pub m: usize,
    /// Max neighbors at level 0 (2M).
    pub max_m0: usize,
    /// Default search beam width.
    pub ef: usize,
    /// Construction beam width.
    pub ef_construction: usize,
    /// Level decay factor, 1/ln 2.
    pub ml: f64,
}

impl HnswParams {
    pub fn new(m: usize, ef: usize) -> Self {
        Self {
            m,
            max_m0: 2 * m,
            ef,
            ef_construction: ef.max(64),
            ml: 1.0 / std::f64::consts::LN_2,
        }
    }

    pub fn cap_at(&self, level: u16) -> usize {
        if level == 0 {
            self.max_m0
        } else {
            self.m
        }
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::new(16, 200)
    }
}

#[derive(Debug)]
pub enum HnswError {
    DimensionMismatch { expected: usize, got: usize },
    EmptyVector,
}

impl fmt::Display for HnswError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch { expected, got } => {
                write!(f, "vector dimension {got} does not match index dimension {expected}")
            }
            Self::EmptyVector => write!(f, "cannot index an empty vector"),
        }
    }
}

impl std::error::Error for HnswError {}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub node_id: u64,
    pub distance: f32,
    pub metadata: NodeMetadata,
}

/// Candidate ordered by distance; used both as a min-heap (via
/// `Reverse`) and a max-heap during beam search.
#[derive(PartialEq)]
struct Candidate {
    distance: f32,
    id: u64,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then(self.id.cmp(&other.id))
    }
}

#[derive(Debug)]
pub struct HnswIndex {
    params: HnswParams,
    metric: DistanceMetric,
    graph: GraphArena,
    dimension: Option<usize>,
    rng: ChaCha8Rng,
    /// Monotonic insertion counter, feeds the adaptive save interval.
    insertions_total: u64,
}

impl HnswIndex {
    pub fn new(params: HnswParams, metric: DistanceMetric) -> Self {
        Self::with_seed(params, metric, rand::thread_rng().gen())
    }

    /// Deterministic construction for tests and replays.
    pub fn with_seed(params: HnswParams, metric: DistanceMetric, seed: u64) -> Self {
        Self {
            params,
            metric,
            graph: GraphArena::new(),
            dimension: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            insertions_total: 0,
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn entry_point(&self) -> Option<u64> {
        self.graph.entry_point()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn insertions_total(&self) -> u64 {
        self.insertions_total
    }

    pub(super) fn graph(&self) -> &GraphArena {
        &self.graph
    }

    pub(super) fn graph_mut(&mut self) -> &mut GraphArena {
        &mut self.graph
    }

    pub(super) fn restore_state(&mut self, graph: GraphArena, dimension: Option<usize>) {
        self.graph = graph;
        self.dimension = dimension;
    }

    pub fn node_metadata(&self, id: u64) -> Option<NodeMetadata> {
        self.graph.get(id).map(|record| record.metadata.clone())
    }

    /// Exponentially-decaying level assignment: floor(-ln(U) * ml).
    fn draw_level(&mut self) -> u16 {
        let uniform: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let level = (-uniform.ln() * self.params.ml).floor() as u64;
        level.min(u16::MAX as u64) as u16
    }

    pub fn insert(
        &mut self,
        vector: Vec<f32>,
        metadata: NodeMetadata,
    ) -> Result<u64, HnswError> {
        if vector.is_empty() {
            return Err(HnswError::EmptyVector);
        }
        match self.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(HnswError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
            None => self.dimension = Some(vector.len()),
            _ => {}
        }

        let level = self.draw_level();
        self.insertions_total += 1;

        let Some(entry) = self.graph.entry_point() else {
            let id = self.graph.allocate(vector, level, metadata);
            self.graph.set_entry_point(Some(id));
            debug!(id, level, "index initialized with first node");
            return Ok(id);
        };

        let top_level = self.graph.max_level();
        let query = vector.clone();
        let id = self.graph.allocate(vector, level, metadata);

        // Greedy descent with beam 1 through layers above the new
        // node's level.
        let mut ep = entry;
        let mut layer = top_level;
        while layer > level {
            ep = self.greedy_step(&query, ep, layer);
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        // Connect from min(level, top_level) down to 0.
        let mut connect_level = level.min(top_level);
        loop {
            let candidates =
                self.search_layer(&query, ep, self.params.ef_construction, connect_level);
            let cap = self.params.cap_at(connect_level);
            let chosen: Vec<u64> = candidates.iter().take(cap).map(|c| c.id).collect();

            for &neighbor in &chosen {
                self.graph.add_edge(id, neighbor, connect_level);
                self.graph.add_edge(neighbor, id, connect_level);
                self.prune_neighbors(neighbor, connect_level);
            }

            if let Some(best) = candidates.first() {
                ep = best.id;
            }
            if connect_level == 0 {
                break;
            }
            connect_level -= 1;
        }

        // A node drawn above the current top becomes the entry point.
        if level > top_level {
            self.graph.set_entry_point(Some(id));
        }
        Ok(id)
    }

    /// Keep a node's neighbor list within its cap by retaining the
    /// closest.
    fn prune_neighbors(&mut self, id: u64, level: u16) {
        let cap = self.params.cap_at(level);
        let Some(record) = self.graph.get(id) else { return };
        let neighbors = record.neighbors.get(level as usize).cloned().unwrap_or_default();
        if neighbors.len() <= cap {
            return;
        }
        let base = record.vector.clone();
        let mut scored: Vec<Candidate> = neighbors
            .iter()
            .filter_map(|&n| {
                self.graph.get(n).map(|r| Candidate {
                    distance: self.metric.distance(&base, &r.vector),
                    id: n,
                })
            })
            .collect();
        scored.sort();
        let keep: HashSet<u64> = scored.iter().take(cap).map(|c| c.id).collect();

        // Edges are bidirectional: dropped neighbors lose their back
        // edge too, preserving graph symmetry.
        for &n in &neighbors {
            if !keep.contains(&n) {
                self.graph.remove_edge(n, id, level);
            }
        }
        self.graph
            .set_neighbors(id, level, scored.iter().take(cap).map(|c| c.id).collect());
    }

    /// Single greedy step at a layer: move to the closest neighbor
    /// until no improvement.
    fn greedy_step(&self, query: &[f32], entry: u64, level: u16) -> u64 {
        let mut current = entry;
        let mut current_dist = self
            .graph
            .get(current)
            .map(|r| self.metric.distance(query, &r.vector))
            .unwrap_or(f32::MAX);
        loop {
            let mut improved = false;
            for &neighbor in self.graph.neighbors(current, level) {
                if let Some(record) = self.graph.get(neighbor) {
                    let dist = self.metric.distance(query, &record.vector);
                    if dist < current_dist {
                        current = neighbor;
                        current_dist = dist;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search at one layer. Returns candidates sorted by
    /// ascending distance.
    fn search_layer(&self, query: &[f32], entry: u64, ef: usize, level: u16) -> Vec<Candidate> {
        let Some(entry_record) = self.graph.get(entry) else {
            return Vec::new();
        };
        let ef = ef.max(1);
        let entry_dist = self.metric.distance(query, &entry_record.vector);

        let mut visited: HashSet<u64> = HashSet::from([entry]);
        // Min-heap of frontier candidates.
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> =
            BinaryHeap::from([std::cmp::Reverse(Candidate {
                distance: entry_dist,
                id: entry,
            })]);
        // Max-heap of the ef best results found so far.
        let mut results: BinaryHeap<Candidate> = BinaryHeap::from([Candidate {
            distance: entry_dist,
            id: entry,
        }]);

        while let Some(std::cmp::Reverse(candidate)) = frontier.pop() {
            let worst = results.peek().map(|c| c.distance).unwrap_or(f32::MAX);
            if candidate.distance > worst && results.len() >= ef {
                break;
            }
            for &neighbor in self.graph.neighbors(candidate.id, level) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let Some(record) = self.graph.get(neighbor) else {
                    continue;
                };
                let dist = self.metric.distance(query, &record.vector);
                let worst = results.peek().map(|c| c.distance).unwrap_or(f32::MAX);
                if results.len() < ef || dist < worst {
                    frontier.push(std::cmp::Reverse(Candidate {
                        distance: dist,
                        id: neighbor,
                    }));
                    results.push(Candidate {
                        distance: dist,
                        id: neighbor,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut sorted = results.into_vec();
        sorted.sort();
        sorted
    }

    /// k-nearest-neighbor search. `ef` falls back to the index default
    /// (floored at k).
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Vec<SearchResult> {
        let Some(entry) = self.graph.entry_point() else {
            return Vec::new();
        };
        let ef = ef.unwrap_or(self.params.ef).max(k);

        // Greedy descent to layer 1, beam search at layer 0.
        let mut ep = entry;
        let mut layer = self.graph.max_level();
        while layer > 0 {
            ep = self.greedy_step(query, ep, layer);
            layer -= 1;
        }

        self.search_layer(query, ep, ef, 0)
            .into_iter()
            .take(k)
            .filter_map(|candidate| {
                self.graph.get(candidate.id).map(|record| SearchResult {
                    node_id: candidate.id,
                    distance: candidate.distance,
                    metadata: record.metadata.clone(),
                })
            })
            .collect()
    }

    /// Parallel batch search preserving input order. The cancel flag
    /// is checked per query; cancelled queries yield empty results.
    pub fn batch_search(
        &self,
        queries: &[Vec<f32>],
        k: usize,
        ef: Option<usize>,
        cancel: &Arc<AtomicBool>,
    ) -> Vec<Vec<SearchResult>> {
        queries
            .par_iter()
            .map(|query| {
                if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                    return Vec::new();
                }
                self.search(query, k, ef)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> HnswIndex {
        HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Cosine, 7)
    }

    fn meta(ms: u64) -> NodeMetadata {
        NodeMetadata {
            inserted_at_ms: ms,
            confidence: 1.0,
            tags: vec![],
        }
    }

    #[test]
    fn test_insert_then_self_search() {
        let mut index = index();
        let id = index.insert(vec![1.0, 0.0], meta(1)).unwrap();
        let hits = index.search(&[1.0, 0.0], 1, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_id, id);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_neighbor_recovery() {
        let mut index = index();
        let a = index.insert(vec![1.0, 0.0], meta(1)).unwrap();
        let _b = index.insert(vec![0.0, 1.0], meta(2)).unwrap();
        let c = index.insert(vec![0.99, 0.01], meta(3)).unwrap();

        let hits = index.search(&[1.0, 0.0], 2, None);
        let ids: Vec<u64> = hits.iter().map(|h| h.node_id).collect();
        assert_eq!(ids, vec![a, c]);
        assert!(hits[0].distance.abs() < 1e-6);
        assert!(hits[1].distance > 0.0 && hits[1].distance < 0.001);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = index();
        index.insert(vec![1.0, 0.0], meta(1)).unwrap();
        let err = index.insert(vec![1.0, 0.0, 0.0], meta(2)).unwrap_err();
        assert!(matches!(err, HnswError::DimensionMismatch { expected: 2, got: 3 }));
        assert!(matches!(
            index.insert(vec![], meta(3)).unwrap_err(),
            HnswError::EmptyVector
        ));
    }

    #[test]
    fn test_graph_edges_symmetric_after_inserts() {
        let mut index = index();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for i in 0..120u64 {
            let v: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
            index.insert(v, meta(i)).unwrap();
        }

        let graph = index.graph();
        for record in graph.iter_live() {
            for (level, neighbors) in record.neighbors.iter().enumerate() {
                for &neighbor in neighbors {
                    assert!(
                        graph.neighbors(neighbor, level as u16).contains(&record.id),
                        "edge {} -> {} at level {} has no reverse",
                        record.id,
                        neighbor,
                        level
                    );
                }
            }
        }
    }

    #[test]
    fn test_neighbor_caps_respected() {
        let mut index = index();
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        for i in 0..200u64 {
            let v: Vec<f32> = (0..4).map(|_| rng.gen_range(-1.0..1.0)).collect();
            index.insert(v, meta(i)).unwrap();
        }
        let params = *index.params();
        for record in index.graph().iter_live() {
            for (level, neighbors) in record.neighbors.iter().enumerate() {
                assert!(
                    neighbors.len() <= params.cap_at(level as u16),
                    "node {} level {} has {} neighbors",
                    record.id,
                    level,
                    neighbors.len()
                );
            }
        }
    }

    #[test]
    fn test_knn_recall_on_clustered_data() {
        let mut index =
            HnswIndex::with_seed(HnswParams::default(), DistanceMetric::Euclidean, 5);
        // Two well-separated clusters.
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        for i in 0..50u64 {
            let v = vec![
                10.0 + rng.gen_range(-0.5..0.5f32),
                10.0 + rng.gen_range(-0.5..0.5f32),
            ];
            index.insert(v, meta(i)).unwrap();
        }
        for i in 50..100u64 {
            let v = vec![
                -10.0 + rng.gen_range(-0.5..0.5f32),
                -10.0 + rng.gen_range(-0.5..0.5f32),
            ];
            index.insert(v, meta(i)).unwrap();
        }

        let hits = index.search(&[10.0, 10.0], 10, None);
        assert_eq!(hits.len(), 10);
        for hit in &hits {
            assert!(hit.distance < 2.0, "cross-cluster hit at {}", hit.distance);
        }
    }

    #[test]
    fn test_batch_search_preserves_order() {
        let mut index = index();
        index.insert(vec![1.0, 0.0], meta(1)).unwrap();
        index.insert(vec![0.0, 1.0], meta(2)).unwrap();

        let queries = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let cancel = Arc::new(AtomicBool::new(false));
        let results = index.batch_search(&queries, 1, None, &cancel);
        assert_eq!(results.len(), 2);
        assert!(results[0][0].distance < 1e-6);
        assert!(results[1][0].distance < 1e-6);
    }

    #[test]
    fn test_batch_search_cancellation() {
        let mut index = index();
        index.insert(vec![1.0, 0.0], meta(1)).unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let results = index.batch_search(&[vec![1.0, 0.0]], 1, None, &cancel);
        assert!(results[0].is_empty());
    }

    #[test]
    fn test_search_empty_index() {
        let index = index();
        assert!(index.search(&[1.0, 0.0], 5, None).is_empty());
    }

    #[test]
    fn test_level_distribution_decays() {
        let mut index = index();
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        for i in 0..500u64 {
            let v: Vec<f32> = (0..4).map(|_| rng.gen_range(-1.0..1.0)).collect();
            index.insert(v, meta(i)).unwrap();
        }
        let mut level0 = 0usize;
        let mut higher = 0usize;
        for record in index.graph().iter_live() {
            if record.level == 0 {
                level0 += 1;
            } else {
                higher += 1;
            }
        }
        // With ml = 1/ln2 roughly half the nodes sit above level 0.
        assert!(level0 > 150, "level0 = {level0}");
        assert!(higher > 100, "higher = {higher}");
        // Entry point is at the maximal level.
        let entry = index.entry_point().unwrap();
        let entry_level = index.graph().get(entry).unwrap().level;
        assert_eq!(entry_level, index.graph().max_level());
    }
}
