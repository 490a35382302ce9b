//! Arena-backed HNSW graph storage.
//!
//! Node records sit in a contiguous slab addressed through an id map;
//! neighbor lists hold node ids. Removal tombstones the slot so edge
//! fixups stay cheap; `sweep_tombstones` reclaims slots during
//! compaction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeMetadata {
    /// Wall-clock insertion time in milliseconds.
    pub inserted_at_ms: u64,
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: u64,
    pub level: u16,
    pub vector: Vec<f32>,
    pub metadata: NodeMetadata,
    /// One neighbor list per level, index 0..=level.
    pub neighbors: Vec<Vec<u64>>,
    pub deleted: bool,
}

impl NodeRecord {
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.iter().map(|n| n.len()).sum()
    }

    pub fn is_orphan(&self) -> bool {
        self.neighbors.iter().all(|n| n.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct GraphArena {
    slots: Vec<NodeRecord>,
    index_of: HashMap<u64, usize>,
    entry_point: Option<u64>,
    next_id: u64,
    live_count: usize,
}

impl GraphArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    pub fn set_entry_point(&mut self, id: Option<u64>) {
        self.entry_point = id;
    }

    /// Allocate a record with empty neighbor lists up to `level`.
    pub fn allocate(&mut self, vector: Vec<f32>, level: u16, metadata: NodeMetadata) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let record = NodeRecord {
            id,
            level,
            vector,
            metadata,
            neighbors: vec![Vec::new(); level as usize + 1],
            deleted: false,
        };
        self.index_of.insert(id, self.slots.len());
        self.slots.push(record);
        self.live_count += 1;
        id
    }

    /// Re-insert a fully-formed record (snapshot load path). Keeps
    /// `next_id` ahead of every restored id.
    pub fn restore(&mut self, record: NodeRecord) {
        self.next_id = self.next_id.max(record.id + 1);
        self.index_of.insert(record.id, self.slots.len());
        if !record.deleted {
            self.live_count += 1;
        }
        self.slots.push(record);
    }

    pub fn get(&self, id: u64) -> Option<&NodeRecord> {
        self.index_of
            .get(&id)
            .and_then(|&slot| self.slots.get(slot))
            .filter(|record| !record.deleted)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut NodeRecord> {
        let slot = *self.index_of.get(&id)?;
        self.slots.get_mut(slot).filter(|record| !record.deleted)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.get(id).is_some()
    }

    /// Live records, ascending by id (deterministic iteration order
    /// for persistence and stats).
    pub fn iter_live(&self) -> impl Iterator<Item = &NodeRecord> {
        let mut live: Vec<&NodeRecord> = self.slots.iter().filter(|r| !r.deleted).collect();
        live.sort_by_key(|r| r.id);
        live.into_iter()
    }

    pub fn live_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn neighbors(&self, id: u64, level: u16) -> &[u64] {
        self.get(id)
            .and_then(|record| record.neighbors.get(level as usize))
            .map(|n| n.as_slice())
            .unwrap_or(&[])
    }

    /// Install a directed edge, ignoring duplicates and self-loops.
    pub fn add_edge(&mut self, from: u64, to: u64, level: u16) {
        if from == to {
            return;
        }
        if let Some(record) = self.get_mut(from) {
            if let Some(list) = record.neighbors.get_mut(level as usize) {
                if !list.contains(&to) {
                    list.push(to);
                }
            }
        }
    }

    pub fn remove_edge(&mut self, from: u64, to: u64, level: u16) {
        if let Some(record) = self.get_mut(from) {
            if let Some(list) = record.neighbors.get_mut(level as usize) {
                list.retain(|&id| id != to);
            }
        }
    }

    pub fn set_neighbors(&mut self, id: u64, level: u16, neighbors: Vec<u64>) {
        if let Some(record) = self.get_mut(id) {
            if let Some(list) = record.neighbors.get_mut(level as usize) {
                *list = neighbors;
            }
        }
    }

    /// Tombstone a record and scrub reverse edges pointing at it.
    /// The caller is responsible for entry-point re-election.
    pub fn remove(&mut self, id: u64) -> Option<NodeRecord> {
        let slot = *self.index_of.get(&id)?;
        if self.slots.get(slot).map(|r| r.deleted).unwrap_or(true) {
            return None;
        }
        let removed = self.slots[slot].clone();
        self.slots[slot].deleted = true;
        self.slots[slot].neighbors.iter_mut().for_each(|n| n.clear());
        self.slots[slot].vector.clear();
        self.live_count -= 1;

        // Reverse-edge fixup across every level the node occupied.
        for level in 0..=removed.level {
            for &neighbor in removed
                .neighbors
                .get(level as usize)
                .map(|n| n.as_slice())
                .unwrap_or(&[])
            {
                self.remove_edge(neighbor, id, level);
            }
        }

        if self.entry_point == Some(id) {
            self.entry_point = self.highest_level_node();
        }
        Some(removed)
    }

    /// Live node with the maximal level, smallest id as tie-break.
    pub fn highest_level_node(&self) -> Option<u64> {
        self.slots
            .iter()
            .filter(|r| !r.deleted)
            .max_by(|a, b| a.level.cmp(&b.level).then(b.id.cmp(&a.id)))
            .map(|r| r.id)
    }

    pub fn max_level(&self) -> u16 {
        self.slots
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| r.level)
            .max()
            .unwrap_or(0)
    }

    /// Physically drop tombstoned slots. Invalidates nothing for
    /// callers because all addressing goes through ids.
    pub fn sweep_tombstones(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|record| !record.deleted);
        self.index_of.clear();
        for (slot, record) in self.slots.iter().enumerate() {
            self.index_of.insert(record.id, slot);
        }
        before - self.slots.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.slots.len() - self.live_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(n: usize) -> (GraphArena, Vec<u64>) {
        let mut arena = GraphArena::new();
        let ids: Vec<u64> = (0..n)
            .map(|i| {
                arena.allocate(
                    vec![i as f32, 0.0],
                    0,
                    NodeMetadata {
                        inserted_at_ms: i as u64,
                        confidence: 1.0,
                        tags: vec![],
                    },
                )
            })
            .collect();
        (arena, ids)
    }

    #[test]
    fn test_allocate_and_lookup() {
        let (arena, ids) = arena_with(3);
        assert_eq!(arena.len(), 3);
        assert!(arena.contains(ids[0]));
        assert_eq!(arena.get(ids[1]).unwrap().vector, vec![1.0, 0.0]);
        assert!(arena.get(999).is_none());
    }

    #[test]
    fn test_edges_bidirectional_fixup_on_remove() {
        let (mut arena, ids) = arena_with(3);
        arena.add_edge(ids[0], ids[1], 0);
        arena.add_edge(ids[1], ids[0], 0);
        arena.add_edge(ids[1], ids[2], 0);
        arena.add_edge(ids[2], ids[1], 0);

        arena.remove(ids[1]);
        assert_eq!(arena.neighbors(ids[0], 0), &[] as &[u64]);
        assert_eq!(arena.neighbors(ids[2], 0), &[] as &[u64]);
        assert!(!arena.contains(ids[1]));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_no_self_loops_or_duplicates() {
        let (mut arena, ids) = arena_with(2);
        arena.add_edge(ids[0], ids[0], 0);
        arena.add_edge(ids[0], ids[1], 0);
        arena.add_edge(ids[0], ids[1], 0);
        assert_eq!(arena.neighbors(ids[0], 0), &[ids[1]]);
    }

    #[test]
    fn test_entry_point_reelection() {
        let mut arena = GraphArena::new();
        let low = arena.allocate(vec![0.0], 0, NodeMetadata::default());
        let high = arena.allocate(vec![1.0], 3, NodeMetadata::default());
        arena.set_entry_point(Some(high));

        arena.remove(high);
        assert_eq!(arena.entry_point(), Some(low));

        arena.remove(low);
        assert_eq!(arena.entry_point(), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_sweep_tombstones() {
        let (mut arena, ids) = arena_with(4);
        arena.remove(ids[0]);
        arena.remove(ids[2]);
        assert_eq!(arena.tombstone_count(), 2);
        assert_eq!(arena.sweep_tombstones(), 2);
        assert_eq!(arena.tombstone_count(), 0);
        assert!(arena.contains(ids[1]));
        assert!(arena.contains(ids[3]));
    }

    #[test]
    fn test_restore_keeps_ids_ahead() {
        let mut arena = GraphArena::new();
        arena.restore(NodeRecord {
            id: 41,
            level: 0,
            vector: vec![1.0],
            metadata: NodeMetadata::default(),
            neighbors: vec![vec![]],
            deleted: false,
        });
        let next = arena.allocate(vec![2.0], 0, NodeMetadata::default());
        assert_eq!(next, 42);
    }
}
