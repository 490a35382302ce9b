//! Observed-Remove Set CRDT.
//!
//! Additions mint unique tags (node id + counter); removal tombstones
//! every tag observed for the element. Merge unions both sides, so it
//! is commutative, associative, and idempotent, and a removal never
//! cancels an addition it has not observed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique tag attached to each addition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dot {
    pub node_id: String,
    pub counter: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrSet {
    node_id: String,
    counter: u64,
    adds: BTreeMap<String, BTreeSet<Dot>>,
    removes: BTreeMap<String, BTreeSet<Dot>>,
}

impl OrSet {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
            adds: BTreeMap::new(),
            removes: BTreeMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add an element with a fresh unique tag.
    pub fn add(&mut self, element: impl Into<String>) {
        self.counter += 1;
        let dot = Dot {
            node_id: self.node_id.clone(),
            counter: self.counter,
        };
        self.adds.entry(element.into()).or_default().insert(dot);
    }

    /// Remove an element by tombstoning every tag observed so far.
    /// Unobserved concurrent additions survive.
    pub fn remove(&mut self, element: &str) {
        if let Some(dots) = self.adds.get(element) {
            let observed: BTreeSet<Dot> = dots.clone();
            self.removes
                .entry(element.to_string())
                .or_default()
                .extend(observed);
        }
    }

    /// An element is present iff it has at least one add tag that has
    /// not been tombstoned.
    pub fn contains(&self, element: &str) -> bool {
        let Some(added) = self.adds.get(element) else {
            return false;
        };
        match self.removes.get(element) {
            Some(removed) => added.difference(removed).next().is_some(),
            None => !added.is_empty(),
        }
    }

    /// Current value: the set of visible elements.
    pub fn elements(&self) -> BTreeSet<String> {
        self.adds
            .keys()
            .filter(|element| self.contains(element))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adds
            .keys()
            .filter(|element| self.contains(element))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge another replica into this one (tag-set union both ways).
    pub fn merge(&mut self, other: &OrSet) {
        for (element, dots) in &other.adds {
            self.adds.entry(element.clone()).or_default().extend(dots.iter().cloned());
        }
        for (element, dots) in &other.removes {
            self.removes
                .entry(element.clone())
                .or_default()
                .extend(dots.iter().cloned());
        }
    }

    /// Pure merge, convenient for property checks.
    pub fn merged(mut a: OrSet, b: &OrSet) -> OrSet {
        a.merge(b);
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_contains() {
        let mut set = OrSet::new("a");
        set.add("x");
        assert!(set.contains("x"));
        set.remove("x");
        assert!(!set.contains("x"));
        assert!(set.is_empty());

        // Re-adding after removal mints a fresh tag and is visible.
        set.add("x");
        assert!(set.contains("x"));
    }

    #[test]
    fn test_remove_unobserved_is_noop() {
        let mut set = OrSet::new("a");
        set.remove("ghost");
        assert!(!set.contains("ghost"));
        assert!(set.removes.is_empty());
    }

    #[test]
    fn test_merge_commutative() {
        let mut a = OrSet::new("a");
        let mut b = OrSet::new("b");
        a.add("x");
        b.add("y");
        a.remove("x");

        let ab = OrSet::merged(a.clone(), &b);
        let ba = OrSet::merged(b.clone(), &a);
        assert_eq!(ab.elements(), ba.elements());
        let expected: BTreeSet<String> = ["y".to_string()].into();
        assert_eq!(ab.elements(), expected);
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a = OrSet::new("a");
        a.add("x");
        a.add("y");
        a.remove("y");
        let merged = OrSet::merged(a.clone(), &a);
        assert_eq!(merged.elements(), a.elements());
    }

    #[test]
    fn test_merge_associative() {
        let mut a = OrSet::new("a");
        let mut b = OrSet::new("b");
        let mut c = OrSet::new("c");
        a.add("1");
        b.add("2");
        c.add("3");
        b.remove("2");

        let left = OrSet::merged(OrSet::merged(a.clone(), &b), &c);
        let right = OrSet::merged(a.clone(), &OrSet::merged(b.clone(), &c));
        assert_eq!(left.elements(), right.elements());
    }

    #[test]
    fn test_concurrent_add_survives_remove() {
        // A and B both start empty. A adds x and replicates to B.
        let mut a = OrSet::new("a");
        a.add("x");
        let mut b = OrSet::new("b");
        b.merge(&a);

        // Concurrently: B removes x (observing A's tag), A re-adds x.
        b.remove("x");
        a.add("x");

        // After convergence the re-add's unobserved tag wins.
        let converged = OrSet::merged(a, &b);
        assert!(converged.contains("x"));
    }

    #[test]
    fn test_observed_remove_wins_when_all_tags_seen() {
        let mut a = OrSet::new("a");
        a.add("x");
        let mut b = OrSet::new("b");
        b.merge(&a);
        b.remove("x");

        let converged = OrSet::merged(a, &b);
        assert!(!converged.contains("x"));
    }
}
