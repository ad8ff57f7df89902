//! Disjoint-set forest over arbitrary keys.
//!
//! Keys are interned into dense indices on first sight, so `find` and
//! `union` on an unknown key silently create a singleton set. Path
//! compression plus union-by-rank give amortized O(α(n)) operations.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct UnionFind<K> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl<K: Eq + Hash + Clone + Ord> UnionFind<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            keys: Vec::new(),
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            parent: Vec::with_capacity(capacity),
            rank: Vec::with_capacity(capacity),
        }
    }

    /// Number of keys seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Register `key` as a singleton set if it is not known yet.
    pub fn make_set(&mut self, key: K) {
        self.slot(key);
    }

    /// Representative of the set containing `key`.
    pub fn find(&mut self, key: &K) -> K {
        let slot = self.slot(key.clone());
        let root = self.root(slot);
        self.keys[root].clone()
    }

    /// Whether `a` and `b` are in the same set.
    pub fn connected(&mut self, a: &K, b: &K) -> bool {
        let sa = self.slot(a.clone());
        let sb = self.slot(b.clone());
        self.root(sa) == self.root(sb)
    }

    /// Merge the sets containing `a` and `b`. Returns `false` if they were
    /// already joined.
    pub fn union(&mut self, a: &K, b: &K) -> bool {
        let sa = self.slot(a.clone());
        let sb = self.slot(b.clone());
        let mut ra = self.root(sa);
        let mut rb = self.root(sb);
        if ra == rb {
            return false;
        }
        if self.rank[ra] < self.rank[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        if self.rank[ra] == self.rank[rb] {
            self.rank[ra] = self.rank[ra].saturating_add(1);
        }
        true
    }

    /// All sets, each sorted, ordered by their smallest member.
    ///
    /// Singletons are included; the output is deterministic regardless of
    /// insertion or union order.
    pub fn groups(&mut self) -> Vec<Vec<K>> {
        let mut by_root: HashMap<usize, Vec<K>> = HashMap::new();
        for slot in 0..self.keys.len() {
            let root = self.root(slot);
            by_root
                .entry(root)
                .or_default()
                .push(self.keys[slot].clone());
        }

        let mut ordered: BTreeMap<K, Vec<K>> = BTreeMap::new();
        for (_, mut members) in by_root {
            members.sort();
            if let Some(first) = members.first().cloned() {
                ordered.insert(first, members);
            }
        }
        ordered.into_values().collect()
    }

    fn slot(&mut self, key: K) -> usize {
        if let Some(&slot) = self.index.get(&key) {
            return slot;
        }
        let slot = self.keys.len();
        self.index.insert(key.clone(), slot);
        self.keys.push(key);
        self.parent.push(slot);
        self.rank.push(0);
        slot
    }

    fn root(&mut self, slot: usize) -> usize {
        let mut root = slot;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Second pass: point every node on the path straight at the root.
        let mut cursor = slot;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }
}
