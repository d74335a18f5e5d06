//! Weighted-deficit stream scheduler.
//!
//! Streams live in a slab of records indexed by slot, each carrying an
//! explicit parent id instead of tree pointers. Streams with output ready sit
//! on a ring; every time a stream reaches the front of the ring its deficit is
//! topped up by `quantum * weight / 16`, and it keeps the turn while the
//! deficit stays positive. Over any window a stream's share of write
//! opportunities is proportional to its weight.
//!
//! Dependencies are honoured one level deep: a stream whose parent has
//! output ready waits for the parent to drain.
//!
//! HTTP/3 reuses the scheduler with every stream at the root and the weight
//! derived from the extensible-priority urgency.

use std::collections::{HashMap, VecDeque};

/// RFC 9113 §5.3.5 default weight.
pub const DEFAULT_WEIGHT: u16 = 16;

/// Default top-up per weight unit in bytes (one max-size DATA frame at weight 16).
pub const DEFAULT_QUANTUM: u32 = 16_384;

#[derive(Debug, Clone, Copy)]
struct Node {
    id: u64,
    parent: u64,
    weight: u16,
    deficit: i64,
    ready: bool,
}

#[derive(Debug)]
pub struct PriorityScheduler {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    by_id: HashMap<u64, usize>,
    ring: VecDeque<usize>,
    quantum: u32,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_QUANTUM)
    }
}

impl PriorityScheduler {
    pub fn new(quantum: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            ring: VecDeque::new(),
            quantum: quantum.max(16),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Register a stream. `weight` is clamped to 1..=256; a parent that is
    /// unknown or the stream itself is replaced by the root (0).
    ///
    /// With `exclusive` the new stream adopts every existing child of
    /// `parent` (RFC 9113 §5.3.1).
    pub fn insert(&mut self, id: u64, parent: u64, weight: u16, exclusive: bool) {
        if self.by_id.contains_key(&id) {
            self.update(id, parent, weight, exclusive);
            return;
        }
        let parent = self.valid_parent(id, parent);
        if exclusive {
            self.adopt_children(parent, id);
        }
        let node = Node { id, parent, weight: weight.clamp(1, 256), deficit: 0, ready: false };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, slot);
    }

    /// Reprioritise an existing stream. Moving a stream under one of its own
    /// descendants first lifts that descendant to the stream's old parent
    /// (RFC 7540 §5.3.3).
    pub fn update(&mut self, id: u64, parent: u64, weight: u16, exclusive: bool) {
        let Some(&slot) = self.by_id.get(&id) else {
            self.insert(id, parent, weight, exclusive);
            return;
        };
        let parent = self.valid_parent(id, parent);
        if parent != 0 && self.is_descendant(parent, id) {
            let old_parent = self.node(slot).map_or(0, |n| n.parent);
            if let Some(&p) = self.by_id.get(&parent)
                && let Some(n) = self.slots[p].as_mut()
            {
                n.parent = old_parent;
            }
        }
        if exclusive {
            self.adopt_children(parent, id);
        }
        if let Some(n) = self.slots[slot].as_mut() {
            n.parent = parent;
            n.weight = weight.clamp(1, 256);
        }
    }

    /// Forget a stream. Its children move up to its parent.
    pub fn remove(&mut self, id: u64) {
        let Some(slot) = self.by_id.remove(&id) else { return };
        let parent = self.node(slot).map_or(0, |n| n.parent);
        for n in self.slots.iter_mut().flatten() {
            if n.parent == id {
                n.parent = parent;
            }
        }
        self.ring.retain(|&s| s != slot);
        self.slots[slot] = None;
        self.free.push(slot);
    }

    /// Mark whether the stream has output waiting.
    pub fn set_ready(&mut self, id: u64, ready: bool) {
        let Some(&slot) = self.by_id.get(&id) else { return };
        let Some(node) = self.slots[slot].as_mut() else { return };
        if node.ready == ready {
            return;
        }
        node.ready = ready;
        if ready {
            self.ring.push_back(slot);
        } else {
            self.ring.retain(|&s| s != slot);
        }
    }

    /// Whether any stream has output waiting.
    pub fn has_ready(&self) -> bool {
        !self.ring.is_empty()
    }

    pub fn is_ready(&self, id: u64) -> bool {
        self.by_id.get(&id).and_then(|&s| self.node(s)).is_some_and(|n| n.ready)
    }

    /// The stream that should write next, if any is ready.
    pub fn next(&mut self) -> Option<u64> {
        if self.ring.is_empty() {
            return None;
        }
        // Each rotation tops up an eligible stream, so a positive deficit is
        // reached after a bounded number of turns.
        loop {
            let &front = self.ring.front()?;
            let node = self.node(front)?;
            if !self.parent_ready(node.parent) && node.deficit > 0 {
                return Some(node.id);
            }
            self.ring.rotate_left(1);
            let &front = self.ring.front()?;
            let quantum = self.quantum as i64;
            let eligible = self.node(front).is_some_and(|n| !self.parent_ready(n.parent));
            if eligible && let Some(n) = self.slots[front].as_mut() {
                n.deficit += quantum * n.weight as i64 / DEFAULT_WEIGHT as i64;
            }
        }
    }

    /// Charge `bytes` written by `id` against its deficit.
    pub fn charge(&mut self, id: u64, bytes: usize) {
        let Some(&slot) = self.by_id.get(&id) else { return };
        if let Some(n) = self.slots[slot].as_mut() {
            n.deficit -= bytes as i64;
        }
    }

    pub fn weight(&self, id: u64) -> Option<u16> {
        self.by_id.get(&id).and_then(|&s| self.node(s)).map(|n| n.weight)
    }

    pub fn parent(&self, id: u64) -> Option<u64> {
        self.by_id.get(&id).and_then(|&s| self.node(s)).map(|n| n.parent)
    }

    fn node(&self, slot: usize) -> Option<Node> {
        self.slots.get(slot).copied().flatten()
    }

    fn parent_ready(&self, parent: u64) -> bool {
        parent != 0 && self.is_ready(parent)
    }

    fn valid_parent(&self, id: u64, parent: u64) -> u64 {
        if parent == id || !self.by_id.contains_key(&parent) { 0 } else { parent }
    }

    /// Whether `candidate` sits somewhere below `ancestor`.
    fn is_descendant(&self, candidate: u64, ancestor: u64) -> bool {
        let mut cur = candidate;
        for _ in 0..=self.by_id.len() {
            match self.parent(cur) {
                Some(0) | None => return false,
                Some(p) if p == ancestor => return true,
                Some(p) => cur = p,
            }
        }
        false
    }

    fn adopt_children(&mut self, parent: u64, new_parent: u64) {
        for n in self.slots.iter_mut().flatten() {
            if n.parent == parent && n.id != new_parent {
                n.parent = new_parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(s: &mut PriorityScheduler, picks: usize, frame: usize) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for _ in 0..picks {
            let id = s.next().unwrap();
            s.charge(id, frame);
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn shares_follow_weights() {
        let mut s = PriorityScheduler::default();
        for (id, w) in [(1, 1), (3, 1), (5, 2)] {
            s.insert(id, 0, w, false);
            s.set_ready(id, true);
        }
        let counts = run(&mut s, 400, 16_384);
        let (a, b, c) = (counts[&1], counts[&3], counts[&5]);
        assert!((95..=105).contains(&a), "{counts:?}");
        assert!((95..=105).contains(&b), "{counts:?}");
        assert!((195..=205).contains(&c), "{counts:?}");
    }

    #[test]
    fn idle_streams_are_skipped() {
        let mut s = PriorityScheduler::default();
        s.insert(1, 0, 16, false);
        s.insert(3, 0, 16, false);
        s.set_ready(3, true);
        for _ in 0..5 {
            let id = s.next().unwrap();
            assert_eq!(id, 3);
            s.charge(id, 1000);
        }
        s.set_ready(3, false);
        assert_eq!(s.next(), None);
    }

    #[test]
    fn child_waits_for_ready_parent() {
        let mut s = PriorityScheduler::default();
        s.insert(1, 0, 16, false);
        s.insert(3, 1, 16, false);
        s.set_ready(1, true);
        s.set_ready(3, true);
        for _ in 0..4 {
            let id = s.next().unwrap();
            assert_eq!(id, 1);
            s.charge(id, 16_384);
        }
        s.set_ready(1, false);
        assert_eq!(s.next(), Some(3));
    }

    #[test]
    fn exclusive_insert_adopts_siblings() {
        let mut s = PriorityScheduler::default();
        s.insert(1, 0, 16, false);
        s.insert(3, 0, 16, false);
        s.insert(5, 0, 16, true);
        assert_eq!(s.parent(1), Some(5));
        assert_eq!(s.parent(3), Some(5));
        assert_eq!(s.parent(5), Some(0));
    }

    #[test]
    fn self_dependency_and_unknown_parent_fall_back_to_root() {
        let mut s = PriorityScheduler::default();
        s.insert(1, 1, 300, false);
        assert_eq!(s.parent(1), Some(0));
        assert_eq!(s.weight(1), Some(256));
        s.insert(3, 99, 0, false);
        assert_eq!(s.parent(3), Some(0));
        assert_eq!(s.weight(3), Some(1));
    }

    #[test]
    fn moving_under_descendant_lifts_it() {
        let mut s = PriorityScheduler::default();
        s.insert(1, 0, 16, false);
        s.insert(3, 1, 16, false);
        s.insert(5, 3, 16, false);
        s.update(1, 5, 16, false);
        assert_eq!(s.parent(5), Some(0));
        assert_eq!(s.parent(1), Some(5));
    }

    #[test]
    fn remove_reparents_children() {
        let mut s = PriorityScheduler::default();
        s.insert(1, 0, 16, false);
        s.insert(3, 1, 16, false);
        s.set_ready(1, true);
        s.remove(1);
        assert_eq!(s.parent(3), Some(0));
        assert!(!s.contains(1));
        assert_eq!(s.next(), None);
        s.insert(7, 0, 16, false);
        assert_eq!(s.len(), 2);
    }
}
