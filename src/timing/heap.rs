//! Indexed binary min-heap of timer deadlines.
//!
//! A plain `BinaryHeap` cannot cancel or reschedule by id, so this keeps a
//! side map from timer id to heap position and repairs it on every swap.
//! Ordering is by `(deadline, id)`; ids are allocated monotonically, so
//! timers armed for the same instant fire in arm order.

use std::collections::HashMap;

use minstant::Instant;

struct Node<T> {
    id: u32,
    deadline: Instant,
    payload: T,
}

impl<T> Node<T> {
    #[inline]
    fn key(&self) -> (Instant, u32) {
        (self.deadline, self.id)
    }
}

pub struct TimerHeap<T> {
    nodes: Vec<Node<T>>,
    positions: HashMap<u32, usize>,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.positions.contains_key(&id)
    }

    /// Earliest deadline currently armed.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.nodes.first().map(|n| n.deadline)
    }

    /// Insert a timer. The id must not already be present.
    pub fn insert(&mut self, id: u32, deadline: Instant, payload: T) {
        debug_assert!(!self.positions.contains_key(&id));
        let pos = self.nodes.len();
        self.nodes.push(Node {
            id,
            deadline,
            payload,
        });
        self.positions.insert(id, pos);
        self.sift_up(pos);
    }

    /// Pop the root if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(u32, Instant, T)> {
        let root = self.nodes.first()?;
        if root.deadline > now {
            return None;
        }
        let node = self.remove_at(0);
        Some((node.id, node.deadline, node.payload))
    }

    /// Remove a timer by id, returning its payload if it was armed.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let pos = self.positions.get(&id).copied()?;
        Some(self.remove_at(pos).payload)
    }

    /// Move an armed timer to a new deadline. Returns false for unknown ids.
    pub fn update(&mut self, id: u32, deadline: Instant) -> bool {
        let Some(&pos) = self.positions.get(&id) else {
            return false;
        };
        let old = self.nodes[pos].deadline;
        self.nodes[pos].deadline = deadline;
        if deadline < old {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
        true
    }

    fn remove_at(&mut self, pos: usize) -> Node<T> {
        let last = self.nodes.len() - 1;
        self.nodes.swap(pos, last);
        let node = self.nodes.pop().unwrap();
        self.positions.remove(&node.id);
        if pos < self.nodes.len() {
            self.positions.insert(self.nodes[pos].id, pos);
            // The swapped-in node may belong in either direction.
            self.sift_up(pos);
            self.sift_down(pos);
        }
        node
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.nodes[pos].key() >= self.nodes[parent].key() {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.nodes[right].key() < self.nodes[left].key() {
                smallest = right;
            }
            if self.nodes[smallest].key() >= self.nodes[pos].key() {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.nodes.swap(a, b);
        self.positions.insert(self.nodes[a].id, a);
        self.positions.insert(self.nodes[b].id, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(anchor: Instant, ms: u64) -> Instant {
        anchor + Duration::from_millis(ms)
    }

    #[test]
    fn pops_in_deadline_order() {
        let anchor = Instant::now();
        let mut h = TimerHeap::new();
        h.insert(1, at(anchor, 30), "c");
        h.insert(2, at(anchor, 10), "a");
        h.insert(3, at(anchor, 20), "b");

        let far = at(anchor, 100);
        let order: Vec<_> = std::iter::from_fn(|| h.pop_due(far).map(|(_, _, p)| p)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(h.is_empty());
    }

    #[test]
    fn equal_deadlines_pop_in_id_order() {
        let anchor = Instant::now();
        let deadline = at(anchor, 10);
        let mut h = TimerHeap::new();
        h.insert(7, deadline, 7u32);
        h.insert(3, deadline, 3u32);
        h.insert(5, deadline, 5u32);

        let far = at(anchor, 100);
        let order: Vec<_> = std::iter::from_fn(|| h.pop_due(far).map(|(id, _, _)| id)).collect();
        assert_eq!(order, vec![3, 5, 7]);
    }

    #[test]
    fn not_due_stays_put() {
        let anchor = Instant::now();
        let mut h = TimerHeap::new();
        h.insert(1, at(anchor, 50), ());
        assert!(h.pop_due(at(anchor, 49)).is_none());
        assert_eq!(h.len(), 1);
        assert!(h.pop_due(at(anchor, 50)).is_some());
    }

    #[test]
    fn remove_middle_keeps_order() {
        let anchor = Instant::now();
        let mut h = TimerHeap::new();
        for (id, ms) in [(1, 40), (2, 10), (3, 30), (4, 20), (5, 50)] {
            h.insert(id, at(anchor, ms), id);
        }
        assert_eq!(h.remove(3), Some(3));
        assert!(!h.contains(3));

        let far = at(anchor, 100);
        let order: Vec<_> = std::iter::from_fn(|| h.pop_due(far).map(|(id, _, _)| id)).collect();
        assert_eq!(order, vec![2, 4, 1, 5]);
    }

    #[test]
    fn update_repositions_both_directions() {
        let anchor = Instant::now();
        let mut h = TimerHeap::new();
        h.insert(1, at(anchor, 10), ());
        h.insert(2, at(anchor, 20), ());
        h.insert(3, at(anchor, 30), ());

        // push the earliest to the back, pull the latest to the front
        assert!(h.update(1, at(anchor, 90)));
        assert!(h.update(3, at(anchor, 5)));
        assert!(!h.update(99, at(anchor, 1)));

        let far = at(anchor, 100);
        let order: Vec<_> = std::iter::from_fn(|| h.pop_due(far).map(|(id, _, _)| id)).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn peek_tracks_root() {
        let anchor = Instant::now();
        let mut h = TimerHeap::new();
        assert!(h.peek_deadline().is_none());
        h.insert(1, at(anchor, 20), ());
        h.insert(2, at(anchor, 10), ());
        assert_eq!(h.peek_deadline(), Some(at(anchor, 10)));
        h.remove(2);
        assert_eq!(h.peek_deadline(), Some(at(anchor, 20)));
    }
}
