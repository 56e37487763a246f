//! Recently seen message ids
//!
//! The loop guard stops a message from cycling back through a context that
//! relayed it, but with several transports the same message can also arrive
//! along two independent paths. This bounded window drops the second copy.

use std::collections::{HashSet, VecDeque};

pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        SeenCache {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns false if it was already in the window
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut seen = SeenCache::new(8);
        assert!(seen.insert("m1"));
        assert!(!seen.insert("m1"));
        assert!(seen.contains("m1"));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut seen = SeenCache::new(2);
        seen.insert("a");
        seen.insert("b");
        seen.insert("c");

        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("a"));
    }

    proptest! {
        #[test]
        fn prop_bounded_and_keeps_recent(ids in proptest::collection::vec(0u16..64, 0..200), cap in 1usize..32) {
            let mut seen = SeenCache::new(cap);
            for id in &ids {
                seen.insert(&id.to_string());
                prop_assert!(seen.len() <= cap);
            }
            if let Some(last) = ids.last() {
                prop_assert!(seen.contains(&last.to_string()));
            }
        }
    }
}
