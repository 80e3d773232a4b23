//! A bounded set used to detect duplicate message ids: insertion-order
//! eviction once capacity is exceeded, with `add` reporting whether the
//! element was already present.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;

/// Default capacity used when a caller doesn't specify one, matching the
/// window over which this bus expects duplicate deliveries to be possible.
pub const DEFAULT_CAPACITY: usize = 20_000;

/// A fixed-capacity set that evicts the oldest-inserted element once full.
pub struct LimitedSet<T: Eq + Hash + Clone> {
    capacity: usize,
    elements: HashSet<T>,
    recent: VecDeque<T>,
}

impl<T: Eq + Hash + Clone> LimitedSet<T> {
    pub fn new(capacity: usize) -> Self {
        LimitedSet {
            capacity,
            elements: HashSet::new(),
            recent: VecDeque::new(),
        }
    }

    fn shrink_to(&mut self, capacity: usize) {
        while self.recent.len() > capacity {
            if let Some(oldest) = self.recent.pop_front() {
                self.elements.remove(&oldest);
            }
        }
    }

    /// Inserts `element`, returning `true` only if it had not been seen
    /// before. Evicts the oldest entries once over capacity.
    pub fn add(&mut self, element: T) -> bool {
        if self.elements.contains(&element) {
            return false;
        }
        self.elements.insert(element.clone());
        self.recent.push_back(element);
        self.shrink_to(self.capacity);
        true
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: Eq + Hash + Clone> Default for LimitedSet<T> {
    fn default() -> Self {
        LimitedSet::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_returns_true_then_false() {
        let mut set: LimitedSet<u64> = LimitedSet::new(10);
        assert!(set.add(1));
        assert!(!set.add(1));
    }

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let mut set: LimitedSet<u64> = LimitedSet::new(2);
        set.add(1);
        set.add(2);
        set.add(3);
        assert_eq!(set.len(), 2);
        // 1 was evicted, so it is treated as new again.
        assert!(set.add(1));
        assert!(!set.add(2) || !set.add(3));
    }

    #[test]
    fn zero_capacity_never_remembers() {
        let mut set: LimitedSet<u64> = LimitedSet::new(0);
        assert!(set.add(1));
        assert!(set.add(1));
    }
}
