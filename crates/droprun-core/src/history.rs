//! Fixed-capacity history with oldest-first eviction.

use std::collections::vec_deque::{self, VecDeque};

/// An append-only history that keeps at most `capacity` entries.
///
/// Inserting past capacity evicts the oldest entry. Runners keep one of these
/// per task to avoid reusing a proxy that was just banned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryBuffer<T> {
    /// Create an empty buffer holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted oldest entry if the buffer was full.
    pub fn insert(&mut self, item: T) -> Option<T> {
        self.items.push_back(item);
        if self.items.len() > self.capacity {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Remove and return the newest entry.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    /// Remove and return the oldest entry.
    pub fn shift(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Newest entry.
    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest entry.
    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: PartialEq> HistoryBuffer<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// Remove entries equal to `item`, scanning from index `from` (oldest is 0).
    ///
    /// Removes only the first match unless `all` is set. Remaining entries keep
    /// their relative order. Returns the number of entries removed.
    pub fn remove(&mut self, item: &T, from: usize, all: bool) -> usize {
        let mut removed = 0;
        let mut index = 0;
        self.items.retain(|existing| {
            let keep = index < from || (!all && removed > 0) || existing != item;
            if !keep {
                removed += 1;
            }
            index += 1;
            keep
        });
        removed
    }
}

impl<'a, T> IntoIterator for &'a HistoryBuffer<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents<T: Clone>(buffer: &HistoryBuffer<T>) -> Vec<T> {
        buffer.iter().cloned().collect()
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let mut buffer = HistoryBuffer::new(3);
        assert_eq!(buffer.insert("P1"), None);
        assert_eq!(buffer.insert("P2"), None);
        assert_eq!(buffer.insert("P3"), None);
        assert_eq!(buffer.insert("P4"), Some("P1"));

        assert_eq!(contents(&buffer), vec!["P2", "P3", "P4"]);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_capacity_n_plus_one_leaves_n() {
        let n = 7;
        let mut buffer = HistoryBuffer::new(n);
        let mut evicted = Vec::new();
        for i in 0..=n {
            if let Some(old) = buffer.insert(i) {
                evicted.push(old);
            }
        }
        assert_eq!(buffer.len(), n);
        assert_eq!(evicted, vec![0]);
        assert!(!buffer.contains(&0));
    }

    #[test]
    fn test_pop_and_shift() {
        let mut buffer = HistoryBuffer::new(4);
        buffer.insert(1);
        buffer.insert(2);
        buffer.insert(3);

        assert_eq!(buffer.pop(), Some(3));
        assert_eq!(buffer.shift(), Some(1));
        assert_eq!(contents(&buffer), vec![2]);
        assert_eq!(buffer.newest(), buffer.oldest());
    }

    #[test]
    fn test_remove_first_occurrence() {
        let mut buffer = HistoryBuffer::new(6);
        for item in ["a", "b", "a", "c", "a"] {
            buffer.insert(item);
        }

        assert_eq!(buffer.remove(&"a", 0, false), 1);
        assert_eq!(contents(&buffer), vec!["b", "a", "c", "a"]);
    }

    #[test]
    fn test_remove_all_from_index() {
        let mut buffer = HistoryBuffer::new(6);
        for item in ["a", "b", "a", "c", "a"] {
            buffer.insert(item);
        }

        assert_eq!(buffer.remove(&"a", 1, true), 2);
        assert_eq!(contents(&buffer), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut buffer = HistoryBuffer::new(2);
        buffer.insert("x");
        assert_eq!(buffer.remove(&"y", 0, true), 0);
        assert_eq!(buffer.remove(&"x", 5, true), 0);
        assert_eq!(contents(&buffer), vec!["x"]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut buffer = HistoryBuffer::new(0);
        assert_eq!(buffer.insert(1), Some(1));
        assert!(buffer.is_empty());
    }
}
