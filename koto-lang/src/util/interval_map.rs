use std::{collections::BTreeMap, ops::Range};

/// Piecewise-constant map from keys to values, stored as boundaries.
///
/// Each boundary holds the value in effect from that key up to the next
/// boundary; `None` marks a gap.
#[derive(Debug, Clone)]
pub struct IntervalMap<K, V> {
    boundaries: BTreeMap<K, Option<V>>,
}

impl<K, V> Default for IntervalMap<K, V> {
    fn default() -> Self {
        Self {
            boundaries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Copy, V: Clone + PartialEq> IntervalMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.boundaries
            .range(..=key)
            .next_back()
            .and_then(|(_, value)| value.as_ref())
    }

    /// Assigns `value` to `range`, leaving everything outside untouched.
    pub fn set(&mut self, range: Range<K>, value: V) {
        let Range { start, end } = range;
        if start >= end {
            return;
        }

        let before_start = self
            .boundaries
            .range(..start)
            .next_back()
            .and_then(|(_, value)| value.clone());
        let old_end = self.get(end).cloned();

        let covered = self
            .boundaries
            .range(start..end)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in covered {
            self.boundaries.remove(&key);
        }

        if before_start.as_ref() != Some(&value) {
            self.boundaries.insert(start, Some(value.clone()));
        }

        if old_end.as_ref() == Some(&value) {
            self.boundaries.remove(&end);
        } else {
            self.boundaries.insert(end, old_end);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_is_empty_by_default() {
        let map = IntervalMap::<i32, &str>::new();
        assert_eq!(map.get(-1), None);
        assert_eq!(map.get(0), None);
    }

    #[test]
    fn it_restores_after_end() {
        let mut map = IntervalMap::new();
        map.set(1..4, "a");
        assert_eq!(map.get(0), None);
        assert_eq!(map.get(1), Some(&"a"));
        assert_eq!(map.get(3), Some(&"a"));
        assert_eq!(map.get(4), None);
        assert_eq!(map.get(100), None);
    }

    #[test]
    fn it_splits_on_overlap() {
        let mut map = IntervalMap::new();
        map.set(1..4, "a");
        map.set(2..3, "b");
        assert_eq!(map.get(1), Some(&"a"));
        assert_eq!(map.get(2), Some(&"b"));
        assert_eq!(map.get(3), Some(&"a"));
        assert_eq!(map.get(4), None);
    }

    #[test]
    fn it_merges_adjacent_equal_values() {
        let mut map = IntervalMap::new();
        map.set(1..3, "a");
        map.set(3..5, "a");
        assert_eq!(map.get(0), None);
        assert_eq!(map.get(2), Some(&"a"));
        assert_eq!(map.get(3), Some(&"a"));
        assert_eq!(map.get(4), Some(&"a"));
        assert_eq!(map.get(5), None);
        assert_eq!(map.boundaries.len(), 2);
    }

    #[test]
    fn it_ignores_empty_ranges() {
        let mut map = IntervalMap::new();
        map.set(1..2, "a");
        map.set(5..5, "x");
        #[allow(clippy::reversed_empty_ranges)]
        map.set(6..4, "y");
        assert_eq!(map.get(1), Some(&"a"));
        assert_eq!(map.get(2), None);
        assert_eq!(map.get(5), None);
    }
}
