//! Deduplicating sorter for plain objects

use std::fmt;
use std::hash::Hash;

use tracing::debug;

use crate::domain::{Point, PointRegistry, Range};

use super::core::Sorter;

/// Set of arbitrary objects ordered by when each was first seen
///
/// `stack_mode = true` hands out the most recently first-seen objects first;
/// `false` hands out the oldest first.
pub struct ObjectSorter<O: Hash + Eq> {
    points: PointRegistry<O>,
    sorter: Sorter<Point<O>>,
}

impl<O> ObjectSorter<O>
where
    O: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            points: PointRegistry::new(),
            sorter: Sorter::new(),
        }
    }

    pub fn put(&self, obj: O) {
        self.sorter.put(Range::point(self.points.intern(obj)));
    }

    /// Remove and return up to `limit` objects after `prev`
    pub fn take(&self, prev: Option<O>, limit: usize, stack_mode: bool) -> Vec<O> {
        let prev = prev.map(|obj| self.points.intern(obj));
        let objects = unwrap_points(self.sorter.take_more(prev.as_ref(), limit, !stack_mode));
        debug!(count = objects.len(), stack_mode, "ObjectSorter::take: taken");
        objects
    }

    /// Return up to `limit` objects after `prev` without removing them
    pub fn get(&self, prev: Option<O>, limit: usize, stack_mode: bool) -> Vec<O> {
        let prev = prev.map(|obj| self.points.intern(obj));
        unwrap_points(self.sorter.get_more(prev.as_ref(), limit, !stack_mode))
    }

    /// Remove and return the next object after `prev`
    pub fn take_one(&self, prev: Option<O>, stack_mode: bool) -> Option<O> {
        let prev = prev.map(|obj| self.points.intern(obj));
        self.sorter
            .take_serial(prev.as_ref(), 1, !stack_mode)
            .map(|range| range.from().get().clone())
    }

    /// Return the next object after `prev` without removing it
    pub fn get_one(&self, prev: Option<O>, stack_mode: bool) -> Option<O> {
        let prev = prev.map(|obj| self.points.intern(obj));
        self.sorter
            .get_serial(prev.as_ref(), 1, !stack_mode)
            .map(|range| range.from().get().clone())
    }

    pub fn contains(&self, obj: O) -> bool {
        let point = self.points.intern(obj);
        self.sorter.contains(&point, &point)
    }

    /// Remove `obj`; returns whether any objects remain
    pub fn remove(&self, obj: O) -> bool {
        let point = self.points.intern(obj);
        self.sorter.remove(&point, &point)
    }

    pub fn has_more(&self) -> bool {
        self.sorter.has_more()
    }
}

impl<O> Default for ObjectSorter<O>
where
    O: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn unwrap_points<O>(ranges: Vec<Range<Point<O>>>) -> Vec<O>
where
    O: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    ranges.into_iter().map(|range| range.from().get().clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(items: &[&'static str]) -> ObjectSorter<&'static str> {
        let sorter = ObjectSorter::new();
        for &item in items {
            sorter.put(item);
        }
        sorter
    }

    #[test]
    fn test_duplicates_collapse() {
        let sorter = filled(&["a", "b", "a", "a"]);
        assert_eq!(sorter.get(None, 10, false), vec!["a", "b"]);
    }

    #[test]
    fn test_stack_mode_returns_newest_first() {
        let sorter = filled(&["a", "b", "c"]);
        assert_eq!(sorter.take(None, 2, true), vec!["c", "b"]);
        assert_eq!(sorter.take(None, 2, true), vec!["a"]);
        assert!(!sorter.has_more());
    }

    #[test]
    fn test_queue_mode_returns_oldest_first() {
        let sorter = filled(&["a", "b", "c"]);
        assert_eq!(sorter.take_one(None, false), Some("a"));
        assert_eq!(sorter.get_one(None, false), Some("b"));
        assert_eq!(sorter.get(Some("b"), 5, false), vec!["c"]);
    }

    #[test]
    fn test_contains_and_remove() {
        let sorter = filled(&["a", "b"]);
        assert!(sorter.contains("a"));
        assert!(sorter.remove("a"));
        assert!(!sorter.contains("a"));
        assert!(!sorter.remove("b"));
        assert!(!sorter.has_more());
    }
}
