//! Interval sorter implementation

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::domain::{Discrete, Range, step};
use crate::sync::locked;

/// Extraction bound meaning "no bound"
pub const UNLIMITED: usize = usize::MAX;

/// Thread-safe sorted collection of ranges
///
/// Inserts never coalesce; overlapping and adjacent ranges are only merged
/// when they are extracted. Every operation runs under a single lock, and the
/// `take_*` variants extract and remove under the same guard.
pub struct Sorter<D> {
    ranges: Mutex<BTreeSet<Range<D>>>,
}

impl<D: Discrete> Sorter<D> {
    pub fn new() -> Self {
        Self {
            ranges: Mutex::new(BTreeSet::new()),
        }
    }

    /// Insert a range as-is
    pub fn put(&self, range: Range<D>) {
        trace!(%range, "Sorter::put: called");
        locked(&self.ranges).insert(range);
    }

    /// Insert a single point
    pub fn put_point(&self, d: D) {
        self.put(Range::point(d));
    }

    /// Longest contiguous run after `prev`, bounded by `limit` points
    ///
    /// Scans ascending when `min_first`, otherwise descending, skipping
    /// everything up to and including `prev`. The run stops at the first gap;
    /// if it would exceed `limit`, the last contributing range is truncated so
    /// the result covers exactly `limit` points.
    pub fn get_serial(&self, prev: Option<&D>, limit: usize, min_first: bool) -> Option<Range<D>> {
        let prev = prev.cloned().map(Range::point);
        serial(&locked(&self.ranges), prev.as_ref(), bound(limit), min_first)
    }

    /// Like [`get_serial`](Self::get_serial), removing the returned coverage
    pub fn take_serial(&self, prev: Option<&D>, limit: usize, min_first: bool) -> Option<Range<D>> {
        let prev = prev.cloned().map(Range::point);
        let mut ranges = locked(&self.ranges);
        let run = serial(&ranges, prev.as_ref(), bound(limit), min_first)?;
        remove_locked(&mut ranges, run.from(), run.to());
        debug!(%run, "Sorter::take_serial: extracted");
        Some(run)
    }

    /// Up to `limit` points across several disjoint runs, ordered per `min_first`
    pub fn get_more(&self, prev: Option<&D>, limit: usize, min_first: bool) -> Vec<Range<D>> {
        self.more(prev, limit, min_first, false)
    }

    /// Like [`get_more`](Self::get_more), removing the returned coverage
    pub fn take_more(&self, prev: Option<&D>, limit: usize, min_first: bool) -> Vec<Range<D>> {
        self.more(prev, limit, min_first, true)
    }

    fn more(&self, prev: Option<&D>, limit: usize, min_first: bool, take: bool) -> Vec<Range<D>> {
        let limit = bound(limit);
        let mut ranges = locked(&self.ranges);
        let mut prev = prev.cloned().map(Range::point);
        let mut runs = Vec::new();
        let mut count = 0i64;
        while count < limit {
            let Some(run) = serial(&ranges, prev.as_ref(), limit - count, min_first) else {
                break;
            };
            if take {
                remove_locked(&mut ranges, run.from(), run.to());
            }
            count += run.len();
            prev = Some(run.clone());
            runs.push(run);
        }
        trace!(runs = runs.len(), count, take, "Sorter::more: done");
        runs
    }

    /// Whether the stored coverage includes every point of `[from, to]`
    pub fn contains(&self, from: &D, to: &D) -> bool {
        let ranges = locked(&self.ranges);
        let mut prev: Option<Range<D>> = None;
        while let Some(run) = serial(&ranges, prev.as_ref(), i64::MAX, true) {
            if run.covers(from, to) {
                return true;
            }
            prev = Some(run);
        }
        false
    }

    /// Whether the stored coverage includes every point of `range`
    pub fn contains_range(&self, range: &Range<D>) -> bool {
        self.contains(range.from(), range.to())
    }

    /// Cut `[from, to]` out of every stored range, splitting where needed
    ///
    /// Returns whether any ranges remain.
    pub fn remove(&self, from: &D, to: &D) -> bool {
        let mut ranges = locked(&self.ranges);
        remove_locked(&mut ranges, from, to)
    }

    /// Cut `range` out of every stored range
    pub fn remove_range(&self, range: &Range<D>) -> bool {
        self.remove(range.from(), range.to())
    }

    pub fn has_more(&self) -> bool {
        !locked(&self.ranges).is_empty()
    }

    /// Number of stored (unmerged) ranges
    pub fn len(&self) -> usize {
        locked(&self.ranges).len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_more()
    }
}

impl<D: Discrete> Default for Sorter<D> {
    fn default() -> Self {
        Self::new()
    }
}

fn bound(limit: usize) -> i64 {
    assert!(limit > 0, "extraction limit must be positive");
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Descending scan order: by `to`, then by `from`, both high to low
fn cmp_descending<D: Discrete>(a: &Range<D>, b: &Range<D>) -> Ordering {
    b.to()
        .delta(a.to())
        .cmp(&0)
        .then_with(|| b.from().delta(a.from()).cmp(&0))
}

/// First stored range (or the part of it) lying past `prev` in scan order
fn seed<D: Discrete>(range: &Range<D>, prev: Option<&Range<D>>, min_first: bool) -> Option<Range<D>> {
    let Some(prev) = prev else {
        return Some(range.clone());
    };
    if min_first {
        if range.from().delta(prev.to()) > 0 {
            Some(range.clone())
        } else if range.to().delta(prev.to()) > 0 {
            Some(Range::new(step(prev.to(), 1), range.to().clone()))
        } else {
            None
        }
    } else if range.to().delta(prev.from()) < 0 {
        Some(range.clone())
    } else if range.from().delta(prev.from()) < 0 {
        Some(Range::new(range.from().clone(), step(prev.from(), -1)))
    } else {
        None
    }
}

fn serial<D: Discrete>(
    ranges: &BTreeSet<Range<D>>,
    prev: Option<&Range<D>>,
    limit: i64,
    min_first: bool,
) -> Option<Range<D>> {
    let ordered: Vec<&Range<D>> = if min_first {
        ranges.iter().collect()
    } else {
        let mut v: Vec<&Range<D>> = ranges.iter().collect();
        v.sort_by(|a, b| cmp_descending(a, b));
        v
    };

    // `begin` is the first contributing range; `edge` is the far boundary
    // reached so far (the high end ascending, the low end descending).
    let mut begin: Option<Range<D>> = None;
    let mut edge: Option<D> = None;
    for range in ordered {
        let first = begin.is_none();
        if first {
            let Some(start) = seed(range, prev, min_first) else {
                continue;
            };
            edge = Some(if min_first { start.to().clone() } else { start.from().clone() });
            begin = Some(start);
        }
        let (Some(start), Some(reached)) = (begin.as_ref(), edge.as_mut()) else {
            break;
        };

        if min_first {
            if reached.delta(range.from()) < -1 {
                break;
            }
            if first || range.to().delta(reached) > 0 {
                let span = range.to().delta(start.from()) + 1;
                match span.cmp(&limit) {
                    Ordering::Less => *reached = range.to().clone(),
                    Ordering::Equal => {
                        *reached = range.to().clone();
                        break;
                    }
                    Ordering::Greater => {
                        *reached = step(start.from(), limit - 1);
                        break;
                    }
                }
            }
        } else {
            if reached.delta(range.to()) > 1 {
                break;
            }
            if first || range.from().delta(reached) < 0 {
                let span = start.to().delta(range.from()) + 1;
                match span.cmp(&limit) {
                    Ordering::Less => *reached = range.from().clone(),
                    Ordering::Equal => {
                        *reached = range.from().clone();
                        break;
                    }
                    Ordering::Greater => {
                        *reached = step(start.to(), -(limit - 1));
                        break;
                    }
                }
            }
        }
    }

    let (start, reached) = (begin?, edge?);
    Some(if min_first {
        Range::new(start.from().clone(), reached)
    } else {
        Range::new(reached, start.to().clone())
    })
}

fn remove_locked<D: Discrete>(ranges: &mut BTreeSet<Range<D>>, from: &D, to: &D) -> bool {
    if ranges.is_empty() {
        return false;
    }
    let mut removes = Vec::new();
    let mut adds = Vec::new();
    for range in ranges.iter() {
        let dfm = range.from().delta(from);
        let dto = range.to().delta(to);
        if dfm >= 0 && dto <= 0 {
            removes.push(range.clone());
            continue;
        }
        let mut cut = false;
        if dfm < 0 && range.to().delta(from) >= 0 {
            adds.push(Range::new(range.from().clone(), step(from, -1)));
            cut = true;
        }
        if dto > 0 && range.from().delta(to) <= 0 {
            adds.push(Range::new(step(to, 1), range.to().clone()));
            cut = true;
        }
        if cut {
            removes.push(range.clone());
        }
    }
    for range in &removes {
        ranges.remove(range);
    }
    ranges.extend(adds);
    !ranges.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(from: i64, to: i64) -> Range<i64> {
        Range::new(from, to)
    }

    fn sorter(ranges: &[(i64, i64)]) -> Sorter<i64> {
        let sorter = Sorter::new();
        for &(from, to) in ranges {
            sorter.put(r(from, to));
        }
        sorter
    }

    #[test]
    fn test_put_does_not_merge() {
        let s = sorter(&[(0, 4), (3, 8), (9, 9)]);
        assert_eq!(s.len(), 3);
        assert!(s.has_more());
    }

    #[test]
    fn test_get_serial_merges_overlapping_and_adjacent() {
        let s = sorter(&[(0, 4), (3, 8), (9, 9), (11, 12)]);
        assert_eq!(s.get_serial(None, UNLIMITED, true), Some(r(0, 9)));
        assert_eq!(s.get_serial(None, UNLIMITED, false), Some(r(11, 12)));
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn test_get_serial_truncates_at_limit() {
        let s = sorter(&[(0, 9)]);
        assert_eq!(s.get_serial(None, 5, true), Some(r(0, 4)));
        assert_eq!(s.get_serial(None, 5, false), Some(r(5, 9)));
    }

    #[test]
    fn test_get_serial_exact_limit() {
        let s = sorter(&[(0, 2), (3, 4), (5, 9)]);
        assert_eq!(s.get_serial(None, 5, true), Some(r(0, 4)));
    }

    #[test]
    fn test_get_serial_skips_nested_ranges() {
        let s = sorter(&[(1, 10), (2, 3)]);
        assert_eq!(s.get_serial(None, UNLIMITED, true), Some(r(1, 10)));

        let s = sorter(&[(1, 10), (5, 6)]);
        assert_eq!(s.get_serial(None, UNLIMITED, false), Some(r(1, 10)));
    }

    #[test]
    fn test_get_serial_after_prev() {
        let s = sorter(&[(0, 9), (12, 14)]);
        assert_eq!(s.get_serial(Some(&4), UNLIMITED, true), Some(r(5, 9)));
        assert_eq!(s.get_serial(Some(&9), UNLIMITED, true), Some(r(12, 14)));
        assert_eq!(s.get_serial(Some(&14), UNLIMITED, true), None);
        assert_eq!(s.get_serial(Some(&12), UNLIMITED, false), Some(r(0, 9)));
        assert_eq!(s.get_serial(Some(&5), 3, false), Some(r(2, 4)));
    }

    #[test]
    fn test_get_serial_empty() {
        let s: Sorter<i64> = Sorter::new();
        assert_eq!(s.get_serial(None, 3, true), None);
        assert!(!s.has_more());
    }

    #[test]
    fn test_take_serial_leaves_remainder() {
        let s = sorter(&[(0, 9)]);
        assert_eq!(s.take_serial(None, 5, true), Some(r(0, 4)));
        assert_eq!(s.take_serial(None, UNLIMITED, true), Some(r(5, 9)));
        assert!(!s.has_more());
        assert_eq!(s.take_serial(None, UNLIMITED, true), None);
    }

    #[test]
    fn test_take_more_keeps_gaps() {
        let s = sorter(&[(0, 2), (5, 6), (9, 20)]);
        let runs = s.take_more(None, 7, true);
        assert_eq!(runs, vec![r(0, 2), r(5, 6), r(9, 10)]);
        assert_eq!(s.get_serial(None, UNLIMITED, true), Some(r(11, 20)));
    }

    #[test]
    fn test_get_more_descending_order() {
        let s = sorter(&[(0, 2), (5, 6), (9, 10)]);
        let runs = s.get_more(None, UNLIMITED, false);
        assert_eq!(runs, vec![r(9, 10), r(5, 6), r(0, 2)]);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn test_contains_uses_merged_coverage() {
        let s = sorter(&[(0, 4), (5, 9), (12, 12)]);
        assert!(s.contains(&3, &7));
        assert!(s.contains(&12, &12));
        assert!(!s.contains(&9, &12));
        assert!(s.contains_range(&r(0, 9)));
    }

    #[test]
    fn test_remove_splits() {
        let s = sorter(&[(0, 9)]);
        assert!(s.remove(&3, &5));
        assert_eq!(s.get_more(None, UNLIMITED, true), vec![r(0, 2), r(6, 9)]);
        assert!(!s.remove(&0, &9));
        assert!(!s.has_more());
        assert!(!s.remove(&0, &9));
    }

    #[test]
    fn test_remove_trims_edges() {
        let s = sorter(&[(0, 4), (6, 9)]);
        assert!(s.remove_range(&r(3, 7)));
        assert_eq!(s.get_more(None, UNLIMITED, true), vec![r(0, 2), r(8, 9)]);
    }

    #[test]
    #[should_panic(expected = "limit must be positive")]
    fn test_zero_limit_panics() {
        sorter(&[(0, 1)]).get_serial(None, 0, true);
    }

    fn arb_ranges() -> impl Strategy<Value = Vec<(i64, i64)>> {
        prop::collection::vec((0i64..60, 0i64..8), 0..12)
            .prop_map(|v| v.into_iter().map(|(from, len)| (from, from + len)).collect())
    }

    proptest! {
        #[test]
        fn prop_serial_never_exceeds_limit(ranges in arb_ranges(), limit in 1usize..20, min_first: bool) {
            let s = sorter(&ranges);
            if let Some(run) = s.get_serial(None, limit, min_first) {
                prop_assert!(run.len() <= limit as i64);
            }
            for run in s.take_more(None, limit, min_first) {
                prop_assert!(run.len() <= limit as i64);
            }
        }

        #[test]
        fn prop_remove_clears_exactly_the_cut(ranges in arb_ranges(), cut_from in 0i64..70, cut_len in 0i64..10) {
            let s = sorter(&ranges);
            let cut_to = cut_from + cut_len;
            let covered: Vec<i64> = (0..80).filter(|p| s.contains(p, p)).collect();

            s.remove(&cut_from, &cut_to);

            for p in covered {
                let inside_cut = p >= cut_from && p <= cut_to;
                prop_assert_eq!(s.contains(&p, &p), !inside_cut, "point {}", p);
            }
            for p in cut_from..=cut_to {
                prop_assert!(!s.contains(&p, &p));
            }
        }

        #[test]
        fn prop_joinable_pair_merges_to_union(a in (0i64..30, 0i64..8), b in (0i64..30, 0i64..8)) {
            let ra = r(a.0, a.0 + a.1);
            let rb = r(b.0, b.0 + b.1);
            prop_assume!(ra.joinable(&rb));

            let s = Sorter::new();
            s.put(ra.clone());
            s.put(rb.clone());
            let runs = s.take_more(None, UNLIMITED, true);
            prop_assert_eq!(runs.len(), 1);

            let merged = &runs[0];
            for p in 0..40 {
                let in_union = ra.covers(&p, &p) || rb.covers(&p, &p);
                prop_assert_eq!(merged.covers(&p, &p), in_union, "point {}", p);
            }
            prop_assert!(!s.has_more());
        }
    }
}
