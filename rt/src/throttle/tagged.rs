//! Per-tag admission state: waiting stacks, executing maps and the limiter

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use indexmap::IndexMap;
use lru::LruCache;
use tracing::{debug, trace};

use crate::domain::{Discrete, Range};
use crate::sorter::{Sorter, UNLIMITED};

use super::stats::TagSnapshot;

/// Merge bound and extraction direction shared by every tag of a throttle
#[derive(Debug, Clone, Copy)]
pub(crate) struct Policy {
    pub(crate) limit: usize,
    pub(crate) min_first: bool,
}

impl Policy {
    fn limit_len(&self) -> i64 {
        i64::try_from(self.limit).unwrap_or(i64::MAX)
    }
}

/// One tag's state, owned by the throttle registry
pub(crate) struct Tagged<D, T> {
    pub(crate) tag: Option<T>,
    pub(crate) state: Mutex<TaggedState<D>>,
}

impl<D: Discrete, T> Tagged<D, T> {
    pub(crate) fn new(tag: Option<T>, lru_capacity: NonZeroUsize) -> Self {
        Self {
            tag,
            state: Mutex::new(TaggedState::new(lru_capacity)),
        }
    }
}

/// Outcome of one best-effort admission step
#[derive(Debug)]
pub(crate) struct Promotion<D> {
    /// Range to dispatch, if any
    pub(crate) chosen: Option<Range<D>>,

    /// Executing ranges pushed out of the limiter; to be cancelled
    pub(crate) cancelled: Vec<Range<D>>,

    /// Candidates the limiter pushed out before they started
    pub(crate) requeued: usize,
}

impl<D> Promotion<D> {
    fn idle() -> Self {
        Self {
            chosen: None,
            cancelled: Vec::new(),
            requeued: 0,
        }
    }
}

pub(crate) struct TaggedState<D> {
    /// LIFO; the end of the vector is the top
    waiting: Vec<Range<D>>,
    waiting_promised: Vec<Range<D>>,
    executing: IndexMap<String, Range<D>>,
    executing_promised: HashMap<String, Range<D>>,
    /// Executing keys already cancelled by eviction
    evicted: HashSet<String>,
    limiter: LruCache<String, Range<D>>,
    scratch: Sorter<D>,
}

impl<D: Discrete> TaggedState<D> {
    fn new(lru_capacity: NonZeroUsize) -> Self {
        Self {
            waiting: Vec::new(),
            waiting_promised: Vec::new(),
            executing: IndexMap::new(),
            executing_promised: HashMap::new(),
            evicted: HashSet::new(),
            limiter: LruCache::new(lru_capacity),
            scratch: Sorter::new(),
        }
    }

    pub(crate) fn push(&mut self, range: Range<D>, promised: bool) {
        trace!(%range, promised, "TaggedState::push: called");
        if promised {
            self.waiting_promised.push(range);
        } else {
            self.waiting.push(range);
        }
    }

    /// Erase the overlap with `range` from the waiting stacks
    pub(crate) fn discard(&mut self, range: &Range<D>, with_promised: bool, min_first: bool) {
        if with_promised {
            drop_overlap(&self.scratch, &mut self.waiting_promised, range, min_first);
        }
        drop_overlap(&self.scratch, &mut self.waiting, range, min_first);
    }

    /// Executing ranges lying entirely inside `range`
    pub(crate) fn cancel_targets(&self, range: &Range<D>, with_promised: bool) -> Vec<Range<D>> {
        let mut targets: Vec<Range<D>> = Vec::new();
        if with_promised {
            targets.extend(self.executing_promised.values().filter(|r| range.contains(r)).cloned());
        }
        targets.extend(self.executing.values().filter(|r| range.contains(r)).cloned());
        targets
    }

    /// Every non-promised range currently executing
    pub(crate) fn executing_ranges(&self) -> Vec<Range<D>> {
        self.executing.values().cloned().collect()
    }

    pub(crate) fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub(crate) fn has_waiting_promised(&self) -> bool {
        !self.waiting_promised.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.waiting.is_empty()
            && self.waiting_promised.is_empty()
            && self.executing.is_empty()
            && self.executing_promised.is_empty()
    }

    pub(crate) fn snapshot<T: Clone>(&self, tag: Option<&T>) -> TagSnapshot<D, T> {
        let mut executing_promised: Vec<Range<D>> = self.executing_promised.values().cloned().collect();
        executing_promised.sort();
        TagSnapshot {
            tag: tag.cloned(),
            waiting: self.waiting.clone(),
            waiting_promised: self.waiting_promised.clone(),
            executing: self.executing_ranges(),
            executing_promised,
        }
    }

    /// Move the next promised range into `executing_promised`
    ///
    /// Waiting promised work already covered by running promised work is
    /// dropped first, so promised ranges are never run twice.
    pub(crate) fn promote_promised(&mut self, policy: &Policy) -> Option<Range<D>> {
        if self.waiting_promised.is_empty() {
            return None;
        }
        let running: Vec<Range<D>> = self.executing_promised.values().cloned().collect();
        for range in &running {
            drop_overlap(&self.scratch, &mut self.waiting_promised, range, policy.min_first);
        }
        let seed = take(&self.scratch, &mut self.waiting_promised, policy)?;
        let range = merge(&self.scratch, &mut self.waiting_promised, seed, policy);
        debug!(%range, "TaggedState::promote_promised: admitted");
        self.executing_promised.insert(range.unique(), range.clone());
        Some(range)
    }

    /// Pick the most recent best-effort range and run it through the limiter
    pub(crate) fn promote(&mut self, policy: &Policy) -> Promotion<D> {
        let mut promotion = Promotion::idle();
        if self.waiting.is_empty() {
            return promotion;
        }

        // Running work always wins over work that has not started yet.
        let running: Vec<Range<D>> = self
            .executing_promised
            .values()
            .chain(self.executing.values())
            .cloned()
            .collect();
        for range in &running {
            drop_overlap(&self.scratch, &mut self.waiting, range, policy.min_first);
        }

        // Built from the top down, so the first candidate is the most recent.
        let mut candidates = Vec::new();
        while let Some(seed) = take(&self.scratch, &mut self.waiting, policy) {
            candidates.push(merge(&self.scratch, &mut self.waiting, seed, policy));
        }
        if candidates.is_empty() {
            return promotion;
        }
        let chosen = candidates.remove(0);
        let key = chosen.unique();

        let incumbents: Vec<(String, Range<D>)> = self
            .executing
            .iter()
            .filter(|(k, _)| !self.evicted.contains(*k))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        self.executing.insert(key.clone(), chosen.clone());

        self.limiter.clear();
        let mut evicted = Vec::new();
        for range in candidates.into_iter().rev() {
            self.rank(range.unique(), range, &mut evicted);
        }
        for (k, range) in &incumbents {
            self.rank(k.clone(), range.clone(), &mut evicted);
        }
        self.rank(key.clone(), chosen.clone(), &mut evicted);
        for (k, _) in &incumbents {
            self.limiter.pop(k);
        }
        self.limiter.pop(&key);

        // Candidates that fit but lost go back, least recent first.
        let leftovers: Vec<Range<D>> = self.limiter.iter().rev().map(|(_, r)| r.clone()).collect();
        self.limiter.clear();
        self.waiting.extend(leftovers);

        for range in evicted.into_iter().rev() {
            let k = range.unique();
            if self.executing.contains_key(&k) {
                debug!(%range, "TaggedState::promote: evicting executing range");
                self.evicted.insert(k);
                promotion.cancelled.push(range);
            } else {
                debug!(%range, "TaggedState::promote: requeueing evicted candidate");
                promotion.requeued += 1;
                self.waiting.insert(0, range);
            }
        }

        debug!(%chosen, waiting = self.waiting.len(), "TaggedState::promote: admitted");
        promotion.chosen = Some(chosen);
        promotion
    }

    fn rank(&mut self, key: String, range: Range<D>, evicted: &mut Vec<Range<D>>) {
        match self.limiter.push(key.clone(), range) {
            Some((old, range)) if old != key => {
                trace!(%range, "TaggedState::rank: evicted");
                evicted.push(range);
            }
            _ => {}
        }
    }

    /// Completion bookkeeping for a dispatched range
    ///
    /// Returns the non-promised executing ranges that a finished promised
    /// range makes redundant; the caller cancels them.
    pub(crate) fn finish(&mut self, range: &Range<D>, promised: bool, min_first: bool) -> Vec<Range<D>> {
        let key = range.unique();
        let redundant = if promised {
            self.executing_promised.remove(&key);
            self.executing
                .iter()
                .filter(|(k, r)| range.contains(r) && !self.evicted.contains(*k))
                .map(|(_, r)| r.clone())
                .collect()
        } else {
            self.executing.shift_remove(&key);
            self.evicted.remove(&key);
            Vec::new()
        };
        drop_overlap(&self.scratch, &mut self.waiting_promised, range, min_first);
        drop_overlap(&self.scratch, &mut self.waiting, range, min_first);
        trace!(%range, promised, idle = self.is_idle(), "TaggedState::finish: done");
        redundant
    }
}

fn assert_scratch_empty<D: Discrete>(scratch: &Sorter<D>) {
    assert!(!scratch.has_more(), "scratch sorter reused while holding ranges");
}

/// Pop the top of `stack`, splitting off anything beyond the limit
fn take<D: Discrete>(scratch: &Sorter<D>, stack: &mut Vec<Range<D>>, policy: &Policy) -> Option<Range<D>> {
    let range = stack.pop()?;
    if range.len() <= policy.limit_len() {
        return Some(range);
    }
    assert_scratch_empty(scratch);
    scratch.put(range);
    let head = scratch.take_serial(None, policy.limit, policy.min_first);
    if let Some(rest) = scratch.take_serial(None, UNLIMITED, policy.min_first) {
        stack.push(rest);
    }
    head
}

/// Union of two joinable ranges, cut at the limit from the favored end
fn union<D: Discrete>(
    scratch: &Sorter<D>,
    a: &Range<D>,
    b: &Range<D>,
    policy: &Policy,
    favor_min: bool,
) -> (Option<Range<D>>, Option<Range<D>>) {
    assert_scratch_empty(scratch);
    scratch.put(a.clone());
    scratch.put(b.clone());
    let favor = scratch.take_serial(None, policy.limit, favor_min);
    let rest = scratch.take_serial(None, UNLIMITED, policy.min_first);
    assert!(!scratch.has_more(), "joinable ranges left more than one remainder");
    (favor, rest)
}

/// Grow `range` by absorbing joinable entries of `list` up to the limit
///
/// Passes repeat until one absorbs nothing. When the union overflows the
/// limit and the cut-off part lies inside `range` itself, the cut is retried
/// from the opposite end so none of `range` is pushed back.
///
/// The single flip is a heuristic. It holds on every case exercised so far
/// but is not proven for arbitrary inputs, hence the assert.
fn merge<D: Discrete>(scratch: &Sorter<D>, list: &mut Vec<Range<D>>, mut range: Range<D>, policy: &Policy) -> Range<D> {
    let limit = policy.limit_len();
    loop {
        let mut absorbed = false;
        for i in (0..list.len()).rev() {
            assert!(range.len() <= limit, "merged range {range} exceeds limit {limit}");
            if range.len() == limit {
                break;
            }
            if range.contains(&list[i]) {
                list.remove(i);
                continue;
            }
            if !list[i].joinable(&range) {
                continue;
            }
            let entry = list[i].clone();
            match union(scratch, &entry, &range, policy, policy.min_first) {
                (Some(favor), None) => {
                    range = favor;
                    list.remove(i);
                }
                (Some(favor), Some(rest)) if !range.contains(&rest) => {
                    range = favor;
                    list[i] = rest;
                }
                _ => match union(scratch, &entry, &range, policy, !policy.min_first) {
                    (Some(favor), Some(rest)) => {
                        assert!(!range.contains(&rest), "flipped merge of {range} with {entry} still cuts into it");
                        range = favor;
                        list[i] = rest;
                    }
                    (Some(favor), None) => {
                        range = favor;
                        list.remove(i);
                    }
                    (None, _) => continue,
                },
            }
            absorbed = true;
        }
        if !absorbed {
            break;
        }
    }
    range
}

/// Cut `range` out of every overlapping entry of `list`, keeping positions
fn drop_overlap<D: Discrete>(scratch: &Sorter<D>, list: &mut Vec<Range<D>>, range: &Range<D>, min_first: bool) {
    for i in (0..list.len()).rev() {
        if !list[i].overlap(range) {
            continue;
        }
        let entry = list.remove(i);
        if range.contains(&entry) {
            continue;
        }
        assert_scratch_empty(scratch);
        scratch.put(entry);
        scratch.remove_range(range);
        // Same index each time: earlier pieces move toward the top.
        while let Some(rest) = scratch.take_serial(None, UNLIMITED, min_first) {
            list.insert(i, rest);
        }
    }
}
