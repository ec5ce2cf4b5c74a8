//! Observability types for the throttle

use crate::domain::Range;

/// Cumulative counters for one throttle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThrottleStats {
    pub dispatched: u64,
    pub completed: u64,
    pub cancel_requests: u64,
    /// Executing ranges cancelled to make room for newer work
    pub evictions: u64,
    /// Candidates pushed back to the bottom of the stack before starting
    pub requeued: u64,
    pub peak_executing: usize,
}

/// Container contents of one tag at the time of the call
#[derive(Debug, Clone)]
pub struct TagSnapshot<D, T> {
    /// `None` for the untagged bucket
    pub tag: Option<T>,

    /// Bottom of the stack first
    pub waiting: Vec<Range<D>>,
    pub waiting_promised: Vec<Range<D>>,

    /// In dispatch order
    pub executing: Vec<Range<D>>,

    /// Sorted ascending
    pub executing_promised: Vec<Range<D>>,
}

impl<D, T> TagSnapshot<D, T> {
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty()
            && self.waiting_promised.is_empty()
            && self.executing.is_empty()
            && self.executing_promised.is_empty()
    }
}
