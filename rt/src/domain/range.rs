//! Closed interval over a discrete domain

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ThrottleError;

use super::Discrete;

/// Immutable `[from, to]` interval, both ends inclusive
#[derive(Clone)]
pub struct Range<D> {
    from: D,
    to: D,
}

impl<D: Discrete> Range<D> {
    /// Create a range, panicking if `from` follows `to` or the length
    /// does not fit an `i64`
    pub fn new(from: D, to: D) -> Self {
        match Self::try_new(from, to) {
            Ok(range) => range,
            Err(e @ ThrottleError::InvalidRange { .. }) => panic!("malformed range: {e}"),
            Err(e) => panic!("{e}"),
        }
    }

    /// Create a range, rejecting a reversed or uncountable pair instead of
    /// panicking
    pub fn try_new(from: D, to: D) -> Result<Self, ThrottleError> {
        match to.checked_delta(&from).and_then(|span| span.checked_add(1)) {
            Some(len) if len > 0 => Ok(Self { from, to }),
            Some(_) => Err(ThrottleError::InvalidRange {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            }),
            None => Err(ThrottleError::RangeTooWide {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            }),
        }
    }

    /// Single-point range
    pub fn point(d: D) -> Self {
        Self { from: d.clone(), to: d }
    }

    pub fn from(&self) -> &D {
        &self.from
    }

    pub fn to(&self) -> &D {
        &self.to
    }

    /// Number of points covered
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> i64 {
        self.to.delta(&self.from) + 1
    }

    pub fn is_single(&self) -> bool {
        self.len() == 1
    }

    /// Identity key: `from`, plus `~to` when the range spans more than one point
    pub fn unique(&self) -> String {
        if self.is_single() {
            self.from.unique()
        } else {
            format!("{}~{}", self.from.unique(), self.to.unique())
        }
    }

    /// Whether `other` lies entirely inside `self`
    pub fn contains(&self, other: &Range<D>) -> bool {
        self.covers(&other.from, &other.to)
    }

    /// Whether `[from, to]` lies entirely inside `self`
    pub fn covers(&self, from: &D, to: &D) -> bool {
        within(from, to, &self.from, &self.to)
    }

    /// Whether the two ranges share at least one point
    pub fn overlap(&self, other: &Range<D>) -> bool {
        within(&other.from, &other.from, &self.from, &self.to)
            || within(&other.to, &other.to, &self.from, &self.to)
            || within(&self.from, &self.from, &other.from, &other.to)
            || within(&self.to, &self.to, &other.from, &other.to)
    }

    /// Whether the two ranges overlap or touch end to end
    pub fn joinable(&self, other: &Range<D>) -> bool {
        self.overlap(other) || other.from.delta(&self.to) == 1 || self.from.delta(&other.to) == 1
    }
}

fn within<D: Discrete>(from: &D, to: &D, outer_from: &D, outer_to: &D) -> bool {
    from.delta(outer_from) >= 0 && to.delta(outer_to) <= 0
}

impl<D: Discrete> PartialEq for Range<D> {
    fn eq(&self, other: &Self) -> bool {
        self.from.delta(&other.from) == 0 && self.to.delta(&other.to) == 0
    }
}

impl<D: Discrete> Eq for Range<D> {}

impl<D: Discrete> Ord for Range<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.from
            .delta(&other.from)
            .cmp(&0)
            .then_with(|| self.to.delta(&other.to).cmp(&0))
    }
}

impl<D: Discrete> PartialOrd for Range<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D: Discrete> Hash for Range<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.from.unique().hash(state);
        self.to.unique().hash(state);
    }
}

impl<D: fmt::Debug> fmt::Debug for Range<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.from, self.to)
    }
}

impl<D: fmt::Debug> fmt::Display for Range<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
