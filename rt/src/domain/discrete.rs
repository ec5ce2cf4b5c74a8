//! Discrete domain contract and built-in implementations

use std::fmt;

use chrono::{Duration, NaiveDate};

/// Ordered point type every [`Range`](super::Range) is built on
///
/// `delta` must induce a strict total order and be antisymmetric:
/// `a.delta(b) == -b.delta(a)`. For contiguous domains `offset` and `delta`
/// agree (`a.offset(n).delta(a) == n`); domains without an intrinsic
/// successor return `None` from `offset`.
pub trait Discrete: Clone + fmt::Debug + Send + Sync + 'static {
    /// Signed distance from `other` to `self`
    fn delta(&self, other: &Self) -> i64;

    /// `delta`, or `None` when the distance does not fit an `i64`
    fn checked_delta(&self, other: &Self) -> Option<i64> {
        Some(self.delta(other))
    }

    /// Point `n` steps away, if the domain has one
    fn offset(&self, n: i64) -> Option<Self>;

    /// Stable identity key
    fn unique(&self) -> String;
}

macro_rules! impl_discrete_for_int {
    ($($ty:ty),*) => {
        $(
            impl Discrete for $ty {
                fn delta(&self, other: &Self) -> i64 {
                    match self.checked_delta(other) {
                        Some(delta) => delta,
                        None => panic!("distance from {other} to {self} overflows i64"),
                    }
                }

                fn checked_delta(&self, other: &Self) -> Option<i64> {
                    i64::from(*self).checked_sub(i64::from(*other))
                }

                fn offset(&self, n: i64) -> Option<Self> {
                    i64::from(*self).checked_add(n).and_then(|v| <$ty>::try_from(v).ok())
                }

                fn unique(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_discrete_for_int!(i8, i16, i32, i64, u8, u16, u32);

/// Calendar days: one unit is one day
impl Discrete for NaiveDate {
    fn delta(&self, other: &Self) -> i64 {
        self.signed_duration_since(*other).num_days()
    }

    fn offset(&self, n: i64) -> Option<Self> {
        self.checked_add_signed(Duration::try_days(n)?)
    }

    fn unique(&self) -> String {
        self.format("%Y-%m-%d").to_string()
    }
}

/// Step `d` by `n`, treating an unsupported offset as a contract violation
pub(crate) fn step<D: Discrete>(d: &D, n: i64) -> D {
    match d.offset(n) {
        Some(next) => next,
        None => panic!("offset({n}) unsupported from {d:?}: domain is not contiguous here"),
    }
}
