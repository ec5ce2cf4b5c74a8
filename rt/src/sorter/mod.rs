//! Interval sorter
//!
//! Sorted, lock-protected range collections with merge-aware bounded
//! extraction. [`Sorter`] works over any [`Discrete`](crate::domain::Discrete)
//! domain; [`ObjectSorter`] layers a deduplicating object set on top of it.

mod core;
mod object;

pub use self::core::{Sorter, UNLIMITED};
pub use object::ObjectSorter;
