//! Domain types: discrete points and the ranges built on them
//!
//! - [`Discrete`] - ordered point contract (integers, dates, interned objects)
//! - [`Range`] - immutable closed interval with containment/overlap queries
//! - [`Point`] / [`PointRegistry`] - point-only wrapping of plain objects

mod discrete;
mod point;
mod range;

pub(crate) use discrete::step;
pub use discrete::Discrete;
pub use point::{Point, PointRegistry};
pub use range::Range;
