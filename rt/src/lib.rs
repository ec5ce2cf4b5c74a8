//! rangethrottle - admission control for range-shaped asynchronous work
//!
//! Callers submit requests over an ordered, discrete domain ("load pages
//! 5-9"). The throttle merges overlapping and adjacent requests up to a size
//! limit, admits the most recently submitted work first, bounds global
//! concurrency through a shared [`Counter`], and evicts older best-effort work
//! to make room for newer work. Work marked *promised* is never evicted or
//! cancelled. Requests carry an optional tag; tags take turns at the shared
//! budget.
//!
//! # Modules
//!
//! - [`domain`] - discrete points and closed ranges over them
//! - [`sorter`] - sorted range set with merge-aware bounded extraction
//! - [`counter`] - global concurrency budget with a starvation guard
//! - [`throttle`] - per-tag admission, eviction and the fairness loop
//! - [`config`] - configuration types and loading
//! - [`error`] - error types
//!
//! Execution itself is delegated to an [`Executor`]; this crate only decides
//! what runs, how much runs at once, and what gets cancelled.

pub mod config;
pub mod counter;
pub mod domain;
pub mod error;
pub mod sorter;
pub mod throttle;

mod sync;

pub use config::{Config, CounterConfig, ThrottleConfig};
pub use counter::{Counter, ThrottleId};
pub use domain::{Discrete, Point, PointRegistry, Range};
pub use error::ThrottleError;
pub use sorter::{ObjectSorter, Sorter, UNLIMITED};
pub use throttle::{
    Completion, Executor, ObjectExecutor, ObjectThrottle, Tag, TagSnapshot, Throttle, ThrottleStats,
};
