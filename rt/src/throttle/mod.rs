//! Admission control over tagged range requests

mod core;
mod executor;
mod object;
mod stats;
mod tagged;

pub use self::core::{Tag, Throttle};
pub use executor::{Completion, Executor};
pub use object::{ObjectExecutor, ObjectThrottle};
pub use stats::{TagSnapshot, ThrottleStats};
