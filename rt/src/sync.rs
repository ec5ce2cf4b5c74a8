//! Lock helpers

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the inner value if a previous holder panicked
///
/// Scheduler state stays consistent across a panic because every mutation
/// happens under one guard and executor callbacks never run under a lock.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
