//! Executor contract and the completion handle passed to it

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::Result;

use crate::domain::Range;
use crate::sync::locked;

/// Runs admitted work on behalf of a throttle
///
/// `execute` must eventually lead to [`Completion::done`] being called (or the
/// last clone of the handle being dropped), whether the work succeeded, failed
/// or was cancelled. Returning an error means the work never started; the
/// throttle then cleans up by itself and hands the error back to its caller.
pub trait Executor<D, T>: Send + Sync {
    fn execute(&self, range: &Range<D>, tag: Option<&T>, done: Completion) -> Result<()>;

    /// Best-effort request to stop work previously handed to `execute`
    ///
    /// The range may still complete normally afterwards.
    fn cancel(&self, range: &Range<D>, tag: Option<&T>);
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct CompletionInner {
    fired: AtomicBool,
    cleanup: Mutex<Option<Cleanup>>,
}

impl CompletionInner {
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let cleanup = locked(&self.cleanup).take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        true
    }
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Completion callback for one dispatched range
///
/// Clones share one cleanup, which runs exactly once: on the first `done`
/// call, or when the last clone is dropped without `done` ever being called.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub(crate) fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(CompletionInner {
                fired: AtomicBool::new(false),
                cleanup: Mutex::new(Some(Box::new(cleanup))),
            }),
        }
    }

    /// Report the work as finished; returns false if it was already reported
    pub fn done(&self) -> bool {
        self.inner.fire()
    }

    pub fn is_done(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("done", &self.is_done()).finish()
    }
}
