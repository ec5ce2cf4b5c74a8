//! Throttle over plain objects

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use eyre::Result;

use crate::config::ThrottleConfig;
use crate::counter::{Counter, ThrottleId};
use crate::domain::{Point, PointRegistry, Range};
use crate::error::ThrottleError;

use super::core::{Tag, Throttle};
use super::executor::{Completion, Executor};
use super::stats::ThrottleStats;

/// Executor receiving plain objects instead of point ranges
pub trait ObjectExecutor<O, T>: Send + Sync {
    fn execute(&self, obj: &O, tag: Option<&T>, done: Completion) -> Result<()>;

    fn cancel(&self, obj: &O, tag: Option<&T>);
}

struct Unwrap<O, T> {
    inner: Arc<dyn ObjectExecutor<O, T>>,
    _tag: PhantomData<fn(T)>,
}

impl<O, T> Executor<Point<O>, T> for Unwrap<O, T>
where
    O: Hash + Eq + fmt::Debug + Send + Sync + 'static,
{
    fn execute(&self, range: &Range<Point<O>>, tag: Option<&T>, done: Completion) -> Result<()> {
        self.inner.execute(range.from().get(), tag, done)
    }

    fn cancel(&self, range: &Range<Point<O>>, tag: Option<&T>) {
        self.inner.cancel(range.from().get(), tag);
    }
}

/// Throttle for deduplicated objects
///
/// Objects are never merged: each admitted unit is exactly one object, and
/// putting an object that is already queued or running has no effect.
pub struct ObjectThrottle<O: Hash + Eq, T> {
    points: PointRegistry<O>,
    throttle: Throttle<Point<O>, T>,
}

impl<O, T> ObjectThrottle<O, T>
where
    O: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Tag,
{
    /// `limit` and `min_first` from `config` are ignored
    pub fn new(
        counter: Arc<Counter>,
        config: &ThrottleConfig,
        executor: Arc<dyn ObjectExecutor<O, T>>,
    ) -> Result<Self, ThrottleError> {
        let config = ThrottleConfig {
            limit: 1,
            min_first: true,
            ..config.clone()
        };
        let unwrap = Unwrap {
            inner: executor,
            _tag: PhantomData,
        };
        Ok(Self {
            points: PointRegistry::new(),
            throttle: Throttle::new(counter, &config, Arc::new(unwrap))?,
        })
    }

    pub fn id(&self) -> ThrottleId {
        self.throttle.id()
    }

    pub fn put(&self, obj: O, tag: Option<T>, promised: bool) -> Result<()> {
        self.throttle.put_point(self.points.intern(obj), tag, promised)
    }

    pub fn discard(&self, obj: O, tag: Option<T>, with_promised: bool) -> Result<()> {
        self.throttle.discard(&self.point_range(obj), tag, with_promised)
    }

    pub fn cancel(&self, obj: O, tag: Option<T>, with_promised: bool) -> Result<()> {
        self.throttle.cancel(&self.point_range(obj), tag, with_promised)
    }

    pub fn destroy(&self, cancel_in_flight: bool) {
        self.throttle.destroy(cancel_in_flight);
    }

    pub fn stats(&self) -> ThrottleStats {
        self.throttle.stats()
    }

    /// Objects waiting under `tag`, bottom of the stack first
    pub fn waiting(&self, tag: Option<&T>) -> Vec<O> {
        self.throttle
            .snapshot()
            .into_iter()
            .filter(|snapshot| snapshot.tag.as_ref() == tag)
            .flat_map(|snapshot| snapshot.waiting)
            .map(|range| range.from().get().clone())
            .collect()
    }

    fn point_range(&self, obj: O) -> Range<Point<O>> {
        Range::point(self.points.intern(obj))
    }
}
