//! Point-only domain for arbitrary objects
//!
//! Plain objects have no order of their own. A [`PointRegistry`] assigns each
//! distinct object a position the first time it is seen; positions grow by
//! two, so no two points are ever adjacent and every range over them stays a
//! single point. This lets the interval engine double as a deduplicating,
//! recency-ordered object set.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::sync::locked;

use super::Discrete;

const POSITION_STEP: i64 = 2;

struct Slots<O: Hash + Eq> {
    next: i64,
    by_object: HashMap<O, Weak<PointInner<O>>>,
}

/// Interns objects into [`Point`]s
///
/// A position lives as long as some `Point` refers to it; once the last one
/// is dropped the slot is reclaimed and the object gets a fresh position the
/// next time it is seen.
pub struct PointRegistry<O: Hash + Eq> {
    slots: Arc<Mutex<Slots<O>>>,
}

impl<O> PointRegistry<O>
where
    O: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next: 0,
                by_object: HashMap::new(),
            })),
        }
    }

    /// Point for `obj`, reusing its position while one is alive
    pub fn intern(&self, obj: O) -> Point<O> {
        let mut slots = locked(&self.slots);
        if let Some(inner) = slots.by_object.get(&obj).and_then(Weak::upgrade) {
            return Point { inner };
        }
        slots.next += POSITION_STEP;
        let position = slots.next;
        trace!(?obj, position, "PointRegistry::intern: new position");
        let inner = Arc::new(PointInner {
            position,
            obj: obj.clone(),
            registry: Arc::downgrade(&self.slots),
        });
        slots.by_object.insert(obj, Arc::downgrade(&inner));
        Point { inner }
    }

    /// Number of objects currently holding a position
    pub fn len(&self) -> usize {
        locked(&self.slots).by_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<O> Default for PointRegistry<O>
where
    O: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct PointInner<O: Hash + Eq> {
    position: i64,
    obj: O,
    registry: Weak<Mutex<Slots<O>>>,
}

impl<O: Hash + Eq> Drop for PointInner<O> {
    fn drop(&mut self) {
        let Some(slots) = self.registry.upgrade() else {
            return;
        };
        let mut slots = locked(&slots);
        // A newer point for the same object may already have replaced this slot.
        let stale = slots
            .by_object
            .get(&self.obj)
            .is_some_and(|weak| weak.strong_count() == 0);
        if stale {
            slots.by_object.remove(&self.obj);
        }
    }
}

/// An interned object; never adjacent to any other point
pub struct Point<O: Hash + Eq> {
    inner: Arc<PointInner<O>>,
}

impl<O: Hash + Eq> Point<O> {
    /// The wrapped object
    pub fn get(&self) -> &O {
        &self.inner.obj
    }

    pub fn position(&self) -> i64 {
        self.inner.position
    }
}

impl<O: Hash + Eq> Clone for Point<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Hash + Eq + fmt::Debug> fmt::Debug for Point<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}){:?}", self.inner.position, self.inner.obj)
    }
}

impl<O> Discrete for Point<O>
where
    O: Hash + Eq + fmt::Debug + Send + Sync + 'static,
{
    fn delta(&self, other: &Self) -> i64 {
        self.inner.position - other.inner.position
    }

    fn offset(&self, _n: i64) -> Option<Self> {
        None
    }

    fn unique(&self) -> String {
        self.inner.position.to_string()
    }
}
