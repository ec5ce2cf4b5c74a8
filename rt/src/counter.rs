//! Global concurrency budget shared by throttles

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::config::CounterConfig;
use crate::error::ThrottleError;
use crate::sync::locked;

/// Stable handle for a throttle's counter registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThrottleId(u64);

impl fmt::Display for ThrottleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "throttle-{}", self.0)
    }
}

/// Per-throttle bookkeeping
#[derive(Debug, Clone, Copy)]
struct Slot {
    active: bool,
    inflight: usize,
}

impl Slot {
    /// Slots this record occupies when judging saturation: its in-flight
    /// count, or one reserved slot while it is active and idle
    fn reserved(&self) -> usize {
        if self.inflight > 0 {
            self.inflight
        } else if self.active {
            1
        } else {
            0
        }
    }
}

/// Concurrency budget with a starvation guard
///
/// Grants a slot while the reserved total stays below `max_req_count`, and
/// always grants a throttle its first slot even when the budget is
/// saturated, so an idle throttle can never be starved by busy ones.
pub struct Counter {
    max_req_count: usize,
    next_id: AtomicU64,
    slots: Mutex<HashMap<ThrottleId, Slot>>,
}

impl Counter {
    /// Create a counter allowing `max_req_count` concurrent requests
    pub fn new(max_req_count: usize) -> Result<Self, ThrottleError> {
        debug!(max_req_count, "Counter::new: called");
        if max_req_count == 0 {
            return Err(ThrottleError::InvalidConfig(
                "max-req-count must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            max_req_count,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &CounterConfig) -> Result<Self, ThrottleError> {
        Self::new(config.max_req_count)
    }

    pub fn max_req_count(&self) -> usize {
        self.max_req_count
    }

    /// Register a new throttle and return its handle
    pub fn register(&self) -> ThrottleId {
        let id = ThrottleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        locked(&self.slots).insert(
            id,
            Slot {
                active: true,
                inflight: 0,
            },
        );
        debug!(%id, "Counter::register: registered");
        id
    }

    /// Stop granting slots to `id`
    ///
    /// In-flight work keeps its slots until released; the record is reclaimed
    /// once it drains to zero.
    pub fn unregister(&self, id: ThrottleId) {
        let mut slots = locked(&self.slots);
        let Some(slot) = slots.get_mut(&id) else {
            debug!(%id, "Counter::unregister: unknown id");
            return;
        };
        if slot.inflight > 0 {
            slot.active = false;
            debug!(%id, inflight = slot.inflight, "Counter::unregister: draining");
            return;
        }
        slots.remove(&id);
        debug!(%id, "Counter::unregister: removed idle record");
    }

    /// Try to take a slot for `id`
    pub fn hold(&self, id: ThrottleId) -> bool {
        let mut slots = locked(&self.slots);
        let reserved: usize = slots.values().map(Slot::reserved).sum();
        let Some(slot) = slots.get_mut(&id) else {
            trace!(%id, "Counter::hold: unknown id");
            return false;
        };
        if !slot.active {
            trace!(%id, "Counter::hold: inactive");
            return false;
        }
        if reserved < self.max_req_count || slot.inflight == 0 {
            slot.inflight += 1;
            trace!(%id, inflight = slot.inflight, reserved, "Counter::hold: granted");
            true
        } else {
            trace!(%id, inflight = slot.inflight, reserved, "Counter::hold: saturated");
            false
        }
    }

    /// Give back one slot held by `id`
    pub fn release(&self, id: ThrottleId) {
        let mut slots = locked(&self.slots);
        let Some(slot) = slots.get_mut(&id) else {
            return;
        };
        slot.inflight = slot.inflight.saturating_sub(1);
        trace!(%id, inflight = slot.inflight, "Counter::release: released");
        if !slot.active && slot.inflight == 0 {
            slots.remove(&id);
            debug!(%id, "Counter::release: drained record removed");
        }
    }

    /// Total in-flight slots across all throttles
    pub fn count(&self) -> usize {
        locked(&self.slots).values().map(|slot| slot.inflight).sum()
    }

    /// In-flight slots held by `id`
    pub fn inflight(&self, id: ThrottleId) -> usize {
        locked(&self.slots).get(&id).map_or(0, |slot| slot.inflight)
    }

    pub fn is_registered(&self, id: ThrottleId) -> bool {
        locked(&self.slots).get(&id).is_some_and(|slot| slot.active)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("max_req_count", &self.max_req_count)
            .field("count", &self.count())
            .finish()
    }
}
