//! Throttle orchestration: tag registry, fairness loop, dispatch

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use eyre::Result;
use indexmap::IndexMap;
use tracing::{debug, error, trace, warn};

use crate::config::ThrottleConfig;
use crate::counter::{Counter, ThrottleId};
use crate::domain::{Discrete, Range};
use crate::error::ThrottleError;
use crate::sync::locked;

use super::executor::{Completion, Executor};
use super::stats::{TagSnapshot, ThrottleStats};
use super::tagged::{Policy, Tagged, TaggedState};

/// Requirements on a tag type
pub trait Tag: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Tag for T where T: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static {}

/// Tag states in pass order: the untagged bucket, then tags as first seen
struct Registry<D, T> {
    untagged: Option<Arc<Tagged<D, T>>>,
    tagged: IndexMap<T, Arc<Tagged<D, T>>>,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    cancel_requests: AtomicU64,
    evictions: AtomicU64,
    requeued: AtomicU64,
    peak_executing: AtomicUsize,
}

struct Core<D, T> {
    id: ThrottleId,
    counter: Arc<Counter>,
    policy: Policy,
    lru_capacity: NonZeroUsize,
    executor: Arc<dyn Executor<D, T>>,
    registry: Mutex<Registry<D, T>>,
    /// Held by whoever is running the fairness loop
    pushing: AtomicBool,
    /// Set when work arrives; makes the loop runner take one more pass
    request: AtomicBool,
    counters: Counters,
}

/// Admission controller for range-shaped work
///
/// Requests are merged up to `limit` points, the most recent one is admitted
/// first, and every tag takes turns at the shared [`Counter`]. Best-effort
/// work may be evicted and cancelled to make room; promised work never is.
pub struct Throttle<D, T> {
    core: Arc<Core<D, T>>,
}

impl<D: Discrete, T: Tag> Throttle<D, T> {
    /// Register a new throttle with `counter`
    pub fn new(
        counter: Arc<Counter>,
        config: &ThrottleConfig,
        executor: Arc<dyn Executor<D, T>>,
    ) -> Result<Self, ThrottleError> {
        debug!(?config, "Throttle::new: called");
        config.validate()?;
        let id = counter.register();
        let lru_capacity = config.lru_capacity_for(counter.max_req_count());
        Ok(Self {
            core: Arc::new(Core {
                id,
                lru_capacity,
                policy: Policy {
                    limit: config.limit,
                    min_first: config.min_first,
                },
                counter,
                executor,
                registry: Mutex::new(Registry {
                    untagged: None,
                    tagged: IndexMap::new(),
                }),
                pushing: AtomicBool::new(false),
                request: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    pub fn id(&self) -> ThrottleId {
        self.core.id
    }

    /// Queue `range` under `tag`; `promised` work is never evicted or cancelled
    ///
    /// Errors come from an executor refusing a dispatch during the admission
    /// pass this call triggers; the range itself is queued either way.
    pub fn put(&self, range: Range<D>, tag: Option<T>, promised: bool) -> Result<()> {
        debug!(%range, ?tag, promised, "Throttle::put: called");
        let tagged = self.core.with_tagged(tag, |state| state.push(range, promised));
        self.core.settle(&tagged)
    }

    /// Queue the single point `d`
    pub fn put_point(&self, d: D, tag: Option<T>, promised: bool) -> Result<()> {
        self.put(Range::point(d), tag, promised)
    }

    /// Forget waiting work overlapping `range`
    pub fn discard(&self, range: &Range<D>, tag: Option<T>, with_promised: bool) -> Result<()> {
        debug!(%range, ?tag, with_promised, "Throttle::discard: called");
        let min_first = self.core.policy.min_first;
        let tagged = self
            .core
            .with_tagged(tag, |state| state.discard(range, with_promised, min_first));
        self.core.settle(&tagged)
    }

    /// Ask the executor to stop running work inside `range`, then discard
    /// waiting work overlapping it
    pub fn cancel(&self, range: &Range<D>, tag: Option<T>, with_promised: bool) -> Result<()> {
        debug!(%range, ?tag, with_promised, "Throttle::cancel: called");
        let min_first = self.core.policy.min_first;
        let mut targets = Vec::new();
        let tagged = self.core.with_tagged(tag, |state| {
            targets = state.cancel_targets(range, with_promised);
            state.discard(range, with_promised, min_first);
        });
        for target in &targets {
            self.core.request_cancel(target, tagged.tag.as_ref());
        }
        self.core.settle(&tagged)
    }

    /// Stop admitting work
    ///
    /// Queued work is abandoned. With `cancel_in_flight`, every executing
    /// best-effort range is cancelled; promised work is left to finish.
    pub fn destroy(&self, cancel_in_flight: bool) {
        debug!(id = %self.core.id, cancel_in_flight, "Throttle::destroy: called");
        self.core.counter.unregister(self.core.id);
        let tags: Vec<Arc<Tagged<D, T>>> = {
            let mut registry = locked(&self.core.registry);
            let mut tags: Vec<_> = registry.untagged.take().into_iter().collect();
            tags.extend(registry.tagged.drain(..).map(|(_, tagged)| tagged));
            tags
        };
        if !cancel_in_flight {
            return;
        }
        for tagged in tags {
            let running = locked(&tagged.state).executing_ranges();
            for range in &running {
                self.core.request_cancel(range, tagged.tag.as_ref());
            }
        }
    }

    /// Container contents of every live tag, in pass order
    pub fn snapshot(&self) -> Vec<TagSnapshot<D, T>> {
        self.core
            .pass_order()
            .iter()
            .map(|tagged| locked(&tagged.state).snapshot(tagged.tag.as_ref()))
            .collect()
    }

    pub fn stats(&self) -> ThrottleStats {
        let counters = &self.core.counters;
        ThrottleStats {
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            cancel_requests: counters.cancel_requests.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            requeued: counters.requeued.load(Ordering::Relaxed),
            peak_executing: counters.peak_executing.load(Ordering::Relaxed),
        }
    }
}

impl<D, T> Clone for Throttle<D, T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<D, T> fmt::Debug for Throttle<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("id", &self.core.id)
            .field("policy", &self.core.policy)
            .field("lru_capacity", &self.core.lru_capacity)
            .finish()
    }
}

impl<D: Discrete, T: Tag> Core<D, T> {
    /// Apply `apply` to the state of `tag`, creating it if needed
    ///
    /// Runs under the registry lock so an idle state cannot be released
    /// between lookup and mutation.
    fn with_tagged<F>(&self, tag: Option<T>, apply: F) -> Arc<Tagged<D, T>>
    where
        F: FnOnce(&mut TaggedState<D>),
    {
        let mut registry = locked(&self.registry);
        let tagged = match tag {
            None => Arc::clone(
                registry
                    .untagged
                    .get_or_insert_with(|| Arc::new(Tagged::new(None, self.lru_capacity))),
            ),
            Some(tag) => Arc::clone(
                registry
                    .tagged
                    .entry(tag.clone())
                    .or_insert_with(|| Arc::new(Tagged::new(Some(tag), self.lru_capacity))),
            ),
        };
        apply(&mut locked(&tagged.state));
        tagged
    }

    /// Run the fairness loop for `tagged`, then drop its state if idle
    fn settle(self: &Arc<Self>, tagged: &Arc<Tagged<D, T>>) -> Result<()> {
        let pushed = self.push_request(tagged);
        self.release_when_idle(tagged);
        pushed
    }

    fn pass_order(&self) -> Vec<Arc<Tagged<D, T>>> {
        let registry = locked(&self.registry);
        registry
            .untagged
            .iter()
            .chain(registry.tagged.values())
            .cloned()
            .collect()
    }

    fn release_when_idle(&self, tagged: &Arc<Tagged<D, T>>) {
        let mut registry = locked(&self.registry);
        if !locked(&tagged.state).is_idle() {
            return;
        }
        match &tagged.tag {
            None => {
                if registry.untagged.as_ref().is_some_and(|t| Arc::ptr_eq(t, tagged)) {
                    registry.untagged = None;
                    trace!("Throttle::release_when_idle: released untagged state");
                }
            }
            Some(tag) => {
                if registry.tagged.get(tag).is_some_and(|t| Arc::ptr_eq(t, tagged)) {
                    registry.tagged.shift_remove(tag);
                    trace!(?tag, "Throttle::release_when_idle: released tag state");
                }
            }
        }
    }

    /// Fairness loop
    ///
    /// Only one caller runs passes at a time; others raise `request` and
    /// return. `first` gets the first turn, then every tag in pass order,
    /// until a whole pass admits nothing and no request came in meanwhile.
    fn push_request(self: &Arc<Self>, first: &Arc<Tagged<D, T>>) -> Result<()> {
        self.request.store(true, Ordering::SeqCst);
        if self
            .pushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("Throttle::push_request: pass already running");
            return Ok(());
        }
        self.request.store(false, Ordering::SeqCst);

        self.run_passes(first)
    }

    /// A tag whose dispatch fails does not end the pass: the remaining tags
    /// still get their turn and the first failure is returned at the end.
    fn run_passes(self: &Arc<Self>, first: &Arc<Tagged<D, T>>) -> Result<()> {
        let mut failure = None;
        let mut empty = self.admit_or_record(first, &mut failure);
        let mut passes = 0usize;
        loop {
            passes += 1;
            for tagged in self.pass_order() {
                empty &= self.admit_or_record(&tagged, &mut failure);
            }
            if !empty {
                empty = true;
                continue;
            }
            self.pushing.store(false, Ordering::SeqCst);
            if self.request.load(Ordering::SeqCst)
                && self
                    .pushing
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                self.request.store(false, Ordering::SeqCst);
                continue;
            }
            break;
        }
        trace!(passes, failed = failure.is_some(), "Throttle::push_request: settled");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn admit_or_record(self: &Arc<Self>, tagged: &Arc<Tagged<D, T>>, failure: &mut Option<eyre::Report>) -> bool {
        match self.try_admit(tagged) {
            Ok(empty) => empty,
            Err(e) => {
                failure.get_or_insert(e);
                false
            }
        }
    }

    /// One admission turn for `tagged`; true when it has nothing more to push
    fn try_admit(self: &Arc<Self>, tagged: &Arc<Tagged<D, T>>) -> Result<bool> {
        if !self.counter.hold(self.id) {
            return Ok(true);
        }
        let mut empty = true;
        let promised = locked(&tagged.state).promote_promised(&self.policy);
        match promised {
            None => self.counter.release(self.id),
            Some(range) => {
                self.dispatch(tagged, range, true)?;
                empty &= !locked(&tagged.state).has_waiting_promised();
            }
        }

        if !self.counter.hold(self.id) {
            return Ok(true);
        }
        let promotion = locked(&tagged.state).promote(&self.policy);
        self.counters
            .evictions
            .fetch_add(promotion.cancelled.len() as u64, Ordering::Relaxed);
        self.counters
            .requeued
            .fetch_add(promotion.requeued as u64, Ordering::Relaxed);
        for range in &promotion.cancelled {
            self.request_cancel(range, tagged.tag.as_ref());
        }
        match promotion.chosen {
            None => self.counter.release(self.id),
            Some(range) => {
                self.dispatch(tagged, range, false)?;
                empty &= !locked(&tagged.state).has_waiting();
            }
        }
        Ok(empty)
    }

    /// Hand `range` to the executor with a completion wired to cleanup
    fn dispatch(self: &Arc<Self>, tagged: &Arc<Tagged<D, T>>, range: Range<D>, promised: bool) -> Result<()> {
        debug!(%range, tag = ?tagged.tag, promised, "Throttle::dispatch: called");
        let done = {
            let core = Arc::clone(self);
            let owner = Arc::clone(tagged);
            let finished = range.clone();
            Completion::new(move || {
                if let Err(e) = core.finish(&owner, &finished, promised) {
                    let error = format!("{e:#}");
                    error!(range = %finished, tag = ?owner.tag, %error, "Throttle::finish: re-admission failed");
                }
            })
        };
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak_executing
            .fetch_max(self.counter.inflight(self.id), Ordering::Relaxed);

        if let Err(e) = self.executor.execute(&range, tagged.tag.as_ref(), done.clone()) {
            warn!(%range, tag = ?tagged.tag, "Throttle::dispatch: executor refused work: {e:#}");
            done.done();
            return Err(e.wrap_err(format!("Failed to dispatch {range} for tag {:?}", tagged.tag)));
        }
        Ok(())
    }

    /// Completion cleanup; runs once per dispatched range
    fn finish(self: &Arc<Self>, tagged: &Arc<Tagged<D, T>>, range: &Range<D>, promised: bool) -> Result<()> {
        debug!(%range, tag = ?tagged.tag, promised, "Throttle::finish: called");
        let redundant = locked(&tagged.state).finish(range, promised, self.policy.min_first);
        for target in &redundant {
            self.request_cancel(target, tagged.tag.as_ref());
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counter.release(self.id);
        self.settle(tagged)
    }

    fn request_cancel(&self, range: &Range<D>, tag: Option<&T>) {
        debug!(%range, ?tag, "Throttle::request_cancel: called");
        self.counters.cancel_requests.fetch_add(1, Ordering::Relaxed);
        self.executor.cancel(range, tag);
    }
}
