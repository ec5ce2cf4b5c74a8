//! Integration tests for rangethrottle
//!
//! These drive throttles through the public API with recording and
//! tokio-backed executors.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use eyre::Result;
use rangethrottle::{Completion, Config, Counter, Executor, Range, Throttle, ThrottleConfig};
use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn r(from: i64, to: i64) -> Range<i64> {
    Range::new(from, to)
}

/// Executor that records every call and leaves completion to the test
#[derive(Default)]
struct Recorder {
    started: Mutex<Vec<(Range<i64>, Completion)>>,
    cancelled: Mutex<Vec<Range<i64>>>,
}

impl Executor<i64, String> for Recorder {
    fn execute(&self, range: &Range<i64>, _tag: Option<&String>, done: Completion) -> Result<()> {
        self.started.lock().unwrap().push((range.clone(), done));
        Ok(())
    }

    fn cancel(&self, range: &Range<i64>, _tag: Option<&String>) {
        self.cancelled.lock().unwrap().push(range.clone());
    }
}

impl Recorder {
    fn started(&self) -> Vec<Range<i64>> {
        self.started.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    fn cancelled(&self) -> Vec<Range<i64>> {
        self.cancelled.lock().unwrap().clone()
    }

    fn complete(&self, range: &Range<i64>) {
        let done = self
            .started
            .lock()
            .unwrap()
            .iter()
            .find(|(r, _)| r == range)
            .map(|(_, d)| d.clone())
            .expect("range was never started");
        done.done();
    }
}

fn throttle(
    counter: &Arc<Counter>,
    limit: usize,
    lru_capacity: Option<usize>,
) -> (Throttle<i64, String>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let config = ThrottleConfig {
        limit,
        min_first: true,
        lru_capacity,
    };
    let throttle = Throttle::new(Arc::clone(counter), &config, recorder.clone()).expect("valid config");
    (throttle, recorder)
}

fn tag(name: &str) -> Option<String> {
    Some(name.to_string())
}

// =============================================================================
// Admission
// =============================================================================

#[test]
fn test_truncation_keeps_minimum_first() {
    init_tracing();
    let counter = Arc::new(Counter::new(2).unwrap());
    let (throttle, recorder) = throttle(&counter, 5, None);

    throttle.put(r(0, 9), tag("feed"), false).unwrap();

    let started = recorder.started();
    assert_eq!(started[0], r(0, 4));
    assert_eq!(started, vec![r(0, 4), r(5, 9)]);
}

#[test]
fn test_remainder_admitted_once_slot_frees() {
    init_tracing();
    let counter = Arc::new(Counter::new(1).unwrap());
    let (throttle, recorder) = throttle(&counter, 5, None);

    throttle.put(r(0, 9), tag("feed"), false).unwrap();
    assert_eq!(recorder.started(), vec![r(0, 4)]);
    assert_eq!(throttle.snapshot()[0].waiting, vec![r(5, 9)]);

    recorder.complete(&r(0, 4));
    assert_eq!(recorder.started(), vec![r(0, 4), r(5, 9)]);
}

#[test]
fn test_promised_overlap_never_readmitted_best_effort() {
    init_tracing();
    let counter = Arc::new(Counter::new(1).unwrap());
    let (throttle, recorder) = throttle(&counter, 10, None);

    // Occupy the only slot so both requests queue up together.
    throttle.put(r(50, 50), tag("feed"), false).unwrap();
    throttle.put(r(2, 2), tag("feed"), true).unwrap();
    throttle.put(r(0, 5), tag("feed"), false).unwrap();

    recorder.complete(&r(50, 50));
    assert_eq!(recorder.started(), vec![r(50, 50), r(2, 2)]);

    recorder.complete(&r(2, 2));
    recorder.complete(&r(0, 1));

    let started = recorder.started();
    assert_eq!(started, vec![r(50, 50), r(2, 2), r(0, 1), r(3, 5)]);
    for range in &started[2..] {
        assert!(!range.overlap(&r(2, 2)), "{range} re-covers promised work");
    }
}

#[test]
fn test_eviction_cancels_least_recent_best_effort() {
    init_tracing();
    let counter = Arc::new(Counter::new(4).unwrap());
    let (throttle, recorder) = throttle(&counter, 1, Some(2));

    throttle.put(r(100, 100), tag("feed"), true).unwrap();
    throttle.put(r(0, 0), tag("feed"), false).unwrap();
    throttle.put(r(1, 1), tag("feed"), false).unwrap();
    assert!(recorder.cancelled().is_empty());

    throttle.put(r(2, 2), tag("feed"), false).unwrap();
    assert_eq!(recorder.cancelled(), vec![r(0, 0)]);
    assert_eq!(throttle.stats().evictions, 1);

    let snapshot = &throttle.snapshot()[0];
    assert_eq!(snapshot.executing, vec![r(0, 0), r(1, 1), r(2, 2)]);
    assert_eq!(snapshot.executing_promised, vec![r(100, 100)]);

    // The cancelled range reports back like any other completion.
    recorder.complete(&r(0, 0));
    let snapshot = &throttle.snapshot()[0];
    assert_eq!(snapshot.executing, vec![r(1, 1), r(2, 2)]);
    assert!(!recorder.cancelled().contains(&r(100, 100)));
}

#[test]
fn test_evicted_waiting_work_is_requeued() {
    init_tracing();
    let counter = Arc::new(Counter::new(2).unwrap());
    let (throttle, recorder) = throttle(&counter, 1, None);

    throttle.put(r(0, 0), None, false).unwrap();
    throttle.put(r(10, 10), None, false).unwrap();
    for point in [20, 30, 40] {
        throttle.put(r(point, point), None, false).unwrap();
    }

    recorder.complete(&r(0, 0));
    assert_eq!(recorder.started().last(), Some(&r(40, 40)));

    let snapshot = &throttle.snapshot()[0];
    assert_eq!(snapshot.waiting, vec![r(20, 20), r(30, 30)]);
    assert!(recorder.cancelled().is_empty());

    // Nothing running was pushed out, so only the requeue counter moves.
    let stats = throttle.stats();
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.requeued, 2);
}

#[test]
fn test_triggering_tag_goes_first_then_others() {
    init_tracing();
    let counter = Arc::new(Counter::new(2).unwrap());
    let (throttle, recorder) = throttle(&counter, 1, None);

    throttle.put(r(0, 0), tag("a"), false).unwrap();
    throttle.put(r(1, 1), tag("a"), false).unwrap();
    throttle.put(r(2, 2), tag("a"), false).unwrap();
    throttle.put(r(10, 10), tag("b"), false).unwrap();
    throttle.put(r(11, 11), tag("b"), false).unwrap();
    assert_eq!(recorder.started().len(), 2);

    recorder.complete(&r(0, 0));
    assert_eq!(recorder.started().last(), Some(&r(2, 2)));

    recorder.complete(&r(1, 1));
    assert_eq!(recorder.started().last(), Some(&r(11, 11)));
}

// =============================================================================
// Counter
// =============================================================================

#[test]
fn test_counter_never_starves_an_idle_throttle() {
    init_tracing();
    let counter = Arc::new(Counter::new(1).unwrap());
    let (a, recorder_a) = throttle(&counter, 10, None);
    let (b, recorder_b) = throttle(&counter, 10, None);

    a.put(r(0, 0), None, false).unwrap();
    b.put(r(0, 0), None, false).unwrap();
    a.put(r(5, 5), None, false).unwrap();
    b.put(r(5, 5), None, false).unwrap();

    assert_eq!(recorder_a.started(), vec![r(0, 0)]);
    assert_eq!(recorder_b.started(), vec![r(0, 0)]);
    assert_eq!(counter.count(), 2);

    recorder_a.complete(&r(0, 0));
    assert_eq!(recorder_a.started(), vec![r(0, 0), r(5, 5)]);
    assert_eq!(recorder_b.started(), vec![r(0, 0)]);
}

#[test]
fn test_destroy_unregisters_and_keeps_promised() {
    init_tracing();
    let counter = Arc::new(Counter::new(4).unwrap());
    let (throttle, recorder) = throttle(&counter, 10, None);

    throttle.put(r(0, 3), tag("a"), true).unwrap();
    throttle.put(r(10, 12), tag("a"), false).unwrap();
    throttle.destroy(true);

    assert_eq!(recorder.cancelled(), vec![r(10, 12)]);
    assert!(!counter.is_registered(throttle.id()));

    recorder.complete(&r(0, 3));
    recorder.complete(&r(10, 12));
    assert_eq!(counter.count(), 0);
}

// =============================================================================
// Domains and configuration
// =============================================================================

#[derive(Default)]
struct DayLog {
    started: Mutex<Vec<Range<NaiveDate>>>,
}

impl Executor<NaiveDate, ()> for DayLog {
    fn execute(&self, range: &Range<NaiveDate>, _tag: Option<&()>, done: Completion) -> Result<()> {
        self.started.lock().unwrap().push(range.clone());
        done.done();
        Ok(())
    }

    fn cancel(&self, _range: &Range<NaiveDate>, _tag: Option<&()>) {}
}

#[test]
fn test_date_ranges_split_by_days() {
    init_tracing();
    let day = |d: u32| NaiveDate::from_ymd_opt(2024, 2, d).unwrap();
    let counter = Arc::new(Counter::new(1).unwrap());
    let log = Arc::new(DayLog::default());
    let config = ThrottleConfig {
        limit: 7,
        ..Default::default()
    };
    let throttle: Throttle<NaiveDate, ()> = Throttle::new(counter, &config, log.clone()).unwrap();

    throttle.put(Range::new(day(1), day(20)), None, false).unwrap();

    let started = log.started.lock().unwrap().clone();
    assert_eq!(
        started,
        vec![
            Range::new(day(1), day(7)),
            Range::new(day(8), day(14)),
            Range::new(day(15), day(20)),
        ]
    );
}

#[test]
fn test_throttle_from_config_file() {
    init_tracing();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "counter:\n  max-req-count: 2\nthrottle:\n  limit: 3\n  min-first: false").unwrap();

    let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
    let counter = Arc::new(Counter::from_config(&config.counter).unwrap());
    let recorder = Arc::new(Recorder::default());
    let throttle: Throttle<i64, String> = Throttle::new(counter, &config.throttle, recorder.clone()).unwrap();

    throttle.put(r(0, 7), None, false).unwrap();
    assert_eq!(recorder.started(), vec![r(5, 7), r(2, 4)]);
}

// =============================================================================
// Asynchronous executor
// =============================================================================

/// Runs each range as a tokio task that sleeps briefly, then completes
struct Sleeper {
    handle: tokio::runtime::Handle,
    covered: Arc<Mutex<Vec<Range<i64>>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Executor<i64, String> for Sleeper {
    fn execute(&self, range: &Range<i64>, _tag: Option<&String>, done: Completion) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.covered.lock().unwrap().push(range.clone());

        let running = Arc::clone(&self.running);
        self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            done.done();
        });
        Ok(())
    }

    fn cancel(&self, _range: &Range<i64>, _tag: Option<&String>) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_executor_covers_every_point_once() {
    init_tracing();
    let counter = Arc::new(Counter::new(2).unwrap());
    let covered = Arc::new(Mutex::new(Vec::new()));
    let peak = Arc::new(AtomicUsize::new(0));
    let sleeper = Arc::new(Sleeper {
        handle: tokio::runtime::Handle::current(),
        covered: Arc::clone(&covered),
        running: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
    });
    let config = ThrottleConfig {
        limit: 5,
        ..Default::default()
    };
    let throttle: Throttle<i64, String> = Throttle::new(Arc::clone(&counter), &config, sleeper).unwrap();

    for point in 0..40 {
        throttle.put_point(point, tag("feed"), false).unwrap();
    }

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stats = throttle.stats();
            if stats.dispatched == stats.completed && throttle.snapshot().is_empty() && counter.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "throttle did not drain");

    let covered = covered.lock().unwrap().clone();
    let points: BTreeSet<i64> = covered.iter().flat_map(|range| *range.from()..=*range.to()).collect();
    let total: i64 = covered.iter().map(Range::len).sum();
    assert_eq!(points, (0..40).collect::<BTreeSet<_>>());
    assert_eq!(total, 40, "some points ran twice");
    assert!(covered.iter().all(|range| range.len() <= 5));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(throttle.stats().peak_executing <= 2);
    assert_eq!(counter.count(), 0);
}
