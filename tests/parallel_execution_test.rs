//! # Parallel Execution Test Suite
//!
//! End-to-end checks for the worker pool, the runner and the distributor:
//! - every queued task yields exactly one result
//! - pools never exceed their worker count
//! - timeouts, panics and falsified properties become failed results
//! - load-balanced distribution spreads equal work evenly

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conjecture_executor::{
    Arbitrary, CounterexampleDatabase, DatabaseConfig, DistributionStrategy, ExecutionError, ForAll,
    ParallelTestRunner, PropertyBase, RunnerConfig, TestDistributor, TestExecutionConfig, TestTask,
    ThreadPool, TIMEOUT_MESSAGE,
};
use proptest::prelude::*;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_runner(threads: usize) -> ParallelTestRunner {
    ParallelTestRunner::new(
        RunnerConfig::default()
            .with_num_threads(threads)
            .with_adaptive_scheduling(false),
    )
}

struct Lists;

impl Arbitrary<Vec<u8>> for Lists {
    fn generate(&self, rng: &mut ChaCha8Rng) -> Vec<u8> {
        let len = rng.gen_range(0..20);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn shrink(&self, value: &Vec<u8>) -> Vec<Vec<u8>> {
        let mut candidates = Vec::new();
        if !value.is_empty() {
            candidates.push(value[..value.len() / 2].to_vec());
            candidates.push(value[1..].to_vec());
            candidates.push(value[..value.len() - 1].to_vec());
        }
        candidates
    }
}

struct ShortLists;

impl PropertyBase<Vec<u8>> for ShortLists {
    fn name(&self) -> &str {
        "short_lists"
    }

    fn check(&self, value: &Vec<u8>) -> Result<(), String> {
        if value.len() < 5 {
            Ok(())
        } else {
            Err(format!("length {} is not below 5", value.len()))
        }
    }
}

struct AnyList;

impl PropertyBase<Vec<u8>> for AnyList {
    fn name(&self) -> &str {
        "any_list"
    }

    fn check(&self, _value: &Vec<u8>) -> Result<(), String> {
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn run_all_returns_one_result_per_task(names in proptest::collection::vec("[a-z]{1,6}", 0..30)) {
        let runner = quiet_runner(3);
        for name in &names {
            runner.add_task(TestTask::new(name.clone(), || Ok(())));
        }

        let results = runner.run_all();
        prop_assert_eq!(results.len(), names.len());

        let mut returned: Vec<String> = results.into_iter().map(|r| r.test_name).collect();
        let mut submitted = names.clone();
        returned.sort();
        submitted.sort();
        prop_assert_eq!(returned, submitted);
    }
}

#[test]
fn test_pool_never_exceeds_worker_count() {
    init_logging();
    let pool = Arc::new(ThreadPool::new(3));
    let done = Arc::new(AtomicBool::new(false));
    let peak = Arc::new(AtomicUsize::new(0));

    let sampler = {
        let pool = Arc::clone(&pool);
        let done = Arc::clone(&done);
        let peak = Arc::clone(&peak);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                peak.fetch_max(pool.active_workers(), Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let handles: Vec<_> = (0..24)
        .map(|_| pool.enqueue(|| thread::sleep(Duration::from_millis(10))).unwrap())
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    sampler.join().unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_bounded_pool_wall_time() {
    let pool = ThreadPool::new(2);
    let start = Instant::now();
    let handles: Vec<_> = (0..5)
        .map(|_| pool.enqueue(|| thread::sleep(Duration::from_millis(50))).unwrap())
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "finished too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "finished too slow: {:?}", elapsed);
}

#[test]
fn test_enqueue_after_shutdown_fails() {
    let pool = ThreadPool::new(1);
    pool.shutdown();
    let err = pool.enqueue(|| 1).unwrap_err();
    assert_eq!(err, ExecutionError::PoolStopped);
    assert_eq!(err.to_string(), "pool stopped");
}

#[test]
fn test_growing_pool_overlaps_tasks() {
    let pool = ThreadPool::new(1);
    pool.set_size(3);
    assert_eq!(pool.size(), 3);

    let start = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|_| pool.enqueue(|| thread::sleep(Duration::from_millis(100))).unwrap())
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }
    assert!(start.elapsed() < Duration::from_millis(250));
}

#[test]
fn test_properties_end_to_end() {
    init_logging();
    let runner = quiet_runner(2);
    let config = TestExecutionConfig::default().with_seed(1234);

    runner.add_property(
        "short_lists",
        Arc::new(ForAll::<Vec<u8>>::new(Arc::new(Lists), Arc::new(ShortLists))),
        config.clone(),
    );
    runner.add_property(
        "any_list",
        Arc::new(ForAll::<Vec<u8>>::new(Arc::new(Lists), Arc::new(AnyList))),
        config,
    );

    let mut results = runner.run_all();
    results.sort_by(|a, b| a.test_name.cmp(&b.test_name));

    assert!(results[0].success);
    let failed = &results[1];
    assert!(!failed.success);
    assert!(failed.error_message.as_deref().unwrap().contains("short_lists"));
    let counterexample = failed.counterexample.as_deref().unwrap();
    // Minimal failing list has exactly five elements.
    assert_eq!(counterexample.matches(',').count(), 4);
    assert!(failed.shrink_attempts > 0);
}

#[test]
fn test_failures_flow_into_database() {
    let runner = quiet_runner(2);
    runner.add_property(
        "short_lists",
        Arc::new(ForAll::<Vec<u8>>::new(Arc::new(Lists), Arc::new(ShortLists))),
        TestExecutionConfig::default().with_seed(99),
    );

    let db = CounterexampleDatabase::new(DatabaseConfig::default());
    for result in runner.run_all() {
        if let Some(counterexample) = &result.counterexample {
            let message = result.error_message.clone().unwrap_or_default();
            db.store(&result.test_name, "short_lists", counterexample, &message, BTreeMap::new())
                .unwrap();
        }
    }

    let latest = db.get_latest("short_lists").unwrap();
    assert!(db.decompress(&latest).unwrap().starts_with('['));
}

#[test]
fn test_timeout_and_panic_do_not_break_runner() {
    let runner = quiet_runner(2);
    runner.add_task(
        TestTask::new("sleepy", || {
            thread::sleep(Duration::from_millis(400));
            Ok(())
        })
        .with_timeout(Duration::from_millis(40)),
    );
    runner.add_task(TestTask::new("panicky", || panic!("property blew up")));
    runner.add_task(TestTask::new("fine", || Ok(())));

    let mut results = runner.run_all();
    results.sort_by(|a, b| a.test_name.cmp(&b.test_name));
    assert_eq!(results.len(), 3);

    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].counterexample.is_none());
    assert_eq!(results[2].error_message.as_deref(), Some(TIMEOUT_MESSAGE));
    assert!(runner.get_detached_timeout_threads() >= 1);

    runner.add_task(TestTask::new("later", || Ok(())));
    let later = runner.run_all();
    assert!(later[0].success);

    let deadline = Instant::now() + Duration::from_secs(3);
    while runner.get_detached_timeout_threads() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(runner.get_detached_timeout_threads(), 0);
}

#[test]
fn test_load_balanced_distribution_is_even() {
    init_logging();
    let config = RunnerConfig::default()
        .with_num_threads(2)
        .with_adaptive_scheduling(false);
    let distributor = TestDistributor::new(3, config, DistributionStrategy::LoadBalanced).unwrap();

    for i in 0..30 {
        distributor.add_task(TestTask::new(format!("task_{}", i), || Ok(())));
    }
    for runner in distributor.runners() {
        let pending = runner.get_pending_tests();
        assert!((8..=12).contains(&pending), "unbalanced: {}", pending);
    }

    let results = distributor.run_all();
    assert_eq!(results.len(), 3);
    for per_runner in &results {
        assert!((8..=12).contains(&per_runner.len()));
    }
    assert_eq!(results.iter().map(Vec::len).sum::<usize>(), 30);
}

#[test]
fn test_distributor_requires_runners() {
    let result = TestDistributor::from_runners(Vec::new(), DistributionStrategy::RoundRobin);
    assert!(matches!(result, Err(ExecutionError::InvalidArgument(_))));
}
