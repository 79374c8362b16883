//! Parallel test runner
//!
//! Queues property checks, admits them onto a `ThreadPool` under concurrency and
//! resource budgets, and collects exactly one `TestResult` per queued task.
//!
//! Each check runs on its own auxiliary thread so the pool worker can enforce a
//! wall-clock timeout. A thread cannot be cancelled safely, so a check that overruns
//! its timeout is detached: it keeps running in the background until it finishes on
//! its own, and its eventual outcome is discarded. `get_detached_timeout_threads()`
//! reports how many such threads are still alive.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::adaptive::ThreadPoolInfo;
use super::resource_monitor::{MonitorConfig, ResourceMonitor};
use super::thread_pool::ThreadPool;
use super::panic_message;
use crate::property::{Property, PropertyFailure, TestExecutionConfig};

/// Error message recorded for a check that overran its timeout
pub const TIMEOUT_MESSAGE: &str = "Test timeout exceeded";

/// Poll interval while waiting for a concurrency slot
const CONCURRENCY_POLL: Duration = Duration::from_millis(10);

/// Poll interval while waiting for CPU or memory pressure to drop
const RESOURCE_POLL: Duration = Duration::from_millis(100);

type TestFn = Box<dyn FnOnce() -> Result<(), PropertyFailure> + Send + 'static>;

/// A queued unit of work
pub struct TestTask {
    pub name: String,
    /// Wall-clock budget; `None` uses the runner's `default_timeout`
    pub timeout: Option<Duration>,
    test: TestFn,
}

impl std::fmt::Debug for TestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestTask")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TestTask {
    pub fn new<F>(name: impl Into<String>, test: F) -> Self
    where
        F: FnOnce() -> Result<(), PropertyFailure> + Send + 'static,
    {
        TestTask {
            name: name.into(),
            timeout: None,
            test: Box::new(test),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub success: bool,
    pub duration: Duration,
    pub error_message: Option<String>,
    /// Rendered minimal failing value, when the property reported one
    pub counterexample: Option<String>,
    pub shrink_attempts: usize,
}

impl TestResult {
    pub fn passed(test_name: impl Into<String>, duration: Duration) -> Self {
        TestResult {
            test_name: test_name.into(),
            success: true,
            duration,
            error_message: None,
            counterexample: None,
            shrink_attempts: 0,
        }
    }

    pub fn failed(test_name: impl Into<String>, duration: Duration, message: impl Into<String>) -> Self {
        TestResult {
            test_name: test_name.into(),
            success: false,
            duration,
            error_message: Some(message.into()),
            counterexample: None,
            shrink_attempts: 0,
        }
    }

    fn from_failure(test_name: String, duration: Duration, failure: PropertyFailure) -> Self {
        let mut result = TestResult::failed(test_name, duration, failure.message());
        result.shrink_attempts = failure.shrink_attempts();
        if let PropertyFailure::Falsified { counterexample, .. } = failure {
            result.counterexample = counterexample;
        }
        result
    }
}

/// Scheduling knobs for a `ParallelTestRunner`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Worker count; 0 uses the available hardware parallelism
    pub num_threads: usize,
    /// Cap on concurrently executing tasks; 0 means unlimited
    pub max_concurrent_tests: usize,
    /// Timeout for tasks that do not carry their own
    pub default_timeout: Duration,
    /// Gate admission on the concurrency cap and live resource usage
    pub adaptive_scheduling: bool,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            num_threads: 0,
            max_concurrent_tests: 0,
            default_timeout: Duration::from_secs(60),
            adaptive_scheduling: true,
            cpu_threshold: 0.8,
            memory_threshold: 0.8,
        }
    }
}

impl RunnerConfig {
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_max_concurrent_tests(mut self, max: usize) -> Self {
        self.max_concurrent_tests = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_adaptive_scheduling(mut self, enabled: bool) -> Self {
        self.adaptive_scheduling = enabled;
        self
    }

    pub fn with_thresholds(mut self, cpu: f64, memory: f64) -> Self {
        self.cpu_threshold = cpu;
        self.memory_threshold = memory;
        self
    }

    fn resolved_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }
}

/// Runs queued property checks on a bounded pool
pub struct ParallelTestRunner {
    config: RunnerConfig,
    pool: Arc<ThreadPool>,
    pending: Mutex<VecDeque<TestTask>>,
    monitor: Option<Arc<ResourceMonitor>>,
    owns_monitor: bool,
    detached: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ParallelTestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTestRunner")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("pending", &self.get_pending_tests())
            .field("detached", &self.get_detached_timeout_threads())
            .finish()
    }
}

impl Default for ParallelTestRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl ParallelTestRunner {
    /// Create a runner. With `adaptive_scheduling` on, the runner starts and owns a
    /// `ResourceMonitor` sampling at the default interval.
    pub fn new(config: RunnerConfig) -> Self {
        let monitor = if config.adaptive_scheduling {
            let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::default()));
            monitor.start();
            Some(monitor)
        } else {
            None
        };
        Self::build(config, monitor, true)
    }

    /// Create a runner that reads resource usage from a shared monitor. The caller
    /// is responsible for starting and stopping it.
    pub fn with_monitor(config: RunnerConfig, monitor: Arc<ResourceMonitor>) -> Self {
        Self::build(config, Some(monitor), false)
    }

    fn build(config: RunnerConfig, monitor: Option<Arc<ResourceMonitor>>, owns_monitor: bool) -> Self {
        let pool = Arc::new(ThreadPool::with_name("pbt-runner", config.resolved_threads()));
        ParallelTestRunner {
            config,
            pool,
            pending: Mutex::new(VecDeque::new()),
            monitor,
            owns_monitor,
            detached: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Queue a property check bounded by `execution_config.timeout_ms`
    pub fn add_property(
        &self,
        name: impl Into<String>,
        property: Arc<dyn Property>,
        execution_config: TestExecutionConfig,
    ) {
        let timeout = execution_config.timeout();
        let task = TestTask::new(name, move || property.run(&execution_config)).with_timeout(timeout);
        self.add_task(task);
    }

    pub fn add_task(&self, task: TestTask) {
        self.pending.lock().push_back(task);
    }

    /// Drain the queue and block until every task has a result.
    ///
    /// Returns one result per task in completion-collection order, which is not
    /// necessarily submission order.
    pub fn run_all(&self) -> Vec<TestResult> {
        let mut handles = Vec::new();
        let mut results = Vec::new();

        loop {
            let task = match self.pending.lock().pop_front() {
                Some(task) => task,
                None => break,
            };

            if self.config.adaptive_scheduling {
                self.wait_for_admission();
            }

            let name = task.name.clone();
            let timeout = task.timeout.unwrap_or(self.config.default_timeout);
            let detached = Arc::clone(&self.detached);
            match self
                .pool
                .enqueue(move || run_test_with_timeout(task, timeout, &detached))
            {
                Ok(handle) => handles.push((name, handle)),
                Err(e) => results.push(TestResult::failed(name, Duration::ZERO, e.to_string())),
            }
        }

        for (name, handle) in handles {
            match handle.wait() {
                Ok(result) => results.push(result),
                Err(e) => results.push(TestResult::failed(name, Duration::ZERO, e.to_string())),
            }
        }

        results
    }

    /// Busy-poll until a concurrency slot is free and resource usage is under budget
    fn wait_for_admission(&self) {
        let max = self.config.max_concurrent_tests;
        if max > 0 {
            while self.in_flight() >= max && !self.is_stopped() {
                thread::sleep(CONCURRENCY_POLL);
            }
        }

        let mut throttled = false;
        while self.over_resource_budget() && !self.is_stopped() {
            if !throttled {
                log::debug!(
                    "Admission throttled: cpu {:.2}, memory {:.2}",
                    self.get_cpu_usage(),
                    self.get_memory_usage()
                );
                throttled = true;
            }
            thread::sleep(RESOURCE_POLL);
        }
    }

    /// Tasks handed to the pool that have not finished. The queue is read first so a
    /// task moving from queue to worker is never missed.
    fn in_flight(&self) -> usize {
        let queued = self.pool.queue_size();
        queued + self.pool.active_workers()
    }

    fn over_resource_budget(&self) -> bool {
        match &self.monitor {
            Some(monitor) => {
                let metrics = monitor.get_current_metrics();
                metrics.cpu_usage_percent > self.config.cpu_threshold
                    || metrics.memory_usage_percent > self.config.memory_threshold
            }
            None => false,
        }
    }

    /// Stop the owned monitor and shut the pool down. Queued tasks still produce
    /// failed results on the next `run_all`.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.owns_monitor {
            if let Some(monitor) = &self.monitor {
                monitor.stop();
            }
        }
        self.pool.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn get_cpu_usage(&self) -> f64 {
        self.monitor
            .as_ref()
            .map_or(0.0, |m| m.get_current_metrics().cpu_usage_percent)
    }

    pub fn get_memory_usage(&self) -> f64 {
        self.monitor
            .as_ref()
            .map_or(0.0, |m| m.get_current_metrics().memory_usage_percent)
    }

    pub fn get_active_threads(&self) -> usize {
        self.pool.active_workers()
    }

    pub fn get_pending_tests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Auxiliary threads abandoned after a timeout that have not yet finished
    pub fn get_detached_timeout_threads(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn monitor(&self) -> Option<&Arc<ResourceMonitor>> {
        self.monitor.as_ref()
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Handle for an `AdaptiveResourceManager` to resize this runner's pool.
    /// Only a weak reference is kept; once the runner is gone the handle reports 0.
    pub fn pool_info(&self, name: impl Into<String>, min_threads: usize, max_threads: usize) -> ThreadPoolInfo {
        let reader: Weak<ThreadPool> = Arc::downgrade(&self.pool);
        let writer = reader.clone();
        ThreadPoolInfo::new(
            name,
            move || reader.upgrade().map_or(0, |pool| pool.size()),
            move |size| {
                if let Some(pool) = writer.upgrade() {
                    pool.set_size(size);
                }
            },
        )
        .with_bounds(min_threads, max_threads)
    }
}

impl Drop for ParallelTestRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `task` on an auxiliary thread and wait at most `timeout` for it.
///
/// On timeout the auxiliary thread is detached and keeps running; `detached` is
/// incremented until it finishes.
fn run_test_with_timeout(task: TestTask, timeout: Duration, detached: &Arc<AtomicUsize>) -> TestResult {
    let TestTask { name, test, .. } = task;
    let start = Instant::now();

    // Set by whichever side finishes first: the check completing or the wait giving up
    let settled = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = mpsc::channel();

    let thread_settled = Arc::clone(&settled);
    let thread_detached = Arc::clone(detached);
    let spawned = thread::Builder::new()
        .name(check_thread_name(&name))
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(test));
            let _ = sender.send(outcome);
            if thread_settled.swap(true, Ordering::SeqCst) {
                thread_detached.fetch_sub(1, Ordering::SeqCst);
            }
        });

    if let Err(e) = spawned {
        return TestResult::failed(name, start.elapsed(), format!("Failed to spawn test thread: {}", e));
    }

    let outcome = match receiver.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            detached.fetch_add(1, Ordering::SeqCst);
            if !settled.swap(true, Ordering::SeqCst) {
                log::warn!(
                    "Test '{}' exceeded its {:?} timeout; its thread keeps running detached",
                    name,
                    timeout
                );
                return TestResult::failed(name, start.elapsed(), TIMEOUT_MESSAGE);
            }
            // The check finished between the timeout and the flag swap.
            detached.fetch_sub(1, Ordering::SeqCst);
            match receiver.recv() {
                Ok(outcome) => outcome,
                Err(_) => {
                    return TestResult::failed(name, start.elapsed(), "Test thread exited without reporting")
                }
            }
        }
        Err(RecvTimeoutError::Disconnected) => {
            return TestResult::failed(name, start.elapsed(), "Test thread exited without reporting");
        }
    };

    let duration = start.elapsed();
    match outcome {
        Ok(Ok(())) => TestResult::passed(name, duration),
        Ok(Err(failure)) => TestResult::from_failure(name, duration, failure),
        Err(payload) => TestResult::failed(name, duration, format!("Test panicked: {}", panic_message(&*payload))),
    }
}

/// OS thread names cannot carry NUL bytes
fn check_thread_name(test_name: &str) -> String {
    format!("pbt-check-{}", test_name.replace('\0', "\\0"))
}
