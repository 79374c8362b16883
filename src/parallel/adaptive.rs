//! Adaptive Resource Manager
//!
//! A proportional controller that resizes registered worker pools so process CPU and
//! memory usage track configured targets.
//!
//! Every `adjustment_interval` the manager reads the latest `ResourceMetrics` from its
//! `ResourceMonitor` and, per pool, compares usage against the targets:
//!
//! ```text
//! constraint = max(cpu / target_cpu, memory / target_memory)
//! constraint > 1.1  => shrink by adjustment_factor * (constraint - 1)
//! constraint < 0.9  => grow by adjustment_factor * (1 - constraint)
//! ```
//!
//! The result is clamped to the pool's bounds, and changes smaller than two threads
//! are ignored so the pool does not oscillate around its target.
//!
//! Pools are registered as `ThreadPoolInfo` handles: a pair of closures reading and
//! writing the pool size. The manager never owns the pools it drives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::Level;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::resource_monitor::{ResourceMetrics, ResourceMonitor};
use super::{ExecutionError, ExecutionResult};

/// Handle to a resizable pool
#[derive(Clone)]
pub struct ThreadPoolInfo {
    pub name: String,
    pub min_threads: usize,
    pub max_threads: usize,
    get_current_size: Arc<dyn Fn() -> usize + Send + Sync>,
    set_size: Arc<dyn Fn(usize) + Send + Sync>,
}

impl std::fmt::Debug for ThreadPoolInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolInfo")
            .field("name", &self.name)
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("current_size", &self.current_size())
            .finish()
    }
}

impl ThreadPoolInfo {
    /// Bounds default to one thread up to the available hardware parallelism
    pub fn new<G, S>(name: impl Into<String>, get_current_size: G, set_size: S) -> Self
    where
        G: Fn() -> usize + Send + Sync + 'static,
        S: Fn(usize) + Send + Sync + 'static,
    {
        ThreadPoolInfo {
            name: name.into(),
            min_threads: 1,
            max_threads: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            get_current_size: Arc::new(get_current_size),
            set_size: Arc::new(set_size),
        }
    }

    pub fn with_bounds(mut self, min_threads: usize, max_threads: usize) -> Self {
        self.min_threads = min_threads;
        self.max_threads = max_threads.max(min_threads);
        self
    }

    pub fn current_size(&self) -> usize {
        (self.get_current_size)()
    }

    pub fn resize(&self, size: usize) {
        (self.set_size)(size)
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            name: self.name.clone(),
            current_size: self.current_size(),
            min_threads: self.min_threads,
            max_threads: self.max_threads,
        }
    }
}

/// Snapshot of a registered pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub name: String,
    pub current_size: usize,
    pub min_threads: usize,
    pub max_threads: usize,
}

/// Controller targets and gains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub target_cpu_usage: f64,
    pub target_memory_usage: f64,
    pub adjustment_interval: Duration,
    /// Fraction of the deviation applied per adjustment
    pub adjustment_factor: f64,
    /// Log adjustments at info level instead of debug
    pub enable_logging: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            target_cpu_usage: 0.7,
            target_memory_usage: 0.6,
            adjustment_interval: Duration::from_secs(5),
            adjustment_factor: 0.2,
            enable_logging: false,
        }
    }
}

impl AdaptiveConfig {
    pub fn with_targets(mut self, cpu: f64, memory: f64) -> Self {
        self.target_cpu_usage = cpu;
        self.target_memory_usage = memory;
        self
    }

    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    pub fn with_adjustment_factor(mut self, factor: f64) -> Self {
        self.adjustment_factor = factor;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    fn log_level(&self) -> Level {
        if self.enable_logging {
            Level::Info
        } else {
            Level::Debug
        }
    }
}

/// Target size for a pool of `current` threads under `metrics`
fn optimal_threads(
    config: &AdaptiveConfig,
    current: usize,
    min_threads: usize,
    max_threads: usize,
    metrics: &ResourceMetrics,
) -> usize {
    let max_threads = max_threads.max(min_threads);
    let cpu_ratio = metrics.cpu_usage_percent / config.target_cpu_usage;
    let memory_ratio = metrics.memory_usage_percent / config.target_memory_usage;
    let constraint = cpu_ratio.max(memory_ratio);

    let scaled = if constraint > 1.1 {
        current as f64 * (1.0 - config.adjustment_factor * (constraint - 1.0))
    } else if constraint < 0.9 {
        current as f64 * (1.0 + config.adjustment_factor * (1.0 - constraint))
    } else {
        current as f64
    };

    // `as` saturates: NaN and negatives become 0 before clamping
    let optimal = (scaled as usize).clamp(min_threads, max_threads);
    if optimal.abs_diff(current) < 2 {
        current.clamp(min_threads, max_threads)
    } else {
        optimal
    }
}

struct ManagerShared {
    config: AdaptiveConfig,
    monitor: Arc<ResourceMonitor>,
    pools: Mutex<Vec<ThreadPoolInfo>>,
    running: AtomicBool,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
}

impl ManagerShared {
    fn adjust(&self) {
        let metrics = self.monitor.get_current_metrics();
        let level = self.config.log_level();
        let pools = self.pools.lock();

        for pool in pools.iter() {
            let current = pool.current_size();
            let optimal =
                optimal_threads(&self.config, current, pool.min_threads, pool.max_threads, &metrics);
            if optimal != current {
                log::log!(
                    level,
                    "Adjusting pool '{}' from {} to {} threads (cpu {:.1}%, memory {:.1}%)",
                    pool.name,
                    current,
                    optimal,
                    metrics.cpu_usage_percent * 100.0,
                    metrics.memory_usage_percent * 100.0
                );
                pool.resize(optimal);
            }
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.adjust();

            let mut guard = self.sleep_lock.lock();
            self.wakeup.wait_while_for(
                &mut guard,
                |_| self.running.load(Ordering::SeqCst),
                self.config.adjustment_interval,
            );
        }
    }
}

/// Background controller resizing registered pools toward CPU and memory targets
pub struct AdaptiveResourceManager {
    shared: Arc<ManagerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AdaptiveResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveResourceManager")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .field("pools", &self.get_pool_states())
            .finish()
    }
}

impl AdaptiveResourceManager {
    pub fn new(config: AdaptiveConfig, monitor: Arc<ResourceMonitor>) -> Self {
        AdaptiveResourceManager {
            shared: Arc::new(ManagerShared {
                config,
                monitor,
                pools: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                sleep_lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn register_thread_pool(&self, pool: ThreadPoolInfo) {
        log::debug!(
            "Registered pool '{}' with bounds [{}, {}]",
            pool.name,
            pool.min_threads,
            pool.max_threads
        );
        self.shared.pools.lock().push(pool);
    }

    /// Start the adjustment loop, starting the monitor too if it is idle
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.shared.monitor.is_running() {
            self.shared.monitor.start();
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("pbt-adaptive-manager".to_string())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                log::warn!("Failed to start adaptive manager thread: {}", e);
            }
        }
    }

    /// Stop the adjustment loop. The monitor is left running.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Run one controller tick immediately
    pub fn adjust_now(&self) {
        self.shared.adjust();
    }

    /// Size the controller would choose for `pool` under `metrics`
    pub fn calculate_optimal_threads(&self, pool: &ThreadPoolInfo, metrics: &ResourceMetrics) -> usize {
        optimal_threads(
            &self.shared.config,
            pool.current_size(),
            pool.min_threads,
            pool.max_threads,
            metrics,
        )
    }

    /// Grow `pool_name` by `threads`, capped at its maximum. Returns the new size.
    pub fn scale_up(&self, pool_name: &str, threads: usize) -> ExecutionResult<usize> {
        self.with_pool(pool_name, |pool| {
            pool.current_size().saturating_add(threads).min(pool.max_threads)
        })
    }

    /// Shrink `pool_name` by `threads`, floored at its minimum. Returns the new size.
    pub fn scale_down(&self, pool_name: &str, threads: usize) -> ExecutionResult<usize> {
        self.with_pool(pool_name, |pool| {
            let current = pool.current_size();
            let reduced = if current > threads {
                current - threads
            } else {
                pool.min_threads
            };
            reduced.max(pool.min_threads)
        })
    }

    /// Resize every registered pool to `threads`, clamped to each pool's bounds
    pub fn set_all_pools(&self, threads: usize) {
        let level = self.shared.config.log_level();
        for pool in self.shared.pools.lock().iter() {
            let size = threads.clamp(pool.min_threads, pool.max_threads);
            log::log!(level, "Setting pool '{}' to {} threads", pool.name, size);
            pool.resize(size);
        }
    }

    pub fn get_pool_states(&self) -> Vec<PoolState> {
        self.shared.pools.lock().iter().map(ThreadPoolInfo::state).collect()
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.shared.config
    }

    fn with_pool<F>(&self, pool_name: &str, target: F) -> ExecutionResult<usize>
    where
        F: FnOnce(&ThreadPoolInfo) -> usize,
    {
        let pools = self.shared.pools.lock();
        let pool = pools
            .iter()
            .find(|pool| pool.name == pool_name)
            .ok_or_else(|| ExecutionError::InvalidArgument(format!("unknown pool '{}'", pool_name)))?;

        let size = target(pool);
        log::log!(
            self.shared.config.log_level(),
            "Manually resizing pool '{}' from {} to {} threads",
            pool.name,
            pool.current_size(),
            size
        );
        pool.resize(size);
        Ok(size)
    }
}

impl Drop for AdaptiveResourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::resource_monitor::{MetricsSource, MonitorConfig};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Instant, SystemTime};

    struct Fixed(f64, f64);

    impl MetricsSource for Fixed {
        fn collect(&self) -> ResourceMetrics {
            metrics(self.0, self.1)
        }
    }

    fn metrics(cpu: f64, memory: f64) -> ResourceMetrics {
        ResourceMetrics {
            cpu_usage_percent: cpu,
            memory_usage_percent: memory,
            timestamp: SystemTime::now(),
            ..ResourceMetrics::default()
        }
    }

    fn counter_pool(name: &str, size: usize, min: usize, max: usize) -> (ThreadPoolInfo, Arc<AtomicUsize>) {
        let value = Arc::new(AtomicUsize::new(size));
        let reader = Arc::clone(&value);
        let writer = Arc::clone(&value);
        let info = ThreadPoolInfo::new(
            name,
            move || reader.load(Ordering::SeqCst),
            move |n| writer.store(n, Ordering::SeqCst),
        )
        .with_bounds(min, max);
        (info, value)
    }

    fn manager(cpu: f64, memory: f64) -> AdaptiveResourceManager {
        let monitor = Arc::new(ResourceMonitor::with_source(
            MonitorConfig::default().with_sampling_interval(Duration::from_millis(10)),
            Box::new(Fixed(cpu, memory)),
        ));
        AdaptiveResourceManager::new(
            AdaptiveConfig::default().with_adjustment_interval(Duration::from_millis(20)),
            monitor,
        )
    }

    #[test]
    fn test_on_target_keeps_size() {
        let config = AdaptiveConfig::default();
        assert_eq!(optimal_threads(&config, 8, 1, 16, &metrics(0.7, 0.6)), 8);
        assert_eq!(optimal_threads(&config, 8, 1, 16, &metrics(0.75, 0.3)), 8);
    }

    #[test]
    fn test_overload_shrinks() {
        let config = AdaptiveConfig::default();
        // constraint 2.0 => 8 * (1 - 0.2) = 6.4
        assert_eq!(optimal_threads(&config, 8, 1, 16, &metrics(1.4, 0.1)), 6);
        // memory-bound: 1.2 / 0.6 = 2.0
        assert_eq!(optimal_threads(&config, 8, 1, 16, &metrics(0.1, 1.2)), 6);
    }

    #[test]
    fn test_underload_grows() {
        let config = AdaptiveConfig::default();
        // constraint 0.1 => 20 * 1.18 = 23.6
        assert_eq!(optimal_threads(&config, 20, 1, 32, &metrics(0.07, 0.0)), 23);
    }

    #[test]
    fn test_small_changes_are_suppressed() {
        let config = AdaptiveConfig::default();
        // 8 * 1.18 = 9.44 => only one thread more
        assert_eq!(optimal_threads(&config, 8, 1, 16, &metrics(0.07, 0.0)), 8);
    }

    #[test]
    fn test_result_respects_bounds() {
        let config = AdaptiveConfig::default().with_adjustment_factor(5.0);
        assert_eq!(optimal_threads(&config, 8, 4, 16, &metrics(7.0, 0.0)), 4);
        assert_eq!(optimal_threads(&config, 8, 4, 10, &metrics(0.0, 0.0)), 10);
        assert_eq!(optimal_threads(&config, 0, 1, 4, &metrics(0.7, 0.6)), 1);
        assert_eq!(optimal_threads(&config, 9, 1, 4, &metrics(0.7, 0.6)), 4);
    }

    #[test]
    fn test_manual_scaling() {
        let manager = manager(0.5, 0.5);
        let (info, size) = counter_pool("workers", 4, 2, 8);
        manager.register_thread_pool(info);

        assert_eq!(manager.scale_up("workers", 3).unwrap(), 7);
        assert_eq!(manager.scale_up("workers", 3).unwrap(), 8);
        assert_eq!(manager.scale_down("workers", 5).unwrap(), 3);
        assert_eq!(manager.scale_down("workers", 5).unwrap(), 2);
        assert_eq!(size.load(Ordering::SeqCst), 2);

        assert!(matches!(
            manager.scale_up("missing", 1),
            Err(ExecutionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_set_all_pools_clamps() {
        let manager = manager(0.5, 0.5);
        let (small, small_size) = counter_pool("small", 2, 1, 4);
        let (large, large_size) = counter_pool("large", 2, 8, 32);
        manager.register_thread_pool(small);
        manager.register_thread_pool(large);

        manager.set_all_pools(6);
        assert_eq!(small_size.load(Ordering::SeqCst), 4);
        assert_eq!(large_size.load(Ordering::SeqCst), 8);

        let states = manager.get_pool_states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].name, "small");
        assert_eq!(states[0].current_size, 4);
        assert_eq!(states[1].min_threads, 8);
    }

    #[test]
    fn test_adjust_now_uses_monitor_metrics() {
        let manager = manager(1.4, 0.1);
        let (info, size) = counter_pool("workers", 8, 1, 16);
        manager.register_thread_pool(info);

        manager.shared.monitor.sample_now();
        manager.adjust_now();
        assert_eq!(size.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_background_loop_grows_idle_pool() {
        let manager = manager(0.0, 0.0);
        let (info, size) = counter_pool("workers", 20, 1, 64);
        manager.register_thread_pool(info);

        manager.start();
        manager.start();
        assert!(manager.is_running());
        assert!(manager.shared.monitor.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        while size.load(Ordering::SeqCst) <= 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(size.load(Ordering::SeqCst) > 20);

        manager.stop();
        manager.stop();
        assert!(!manager.is_running());
        assert!(manager.shared.monitor.is_running());
        manager.shared.monitor.stop();
    }
}
