//! Resource Monitor for CPU and Memory Governance
//!
//! A background sampler that records process CPU and memory usage at a fixed
//! interval, keeps a bounded history, and raises edge-triggered alerts when usage
//! crosses configured thresholds.
//!
//! # Architecture
//!
//! - `MetricsSource`: where readings come from. `ProcessMetrics` reads procfs on
//!   Linux; tests and embedders can supply their own.
//! - `ResourceMonitor`: owns the sampling thread, the latest snapshot and the
//!   history ring. All mutable state sits behind one mutex.
//!
//! History is append-only and ordered oldest to newest. Windowed aggregates walk it
//! from the newest sample backwards and stop at the first sample outside the window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// One snapshot of process resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Process CPU usage normalised by core count, in [0, 1]
    pub cpu_usage_percent: f64,
    /// Resident memory as a fraction of total system memory, in [0, 1]
    pub memory_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub available_memory_bytes: u64,
    pub num_threads: usize,
    pub timestamp: SystemTime,
}

impl Default for ResourceMetrics {
    fn default() -> Self {
        ResourceMetrics {
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            memory_usage_bytes: 0,
            available_memory_bytes: 0,
            num_threads: 0,
            timestamp: UNIX_EPOCH,
        }
    }
}

/// Provider of resource readings
pub trait MetricsSource: Send + Sync {
    /// Take one reading. Implementations stamp `timestamp` themselves.
    fn collect(&self) -> ResourceMetrics;
}

/// Kernel clock ticks per second used by `/proc/<pid>/stat` on every mainstream Linux
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Readings for the current process
#[derive(Debug)]
pub struct ProcessMetrics {
    last_cpu: Mutex<Option<(Instant, f64)>>,
    cpu_count: usize,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetrics {
    pub fn new() -> Self {
        ProcessMetrics {
            last_cpu: Mutex::new(None),
            cpu_count: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }

    /// CPU usage since the previous call, as a fraction of all cores
    #[cfg(target_os = "linux")]
    fn cpu_fraction(&self, cpu_seconds: f64) -> f64 {
        let now = Instant::now();
        let mut last = self.last_cpu.lock();
        let usage = match *last {
            Some((at, previous)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    (cpu_seconds - previous) / elapsed / self.cpu_count as f64
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, cpu_seconds));
        usage.clamp(0.0, 1.0)
    }
}

impl MetricsSource for ProcessMetrics {
    #[cfg(target_os = "linux")]
    fn collect(&self) -> ResourceMetrics {
        let mut metrics = ResourceMetrics {
            timestamp: SystemTime::now(),
            ..ResourceMetrics::default()
        };

        if let Some((cpu_seconds, threads)) = read_proc_stat() {
            metrics.cpu_usage_percent = self.cpu_fraction(cpu_seconds);
            metrics.num_threads = threads;
        }

        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(value) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = parse_kb_value(value) {
                        metrics.memory_usage_bytes = kb * 1024;
                    }
                }
            }
        }

        let (total, available) = read_meminfo();
        metrics.available_memory_bytes = available;
        if total > 0 {
            metrics.memory_usage_percent =
                (metrics.memory_usage_bytes as f64 / total as f64).clamp(0.0, 1.0);
        }

        metrics
    }

    #[cfg(not(target_os = "linux"))]
    fn collect(&self) -> ResourceMetrics {
        let _ = &self.last_cpu;
        // No portable reading without FFI; report a neutral reading.
        ResourceMetrics {
            cpu_usage_percent: 0.5,
            memory_usage_percent: 0.5,
            memory_usage_bytes: 100 * 1024 * 1024,
            available_memory_bytes: 1024 * 1024 * 1024,
            num_threads: self.cpu_count,
            timestamp: SystemTime::now(),
        }
    }
}

/// (user + system CPU seconds, thread count) from `/proc/self/stat`
#[cfg(target_os = "linux")]
fn read_proc_stat() -> Option<(f64, usize)> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state): utime=14, stime=15, num_threads=20
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    let threads: usize = fields.get(17)?.parse().ok()?;
    Some(((utime + stime) / CLOCK_TICKS_PER_SEC, threads))
}

/// (total, available) system memory in bytes
#[cfg(target_os = "linux")]
fn read_meminfo() -> (u64, u64) {
    let mut total = 0;
    let mut available = 0;
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        for line in meminfo.lines() {
            if let Some(value) = line.strip_prefix("MemTotal:") {
                total = parse_kb_value(value).map_or(0, |kb| kb * 1024);
            } else if let Some(value) = line.strip_prefix("MemAvailable:") {
                available = parse_kb_value(value).map_or(0, |kb| kb * 1024);
            }
        }
    }
    (total, available)
}

#[cfg(target_os = "linux")]
fn parse_kb_value(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

/// Called with the triggering snapshot and a human-readable message
pub type AlertCallback = Arc<dyn Fn(&ResourceMetrics, &str) + Send + Sync>;

/// Sampling and alerting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub sampling_interval: Duration,
    /// Maximum number of snapshots retained
    pub history_size: usize,
    pub enable_alerts: bool,
    pub cpu_alert_threshold: f64,
    pub memory_alert_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            sampling_interval: Duration::from_millis(500),
            history_size: 60,
            enable_alerts: true,
            cpu_alert_threshold: 0.9,
            memory_alert_threshold: 0.85,
        }
    }
}

impl MonitorConfig {
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn with_alerts(mut self, enabled: bool) -> Self {
        self.enable_alerts = enabled;
        self
    }

    pub fn with_thresholds(mut self, cpu: f64, memory: f64) -> Self {
        self.cpu_alert_threshold = cpu;
        self.memory_alert_threshold = memory;
        self
    }
}

struct MonitorState {
    config: MonitorConfig,
    current: ResourceMetrics,
    history: VecDeque<ResourceMetrics>,
    last_cpu_level: f64,
    last_memory_level: f64,
}

impl MonitorState {
    fn push_history(&mut self, metrics: ResourceMetrics) {
        if self.config.history_size == 0 {
            return;
        }
        // A wall clock stepping backwards must not break the ordering
        if let Some(newest) = self.history.back() {
            if metrics.timestamp < newest.timestamp {
                log::debug!("Dropping resource sample older than the newest in history");
                return;
            }
        }
        while self.history.len() >= self.config.history_size {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    /// Messages for thresholds crossed upwards since the previous sample
    fn crossed_thresholds(&mut self, metrics: &ResourceMetrics) -> Vec<String> {
        let mut alerts = Vec::new();

        let cpu_threshold = self.config.cpu_alert_threshold;
        let previous_cpu = std::mem::replace(&mut self.last_cpu_level, metrics.cpu_usage_percent);
        if metrics.cpu_usage_percent > cpu_threshold && previous_cpu <= cpu_threshold {
            alerts.push(format!(
                "CPU usage exceeded threshold: {:.1}%",
                metrics.cpu_usage_percent * 100.0
            ));
        }

        let memory_threshold = self.config.memory_alert_threshold;
        let previous_memory =
            std::mem::replace(&mut self.last_memory_level, metrics.memory_usage_percent);
        if metrics.memory_usage_percent > memory_threshold && previous_memory <= memory_threshold {
            alerts.push(format!(
                "Memory usage exceeded threshold: {:.1}%",
                metrics.memory_usage_percent * 100.0
            ));
        }

        alerts
    }

    /// Samples within `window` of now, newest first
    fn window(&self, window: Duration) -> impl Iterator<Item = &ResourceMetrics> {
        let cutoff = SystemTime::now().checked_sub(window).unwrap_or(UNIX_EPOCH);
        self.history.iter().rev().take_while(move |m| m.timestamp >= cutoff)
    }
}

struct MonitorShared {
    source: Box<dyn MetricsSource>,
    running: AtomicBool,
    state: Mutex<MonitorState>,
    alert_callback: Mutex<Option<AlertCallback>>,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
}

impl MonitorShared {
    fn sample(&self) -> ResourceMetrics {
        let (metrics, alerts) = {
            // Collecting under the lock keeps concurrent samples in timestamp order
            let mut state = self.state.lock();
            let metrics = self.source.collect();
            state.current = metrics.clone();
            state.push_history(metrics.clone());
            let alerts = if state.config.enable_alerts {
                state.crossed_thresholds(&metrics)
            } else {
                Vec::new()
            };
            (metrics, alerts)
        };

        if !alerts.is_empty() {
            let callback = self.alert_callback.lock().clone();
            for message in &alerts {
                log::warn!("{}", message);
                if let Some(callback) = &callback {
                    callback(&metrics, message);
                }
            }
        }

        metrics
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.sample();

            let interval = self.state.lock().config.sampling_interval;
            let mut guard = self.sleep_lock.lock();
            self.wakeup
                .wait_while_for(&mut guard, |_| self.running.load(Ordering::SeqCst), interval);
        }
    }
}

/// Background sampler of process CPU and memory usage
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ResourceMonitor")
            .field("running", &self.is_running())
            .field("config", &state.config)
            .field("history_len", &state.history.len())
            .finish()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ResourceMonitor {
    /// Monitor the current process
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_source(config, Box::new(ProcessMetrics::new()))
    }

    /// Monitor using readings from `source`
    pub fn with_source(config: MonitorConfig, source: Box<dyn MetricsSource>) -> Self {
        let history = VecDeque::with_capacity(config.history_size);
        ResourceMonitor {
            shared: Arc::new(MonitorShared {
                source,
                running: AtomicBool::new(false),
                state: Mutex::new(MonitorState {
                    config,
                    current: ResourceMetrics::default(),
                    history,
                    last_cpu_level: 0.0,
                    last_memory_level: 0.0,
                }),
                alert_callback: Mutex::new(None),
                sleep_lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the sampling thread. No-op when already running.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("pbt-resource-monitor".to_string())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                log::debug!("Resource monitor started");
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                log::warn!("Failed to start resource monitor thread: {}", e);
            }
        }
    }

    /// Stop sampling and join the thread. No-op when not running.
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
        log::debug!("Resource monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Take one sample synchronously, exactly as the background loop would
    pub fn sample_now(&self) -> ResourceMetrics {
        self.shared.sample()
    }

    pub fn get_current_metrics(&self) -> ResourceMetrics {
        self.shared.state.lock().current.clone()
    }

    /// Retained snapshots, oldest first
    pub fn get_history(&self) -> Vec<ResourceMetrics> {
        self.shared.state.lock().history.iter().cloned().collect()
    }

    pub fn get_average_cpu_usage(&self, window: Duration) -> f64 {
        let state = self.shared.state.lock();
        average(state.window(window).map(|m| m.cpu_usage_percent))
    }

    pub fn get_average_memory_usage(&self, window: Duration) -> f64 {
        let state = self.shared.state.lock();
        average(state.window(window).map(|m| m.memory_usage_percent))
    }

    pub fn get_peak_cpu_usage(&self, window: Duration) -> f64 {
        let state = self.shared.state.lock();
        state.window(window).map(|m| m.cpu_usage_percent).fold(0.0, f64::max)
    }

    pub fn get_peak_memory_usage(&self, window: Duration) -> f64 {
        let state = self.shared.state.lock();
        state.window(window).map(|m| m.memory_usage_percent).fold(0.0, f64::max)
    }

    pub fn set_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&ResourceMetrics, &str) + Send + Sync + 'static,
    {
        *self.shared.alert_callback.lock() = Some(Arc::new(callback));
    }

    pub fn set_cpu_threshold(&self, threshold: f64) {
        self.shared.state.lock().config.cpu_alert_threshold = threshold;
    }

    pub fn set_memory_threshold(&self, threshold: f64) {
        self.shared.state.lock().config.memory_alert_threshold = threshold;
    }

    pub fn config(&self) -> MonitorConfig {
        self.shared.state.lock().config.clone()
    }

    /// Projected time until resident memory reaches `limit_bytes`.
    ///
    /// Fits a least-squares line through (elapsed ms, bytes) over the whole history.
    /// Returns `Duration::MAX` when fewer than two samples exist or memory is not
    /// growing, and `Duration::ZERO` when the limit is already exceeded.
    pub fn estimate_time_to_memory_limit(&self, limit_bytes: u64) -> Duration {
        let state = self.shared.state.lock();
        let (first, last) = match (state.history.front(), state.history.back()) {
            (Some(first), Some(last)) if state.history.len() >= 2 => (first, last),
            _ => return Duration::MAX,
        };

        let start = first.timestamp;
        let points: Vec<(f64, f64)> = state
            .history
            .iter()
            .map(|m| {
                let elapsed = m
                    .timestamp
                    .duration_since(start)
                    .unwrap_or(Duration::ZERO)
                    .as_millis() as f64;
                (elapsed, m.memory_usage_bytes as f64)
            })
            .collect();

        let n = points.len() as f64;
        let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
        let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
        let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
        let sum_x2: f64 = points.iter().map(|(x, _)| x * x).sum();

        let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_x2 - sum_x * sum_x);
        if !slope.is_finite() || slope <= 0.0 {
            return Duration::MAX;
        }

        let remaining_ms = (limit_bytes as f64 - last.memory_usage_bytes as f64) / slope;
        if remaining_ms < 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(remaining_ms as u64)
    }

    /// Whether the latest snapshot is above either alert threshold
    pub fn is_resource_constrained(&self) -> bool {
        let state = self.shared.state.lock();
        state.current.cpu_usage_percent > state.config.cpu_alert_threshold
            || state.current.memory_usage_percent > state.config.memory_alert_threshold
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
