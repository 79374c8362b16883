//! Fixed-size worker pool draining a FIFO task queue
//!
//! Workers block on a condition variable until either work is queued or the pool is
//! stopped. Each submitted closure gets its own `TaskHandle`; a panic inside the
//! closure is captured at the worker boundary and surfaced through that handle, so a
//! failing task never takes a worker down with it.
//!
//! After `shutdown()` queued tasks that have not started are dropped. Their handles
//! resolve to `ExecutionError::TaskCancelled`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{panic_message, ExecutionError, ExecutionResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a task submitted to a `ThreadPool`
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: Receiver<std::thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes
    pub fn wait(self) -> ExecutionResult<T> {
        match self.receiver.recv() {
            Ok(outcome) => outcome.map_err(|payload| ExecutionError::TaskPanicked(panic_message(&*payload))),
            Err(_) => Err(ExecutionError::TaskCancelled),
        }
    }

    /// Block for at most `timeout`. `Ok(None)` means the task is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> ExecutionResult<Option<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(payload)) => Err(ExecutionError::TaskPanicked(panic_message(&*payload))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ExecutionError::TaskCancelled),
        }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Job>,
    stop: bool,
    /// Workers the pool should be running
    target_workers: usize,
    /// Workers currently alive (includes ones about to retire)
    live_workers: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    active: AtomicUsize,
}

/// Bounded pool of OS threads executing queued closures
pub struct ThreadPool {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("size", &self.size())
            .field("active_workers", &self.active_workers())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

impl ThreadPool {
    /// Start a pool with `num_threads` workers (at least one)
    pub fn new(num_threads: usize) -> Self {
        Self::with_name("pbt-pool", num_threads)
    }

    /// Start a pool whose worker threads are named `<name>-<n>`
    pub fn with_name(name: impl Into<String>, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let pool = ThreadPool {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    target_workers: num_threads,
                    ..QueueState::default()
                }),
                available: Condvar::new(),
                active: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            spawned: AtomicUsize::new(0),
        };

        pool.spawn_workers(num_threads);
        log::debug!("Started thread pool '{}' with {} workers", pool.name, num_threads);
        pool
    }

    fn spawn_workers(&self, count: usize) {
        let mut workers = self.workers.lock();
        {
            let mut state = self.shared.state.lock();
            state.live_workers += count;
        }
        for _ in 0..count {
            let index = self.spawned.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(&self.shared);
            let builder = thread::Builder::new().name(format!("{}-{}", self.name, index));
            match builder.spawn(move || worker_loop(shared)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::warn!("Failed to spawn worker for pool '{}': {}", self.name, e);
                    self.shared.state.lock().live_workers -= 1;
                }
            }
        }
        workers.retain(|handle| !handle.is_finished());
    }

    /// Queue `task` for execution
    pub fn enqueue<F, T>(&self, task: F) -> ExecutionResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task));
            // The caller may have dropped its handle; that is not our problem.
            let _ = sender.send(outcome);
        });

        {
            let mut state = self.shared.state.lock();
            if state.stop {
                return Err(ExecutionError::PoolStopped);
            }
            state.tasks.push_back(job);
        }
        self.shared.available.notify_one();

        Ok(TaskHandle { receiver })
    }

    /// Stop accepting work, wake every worker and join them. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.stop && state.live_workers == 0 {
                return;
            }
            state.stop = true;
            std::mem::take(&mut state.tasks)
        };
        self.shared.available.notify_all();

        if !dropped.is_empty() {
            log::debug!(
                "Pool '{}' shutting down with {} queued tasks never started",
                self.name,
                dropped.len()
            );
        }
        drop(dropped);

        let handles = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Resize the pool. Extra workers retire once their current task is done.
    pub fn set_size(&self, num_threads: usize) {
        let num_threads = num_threads.max(1);
        let to_spawn = {
            let mut state = self.shared.state.lock();
            if state.stop {
                return;
            }
            let previous = state.target_workers;
            state.target_workers = num_threads;
            log::debug!("Resizing pool '{}' from {} to {} workers", self.name, previous, num_threads);
            num_threads.saturating_sub(state.live_workers)
        };

        if to_spawn > 0 {
            self.spawn_workers(to_spawn);
        } else {
            self.shared.available.notify_all();
        }
    }

    /// Configured worker count
    pub fn size(&self) -> usize {
        self.shared.state.lock().target_workers
    }

    /// Tasks currently executing
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Tasks queued but not yet started
    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stop
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            shared.available.wait_while(&mut state, |s| {
                !s.stop && s.tasks.is_empty() && s.live_workers <= s.target_workers
            });

            if state.stop || state.live_workers > state.target_workers {
                state.live_workers -= 1;
                return;
            }

            match state.tasks.pop_front() {
                Some(job) => {
                    shared.active.fetch_add(1, Ordering::SeqCst);
                    job
                }
                None => continue,
            }
        };

        // Panics are already captured into the task's handle.
        job();
        shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn test_enqueue_returns_value() {
        let pool = ThreadPool::new(2);
        let handle = pool.enqueue(|| 21 * 2).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let pool = ThreadPool::new(1);
        pool.shutdown();
        let err = pool.enqueue(|| ()).unwrap_err();
        assert!(matches!(err, ExecutionError::PoolStopped));
        assert_eq!(err.to_string(), "pool stopped");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let pool = ThreadPool::new(3);
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_stopped());
    }

    #[test]
    fn test_panic_is_captured_in_handle() {
        let pool = ThreadPool::new(1);
        let handle = pool.enqueue(|| -> u32 { panic!("kaboom") }).unwrap();
        match handle.wait() {
            Err(ExecutionError::TaskPanicked(message)) => assert_eq!(message, "kaboom"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The single worker survived the panic.
        assert_eq!(pool.enqueue(|| 5).unwrap().wait().unwrap(), 5);
    }

    #[test]
    fn test_pending_tasks_are_cancelled_on_shutdown() {
        let pool = ThreadPool::new(1);
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        let running = pool
            .enqueue(move || {
                while !gate.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();

        while pool.active_workers() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let queued = pool.enqueue(|| 1).unwrap();
        assert_eq!(pool.queue_size(), 1);

        let releaser = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                release.store(true, Ordering::SeqCst);
            })
        };
        pool.shutdown();
        releaser.join().unwrap();

        assert!(running.wait().is_ok());
        assert!(matches!(queued.wait(), Err(ExecutionError::TaskCancelled)));
    }

    #[test]
    fn test_wait_timeout_reports_running_task() {
        let pool = ThreadPool::new(1);
        let handle = pool
            .enqueue(|| {
                thread::sleep(Duration::from_millis(100));
                7
            })
            .unwrap();
        assert_eq!(handle.wait_timeout(Duration::from_millis(5)).unwrap(), None);
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)).unwrap(), Some(7));
    }

    #[test]
    fn test_bounded_concurrency_wall_time() {
        let pool = ThreadPool::new(2);
        let start = Instant::now();
        let handles: Vec<_> = (0..5)
            .map(|_| pool.enqueue(|| thread::sleep(Duration::from_millis(50))).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        let elapsed = start.elapsed();

        // ceil(5 / 2) rounds of 50ms each
        assert!(elapsed >= Duration::from_millis(150), "finished too fast: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "finished too slow: {:?}", elapsed);
    }

    #[test]
    fn test_active_workers_never_exceeds_size() {
        let pool = Arc::new(ThreadPool::new(3));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..30)
            .map(|_| {
                let observed = Arc::clone(&pool);
                let peak = Arc::clone(&peak);
                pool.enqueue(move || {
                    peak.fetch_max(observed.active_workers(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                })
                .unwrap()
            })
            .collect();

        for _ in 0..50 {
            assert!(pool.active_workers() <= 3);
            thread::sleep(Duration::from_millis(1));
        }
        for handle in handles {
            handle.wait().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        pool.shutdown();
    }

    #[test]
    fn test_set_size_grows_pool() {
        let pool = ThreadPool::new(1);
        pool.set_size(3);
        assert_eq!(pool.size(), 3);

        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| pool.enqueue(|| thread::sleep(Duration::from_millis(60))).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(170));
    }

    #[test]
    fn test_set_size_shrinks_pool() {
        let pool = ThreadPool::new(4);
        pool.set_size(1);
        assert_eq!(pool.size(), 1);

        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| pool.enqueue(|| thread::sleep(Duration::from_millis(30))).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
