//! Spreads tasks across several `ParallelTestRunner`s and runs them side by side

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use super::runner::{ParallelTestRunner, RunnerConfig, TestResult, TestTask};
use super::{ExecutionError, ExecutionResult};
use crate::property::{Property, TestExecutionConfig};

/// Picks a runner index for a task. Out-of-range indices wrap around.
pub type RunnerSelector = Arc<dyn Fn(&TestTask, &[Arc<ParallelTestRunner>]) -> usize + Send + Sync>;

/// How `TestDistributor` assigns tasks to runners
#[derive(Clone, Default)]
pub enum DistributionStrategy {
    /// Cycle through runners in order
    #[default]
    RoundRobin,
    /// Runner with the fewest pending tasks; the first one wins ties
    LoadBalanced,
    /// Caller-supplied selector, falling back to round robin when absent
    AffinityBased(Option<RunnerSelector>),
}

impl std::fmt::Debug for DistributionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionStrategy::RoundRobin => write!(f, "RoundRobin"),
            DistributionStrategy::LoadBalanced => write!(f, "LoadBalanced"),
            DistributionStrategy::AffinityBased(selector) => f
                .debug_tuple("AffinityBased")
                .field(&selector.as_ref().map(|_| "<selector>"))
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct TestDistributor {
    runners: Vec<Arc<ParallelTestRunner>>,
    strategy: DistributionStrategy,
    next_runner: AtomicUsize,
}

impl TestDistributor {
    /// Build `num_runners` runners sharing `config`
    pub fn new(num_runners: usize, config: RunnerConfig, strategy: DistributionStrategy) -> ExecutionResult<Self> {
        let runners = (0..num_runners)
            .map(|_| Arc::new(ParallelTestRunner::new(config.clone())))
            .collect();
        Self::from_runners(runners, strategy)
    }

    /// Distribute over existing runners. Fails when `runners` is empty.
    pub fn from_runners(
        runners: Vec<Arc<ParallelTestRunner>>,
        strategy: DistributionStrategy,
    ) -> ExecutionResult<Self> {
        if runners.is_empty() {
            return Err(ExecutionError::InvalidArgument(
                "Number of runners must be greater than 0".to_string(),
            ));
        }
        log::debug!("Distributing over {} runners with {:?}", runners.len(), strategy);
        Ok(TestDistributor {
            runners,
            strategy,
            next_runner: AtomicUsize::new(0),
        })
    }

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
        let index = self.select_runner(&task);
        self.runners[index].add_task(task);
    }

    fn select_runner(&self, task: &TestTask) -> usize {
        match &self.strategy {
            DistributionStrategy::RoundRobin => self.round_robin(),
            DistributionStrategy::LoadBalanced => self.least_loaded(),
            DistributionStrategy::AffinityBased(Some(selector)) => selector(task, &self.runners) % self.runners.len(),
            DistributionStrategy::AffinityBased(None) => self.round_robin(),
        }
    }

    fn round_robin(&self) -> usize {
        self.next_runner.fetch_add(1, Ordering::Relaxed) % self.runners.len()
    }

    fn least_loaded(&self) -> usize {
        let mut best = 0;
        let mut best_load = usize::MAX;
        for (index, runner) in self.runners.iter().enumerate() {
            let load = runner.get_pending_tests();
            if load < best_load {
                best = index;
                best_load = load;
            }
        }
        best
    }

    /// Run every runner concurrently; one result list per runner, in runner order
    pub fn run_all(&self) -> Vec<Vec<TestResult>> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .runners
                .iter()
                .map(|runner| scope.spawn(move || runner.run_all()))
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        log::warn!("Runner {} panicked while collecting results", index);
                        Vec::new()
                    })
                })
                .collect()
        })
    }

    pub fn stop(&self) {
        for runner in &self.runners {
            runner.stop();
        }
    }

    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }

    pub fn runners(&self) -> &[Arc<ParallelTestRunner>] {
        &self.runners
    }

    pub fn strategy(&self) -> &DistributionStrategy {
        &self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> RunnerConfig {
        RunnerConfig::default()
            .with_num_threads(2)
            .with_adaptive_scheduling(false)
    }

    #[test]
    fn test_zero_runners_rejected() {
        let err = TestDistributor::new(0, quiet(), DistributionStrategy::RoundRobin).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidArgument(_)));
    }

    #[test]
    fn test_round_robin_cycles() {
        let distributor = TestDistributor::new(3, quiet(), DistributionStrategy::RoundRobin).unwrap();
        for i in 0..7 {
            distributor.add_task(TestTask::new(format!("t{}", i), || Ok(())));
        }
        let pending: Vec<_> = distributor.runners().iter().map(|r| r.get_pending_tests()).collect();
        assert_eq!(pending, vec![3, 2, 2]);
    }

    #[test]
    fn test_load_balanced_prefers_first_minimum() {
        let distributor = TestDistributor::new(3, quiet(), DistributionStrategy::LoadBalanced).unwrap();
        distributor.runners()[0].add_task(TestTask::new("preloaded", || Ok(())));

        distributor.add_task(TestTask::new("a", || Ok(())));
        distributor.add_task(TestTask::new("b", || Ok(())));
        let pending: Vec<_> = distributor.runners().iter().map(|r| r.get_pending_tests()).collect();
        assert_eq!(pending, vec![1, 1, 1]);
    }

    #[test]
    fn test_affinity_selector_routes_by_name() {
        let selector: RunnerSelector = Arc::new(|task, runners| {
            if task.name.starts_with("slow") {
                runners.len() - 1
            } else {
                0
            }
        });
        let distributor =
            TestDistributor::new(2, quiet(), DistributionStrategy::AffinityBased(Some(selector))).unwrap();
        distributor.add_task(TestTask::new("slow_1", || Ok(())));
        distributor.add_task(TestTask::new("slow_2", || Ok(())));
        distributor.add_task(TestTask::new("fast_1", || Ok(())));

        assert_eq!(distributor.runners()[0].get_pending_tests(), 1);
        assert_eq!(distributor.runners()[1].get_pending_tests(), 2);
    }

    #[test]
    fn test_affinity_without_selector_is_round_robin() {
        let distributor = TestDistributor::new(2, quiet(), DistributionStrategy::AffinityBased(None)).unwrap();
        for i in 0..4 {
            distributor.add_task(TestTask::new(format!("t{}", i), || Ok(())));
        }
        assert!(distributor.runners().iter().all(|r| r.get_pending_tests() == 2));
    }

    #[test]
    fn test_run_all_returns_one_list_per_runner() {
        let distributor = TestDistributor::new(3, quiet(), DistributionStrategy::RoundRobin).unwrap();
        for i in 0..4 {
            distributor.add_task(TestTask::new(format!("t{}", i), || Ok(())));
        }
        let results = distributor.run_all();
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1, 1]);
        distributor.stop();
    }
}
