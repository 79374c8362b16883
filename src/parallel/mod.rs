//! Parallel execution: worker pool, test runner, distributor and resource governance

pub mod adaptive;
pub mod distributor;
pub mod resource_monitor;
pub mod runner;
pub mod thread_pool;

use std::any::Any;

pub use adaptive::{AdaptiveConfig, AdaptiveResourceManager, PoolState, ThreadPoolInfo};
pub use distributor::{DistributionStrategy, RunnerSelector, TestDistributor};
pub use resource_monitor::{
    AlertCallback, MetricsSource, MonitorConfig, ProcessMetrics, ResourceMetrics, ResourceMonitor,
};
pub use runner::{ParallelTestRunner, RunnerConfig, TestResult, TestTask, TIMEOUT_MESSAGE};
pub use thread_pool::{TaskHandle, ThreadPool};

/// Type alias for execution results
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Errors raised by the pool, runner and distributor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("pool stopped")]
    PoolStopped,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task cancelled before it started")]
    TaskCancelled,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown error".to_string()
    }
}
