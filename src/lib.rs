//! # Conjecture Executor
//!
//! Parallel execution engine and counterexample store for property-based tests.
//!
//! Property checks are queued on a `ParallelTestRunner`, admitted onto a bounded
//! worker pool under CPU and memory budgets, and reported as `TestResult`s. Minimal
//! failing inputs go into a `CounterexampleDatabase` so later runs can replay them.

pub mod parallel;
pub mod property;
pub mod storage;

// Re-export core types for easy access
pub use parallel::{
    AdaptiveConfig, AdaptiveResourceManager, DistributionStrategy, ExecutionError, ExecutionResult,
    MetricsSource, MonitorConfig, ParallelTestRunner, PoolState, ProcessMetrics, ResourceMetrics,
    ResourceMonitor, RunnerConfig, RunnerSelector, TaskHandle, TestDistributor, TestResult, TestTask,
    ThreadPool, ThreadPoolInfo, TIMEOUT_MESSAGE,
};
pub use property::{Arbitrary, ForAll, Property, PropertyBase, PropertyFailure, TestExecutionConfig};
pub use storage::{
    CompressionRegistry, CompressionStrategy, CounterexampleDatabase, CounterexampleEntry,
    CounterexampleReplayer, DatabaseConfig, DatabaseError, DatabaseResult, DatabaseStats,
    GzipCompression, Lz4Compression, NoCompression, ReplayOutcome, ZstdCompression,
};
