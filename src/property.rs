//! Property contract consumed by the parallel runner
//!
//! Generators and shrinkers live outside this crate. They reach the engine through
//! two small traits:
//! - `Arbitrary<T>`: draws values from a seeded RNG and proposes shrink candidates
//! - `PropertyBase<T>`: the predicate under test
//!
//! `ForAll` binds the two together into an object-safe `Property`, which is what
//! `ParallelTestRunner::add_property` schedules. The check loop here only counts
//! shrink attempts and keeps the smallest failing value it has seen; the shape of
//! the candidates is entirely up to the `Arbitrary` implementation.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Number of generated cases per property when not configured
pub const DEFAULT_MAX_TEST_COUNT: usize = 100;

/// Shrink attempt budget when not configured
pub const DEFAULT_MAX_SHRINKS: usize = 500;

/// Per-property timeout when not configured
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Per-property execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecutionConfig {
    /// Number of generated values to check
    pub max_test_count: usize,

    /// Maximum number of shrink candidates evaluated after a failure
    pub max_shrinks: usize,

    /// Wall-clock budget for the whole property check
    pub timeout_ms: u64,

    /// RNG seed; 0 draws a fresh seed from entropy
    pub seed: u64,
}

impl Default for TestExecutionConfig {
    fn default() -> Self {
        Self {
            max_test_count: DEFAULT_MAX_TEST_COUNT,
            max_shrinks: DEFAULT_MAX_SHRINKS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            seed: 0,
        }
    }
}

impl TestExecutionConfig {
    pub fn with_max_test_count(mut self, count: usize) -> Self {
        self.max_test_count = count;
        self
    }

    pub fn with_max_shrinks(mut self, shrinks: usize) -> Self {
        self.max_shrinks = shrinks;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Why a property check did not pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyFailure {
    /// The predicate rejected a generated value
    Falsified {
        message: String,
        counterexample: Option<String>,
        shrink_attempts: usize,
    },
    /// The check could not run to completion for a reason unrelated to the predicate
    Error(String),
}

impl PropertyFailure {
    pub fn falsified(message: impl Into<String>, counterexample: Option<String>) -> Self {
        PropertyFailure::Falsified {
            message: message.into(),
            counterexample,
            shrink_attempts: 0,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PropertyFailure::Falsified { message, .. } => message,
            PropertyFailure::Error(message) => message,
        }
    }

    pub fn counterexample(&self) -> Option<&str> {
        match self {
            PropertyFailure::Falsified { counterexample, .. } => counterexample.as_deref(),
            PropertyFailure::Error(_) => None,
        }
    }

    pub fn shrink_attempts(&self) -> usize {
        match self {
            PropertyFailure::Falsified { shrink_attempts, .. } => *shrink_attempts,
            PropertyFailure::Error(_) => 0,
        }
    }
}

impl std::fmt::Display for PropertyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyFailure::Falsified { message, counterexample: Some(value), .. } => {
                write!(f, "{}\nCounterexample: {}", message, value)
            }
            PropertyFailure::Falsified { message, .. } => write!(f, "{}", message),
            PropertyFailure::Error(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for PropertyFailure {}

/// Value source for a property: generation plus shrink candidates
pub trait Arbitrary<T>: Send + Sync {
    /// Draw one value
    fn generate(&self, rng: &mut ChaCha8Rng) -> T;

    /// Simpler variants of `value`, simplest first. Empty when fully shrunk.
    fn shrink(&self, _value: &T) -> Vec<T> {
        Vec::new()
    }
}

/// Predicate over generated values
pub trait PropertyBase<T>: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` carries the violation message
    fn check(&self, value: &T) -> Result<(), String>;
}

/// Object-safe property handle scheduled by the runner
pub trait Property: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, config: &TestExecutionConfig) -> Result<(), PropertyFailure>;
}

/// Universally quantified property: `property` must hold for every value `arbitrary` draws
pub struct ForAll<T> {
    arbitrary: Arc<dyn Arbitrary<T>>,
    property: Arc<dyn PropertyBase<T>>,
}

impl<T> ForAll<T> {
    pub fn new(arbitrary: Arc<dyn Arbitrary<T>>, property: Arc<dyn PropertyBase<T>>) -> Self {
        ForAll { arbitrary, property }
    }

    /// Greedy descent over shrink candidates, returning the smallest failing value,
    /// its message and the number of candidates evaluated.
    fn shrink_failure(&self, mut value: T, mut message: String, max_shrinks: usize) -> (T, String, usize) {
        let mut attempts = 0;

        'outer: while attempts < max_shrinks {
            for candidate in self.arbitrary.shrink(&value) {
                if attempts >= max_shrinks {
                    break 'outer;
                }
                attempts += 1;
                if let Err(candidate_message) = self.property.check(&candidate) {
                    value = candidate;
                    message = candidate_message;
                    continue 'outer;
                }
            }
            break;
        }

        (value, message, attempts)
    }
}

impl<T: Debug> Property for ForAll<T> {
    fn name(&self) -> &str {
        self.property.name()
    }

    fn run(&self, config: &TestExecutionConfig) -> Result<(), PropertyFailure> {
        let mut rng = if config.seed == 0 {
            ChaCha8Rng::from_entropy()
        } else {
            ChaCha8Rng::seed_from_u64(config.seed)
        };

        for case in 0..config.max_test_count {
            let value = self.arbitrary.generate(&mut rng);
            if let Err(message) = self.property.check(&value) {
                log::debug!(
                    "Property '{}' falsified on case {}, shrinking",
                    self.property.name(),
                    case
                );
                let (minimal, message, shrink_attempts) =
                    self.shrink_failure(value, message, config.max_shrinks);
                return Err(PropertyFailure::Falsified {
                    message: format!("Property '{}' failed: {}", self.property.name(), message),
                    counterexample: Some(format!("{:?}", minimal)),
                    shrink_attempts,
                });
            }
        }

        Ok(())
    }
}
