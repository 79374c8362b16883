//! Re-checks stored counterexamples against the current code

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::database::{CounterexampleDatabase, CounterexampleEntry};
use crate::property::PropertyBase;

/// Result of replaying one stored counterexample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The property still rejects the stored value
    StillFailing,
    /// The property now accepts it
    Fixed,
    /// The payload could not be decompressed or parsed
    Undecodable,
}

impl ReplayOutcome {
    pub fn is_failing(self) -> bool {
        self == ReplayOutcome::StillFailing
    }
}

#[derive(Debug, Clone)]
pub struct CounterexampleReplayer {
    database: Arc<CounterexampleDatabase>,
}

impl CounterexampleReplayer {
    pub fn new(database: Arc<CounterexampleDatabase>) -> Self {
        CounterexampleReplayer { database }
    }

    /// Decode `entry` (written by `store_typed`) and run it through `property`.
    /// A panicking check counts as still failing.
    pub fn replay<T: DeserializeOwned>(
        &self,
        entry: &CounterexampleEntry,
        property: &dyn PropertyBase<T>,
    ) -> ReplayOutcome {
        let value: T = match self.database.decompress_typed(entry) {
            Some(value) => value,
            None => return ReplayOutcome::Undecodable,
        };

        match catch_unwind(AssertUnwindSafe(|| property.check(&value))) {
            Ok(Ok(())) => ReplayOutcome::Fixed,
            Ok(Err(_)) | Err(_) => ReplayOutcome::StillFailing,
        }
    }

    /// Entries for `test_name` that still fail
    pub fn replay_all<T: DeserializeOwned>(
        &self,
        test_name: &str,
        property: &dyn PropertyBase<T>,
    ) -> Vec<CounterexampleEntry> {
        let entries = self.database.get_by_test(test_name);
        let total = entries.len();
        let still_failing: Vec<_> = entries
            .into_iter()
            .filter(|entry| self.replay(entry, property).is_failing())
            .collect();
        log::debug!(
            "Replayed {} counterexamples for '{}': {} still failing",
            total,
            test_name,
            still_failing.len()
        );
        still_failing
    }

    /// Remove the given entries of `test_name`; other entries of the test are kept
    pub fn remove_fixed(&self, test_name: &str, fixed: &[CounterexampleEntry]) -> usize {
        let targets: Vec<CounterexampleEntry> = fixed
            .iter()
            .filter(|entry| entry.test_name == test_name)
            .cloned()
            .collect();
        self.database.remove_entries(&targets)
    }
}
