//! Counterexample Storage
//!
//! Failing inputs found by the runner are kept so later runs can replay them first.
//!
//! # Architecture
//!
//! - `compression`: `CompressionStrategy` trait plus the name-keyed `CompressionRegistry`
//! - `format`: the `PBTC` binary container used for export, import and on-disk persistence
//! - `database`: `CounterexampleDatabase`, the bounded in-memory store with retention rules
//! - `replay`: `CounterexampleReplayer`, which re-checks stored counterexamples
//!
//! # Example Usage
//!
//! ```rust
//! use conjecture_executor::storage::{CounterexampleDatabase, DatabaseConfig};
//!
//! let db = CounterexampleDatabase::new(DatabaseConfig::default());
//! db.store("test_sort", "sorted", "[3, 1, 2]", "out of order", Default::default())?;
//!
//! let latest = db.get_latest("test_sort").unwrap();
//! assert_eq!(db.decompress(&latest).as_deref(), Some("[3, 1, 2]"));
//! # Ok::<(), conjecture_executor::storage::DatabaseError>(())
//! ```

pub mod compression;
pub mod database;
pub mod format;
pub mod replay;

use std::io;

pub use compression::{
    CompressionRegistry, CompressionStrategy, GzipCompression, Lz4Compression, NoCompression,
    ZstdCompression,
};
pub use database::{CounterexampleDatabase, CounterexampleEntry, DatabaseConfig, DatabaseStats};
pub use format::{FORMAT_MAGIC, FORMAT_VERSION};
pub use replay::{CounterexampleReplayer, ReplayOutcome};

/// Type alias for storage operation results
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Errors raised by the counterexample store
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown compression algorithm: {0}")]
    UnknownCompression(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}
