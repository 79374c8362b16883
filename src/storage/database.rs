//! Counterexample Database
//!
//! Bounded store of compressed failing inputs, keyed by test and property name.
//!
//! Payloads are compressed before the entry lock is taken, so concurrent `store()`
//! calls from several runners only serialize on the append and the limit checks.
//! With `auto_cleanup` on, every store also:
//! - drops entries older than `retention_period`
//! - keeps only the `max_entries_per_test` most recently stored entries per test
//! - evicts the oldest entries overall until compressed bytes fit `max_database_size_mb`
//!
//! The database lives in memory. When `database_path` is set, `new` loads it and
//! `persist` writes it back using the `PBTC` container.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::compression::{CompressionRegistry, CompressionStrategy};
use super::{format, DatabaseError, DatabaseResult};

/// One stored counterexample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterexampleEntry {
    pub test_name: String,
    pub property_name: String,
    pub compressed_data: Vec<u8>,
    pub error_message: String,
    pub timestamp: SystemTime,
    /// Payload size before compression
    pub original_size: u64,
    pub compressed_size: u64,
    /// Strategy that produced `compressed_data`
    pub compression_algorithm: String,
    /// Free-form annotations; kept in memory only
    pub metadata: BTreeMap<String, String>,
}

impl CounterexampleEntry {
    /// Content hash over every exported field (SHA-256, hex). Metadata is not
    /// included, and the timestamp is taken at millisecond precision, so the value
    /// survives an export/import round trip.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.test_name.as_bytes(),
            self.property_name.as_bytes(),
            self.compressed_data.as_slice(),
            self.error_message.as_bytes(),
            self.compression_algorithm.as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        hasher.update(format::to_millis(self.timestamp).to_le_bytes());
        hasher.update(self.original_size.to_le_bytes());
        hasher.update(self.compressed_size.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// compressed / original; 1.0 for an empty payload
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.original_size as f64
        }
    }
}

/// Aggregate view computed on demand
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_entries: usize,
    pub total_original_size: u64,
    pub total_compressed_size: u64,
    /// total compressed / total original; 1.0 when nothing is stored
    pub average_compression_ratio: f64,
    pub oldest_entry: Option<SystemTime>,
    pub newest_entry: Option<SystemTime>,
    pub entries_by_test: BTreeMap<String, usize>,
    pub entries_by_compression: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Backing file; `None` keeps the database purely in memory
    pub database_path: Option<PathBuf>,
    pub max_database_size_mb: u64,
    pub max_entries_per_test: usize,
    /// Apply retention and size limits on every store
    pub auto_cleanup: bool,
    pub retention_period: Duration,
    /// When off, payloads are stored with the `none` strategy
    pub enable_compression: bool,
    pub default_compression: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            database_path: None,
            max_database_size_mb: 100,
            max_entries_per_test: 10,
            auto_cleanup: true,
            retention_period: Duration::from_secs(30 * 24 * 60 * 60),
            enable_compression: true,
            default_compression: "gzip".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_max_database_size_mb(mut self, mb: u64) -> Self {
        self.max_database_size_mb = mb;
        self
    }

    pub fn with_max_entries_per_test(mut self, max: usize) -> Self {
        self.max_entries_per_test = max;
        self
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    pub fn with_retention_period(mut self, period: Duration) -> Self {
        self.retention_period = period;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn with_default_compression(mut self, name: impl Into<String>) -> Self {
        self.default_compression = name.into();
        self
    }

    fn max_database_size_bytes(&self) -> u64 {
        self.max_database_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Thread-safe store of compressed counterexamples
pub struct CounterexampleDatabase {
    config: DatabaseConfig,
    default_compression: RwLock<String>,
    registry: RwLock<CompressionRegistry>,
    entries: Mutex<Vec<CounterexampleEntry>>,
}

impl std::fmt::Debug for CounterexampleDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterexampleDatabase")
            .field("config", &self.config)
            .field("default_compression", &*self.default_compression.read())
            .field("entries", &self.len())
            .finish()
    }
}

impl Default for CounterexampleDatabase {
    fn default() -> Self {
        Self::new(DatabaseConfig::default())
    }
}

impl CounterexampleDatabase {
    /// Create a database, loading `database_path` when it exists. A file that
    /// cannot be read is logged and the database starts empty.
    pub fn new(config: DatabaseConfig) -> Self {
        let db = CounterexampleDatabase {
            default_compression: RwLock::new(config.default_compression.clone()),
            config,
            registry: RwLock::new(CompressionRegistry::with_defaults()),
            entries: Mutex::new(Vec::new()),
        };

        if let Some(path) = db.config.database_path.clone() {
            if path.exists() {
                match db.import_from_file(&path) {
                    Ok(count) => log::debug!("Loaded {} counterexamples from {}", count, path.display()),
                    Err(e) => log::warn!("Failed to load existing database {}: {}", path.display(), e),
                }
            }
        }

        db
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Compress and store one counterexample, then apply cleanup rules
    pub fn store(
        &self,
        test_name: &str,
        property_name: &str,
        counterexample_data: &str,
        error_message: &str,
        metadata: BTreeMap<String, String>,
    ) -> DatabaseResult<CounterexampleEntry> {
        let strategy = self.storage_strategy()?;
        let compressed = strategy.compress(counterexample_data.as_bytes())?;

        let entry = CounterexampleEntry {
            test_name: test_name.to_string(),
            property_name: property_name.to_string(),
            compressed_size: compressed.len() as u64,
            compressed_data: compressed,
            error_message: error_message.to_string(),
            timestamp: SystemTime::now(),
            original_size: counterexample_data.len() as u64,
            compression_algorithm: strategy.effective_name().to_string(),
            metadata,
        };

        let mut entries = self.entries.lock();
        entries.push(entry.clone());
        if self.config.auto_cleanup {
            self.purge_expired(&mut entries);
            self.enforce_limits(&mut entries);
        }

        Ok(entry)
    }

    /// Serialize `value` as JSON and store it
    pub fn store_typed<T: Serialize>(
        &self,
        test_name: &str,
        property_name: &str,
        value: &T,
        error_message: &str,
        metadata: BTreeMap<String, String>,
    ) -> DatabaseResult<CounterexampleEntry> {
        let json = serde_json::to_string(value)?;
        self.store(test_name, property_name, &json, error_message, metadata)
    }

    fn storage_strategy(&self) -> DatabaseResult<Arc<dyn CompressionStrategy>> {
        let name = if self.config.enable_compression {
            self.default_compression.read().clone()
        } else {
            "none".to_string()
        };
        self.registry
            .read()
            .get(&name)
            .ok_or(DatabaseError::UnknownCompression(name))
    }

    fn purge_expired(&self, entries: &mut Vec<CounterexampleEntry>) {
        let cutoff = SystemTime::now()
            .checked_sub(self.config.retention_period)
            .unwrap_or(UNIX_EPOCH);
        let before = entries.len();
        entries.retain(|entry| entry.timestamp >= cutoff);
        if entries.len() < before {
            log::debug!("Purged {} counterexamples past retention", before - entries.len());
        }
    }

    fn enforce_limits(&self, entries: &mut Vec<CounterexampleEntry>) {
        // Per test: keep the most recently stored entries
        let max_per_test = self.config.max_entries_per_test;
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut keep: Vec<bool> = entries
            .iter()
            .rev()
            .map(|entry| {
                let count = seen.entry(entry.test_name.clone()).or_insert(0);
                *count += 1;
                *count <= max_per_test
            })
            .collect();
        keep.reverse();
        if keep.iter().any(|k| !k) {
            let mut flags = keep.into_iter();
            entries.retain(|_| flags.next().unwrap_or(true));
        }

        // Globally: evict oldest until the compressed total fits
        let max_bytes = self.config.max_database_size_bytes();
        let mut total: u64 = entries.iter().map(|e| e.compressed_size).sum();
        while total > max_bytes {
            let oldest = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(index, _)| index);
            match oldest {
                Some(index) => {
                    let evicted = entries.remove(index);
                    total -= evicted.compressed_size;
                    log::debug!(
                        "Evicted counterexample for '{}' to stay under {} MB",
                        evicted.test_name,
                        self.config.max_database_size_mb
                    );
                }
                None => break,
            }
        }
    }

    pub fn get_by_test(&self, test_name: &str) -> Vec<CounterexampleEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.test_name == test_name)
            .cloned()
            .collect()
    }

    pub fn get_by_property(&self, property_name: &str) -> Vec<CounterexampleEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.property_name == property_name)
            .cloned()
            .collect()
    }

    /// Newest entry for `test_name`; the later-stored one wins on equal timestamps
    pub fn get_latest(&self, test_name: &str) -> Option<CounterexampleEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.test_name == test_name)
            .max_by_key(|entry| entry.timestamp)
            .cloned()
    }

    pub fn get_all(&self) -> Vec<CounterexampleEntry> {
        self.entries.lock().clone()
    }

    /// Original payload, or `None` when the algorithm is unknown or the bytes are corrupt
    pub fn decompress(&self, entry: &CounterexampleEntry) -> Option<String> {
        let strategy = self.registry.read().get(&entry.compression_algorithm)?;
        let bytes = strategy.decompress(&entry.compressed_data)?;
        String::from_utf8(bytes).ok()
    }

    /// Decompress and parse a payload written by `store_typed`
    pub fn decompress_typed<T: DeserializeOwned>(&self, entry: &CounterexampleEntry) -> Option<T> {
        let json = self.decompress(entry)?;
        serde_json::from_str(&json).ok()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn clear_test(&self, test_name: &str) {
        self.entries.lock().retain(|entry| entry.test_name != test_name);
    }

    /// Delete the given entries. Each target removes at most one stored entry equal
    /// to it, so identical duplicates are removed one per target. Returns how many went.
    pub fn remove_entries(&self, targets: &[CounterexampleEntry]) -> usize {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for target in targets {
            if let Some(index) = entries.iter().position(|entry| entry == target) {
                entries.remove(index);
                removed += 1;
            }
        }
        removed
    }

    /// Group entries by test name and release spare capacity
    pub fn vacuum(&self) {
        let mut entries = self.entries.lock();
        entries.sort_by(|a, b| a.test_name.cmp(&b.test_name));
        entries.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn get_stats(&self) -> DatabaseStats {
        let entries = self.entries.lock();
        let mut stats = DatabaseStats {
            total_entries: entries.len(),
            ..DatabaseStats::default()
        };

        for entry in entries.iter() {
            stats.total_original_size += entry.original_size;
            stats.total_compressed_size += entry.compressed_size;
            stats.oldest_entry = Some(stats.oldest_entry.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
            stats.newest_entry = Some(stats.newest_entry.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
            *stats.entries_by_test.entry(entry.test_name.clone()).or_insert(0) += 1;
            *stats
                .entries_by_compression
                .entry(entry.compression_algorithm.clone())
                .or_insert(0) += 1;
        }

        stats.average_compression_ratio = if stats.total_original_size == 0 {
            1.0
        } else {
            stats.total_compressed_size as f64 / stats.total_original_size as f64
        };
        stats
    }

    /// Write every entry to `path` as a `PBTC` container
    pub fn export_to_file(&self, path: impl AsRef<Path>) -> DatabaseResult<()> {
        let path = path.as_ref();
        let bytes = {
            let entries = self.entries.lock();
            format::encode(&entries)?
        };
        atomic_write(path, &bytes)?;
        log::debug!("Exported counterexamples to {}", path.display());
        Ok(())
    }

    /// Append every entry from a `PBTC` container. Nothing is applied unless the
    /// whole file parses. Returns the number of entries added.
    pub fn import_from_file(&self, path: impl AsRef<Path>) -> DatabaseResult<usize> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let imported = format::decode(&data)?;
        let count = imported.len();
        self.entries.lock().extend(imported);
        log::debug!("Imported {} counterexamples from {}", count, path.display());
        Ok(count)
    }

    /// Write the database to `database_path`. No-op for an in-memory database.
    pub fn persist(&self) -> DatabaseResult<()> {
        match &self.config.database_path {
            Some(path) => self.export_to_file(path),
            None => Ok(()),
        }
    }

    /// Add or replace a strategy under its name
    pub fn register_compression(&self, strategy: Arc<dyn CompressionStrategy>) {
        log::debug!("Registered compression strategy '{}'", strategy.name());
        self.registry.write().register(strategy);
    }

    /// Select the strategy used by `store`. Fails for unregistered names.
    pub fn set_default_compression(&self, name: &str) -> DatabaseResult<()> {
        if !self.registry.read().contains(name) {
            return Err(DatabaseError::UnknownCompression(name.to_string()));
        }
        *self.default_compression.write() = name.to_string();
        Ok(())
    }

    pub fn default_compression(&self) -> String {
        self.default_compression.read().clone()
    }

    pub fn compression_names(&self) -> Vec<String> {
        self.registry.read().names()
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write to a uniquely named temporary sibling then rename over `path`.
/// The temporary file is removed if any step fails.
fn atomic_write(path: &Path, data: &[u8]) -> DatabaseResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_sibling(path);
    let written = write_then_rename(&temp_path, path, data);
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

fn write_then_rename(temp_path: &Path, path: &Path, data: &[u8]) -> DatabaseResult<()> {
    {
        let mut file = BufWriter::new(File::create(temp_path)?);
        file.write_all(data)?;
        file.flush()?;
    }
    fs::rename(temp_path, path)?;
    Ok(())
}
