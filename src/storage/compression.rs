//! Pluggable compression for stored counterexample payloads
//!
//! Strategies are looked up by name in a `CompressionRegistry` owned by each
//! database. `decompress` never fails loudly: a read path should not crash a caller
//! iterating stored entries, so any decoding error yields `None`.
//!
//! `ZstdCompression` and `Lz4Compression` are placeholders that run gzip underneath.
//! They report `effective_name() == "gzip"` so stored entries record the algorithm
//! that actually produced their bytes.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{DatabaseError, DatabaseResult};

/// A named, reversible byte transformation
pub trait CompressionStrategy: Send + Sync {
    fn compress(&self, data: &[u8]) -> DatabaseResult<Vec<u8>>;

    /// `None` when `data` is not a valid stream for this strategy
    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>>;

    /// Registry key
    fn name(&self) -> &str;

    /// Typical compressed/original size ratio. A hint only.
    fn expected_ratio(&self) -> f64;

    /// Algorithm that actually produces the bytes
    fn effective_name(&self) -> &str {
        self.name()
    }
}

/// Identity transform
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl CompressionStrategy for NoCompression {
    fn compress(&self, data: &[u8]) -> DatabaseResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn name(&self) -> &str {
        "none"
    }

    fn expected_ratio(&self) -> f64 {
        1.0
    }
}

/// DEFLATE with gzip framing
#[derive(Debug, Clone, Copy)]
pub struct GzipCompression {
    level: u32,
}

impl Default for GzipCompression {
    fn default() -> Self {
        GzipCompression { level: 6 }
    }
}

impl GzipCompression {
    /// `level` is clamped to 1..=9
    pub fn new(level: u32) -> Self {
        GzipCompression {
            level: level.clamp(1, 9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl CompressionStrategy for GzipCompression {
    fn compress(&self, data: &[u8]) -> DatabaseResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| DatabaseError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| DatabaseError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder.read_to_end(&mut out).ok()?;
        Some(out)
    }

    fn name(&self) -> &str {
        "gzip"
    }

    fn expected_ratio(&self) -> f64 {
        0.35
    }
}

/// Stands in for a real codec by running gzip; warns the first time it is used
#[derive(Debug)]
struct GzipStandIn {
    name: &'static str,
    expected_ratio: f64,
    inner: GzipCompression,
    warned: AtomicBool,
}

impl GzipStandIn {
    fn new(name: &'static str, expected_ratio: f64) -> Self {
        GzipStandIn {
            name,
            expected_ratio,
            inner: GzipCompression::default(),
            warned: AtomicBool::new(false),
        }
    }

    fn compress(&self, data: &[u8]) -> DatabaseResult<Vec<u8>> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            log::warn!("'{}' compression is not available; using gzip instead", self.name);
        }
        self.inner.compress(data)
    }
}

/// Placeholder for zstd; produces gzip streams
#[derive(Debug)]
pub struct ZstdCompression(GzipStandIn);

impl Default for ZstdCompression {
    fn default() -> Self {
        ZstdCompression(GzipStandIn::new("zstd", 0.3))
    }
}

impl CompressionStrategy for ZstdCompression {
    fn compress(&self, data: &[u8]) -> DatabaseResult<Vec<u8>> {
        self.0.compress(data)
    }

    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.0.inner.decompress(data)
    }

    fn name(&self) -> &str {
        self.0.name
    }

    fn expected_ratio(&self) -> f64 {
        self.0.expected_ratio
    }

    fn effective_name(&self) -> &str {
        self.0.inner.name()
    }
}

/// Placeholder for lz4; produces gzip streams
#[derive(Debug)]
pub struct Lz4Compression(GzipStandIn);

impl Default for Lz4Compression {
    fn default() -> Self {
        Lz4Compression(GzipStandIn::new("lz4", 0.5))
    }
}

impl CompressionStrategy for Lz4Compression {
    fn compress(&self, data: &[u8]) -> DatabaseResult<Vec<u8>> {
        self.0.compress(data)
    }

    fn decompress(&self, data: &[u8]) -> Option<Vec<u8>> {
        self.0.inner.decompress(data)
    }

    fn name(&self) -> &str {
        self.0.name
    }

    fn expected_ratio(&self) -> f64 {
        self.0.expected_ratio
    }

    fn effective_name(&self) -> &str {
        self.0.inner.name()
    }
}

/// Name-keyed set of strategies
#[derive(Clone)]
pub struct CompressionRegistry {
    strategies: HashMap<String, Arc<dyn CompressionStrategy>>,
}

impl std::fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CompressionRegistry {
    pub fn empty() -> Self {
        CompressionRegistry {
            strategies: HashMap::new(),
        }
    }

    /// `none`, `gzip`, `zstd` and `lz4`
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(NoCompression));
        registry.register(Arc::new(GzipCompression::default()));
        registry.register(Arc::new(ZstdCompression::default()));
        registry.register(Arc::new(Lz4Compression::default()));
        registry
    }

    /// Add or replace the strategy registered under `strategy.name()`
    pub fn register(&mut self, strategy: Arc<dyn CompressionStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CompressionStrategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_shrinks_repetitive_input() {
        let data = "abcabcabc".repeat(200);
        let gzip = GzipCompression::default();
        let compressed = gzip.compress(data.as_bytes()).unwrap();
        assert!(compressed.len() < data.len() / 4);
        assert_eq!(gzip.decompress(&compressed).unwrap(), data.as_bytes());
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let gzip = GzipCompression::default();
        assert_eq!(gzip.decompress(b"definitely not gzip"), None);

        let mut truncated = gzip.compress(b"hello world").unwrap();
        truncated.truncate(truncated.len() - 4);
        assert_eq!(gzip.decompress(&truncated), None);
    }

    #[test]
    fn test_gzip_level_clamped() {
        assert_eq!(GzipCompression::new(0).level(), 1);
        assert_eq!(GzipCompression::new(42).level(), 9);
    }

    #[test]
    fn test_placeholders_report_gzip() {
        let zstd = ZstdCompression::default();
        let lz4 = Lz4Compression::default();
        assert_eq!(zstd.name(), "zstd");
        assert_eq!(zstd.effective_name(), "gzip");
        assert_eq!(lz4.name(), "lz4");
        assert_eq!(lz4.effective_name(), "gzip");

        let compressed = zstd.compress(b"payload").unwrap();
        assert_eq!(GzipCompression::default().decompress(&compressed).unwrap(), b"payload");
    }

    #[test]
    fn test_registry_defaults() {
        let registry = CompressionRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["gzip", "lz4", "none", "zstd"]);
        assert!(registry.get("brotli").is_none());
        assert_eq!(registry.get("none").unwrap().expected_ratio(), 1.0);
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let mut registry = CompressionRegistry::empty();
        registry.register(Arc::new(GzipCompression::new(1)));
        registry.register(Arc::new(GzipCompression::new(9)));
        assert_eq!(registry.names().len(), 1);
    }
}
