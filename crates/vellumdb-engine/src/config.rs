//! Engine configuration.

use std::path::PathBuf;

/// Configuration for a persistence engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the partition data files.
    pub dir: PathBuf,
    /// Number of logical partitions this engine serves. Fixes the size of
    /// the file revision map; not resizable at runtime.
    pub max_partitions: u16,
    /// Prefix applied to every exported stat key, e.g. `rw_0`.
    pub stat_prefix: String,
    /// Compress document bodies on disk when it saves space.
    pub compress_doc_bodies: bool,
    /// How many times a failed file open is retried with a refreshed
    /// revision before the operation gives up.
    pub open_retry_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            max_partitions: 1024,
            stat_prefix: "rw_0".to_string(),
            compress_doc_bodies: true,
            open_retry_limit: 1,
        }
    }
}

impl EngineConfig {
    /// Convenience constructor used throughout the tests.
    pub fn new(dir: impl Into<PathBuf>, max_partitions: u16) -> Self {
        Self {
            dir: dir.into(),
            max_partitions,
            ..Self::default()
        }
    }
}
