//! Construction-time engine configuration.

/// Selects the sorted-tree builder used by the compactor when rebuilding
/// the id/by-seq trees. See [`crate::tree::builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStrategy {
    /// Hold every item in memory before building the tree. Simple, and
    /// fine for databases that comfortably fit in RAM.
    InMemory,
    /// Spill to a temp file and external-merge-sort before building.
    /// Bounds peak memory at the cost of disk I/O; use for large stores.
    OnDisk,
}

impl Default for SortStrategy {
    fn default() -> Self {
        SortStrategy::InMemory
    }
}

pub const DEFAULT_CHUNK_THRESHOLD: usize = 1279;

/// Tunables fixed for the lifetime of an open [`crate::engine::Gouch`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kv_chunk_threshold: usize,
    pub kp_chunk_threshold: usize,
    pub sort_strategy: SortStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            kv_chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            kp_chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            sort_strategy: SortStrategy::default(),
        }
    }
}
