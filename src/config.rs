//! Engine configuration.

/// Tunables for an [`crate::Engine`](crate::engine::Engine).
#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on the shared transaction pool. The per-thread cache tier sits
    /// in front of this pool, so the bound only matters under churn.
    pub pool_capacity: usize,
    /// Number of pooled transactions each thread may cache locally.
    pub local_pool_capacity: usize,
    /// Whether the WAL is fsynced on every commit. Turning this off trades
    /// durability of the most recent commits for throughput.
    pub sync_on_commit: bool,
    /// Automatic checkpoint after this many commits. `None` disables
    /// automatic checkpoints; `Engine::checkpoint` still works.
    pub checkpoint_interval_txs: Option<u64>,
    /// Capacity of the node and relationship record caches.
    pub record_cache_capacity: usize,
    /// Maximum number of entries a single schema index may hold. Exceeding
    /// it fails commit validation before anything is appended.
    pub max_index_entries: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_capacity: 8,
            local_pool_capacity: 2,
            sync_on_commit: true,
            checkpoint_interval_txs: None,
            record_cache_capacity: 4096,
            max_index_entries: u64::MAX,
        }
    }
}
