//! Cache backends
//!
//! A cache answers single and batch lookups by object id and accepts
//! write-backs of freshly downloaded items. Objects are immutable, so an entry
//! never needs invalidating.
//!
//! - [`MemoryCache`]: concurrent in-process map
//! - [`NullCache`]: always misses
//! - [`SqliteCache`]: persistent, with batched writes

mod memory;
mod sqlite;

pub use memory::{MemoryCache, NullCache};
pub use sqlite::{SqliteCache, SqliteCacheOptions};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::queue::Queue;
use crate::types::{FetchOutcome, Item};

/// Errors that can occur in a cache backend
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Background(String),

    #[error("cache already disposed")]
    Disposed,
}

/// Hit/miss counters shared by the cache backends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups the cache could not answer
    pub misses: u64,
    /// Items accepted for write-back
    pub writes: u64,
}

impl CacheMetrics {
    /// Get hit rate as a fraction (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Storage consulted before the origin.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Look up one object
    async fn get_item(&self, base_id: &str) -> Result<Option<Item>, CacheError>;

    /// Look up many objects, partitioning the ids into `found` and `not_found`.
    ///
    /// Every id lands in exactly one of the two queues.
    async fn get_items(
        &self,
        base_ids: &[String],
        found: &dyn Queue<Item>,
        not_found: &dyn Queue<String>,
    ) -> Result<(), CacheError>;

    /// Store an item. May be buffered until [`finish`](Self::finish).
    fn write(&self, item: Item);

    /// Flush buffered writes
    async fn finish(&self) -> Result<(), CacheError>;

    /// Flush and release the backend. Safe to call more than once.
    async fn dispose(&self);

    /// Snapshot of the counters
    fn metrics(&self) -> CacheMetrics {
        CacheMetrics::default()
    }
}

/// Queue adapter that writes every found outcome back to a cache
pub struct CacheWriteQueue {
    cache: Arc<dyn Cache>,
}

impl CacheWriteQueue {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Queue<FetchOutcome> for CacheWriteQueue {
    fn add(&self, outcome: FetchOutcome) {
        if let FetchOutcome::Found(item) = outcome {
            self.cache.write(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Base;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics {
            hits: 3,
            misses: 1,
            writes: 0,
        };
        assert_eq!(metrics.hit_rate(), 0.75);
        assert_eq!(CacheMetrics::default().hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_write_queue_only_stores_found() {
        let cache = Arc::new(MemoryCache::new());
        let queue = CacheWriteQueue::new(cache.clone());

        queue.add(FetchOutcome::Found(Item::new(Base::new("a", "Base"))));
        queue.add(FetchOutcome::missing("b", "gone"));

        assert!(cache.get_item("a").await.unwrap().is_some());
        assert!(cache.get_item("b").await.unwrap().is_none());
        assert_eq!(cache.len(), 1);
    }
}
