//! In-process caches

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Cache, CacheError, CacheMetrics};
use crate::queue::Queue;
use crate::types::Item;

/// Concurrent in-memory cache.
///
/// Used by tests and by loaders built from a known set of objects.
#[derive(Default)]
pub struct MemoryCache {
    items: DashMap<String, Item>,
    metrics: Mutex<CacheMetrics>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache pre-seeded with `items`
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let cache = Self::new();
        for item in items {
            cache.items.insert(item.base_id.clone(), item);
        }
        cache
    }

    /// Number of cached items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `base_id` is cached
    pub fn contains(&self, base_id: &str) -> bool {
        self.items.contains_key(base_id)
    }

    fn lookup(&self, base_id: &str) -> Option<Item> {
        let item = self.items.get(base_id).map(|entry| entry.value().clone());
        let mut metrics = self.metrics.lock();
        if item.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        item
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_item(&self, base_id: &str) -> Result<Option<Item>, CacheError> {
        Ok(self.lookup(base_id))
    }

    async fn get_items(
        &self,
        base_ids: &[String],
        found: &dyn Queue<Item>,
        not_found: &dyn Queue<String>,
    ) -> Result<(), CacheError> {
        for id in base_ids {
            match self.lookup(id) {
                Some(item) => found.add(item),
                None => not_found.add(id.clone()),
            }
        }
        Ok(())
    }

    fn write(&self, item: Item) {
        self.metrics.lock().writes += 1;
        self.items.entry(item.base_id.clone()).or_insert(item);
    }

    async fn finish(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn dispose(&self) {}

    fn metrics(&self) -> CacheMetrics {
        self.metrics.lock().clone()
    }
}

/// Cache that never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn get_item(&self, _base_id: &str) -> Result<Option<Item>, CacheError> {
        Ok(None)
    }

    async fn get_items(
        &self,
        base_ids: &[String],
        _found: &dyn Queue<Item>,
        not_found: &dyn Queue<String>,
    ) -> Result<(), CacheError> {
        not_found.add_range(base_ids.to_vec());
        Ok(())
    }

    fn write(&self, _item: Item) {}

    async fn finish(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn dispose(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BufferQueue;
    use crate::types::Base;
    use pretty_assertions::assert_eq;

    fn item(id: &str) -> Item {
        Item::new(Base::new(id, "Base"))
    }

    #[tokio::test]
    async fn test_get_items_partitions_in_request_order() {
        let cache = MemoryCache::with_items([item("a"), item("c")]);
        let found = BufferQueue::new();
        let not_found = BufferQueue::new();

        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        cache.get_items(&ids, &found, &not_found).await.unwrap();

        let found_ids: Vec<String> = found.take().into_iter().map(|i| i.base_id).collect();
        assert_eq!(found_ids, vec!["a", "c"]);
        assert_eq!(not_found.values(), vec!["b", "d"]);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 2);
    }

    #[tokio::test]
    async fn test_write_keeps_first_copy() {
        let cache = MemoryCache::new();
        let first = item("a");
        cache.write(first.clone());
        cache.write(item("a").with_size(99));

        let stored = cache.get_item("a").await.unwrap().unwrap();
        assert_eq!(stored.size, None);
        assert_eq!(cache.metrics().writes, 2);
    }

    #[tokio::test]
    async fn test_null_cache_always_misses() {
        let cache = NullCache;
        cache.write(item("a"));
        assert!(cache.get_item("a").await.unwrap().is_none());

        let found = BufferQueue::new();
        let not_found = BufferQueue::new();
        let ids = vec!["a".to_string(), "b".to_string()];
        cache.get_items(&ids, &found, &not_found).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(not_found.values(), ids);
    }
}
