//! Downloader over a fixed set of objects

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{trace, warn};

use super::{DownloadPool, Downloader};
use crate::error::LoaderError;
use crate::queue::Queue;
use crate::types::{Base, FetchOutcome, Item};

/// Serves objects from memory.
///
/// Handy for tests and for loaders over data that is already at hand.
pub struct MemoryDownloader {
    objects: HashMap<String, Arc<Base>>,
    results: OnceLock<Arc<dyn Queue<FetchOutcome>>>,
}

impl MemoryDownloader {
    pub fn new(objects: impl IntoIterator<Item = Base>) -> Self {
        Self {
            objects: objects
                .into_iter()
                .map(|base| (base.id.clone(), Arc::new(base)))
                .collect(),
            results: OnceLock::new(),
        }
    }

    /// Number of objects served
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn lookup(&self, base_id: &str) -> Option<Item> {
        self.objects
            .get(base_id)
            .map(|base| Item::from_shared(base.clone()))
    }
}

#[async_trait]
impl Queue<String> for MemoryDownloader {
    fn add(&self, base_id: String) {
        let Some(results) = self.results.get() else {
            warn!("MemoryDownloader: '{}' requested before initialize", base_id);
            return;
        };
        let outcome = match self.lookup(&base_id) {
            Some(item) => FetchOutcome::Found(item),
            None => FetchOutcome::missing(base_id, "not in object set"),
        };
        trace!("MemoryDownloader: answered '{}'", outcome.base_id());
        results.add(outcome);
    }
}

#[async_trait]
impl Downloader for MemoryDownloader {
    fn initialize(&self, pool: DownloadPool) -> Result<(), LoaderError> {
        self.results
            .set(pool.results)
            .map_err(|_| LoaderError::config("downloader already initialized"))
    }

    async fn download_single(&self, base_id: &str) -> Result<Item, LoaderError> {
        self.lookup(base_id)
            .ok_or_else(|| LoaderError::not_found(base_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BufferQueue;

    #[tokio::test]
    async fn test_answers_from_object_set() {
        let downloader = MemoryDownloader::new([Base::new("a", "Base")]);
        let results = Arc::new(BufferQueue::new());
        downloader
            .initialize(DownloadPool {
                results: results.clone(),
                total: 1,
                max_download_batch_wait: None,
            })
            .unwrap();

        downloader.add("a".into());
        downloader.add("b".into());

        let outcomes = results.values();
        assert!(matches!(&outcomes[0], FetchOutcome::Found(item) if item.base_id == "a"));
        assert!(matches!(&outcomes[1], FetchOutcome::Missing { base_id, .. } if base_id == "b"));

        assert!(downloader.download_single("a").await.is_ok());
        assert!(matches!(
            downloader.download_single("b").await,
            Err(LoaderError::NotFound { .. })
        ));
    }
}
