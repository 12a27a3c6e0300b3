//! Batching downloader over a [`Fetcher`]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use super::{DownloadPool, Downloader, Fetcher};
use crate::error::LoaderError;
use crate::queue::{BatchingOptions, BatchingQueue, Queue};
use crate::types::{FetchOutcome, Item};

/// Batch limits for [`BatchDownloader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDownloaderOptions {
    /// Most ids sent to the origin in one request
    pub batch_max_size: usize,
    /// Longest an id waits for its batch to fill
    pub batch_max_wait: Duration,
}

impl Default for BatchDownloaderOptions {
    fn default() -> Self {
        Self {
            batch_max_size: 5000,
            batch_max_wait: Duration::from_millis(200),
        }
    }
}

/// Downloader that groups ids into batch requests.
///
/// Every id produces exactly one outcome: a batch that fails as a whole turns
/// into one not-found notice per id, and ids the origin leaves out of its
/// answer are reported as not found.
pub struct BatchDownloader<F: Fetcher> {
    fetcher: Arc<F>,
    options: BatchDownloaderOptions,
    batches: OnceLock<BatchingQueue<String>>,
}

impl<F: Fetcher> BatchDownloader<F> {
    pub fn new(fetcher: F, options: BatchDownloaderOptions) -> Self {
        Self::from_shared(Arc::new(fetcher), options)
    }

    /// Create a downloader over an already shared fetcher
    pub fn from_shared(fetcher: Arc<F>, options: BatchDownloaderOptions) -> Self {
        Self {
            fetcher,
            options,
            batches: OnceLock::new(),
        }
    }

    pub fn options(&self) -> BatchDownloaderOptions {
        self.options
    }

    /// The wrapped fetcher
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

#[async_trait]
impl<F: Fetcher> Queue<String> for BatchDownloader<F> {
    fn add(&self, base_id: String) {
        match self.batches.get() {
            Some(batches) => batches.add(base_id),
            None => warn!("BatchDownloader: '{}' requested before initialize", base_id),
        }
    }

    fn add_range(&self, base_ids: Vec<String>) {
        match self.batches.get() {
            Some(batches) => batches.add_range(base_ids),
            None => warn!(
                "BatchDownloader: {} ids requested before initialize",
                base_ids.len()
            ),
        }
    }

    /// Discards ids still waiting for a batch
    async fn dispose(&self) {
        if let Some(batches) = self.batches.get() {
            batches.abort();
            batches.dispose().await;
        }
    }
}

#[async_trait]
impl<F: Fetcher> Downloader for BatchDownloader<F> {
    fn initialize(&self, pool: DownloadPool) -> Result<(), LoaderError> {
        let options = BatchingOptions {
            batch_max_size: self.options.batch_max_size,
            batch_max_wait: pool
                .max_download_batch_wait
                .unwrap_or(self.options.batch_max_wait),
        };
        let fetcher = self.fetcher.clone();
        let results = pool.results;

        let batches = BatchingQueue::new("BatchDownloader", options, move |ids: Vec<String>| {
            let fetcher = fetcher.clone();
            let results = results.clone();
            async move { deliver_batch(fetcher.as_ref(), ids, results.as_ref()).await }
        });

        self.batches
            .set(batches)
            .map_err(|_| LoaderError::config("downloader already initialized"))?;
        debug!(
            "BatchDownloader: initialized (total {}, batch size {}, wait {:?})",
            pool.total, options.batch_max_size, options.batch_max_wait
        );
        Ok(())
    }

    async fn download_single(&self, base_id: &str) -> Result<Item, LoaderError> {
        self.fetcher.fetch_single(base_id).await
    }
}

async fn deliver_batch<F: Fetcher>(
    fetcher: &F,
    ids: Vec<String>,
    results: &dyn Queue<FetchOutcome>,
) {
    match fetcher.fetch_batch(&ids).await {
        Ok(items) => {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let mut returned = HashSet::with_capacity(items.len());
            for item in items {
                if !wanted.contains(item.base_id.as_str()) {
                    debug!("BatchDownloader: ignoring unrequested '{}'", item.base_id);
                    continue;
                }
                if returned.insert(item.base_id.clone()) {
                    results.add(FetchOutcome::Found(item));
                }
            }
            for id in &ids {
                if !returned.contains(id) {
                    results.add(FetchOutcome::missing(id.as_str(), "not returned by origin"));
                }
            }
        }
        Err(e) => {
            warn!("BatchDownloader: batch of {} failed: {}", ids.len(), e);
            let reason = e.to_string();
            for id in ids {
                results.add(FetchOutcome::missing(id, reason.clone()));
            }
        }
    }
}
