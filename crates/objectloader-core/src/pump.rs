//! Pump: turns a set of ids into a lazy stream of resolved items
//!
//! The pump owns the results side of a downloader session. Outcomes reported by
//! the downloader are first written back to the cache, then settle the matching
//! deferred futures. [`Pump::gather`] defers each requested id, hands only the
//! ids it is responsible for to the downloader, and yields items in completion
//! order.

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::FutureExt;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::{Cache, CacheWriteQueue};
use crate::deferment::{DeferError, Deferment};
use crate::downloader::{DownloadPool, Downloader};
use crate::error::{describe_join_error, LoaderError};
use crate::queue::{AggregateQueue, ChannelQueue, Queue};
use crate::types::{FetchOutcome, Item};

/// Drives downloads for [`gather`](Self::gather) calls.
///
/// Must be started inside a tokio runtime.
pub struct Pump {
    deferment: Arc<dyn Deferment>,
    downloader: Arc<dyn Downloader>,
    results: Arc<AggregateQueue<FetchOutcome>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Pump {
    /// Initialize `downloader` against a fresh results queue and start
    /// settling its outcomes.
    pub fn start(
        deferment: Arc<dyn Deferment>,
        downloader: Arc<dyn Downloader>,
        cache: Arc<dyn Cache>,
        total: usize,
        max_download_batch_wait: Option<Duration>,
    ) -> Result<Self, LoaderError> {
        let (settle, outcomes) = ChannelQueue::<FetchOutcome>::new();
        // Write-back happens before awaiters are woken
        let results = Arc::new(AggregateQueue::new(
            Arc::new(CacheWriteQueue::new(cache)),
            Arc::new(settle),
        ));

        downloader.initialize(DownloadPool {
            results: results.clone(),
            total,
            max_download_batch_wait,
        })?;
        let drain = tokio::spawn(settle_outcomes(outcomes, deferment.clone()));
        debug!("Pump started (total {})", total);

        Ok(Self {
            deferment,
            downloader,
            results,
            drain: Mutex::new(Some(drain)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Resolve `ids` lazily.
    ///
    /// Nothing happens until the stream is first polled. Duplicate ids are
    /// resolved once. Items arrive in completion order; a failed id yields an
    /// error for that id only. At most the deferment's capacity worth of ids
    /// is in flight at once; the rest are admitted as earlier ones settle.
    pub fn gather(&self, ids: Vec<String>) -> BoxStream<'static, Result<Item, LoaderError>> {
        if self.disposed.load(Ordering::Acquire) {
            return stream::once(async { Err(LoaderError::Disposed("pump")) }).boxed();
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let queued: VecDeque<String> = ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let gather = Gather {
            window: self.deferment.capacity().unwrap_or(usize::MAX).max(1),
            deferment: self.deferment.clone(),
            downloader: self.downloader.clone(),
            results: self.results.clone(),
            queued,
            pending: FuturesUnordered::new(),
        };

        stream::unfold(gather, |mut gather| async move {
            gather.admit();
            let next = gather.pending.next().await?;
            Some((next, gather))
        })
        .boxed()
    }

    /// Close the results queue and wait for buffered outcomes to settle.
    ///
    /// Futures still pending are left to the deferment's own disposal.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.results.dispose().await;
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                warn!("Pump: settle task failed: {}", describe_join_error(e));
            }
        }
        debug!("Pump disposed");
    }
}

/// State of one [`Pump::gather`] stream
struct Gather {
    deferment: Arc<dyn Deferment>,
    downloader: Arc<dyn Downloader>,
    results: Arc<AggregateQueue<FetchOutcome>>,
    queued: VecDeque<String>,
    pending: FuturesUnordered<BoxFuture<'static, Result<Item, LoaderError>>>,
    window: usize,
}

impl Gather {
    /// Defer queued ids until the window is full, then hand the ones this
    /// stream owns to the downloader in a single range
    fn admit(&mut self) {
        let mut to_download = Vec::new();

        while self.pending.len() < self.window {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            let downloader = self.downloader.clone();
            let results = self.results.clone();

            if !self.deferment.is_enabled() {
                self.pending.push(
                    async move { fetch_undeduplicated(downloader.as_ref(), results.as_ref(), id).await }
                        .boxed(),
                );
                continue;
            }

            let deferral = self.deferment.defer(&id);
            if deferral.is_new {
                to_download.push(id.clone());
            }
            self.pending.push(
                async move {
                    match deferral.future.await {
                        Ok(base) => Ok(Item {
                            base_id: id,
                            base,
                            size: None,
                        }),
                        // Pushed out by another gather sharing the table
                        Err(DeferError::Evicted { .. }) => {
                            debug!("Pump: '{}' evicted while pending, fetching directly", id);
                            fetch_undeduplicated(downloader.as_ref(), results.as_ref(), id).await
                        }
                        Err(e) => Err(e.into()),
                    }
                }
                .boxed(),
            );
        }

        if !to_download.is_empty() {
            trace!(
                "Pump: downloading {} ids ({} queued)",
                to_download.len(),
                self.queued.len()
            );
            self.downloader.add_range(to_download);
        }
    }
}

/// Without deduplication every id is fetched on its own; the outcome still
/// goes through the results queue so the cache sees it
async fn fetch_undeduplicated(
    downloader: &dyn Downloader,
    results: &dyn Queue<FetchOutcome>,
    id: String,
) -> Result<Item, LoaderError> {
    let downloaded = downloader.download_single(&id).await;
    if downloader.reports_single_downloads() {
        return downloaded;
    }
    match downloaded {
        Ok(item) => {
            results.add(FetchOutcome::Found(item.clone()));
            Ok(item)
        }
        Err(e) => {
            results.add(FetchOutcome::missing(id, e.to_string()));
            Err(e)
        }
    }
}

async fn settle_outcomes(
    mut outcomes: mpsc::UnboundedReceiver<FetchOutcome>,
    deferment: Arc<dyn Deferment>,
) {
    while let Some(outcome) = outcomes.recv().await {
        match outcome {
            FetchOutcome::Found(item) => {
                deferment.undefer(&item);
            }
            FetchOutcome::Missing { base_id, reason } => {
                let error = DeferError::fetch(base_id.as_str(), reason);
                deferment.reject(&base_id, error);
            }
        }
    }
    trace!("Pump: results queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::deferment::{DefermentManager, DefermentOptions, DisabledDeferment};
    use crate::downloader::MemoryDownloader;
    use crate::types::Base;
    use pretty_assertions::assert_eq;

    fn objects() -> Vec<Base> {
        vec![Base::new("a", "Base"), Base::new("b", "Base"), Base::new("c", "Base")]
    }

    fn start(deferment: Arc<dyn Deferment>) -> (Pump, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let pump = Pump::start(
            deferment,
            Arc::new(MemoryDownloader::new(objects())),
            cache.clone(),
            3,
            None,
        )
        .unwrap();
        (pump, cache)
    }

    async fn collect_ids(stream: BoxStream<'static, Result<Item, LoaderError>>) -> Vec<String> {
        let mut ids: Vec<String> = stream
            .map(|r| match r {
                Ok(item) => item.base_id,
                Err(e) => format!("err:{}", e),
            })
            .collect()
            .await;
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_gather_resolves_and_writes_back() {
        let (pump, cache) = start(Arc::new(DefermentManager::default()));

        let ids = collect_ids(pump.gather(vec!["a".into(), "b".into(), "a".into()])).await;
        assert_eq!(ids, vec!["a", "b"]);
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
        pump.dispose().await;
    }

    #[tokio::test]
    async fn test_gather_is_lazy() {
        let deferment = Arc::new(DefermentManager::default());
        let (pump, _cache) = start(deferment.clone());

        let stream = pump.gather(vec!["a".into()]);
        assert!(deferment.is_empty());
        assert_eq!(collect_ids(stream).await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_missing_id_fails_alone() {
        let (pump, _cache) = start(Arc::new(DefermentManager::default()));

        let results: Vec<Result<Item, LoaderError>> = pump
            .gather(vec!["a".into(), "zzz".into(), "c".into()])
            .collect()
            .await;
        assert_eq!(results.len(), 3);
        let failed: Vec<&LoaderError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].to_string().contains("zzz"));
    }

    #[tokio::test]
    async fn test_without_deduplication_fetches_directly() {
        let (pump, cache) = start(Arc::new(DisabledDeferment));

        let ids = collect_ids(pump.gather(vec!["a".into(), "b".into(), "q".into()])).await;
        assert_eq!(ids.len(), 3);
        assert!(ids[2].starts_with("err:"));
        assert!(cache.contains("a"));
    }

    #[tokio::test]
    async fn test_gather_admits_no_more_than_capacity() {
        let deferment = Arc::new(DefermentManager::new(DefermentOptions {
            ttl: Duration::from_secs(60),
            max_size: 1,
        }));
        let (pump, cache) = start(deferment.clone());

        let ids = collect_ids(pump.gather(vec!["a".into(), "b".into(), "c".into()])).await;
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(deferment.metrics().evicted, 0);
        assert_eq!(cache.len(), 3);
        pump.dispose().await;
    }

    #[tokio::test]
    async fn test_gather_after_dispose_fails() {
        let (pump, _cache) = start(Arc::new(DefermentManager::default()));
        pump.dispose().await;
        pump.dispose().await;

        let results: Vec<_> = pump.gather(vec!["a".into()]).collect().await;
        assert!(matches!(results[0], Err(LoaderError::Disposed(_))));
    }
}
