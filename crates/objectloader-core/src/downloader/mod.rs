//! Downloader backends
//!
//! A downloader accepts object ids through its [`Queue`] side and reports one
//! [`FetchOutcome`] per id into the results queue it was initialized with.
//! [`Downloader::download_single`] bypasses batching for one-off lookups such
//! as the root object.
//!
//! - [`BatchDownloader`]: batches ids in front of any [`Fetcher`]
//! - [`MemoryDownloader`]: answers from a fixed set of objects
//! - [`WorkerDownloader`](crate::transport::WorkerDownloader): forwards to a
//!   downloader running on a background thread

mod batch;
mod memory;

pub use batch::{BatchDownloader, BatchDownloaderOptions};
pub use memory::MemoryDownloader;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::LoaderError;
use crate::queue::Queue;
use crate::types::{FetchOutcome, Item};

/// Where a downloader delivers its results
#[derive(Clone)]
pub struct DownloadPool {
    /// Receives exactly one outcome per requested id
    pub results: Arc<dyn Queue<FetchOutcome>>,
    /// Expected number of objects in the session, 0 when unknown
    pub total: usize,
    /// Overrides the downloader's own batch wait
    pub max_download_batch_wait: Option<Duration>,
}

impl std::fmt::Debug for DownloadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPool")
            .field("total", &self.total)
            .field("max_download_batch_wait", &self.max_download_batch_wait)
            .finish_non_exhaustive()
    }
}

/// Fetches objects on behalf of the loader.
#[async_trait]
pub trait Downloader: Queue<String> {
    /// Attach the results queue. Called once, before the first `add`.
    fn initialize(&self, pool: DownloadPool) -> Result<(), LoaderError>;

    /// Fetch one object directly
    async fn download_single(&self, base_id: &str) -> Result<Item, LoaderError>;

    /// Whether `download_single` outcomes also reach the results queue
    fn reports_single_downloads(&self) -> bool {
        false
    }
}

/// Access to the object origin.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch one object
    async fn fetch_single(&self, base_id: &str) -> Result<Item, LoaderError>;

    /// Fetch many objects.
    ///
    /// Ids the origin does not know are simply absent from the result.
    async fn fetch_batch(&self, base_ids: &[String]) -> Result<Vec<Item>, LoaderError>;
}
