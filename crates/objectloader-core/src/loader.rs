//! Object loader orchestrator
//!
//! [`ObjectLoader`] is the entry point: it answers single-object requests and
//! streams whole closures, consulting the cache first and sending misses
//! through deferment and the pump. It also owns teardown, which always runs in
//! the same order: deferment, pump, downloader, cache, worker session.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cache::{Cache, MemoryCache};
use crate::deferment::{DeferError, Deferment, DefermentManager, DefermentOptions, DisabledDeferment};
use crate::downloader::{Downloader, MemoryDownloader};
use crate::error::LoaderError;
use crate::pump::Pump;
use crate::queue::BufferQueue;
use crate::transport::{TransportOptions, WorkerSession};
use crate::types::{Base, Item};

/// Receives the loader's log lines
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Stream of resolved objects
pub type ItemStream = BoxStream<'static, Result<Item, LoaderError>>;

/// Loader-wide options
#[derive(Clone, Default)]
pub struct LoaderOptions {
    /// Extra destination for log lines, alongside `tracing`
    pub logger: Option<LogSink>,
    /// Limits for the default deferment manager
    pub deferment: DefermentOptions,
    /// Overrides the downloader's batch wait
    pub max_download_batch_wait: Option<Duration>,
}

impl std::fmt::Debug for LoaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("logger", &self.logger.is_some())
            .field("deferment", &self.deferment)
            .field("max_download_batch_wait", &self.max_download_batch_wait)
            .finish()
    }
}

/// Streaming loader for one object graph.
pub struct ObjectLoader {
    root_id: Option<String>,
    cache: Arc<dyn Cache>,
    downloader: Arc<dyn Downloader>,
    deferment: Arc<dyn Deferment>,
    pump: OnceCell<Arc<Pump>>,
    root: OnceCell<Arc<Base>>,
    session: Mutex<Option<WorkerSession>>,
    logger: Option<LogSink>,
    max_download_batch_wait: Option<Duration>,
    disposed: AtomicBool,
}

impl ObjectLoader {
    /// Start building a loader
    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    /// The root object id, if one was given
    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether downloads run on a worker thread
    pub fn uses_worker(&self) -> bool {
        self.session.lock().is_some()
    }

    /// The cache this loader reads through
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    fn log(&self, message: String) {
        debug!("{}", message);
        if let Some(logger) = &self.logger {
            logger(&message);
        }
    }

    fn check_open(&self) -> Result<(), LoaderError> {
        if self.is_disposed() {
            return Err(LoaderError::Disposed("object loader"));
        }
        Ok(())
    }

    /// Fetch one object: cache first, then a deduplicated direct download
    pub async fn get_object(&self, base_id: &str) -> Result<Arc<Base>, LoaderError> {
        self.check_open()?;
        if let Some(item) = self.cache.get_item(base_id).await? {
            return Ok(item.base);
        }

        if !self.deferment.is_enabled() {
            let item = self.downloader.download_single(base_id).await?;
            self.cache.write(item.clone());
            return Ok(item.base);
        }

        let deferral = self.deferment.defer(base_id);
        if !deferral.is_new {
            return Ok(deferral.future.await?);
        }

        // Settle the entry even if this future is dropped mid-download
        let mut guard = RejectOnDrop::new(self.deferment.clone(), base_id);
        let downloaded = self.downloader.download_single(base_id).await;
        guard.disarm();

        match downloaded {
            Ok(item) => {
                self.cache.write(item.clone());
                self.deferment.undefer(&item);
                Ok(item.base)
            }
            Err(e) => {
                self.deferment
                    .reject(base_id, DeferError::fetch(base_id, e.to_string()));
                Err(e)
            }
        }
    }

    /// The root object, fetched once and kept
    pub async fn get_root_object(&self) -> Result<Arc<Base>, LoaderError> {
        let root_id = self.root_id.as_deref().ok_or(LoaderError::NoRoot)?;
        self.root
            .get_or_try_init(|| self.get_object(root_id))
            .await
            .cloned()
    }

    /// Objects in the root's closure plus the root itself
    pub async fn get_total_object_count(&self) -> Result<usize, LoaderError> {
        let root = self.get_root_object().await?;
        Ok(root.closure_len() + 1)
    }

    async fn pump(&self) -> Result<Arc<Pump>, LoaderError> {
        self.pump
            .get_or_try_init(|| async {
                let total = self.root.get().map_or(0, |root| root.closure_len() + 1);
                Pump::start(
                    self.deferment.clone(),
                    self.downloader.clone(),
                    self.cache.clone(),
                    total,
                    self.max_download_batch_wait,
                )
                .map(Arc::new)
            })
            .await
            .cloned()
    }

    /// Resolve many objects.
    ///
    /// Cache hits come first, then downloaded objects in completion order.
    /// Each id fails on its own; the stream only ends once every id has been
    /// answered.
    pub async fn request_all(&self, ids: Vec<String>) -> Result<ItemStream, LoaderError> {
        self.check_open()?;
        let found = BufferQueue::new();
        let not_found = BufferQueue::new();
        self.cache.get_items(&ids, &found, &not_found).await?;

        let hits = found.take();
        let misses = not_found.take();
        self.log(format!(
            "Requested {} objects: {} cached, {} to download",
            ids.len(),
            hits.len(),
            misses.len()
        ));

        let hits = stream::iter(hits.into_iter().map(Ok));
        if misses.is_empty() {
            return Ok(hits.boxed());
        }
        let pump = self.pump().await?;
        Ok(hits.chain(pump.gather(misses)).boxed())
    }

    /// Resolve one object through the batched path
    pub async fn request_item(&self, base_id: &str) -> Result<Item, LoaderError> {
        let mut items = self.request_all(vec![base_id.to_string()]).await?;
        match items.next().await {
            Some(result) => result,
            None => Err(LoaderError::not_found(base_id)),
        }
    }

    /// Stream `root_id` followed by every object in its closure
    pub async fn request_closure(&self, root_id: &str) -> Result<ItemStream, LoaderError> {
        let root = self.get_object(root_id).await?;
        self.closure_stream(root).await
    }

    /// Stream the root object followed by its closure
    pub async fn object_stream(&self) -> Result<ItemStream, LoaderError> {
        let root = self.get_root_object().await?;
        self.closure_stream(root).await
    }

    async fn closure_stream(&self, root: Arc<Base>) -> Result<ItemStream, LoaderError> {
        let children = root.closure_ids();
        self.log(format!(
            "Streaming '{}' with {} descendants",
            root.id,
            children.len()
        ));
        let rest = self.request_all(children).await?;
        let root = Item::from_shared(root);
        Ok(stream::once(async move { Ok(root) }).chain(rest).boxed())
    }

    /// Tear everything down. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.deferment.dispose();
        if let Some(pump) = self.pump.get() {
            pump.dispose().await;
        }
        self.downloader.dispose().await;
        if let Err(e) = self.cache.finish().await {
            warn!("Failed to flush cache on dispose: {}", e);
        }
        self.cache.dispose().await;

        let session = self.session.lock().take();
        if let Some(session) = session {
            session.dispose().await;
        }
        self.log("Object loader disposed".to_string());
    }
}

impl Drop for ObjectLoader {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            // Worker session and batching tasks shut themselves down on drop
            self.deferment.dispose();
            debug!("Object loader dropped without dispose");
        }
    }
}

/// Rejects a deferred id as cancelled unless disarmed
struct RejectOnDrop {
    deferment: Arc<dyn Deferment>,
    id: String,
    armed: bool,
}

impl RejectOnDrop {
    fn new(deferment: Arc<dyn Deferment>, id: &str) -> Self {
        Self {
            deferment,
            id: id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RejectOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.deferment.reject(
                &self.id,
                DeferError::Cancelled {
                    id: self.id.clone(),
                },
            );
        }
    }
}

/// Builder for [`ObjectLoader`]
#[derive(Default)]
pub struct LoaderBuilder {
    root_id: Option<String>,
    cache: Option<Arc<dyn Cache>>,
    downloader: Option<Arc<dyn Downloader>>,
    deferment: Option<Arc<dyn Deferment>>,
    options: LoaderOptions,
    transport: Option<TransportOptions>,
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader over a fixed set of objects, served from memory
    pub fn from_objects(root_id: impl Into<String>, objects: impl IntoIterator<Item = Base>) -> Self {
        Self::new()
            .root_id(root_id)
            .downloader(Arc::new(MemoryDownloader::new(objects)))
    }

    pub fn root_id(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }

    /// Cache to read through (default: in-memory)
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Deferment to use (default: a [`DefermentManager`] from the options)
    pub fn deferment(mut self, deferment: Arc<dyn Deferment>) -> Self {
        self.deferment = Some(deferment);
        self
    }

    /// Fetch every request independently
    pub fn disable_deferment(self) -> Self {
        self.deferment(Arc::new(DisabledDeferment))
    }

    pub fn options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn logger(mut self, logger: LogSink) -> Self {
        self.options.logger = Some(logger);
        self
    }

    /// Run the downloader on a worker thread behind the ring transport
    pub fn worker_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the loader.
    ///
    /// With a worker transport this must run inside a tokio runtime.
    pub fn build(self) -> Result<ObjectLoader, LoaderError> {
        let downloader = self
            .downloader
            .ok_or_else(|| LoaderError::config("a downloader is required"))?;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()) as Arc<dyn Cache>);
        let deferment = self.deferment.unwrap_or_else(|| {
            Arc::new(DefermentManager::new(self.options.deferment)) as Arc<dyn Deferment>
        });

        let (downloader, session) = match self.transport {
            Some(transport) => {
                let (session, worker) = WorkerSession::spawn(downloader, transport)?;
                (Arc::new(worker) as Arc<dyn Downloader>, Some(session))
            }
            None => (downloader, None),
        };

        info!(
            "Object loader ready (root {:?}, deferment {}, {})",
            self.root_id,
            if deferment.is_enabled() { "on" } else { "off" },
            if session.is_some() { "worker thread" } else { "in-thread" }
        );

        Ok(ObjectLoader {
            root_id: self.root_id,
            cache,
            downloader,
            deferment,
            pump: OnceCell::new(),
            root: OnceCell::new(),
            session: Mutex::new(session),
            logger: self.options.logger,
            max_download_batch_wait: self.options.max_download_batch_wait,
            disposed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph() -> Vec<Base> {
        vec![
            Base::new("root", "Base").with_closure([("c1", 1), ("c2", 1), ("g1", 2)]),
            Base::new("c1", "Base"),
            Base::new("c2", "Base"),
            Base::new("g1", "Base"),
        ]
    }

    #[tokio::test]
    async fn test_root_and_total_count() {
        let loader = LoaderBuilder::from_objects("root", graph()).build().unwrap();
        let root = loader.get_root_object().await.unwrap();
        assert_eq!(root.id, "root");
        assert_eq!(loader.get_total_object_count().await.unwrap(), 4);
        loader.dispose().await;
    }

    #[tokio::test]
    async fn test_object_stream_starts_with_root() {
        let loader = LoaderBuilder::from_objects("root", graph()).build().unwrap();
        let ids: Vec<String> = loader
            .object_stream()
            .await
            .unwrap()
            .map(|r| r.unwrap().base_id)
            .collect()
            .await;

        assert_eq!(ids[0], "root");
        let mut rest = ids[1..].to_vec();
        rest.sort();
        assert_eq!(rest, vec!["c1", "c2", "g1"]);
        loader.dispose().await;
    }

    #[tokio::test]
    async fn test_get_object_writes_back_to_cache() {
        let cache = Arc::new(MemoryCache::new());
        let loader = LoaderBuilder::from_objects("root", graph())
            .cache(cache.clone())
            .build()
            .unwrap();

        loader.get_object("c1").await.unwrap();
        assert!(cache.contains("c1"));
        assert!(matches!(
            loader.get_object("nope").await,
            Err(LoaderError::NotFound { .. })
        ));
        loader.dispose().await;
    }

    #[tokio::test]
    async fn test_logger_receives_lines() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = lines.clone();
        let loader = LoaderBuilder::from_objects("root", graph())
            .logger(Arc::new(move |line: &str| sink.lock().push(line.to_string())))
            .build()
            .unwrap();

        let _ = loader.request_item("c2").await.unwrap();
        loader.dispose().await;

        let lines = lines.lock();
        assert!(lines.iter().any(|l| l.contains("to download")));
        assert!(lines.iter().any(|l| l.contains("disposed")));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_closes_loader() {
        let loader = LoaderBuilder::from_objects("root", graph()).build().unwrap();
        loader.dispose().await;
        loader.dispose().await;
        assert!(loader.is_disposed());
        assert!(matches!(
            loader.get_object("root").await,
            Err(LoaderError::Disposed(_))
        ));
    }

    #[test]
    fn test_build_requires_downloader() {
        assert!(matches!(
            LoaderBuilder::new().build(),
            Err(LoaderError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_no_root_id() {
        let loader = LoaderBuilder::new()
            .downloader(Arc::new(MemoryDownloader::new(graph())))
            .build()
            .unwrap();
        assert!(matches!(
            loader.get_root_object().await,
            Err(LoaderError::NoRoot)
        ));
        assert_eq!(loader.request_item("g1").await.unwrap().base_id, "g1");
    }
}
