//! ObjectLoader Core - Streaming loader for content-addressed object graphs
//!
//! This crate provides the loading engine:
//! - Append-only queues that carry values between pipeline stages
//! - Request deduplication with TTL- and capacity-bounded deferment
//! - A pump that turns id sets into lazy, completion-ordered item streams
//! - A lock-free SPSC ring transport for running downloads on a worker thread
//! - In-memory and SQLite caches, batching and in-memory downloaders
//!
//! ## Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use objectloader_core::{Base, LoaderBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let objects = vec![
//!         Base::new("root", "Base").with_closure([("child", 1)]),
//!         Base::new("child", "Base"),
//!     ];
//!     let loader = LoaderBuilder::from_objects("root", objects).build()?;
//!
//!     let mut stream = loader.object_stream().await?;
//!     while let Some(item) = stream.next().await {
//!         println!("{}", item?.base_id);
//!     }
//!     loader.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod deferment;
pub mod downloader;
mod error;
pub mod loader;
pub mod pump;
pub mod queue;
pub mod transport;
mod types;

pub use error::{describe_panic, LoaderError};
pub use types::{Base, FetchOutcome, Item};

// Re-exports for convenience
pub use cache::{Cache, CacheError, CacheMetrics, MemoryCache, NullCache, SqliteCache, SqliteCacheOptions};
pub use deferment::{
    DeferError, Deferment, DefermentManager, DefermentMetrics, DefermentOptions, DisabledDeferment,
};
pub use downloader::{
    BatchDownloader, BatchDownloaderOptions, DownloadPool, Downloader, Fetcher, MemoryDownloader,
};
pub use loader::{ItemStream, LoaderBuilder, LoaderOptions, LogSink, ObjectLoader};
pub use pump::Pump;
pub use queue::{AggregateQueue, BatchingOptions, BatchingQueue, BufferQueue, ChannelQueue, Queue};
pub use transport::{
    OverflowPolicy, TransportError, TransportOptions, WorkerDownloader, WorkerSession,
};
