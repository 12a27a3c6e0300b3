//! ObjectLoader Server - HTTP fetcher for Speckle-style object servers
//!
//! Implements [`objectloader_core::Fetcher`] against two endpoints:
//! - `GET {url}/objects/{stream}/{id}/single` for one object
//! - `POST {url}/api/getobjects/{stream}` for a batch, answered with one
//!   `id\t{json}` line per object the server knows
//!
//! Combine it with [`objectloader_core::BatchDownloader`] to get batched,
//! deduplicated loading from a live server.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use objectloader_core::{BatchDownloader, BatchDownloaderOptions, LoaderBuilder};
//! use objectloader_server::{ServerFetcher, ServerOptions};
//!
//! let fetcher = ServerFetcher::new(
//!     ServerOptions::new("https://app.speckle.systems", "3073b96e86").with_token(token),
//! )?;
//! let loader = LoaderBuilder::new()
//!     .root_id(object_id)
//!     .downloader(Arc::new(BatchDownloader::new(fetcher, BatchDownloaderOptions::default())))
//!     .build()?;
//! ```

mod error;
mod fetcher;

pub use error::ServerError;
pub use fetcher::{ServerFetcher, ServerOptions};
