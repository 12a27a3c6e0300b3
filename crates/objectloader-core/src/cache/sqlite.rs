//! SQLite-backed persistent cache
//!
//! One table keyed by object id holding the object's JSON text. Reads run on
//! the blocking pool; writes are collected by a [`BatchingQueue`] and committed
//! one transaction per batch.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{Cache, CacheError, CacheMetrics};
use crate::error::describe_join_error;
use crate::queue::{BatchingOptions, BatchingQueue, Queue};
use crate::types::Item;

/// SQLite's default bound-parameter limit is 999
const LOOKUP_CHUNK: usize = 500;

const SCHEMA_CREATE_OBJECTS: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    id TEXT PRIMARY KEY NOT NULL,
    json TEXT NOT NULL,
    size INTEGER
)
"#;

/// Options for [`SqliteCache`]
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteCacheOptions {
    /// Database file; `None` keeps the cache in memory
    pub path: Option<PathBuf>,
    /// When false every lookup misses and writes are dropped
    pub enable_caching: bool,
    /// Most items committed per transaction
    pub batch_max_size: usize,
    /// Longest a write waits before its batch is committed
    pub batch_max_wait: Duration,
}

impl Default for SqliteCacheOptions {
    fn default() -> Self {
        Self {
            path: None,
            enable_caching: true,
            batch_max_size: 1000,
            batch_max_wait: Duration::from_millis(1000),
        }
    }
}

impl SqliteCacheOptions {
    /// Options for a database file at `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Persistent object cache.
///
/// Must be opened inside a tokio runtime.
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
    writes: BatchingQueue<Item>,
    enable_caching: bool,
    path: Option<PathBuf>,
    metrics: Arc<Mutex<CacheMetrics>>,
    disposed: AtomicBool,
}

impl SqliteCache {
    /// Open (or create) the cache
    pub fn open(options: SqliteCacheOptions) -> Result<Self, CacheError> {
        let conn = match &options.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(path)?;
                Self::configure_connection(&conn)?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA_CREATE_OBJECTS)?;

        let conn = Arc::new(Mutex::new(conn));
        let writer = conn.clone();
        let writes = BatchingQueue::new(
            "SqliteCache",
            BatchingOptions {
                batch_max_size: options.batch_max_size,
                batch_max_wait: options.batch_max_wait,
            },
            move |batch: Vec<Item>| {
                let conn = writer.clone();
                async move { commit_batch(conn, batch).await }
            },
        );

        debug!(
            "SqliteCache: opened {}",
            options
                .path
                .as_deref()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string())
        );

        Ok(Self {
            conn,
            writes,
            enable_caching: options.enable_caching,
            path: options.path,
            metrics: Arc::new(Mutex::new(CacheMetrics::default())),
            disposed: AtomicBool::new(false),
        })
    }

    /// Open an in-memory cache
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::open(SqliteCacheOptions::default())
    }

    /// Database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether lookups and writes are active
    pub fn is_enabled(&self) -> bool {
        self.enable_caching
    }

    /// Number of stored objects (committed writes only)
    pub async fn count(&self) -> Result<usize, CacheError> {
        let conn = self.conn.clone();
        let count = tokio::task::spawn_blocking(move || -> Result<i64, CacheError> {
            let conn = conn.lock();
            Ok(conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?)
        })
        .await
        .map_err(|e| CacheError::Background(describe_join_error(e)))??;
        Ok(count as usize)
    }

    fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Negative value is KB
        conn.pragma_update(None, "cache_size", -64000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    fn check_open(&self) -> Result<(), CacheError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get_item(&self, base_id: &str) -> Result<Option<Item>, CacheError> {
        self.check_open()?;
        if !self.enable_caching {
            self.metrics.lock().misses += 1;
            return Ok(None);
        }

        let conn = self.conn.clone();
        let id = base_id.to_string();
        let json = tokio::task::spawn_blocking(move || -> Result<Option<String>, CacheError> {
            let conn = conn.lock();
            Ok(conn
                .query_row(
                    "SELECT json FROM objects WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
        .map_err(|e| CacheError::Background(describe_join_error(e)))??;

        let item = match json {
            Some(json) => Some(Item::from_json(&json)?),
            None => None,
        };
        let mut metrics = self.metrics.lock();
        if item.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        Ok(item)
    }

    async fn get_items(
        &self,
        base_ids: &[String],
        found: &dyn Queue<Item>,
        not_found: &dyn Queue<String>,
    ) -> Result<(), CacheError> {
        self.check_open()?;
        if !self.enable_caching {
            self.metrics.lock().misses += base_ids.len() as u64;
            not_found.add_range(base_ids.to_vec());
            return Ok(());
        }

        for chunk in base_ids.chunks(LOOKUP_CHUNK) {
            let conn = self.conn.clone();
            let ids = chunk.to_vec();
            let mut rows = tokio::task::spawn_blocking(move || lookup_many(&conn, &ids))
                .await
                .map_err(|e| CacheError::Background(describe_join_error(e)))??;

            let mut hits = 0u64;
            for id in chunk {
                let decoded = rows.remove(id).map(|json| Item::from_json(&json));
                match decoded {
                    Some(Ok(item)) => {
                        hits += 1;
                        found.add(item);
                    }
                    Some(Err(e)) => {
                        warn!("SqliteCache: unreadable entry for '{}': {}", id, e);
                        not_found.add(id.clone());
                    }
                    None => not_found.add(id.clone()),
                }
            }

            let mut metrics = self.metrics.lock();
            metrics.hits += hits;
            metrics.misses += chunk.len() as u64 - hits;
        }
        Ok(())
    }

    fn write(&self, item: Item) {
        if !self.enable_caching || self.disposed.load(Ordering::Acquire) {
            return;
        }
        self.metrics.lock().writes += 1;
        self.writes.add(item);
    }

    async fn finish(&self) -> Result<(), CacheError> {
        self.writes.flush().await;
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writes.dispose().await;
        debug!("SqliteCache: disposed");
    }

    fn metrics(&self) -> CacheMetrics {
        self.metrics.lock().clone()
    }
}

fn lookup_many(
    conn: &Mutex<Connection>,
    ids: &[String],
) -> Result<HashMap<String, String>, CacheError> {
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT id, json FROM objects WHERE id IN ({placeholders})");

    let conn = conn.lock();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = HashMap::with_capacity(ids.len());
    for row in rows {
        let (id, json) = row?;
        out.insert(id, json);
    }
    Ok(out)
}

fn insert_batch(conn: &Mutex<Connection>, batch: &[Item]) -> Result<usize, CacheError> {
    let conn = conn.lock();
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO objects (id, json, size) VALUES (?1, ?2, ?3)",
        )?;
        for item in batch {
            let json = item.to_json()?;
            stmt.execute(params![item.base_id, json, item.size.map(|s| s as i64)])?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

async fn commit_batch(conn: Arc<Mutex<Connection>>, batch: Vec<Item>) {
    match tokio::task::spawn_blocking(move || insert_batch(&conn, &batch)).await {
        Ok(Ok(count)) => trace!("SqliteCache: committed {} objects", count),
        Ok(Err(e)) => warn!("SqliteCache: batch write failed: {}", e),
        Err(e) => warn!(
            "SqliteCache: batch write task failed: {}",
            describe_join_error(e)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BufferQueue;
    use crate::types::Base;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str) -> Item {
        Item::new(Base::new(id, "Base").with_property("name", json!(id)))
    }

    #[tokio::test]
    async fn test_write_then_read_after_finish() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.write(item("a"));
        cache.finish().await.unwrap();

        let stored = cache.get_item("a").await.unwrap().unwrap();
        assert_eq!(stored.base_id, "a");
        assert_eq!(stored.base.properties["name"], json!("a"));
        assert!(stored.size.is_some());
        assert!(cache.get_item("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_items_partitions() {
        let cache = SqliteCache::in_memory().unwrap();
        cache.write(item("a"));
        cache.write(item("c"));
        cache.finish().await.unwrap();

        let found = BufferQueue::new();
        let not_found = BufferQueue::new();
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        cache.get_items(&ids, &found, &not_found).await.unwrap();

        let found_ids: Vec<String> = found.take().into_iter().map(|i| i.base_id).collect();
        assert_eq!(found_ids, vec!["a", "c"]);
        assert_eq!(not_found.values(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("objects.db");

        let cache = SqliteCache::open(SqliteCacheOptions::at(&path)).unwrap();
        cache.write(item("a"));
        cache.write(item("b"));
        cache.dispose().await;
        assert!(matches!(
            cache.get_item("a").await,
            Err(CacheError::Disposed)
        ));
        drop(cache);

        let reopened = SqliteCache::open(SqliteCacheOptions::at(&path)).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        assert_eq!(reopened.count().await.unwrap(), 2);
        assert!(reopened.get_item("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_cache_misses_and_drops_writes() {
        let cache = SqliteCache::open(SqliteCacheOptions {
            enable_caching: false,
            ..Default::default()
        })
        .unwrap();
        cache.write(item("a"));
        cache.finish().await.unwrap();

        assert!(!cache.is_enabled());
        assert!(cache.get_item("a").await.unwrap().is_none());
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_large_lookups() {
        let cache = SqliteCache::open(SqliteCacheOptions {
            batch_max_size: 100,
            ..Default::default()
        })
        .unwrap();
        let ids: Vec<String> = (0..1200).map(|i| format!("id{i}")).collect();
        for id in ids.iter().step_by(2) {
            cache.write(item(id));
        }
        cache.finish().await.unwrap();

        let found = BufferQueue::new();
        let not_found = BufferQueue::new();
        cache.get_items(&ids, &found, &not_found).await.unwrap();
        assert_eq!(found.len(), 600);
        assert_eq!(not_found.len(), 600);
        assert_eq!(cache.metrics().hits, 600);
    }
}
