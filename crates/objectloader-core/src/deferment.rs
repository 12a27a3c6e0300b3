//! Request deduplication by object id
//!
//! Concurrent requests for the same id share one pending future. The first
//! caller is told it owns the fetch (`is_new`); everyone else just awaits.
//! Entries are held for at most a TTL and the table is capped at `max_size`,
//! evicting the oldest-created entries first. A pending future always settles:
//! eviction, disposal and a dropped resolver reject it, and so does its own
//! deadline timer once the TTL passes.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::{Base, Item};

/// Why a deferred request did not resolve to a base.
///
/// Cloneable because every awaiter of a shared future receives its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeferError {
    /// Deduplication is switched off
    #[error("deferment disabled: '{id}' cannot be deferred")]
    Disabled { id: String },

    /// The entry outlived its TTL without being resolved
    #[error("deferred request for '{id}' expired")]
    Expired { id: String },

    /// The entry was evicted to stay within capacity
    #[error("deferred request for '{id}' evicted")]
    Evicted { id: String },

    /// Whoever owned the fetch went away without answering
    #[error("deferred request for '{id}' cancelled")]
    Cancelled { id: String },

    /// The manager was disposed while the entry was pending
    #[error("deferment disposed while '{id}' was pending")]
    Disposed { id: String },

    /// The fetch for this id failed
    #[error("fetch failed for '{id}': {message}")]
    Fetch { id: String, message: String },
}

impl DeferError {
    /// The id the error refers to
    pub fn id(&self) -> &str {
        match self {
            Self::Disabled { id }
            | Self::Expired { id }
            | Self::Evicted { id }
            | Self::Cancelled { id }
            | Self::Disposed { id }
            | Self::Fetch { id, .. } => id,
        }
    }

    /// Create a Fetch error.
    pub fn fetch(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Result every awaiter of a deferred id receives
pub type DeferredResult = Result<Arc<Base>, DeferError>;

/// Future shared by every caller deferring the same id
pub type DeferredBase = Shared<BoxFuture<'static, DeferredResult>>;

/// What [`Deferment::defer`] hands back.
#[derive(Clone)]
pub struct Deferral {
    /// Resolves once the id is undeferred, or rejects
    pub future: DeferredBase,
    /// The caller created the entry and must see that it gets resolved
    pub is_new: bool,
}

impl Deferral {
    /// A deferral that has already failed
    pub fn rejected(error: DeferError) -> Self {
        Self {
            future: futures::future::ready(Err(error)).boxed().shared(),
            is_new: false,
        }
    }
}

impl std::fmt::Debug for Deferral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferral")
            .field("is_new", &self.is_new)
            .finish_non_exhaustive()
    }
}

/// Deduplicates in-flight requests by id.
pub trait Deferment: Send + Sync {
    /// Join the pending request for `id`, or open one.
    fn defer(&self, id: &str) -> Deferral;

    /// Resolve the pending request for `item.base_id`.
    ///
    /// Returns whether an awaiter was resolved. Unknown ids are a no-op.
    fn undefer(&self, item: &Item) -> bool;

    /// Reject the pending request for `id`. Unknown ids are a no-op.
    fn reject(&self, id: &str, error: DeferError) -> bool;

    /// Reject everything still pending. Safe to call more than once.
    fn dispose(&self);

    /// Whether requests are actually deduplicated
    fn is_enabled(&self) -> bool {
        true
    }

    /// Most entries held at once, if bounded
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Limits for the deferment table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefermentOptions {
    /// Longest an entry may stay pending
    pub ttl: Duration,
    /// Most entries held at once
    pub max_size: usize,
}

impl Default for DefermentOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_size: 100_000,
        }
    }
}

/// Counters for the deferment table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefermentMetrics {
    /// Entries opened
    pub created: u64,
    /// Calls that joined an existing entry
    pub joined: u64,
    /// Entries resolved with a base
    pub resolved: u64,
    /// Entries rejected by `reject`
    pub rejected: u64,
    /// Entries dropped after their TTL
    pub expired: u64,
    /// Entries dropped to stay within `max_size`
    pub evicted: u64,
}

impl DefermentMetrics {
    /// Share of `defer` calls answered by an existing entry (0.0 - 1.0)
    pub fn dedup_rate(&self) -> f64 {
        let total = self.created + self.joined;
        if total == 0 {
            0.0
        } else {
            self.joined as f64 / total as f64
        }
    }
}

struct Entry {
    sender: oneshot::Sender<DeferredResult>,
    future: DeferredBase,
    created_at: Instant,
}

impl Entry {
    fn settle(self, result: DeferredResult) {
        // Receiver is owned by `future`, so this cannot fail
        let _ = self.sender.send(result);
    }
}

struct DefermentState {
    /// Read with `peek` only, so iteration order stays creation order
    entries: LruCache<String, Entry>,
    disposed: bool,
    metrics: DefermentMetrics,
}

/// TTL- and capacity-bounded deferment table.
///
/// Thread-safe: all methods take `&self`. The lock is never held across an
/// await; settling an entry only sends on a oneshot.
pub struct DefermentManager {
    options: DefermentOptions,
    state: Mutex<DefermentState>,
}

impl DefermentManager {
    /// Create a manager; a `max_size` of zero is treated as one
    pub fn new(options: DefermentOptions) -> Self {
        let options = DefermentOptions {
            max_size: options.max_size.max(1),
            ..options
        };
        Self {
            options,
            state: Mutex::new(DefermentState {
                entries: LruCache::unbounded(),
                disposed: false,
                metrics: DefermentMetrics::default(),
            }),
        }
    }

    /// Active limits
    pub fn options(&self) -> DefermentOptions {
        self.options
    }

    /// Number of pending entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Whether `id` has a pending entry
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains(id)
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> DefermentMetrics {
        self.state.lock().metrics.clone()
    }

    /// Reject every entry older than the TTL; returns how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.expire_front(&mut state, now)
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= self.options.ttl
    }

    /// Entries are in creation order, so expired ones are all at the front
    fn expire_front(&self, state: &mut DefermentState, now: Instant) -> usize {
        let mut count = 0;
        while let Some((_, entry)) = state.entries.peek_lru() {
            if !self.is_expired(entry, now) {
                break;
            }
            if let Some((id, entry)) = state.entries.pop_lru() {
                debug!("Deferment: '{}' expired after {:?}", id, self.options.ttl);
                entry.settle(Err(DeferError::Expired { id }));
                state.metrics.expired += 1;
                count += 1;
            }
        }
        count
    }

    /// Pending future that rejects on its own once `deadline` passes, so an
    /// entry nobody answers cannot hang its awaiters
    fn pending_future(
        id: &str,
        deadline: Instant,
    ) -> (oneshot::Sender<DeferredResult>, DeferredBase) {
        let (tx, rx) = oneshot::channel();
        let id = id.to_string();
        let future = async move {
            tokio::select! {
                biased;
                settled = rx => match settled {
                    Ok(result) => result,
                    Err(_) => Err(DeferError::Cancelled { id }),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Deferment: '{}' unanswered after its TTL", id);
                    Err(DeferError::Expired { id })
                }
            }
        }
        .boxed()
        .shared();
        (tx, future)
    }
}

impl Default for DefermentManager {
    fn default() -> Self {
        Self::new(DefermentOptions::default())
    }
}

impl Deferment for DefermentManager {
    fn defer(&self, id: &str) -> Deferral {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.disposed {
            return Deferral::rejected(DeferError::Disposed { id: id.to_string() });
        }

        self.expire_front(&mut state, now);

        if let Some(entry) = state.entries.peek(id) {
            let future = entry.future.clone();
            state.metrics.joined += 1;
            trace!("Deferment: joined pending '{}'", id);
            return Deferral {
                future,
                is_new: false,
            };
        }

        while state.entries.len() >= self.options.max_size {
            let Some((old_id, entry)) = state.entries.pop_lru() else {
                break;
            };
            debug!(
                "Deferment: evicting '{}' (capacity {})",
                old_id, self.options.max_size
            );
            entry.settle(Err(DeferError::Evicted { id: old_id }));
            state.metrics.evicted += 1;
        }

        let (sender, future) = Self::pending_future(id, now + self.options.ttl);
        state.entries.put(
            id.to_string(),
            Entry {
                sender,
                future: future.clone(),
                created_at: now,
            },
        );
        state.metrics.created += 1;
        trace!("Deferment: opened '{}'", id);

        Deferral {
            future,
            is_new: true,
        }
    }

    fn undefer(&self, item: &Item) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(entry) = state.entries.pop(item.base_id.as_str()) else {
            trace!("Deferment: nothing pending for '{}'", item.base_id);
            return false;
        };

        if self.is_expired(&entry, now) {
            debug!("Deferment: '{}' resolved after its TTL", item.base_id);
            entry.settle(Err(DeferError::Expired {
                id: item.base_id.clone(),
            }));
            state.metrics.expired += 1;
            return false;
        }

        entry.settle(Ok(item.base.clone()));
        state.metrics.resolved += 1;
        true
    }

    fn reject(&self, id: &str, error: DeferError) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.pop(id) else {
            return false;
        };
        debug!("Deferment: rejecting '{}': {}", id, error);
        entry.settle(Err(error));
        state.metrics.rejected += 1;
        true
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.options.max_size)
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;

        let pending = state.entries.len();
        while let Some((id, entry)) = state.entries.pop_lru() {
            entry.settle(Err(DeferError::Disposed { id }));
        }
        if pending > 0 {
            debug!("Deferment: disposed with {} pending", pending);
        }
    }
}

/// Deferment that refuses to deduplicate.
///
/// Every `defer` fails with [`DeferError::Disabled`]; the rest is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDeferment;

impl Deferment for DisabledDeferment {
    fn defer(&self, id: &str) -> Deferral {
        Deferral::rejected(DeferError::Disabled { id: id.to_string() })
    }

    fn undefer(&self, _item: &Item) -> bool {
        false
    }

    fn reject(&self, _id: &str, _error: DeferError) -> bool {
        false
    }

    fn dispose(&self) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(id: &str) -> Item {
        Item::new(Base::new(id, "type"))
    }

    fn manager(ttl_ms: u64, max_size: usize) -> DefermentManager {
        DefermentManager::new(DefermentOptions {
            ttl: Duration::from_millis(ttl_ms),
            max_size,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_defer_joins_first() {
        let deferment = manager(1, 1);

        let first = deferment.defer("id");
        let second = deferment.defer("id");
        assert!(first.is_new);
        assert!(!second.is_new);
        assert!(first.future.ptr_eq(&second.future));

        assert!(deferment.undefer(&item("id")));
        let a = first.future.await.unwrap();
        let b = second.future.await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.speckle_type, "type");
        assert!(deferment.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undefer_unknown_id_is_noop() {
        let deferment = manager(1000, 10);
        assert!(!deferment.undefer(&item("ghost")));
        assert!(!deferment.reject("ghost", DeferError::fetch("ghost", "x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_rejects_and_is_replaced() {
        let deferment = manager(10, 10);
        let first = deferment.defer("id");

        tokio::time::advance(Duration::from_millis(20)).await;

        let second = deferment.defer("id");
        assert!(second.is_new);
        assert!(!first.future.ptr_eq(&second.future));
        assert_eq!(
            first.future.await.unwrap_err(),
            DeferError::Expired { id: "id".into() }
        );
        assert_eq!(deferment.metrics().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undefer_after_ttl_rejects() {
        let deferment = manager(10, 10);
        let deferral = deferment.defer("late");

        tokio::time::advance(Duration::from_millis(20)).await;

        assert!(!deferment.undefer(&item("late")));
        assert!(matches!(
            deferral.future.await,
            Err(DeferError::Expired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_future_expires_on_its_own() {
        let deferment = manager(10, 10);
        let early = deferment.defer("early");
        let late = deferment.defer("late");

        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(deferment.undefer(&item("early")));
        assert_eq!(early.future.await.unwrap().id, "early");

        // No further defer or undefer touches the table
        assert_eq!(
            late.future.await.unwrap_err(),
            DeferError::Expired { id: "late".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_expired() {
        let deferment = manager(10, 10);
        let old = deferment.defer("old");
        tokio::time::advance(Duration::from_millis(8)).await;
        let _young = deferment.defer("young");
        tokio::time::advance(Duration::from_millis(5)).await;

        assert_eq!(deferment.sweep(), 1);
        assert!(!deferment.contains("old"));
        assert!(deferment.contains("young"));
        assert!(old.future.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_created() {
        let deferment = manager(60_000, 2);
        let a = deferment.defer("a");
        let _b = deferment.defer("b");
        // Joining does not refresh creation order
        let _a_again = deferment.defer("a");
        let _c = deferment.defer("c");

        assert_eq!(deferment.len(), 2);
        assert!(!deferment.contains("a"));
        assert!(deferment.contains("b"));
        assert!(deferment.contains("c"));
        assert_eq!(
            a.future.await.unwrap_err(),
            DeferError::Evicted { id: "a".into() }
        );
    }

    #[tokio::test]
    async fn test_reject_settles_only_that_id() {
        let deferment = DefermentManager::default();
        let a = deferment.defer("a");
        let b = deferment.defer("b");

        assert!(deferment.reject("a", DeferError::fetch("a", "HTTP 500")));
        assert!(deferment.undefer(&item("b")));

        assert_eq!(
            a.future.await.unwrap_err(),
            DeferError::fetch("a", "HTTP 500")
        );
        assert_eq!(b.future.await.unwrap().id, "b");
        assert_eq!(deferment.metrics().rejected, 1);
        assert_eq!(deferment.metrics().resolved, 1);
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_and_later_defers() {
        let deferment = DefermentManager::default();
        let pending = deferment.defer("p");

        deferment.dispose();
        deferment.dispose();

        assert_eq!(
            pending.future.await.unwrap_err(),
            DeferError::Disposed { id: "p".into() }
        );
        let after = deferment.defer("q");
        assert!(!after.is_new);
        assert!(after.future.await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_deferment_rejects_with_id() {
        let deferment = DisabledDeferment;
        let deferral = deferment.defer("x");
        assert!(!deferral.is_new);

        let err = deferral.future.await.unwrap_err();
        assert_eq!(err.id(), "x");
        assert!(err.to_string().contains("'x'"));

        assert!(!deferment.undefer(&item("x")));
        deferment.dispose();
        assert!(!deferment.is_enabled());
    }

    #[test]
    fn test_dedup_rate() {
        let metrics = DefermentMetrics {
            created: 1,
            joined: 3,
            ..Default::default()
        };
        assert_eq!(metrics.dedup_rate(), 0.75);
        assert_eq!(DefermentMetrics::default().dedup_rate(), 0.0);
    }
}
