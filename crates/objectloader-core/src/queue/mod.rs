//! Append-only queue contracts
//!
//! Every stage of the loader hands values forward through a [`Queue`]: the
//! downloader pushes fetch outcomes, the cache partitions lookups into found and
//! not-found queues, and so on. A queue is write-only from the caller's point
//! of view; how (or whether) values are read back is up to the implementation.
//!
//! - [`BufferQueue`]: growable buffer with snapshot reads
//! - [`AggregateQueue`]: write-only fan-out to two queues
//! - [`ChannelQueue`]: forwards into an unbounded channel consumed as a stream
//! - [`BatchingQueue`]: hands values to an async processor in batches
//!
//! `add` never blocks and never reorders values relative to earlier `add`
//! calls on the same instance.

mod batching;

pub use batching::{BatchingOptions, BatchingQueue};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Minimal append-only collection.
#[async_trait]
pub trait Queue<T: Send + 'static>: Send + Sync {
    /// Append one value.
    fn add(&self, value: T);

    /// Append values in order.
    fn add_range(&self, values: Vec<T>) {
        for value in values {
            self.add(value);
        }
    }

    /// Release resources held by the queue.
    async fn dispose(&self) {}
}

/// Queue backed by a growable buffer.
///
/// Values are kept in arrival order and can be read back as a snapshot.
pub struct BufferQueue<T> {
    values: Mutex<Vec<T>>,
    disposed: AtomicBool,
    dispose_count: AtomicUsize,
}

impl<T> Default for BufferQueue<T> {
    fn default() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            dispose_count: AtomicUsize::new(0),
        }
    }
}

impl<T> BufferQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered values
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether nothing has been buffered
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Take every buffered value, leaving the queue empty
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.values.lock())
    }

    /// Whether `dispose` has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// How many times `dispose` has been called
    pub fn dispose_count(&self) -> usize {
        self.dispose_count.load(Ordering::Acquire)
    }
}

impl<T: Clone> BufferQueue<T> {
    /// Snapshot of the buffered values in arrival order
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for BufferQueue<T> {
    fn add(&self, value: T) {
        if self.is_disposed() {
            trace!("BufferQueue: dropping value added after dispose");
            return;
        }
        self.values.lock().push(value);
    }

    fn add_range(&self, values: Vec<T>) {
        if self.is_disposed() {
            return;
        }
        self.values.lock().extend(values);
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.dispose_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Write-only fan-out over two queues.
///
/// Every `add` goes to `first` and then to `second`. There is deliberately no
/// way to read values back; this is not a merge.
pub struct AggregateQueue<T: Send + 'static> {
    first: Arc<dyn Queue<T>>,
    second: Arc<dyn Queue<T>>,
    disposed: AtomicBool,
}

impl<T: Send + 'static> AggregateQueue<T> {
    /// Fan out to `first`, then `second`
    pub fn new(first: Arc<dyn Queue<T>>, second: Arc<dyn Queue<T>>) -> Self {
        Self {
            first,
            second,
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Queue<T> for AggregateQueue<T> {
    fn add(&self, value: T) {
        self.first.add(value.clone());
        self.second.add(value);
    }

    fn add_range(&self, values: Vec<T>) {
        self.first.add_range(values.clone());
        self.second.add_range(values);
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.first.dispose().await;
        self.second.dispose().await;
    }
}

/// Queue that forwards into an unbounded channel.
///
/// The paired receiver is the read side. Disposing the queue closes the
/// channel once buffered values have been received.
pub struct ChannelQueue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

impl<T: Send + 'static> ChannelQueue<T> {
    /// Create a queue and the receiver for its values
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Whether the queue still accepts values
    pub fn is_open(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for ChannelQueue<T> {
    fn add(&self, value: T) {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(value).is_err() {
                    trace!("ChannelQueue: receiver dropped");
                }
            }
            None => trace!("ChannelQueue: dropping value added after dispose"),
        }
    }

    async fn dispose(&self) {
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_buffer_queue_keeps_arrival_order() {
        let queue = BufferQueue::new();
        queue.add(1);
        queue.add_range(vec![2, 3]);
        queue.add(4);

        assert_eq!(queue.values(), vec![1, 2, 3, 4]);
        assert_eq!(queue.len(), 4);

        // Snapshot does not drain
        assert_eq!(queue.values(), vec![1, 2, 3, 4]);
        assert_eq!(queue.take(), vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_queue_ignores_adds_after_dispose() {
        let queue = BufferQueue::new();
        queue.add("a");
        queue.dispose().await;
        queue.add("b");

        assert!(queue.is_disposed());
        assert_eq!(queue.values(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_aggregate_queue_fans_out_in_order() {
        let q1 = Arc::new(BufferQueue::new());
        let q2 = Arc::new(BufferQueue::new());
        let aggregate = AggregateQueue::new(q1.clone(), q2.clone());

        aggregate.add("v1");
        aggregate.add_range(vec!["v2", "v3"]);

        assert_eq!(q1.values(), vec!["v1", "v2", "v3"]);
        assert_eq!(q2.values(), vec!["v1", "v2", "v3"]);
    }

    #[tokio::test]
    async fn test_aggregate_queue_disposes_each_child_once() {
        let q1 = Arc::new(BufferQueue::<u8>::new());
        let q2 = Arc::new(BufferQueue::<u8>::new());
        let aggregate = AggregateQueue::new(q1.clone(), q2.clone());

        aggregate.dispose().await;
        aggregate.dispose().await;

        assert_eq!(q1.dispose_count(), 1);
        assert_eq!(q2.dispose_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_queue_streams_until_disposed() {
        let (queue, mut rx) = ChannelQueue::new();
        queue.add(1);
        queue.add(2);
        assert!(queue.is_open());

        queue.dispose().await;
        queue.add(3);
        assert!(!queue.is_open());

        let mut received = Vec::new();
        while let Some(value) = rx.recv().await {
            received.push(value);
        }
        assert_eq!(received, vec![1, 2]);
    }
}
