//! Size- and time-bounded batching in front of an async processor.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::Queue;
use crate::error::describe_join_error;

/// Limits for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingOptions {
    /// Largest batch handed to the processor
    pub batch_max_size: usize,
    /// How long a partial batch may wait before it is flushed
    pub batch_max_wait: Duration,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            batch_max_size: 1000,
            batch_max_wait: Duration::from_millis(100),
        }
    }
}

type Processor<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

enum Command<T> {
    Value(T),
    Flush(oneshot::Sender<()>),
}

/// Queue that hands its values to an async processor in batches.
///
/// A batch is flushed when it reaches `batch_max_size`, when the oldest value
/// in it has waited `batch_max_wait`, on [`flush`](Self::flush), and on
/// dispose. Batches are processed one at a time in arrival order.
///
/// Must be created inside a tokio runtime.
pub struct BatchingQueue<T: Send + 'static> {
    name: &'static str,
    sender: Mutex<Option<mpsc::UnboundedSender<Command<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchingQueue<T> {
    /// Start the batching task.
    ///
    /// `name` only appears in log output.
    pub fn new<F, Fut>(name: &'static str, options: BatchingOptions, processor: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let processor: Processor<T> = Arc::new(move |batch| processor(batch).boxed());
        let options = BatchingOptions {
            batch_max_size: options.batch_max_size.max(1),
            ..options
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_batches(name, rx, options, processor));

        Self {
            name,
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Process everything added so far and wait for it to finish.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let guard = self.sender.lock();
            let Some(tx) = guard.as_ref() else {
                return;
            };
            if tx.send(Command::Flush(done_tx)).is_err() {
                return;
            }
        }
        let _ = done_rx.await;
    }

    /// Whether the queue still accepts values
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop immediately, discarding anything not yet processed.
    pub fn abort(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
            debug!("{}: aborted", self.name);
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for BatchingQueue<T> {
    fn add(&self, value: T) {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Command::Value(value)).is_err() {
                    trace!("{}: batching task already stopped", self.name);
                }
            }
            None => trace!("{}: dropping value added after dispose", self.name),
        }
    }

    /// Flush whatever is pending, then stop.
    async fn dispose(&self) {
        // Closing the channel lets the task drain the backlog before it exits
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!("{}: batching task failed: {}", self.name, describe_join_error(e));
                }
            }
        }
    }
}

async fn run_batches<T: Send + 'static>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    options: BatchingOptions,
    processor: Processor<T>,
) {
    let mut pending: Vec<T> = Vec::with_capacity(options.batch_max_size.min(1024));
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    trace!("{}: flushing {} after wait", name, pending.len());
                    process(&mut pending, &processor).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Value(value)) => {
                if pending.is_empty() {
                    deadline = Some(Instant::now() + options.batch_max_wait);
                }
                pending.push(value);
                if pending.len() >= options.batch_max_size {
                    trace!("{}: flushing full batch of {}", name, pending.len());
                    process(&mut pending, &processor).await;
                    deadline = None;
                }
            }
            Some(Command::Flush(done)) => {
                process(&mut pending, &processor).await;
                deadline = None;
                let _ = done.send(());
            }
            None => {
                process(&mut pending, &processor).await;
                debug!("{}: batching task stopped", name);
                return;
            }
        }
    }
}

async fn process<T>(pending: &mut Vec<T>, processor: &Processor<T>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    processor(batch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BufferQueue;
    use pretty_assertions::assert_eq;

    fn recording_queue(
        options: BatchingOptions,
    ) -> (BatchingQueue<i32>, Arc<BufferQueue<Vec<i32>>>) {
        let seen = Arc::new(BufferQueue::new());
        let sink = seen.clone();
        let queue = BatchingQueue::new("test", options, move |batch| {
            let sink = sink.clone();
            async move { sink.add(batch) }
        });
        (queue, seen)
    }

    #[tokio::test]
    async fn test_flushes_at_max_size() {
        let (queue, seen) = recording_queue(BatchingOptions {
            batch_max_size: 2,
            batch_max_wait: Duration::from_secs(3600),
        });

        queue.add_range(vec![1, 2, 3]);
        queue.flush().await;

        assert_eq!(seen.values(), vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_partial_batch_after_wait() {
        let (queue, seen) = recording_queue(BatchingOptions {
            batch_max_size: 100,
            batch_max_wait: Duration::from_millis(50),
        });

        queue.add(7);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.values(), vec![vec![7]]);
    }

    #[tokio::test]
    async fn test_dispose_flushes_pending_then_stops() {
        let (queue, seen) = recording_queue(BatchingOptions {
            batch_max_size: 10,
            batch_max_wait: Duration::from_secs(3600),
        });

        queue.add(1);
        queue.add(2);
        queue.dispose().await;
        queue.add(3);

        assert!(!queue.is_open());
        assert_eq!(seen.values(), vec![vec![1, 2]]);

        // Second dispose and flush after dispose are no-ops
        queue.dispose().await;
        queue.flush().await;
    }

    #[tokio::test]
    async fn test_abort_discards_pending() {
        let (queue, seen) = recording_queue(BatchingOptions {
            batch_max_size: 10,
            batch_max_wait: Duration::from_secs(3600),
        });

        queue.add(1);
        queue.abort();
        queue.dispose().await;

        assert!(seen.is_empty());
    }
}
