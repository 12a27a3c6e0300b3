//! Worker thread session and the main-side downloader that talks to it
//!
//! The worker thread runs its own current-thread tokio runtime and drives an
//! inner [`Downloader`]. Ids arrive over the main → worker ring and are fed to
//! the inner downloader in batches; every outcome it reports is framed onto the
//! worker → main ring. On the main side, [`WorkerDownloader`] is an ordinary
//! [`Downloader`] whose two background tasks move frames to and from the rings.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::codec;
use super::{
    ring_buffer, InitQueuesMessage, OverflowPolicy, RingConsumer, RingProducer, TransportError,
    TransportOptions, WorkerMessage,
};
use crate::downloader::{DownloadPool, Downloader};
use crate::error::{describe_join_error, describe_panic, LoaderError};
use crate::queue::{ChannelQueue, Queue};
use crate::types::{FetchOutcome, Item};

const WORKER_THREAD_NAME: &str = "objectloader-worker";

/// Handle on a running worker thread.
///
/// Dropping the handle without [`dispose`](Self::dispose) still sends
/// `DISPOSE`, but does not wait for the thread to exit.
pub struct WorkerSession {
    control: mpsc::UnboundedSender<WorkerMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerSession {
    /// Start a worker thread around `inner` and connect it to a new
    /// main-side downloader.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        inner: Arc<dyn Downloader>,
        options: TransportOptions,
    ) -> Result<(Self, WorkerDownloader), TransportError> {
        let (request_tx, request_rx) = ring_buffer(options.main_to_worker_capacity_bytes)?;
        let (outcome_tx, outcome_rx) = ring_buffer(options.worker_to_main_capacity_bytes)?;
        let (control, control_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker_main(inner, control_rx))
            .map_err(|e| TransportError::Worker(format!("failed to start thread: {e}")))?;

        control
            .send(WorkerMessage::InitQueues(InitQueuesMessage {
                main_to_worker: request_rx,
                main_to_worker_capacity_bytes: options.main_to_worker_capacity_bytes,
                worker_to_main: outcome_tx,
                worker_to_main_capacity_bytes: options.worker_to_main_capacity_bytes,
            }))
            .map_err(|_| TransportError::Worker("worker exited before INIT_QUEUES".into()))?;

        let downloader = WorkerDownloader::connect(request_tx, outcome_rx, options.overflow_policy);
        info!(
            "Worker session started ({} byte request ring, {} byte result ring, {:?} on overflow)",
            options.main_to_worker_capacity_bytes,
            options.worker_to_main_capacity_bytes,
            options.overflow_policy
        );

        Ok((
            Self {
                control,
                thread: Some(thread),
            },
            downloader,
        ))
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Send `DISPOSE` and wait for the worker thread to exit
    pub async fn dispose(mut self) {
        let _ = self.control.send(WorkerMessage::Dispose);
        let Some(thread) = self.thread.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => debug!("Worker session disposed"),
            Ok(Err(panic)) => error!("Worker thread panicked: {}", describe_panic(panic.as_ref())),
            Err(e) => warn!("Failed to join worker thread: {}", describe_join_error(e)),
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("Worker session dropped without dispose");
            let _ = self.control.send(WorkerMessage::Dispose);
        }
    }
}

// ============================================================================
// Worker thread
// ============================================================================

fn worker_main(inner: Arc<dyn Downloader>, control: mpsc::UnboundedReceiver<WorkerMessage>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Worker runtime failed to start: {}", e);
            return;
        }
    };
    runtime.block_on(run_worker(inner, control));
}

async fn run_worker(
    inner: Arc<dyn Downloader>,
    mut control: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let init = match control.recv().await {
        Some(WorkerMessage::InitQueues(init)) => init,
        Some(WorkerMessage::Dispose) | None => {
            debug!("Worker disposed before INIT_QUEUES");
            return;
        }
    };
    let InitQueuesMessage {
        main_to_worker: mut requests,
        worker_to_main: mut outcome_ring,
        ..
    } = init;

    let (results, mut outcomes) = ChannelQueue::<FetchOutcome>::new();
    let results = Arc::new(results);
    if let Err(e) = inner.initialize(DownloadPool {
        results: results.clone(),
        total: 0,
        max_download_batch_wait: None,
    }) {
        error!("Worker downloader failed to initialize: {}", e);
        return;
    }
    debug!("Worker running");

    loop {
        tokio::select! {
            message = control.recv() => match message {
                Some(WorkerMessage::InitQueues(_)) => warn!("Worker: ignoring repeated INIT_QUEUES"),
                Some(WorkerMessage::Dispose) | None => break,
            },
            frames = requests.read_batch() => match frames {
                Ok(frames) => {
                    let mut ids = Vec::with_capacity(frames.len());
                    for frame in frames {
                        match codec::decode_request(&frame) {
                            Ok(id) => ids.push(id),
                            Err(e) => warn!("Worker: dropping request: {}", e),
                        }
                    }
                    trace!("Worker: {} ids received", ids.len());
                    inner.add_range(ids);
                }
                Err(e) => {
                    debug!("Worker: request ring ended: {}", e);
                    break;
                }
            },
            Some(outcome) = outcomes.recv() => {
                match send_outcome(&mut outcome_ring, outcome).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => break,
                    Err(e) => warn!("Worker: dropping outcome: {}", e),
                }
            }
        }
    }

    // Undelivered outcomes are discarded
    requests.close();
    outcome_ring.close();
    inner.dispose().await;
    results.dispose().await;
    debug!("Worker stopped");
}

/// Outcomes always wait for room; an object too large for the ring at all is
/// reported as not found instead
async fn send_outcome(
    ring: &mut RingProducer,
    outcome: FetchOutcome,
) -> Result<(), TransportError> {
    let frame = codec::encode_outcome(&outcome)?;
    match ring.write(&frame).await {
        Err(TransportError::MessageTooLarge { size, capacity }) => {
            warn!(
                "Worker: '{}' needs {} bytes, result ring holds {}",
                outcome.base_id(),
                size,
                capacity
            );
            let notice = codec::encode_outcome(&FetchOutcome::missing(
                outcome.base_id(),
                format!("object of {size} bytes exceeds the {capacity} byte result ring"),
            ))?;
            ring.write(&notice).await
        }
        other => other,
    }
}

// ============================================================================
// Main side
// ============================================================================

struct Dispatch {
    pool: OnceLock<Arc<dyn Queue<FetchOutcome>>>,
    waiters: DashMap<String, Vec<oneshot::Sender<FetchOutcome>>>,
}

impl Dispatch {
    /// The pool sees an outcome before any waiter for it wakes
    fn deliver(&self, outcome: FetchOutcome) {
        match self.pool.get() {
            Some(pool) => pool.add(outcome.clone()),
            None => trace!("Worker transport: no pool for '{}'", outcome.base_id()),
        }
        if let Some((_, waiters)) = self.waiters.remove(outcome.base_id()) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn fail_waiters(&self, reason: &str) {
        let ids: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((id, waiters)) = self.waiters.remove(&id) {
                for waiter in waiters {
                    let _ = waiter.send(FetchOutcome::missing(id.clone(), reason));
                }
            }
        }
    }
}

/// Main-side downloader backed by a worker thread.
pub struct WorkerDownloader {
    requests: Mutex<Option<mpsc::UnboundedSender<String>>>,
    dispatch: Arc<Dispatch>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    policy: OverflowPolicy,
}

impl WorkerDownloader {
    /// Attach to the main-side ring halves. Spawns the two transfer tasks.
    pub(crate) fn connect(
        requests: RingProducer,
        outcomes: RingConsumer,
        policy: OverflowPolicy,
    ) -> Self {
        let dispatch = Arc::new(Dispatch {
            pool: OnceLock::new(),
            waiters: DashMap::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = tokio::spawn(forward_requests(rx, requests, policy, dispatch.clone()));
        let inbound = tokio::spawn(collect_outcomes(outcomes, dispatch.clone()));

        Self {
            requests: Mutex::new(Some(tx)),
            dispatch,
            tasks: Mutex::new(vec![outbound, inbound]),
            policy,
        }
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Hand `base_id` to the outbound task; gives the id back if it has stopped
    fn send(&self, base_id: String) -> Result<(), String> {
        let guard = self.requests.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(base_id).map_err(|e| e.0),
            None => Err(base_id),
        }
    }
}

#[async_trait]
impl Queue<String> for WorkerDownloader {
    fn add(&self, base_id: String) {
        if let Err(base_id) = self.send(base_id) {
            self.dispatch
                .deliver(FetchOutcome::missing(base_id, "worker transport closed"));
        }
    }

    async fn dispose(&self) {
        self.requests.lock().take();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Worker transport task failed: {}", describe_join_error(e));
                }
            }
        }
        self.dispatch.fail_waiters("worker downloader disposed");
    }
}

#[async_trait]
impl Downloader for WorkerDownloader {
    fn initialize(&self, pool: DownloadPool) -> Result<(), LoaderError> {
        self.dispatch
            .pool
            .set(pool.results)
            .map_err(|_| LoaderError::config("downloader already initialized"))
    }

    async fn download_single(&self, base_id: &str) -> Result<Item, LoaderError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch
            .waiters
            .entry(base_id.to_string())
            .or_default()
            .push(tx);

        if let Err(id) = self.send(base_id.to_string()) {
            self.dispatch.waiters.remove(&id);
            return Err(LoaderError::Disposed("worker downloader"));
        }

        match rx.await {
            Ok(FetchOutcome::Found(item)) => Ok(item),
            Ok(FetchOutcome::Missing { base_id, reason }) => Err(LoaderError::fetch(base_id, reason)),
            Err(_) => Err(TransportError::Closed.into()),
        }
    }

    fn reports_single_downloads(&self) -> bool {
        true
    }
}

async fn forward_requests(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut ring: RingProducer,
    policy: OverflowPolicy,
    dispatch: Arc<Dispatch>,
) {
    while let Some(id) = rx.recv().await {
        let frame = codec::encode_request(&id);
        let written = match policy {
            OverflowPolicy::Block => ring.write(&frame).await,
            OverflowPolicy::Reject => ring.try_write(&frame),
        };
        match written {
            Ok(()) => trace!("Worker transport: sent '{}'", id),
            Err(TransportError::Closed) => {
                dispatch.deliver(FetchOutcome::missing(id, "worker transport closed"));
                break;
            }
            Err(e) => {
                debug!("Worker transport: refused '{}': {}", id, e);
                dispatch.deliver(FetchOutcome::missing(id, e.to_string()));
            }
        }
    }

    rx.close();
    while let Ok(id) = rx.try_recv() {
        dispatch.deliver(FetchOutcome::missing(id, "worker transport closed"));
    }
}

async fn collect_outcomes(mut ring: RingConsumer, dispatch: Arc<Dispatch>) {
    loop {
        match ring.read_batch().await {
            Ok(frames) => {
                for frame in frames {
                    match codec::decode_outcome(&frame) {
                        Ok(outcome) => dispatch.deliver(outcome),
                        Err(e) => warn!("Worker transport: dropping outcome: {}", e),
                    }
                }
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!("Worker transport: result ring failed: {}", e);
                break;
            }
        }
    }
    ring.close();
    dispatch.fail_waiters("worker session closed");
    debug!("Worker transport: result ring closed");
}
