//! Cross-thread worker transport
//!
//! Moves object ids from the loader to a background worker thread and fetch
//! outcomes back, over two independent SPSC byte rings. A small control channel
//! carries the session lifecycle: exactly one [`WorkerMessage::InitQueues`]
//! hands the worker its ring halves before any data flows, and one
//! [`WorkerMessage::Dispose`] ends the session.

pub mod codec;
mod ring;
mod worker;

pub use ring::{ring_buffer, RingConsumer, RingProducer, RingState, TransportError, FRAME_HEADER_LEN};
pub use worker::{WorkerDownloader, WorkerSession};

/// Hands the worker its ends of the two rings
pub struct InitQueuesMessage {
    /// Ids to fetch; the worker reads
    pub main_to_worker: RingConsumer,
    pub main_to_worker_capacity_bytes: usize,
    /// Fetch outcomes; the worker writes
    pub worker_to_main: RingProducer,
    pub worker_to_main_capacity_bytes: usize,
}

/// Control channel message
pub enum WorkerMessage {
    InitQueues(InitQueuesMessage),
    Dispose,
}

impl std::fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitQueues(init) => f
                .debug_struct("InitQueues")
                .field("main_to_worker_capacity_bytes", &init.main_to_worker_capacity_bytes)
                .field("worker_to_main_capacity_bytes", &init.worker_to_main_capacity_bytes)
                .finish(),
            Self::Dispose => f.write_str("Dispose"),
        }
    }
}

/// What a producer does when its frame does not fit the ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait until the consumer drains enough room
    #[default]
    Block,
    /// Refuse the request; its id is reported as not found
    Reject,
}

/// Ring sizes and overflow handling for a worker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub main_to_worker_capacity_bytes: usize,
    pub worker_to_main_capacity_bytes: usize,
    /// Applies to the main → worker ring; outcomes always wait for room
    pub overflow_policy: OverflowPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            main_to_worker_capacity_bytes: 64 * 1024,
            worker_to_main_capacity_bytes: 4 * 1024 * 1024,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}
