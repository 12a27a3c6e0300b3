//! Single-producer/single-consumer byte ring
//!
//! A fixed-capacity region carries length-prefixed frames. The producer owns
//! the write cursor and the consumer owns the read cursor; both cursors only
//! ever grow, so `head - tail` is the number of buffered bytes and a position
//! in the region is `cursor % capacity`. Neither side takes a lock: the only
//! shared state is the two cursors, the overflow flag and the closed flag.
//!
//! A write that does not fit never wraps over unread bytes. It raises the
//! overflow flag instead, which stays up until the consumer next drains a
//! frame or a later write fits. [`RingProducer::try_write`] then reports [`TransportError::Overflow`];
//! [`RingProducer::write`] waits for room.
//!
//! The two halves are move-only, so a ring has exactly one writer and one
//! reader by construction. Dropping either half closes the ring; frames still
//! buffered at that point are discarded.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Bytes of the little-endian `u32` length that precedes every frame
pub const FRAME_HEADER_LEN: usize = 4;

/// Observable state of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// Nothing buffered
    Empty,
    /// Some frames buffered and room for more
    Ready,
    /// No room for even an empty frame until the consumer drains
    Full,
    /// A write was refused for lack of room; cleared by the next read
    Overflow,
}

/// Ring buffer transport failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("ring buffer overflow: frame needs {needed} bytes, {available} free")]
    Overflow { needed: usize, available: usize },

    #[error("frame of {size} bytes can never fit a ring of {capacity} bytes")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error("ring buffer closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid ring capacity: {0} bytes")]
    InvalidCapacity(usize),

    #[error("worker session error: {0}")]
    Worker(String),
}

struct Region {
    bytes: Box<[UnsafeCell<u8>]>,
    /// Total bytes ever written; only the producer stores it
    head: AtomicU64,
    /// Total bytes ever read; only the consumer stores it
    tail: AtomicU64,
    overflow: AtomicBool,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
}

// SAFETY: the byte cells are only touched through `copy_in` (producer, on
// bytes in [head, tail + capacity)) and `copy_out` (consumer, on bytes in
// [tail, head)). The cursor protocol keeps those ranges disjoint and the
// Release/Acquire pairs on the cursors order the byte accesses.
unsafe impl Sync for Region {}

impl Region {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn used(&self) -> usize {
        let tail = self.tail.load(Ordering::SeqCst);
        let head = self.head.load(Ordering::SeqCst);
        head.saturating_sub(tail) as usize
    }

    fn state(&self) -> RingState {
        if self.overflow.load(Ordering::SeqCst) {
            return RingState::Overflow;
        }
        let used = self.used();
        if used == 0 {
            RingState::Empty
        } else if self.capacity() - used < FRAME_HEADER_LEN {
            RingState::Full
        } else {
            RingState::Ready
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            trace!("Ring: closed");
        }
        self.readable.notify_one();
        self.writable.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Copy `src` into the region starting at cursor `at`, wrapping at the end.
    ///
    /// # Safety
    /// Only the producer may call this, and only for bytes it owns: `at` to
    /// `at + src.len()` must lie within `[head, tail + capacity)`.
    unsafe fn copy_in(&self, at: u64, src: &[u8]) {
        let capacity = self.capacity();
        let start = (at % capacity as u64) as usize;
        let first = src.len().min(capacity - start);
        let base = UnsafeCell::raw_get(self.bytes.as_ptr());
        std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
        std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
    }

    /// Copy bytes starting at cursor `at` out of the region.
    ///
    /// # Safety
    /// Only the consumer may call this, and only for bytes in `[tail, head)`.
    unsafe fn copy_out(&self, at: u64, dst: &mut [u8]) {
        let capacity = self.capacity();
        let start = (at % capacity as u64) as usize;
        let first = dst.len().min(capacity - start);
        let base = UnsafeCell::raw_get(self.bytes.as_ptr()) as *const u8;
        std::ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
        std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
    }
}

/// Create a ring of `capacity` bytes and return its two halves.
///
/// The capacity must leave room for a frame header plus at least one byte.
pub fn ring_buffer(capacity: usize) -> Result<(RingProducer, RingConsumer), TransportError> {
    if capacity <= FRAME_HEADER_LEN || capacity > u32::MAX as usize {
        return Err(TransportError::InvalidCapacity(capacity));
    }
    let region = Arc::new(Region {
        bytes: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        head: AtomicU64::new(0),
        tail: AtomicU64::new(0),
        overflow: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    Ok((
        RingProducer {
            region: region.clone(),
        },
        RingConsumer { region },
    ))
}

/// Write half of a ring
pub struct RingProducer {
    region: Arc<Region>,
}

impl RingProducer {
    /// Region size in bytes
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes currently free
    pub fn free(&self) -> usize {
        self.region.capacity() - self.region.used()
    }

    pub fn state(&self) -> RingState {
        self.region.state()
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_closed()
    }

    /// Close the ring for both halves
    pub fn close(&self) {
        self.region.close();
    }

    /// Write one frame without waiting.
    ///
    /// Fails with [`TransportError::Overflow`] when the frame does not fit
    /// right now; the ring is then in [`RingState::Overflow`] until the
    /// consumer reads.
    pub fn try_write(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let region = &self.region;
        let needed = FRAME_HEADER_LEN + payload.len();
        if needed > region.capacity() {
            return Err(TransportError::MessageTooLarge {
                size: needed,
                capacity: region.capacity(),
            });
        }
        if region.is_closed() {
            return Err(TransportError::Closed);
        }

        let head = region.head.load(Ordering::Relaxed);
        let mut free = region.capacity() - region.used();
        if needed > free {
            region.overflow.store(true, Ordering::SeqCst);
            // The consumer may have drained between the check and the flag
            free = region.capacity() - region.used();
            if needed > free {
                trace!("Ring: overflow ({} needed, {} free)", needed, free);
                return Err(TransportError::Overflow {
                    needed,
                    available: free,
                });
            }
        }

        let header = (payload.len() as u32).to_le_bytes();
        // SAFETY: `needed <= free`, so [head, head + needed) is unread space
        // owned by this producer.
        unsafe {
            region.copy_in(head, &header);
            region.copy_in(head + FRAME_HEADER_LEN as u64, payload);
        }
        // The frame fit, so whatever overflow was raised is over
        region.overflow.store(false, Ordering::SeqCst);
        region.head.store(head + needed as u64, Ordering::SeqCst);
        region.readable.notify_one();
        Ok(())
    }

    /// Write one frame, waiting for the consumer to make room.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        loop {
            match self.try_write(payload) {
                Err(TransportError::Overflow { .. }) => {
                    self.region.writable.notified().await;
                }
                other => return other,
            }
        }
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.region.close();
    }
}

/// Read half of a ring
pub struct RingConsumer {
    region: Arc<Region>,
}

impl RingConsumer {
    /// Region size in bytes
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes currently buffered, frame headers included
    pub fn buffered(&self) -> usize {
        self.region.used()
    }

    pub fn state(&self) -> RingState {
        self.region.state()
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_closed()
    }

    /// Close the ring for both halves
    pub fn close(&self) {
        self.region.close();
    }

    /// Read one frame if one is buffered.
    pub fn try_read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let region = &self.region;
        if region.is_closed() {
            return Err(TransportError::Closed);
        }

        let tail = region.tail.load(Ordering::Relaxed);
        let head = region.head.load(Ordering::SeqCst);
        let available = head.saturating_sub(tail) as usize;
        if available == 0 {
            return Ok(None);
        }
        if available < FRAME_HEADER_LEN {
            return Err(TransportError::Malformed(format!(
                "{available} stray bytes in ring"
            )));
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        // SAFETY: [tail, head) was published by the producer's head store
        unsafe { region.copy_out(tail, &mut header) };
        let len = u32::from_le_bytes(header) as usize;
        if FRAME_HEADER_LEN + len > available {
            return Err(TransportError::Malformed(format!(
                "frame of {len} bytes but only {available} buffered"
            )));
        }

        let mut payload = vec![0u8; len];
        // SAFETY: as above, the whole frame lies in [tail, head)
        unsafe { region.copy_out(tail + FRAME_HEADER_LEN as u64, &mut payload) };

        region
            .tail
            .store(tail + (FRAME_HEADER_LEN + len) as u64, Ordering::SeqCst);
        if region.overflow.swap(false, Ordering::SeqCst) {
            debug!("Ring: overflow cleared by drain");
        }
        region.writable.notify_one();
        Ok(Some(payload))
    }

    /// Read every frame currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_read()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Wait for the next frame.
    ///
    /// Cancel-safe: a frame is only consumed by a completed call.
    pub async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(frame) = self.try_read()? {
                return Ok(frame);
            }
            self.region.readable.notified().await;
        }
    }

    /// Wait for at least one frame, then take everything buffered.
    pub async fn read_batch(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        let first = self.read().await?;
        let mut frames = vec![first];
        frames.extend(self.drain()?);
        Ok(frames)
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.region.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_rejects_unusable_capacity() {
        assert!(matches!(
            ring_buffer(FRAME_HEADER_LEN),
            Err(TransportError::InvalidCapacity(4))
        ));
        assert!(ring_buffer(FRAME_HEADER_LEN + 1).is_ok());
    }

    #[test]
    fn test_state_lifecycle() {
        let (mut producer, mut consumer) = ring_buffer(16).unwrap();
        assert_eq!(producer.state(), RingState::Empty);

        producer.try_write(b"abcd").unwrap();
        assert_eq!(producer.state(), RingState::Ready);

        // 8 used, 8 free: a 4-byte payload fills the ring exactly
        producer.try_write(b"efgh").unwrap();
        assert_eq!(producer.state(), RingState::Full);
        assert_eq!(producer.free(), 0);

        let err = producer.try_write(b"i").unwrap_err();
        assert_eq!(
            err,
            TransportError::Overflow {
                needed: 5,
                available: 0
            }
        );
        assert_eq!(consumer.state(), RingState::Overflow);

        assert_eq!(consumer.try_read().unwrap(), Some(b"abcd".to_vec()));
        assert_eq!(consumer.state(), RingState::Ready);
        assert_eq!(consumer.drain().unwrap(), vec![b"efgh".to_vec()]);
        assert_eq!(consumer.state(), RingState::Empty);
    }

    #[test]
    fn test_overflow_never_overwrites_unread_frames() {
        let (mut producer, mut consumer) = ring_buffer(12).unwrap();
        producer.try_write(b"12345").unwrap();
        assert!(producer.try_write(b"678").is_err());
        assert_eq!(consumer.drain().unwrap(), vec![b"12345".to_vec()]);
    }

    #[test]
    fn test_successful_write_never_reports_overflow() {
        let (mut producer, mut consumer) = ring_buffer(24).unwrap();
        let reader = std::thread::spawn(move || {
            let mut frames = 0;
            while !consumer.is_closed() {
                frames += consumer.drain().map(|f| f.len()).unwrap_or(0);
                std::thread::yield_now();
            }
            frames
        });

        let mut written = 0;
        for i in 0..20_000u32 {
            if producer.try_write(&i.to_le_bytes()).is_ok() {
                written += 1;
                assert_ne!(producer.state(), RingState::Overflow);
            }
        }
        assert!(written > 0);
        producer.close();
        assert!(reader.join().unwrap() <= written);
    }

    #[test]
    fn test_frames_wrap_around_the_end() {
        let (mut producer, mut consumer) = ring_buffer(10).unwrap();
        for round in 0u8..20 {
            let payload = [round, round.wrapping_add(1), round.wrapping_add(2)];
            producer.try_write(&payload).unwrap();
            assert_eq!(consumer.try_read().unwrap(), Some(payload.to_vec()));
        }
        assert_eq!(consumer.state(), RingState::Empty);
    }

    #[test]
    fn test_empty_frame_and_oversized_frame() {
        let (mut producer, mut consumer) = ring_buffer(8).unwrap();
        producer.try_write(b"").unwrap();
        assert_eq!(consumer.try_read().unwrap(), Some(Vec::new()));

        assert_eq!(
            producer.try_write(b"12345").unwrap_err(),
            TransportError::MessageTooLarge {
                size: 9,
                capacity: 8
            }
        );
        // An impossible frame is not an overflow
        assert_eq!(producer.state(), RingState::Empty);
    }

    #[test]
    fn test_drop_closes_and_discards() {
        let (mut producer, mut consumer) = ring_buffer(32).unwrap();
        producer.try_write(b"pending").unwrap();
        drop(producer);
        assert!(consumer.is_closed());
        assert_eq!(consumer.try_read(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_blocking_write_waits_for_drain() {
        let (mut producer, mut consumer) = ring_buffer(16).unwrap();
        producer.try_write(b"0123456789ab").unwrap();

        let writer = tokio::spawn(async move {
            producer.write(b"next").await.unwrap();
            producer
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(consumer.state(), RingState::Overflow);

        assert_eq!(consumer.read().await.unwrap(), b"0123456789ab".to_vec());
        let _producer = writer.await.unwrap();
        assert_eq!(consumer.read().await.unwrap(), b"next".to_vec());
    }

    #[tokio::test]
    async fn test_read_wakes_on_write_from_another_thread() {
        let (mut producer, mut consumer) = ring_buffer(64).unwrap();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            for i in 0..5u8 {
                while producer.try_write(&[i; 8]).is_err() {
                    std::thread::yield_now();
                }
            }
            producer
        });

        let mut received = Vec::new();
        while received.len() < 5 {
            received.extend(consumer.read_batch().await.unwrap());
        }
        let _producer = thread.join().unwrap();
        let expected: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 8]).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_closing_wakes_blocked_reader() {
        let (producer, mut consumer) = ring_buffer(16).unwrap();
        let reader = tokio::spawn(async move { consumer.read().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.close();
        assert_eq!(reader.await.unwrap(), Err(TransportError::Closed));
    }
}
