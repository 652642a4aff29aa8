//! Bounded FIFO between the frame producer and the render loop.
//!
//! One producer, one consumer by construction. Every blocking call takes an
//! explicit timeout; nothing here waits indefinitely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};

use crate::error::PlayerError;
use crate::frame::Frame;

pub const DEFAULT_CAPACITY: usize = 30;
pub const DEFAULT_PRELOAD_FRAMES: usize = 10;
pub const DEFAULT_PRELOAD_TIMEOUT: Duration = Duration::from_secs(10);

const PRELOAD_POLL: Duration = Duration::from_millis(100);

/// Outcome of the preload gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preload {
    /// The requested number of frames is buffered.
    Complete,
    /// The timeout elapsed with at least one frame buffered; playback
    /// proceeds with a reduced guarantee.
    Partial(usize),
    /// The timeout elapsed with nothing buffered.
    Empty,
}

pub struct FrameBuffer {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Enqueue a frame, blocking up to `timeout` when full. On timeout the
    /// frame is dropped here and `BufferFull` reported so the producer can
    /// count the skip; nothing in the queue is ever overwritten.
    pub fn put(&self, frame: Frame, timeout: Duration) -> Result<(), PlayerError> {
        self.tx
            .send_timeout(frame, timeout)
            .map_err(|_| PlayerError::BufferFull)
    }

    /// Enqueue a frame, waiting as long as it takes for space, re-checking
    /// `cancelled` every `poll`. Used by producers whose frames are already
    /// materialized and must not be dropped. Returns false when cancelled.
    pub fn put_blocking(
        &self,
        mut frame: Frame,
        poll: Duration,
        cancelled: impl Fn() -> bool,
    ) -> bool {
        loop {
            match self.tx.send_timeout(frame, poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(reclaimed)) => {
                    if cancelled() {
                        return false;
                    }
                    frame = reclaimed;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// Dequeue the next frame. `block = false` returns immediately when
    /// empty; `block = true` waits up to `timeout`.
    pub fn get(&self, block: bool, timeout: Duration) -> Option<Frame> {
        if block {
            self.rx.recv_timeout(timeout).ok()
        } else {
            self.rx.try_recv().ok()
        }
    }

    /// Discard up to `count` buffered frames without blocking. Returns how
    /// many were actually discarded.
    pub fn skip(&self, count: usize) -> usize {
        let mut skipped = 0;
        for _ in 0..count {
            if self.rx.try_recv().is_err() {
                break;
            }
            skipped += 1;
        }
        skipped
    }

    /// Empty the buffer completely. Returns the number of frames removed.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Block until `preload` frames are buffered or `timeout` elapses.
    /// `producer_done` short-circuits the wait when the producer has already
    /// finished (or failed) with fewer frames than requested.
    pub fn await_preload(
        &self,
        preload: usize,
        timeout: Duration,
        producer_done: &AtomicBool,
    ) -> Preload {
        let deadline = Instant::now() + timeout;
        loop {
            let buffered = self.len();
            if buffered >= preload {
                return Preload::Complete;
            }
            if producer_done.load(Ordering::Acquire) || Instant::now() >= deadline {
                return if buffered > 0 {
                    Preload::Partial(buffered)
                } else {
                    Preload::Empty
                };
            }
            std::thread::sleep(PRELOAD_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(index: u64) -> Frame {
        Frame::new(index, 2, 2, vec![0; Frame::byte_len(2, 2)])
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let buffer = FrameBuffer::new(3);
        for i in 0..3 {
            buffer.put(frame(i), Duration::from_millis(10)).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert!(matches!(
            buffer.put(frame(3), Duration::from_millis(10)),
            Err(PlayerError::BufferFull)
        ));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn put_after_full_timeout_reports_buffer_full() {
        let buffer = FrameBuffer::new(1);
        buffer.put(frame(0), Duration::from_millis(5)).unwrap();
        let start = Instant::now();
        let result = buffer.put(frame(1), Duration::from_millis(30));
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn get_preserves_fifo_order() {
        let buffer = FrameBuffer::new(5);
        for i in 0..5 {
            buffer.put(frame(i), Duration::from_millis(5)).unwrap();
        }
        for expected in 0..5 {
            let got = buffer.get(false, Duration::ZERO).unwrap();
            assert_eq!(got.index, expected);
        }
        assert!(buffer.get(false, Duration::ZERO).is_none());
    }

    #[test]
    fn blocking_get_returns_within_timeout() {
        let buffer = FrameBuffer::new(2);
        let start = Instant::now();
        assert!(buffer.get(true, Duration::from_millis(50)).is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        // generous scheduling slack
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn skip_discards_at_most_what_is_buffered() {
        let buffer = FrameBuffer::new(10);
        for i in 0..4 {
            buffer.put(frame(i), Duration::from_millis(5)).unwrap();
        }
        assert_eq!(buffer.skip(2), 2);
        assert_eq!(buffer.skip(10), 2);
        assert_eq!(buffer.skip(1), 0);
    }

    #[test]
    fn skipped_indices_are_never_delivered_again() {
        let buffer = FrameBuffer::new(10);
        for i in 0..6 {
            buffer.put(frame(i), Duration::from_millis(5)).unwrap();
        }
        buffer.skip(3);
        let next = buffer.get(false, Duration::ZERO).unwrap();
        assert_eq!(next.index, 3);
    }

    #[test]
    fn put_blocking_waits_for_space_and_honors_cancel() {
        let buffer = FrameBuffer::new(1);
        buffer.put(frame(0), Duration::from_millis(5)).unwrap();
        // cancelled producer gives up instead of waiting forever
        assert!(!buffer.put_blocking(frame(1), Duration::from_millis(10), || true));
        buffer.get(false, Duration::ZERO).unwrap();
        assert!(buffer.put_blocking(frame(1), Duration::from_millis(10), || false));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = FrameBuffer::new(10);
        for i in 0..7 {
            buffer.put(frame(i), Duration::from_millis(5)).unwrap();
        }
        assert_eq!(buffer.drain(), 7);
        assert!(buffer.is_empty());
    }

    #[test]
    fn preload_completes_after_exactly_enough_puts() {
        let buffer = FrameBuffer::new(10);
        let done = AtomicBool::new(false);
        for i in 0..10 {
            buffer.put(frame(i), Duration::from_millis(5)).unwrap();
        }
        let result = buffer.await_preload(10, Duration::from_millis(100), &done);
        assert_eq!(result, Preload::Complete);
    }

    #[test]
    fn preload_with_starved_producer_is_partial() {
        let buffer = FrameBuffer::new(10);
        let done = AtomicBool::new(false);
        for i in 0..3 {
            buffer.put(frame(i), Duration::from_millis(5)).unwrap();
        }
        done.store(true, Ordering::Release);
        let result = buffer.await_preload(10, Duration::from_millis(200), &done);
        assert_eq!(result, Preload::Partial(3));
    }

    #[test]
    fn preload_with_no_frames_is_empty() {
        let buffer = FrameBuffer::new(10);
        let done = AtomicBool::new(true);
        let result = buffer.await_preload(10, Duration::from_millis(50), &done);
        assert_eq!(result, Preload::Empty);
    }
}
