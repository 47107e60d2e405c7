//! Utterance buffer and pre-roll window

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::audio::AudioChunk;

/// Returned when an append would exceed the configured cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Bytes buffered before the refused append
    pub buffered: usize,
    /// Configured cap in bytes
    pub limit: usize,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: Vec<AudioChunk>,
    bytes: usize,
}

/// Ordered, lockable sequence of captured frames
///
/// `drain_all` takes the whole sequence and empties the buffer under one
/// lock, so no reader can observe a partial drain.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    inner: Mutex<Inner>,
    max_bytes: Option<usize>,
}

impl AudioBuffer {
    /// Create an unbounded buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer that refuses appends beyond `max_bytes`
    #[must_use]
    pub fn with_limit(max_bytes: Option<usize>) -> Self {
        Self {
            inner: Mutex::default(),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame at the tail
    ///
    /// # Errors
    ///
    /// Returns [`Overflow`] (and leaves the buffer untouched) if the cap
    /// would be exceeded
    pub fn append(&self, chunk: AudioChunk) -> Result<(), Overflow> {
        let mut inner = self.lock();
        let next = inner.bytes + chunk.len();
        if let Some(limit) = self.max_bytes {
            if next > limit {
                return Err(Overflow {
                    buffered: inner.bytes,
                    limit,
                });
            }
        }
        inner.bytes = next;
        inner.chunks.push(chunk);
        Ok(())
    }

    /// Take every buffered frame in arrival order and reset to empty
    #[must_use]
    pub fn drain_all(&self) -> Vec<AudioChunk> {
        let mut inner = self.lock();
        inner.bytes = 0;
        std::mem::take(&mut inner.chunks)
    }

    /// Discard everything
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.chunks.clear();
        inner.bytes = 0;
    }

    /// Number of buffered frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }

    /// Whether no frames are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().chunks.is_empty()
    }

    /// Total buffered bytes
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.lock().bytes
    }
}

#[derive(Debug, Default)]
struct WindowInner {
    chunks: VecDeque<AudioChunk>,
    bytes: usize,
}

/// Rolling window of the most recent audio, kept in every state
///
/// Holds at least `capacity` bytes once warmed up; the oldest frames are
/// evicted first.
#[derive(Debug)]
pub struct AudioWindow {
    inner: Mutex<WindowInner>,
    capacity: usize,
}

impl AudioWindow {
    /// Create a window holding roughly `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::default(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a frame, evicting the oldest ones beyond capacity
    pub fn push(&self, chunk: AudioChunk) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.bytes += chunk.len();
        inner.chunks.push_back(chunk);
        while inner.chunks.len() > 1 {
            let front = inner.chunks.front().map_or(0, AudioChunk::len);
            if inner.bytes - front < self.capacity {
                break;
            }
            inner.bytes -= front;
            inner.chunks.pop_front();
        }
    }

    /// Copy of the current window in arrival order
    #[must_use]
    pub fn snapshot(&self) -> Vec<AudioChunk> {
        self.lock().chunks.iter().cloned().collect()
    }

    /// Discard everything
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.chunks.clear();
        inner.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: u8, len: usize) -> AudioChunk {
        AudioChunk::from(vec![tag; len])
    }

    #[test]
    fn drain_returns_arrival_order_then_empty() {
        let buffer = AudioBuffer::new();
        let chunks = [chunk(1, 4), chunk(2, 4), chunk(3, 4)];
        for c in &chunks {
            buffer.append(c.clone()).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.byte_len(), 12);

        assert_eq!(buffer.drain_all(), chunks.to_vec());
        assert!(buffer.drain_all().is_empty());
        assert_eq!(buffer.byte_len(), 0);
    }

    #[test]
    fn clear_resets_size() {
        let buffer = AudioBuffer::new();
        buffer.append(chunk(1, 10)).unwrap();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_len(), 0);
    }

    #[test]
    fn limit_refuses_overflowing_append() {
        let buffer = AudioBuffer::with_limit(Some(10));
        buffer.append(chunk(1, 6)).unwrap();
        let err = buffer.append(chunk(2, 6)).unwrap_err();
        assert_eq!(err, Overflow { buffered: 6, limit: 10 });
        assert_eq!(buffer.len(), 1);

        buffer.append(chunk(3, 4)).unwrap();
        assert_eq!(buffer.byte_len(), 10);
    }

    #[test]
    fn window_evicts_oldest() {
        let window = AudioWindow::new(8);
        window.push(chunk(1, 4));
        window.push(chunk(2, 4));
        window.push(chunk(3, 4));

        let snapshot = window.snapshot();
        assert_eq!(snapshot, vec![chunk(2, 4), chunk(3, 4)]);
    }

    #[test]
    fn window_keeps_single_oversized_frame() {
        let window = AudioWindow::new(4);
        window.push(chunk(1, 2));
        window.push(chunk(2, 16));
        assert_eq!(window.snapshot(), vec![chunk(2, 16)]);
    }

    #[test]
    fn zero_capacity_window_stays_empty() {
        let window = AudioWindow::new(0);
        window.push(chunk(1, 4));
        assert!(window.snapshot().is_empty());
    }
}
