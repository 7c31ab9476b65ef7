//! Recycling pool for [`Frame`]s so the capture tick does not allocate.
//!
//! Frames leave the pool wrapped in a [`PooledFrame`] guard. Dropping the
//! guard resets the frame and hands it back, so a frame can never be owned
//! by a caller and the pool at the same time, and no exit path forgets to
//! return it. Release may happen on any thread.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use serde::Serialize;

use crate::constants::DEFAULT_POOL_CAPACITY;
use crate::frame::Frame;

struct PoolInner {
    free: ArrayQueue<Box<Frame>>,
    acquisitions: AtomicU64,
    misses: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
}

impl PoolInner {
    fn release(&self, mut frame: Box<Frame>) {
        frame.reset();
        self.releases.fetch_add(1, Ordering::Relaxed);
        if self.free.push(frame).is_err() {
            // Pool is full, let the allocation go.
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Shared handle to a bounded pool of reusable frames. Cloning is cheap and
/// every clone refers to the same pool.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

/// Point-in-time counters of a [`FramePool`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub acquisitions: u64,
    pub misses: u64,
    pub releases: u64,
    pub discards: u64,
}

impl PoolStats {
    /// Fraction of acquisitions served by a recycled frame. 1.0 before the
    /// first acquisition.
    pub fn hit_rate(&self) -> f64 {
        if self.acquisitions == 0 {
            return 1.0;
        }
        self.hits() as f64 / self.acquisitions as f64
    }

    /// Counters are read independently, so a snapshot taken mid-acquire can
    /// show a miss before its acquisition.
    pub fn hits(&self) -> u64 {
        self.acquisitions.saturating_sub(self.misses)
    }
}

impl FramePool {
    /// Create a pool that retains at most `capacity` idle frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(capacity.max(1)),
                acquisitions: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                discards: AtomicU64::new(0),
            }),
        }
    }

    /// Pre-allocate up to `count` idle frames (bounded by capacity).
    pub fn with_prefill(capacity: usize, count: usize) -> Self {
        let pool = Self::new(capacity);
        for _ in 0..count.min(pool.capacity()) {
            let _ = pool.inner.free.push(Box::default());
        }
        pool
    }

    /// Hand out a cleared frame, recycled when one is available.
    pub fn acquire(&self) -> PooledFrame {
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        let frame = match self.inner.free.pop() {
            Some(frame) => frame,
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Box::default()
            }
        };
        PooledFrame {
            frame: Some(frame),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(&self, frame: PooledFrame) {
        drop(frame);
    }

    pub fn capacity(&self) -> usize {
        self.inner.free.capacity()
    }

    /// Idle frames currently held by the pool
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            available: self.available(),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            releases: self.inner.releases.load(Ordering::Relaxed),
            discards: self.inner.discards.load(Ordering::Relaxed),
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive ownership of a pooled frame. Returns the frame to its pool when
/// dropped.
pub struct PooledFrame {
    frame: Option<Box<Frame>>,
    pool: Arc<PoolInner>,
}

impl PooledFrame {
    /// Take the frame out of pool management entirely.
    pub fn detach(mut self) -> Frame {
        match self.frame.take() {
            Some(frame) => *frame,
            None => Frame::default(),
        }
    }
}

impl Deref for PooledFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only `drop`/`detach` empty the slot, and both consume the guard.
        self.frame.as_deref().unwrap_or_else(|| unreachable!("pooled frame accessed after release"))
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        self.frame
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("pooled frame accessed after release"))
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.release(frame);
        }
    }
}

impl std::fmt::Debug for PooledFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledFrame").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_acquire_prefers_recycled_frames() {
        let pool = FramePool::new(4);
        let first = pool.acquire();
        drop(first);
        assert_eq!(pool.available(), 1);

        let _second = pool.acquire();
        let stats = pool.stats();
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits(), 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_released_frames_are_reset() {
        let pool = FramePool::new(2);
        {
            let mut frame = pool.acquire();
            frame.player_id = Uuid::new_v4();
            frame.x = 99.0;
            frame.action_code = 12;
        }
        let frame = pool.acquire();
        assert_eq!(*frame, Frame::default());
    }

    #[test]
    fn test_pool_never_exceeds_capacity() {
        let pool = FramePool::new(3);
        let held: Vec<PooledFrame> = (0..10).map(|_| pool.acquire()).collect();
        assert_eq!(pool.available(), 0);
        drop(held);
        assert_eq!(pool.available(), 3);

        let stats = pool.stats();
        assert_eq!(stats.releases, 10);
        assert_eq!(stats.discards, 7);

        for _ in 0..100 {
            let frame = pool.acquire();
            pool.release(frame);
            assert!(pool.available() <= pool.capacity());
        }
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_concurrent_release_is_safe() {
        let pool = FramePool::new(16);
        let frames: Vec<PooledFrame> = (0..64).map(|_| pool.acquire()).collect();

        let mut chunks: Vec<Vec<PooledFrame>> = Vec::new();
        let mut iter = frames.into_iter();
        for _ in 0..4 {
            chunks.push(iter.by_ref().take(16).collect());
        }

        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| std::thread::spawn(move || drop(chunk)))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.available(), 16);
        assert_eq!(pool.stats().releases, 64);
    }

    #[test]
    fn test_detach_leaves_pool_untouched() {
        let pool = FramePool::with_prefill(2, 2);
        let mut frame = pool.acquire();
        frame.health = 20.0;
        let owned = frame.detach();
        assert_eq!(owned.health, 20.0);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().releases, 0);
    }

    #[test]
    fn test_hit_rate_before_use() {
        assert_eq!(FramePool::new(1).stats().hit_rate(), 1.0);
    }

    #[test]
    fn test_torn_snapshot_reports_no_hits() {
        let stats = PoolStats {
            capacity: 4,
            available: 0,
            acquisitions: 3,
            misses: 4,
            releases: 0,
            discards: 0,
        };
        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
