use std::collections::VecDeque;

use crate::frame::Frame;
use crate::frame_pool::PooledFrame;

/// Fixed-capacity circular store of one player's most recent frames.
///
/// Pushing into a full buffer evicts the oldest frame, which goes back to
/// its pool as the guard drops. The buffer is both the pre-roll history and
/// the staging area that segments are cut from.
#[derive(Debug)]
pub struct RingBuffer {
    frames: VecDeque<PooledFrame>,
    capacity: usize,
    overwritten: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            overwritten: 0,
        }
    }

    pub fn push(&mut self, frame: PooledFrame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.overwritten += 1;
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by pushes into a full buffer since creation
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    pub fn oldest(&self) -> Option<&Frame> {
        self.frames.front().map(|f| &**f)
    }

    pub fn newest(&self) -> Option<&Frame> {
        self.frames.back().map(|f| &**f)
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.frames.iter().map(|f| &**f)
    }

    /// Time covered by the buffered frames, in milliseconds.
    pub fn span_ms(&self) -> i64 {
        match (self.oldest(), self.newest()) {
            (Some(oldest), Some(newest)) => newest.timestamp - oldest.timestamp,
            _ => 0,
        }
    }

    /// Remove every frame, oldest first, leaving the buffer empty.
    pub fn drain(&mut self) -> impl Iterator<Item = PooledFrame> + '_ {
        self.frames.drain(..)
    }

    /// Release every buffered frame back to its pool.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Change the capacity, evicting the oldest frames if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
            self.overwritten += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_pool::FramePool;

    fn push_at(buffer: &mut RingBuffer, pool: &FramePool, ts: i64) {
        let mut frame = pool.acquire();
        frame.timestamp = ts;
        buffer.push(frame);
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let pool = FramePool::new(8);
        let mut buffer = RingBuffer::new(3);
        for ts in [0, 50, 100, 150, 200] {
            push_at(&mut buffer, &pool, ts);
        }

        assert!(buffer.is_full());
        assert_eq!(buffer.overwritten(), 2);
        let stamps: Vec<i64> = buffer.iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![100, 150, 200]);
        assert_eq!(buffer.span_ms(), 100);
        // evicted frames went back to the pool
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_drain_empties_in_order() {
        let pool = FramePool::new(8);
        let mut buffer = RingBuffer::new(4);
        for ts in [10, 20, 30] {
            push_at(&mut buffer, &pool, ts);
        }

        let drained: Vec<i64> = buffer.drain().map(|f| f.timestamp).collect();
        assert_eq!(drained, vec![10, 20, 30]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.span_ms(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_clear_and_resize_release_frames() {
        let pool = FramePool::new(8);
        let mut buffer = RingBuffer::new(5);
        for ts in 0..5 {
            push_at(&mut buffer, &pool, ts);
        }
        buffer.resize(2);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.oldest().map(|f| f.timestamp), Some(3));
        assert_eq!(pool.available(), 3);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(pool.available(), 5);
    }
}
