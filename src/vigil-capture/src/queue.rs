//! Bounded latest-wins frame queue
//!
//! The producer never blocks: putting into a full queue evicts the oldest
//! unconsumed frame. The consumer never blocks either and always receives
//! the most recent frame; anything older is discarded at that point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::frame::Frame;

pub struct FrameQueue {
    capacity: usize,
    slots: Mutex<VecDeque<Frame>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a frame, evicting the oldest one when full.
    ///
    /// Returns true if a frame was evicted to make room.
    pub fn put(&self, frame: Frame) -> bool {
        let mut slots = self.slots();
        let evicted = if slots.len() >= self.capacity {
            slots.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        slots.push_back(frame);
        evicted
    }

    /// Take the most recent frame, discarding any older ones
    pub fn get(&self) -> Option<Frame> {
        let mut slots = self.slots();
        let latest = slots.pop_back()?;
        let stale = slots.len() as u64;
        if stale > 0 {
            slots.clear();
            self.dropped.fetch_add(stale, Ordering::Relaxed);
        }
        Some(latest)
    }

    /// Drop everything currently queued
    pub fn clear(&self) {
        self.slots().clear();
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames discarded without ever being consumed
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use chrono::Utc;
    use std::sync::Arc;
    use std::thread;

    fn numbered(n: u8) -> Frame {
        Frame::new(vec![n; 3], 1, 1, PixelLayout::Rgb8, Utc::now()).unwrap()
    }

    #[test]
    fn test_get_returns_last_put_for_single_slot() {
        for count in 1..=20u8 {
            let queue = FrameQueue::new(1);
            for n in 1..=count {
                queue.put(numbered(n));
            }
            assert_eq!(queue.len(), 1);
            assert_eq!(queue.get().unwrap().data()[0], count);
            assert!(queue.get().is_none());
        }
    }

    #[test]
    fn test_put_evicts_oldest_when_full() {
        let queue = FrameQueue::new(3);
        assert!(!queue.put(numbered(1)));
        assert!(!queue.put(numbered(2)));
        assert!(!queue.put(numbered(3)));
        assert!(queue.put(numbered(4)));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 1);

        assert_eq!(queue.get().unwrap().data()[0], 4);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped_count(), 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_empty_get_and_clear() {
        let queue = FrameQueue::new(2);
        assert!(queue.get().is_none());
        queue.put(numbered(1));
        queue.clear();
        assert!(queue.get().is_none());
    }

    #[test]
    fn test_producer_never_blocks_on_slow_consumer() {
        let queue = Arc::new(FrameQueue::new(1));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for n in 0..=200u8 {
                    queue.put(numbered(n));
                }
            })
        };
        producer.join().unwrap();

        assert_eq!(queue.get().unwrap().data()[0], 200);
        assert_eq!(queue.dropped_count(), 200);
    }
}
