//! Bounded byte ring with pause-on-overflow discipline.
//!
//! Overwriting the oldest byte on overflow would slice a frame boundary in
//! half and desynchronize the extractor permanently, so the ring instead
//! refuses new bytes and pauses until an explicit drain or clear.

use std::collections::VecDeque;
use std::sync::Mutex;

struct Inner {
    capacity: usize,
    items: VecDeque<u8>,
    paused: bool,
    overflow_count: u64,
}

pub struct ByteRing {
    inner: Mutex<Inner>,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                items: VecDeque::with_capacity(capacity),
                paused: false,
                overflow_count: 0,
            }),
        }
    }

    /// Append one byte. Returns `false` (and pauses the ring) if it was full.
    pub fn enqueue(&self, byte: u8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused || inner.items.len() >= inner.capacity {
            if !inner.paused {
                inner.paused = true;
                inner.overflow_count += 1;
                log::warn!(
                    "byte ring overflowed at capacity {}, pausing (overflow_count={})",
                    inner.capacity,
                    inner.overflow_count
                );
            }
            return false;
        }
        inner.items.push_back(byte);
        true
    }

    pub fn dequeue(&self) -> Option<u8> {
        self.inner.lock().unwrap().items.pop_front()
    }

    pub fn length(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// Unpause without discarding buffered bytes, used by drain recovery
    /// once the recovery loop has made room.
    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
    }

    pub fn overflow_count(&self) -> u64 {
        self.inner.lock().unwrap().overflow_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_capacity() {
        let ring = ByteRing::new(8);
        for b in [1u8, 2, 3, 4] {
            assert!(ring.enqueue(b));
        }
        assert_eq!(ring.length(), 4);
        for b in [1u8, 2, 3, 4] {
            assert_eq!(ring.dequeue(), Some(b));
        }
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn overflow_pauses_and_rejects() {
        let ring = ByteRing::new(16);
        for i in 0..20u8 {
            let ok = ring.enqueue(i);
            if i < 16 {
                assert!(ok, "byte {i} should have been admitted");
            } else {
                assert!(!ok, "byte {i} should have been rejected");
            }
        }
        assert_eq!(ring.length(), 16);
        assert!(ring.is_paused());
        assert!(ring.overflow_count() >= 1);
    }

    #[test]
    fn clear_resets_paused_and_empties() {
        let ring = ByteRing::new(2);
        assert!(ring.enqueue(1));
        assert!(ring.enqueue(2));
        assert!(!ring.enqueue(3));
        assert!(ring.is_paused());
        ring.clear();
        assert_eq!(ring.length(), 0);
        assert!(!ring.is_paused());
    }
}
