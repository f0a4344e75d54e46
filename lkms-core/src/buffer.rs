//! Bounded key buffer with FIFO semantics and secure erasure
//!
//! Each key stream session exclusively owns one [`KeyBuffer`]. The buffer is
//! append-at-tail, consume-from-head, with a hard capacity derived from the
//! session's QoS. Exceeding the capacity is an error surfaced to the
//! southbound pull loop as backpressure — key material is never silently
//! dropped. `take` is destructive: octets handed out are zeroized in place
//! and can never be exposed a second time.
//!
//! All access happens on the reactor thread; there is no interior locking.

use crate::{Error, Result};
use std::collections::VecDeque;
use zeroize::Zeroize;

/// Bounded FIFO queue of raw key octets
pub struct KeyBuffer {
    segments: VecDeque<Vec<u8>>,
    /// Consumed (already zeroized) prefix of the front segment
    head: usize,
    len: usize,
    capacity: usize,
    total_in: u64,
    total_out: u64,
}

impl KeyBuffer {
    /// Create a buffer with the given capacity in octets
    pub fn new(capacity: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            head: 0,
            len: 0,
            capacity,
            total_in: 0,
            total_out: 0,
        }
    }

    /// Append octets at the tail
    ///
    /// Fails with [`Error::CapacityExceeded`] if the capacity would be
    /// exceeded; the caller must stop pulling southbound and retry after
    /// consumption frees space. Returns the number of octets stored.
    pub fn push(&mut self, octets: Vec<u8>) -> Result<usize> {
        let n = octets.len();
        if n == 0 {
            return Ok(0);
        }
        if self.len + n > self.capacity {
            let mut rejected = octets;
            rejected.zeroize();
            return Err(Error::CapacityExceeded {
                needed: n,
                free: self.capacity - self.len,
            });
        }
        self.segments.push_back(octets);
        self.len += n;
        self.total_in += n as u64;
        Ok(n)
    }

    /// Remove and return up to `n` octets from the head
    ///
    /// Returns fewer than `n` only if the buffer runs empty. Never blocks;
    /// the caller decides whether to defer. Consumed octets are zeroized in
    /// the backing storage before this returns.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(self.len));
        while out.len() < n {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            let available = front.len() - self.head;
            let want = available.min(n - out.len());
            let range = self.head..self.head + want;
            out.extend_from_slice(&front[range.clone()]);
            front[range].zeroize();
            self.head += want;
            self.len -= want;
            if self.head == front.len() {
                self.segments.pop_front();
                self.head = 0;
            }
        }
        self.total_out += out.len() as u64;
        out
    }

    /// Zeroize and release all retained octets
    ///
    /// Invoked on every path that destroys a session.
    pub fn clear_secure(&mut self) {
        for segment in self.segments.iter_mut() {
            segment.zeroize();
        }
        self.segments.clear();
        self.head = 0;
        self.len = 0;
    }

    /// Octets currently buffered
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in octets; never exceeded
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free space in octets
    pub fn free(&self) -> usize {
        self.capacity - self.len
    }

    /// Cumulative octets ever pushed
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Cumulative octets ever taken
    pub fn total_out(&self) -> u64 {
        self.total_out
    }
}

impl Drop for KeyBuffer {
    fn drop(&mut self) {
        self.clear_secure();
    }
}

impl std::fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("octets", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_take() {
        let mut buffer = KeyBuffer::new(1024);
        buffer.push(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.len(), 4);

        let octets = buffer.take(4);
        assert_eq!(octets, vec![1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_spans_segments() {
        let mut buffer = KeyBuffer::new(1024);
        buffer.push(vec![1, 2]).unwrap();
        buffer.push(vec![3, 4, 5]).unwrap();
        assert_eq!(buffer.take(4), vec![1, 2, 3, 4]);
        assert_eq!(buffer.take(4), vec![5]);
    }

    #[test]
    fn test_capacity_is_hard() {
        let mut buffer = KeyBuffer::new(10);
        buffer.push(vec![0; 8]).unwrap();
        let err = buffer.push(vec![0; 4]).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded { needed: 4, free: 2 }
        ));
        // Earlier octets are untouched, not evicted.
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_take_is_destructive() {
        let mut buffer = KeyBuffer::new(64);
        buffer.push(vec![9; 16]).unwrap();
        let first = buffer.take(16);
        assert_eq!(first.len(), 16);
        assert!(buffer.take(16).is_empty());
    }

    #[test]
    fn test_clear_secure_empties() {
        let mut buffer = KeyBuffer::new(64);
        buffer.push(vec![7; 32]).unwrap();
        buffer.clear_secure();
        assert!(buffer.is_empty());
        assert!(buffer.take(1).is_empty());
        assert_eq!(buffer.free(), 64);
    }

    #[test]
    fn test_position_bookkeeping() {
        let mut buffer = KeyBuffer::new(64);
        buffer.push(vec![1; 20]).unwrap();
        buffer.take(8);
        buffer.push(vec![2; 10]).unwrap();
        buffer.take(30);
        assert_eq!(buffer.total_in(), 30);
        assert_eq!(buffer.total_out(), 30);
        assert!(buffer.total_out() <= buffer.total_in());
    }

    proptest! {
        /// Concatenated takes are exactly the pushed stream, in order,
        /// with no overlap and no repeats.
        #[test]
        fn prop_no_duplication(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..20),
            takes in prop::collection::vec(1usize..64, 1..40),
        ) {
            let mut buffer = KeyBuffer::new(usize::MAX / 2);
            let mut pushed = Vec::new();
            let mut taken = Vec::new();
            let mut chunks = chunks.into_iter();
            for n in takes {
                if let Some(chunk) = chunks.next() {
                    pushed.extend_from_slice(&chunk);
                    buffer.push(chunk).unwrap();
                }
                taken.extend_from_slice(&buffer.take(n));
            }
            taken.extend_from_slice(&buffer.take(usize::MAX / 2));
            prop_assert_eq!(taken, pushed);
        }
    }
}
