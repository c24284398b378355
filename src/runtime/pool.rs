//! Fixed-capacity connection slot pool.
//!
//! All per-connection state lives in a fixed array of slots allocated once
//! at worker startup; occupancy is a single `u32` bitmap, which caps the
//! capacity at 32 and makes allocation a first-clear-bit scan. Nothing on
//! the accept or close path touches the heap.

use crate::config::MAX_POOL_CAPACITY;
use crate::http::parser::RequestParser;
use mio::net::TcpStream;
use std::time::Instant;

/// Per-connection record. Fixed size apart from the field buffer, which is
/// sized from configuration when the pool is built and reused across
/// occupancies of the slot.
#[derive(Debug)]
pub struct ConnSlot {
    /// The accepted socket; `None` while the slot is free.
    pub stream: Option<TcpStream>,
    /// Absolute time after which an incomplete request is dropped.
    /// Only meaningful while the slot is occupied.
    pub deadline: Instant,
    /// Resumable parse position for the request in flight.
    pub parser: RequestParser,
    /// Packed `path \0 host [\0]` output of the parser.
    pub fields: Box<[u8]>,
    /// Response bytes already flushed, for resuming partial writes.
    pub sent: usize,
    /// The parser reported the request too large; respond with 414 instead
    /// of a redirect.
    pub overflowed: bool,
}

impl ConnSlot {
    fn new(field_buffer_size: usize) -> Self {
        Self {
            stream: None,
            deadline: Instant::now(),
            parser: RequestParser::new(),
            fields: vec![0u8; field_buffer_size].into_boxed_slice(),
            sent: 0,
            overflowed: false,
        }
    }

    /// Reset for reuse, so the next occupant starts indistinguishable from a
    /// never-used slot.
    fn reset(&mut self) {
        self.stream = None;
        self.parser.reset();
        self.fields.fill(0);
        self.sent = 0;
        self.overflowed = false;
    }
}

/// Pool of connection slots with bitmap occupancy tracking.
pub struct ConnPool {
    slots: Vec<ConnSlot>,
    /// Bit `i` set ⇔ slot `i` occupied.
    occupied: u32,
}

impl ConnPool {
    /// Create a pool of `capacity` slots (at most 32), each with a
    /// `field_buffer_size`-byte field buffer.
    ///
    /// # Panics
    /// Panics if `capacity` is 0 or exceeds the bitmap width; configuration
    /// validation rejects such values before a pool is built.
    pub fn new(capacity: usize, field_buffer_size: usize) -> Self {
        assert!(capacity > 0 && capacity <= MAX_POOL_CAPACITY);
        Self {
            slots: (0..capacity).map(|_| ConnSlot::new(field_buffer_size)).collect(),
            occupied: 0,
        }
    }

    /// Claim the lowest free slot, returning its id.
    ///
    /// Only the occupancy bit is set; the caller initializes the socket and
    /// deadline. Returns `None` when the pool is saturated.
    pub fn alloc(&mut self) -> Option<usize> {
        let id = (!self.occupied).trailing_zeros() as usize;
        if id >= self.slots.len() {
            return None;
        }
        self.occupied |= 1 << id;
        Some(id)
    }

    /// Release a slot and scrub its state for reuse.
    pub fn free(&mut self, id: usize) {
        self.occupied &= !(1 << id);
        self.slots[id].reset();
    }

    /// Whether the slot is currently occupied.
    pub fn contains(&self, id: usize) -> bool {
        id < self.slots.len() && self.occupied & (1 << id) != 0
    }

    /// All slots taken; new sockets must not be accepted.
    pub fn is_full(&self) -> bool {
        self.len() == self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.occupied.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: usize) -> &ConnSlot {
        &self.slots[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut ConnSlot {
        &mut self.slots[id]
    }

    /// Ids of occupied slots in ascending order.
    pub fn occupied_ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots.len()).filter(move |&id| self.occupied & (1 << id) != 0)
    }

    /// Snapshot of the occupancy bitmap, for sweeps that free slots while
    /// iterating without touching the heap.
    pub fn occupied_bits(&self) -> u32 {
        self.occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::FeedResult;

    #[test]
    fn test_alloc_until_full() {
        let mut pool = ConnPool::new(3, 16);
        assert!(pool.is_empty());

        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(2));
        assert!(pool.is_full());

        // Saturated: a further claim is refused without disturbing anything.
        assert_eq!(pool.alloc(), None);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_free_then_realloc_lowest() {
        let mut pool = ConnPool::new(4, 16);
        for _ in 0..4 {
            pool.alloc().unwrap();
        }

        pool.free(1);
        pool.free(3);
        assert_eq!(pool.len(), 2);

        // First-clear-bit allocation hands back the lowest free id.
        assert_eq!(pool.alloc(), Some(1));
        assert_eq!(pool.alloc(), Some(3));
    }

    #[test]
    fn test_freed_slot_is_indistinguishable_from_fresh() {
        let mut pool = ConnPool::new(2, 32);
        let id = pool.alloc().unwrap();

        // Dirty the slot as a completed request would.
        {
            let slot = pool.get_mut(id);
            let ConnSlot { parser, fields, .. } = &mut *slot;
            let result = parser.feed(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n", fields);
            assert_eq!(result, FeedResult::Complete);
            slot.sent = 17;
            slot.overflowed = true;
        }

        pool.free(id);
        assert!(!pool.contains(id));

        let id2 = pool.alloc().unwrap();
        assert_eq!(id2, id);

        let slot = pool.get(id2);
        assert!(slot.stream.is_none());
        assert_eq!(slot.parser, RequestParser::new());
        assert!(slot.fields.iter().all(|&b| b == 0));
        assert_eq!(slot.sent, 0);
        assert!(!slot.overflowed);
    }

    #[test]
    fn test_occupied_ids_ascending() {
        let mut pool = ConnPool::new(8, 16);
        for _ in 0..6 {
            pool.alloc().unwrap();
        }
        pool.free(0);
        pool.free(4);

        let ids: Vec<usize> = pool.occupied_ids().collect();
        assert_eq!(ids, vec![1, 2, 3, 5]);
        assert_eq!(pool.occupied_bits(), 0b101110);
    }

    #[test]
    fn test_full_capacity_bitmap() {
        let mut pool = ConnPool::new(32, 16);
        for expected in 0..32 {
            assert_eq!(pool.alloc(), Some(expected));
        }
        assert!(pool.is_full());
        assert_eq!(pool.alloc(), None);

        pool.free(31);
        assert_eq!(pool.alloc(), Some(31));
    }

    #[test]
    fn test_admission_leaves_other_slots_untouched() {
        let mut pool = ConnPool::new(2, 16);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();

        pool.get_mut(a).fields[0] = b'/';
        pool.get_mut(b).fields[0] = b'!';
        let deadline_a = pool.get(a).deadline;

        assert_eq!(pool.alloc(), None);

        assert_eq!(pool.get(a).fields[0], b'/');
        assert_eq!(pool.get(b).fields[0], b'!');
        assert_eq!(pool.get(a).deadline, deadline_a);
    }
}
