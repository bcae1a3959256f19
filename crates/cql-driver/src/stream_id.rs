//! Stream-id allocation for one connection. Positive stream
//! ids identify an in-flight request/response pair; negative ids are
//! reserved for server-pushed EVENT frames and are never allocated here.
//! At most one request may be in flight per id at a time.

use std::collections::VecDeque;

/// Protocol versions 3+ allow the full signed 15-bit positive range
/// (`0..=32767`); id `-1` and below are reserved for EVENT pushes.
const MAX_STREAMS: usize = 32768;

/// A ring allocator of free stream ids. Ids are handed out in round-robin
/// order (via the free-list queue) rather than always reusing the
/// lowest-numbered id, so a slow response doesn't get starved behind a
/// hot low id that's perpetually free-then-taken.
pub struct StreamIdAllocator {
    free: VecDeque<i16>,
}

impl StreamIdAllocator {
    pub fn new() -> StreamIdAllocator {
        let free = (0..MAX_STREAMS as i16).collect();
        StreamIdAllocator { free }
    }

    pub fn capacity(&self) -> usize {
        MAX_STREAMS
    }

    pub fn in_use(&self) -> usize {
        MAX_STREAMS - self.free.len()
    }

    /// Allocates the next free id, or `None` if all `MAX_STREAMS` ids are
    /// currently in flight.
    pub fn allocate(&mut self) -> Option<i16> {
        self.free.pop_front()
    }

    /// Returns an id to the free pool. Callers must only do this once per
    /// allocation: once when the response arrives, or once when the slot
    /// is orphaned by a caller timeout (never both, since an orphaned
    /// slot's eventual late response must not be re-dispatched to a
    /// different, newer request).
    pub fn release(&mut self, id: i16) {
        self.free.push_back(id);
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocates_unique_ids_up_to_capacity() {
        let mut alloc = StreamIdAllocator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..MAX_STREAMS {
            let id = alloc.allocate().expect("capacity not yet exhausted");
            assert!(seen.insert(id), "duplicate id handed out: {id}");
        }
        assert!(alloc.allocate().is_none());
    }

    #[test]
    fn released_id_becomes_available_again() {
        let mut alloc = StreamIdAllocator::new();
        let id = alloc.allocate().unwrap();
        alloc.release(id);
        assert_eq!(alloc.in_use(), 0);
    }
}
