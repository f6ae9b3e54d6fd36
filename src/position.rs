//! Subscriber position counter.
//!
//! Positions live in a counters file managed by an external registry; one
//! 64-byte slot per counter, value word at the slot base. The image is
//! the only writer of its own slot. Flow-control consumers in other
//! processes read it, so publication uses release semantics: an acquire
//! read observing a position also observes every handler effect that
//! preceded its publication.

use core::sync::atomic::Ordering;

use crate::region::Region;

/// Size of one counter slot, in bytes (one cache line).
pub const COUNTER_LENGTH: usize = 64;

/// A view of one position counter inside a shared counters region.
#[derive(Clone, Copy)]
pub struct SubscriberPosition {
    counters: Region,
    offset: usize,
    id: i32,
}

impl SubscriberPosition {
    /// Attach to counter `id` within `counters`.
    ///
    /// Panics if the region is too small to hold the slot.
    pub fn attach(counters: Region, id: i32) -> Self {
        assert!(id >= 0, "counter id must be non-negative");
        let offset = id as usize * COUNTER_LENGTH;
        assert!(
            offset + COUNTER_LENGTH <= counters.len(),
            "counter {id} out of bounds (counters len={})",
            counters.len()
        );
        Self {
            counters,
            offset,
            id,
        }
    }

    /// The counter id backing this position.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Plain read, for the owning (polling) thread.
    #[inline]
    pub fn get(&self) -> i64 {
        self.counters.atomic_i64(self.offset).load(Ordering::Relaxed)
    }

    /// Acquire read, pairing with another party's release write.
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.counters.atomic_i64(self.offset).load(Ordering::Acquire)
    }

    /// Release write, publishing all prior effects with the new value.
    #[inline]
    pub fn set_ordered(&self, value: i64) {
        self.counters
            .atomic_i64(self.offset)
            .store(value, Ordering::Release);
    }
}
