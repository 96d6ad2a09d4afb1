//! Fixed-capacity, append-only registry of arena descriptors
//! (spec.md §4.2, §9).
//!
//! Growth follows the same "reserve a slot with `fetch_add`, roll back
//! with `fetch_sub` on failure" shape the teacher's `Pool` uses to grow
//! its backing `Vec` of blocks (see `pool.rs`), except the registry's
//! storage is itself bump-allocated from the static meta-arena rather
//! than a `Vec`, since growing a `Vec` would mean reallocating (and
//! briefly invalidating) every descriptor pointer already handed out to
//! other threads. A plain array of `AtomicPtr` sized at construction
//! time sidesteps that: slots past `count` are simply null until
//! claimed, and every slot, once published, never moves again.
//!
//! The registry is a plain value, not a global `static`: callers own an
//! `ArenaRegistry` (usually inside an `ArenaSystem`) and pass it
//! explicitly, which keeps tests free of shared global state. A
//! process-wide convenience instance is layered on top in `lib.rs` for
//! callers who want the free-function API.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::descriptor::ArenaDescriptor;

/// An append-only table of arena descriptors, addressed by index.
pub struct ArenaRegistry {
    slots: Box<[AtomicPtr<ArenaDescriptor>]>,
    count: AtomicUsize,
}

impl ArenaRegistry {
    /// Creates a registry with room for `capacity` arenas. Capacity is
    /// fixed for the registry's lifetime; once exhausted, new arena
    /// reservations fall back to direct OS allocation (spec.md §4.4).
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ArenaRegistry {
            slots,
            count: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.slots.len())
    }

    /// Reserves the next index for a new arena. The caller must publish
    /// a descriptor pointer into that index with `publish` before any
    /// other thread can observe it; on failure to construct the
    /// descriptor, the caller should call `rollback` to give the slot
    /// back.
    pub fn reserve_index(&self) -> Option<usize> {
        let index = self.count.fetch_add(1, Ordering::AcqRel);
        if index >= self.slots.len() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(index)
    }

    /// Gives back an index reserved via `reserve_index` that was never
    /// published (e.g. the OS reservation backing it failed).
    pub fn rollback(&self, index: usize) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(self.slots[index].load(Ordering::Acquire).is_null());
    }

    /// Publishes a descriptor at a previously-reserved index.
    ///
    /// # Safety
    /// `descriptor` must point to a live, uniquely-owned `ArenaDescriptor`
    /// that stays valid for the registry's lifetime; the registry takes
    /// over running its destructor (via `drop_in_place`) but never frees
    /// the backing memory itself, since descriptors may be carved out of
    /// the static meta-arena rather than the global allocator.
    pub unsafe fn publish(&self, index: usize, descriptor: *mut ArenaDescriptor) {
        self.slots[index].store(descriptor, Ordering::Release);
    }

    /// Looks up the descriptor at `index`, if published.
    pub fn get(&self, index: usize) -> Option<&ArenaDescriptor> {
        let raw = self.slots.get(index)?.load(Ordering::Acquire);
        unsafe { raw.as_ref() }
    }

    /// Iterates over every currently-published descriptor and its
    /// index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ArenaDescriptor)> {
        (0..self.len()).filter_map(move |i| self.get(i).map(|d| (i, d)))
    }

    /// Total free blocks across every published arena.
    pub fn total_free_blocks(&self) -> usize {
        self.iter().map(|(_, d)| d.free_block_count()).sum()
    }
}

impl Drop for ArenaRegistry {
    fn drop(&mut self) {
        // Runs each descriptor's destructor in place but does not free
        // the backing memory: ownership of that memory (static
        // meta-arena or, in tests, a leaked `Box`) lies with whoever
        // constructed the descriptor.
        for slot in self.slots.iter() {
            let raw = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                unsafe {
                    std::ptr::drop_in_place(raw);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked(block_count: usize) -> *mut ArenaDescriptor {
        Box::into_raw(Box::new(ArenaDescriptor::new(
            std::ptr::null_mut(),
            block_count,
            false,
            None,
            false,
        )))
    }

    #[test]
    fn reserve_publish_get_round_trips() {
        let registry = ArenaRegistry::new(4);
        let idx = registry.reserve_index().unwrap();
        unsafe { registry.publish(idx, leaked(8)) };
        assert!(registry.get(idx).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn exhausted_capacity_returns_none() {
        let registry = ArenaRegistry::new(1);
        assert!(registry.reserve_index().is_some());
        assert!(registry.reserve_index().is_none());
    }

    #[test]
    fn rollback_frees_the_slot_for_reuse() {
        let registry = ArenaRegistry::new(1);
        let idx = registry.reserve_index().unwrap();
        registry.rollback(idx);
        assert!(registry.reserve_index().is_some());
    }

    #[test]
    fn iter_skips_unpublished_slots() {
        let registry = ArenaRegistry::new(4);
        let idx0 = registry.reserve_index().unwrap();
        let _idx1 = registry.reserve_index().unwrap();
        unsafe { registry.publish(idx0, leaked(4)) };
        // idx1 reserved but never published: len() still counts it
        // (append-only cursor), iter() must skip the null slot.
        assert_eq!(registry.iter().count(), 1);
    }
}
