//! Abandoned-segment tracking (spec.md §4.7).
//!
//! When a thread exits while still holding arena blocks it never freed,
//! those blocks are marked `abandoned` rather than silently leaked. The
//! per-thread heap that owns segment lifetimes is out of scope for this
//! crate (spec.md §1 Non-goals); what lives here is the narrow interface
//! that layer calls into: `mark_abandoned`/`clear_abandoned` operate on
//! one already-known location, and `clear_abandoned_next` scans for a
//! candidate a caller doesn't yet know about.
//!
//! Reclaim is two-phase by design: `clear_abandoned_next` only unclaims
//! the `abandoned` bit and hands back the location; it does not touch
//! `inuse`, so the segment is still considered allocated until whoever
//! adopts it either frees it (ordinary `arena_free`) or starts reusing
//! it directly. This mirrors the teacher's `free_list`/`pending_free_list`
//! split: one structure marks candidates, a second step claims one.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::registry::ArenaRegistry;

/// A resumable position for scanning the registry for abandoned runs,
/// shared across threads so concurrent `clear_abandoned_next` callers
/// fan out over different arenas instead of racing on the same one.
/// Corresponds to spec.md's `{start_arena, count, bitmap_idx}` cursor;
/// `bitmap_idx` is folded into the per-arena bit scan below rather than
/// tracked separately, since `ArenaDescriptor` already exposes a
/// `Bitmap` that can be scanned bit-by-bit without external state.
pub struct Cursor {
    arena_index: AtomicUsize,
}

impl Cursor {
    /// Creates a cursor starting at `start_arena` (spec.md: "initially
    /// randomized per heap to spread scan load" — the random seed is the
    /// caller's responsibility; this only tracks the rolling position).
    pub fn starting_at(start_arena: usize) -> Self {
        Cursor {
            arena_index: AtomicUsize::new(start_arena),
        }
    }

    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Marks `blocks` consecutive blocks starting at `bit_index` in arena
    /// `arena_index` as abandoned. The caller is responsible for having
    /// already cleared its own ownership of the segment.
    pub fn mark_abandoned(registry: &ArenaRegistry, arena_index: u32, bit_index: u32, blocks: usize) {
        if let Some(descriptor) = registry.get(arena_index as usize) {
            descriptor.mark_abandoned(bit_index as usize, blocks);
        }
    }

    /// The inverse of `mark_abandoned`: clears the `abandoned` bits for a
    /// location the caller already knows about (e.g. it is re-adopting a
    /// segment it previously abandoned itself). Returns whether every bit
    /// in the range was actually marked abandoned.
    pub fn clear_abandoned(registry: &ArenaRegistry, arena_index: u32, bit_index: u32, blocks: usize) -> bool {
        match registry.get(arena_index as usize) {
            Some(descriptor) => descriptor.take_abandoned(bit_index as usize, blocks),
            None => false,
        }
    }

    /// Scans forward from the cursor for a single abandoned block,
    /// atomically unclaiming its `abandoned` bit on success. Returns
    /// `(arena_index, bit_index)` without touching `inuse`: the caller
    /// must still explicitly decide whether to keep the segment live
    /// (two-phase reclaim, per spec.md).
    pub fn clear_abandoned_next(&self, registry: &ArenaRegistry) -> Option<(u32, u32)> {
        let arena_count = registry.len();
        if arena_count == 0 {
            return None;
        }
        let start = self.arena_index.fetch_add(1, Ordering::Relaxed) % arena_count;

        for offset in 0..arena_count {
            let index = (start + offset) % arena_count;
            let descriptor = match registry.get(index) {
                Some(d) => d,
                None => continue,
            };
            for bit in 0..descriptor.block_count() {
                if descriptor.take_abandoned(bit, 1) {
                    return Some((index as u32, bit as u32));
                }
            }
        }
        None
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Total abandoned block count across every arena in `registry`
/// (spec.md invariant I4's arena-side term; the thread-heap layer adds
/// its own non-arena abandoned segment count on top of this to get the
/// full global count).
pub fn abandoned_count(registry: &ArenaRegistry) -> usize {
    registry.iter().map(|(_, d)| d.abandoned_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ArenaDescriptor;
    use crate::os::mock::MockOs;

    fn publish(registry: &ArenaRegistry, descriptor: ArenaDescriptor) -> usize {
        let idx = registry.reserve_index().unwrap();
        unsafe { registry.publish(idx, Box::into_raw(Box::new(descriptor))) };
        idx
    }

    #[test]
    fn mark_then_clear_round_trips() {
        let registry = ArenaRegistry::new(2);
        let os = MockOs::new();
        let descriptor = ArenaDescriptor::new(std::ptr::null_mut(), 4, false, None, false);
        let idx = descriptor.try_claim(2, false, &os).unwrap().bit_index;
        let arena_index = publish(&registry, descriptor) as u32;

        Cursor::mark_abandoned(&registry, arena_index, idx as u32, 2);
        assert_eq!(abandoned_count(&registry), 2);
        assert!(Cursor::clear_abandoned(&registry, arena_index, idx as u32, 2));
        assert_eq!(abandoned_count(&registry), 0);
    }

    #[test]
    fn clear_abandoned_next_finds_and_unclaims_without_freeing() {
        let registry = ArenaRegistry::new(1);
        let os = MockOs::new();
        let descriptor = ArenaDescriptor::new(std::ptr::null_mut(), 4, false, None, false);
        let idx = descriptor.try_claim(1, false, &os).unwrap().bit_index;
        let arena_index = publish(&registry, descriptor) as u32;
        Cursor::mark_abandoned(&registry, arena_index, idx as u32, 1);

        let cursor = Cursor::new();
        let found = cursor.clear_abandoned_next(&registry);
        assert_eq!(found, Some((arena_index, idx as u32)));

        // The block is still `inuse` (two-phase): a second scan finds
        // nothing further to reclaim, but the block hasn't been freed.
        assert_eq!(cursor.clear_abandoned_next(&registry), None);
        assert_eq!(registry.get(arena_index as usize).unwrap().free_block_count(), 3);
    }

    #[test]
    fn abandoned_count_sums_across_arenas() {
        let registry = ArenaRegistry::new(2);
        let os = MockOs::new();

        let d0 = ArenaDescriptor::new(std::ptr::null_mut(), 4, false, None, false);
        let i0 = d0.try_claim(2, false, &os).unwrap().bit_index;
        let a0 = publish(&registry, d0) as u32;
        Cursor::mark_abandoned(&registry, a0, i0 as u32, 2);

        let d1 = ArenaDescriptor::new(std::ptr::null_mut(), 4, false, None, false);
        let i1 = d1.try_claim(1, false, &os).unwrap().bit_index;
        let a1 = publish(&registry, d1) as u32;
        Cursor::mark_abandoned(&registry, a1, i1 as u32, 1);

        assert_eq!(abandoned_count(&registry), 3);
    }
}
