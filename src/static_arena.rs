//! Static meta-arena: a fixed-size bump allocator for the arena
//! subsystem's own bookkeeping structures (spec.md §9, "static
//! meta-arena").
//!
//! `ArenaDescriptor`s and the registry's backing storage must
//! themselves live somewhere, and that somewhere can't be an ordinary
//! heap allocation without risking the very recursion the arena
//! subsystem exists to avoid (an allocator that allocates through
//! itself to allocate). The teacher's `Pool` grows by pushing fresh
//! blocks with `Vec::push`-style amortized growth; this bump arena
//! takes the same "claim the next chunk and move the cursor" shape but
//! over a single fixed buffer that's carved out once at process start
//! and never grows, since meta-arena storage is tiny and bounded by the
//! number of arenas ever reserved.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::memid::MemoryId;

/// A bump allocator over a caller-supplied fixed-size buffer.
///
/// Allocations never move and are never individually freed; the whole
/// arena is reclaimed at once when the owning `ArenaSystem` is torn
/// down via `arenas_unsafe_destroy_all`.
pub struct StaticArena {
    buffer: Box<[u8]>,
    cursor: AtomicUsize,
}

impl StaticArena {
    pub fn new(capacity: usize) -> Self {
        StaticArena {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed).min(self.buffer.len())
    }

    /// Bump-allocates `size` bytes aligned to `align` (must be a power
    /// of two). Returns `None` if the arena is exhausted.
    pub fn alloc(&self, size: usize, align: usize) -> Option<(*mut u8, MemoryId)> {
        debug_assert!(align.is_power_of_two());
        let base = self.buffer.as_ptr() as usize;
        loop {
            let current = self.cursor.load(Ordering::Relaxed);
            let aligned_offset = (base + current + align - 1) / align * align - base;
            let end = aligned_offset.checked_add(size)?;
            if end > self.buffer.len() {
                log::warn!("static meta-arena exhausted: requested {size} bytes, {} remaining", self.buffer.len().saturating_sub(current));
                return None;
            }
            if self
                .cursor
                .compare_exchange(current, end, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let ptr = unsafe { self.buffer.as_ptr().add(aligned_offset) as *mut u8 };
                let id = MemoryId {
                    id: crate::memid::MemId::Static {
                        offset: aligned_offset as u32,
                        size: size as u32,
                    },
                    flags: crate::memid::MemFlags {
                        initially_zero: true,
                        initially_committed: true,
                        is_pinned: true,
                    },
                };
                return Some((ptr, id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocations_dont_overlap() {
        let arena = StaticArena::new(4096);
        let (a, _) = arena.alloc(64, 8).unwrap();
        let (b, _) = arena.alloc(64, 8).unwrap();
        assert!((b as usize) >= (a as usize) + 64);
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = StaticArena::new(128);
        assert!(arena.alloc(64, 8).is_some());
        assert!(arena.alloc(64, 8).is_some());
        assert!(arena.alloc(64, 8).is_none());
    }

    #[test]
    fn respects_alignment() {
        let arena = StaticArena::new(4096);
        let _ = arena.alloc(3, 1).unwrap();
        let (ptr, _) = arena.alloc(64, 64).unwrap();
        assert_eq!(ptr as usize % 64, 0);
    }
}
