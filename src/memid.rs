//! Tagged provenance record handed back to callers on every allocation
//! (spec.md §3, §9).
//!
//! The teacher's `PageTaggedPtr` (see `block.rs`) packs a page pointer,
//! a block index, and a kind tag into one machine word to avoid
//! dereferencing overhead on the hot path. `MemId` generalizes that
//! *idea* — provenance is something you tag a value with, not something
//! you recompute by pointer arithmetic — into a safe, type-checked enum:
//! this crate's `memid` crosses no FFI boundary, so there's no packing
//! benefit to keeping, only the cost of getting the unsafe bit twiddling
//! wrong.

/// Provenance of a pointer handed out by the arena subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemId {
    /// Sub-allocated from an arena.
    Arena {
        arena_index: u32,
        bit_index: u32,
        exclusive: bool,
    },
    /// Allocated directly from the OS (fallback path).
    Os { size: usize },
    /// Allocated from the static meta-arena (used for arena descriptors
    /// themselves, never returned to ordinary callers).
    Static { offset: u32, size: u32 },
    /// Caller-supplied OS memory registered via `manage_os_memory`.
    External,
    /// Sentinel: no allocation happened.
    None,
}

/// Flags carried independently of `MemId`'s provenance variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemFlags {
    /// The first `size` bytes at the returned pointer are known zero.
    pub initially_zero: bool,
    /// The returned pages are already backed by RAM.
    pub initially_committed: bool,
    /// The backing arena can never be decommitted/purged (huge-page
    /// pinned memory).
    pub is_pinned: bool,
}

/// A full allocation result: provenance plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryId {
    pub id: MemId,
    pub flags: MemFlags,
}

impl MemoryId {
    pub const NONE: MemoryId = MemoryId {
        id: MemId::None,
        flags: MemFlags {
            initially_zero: false,
            initially_committed: false,
            is_pinned: false,
        },
    };

    pub fn arena(arena_index: u32, bit_index: u32, exclusive: bool, flags: MemFlags) -> Self {
        MemoryId {
            id: MemId::Arena {
                arena_index,
                bit_index,
                exclusive,
            },
            flags,
        }
    }

    pub fn os(size: usize, flags: MemFlags) -> Self {
        MemoryId {
            id: MemId::Os { size },
            flags,
        }
    }

    /// Returns the arena index and bit index if this id is `Arena`.
    pub fn as_arena(&self) -> Option<(u32, u32, bool)> {
        match self.id {
            MemId::Arena {
                arena_index,
                bit_index,
                exclusive,
            } => Some((arena_index, bit_index, exclusive)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_not_arena() {
        assert_eq!(MemoryId::NONE.as_arena(), None);
    }

    #[test]
    fn arena_round_trips_fields() {
        let flags = MemFlags {
            initially_zero: true,
            initially_committed: false,
            is_pinned: true,
        };
        let id = MemoryId::arena(3, 7, true, flags);
        assert_eq!(id.as_arena(), Some((3, 7, true)));
        assert_eq!(id.flags, flags);
    }
}
