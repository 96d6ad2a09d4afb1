//! Lock-free arena subsystem: a shared, cross-thread pool of large
//! fixed-size blocks carved out of OS memory and sub-allocated as
//! backing storage for a mid-tier allocator's segments.
//!
//! See each module's doc comment for the piece of the design it covers;
//! `system::ArenaSystem` is the entry point that bundles them together,
//! and the free functions re-exported here mirror it for callers who
//! want the process-wide default instance instead of an owned handle.

mod abandoned;
mod alloc;
mod bitmap;
mod cache_line;
mod common;
mod config;
mod descriptor;
mod error;
mod memid;
mod os;
mod purge;
mod registry;
mod static_arena;
mod system;

pub use abandoned::{abandoned_count, Cursor as AbandonedCursor};
pub use alloc::{blocks_for, ArenaId};
pub use common::BLOCK_SIZE;
pub use config::{ArenaConfig, EagerCommit};
pub use error::ArenaDiagnostic;
pub use memid::{MemFlags, MemId, MemoryId};
pub use os::{OsPrimitives, Protection, SystemOs};
pub use system::{
    arena_alloc_aligned, arena_area, arena_free, arenas_collect, arenas_unsafe_destroy_all,
    manage_os_memory, manage_os_memory_ex, reserve_huge_os_pages_at,
    reserve_huge_os_pages_interleave, reserve_os_memory, reserve_os_memory_ex, ArenaSystem,
    DEFAULT_MAX_ARENAS,
};
