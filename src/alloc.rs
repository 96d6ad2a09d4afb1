//! Allocation path orchestration (spec.md §4.2, §4.4, §4.5).
//!
//! Everything here is a free function taking the registry, OS
//! primitives, and configuration explicitly, rather than a method on a
//! long-lived object that owns them — the same "no globals, pass state
//! in" discipline spec.md §9's Design Notes ask for, so the scenario
//! tests in this module and in `system.rs` can build a fresh registry
//! per test instead of fighting over process-wide state.
//!
//! The cascading fallback structure (try specific/NUMA-local/any arena
//! → reserve new arena → direct OS) mirrors the teacher's `find_place`
//! loop (scan free list → drain pending-free → allocate new pages →
//! retry), generalized from "one free list" to "registry walk across
//! NUMA passes".

use crate::common::BLOCK_SIZE;
use crate::config::{ArenaConfig, EagerCommit};
use crate::descriptor::ArenaDescriptor;
use crate::error::ArenaDiagnostic;
use crate::memid::{MemFlags, MemId, MemoryId};
use crate::os::OsPrimitives;
use crate::registry::ArenaRegistry;

/// Identifies one arena in a registry. Newtype over the registry index
/// so callers can't accidentally pass a bit index or block count where
/// an arena id is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaId(pub u32);

/// Number of whole blocks needed to cover `size` bytes.
pub fn blocks_for(size: usize) -> usize {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// spec.md §4.2: the six-step allocation algorithm.
#[allow(clippy::too_many_arguments)]
pub fn arena_alloc_aligned(
    registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    config: &ArenaConfig,
    size: usize,
    align: usize,
    commit: bool,
    allow_large: bool,
    req_arena_id: Option<ArenaId>,
    numa_node: Option<i32>,
    preloading: bool,
) -> Option<(*mut u8, MemoryId)> {
    debug_assert!(size > 0);
    debug_assert!(align.is_power_of_two());
    debug_assert!(align <= BLOCK_SIZE);

    // Step 1: globally disabled, unless a specific arena was requested.
    let arena_path_enabled = !config.disallow_arena_alloc || req_arena_id.is_some();
    // Step 2: too small for an arena.
    if arena_path_enabled && size >= BLOCK_SIZE / 2 {
        let needed_blocks = blocks_for(size); // Step 3.

        // Step 4: arena selection and claim.
        if let Some(result) = try_claim_from_registry(
            registry,
            os,
            needed_blocks,
            commit,
            allow_large,
            req_arena_id,
            numa_node,
        ) {
            return Some(result);
        }

        // Step 5: reserve a new arena and retry against it alone.
        if let Some(new_id) = reserve_new_arena(registry, os, config, size, allow_large, req_arena_id.is_some(), preloading) {
            if let Some(result) = claim_in_arena(registry, os, new_id, needed_blocks, commit) {
                return Some(result);
            }
        }
    }

    // Step 6: direct OS fallback.
    if config.disallow_os_alloc {
        ArenaDiagnostic::OutOfMemory { requested: size }.logged();
        return None;
    }
    alloc_os_fallback(os, size, align, commit)
}

fn try_claim_from_registry(
    registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    needed_blocks: usize,
    commit: bool,
    allow_large: bool,
    req_arena_id: Option<ArenaId>,
    numa_node: Option<i32>,
) -> Option<(*mut u8, MemoryId)> {
    if let Some(id) = req_arena_id {
        // A named arena is tried regardless of exclusivity/large-page
        // skip rules: naming it *is* the match (spec.md invariant I6).
        return claim_in_arena(registry, os, id, needed_blocks, commit);
    }

    let candidate = |d: &ArenaDescriptor| -> bool {
        if d.is_exclusive() {
            return false;
        }
        if d.is_large() && !allow_large {
            return false;
        }
        true
    };

    // Pass 1: NUMA-local (or NUMA-agnostic) arenas.
    for (index, descriptor) in registry.iter() {
        if !candidate(descriptor) {
            continue;
        }
        let numa_match = descriptor.numa_node().map_or(true, |n| Some(n) == numa_node);
        if !numa_match {
            continue;
        }
        if let Some(result) = try_claim_one(registry, os, index, descriptor, needed_blocks, commit) {
            return Some(result);
        }
    }

    // Pass 2: cross-NUMA fallback, only when the caller expressed a
    // preference in the first place.
    if numa_node.is_some() {
        for (index, descriptor) in registry.iter() {
            if !candidate(descriptor) {
                continue;
            }
            let cross_numa = descriptor.numa_node().is_some() && descriptor.numa_node() != numa_node;
            if !cross_numa {
                continue;
            }
            if let Some(result) = try_claim_one(registry, os, index, descriptor, needed_blocks, commit) {
                return Some(result);
            }
        }
    }

    None
}

fn claim_in_arena(
    registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    id: ArenaId,
    needed_blocks: usize,
    commit: bool,
) -> Option<(*mut u8, MemoryId)> {
    let descriptor = registry.get(id.0 as usize)?;
    try_claim_one(registry, os, id.0 as usize, descriptor, needed_blocks, commit)
}

fn try_claim_one(
    _registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    index: usize,
    descriptor: &ArenaDescriptor,
    needed_blocks: usize,
    commit: bool,
) -> Option<(*mut u8, MemoryId)> {
    let outcome = descriptor.try_claim(needed_blocks, commit, os)?;
    let ptr = descriptor.block_ptr(outcome.bit_index);
    let flags = MemFlags {
        initially_zero: outcome.initially_zero,
        initially_committed: outcome.initially_committed,
        is_pinned: descriptor.is_pinned(),
    };
    let memid = MemoryId::arena(index as u32, outcome.bit_index as u32, descriptor.is_exclusive(), flags);
    Some((ptr, memid))
}

/// spec.md §4.4: best-effort reservation of a fresh arena.
pub fn reserve_new_arena(
    registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    config: &ArenaConfig,
    req_size: usize,
    allow_large: bool,
    targeted_specific_arena: bool,
    preloading: bool,
) -> Option<ArenaId> {
    if preloading || targeted_specific_arena {
        return None;
    }
    const RESERVED_HEADROOM: usize = 4;
    if registry.len() + RESERVED_HEADROOM >= registry.capacity() {
        log::debug!("arena registry near capacity ({}/{}), refusing new reservation", registry.len(), registry.capacity());
        return None;
    }

    let target = target_reservation_size(registry, config, req_size, os);

    let eager_commit = match config.arena_eager_commit {
        EagerCommit::Never => false,
        EagerCommit::Always => true,
        EagerCommit::IfOvercommitAvailable => os.has_overcommit(),
    };

    let index = registry.reserve_index()?;
    let ptr = match os.alloc_aligned(target, BLOCK_SIZE, eager_commit) {
        Some(ptr) => ptr,
        None => {
            registry.rollback(index);
            ArenaDiagnostic::OutOfMemory { requested: target }.logged();
            return None;
        }
    };
    let is_large = allow_large && config.allow_large_os_pages;
    let descriptor = Box::new(ArenaDescriptor::with_provenance(
        ptr,
        blocks_for(target),
        eager_commit,
        os.numa_node(),
        false,
        false,
        is_large,
        MemoryId::NONE,
        true,
    ));
    unsafe { registry.publish(index, Box::into_raw(descriptor)) };
    log::debug!("reserved new arena {index} of {target} bytes (eager_commit={eager_commit})");
    Some(ArenaId(index as u32))
}

/// spec.md §4.4's target-size policy, including the documented
/// double-exponential scaling for `8 <= arena_count <= 128` and the
/// optional `max_total_reserve` cap (DESIGN.md Open Question resolution).
fn target_reservation_size(registry: &ArenaRegistry, config: &ArenaConfig, req_size: usize, os: &dyn OsPrimitives) -> usize {
    let mut target = config.arena_reserve_blocks() as usize;

    if !os.has_virtual_reserve() {
        target /= 4;
    }

    let arena_count = registry.len();
    if (8..=128).contains(&arena_count) {
        let shift = (arena_count / 8).min(63) as u32;
        target = target.saturating_mul(1usize << shift);
    }

    target = round_up_to_block(target);
    target = target.max(round_up_to_block(req_size));

    if let Some(cap) = config.max_total_reserve {
        let already_reserved: u64 = registry.iter().map(|(_, d)| (d.block_count() * BLOCK_SIZE) as u64).sum();
        let remaining = cap.saturating_sub(already_reserved);
        target = target.min(remaining.max(round_up_to_block(req_size) as u64) as usize);
    }

    target
}

fn round_up_to_block(size: usize) -> usize {
    if size == 0 {
        return BLOCK_SIZE;
    }
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

fn alloc_os_fallback(os: &dyn OsPrimitives, size: usize, align: usize, commit: bool) -> Option<(*mut u8, MemoryId)> {
    let ptr = os.alloc_aligned(size, align, commit)?;
    let flags = MemFlags {
        initially_zero: true,
        initially_committed: commit,
        is_pinned: false,
    };
    Some((ptr, MemoryId { id: MemId::Os { size }, flags }))
}

/// spec.md §4.5: `arena_free`. `committed_size` is how much of `[ptr,
/// ptr + size)` the caller still considers committed; when it's less
/// than `size`, the region is conservatively marked fully uncommitted
/// before it's scheduled for reuse (spec.md §4.5's partial-commit free
/// case — this happens when a partially-committed block was itself
/// freed from a range that had been committed block-by-block).
#[allow(clippy::too_many_arguments)]
pub fn arena_free(
    registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    config: &ArenaConfig,
    ptr: *mut u8,
    size: usize,
    committed_size: usize,
    memid: MemoryId,
    now_ms: i64,
) {
    match memid.id {
        // No committed-bitmap bookkeeping exists for direct OS memory;
        // `committed_size` is accepted for interface parity with the
        // arena case but has nothing further to adjust here.
        MemId::Os { .. } => unsafe { os.free(ptr, size) },
        MemId::Arena { arena_index, bit_index, .. } => {
            free_arena_block(
                registry,
                os,
                config,
                arena_index as usize,
                bit_index as usize,
                size,
                committed_size,
                now_ms,
            );
        }
        MemId::External | MemId::Static { .. } | MemId::None => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn free_arena_block(
    registry: &ArenaRegistry,
    os: &dyn OsPrimitives,
    config: &ArenaConfig,
    arena_index: usize,
    bit_index: usize,
    size: usize,
    committed_size: usize,
    now_ms: i64,
) {
    let descriptor = match registry.get(arena_index) {
        Some(d) => d,
        None => {
            ArenaDiagnostic::InvalidArena {
                arena_index,
                reason: "arena index not present in registry",
            }
            .logged();
            return;
        }
    };
    let blocks = blocks_for(size);

    if descriptor.free(bit_index, blocks, arena_index).is_err() {
        // Diagnostic already logged by `free`; state is unchanged.
        return;
    }

    if descriptor.is_pinned() {
        return;
    }

    if committed_size < size {
        descriptor.mark_range_uncommitted(bit_index, blocks, os, config.secure_level);
    }

    let retry_delay_ms = config.purge_delay_for_arena().unwrap_or(0);
    match config.purge_delay_for_arena() {
        Some(0) => {
            descriptor.schedule_purge(bit_index, blocks, now_ms, 0);
            descriptor.purge_sweep(os, config.purge_decommits, config.secure_level, now_ms, retry_delay_ms);
        }
        Some(delay_ms) => descriptor.schedule_purge(bit_index, blocks, now_ms, delay_ms),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::mock::MockOs;

    fn registry_with_capacity(cap: usize) -> ArenaRegistry {
        ArenaRegistry::new(cap)
    }

    #[test]
    fn single_allocation_round_trip() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let config = ArenaConfig::default();

        let id = reserve_new_arena(&registry, &os, &config, 256 * 1024 * 1024, false, false, false).unwrap();
        assert_eq!(id.0, 0);

        let (ptr, memid) = arena_alloc_aligned(&registry, &os, &config, 80 * 1024 * 1024, 4 * 1024 * 1024, true, false, None, None, false).unwrap();
        let (arena_index, bit_index, _) = memid.as_arena().unwrap();
        assert_eq!(arena_index, 0);
        assert_eq!(bit_index, 0);
        let base = registry.get(0).unwrap().base();
        assert_eq!(ptr, base);

        arena_free(&registry, &os, &config, ptr, 80 * 1024 * 1024, 80 * 1024 * 1024, memid, 0);
        let descriptor = registry.get(0).unwrap();
        assert_eq!(descriptor.free_block_count(), descriptor.block_count());
    }

    #[test]
    fn numa_local_then_cross_numa_fallback() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let config = ArenaConfig::default();

        let a = reserve_new_arena(&registry, &os, &config, BLOCK_SIZE, false, false, false).unwrap();
        // Force node 0, then reserve a second arena and force node 1.
        let descriptor_a = registry.get(a.0 as usize).unwrap();
        let _ = descriptor_a; // node already set from os.numa_node() == Some(0)

        // Build a node-1 arena directly for determinism instead of
        // depending on MockOs's fixed numa_node().
        let idx_b = registry.reserve_index().unwrap();
        let descriptor_b = Box::new(ArenaDescriptor::with_provenance(
            vec![0u8; BLOCK_SIZE].leak().as_mut_ptr(),
            1,
            true,
            Some(1),
            false,
            false,
            false,
            MemoryId::NONE,
            true,
        ));
        unsafe { registry.publish(idx_b, Box::into_raw(descriptor_b)) };

        // Request on node 1 must land on arena B.
        let (_, memid) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, None, Some(1), false).unwrap();
        let (arena_index, _, _) = memid.as_arena().unwrap();
        assert_eq!(arena_index, idx_b as u32);

        // Exhaust arena B; next request on node 1 must cross over to A.
        let (_, memid2) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, None, Some(1), false).unwrap();
        let (arena_index2, _, _) = memid2.as_arena().unwrap();
        assert_eq!(arena_index2, a.0);
    }

    #[test]
    fn exclusive_arena_only_served_by_explicit_request() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let config = ArenaConfig::default();

        let idx = registry.reserve_index().unwrap();
        let descriptor = Box::new(ArenaDescriptor::with_provenance(
            vec![0u8; BLOCK_SIZE].leak().as_mut_ptr(),
            1,
            true,
            None,
            false,
            true,
            false,
            MemoryId::NONE,
            true,
        ));
        unsafe { registry.publish(idx, Box::into_raw(descriptor)) };

        // An untargeted request must never land on the exclusive arena;
        // with no other arena and reservation disabled by small size it
        // falls through to the OS.
        let (_, memid) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, None, None, false).unwrap();
        assert!(memid.as_arena().is_none(), "must not be served by the exclusive arena");

        // An explicit request for that id must succeed.
        let (_, memid2) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, Some(ArenaId(idx as u32)), None, false).unwrap();
        assert_eq!(memid2.as_arena().unwrap().0, idx as u32);
    }

    #[test]
    fn double_free_leaves_state_unchanged() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let config = ArenaConfig::default();
        reserve_new_arena(&registry, &os, &config, BLOCK_SIZE, false, false, false).unwrap();

        let (ptr, memid) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, None, None, false).unwrap();
        arena_free(&registry, &os, &config, ptr, BLOCK_SIZE / 2 + 1, BLOCK_SIZE / 2 + 1, memid, 0);
        let free_count_after_first = registry.get(0).unwrap().free_block_count();

        // Second free of the same memid must not toggle any more bits.
        arena_free(&registry, &os, &config, ptr, BLOCK_SIZE / 2 + 1, BLOCK_SIZE / 2 + 1, memid, 0);
        assert_eq!(registry.get(0).unwrap().free_block_count(), free_count_after_first);
    }

    #[test]
    fn purge_delay_zero_purges_immediately() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let mut config = ArenaConfig::default();
        config.purge_delay_ms = 0;
        reserve_new_arena(&registry, &os, &config, BLOCK_SIZE, false, false, false).unwrap();

        let (ptr, memid) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, None, None, false).unwrap();
        arena_free(&registry, &os, &config, ptr, BLOCK_SIZE / 2 + 1, BLOCK_SIZE / 2 + 1, memid, 0);

        // Immediate purge means the block is free and not pending.
        let descriptor = registry.get(0).unwrap();
        assert!(!descriptor.purge_due(0, true) || descriptor.free_block_count() == descriptor.block_count());
    }

    #[test]
    fn partial_commit_free_marks_whole_range_uncommitted() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let mut config = ArenaConfig::default();
        config.arena_eager_commit = EagerCommit::Never;
        reserve_new_arena(&registry, &os, &config, BLOCK_SIZE, false, false, false).unwrap();

        let (ptr, memid) = arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE / 2 + 1, 8, true, false, None, None, false).unwrap();
        let (_, bit_index, _) = memid.as_arena().unwrap();
        let descriptor = registry.get(0).unwrap();
        let blocks = blocks_for(BLOCK_SIZE / 2 + 1);
        assert!(descriptor.committed_is_claimed_for_test(bit_index as usize, blocks));

        // Caller reports only half the range as committed.
        arena_free(&registry, &os, &config, ptr, BLOCK_SIZE / 2 + 1, (BLOCK_SIZE / 2 + 1) / 2, memid, 0);
        assert!(
            !descriptor.committed_is_claimed_for_test(bit_index as usize, blocks),
            "partially-committed free must mark the whole range uncommitted"
        );
    }

    #[test]
    fn too_small_for_arena_falls_back_to_os() {
        let registry = registry_with_capacity(8);
        let os = MockOs::new();
        let config = ArenaConfig::default();

        let (_, memid) = arena_alloc_aligned(&registry, &os, &config, 1024, 8, true, false, None, None, false).unwrap();
        assert!(matches!(memid.id, MemId::Os { .. }));
    }

    #[test]
    fn disallow_os_alloc_fails_when_arena_path_exhausted() {
        let registry = registry_with_capacity(1);
        let os = MockOs::new();
        let mut config = ArenaConfig::default();
        config.disallow_os_alloc = true;
        // No arenas registered and registry is already "near capacity"
        // (headroom of 4 exceeds capacity of 1), so reservation is
        // refused and the OS path is the only option, which is disabled.
        assert!(arena_alloc_aligned(&registry, &os, &config, BLOCK_SIZE, 8, true, false, None, None, false).is_none());
    }
}
