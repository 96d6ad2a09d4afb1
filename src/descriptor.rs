//! Arena descriptor: the per-arena bundle of five atomic bitmaps plus
//! the bookkeeping needed to claim, free, and purge blocks within one
//! reserved region (spec.md §4.2).
//!
//! Each bit in every bitmap here corresponds to the same `BLOCK_SIZE`
//! slice of the arena's backing memory; a multi-block allocation claims
//! a run of consecutive bits the way the teacher's page-level
//! `Bitfield` claims a run of consecutive object slots, just widened to
//! cross word boundaries via `Bitmap`.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::bitmap::Bitmap;
use crate::common::BLOCK_SIZE;
use crate::error::ArenaDiagnostic;
use crate::memid::MemoryId;
use crate::os::{OsPrimitives, Protection};

/// No purge currently scheduled for this arena.
const NO_PURGE_SCHEDULED: i64 = i64::MIN;

/// Result of a successful `ArenaDescriptor::try_claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub bit_index: usize,
    pub initially_zero: bool,
    pub initially_committed: bool,
}

/// Bookkeeping and bitmaps for one reserved arena.
pub struct ArenaDescriptor {
    base: *mut u8,
    block_count: usize,

    /// 1 = block is handed out to a caller.
    inuse: Bitmap,
    /// 1 = block has been written to since it was last committed.
    dirty: Bitmap,
    /// 1 = block's backing pages are resident. `None` when the whole
    /// arena was eagerly committed up front (every block always
    /// resident, so tracking is unnecessary).
    committed: Option<Bitmap>,
    /// 1 = block is queued for purge once its deferral window elapses.
    purge: Option<Bitmap>,
    /// 1 = block belonged to a thread that exited without freeing it.
    abandoned: Bitmap,

    /// Hint word index for the next `try_find_and_claim_across` scan.
    search_idx: AtomicUsize,
    /// Timestamp (ms) the earliest scheduled purge becomes due, or
    /// `NO_PURGE_SCHEDULED`.
    purge_expire: AtomicI64,

    numa_node: Option<i32>,
    is_pinned: bool,
    /// Only returned to callers whose request names this arena's id
    /// explicitly (spec.md invariant I6).
    exclusive: bool,
    /// Skipped by allocation requests made with `allow_large = false`.
    is_large: bool,
    /// Provenance of the descriptor's own backing storage (the static
    /// meta-arena, ordinarily), kept so `arenas_unsafe_destroy_all` knows
    /// how to release it.
    meta_memid: MemoryId,
    /// Whether never-yet-dirtied blocks in this arena are guaranteed
    /// zero (true for fresh anonymous OS memory; may be false for a
    /// region registered via `manage_os_memory` with `is_zero = false`).
    region_initially_zero: bool,
}

unsafe impl Send for ArenaDescriptor {}
unsafe impl Sync for ArenaDescriptor {}

impl ArenaDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: *mut u8,
        block_count: usize,
        eager_commit: bool,
        numa_node: Option<i32>,
        is_pinned: bool,
    ) -> Self {
        Self::with_provenance(
            base,
            block_count,
            eager_commit,
            numa_node,
            is_pinned,
            false,
            false,
            MemoryId::NONE,
            true,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_provenance(
        base: *mut u8,
        block_count: usize,
        eager_commit: bool,
        numa_node: Option<i32>,
        is_pinned: bool,
        exclusive: bool,
        is_large: bool,
        meta_memid: MemoryId,
        region_initially_zero: bool,
    ) -> Self {
        let inuse = Bitmap::new(block_count);
        let dirty = Bitmap::new(block_count);
        let committed = if eager_commit {
            None
        } else {
            Some(Bitmap::new(block_count))
        };
        let purge = Some(Bitmap::new(block_count));
        let abandoned = Bitmap::new(block_count);

        ArenaDescriptor {
            base,
            block_count,
            inuse,
            dirty,
            committed,
            purge,
            abandoned,
            search_idx: AtomicUsize::new(0),
            purge_expire: AtomicI64::new(NO_PURGE_SCHEDULED),
            numa_node,
            is_pinned,
            exclusive,
            is_large,
            meta_memid,
            region_initially_zero,
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn numa_node(&self) -> Option<i32> {
        self.numa_node
    }

    pub fn is_pinned(&self) -> bool {
        self.is_pinned
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_large(&self) -> bool {
        self.is_large
    }

    pub fn meta_memid(&self) -> MemoryId {
        self.meta_memid
    }

    /// Whether the whole arena was committed up front (no per-block
    /// `committed` bitmap to track).
    pub fn committed_eagerly(&self) -> bool {
        self.committed.is_none()
    }

    pub fn region_initially_zero(&self) -> bool {
        self.region_initially_zero
    }

    /// Permanently marks the last block as never-claimable when the
    /// arena's usable region isn't an exact multiple of `BLOCK_SIZE`
    /// (spec.md invariant I7, e.g. an externally-managed region wrapped
    /// via `manage_os_memory`).
    pub fn mark_partial_tail_unusable(&self) {
        if self.block_count > 0 {
            self.inuse.mark_tail_set(self.block_count - 1);
        }
    }

    pub fn free_block_count(&self) -> usize {
        self.block_count - self.inuse.count_ones()
    }

    pub fn block_ptr(&self, bit_index: usize) -> *mut u8 {
        unsafe { self.base.add(bit_index * BLOCK_SIZE) }
    }

    /// Attempts to claim `blocks` consecutive blocks, starting the scan
    /// at this descriptor's rolling hint (spec.md §4.3 steps 1-6).
    pub fn try_claim(&self, blocks: usize, commit_now: bool, os: &dyn OsPrimitives) -> Option<ClaimOutcome> {
        let hint = self.search_idx.load(Ordering::Relaxed);
        let bit_index = self.inuse.try_find_and_claim_across(hint, blocks)?;
        self.search_idx.store(
            (bit_index + blocks) % self.inuse.field_count().max(1),
            Ordering::Relaxed,
        );

        // Clear any stale purge scheduling on the blocks we just reused
        // (step 4: a pending purge must not decommit a block now in use).
        if let Some(purge) = &self.purge {
            purge.unclaim_across(blocks, bit_index);
        }
        self.abandoned.unclaim_across(blocks, bit_index);

        // Step 5: claim the dirty bits for the range now (not at free
        // time) — a block never dirtied since it was last purged (or
        // since arena creation) still holds the OS's zero-fill guarantee,
        // and `claim_across` reporting no previously-set bits is exactly
        // that "never dirtied" condition.
        let any_previously_dirty = self.dirty.claim_across(blocks, bit_index);
        let initially_zero = self.region_initially_zero && !any_previously_dirty;

        // Step 6: commit policy.
        let initially_committed = match &self.committed {
            None => true,
            Some(committed) if commit_now => {
                if committed.is_claimed_across(blocks, bit_index) {
                    true
                } else if os.commit(self.block_ptr(bit_index), blocks * BLOCK_SIZE) {
                    committed.claim_across(blocks, bit_index);
                    true
                } else {
                    false
                }
            }
            Some(committed) => committed.is_claimed_across(blocks, bit_index),
        };

        Some(ClaimOutcome {
            bit_index,
            initially_zero,
            initially_committed,
        })
    }

    /// Frees a previously-claimed run. Returns `Err(DoubleFree)` if any
    /// block in the run was already free. The dirty bitmap is left
    /// untouched here — it's claimed at `try_claim` time and cleared at
    /// purge time, not touched on free.
    pub fn free(&self, bit_index: usize, blocks: usize, arena_index: usize) -> Result<(), ArenaDiagnostic> {
        let all_were_set = self.inuse.unclaim_across(blocks, bit_index);
        if !all_were_set {
            return Err(ArenaDiagnostic::DoubleFree {
                arena_index,
                bit_index,
            }
            .logged());
        }
        Ok(())
    }

    /// spec.md §4.5: marks `[bit_index, bit_index + blocks)` entirely
    /// uncommitted, used when a caller reports freeing a range that was
    /// only partially committed. Conservative: the whole range must be
    /// recommitted before its next use even though part of it may still
    /// be resident.
    pub fn mark_range_uncommitted(&self, bit_index: usize, blocks: usize, os: &dyn OsPrimitives, secure_level: u8) {
        if let Some(committed) = &self.committed {
            committed.unclaim_across(blocks, bit_index);
        }
        if secure_level >= 2 {
            os.protect(self.block_ptr(bit_index), blocks * BLOCK_SIZE, Protection::NoAccess);
        }
    }

    /// Schedules the run `[bit_index, bit_index + blocks)` for purge at
    /// `now_ms + delay_ms`, and records the arena-wide earliest
    /// deadline.
    pub fn schedule_purge(&self, bit_index: usize, blocks: usize, now_ms: i64, delay_ms: i64) {
        if let Some(purge) = &self.purge {
            purge.claim_across(blocks, bit_index);
            let deadline = now_ms.saturating_add(delay_ms);
            self.purge_expire
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    if current == NO_PURGE_SCHEDULED || deadline < current {
                        Some(deadline)
                    } else {
                        None
                    }
                })
                .ok();
        }
    }

    /// Whether a purge sweep is due at `now_ms`.
    pub fn purge_due(&self, now_ms: i64, force: bool) -> bool {
        if force {
            return self.purge.is_some();
        }
        let expire = self.purge_expire.load(Ordering::Acquire);
        expire != NO_PURGE_SCHEDULED && now_ms >= expire
    }

    /// Sweeps every run scheduled for purge, re-acquiring `inuse` for
    /// each run first (skipping it if the run was reallocated in the
    /// meantime) and calling `os.purge`/`os.protect` on success. Returns
    /// the number of blocks actually purged.
    ///
    /// If a run couldn't be claimed (still in use), it stays scheduled
    /// and the sweep reschedules the arena's deadline for
    /// `now_ms + retry_delay_ms` instead of clearing it, so a later
    /// sweep retries it.
    pub fn purge_sweep(
        &self,
        os: &dyn OsPrimitives,
        decommits: bool,
        secure_level: u8,
        now_ms: i64,
        retry_delay_ms: i64,
    ) -> usize {
        let purge = match &self.purge {
            Some(p) => p,
            None => return 0,
        };

        let mut purged = 0;
        let mut fully_purged = true;
        for word_idx in 0..purge.field_count() {
            for (start, len) in purge.runs_in_field(word_idx) {
                if !self.inuse.try_claim_one(start, len) {
                    // Still (or again) in use; leave scheduled.
                    fully_purged = false;
                    continue;
                }
                let ptr = self.block_ptr(start);
                let size = len * BLOCK_SIZE;
                let needs_recommit = os.purge(ptr, size, decommits);
                if secure_level >= 2 {
                    os.protect(ptr, size, Protection::NoAccess);
                }
                if needs_recommit {
                    if let Some(committed) = &self.committed {
                        committed.unclaim_across(len, start);
                    }
                }
                self.dirty.unclaim_across(len, start);
                purge.unclaim_across(len, start);
                self.inuse.unclaim_across(len, start);
                purged += len;
            }
        }
        if fully_purged {
            self.purge_expire.store(NO_PURGE_SCHEDULED, Ordering::Release);
        } else {
            self.purge_expire.store(now_ms.saturating_add(retry_delay_ms), Ordering::Release);
        }
        purged
    }

    pub fn mark_abandoned(&self, bit_index: usize, blocks: usize) {
        self.abandoned.claim_across(blocks, bit_index);
    }

    pub fn take_abandoned(&self, bit_index: usize, blocks: usize) -> bool {
        self.abandoned.unclaim_across(blocks, bit_index)
    }

    pub fn abandoned_count(&self) -> usize {
        self.abandoned.count_ones()
    }

    #[cfg(test)]
    pub(crate) fn committed_is_claimed_for_test(&self, bit_index: usize, blocks: usize) -> bool {
        match &self.committed {
            None => true,
            Some(committed) => committed.is_claimed_across(blocks, bit_index),
        }
    }
}
