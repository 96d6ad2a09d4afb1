//! Deferred purge engine: a single-writer try-lock sweep over every
//! registered arena (spec.md §4.6).
//!
//! Grounded in the same "one writer at a time, everyone else skips
//! rather than blocks" shape as the teacher's page-allocation fast path
//! (`fetch_and` claim-or-move-on): here the thing being claimed is the
//! right to run a sweep at all, via an `AtomicBool` swapped from false
//! to true. Callers that lose the race simply return immediately; the
//! next allocation or free on any thread will try again.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::os::OsPrimitives;
use crate::registry::ArenaRegistry;

/// Coordinates purge sweeps across a registry so at most one thread
/// ever runs one at a time.
pub struct PurgeEngine {
    guard: AtomicBool,
}

impl PurgeEngine {
    pub fn new() -> Self {
        PurgeEngine {
            guard: AtomicBool::new(false),
        }
    }

    /// Attempts to run a sweep over every arena in `registry` whose
    /// purge deadline is due. If `force` is set, sweeps every arena
    /// regardless of deadline. If `visit_all` is false, stops after the
    /// first arena that yields any purged blocks (the common case: one
    /// recently-freed arena accounts for most pending purges).
    ///
    /// Returns `None` if another thread already holds the sweep lock;
    /// `Some(total_blocks_purged)` otherwise. `retry_delay_ms` is the
    /// deadline offset a descriptor reschedules itself for when a sweep
    /// couldn't fully purge it (some run was still in use).
    #[allow(clippy::too_many_arguments)]
    pub fn arenas_try_purge(
        &self,
        registry: &ArenaRegistry,
        os: &dyn OsPrimitives,
        now_ms: i64,
        decommits: bool,
        secure_level: u8,
        retry_delay_ms: i64,
        force: bool,
        visit_all: bool,
    ) -> Option<usize> {
        if self
            .guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            log::trace!("purge sweep already in progress, skipping");
            return None;
        }

        let mut total = 0;
        for (index, descriptor) in registry.iter() {
            if !descriptor.purge_due(now_ms, force) {
                continue;
            }
            let purged = descriptor.purge_sweep(os, decommits, secure_level, now_ms, retry_delay_ms);
            if purged > 0 {
                log::debug!("purged {purged} blocks from arena {index}");
                total += purged;
                if !visit_all {
                    break;
                }
            }
        }

        self.guard.store(false, Ordering::Release);
        Some(total)
    }
}

impl Default for PurgeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ArenaDescriptor;
    use crate::os::mock::MockOs;

    #[test]
    fn sweep_purges_due_arenas_and_releases_lock() {
        let registry = ArenaRegistry::new(2);
        let os = MockOs::new();
        let idx = registry.reserve_index().unwrap();
        let descriptor = ArenaDescriptor::new(std::ptr::null_mut(), 4, false, None, false);
        let claimed = descriptor.try_claim(2, false, &os).unwrap().bit_index;
        descriptor.free(claimed, 2, 0).unwrap();
        descriptor.schedule_purge(claimed, 2, 0, 0);
        unsafe { registry.publish(idx, Box::into_raw(Box::new(descriptor))) };

        let engine = PurgeEngine::new();
        let purged = engine
            .arenas_try_purge(&registry, &os, 100, true, 0, 1_000, false, true)
            .expect("sweep should acquire the lock");
        assert_eq!(purged, 2);

        // Lock was released; a second sweep can run immediately.
        let purged_again = engine.arenas_try_purge(&registry, &os, 100, true, 0, 1_000, false, true);
        assert_eq!(purged_again, Some(0));
    }

    #[test]
    fn concurrent_sweep_is_skipped() {
        let registry = ArenaRegistry::new(1);
        let os = MockOs::new();
        let engine = PurgeEngine::new();
        engine.guard.store(true, Ordering::SeqCst);
        assert!(engine
            .arenas_try_purge(&registry, &os, 0, true, 0, 1_000, false, true)
            .is_none());
    }
}
