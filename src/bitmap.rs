//! Word-partitioned atomic bitmap with cross-word run claim/release
//! (spec.md §4.1).
//!
//! This is the generalization of the teacher's single-word `Bitfield`
//! (see `block.rs`'s `fetch_and`/`fetch_add` dance in the now-removed
//! page modules): instead of one `AtomicUsize` holding 63 claimable
//! bits for one page, a `Bitmap` holds an arbitrary number of
//! cache-line-padded words and supports claims that straddle word
//! boundaries, because an arena allocation can span many blocks. The
//! "flip the bit you found free, retry if someone beat you to it" shape
//! is identical; only the run width changes.
//!
//! Spurious failures are allowed for the `try_*` entry points: callers
//! (the allocation path, the purge engine) retry or fall through to an
//! alternative arena rather than treat a CAS miss as fatal.

use std::sync::atomic::{AtomicUsize, Ordering::*};

use crate::cache_line::CacheAligned;
use crate::common::WORD_BITS;

/// A single claimable run of bits, expressed as the words it touches.
struct RunWords {
    /// (word_index, mask) pairs, in order, covering the requested run.
    words: smallvec::SmallVec<[(usize, usize); 4]>,
}

fn run_words(bit_index: usize, run_length: usize) -> RunWords {
    let mut words = smallvec::SmallVec::new();
    let mut remaining = run_length;
    let mut bit = bit_index;
    while remaining > 0 {
        let word_idx = bit / WORD_BITS;
        let offset = bit % WORD_BITS;
        let take = remaining.min(WORD_BITS - offset);
        let mask = if take == WORD_BITS {
            usize::MAX
        } else {
            ((1usize << take) - 1) << offset
        };
        words.push((word_idx, mask));
        bit += take;
        remaining -= take;
    }
    RunWords { words }
}

/// A word-partitioned atomic bitmap over `bits` claimable positions.
pub struct Bitmap {
    words: Box<[CacheAligned<AtomicUsize>]>,
    bits: usize,
}

impl Bitmap {
    /// Creates a bitmap of `bits` positions, all initially clear (0).
    pub fn new(bits: usize) -> Self {
        let field_count = crate::common::field_count_for(bits);
        let words = (0..field_count)
            .map(|_| CacheAligned::new(AtomicUsize::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Bitmap { words, bits }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn field_count(&self) -> usize {
        self.words.len()
    }

    /// Permanently marks the tail bits beyond `live_bits` as set, so the
    /// allocator never hands them out (spec.md invariant I7). Must be
    /// called once, before the bitmap is shared across threads.
    pub fn mark_tail_set(&self, live_bits: usize) {
        if live_bits >= self.bits {
            return;
        }
        let run = run_words(live_bits, self.bits - live_bits);
        for (word_idx, mask) in run.words {
            self.words[word_idx].fetch_or(mask, Relaxed);
        }
    }

    fn is_run_clear(&self, bit_index: usize, run_length: usize) -> bool {
        run_words(bit_index, run_length)
            .words
            .iter()
            .all(|&(word_idx, mask)| self.words[word_idx].load(Relaxed) & mask == 0)
    }

    /// Attempts to claim an exactly-located, already-believed-clear run.
    /// Rolls back any partial claim on conflict. Returns `true` on
    /// success.
    fn try_claim_exact(&self, bit_index: usize, run_length: usize) -> bool {
        let run = run_words(bit_index, run_length);
        let mut claimed = smallvec::SmallVec::<[(usize, usize); 4]>::new();

        for &(word_idx, mask) in &run.words {
            let word = &self.words[word_idx];
            let current = word.load(Relaxed);
            if current & mask != 0 {
                // Someone else claimed part of this run; roll back.
                for (idx, m) in claimed {
                    self.words[idx].fetch_and(!m, Release);
                }
                return false;
            }
            match word.compare_exchange(current, current | mask, AcqRel, Relaxed) {
                Ok(_) => claimed.push((word_idx, mask)),
                Err(_) => {
                    for (idx, m) in claimed {
                        self.words[idx].fetch_and(!m, Release);
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Scans forward from `start_field_hint` (a word index), wrapping,
    /// searching for a cleared run of `run_length` bits. On success,
    /// atomically claims the run and returns its starting bit index.
    pub fn try_find_and_claim_across(
        &self,
        start_field_hint: usize,
        run_length: usize,
    ) -> Option<usize> {
        if run_length == 0 || run_length > self.bits || self.bits == 0 {
            return None;
        }

        let field_count = self.field_count().max(1);
        let start_bit = (start_field_hint % field_count) * WORD_BITS;

        let mut pos = start_bit % self.bits;
        for _ in 0..self.bits {
            if pos + run_length <= self.bits
                && self.is_run_clear(pos, run_length)
                && self.try_claim_exact(pos, run_length)
            {
                return Some(pos);
            }
            pos = (pos + 1) % self.bits;
        }
        None
    }

    /// Forces the bits in `[bit_index, bit_index + run_length)` set.
    /// Returns whether any of them were already set.
    pub fn claim_across(&self, run_length: usize, bit_index: usize) -> bool {
        let mut any_previously_set = false;
        for (word_idx, mask) in run_words(bit_index, run_length).words {
            let previous = self.words[word_idx].fetch_or(mask, AcqRel);
            if previous & mask != 0 {
                any_previously_set = true;
            }
        }
        any_previously_set
    }

    /// Clears the bits in `[bit_index, bit_index + run_length)`. Returns
    /// whether all of them were previously set (double-free detection
    /// when `false`).
    pub fn unclaim_across(&self, run_length: usize, bit_index: usize) -> bool {
        let mut all_previously_set = true;
        for (word_idx, mask) in run_words(bit_index, run_length).words {
            let previous = self.words[word_idx].fetch_and(!mask, AcqRel);
            if previous & mask != mask {
                all_previously_set = false;
            }
        }
        all_previously_set
    }

    /// Returns whether every bit in `[bit_index, bit_index + run_length)`
    /// is set.
    pub fn is_claimed_across(&self, run_length: usize, bit_index: usize) -> bool {
        run_words(bit_index, run_length)
            .words
            .iter()
            .all(|&(word_idx, mask)| self.words[word_idx].load(Acquire) & mask == mask)
    }

    /// A weaker single-step claim at a known location (no search): fails
    /// if any bit in the range is already set, without partially
    /// mutating state on failure. Used by the purge engine to re-acquire
    /// `inuse` before decommitting.
    pub fn try_claim_one(&self, bit_index: usize, run_length: usize) -> bool {
        if bit_index + run_length > self.bits {
            return false;
        }
        self.is_run_clear(bit_index, run_length) && self.try_claim_exact(bit_index, run_length)
    }

    /// Total number of set bits, for introspection/stats.
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Relaxed).count_ones() as usize)
            .sum()
    }

    /// Iterates maximal runs of consecutive set bits within one field
    /// (word) at `word_idx`, yielding `(start_bit, run_length)` pairs
    /// relative to the whole bitmap. Used by the purge sweep to walk
    /// the `purge` bitmap field by field.
    pub fn runs_in_field(&self, word_idx: usize) -> Vec<(usize, usize)> {
        let mut value = self.words[word_idx].load(Acquire);
        let base = word_idx * WORD_BITS;
        let mut runs = Vec::new();
        let mut bit = 0usize;
        while value != 0 && bit < WORD_BITS {
            let start = value.trailing_zeros() as usize;
            if start >= WORD_BITS {
                break;
            }
            let shifted = value >> start;
            let len = (!shifted).trailing_zeros() as usize;
            let len = len.min(WORD_BITS - start);
            if base + start < self.bits {
                let len = len.min(self.bits - (base + start));
                if len > 0 {
                    runs.push((base + start, len));
                }
            }
            let consumed = start + len;
            value = if consumed >= WORD_BITS { 0 } else { value >> consumed << consumed };
            bit = consumed;
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_find_single_word() {
        let bitmap = Bitmap::new(10);
        let idx = bitmap.try_find_and_claim_across(0, 3).unwrap();
        assert_eq!(idx, 0);
        assert!(bitmap.is_claimed_across(3, 0));
        assert!(!bitmap.is_claimed_across(1, 3));
    }

    #[test]
    fn claim_straddles_words() {
        let bitmap = Bitmap::new(130);
        // Fill the first word fully and part of the second so the next
        // free run must straddle the boundary.
        assert!(bitmap.claim_across(64, 0) == false);
        let idx = bitmap.try_find_and_claim_across(0, 10).unwrap();
        assert_eq!(idx, 64);
        assert!(bitmap.is_claimed_across(10, 64));
    }

    #[test]
    fn unclaim_detects_double_free() {
        let bitmap = Bitmap::new(10);
        let idx = bitmap.try_find_and_claim_across(0, 4).unwrap();
        assert!(bitmap.unclaim_across(4, idx));
        assert!(!bitmap.unclaim_across(4, idx), "second free must report partial/none set");
    }

    #[test]
    fn tail_bits_are_permanently_set() {
        let bitmap = Bitmap::new(70);
        bitmap.mark_tail_set(65);
        assert!(bitmap.is_claimed_across(5, 65));
        assert!(bitmap.try_find_and_claim_across(0, 6).is_none());
    }

    #[test]
    fn try_claim_one_fails_on_partial_overlap() {
        let bitmap = Bitmap::new(20);
        bitmap.claim_across(2, 5);
        assert!(!bitmap.try_claim_one(4, 3));
        assert!(bitmap.try_claim_one(10, 3));
    }

    #[test]
    fn runs_in_field_finds_maximal_runs() {
        let bitmap = Bitmap::new(64);
        bitmap.claim_across(3, 2);
        bitmap.claim_across(2, 10);
        let runs = bitmap.runs_in_field(0);
        assert!(runs.contains(&(2, 3)));
        assert!(runs.contains(&(10, 2)));
    }

    proptest::proptest! {
        #[test]
        fn no_double_allocation(ops in proptest::collection::vec(1usize..5, 0..200)) {
            let bitmap = Bitmap::new(256);
            let mut claimed: Vec<(usize, usize)> = Vec::new();
            for run_length in ops {
                if let Some(idx) = bitmap.try_find_and_claim_across(0, run_length) {
                    for &(other_idx, other_len) in &claimed {
                        let overlap = idx < other_idx + other_len && other_idx < idx + run_length;
                        assert!(!overlap, "overlapping claim: {:?} vs {:?}", (idx, run_length), (other_idx, other_len));
                    }
                    claimed.push((idx, run_length));
                }
            }
        }
    }
}
