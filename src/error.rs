//! Non-propagating diagnostics for the arena subsystem.
//!
//! The arena subsystem never panics and never returns an `Err` from its
//! hot paths (`arena_alloc_aligned`, `arena_free`): failures surface as a
//! null pointer or a `false`, with a structured diagnostic logged on the
//! warning channel. `ArenaDiagnostic` is that structured value; the few
//! reservation entry points that do have a natural success/failure
//! outcome (`reserve_os_memory*`, `reserve_huge_os_pages_*`) return it
//! inside a `Result`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaDiagnostic {
    #[error("out of memory: requested {requested} bytes, no arena or OS allocation could serve it")]
    OutOfMemory { requested: usize },

    #[error("invalid arena reference: index {arena_index} ({reason})")]
    InvalidArena {
        arena_index: usize,
        reason: &'static str,
    },

    #[error("double free detected: arena {arena_index} bit {bit_index} was already free")]
    DoubleFree {
        arena_index: usize,
        bit_index: usize,
    },

    #[error("huge pages unavailable: {pages_requested} pages requested")]
    HugePageUnavailable { pages_requested: usize },

    #[error("huge page reservation timed out: {pages_reserved}/{pages_requested} pages reserved")]
    TimeoutExpired {
        pages_requested: usize,
        pages_reserved: usize,
    },
}

impl ArenaDiagnostic {
    /// Logs the diagnostic on the warning channel and returns it, so call
    /// sites can `return Err(diag.logged())` (or just drop it, for the
    /// null/false-returning hot paths) in one expression.
    pub(crate) fn logged(self) -> Self {
        log::warn!("{self}");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_mention_identifiers() {
        let d = ArenaDiagnostic::DoubleFree {
            arena_index: 3,
            bit_index: 7,
        };
        assert!(d.to_string().contains('3'));
        assert!(d.to_string().contains('7'));
    }
}
