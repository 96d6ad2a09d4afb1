//! Configuration options recognized by the arena core (spec.md §6.3).

/// Eagerness with which newly-reserved arenas commit their backing pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerCommit {
    /// Never eagerly commit; pages are committed lazily on first touch.
    Never,
    /// Always commit the whole arena up front.
    Always,
    /// Commit up front only when the OS reports overcommit is available.
    IfOvercommitAvailable,
}

/// Configuration for the arena subsystem.
///
/// Constructed directly (no builder — the teacher's own configuration
/// surfaces, such as they are, are plain structs too) and validated by
/// `ArenaConfig::new`'s callers at startup; all values are read-only once
/// an `ArenaSystem` is built from them.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Default reservation size for a freshly-created arena, in bytes.
    ///
    /// Default: 1 GiB. Rounded up to a multiple of `BLOCK_SIZE` by the
    /// reservation path.
    pub arena_reserve: u64,

    /// Commit eagerness for newly reserved arenas.
    ///
    /// Default: `IfOvercommitAvailable`.
    pub arena_eager_commit: EagerCommit,

    /// Deferred-purge delay in milliseconds. Negative disables purging
    /// entirely.
    ///
    /// Default: 100 ms.
    pub purge_delay_ms: i64,

    /// Multiplier applied to `purge_delay_ms` for whole-arena purges
    /// (as opposed to per-segment purges the allocator above us may
    /// schedule, out of scope here but sharing the same knob).
    ///
    /// Default: 10.
    pub arena_purge_mult: u32,

    /// `true` selects the decommit policy (`MADV_DONTNEED`-style,
    /// immediate RSS reduction); `false` selects reset
    /// (`MADV_FREE`-style, cheap but lazy).
    ///
    /// Default: `true`.
    pub purge_decommits: bool,

    /// Whether 1 GiB huge pages may be used when reserving new arenas.
    ///
    /// Default: `false`.
    pub allow_large_os_pages: bool,

    /// Disables all arena-backed allocation; every request falls through
    /// to direct OS allocation.
    ///
    /// Default: `false`.
    pub disallow_arena_alloc: bool,

    /// Disables the direct-OS fallback path; requests that can't be
    /// served by an existing or newly reserved arena fail outright.
    ///
    /// Default: `false`.
    pub disallow_os_alloc: bool,

    /// Runs `arenas_unsafe_destroy_all` automatically when the owning
    /// `ArenaSystem` is dropped. Off by default because the operation is
    /// only sound if no other thread still holds pointers into the
    /// arenas.
    ///
    /// Default: `false`.
    pub destroy_on_exit: bool,

    /// Secure level gating how aggressively freed arena pages are made
    /// inaccessible. At `>= 2`, freed-and-uncommitted ranges are
    /// `protect`-ed to `PROT_NONE` in addition to being decommitted
    /// (spec.md §4.5).
    ///
    /// Default: 0.
    pub secure_level: u8,

    /// Optional cap, in bytes, on the total virtual memory this process
    /// will reserve across all arenas. `None` preserves spec.md's
    /// documented (uncapped) behavior of the double-exponential scaling
    /// rule in `reserve_new_arena`; see the Open Question resolution in
    /// DESIGN.md.
    ///
    /// Default: `None`.
    pub max_total_reserve: Option<u64>,
}

impl ArenaConfig {
    pub const DEFAULT_ARENA_RESERVE: u64 = 1024 * 1024 * 1024;
    pub const DEFAULT_PURGE_DELAY_MS: i64 = 100;
    pub const DEFAULT_PURGE_MULT: u32 = 10;

    /// `arena_reserve` rounded up to a whole number of blocks.
    pub fn arena_reserve_blocks(&self) -> u64 {
        let block = crate::common::BLOCK_SIZE as u64;
        (self.arena_reserve + block - 1) / block * block
    }

    /// Effective purge delay after applying the arena multiplier, or
    /// `None` if purging is disabled (`purge_delay_ms < 0`).
    pub fn purge_delay_for_arena(&self) -> Option<i64> {
        if self.purge_delay_ms < 0 {
            None
        } else {
            Some(self.purge_delay_ms.saturating_mul(self.arena_purge_mult as i64))
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            arena_reserve: Self::DEFAULT_ARENA_RESERVE,
            arena_eager_commit: EagerCommit::IfOvercommitAvailable,
            purge_delay_ms: Self::DEFAULT_PURGE_DELAY_MS,
            arena_purge_mult: Self::DEFAULT_PURGE_MULT,
            purge_decommits: true,
            allow_large_os_pages: false,
            disallow_arena_alloc: false,
            disallow_os_alloc: false,
            destroy_on_exit: false,
            secure_level: 0,
            max_total_reserve: None,
        }
    }
}
