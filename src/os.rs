//! OS primitive interface (spec.md §6.2).
//!
//! The allocation and purge paths never call `mmap`/`mprotect`/`madvise`
//! directly; they go through this trait, so the scenario tests in
//! `alloc.rs` and `purge.rs` can run against a scripted `MockOs` instead
//! of touching real address space. `SystemOs` is the production
//! implementation, unix-only for now (the teacher never targeted
//! non-unix hosts either; see its own absence of any `#[cfg(windows)]`
//! branch anywhere in the crate).

use std::sync::atomic::{AtomicI64, Ordering};

/// Memory protection requested of `OsPrimitives::protect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    ReadWrite,
}

/// Everything the arena subsystem needs from the host OS.
///
/// Implementors must be `Sync`: the allocation and purge paths call
/// through a shared `&dyn OsPrimitives` (or a generic `O: OsPrimitives`)
/// from many threads concurrently.
pub trait OsPrimitives: Send + Sync {
    /// Reserves (and, depending on `commit`, commits) `size` bytes,
    /// aligned to `align`. Returns `None` on failure.
    fn alloc_aligned(&self, size: usize, align: usize, commit: bool) -> Option<*mut u8>;

    /// Releases a region previously returned by `alloc_aligned`.
    ///
    /// # Safety
    /// `ptr`/`size` must exactly match a prior successful allocation.
    unsafe fn free(&self, ptr: *mut u8, size: usize);

    /// Backs `[ptr, ptr + size)` with RAM.
    fn commit(&self, ptr: *mut u8, size: usize) -> bool;

    /// Releases the RAM backing `[ptr, ptr + size)` without releasing
    /// the address range (`decommits: true`) or hints it can be dropped
    /// lazily under memory pressure (`decommits: false`). Returns
    /// `needs_recommit`: whether the range must be explicitly
    /// `commit`-ed again before reuse. Always `false` for a reset hint
    /// (the range stays valid, just reclaimable); `decommits` mirrors
    /// whether the decommit actually went through.
    fn purge(&self, ptr: *mut u8, size: usize, decommits: bool) -> bool;

    /// Changes the protection of `[ptr, ptr + size)`.
    fn protect(&self, ptr: *mut u8, size: usize, protection: Protection) -> bool;

    /// Whether the OS will happily overcommit virtual memory.
    fn has_overcommit(&self) -> bool;

    /// Whether large reservations without immediate commit are cheap
    /// (used to decide `EagerCommit::IfOvercommitAvailable`).
    fn has_virtual_reserve(&self) -> bool;

    /// Attempts to reserve `pages` huge pages (1 GiB each) on NUMA node
    /// `numa_node` (`None` = no preference), giving up after
    /// `timeout_ms` (`None` = no timeout). Returns the number of pages
    /// actually reserved and the base pointer, or `None` if unsupported.
    /// A partial reservation (fewer pages than requested) is reported by
    /// returning `Some((ptr, pages_reserved))` with `pages_reserved <
    /// pages`.
    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        numa_node: Option<i32>,
        timeout_ms: Option<u64>,
    ) -> Option<(*mut u8, usize)>;

    /// Current NUMA node of the calling thread, if known.
    fn numa_node(&self) -> Option<i32>;

    /// Number of NUMA nodes visible to the process.
    fn numa_node_count(&self) -> i32;

    /// Monotonic clock, in milliseconds, used to schedule deferred
    /// purges.
    fn clock_now_ms(&self) -> i64;
}

/// Production `OsPrimitives` backed by the platform's virtual memory
/// calls.
#[derive(Debug, Default)]
pub struct SystemOs {
    start: AtomicI64,
}

impl SystemOs {
    pub fn new() -> Self {
        SystemOs {
            start: AtomicI64::new(0),
        }
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::ptr;

    impl OsPrimitives for SystemOs {
        fn alloc_aligned(&self, size: usize, align: usize, commit: bool) -> Option<*mut u8> {
            if size == 0 {
                return None;
            }
            // Over-allocate by `align` so we can hand back an aligned
            // sub-pointer; the teacher's `Pool` growth path does the
            // analogous thing with `Vec`'s allocator guarantees, but we
            // go straight to the OS here since this *is* the layer the
            // pool would eventually bottom out on.
            let prot = if commit {
                libc::PROT_READ | libc::PROT_WRITE
            } else {
                libc::PROT_NONE
            };
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            let map_size = size + align;
            let raw = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    map_size,
                    prot,
                    flags,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return None;
            }
            let raw = raw as usize;
            let aligned = (raw + align - 1) / align * align;
            Some(aligned as *mut u8)
        }

        unsafe fn free(&self, ptr: *mut u8, size: usize) {
            libc::munmap(ptr as *mut libc::c_void, size);
        }

        fn commit(&self, ptr: *mut u8, size: usize) -> bool {
            unsafe { libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
        }

        fn purge(&self, ptr: *mut u8, size: usize, decommits: bool) -> bool {
            let advice = if decommits {
                libc::MADV_DONTNEED
            } else {
                libc::MADV_FREE
            };
            let ok = unsafe { libc::madvise(ptr as *mut libc::c_void, size, advice) == 0 };
            decommits && ok
        }

        fn protect(&self, ptr: *mut u8, size: usize, protection: Protection) -> bool {
            let prot = match protection {
                Protection::NoAccess => libc::PROT_NONE,
                Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            };
            unsafe { libc::mprotect(ptr as *mut libc::c_void, size, prot) == 0 }
        }

        fn has_overcommit(&self) -> bool {
            true
        }

        fn has_virtual_reserve(&self) -> bool {
            true
        }

        fn alloc_huge_os_pages(
            &self,
            pages: usize,
            _numa_node: Option<i32>,
            _timeout_ms: Option<u64>,
        ) -> Option<(*mut u8, usize)> {
            const HUGE_PAGE_SIZE: usize = 1024 * 1024 * 1024;
            let size = pages.checked_mul(HUGE_PAGE_SIZE)?;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB;
            let raw = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return None;
            }
            Some((raw as *mut u8, pages))
        }

        fn numa_node(&self) -> Option<i32> {
            None
        }

        fn numa_node_count(&self) -> i32 {
            1
        }

        fn clock_now_ms(&self) -> i64 {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0)
        }
    }
}

/// Non-unix fallback: every primitive reports failure/no-support rather
/// than binding a second real backend. This crate's OS surface mirrors
/// the teacher's own unix-only scope; a Windows backend would plug in
/// here the same way (`VirtualAlloc`/`VirtualFree`/`VirtualProtect` in
/// place of `mmap`/`munmap`/`mprotect`, `MEM_RESET` in place of
/// `MADV_FREE`) without changing anything above this module.
#[cfg(not(unix))]
mod fallback_impl {
    use super::*;

    impl OsPrimitives for SystemOs {
        fn alloc_aligned(&self, _size: usize, _align: usize, _commit: bool) -> Option<*mut u8> {
            None
        }

        unsafe fn free(&self, _ptr: *mut u8, _size: usize) {}

        fn commit(&self, _ptr: *mut u8, _size: usize) -> bool {
            false
        }

        fn purge(&self, _ptr: *mut u8, _size: usize, _decommits: bool) -> bool {
            false
        }

        fn protect(&self, _ptr: *mut u8, _size: usize, _protection: Protection) -> bool {
            false
        }

        fn has_overcommit(&self) -> bool {
            false
        }

        fn has_virtual_reserve(&self) -> bool {
            false
        }

        fn alloc_huge_os_pages(
            &self,
            _pages: usize,
            _numa_node: Option<i32>,
            _timeout_ms: Option<u64>,
        ) -> Option<(*mut u8, usize)> {
            None
        }

        fn numa_node(&self) -> Option<i32> {
            None
        }

        fn numa_node_count(&self) -> i32 {
            1
        }

        fn clock_now_ms(&self) -> i64 {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0)
        }
    }
}
