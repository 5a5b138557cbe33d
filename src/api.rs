// # Public Allocation Contract
//
// The malloc-shaped surface the entry-point shims bind to, plus the
// arena API. Pointer-returning calls signal failure with null (and
// errno where the C contract wants it); the arena calls return
// `Result`. A pointer that does not belong to the heap aborts the
// process: silently ignoring it would undermine the address-non-reuse
// guarantee the allocator exists to provide.

use std::ptr::{null_mut, NonNull};

use log::error;

use crate::arena::{heap, Arena};
use crate::error::{AllocError, Result};
use crate::large;
use crate::pool::{FreeOutcome, Pool, PoolKind, PoolRef};
use crate::tcache;
use crate::types::{HALF_PAGE, MAX_LARGE_SIZE, MIN_ALIGNMENT, PAGE_SIZE};

fn abort_bad_pointer(ptr: usize, what: &str) -> ! {
    error!("{} of pointer {:#x} not owned by any pool", what, ptr);
    std::process::abort();
}

fn set_errno(code: i32) {
    errno::set_errno(errno::Errno(code));
}

/// First-entry hook: the background sweeper starts with the first
/// allocator operation, never during global initialization.
#[inline]
fn touch() {
    #[cfg(feature = "sweeper")]
    crate::sweep::ensure_started();
}

/// Route one request through the arena's size-appropriate path.
fn route(arena: &Arena, size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    touch();
    if size <= HALF_PAGE && align <= MIN_ALIGNMENT {
        match tcache::with_cache(arena, |c| c.alloc_small(arena, size)) {
            Some(p) => p,
            // TLS teardown: serve the stray request from the large
            // path, which needs no thread-local state.
            None => large::alloc_large(arena, size.max(MIN_ALIGNMENT), MIN_ALIGNMENT),
        }
    } else if size < MAX_LARGE_SIZE {
        large::alloc_large(arena, size, align)
    } else {
        large::alloc_jumbo(arena, size)
    }
}

/// Allocate at least `size` bytes. A zero size is served as eight
/// bytes. Returns null only when address space is exhausted.
pub fn alloc(size: usize) -> *mut u8 {
    let size = if size == 0 { 8 } else { size };
    route(heap().default_arena(), size, MIN_ALIGNMENT)
}

/// Allocate zeroed memory for `count` items of `size` bytes. Every
/// path hands out memory that has never been written since the OS
/// provided it (or was explicitly zeroed on certified reuse), so no
/// extra clearing pass is needed.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    match count.checked_mul(size) {
        Some(total) => alloc(total),
        None => null_mut(),
    }
}

fn lookup(ptr: usize) -> Option<&'static Pool> {
    heap().radix.lookup(ptr).map(|p| unsafe { &*p })
}

fn dispatch_free(pool: &Pool, ptr: usize) {
    let outcome = match pool.kind() {
        PoolKind::Small => pool.free_small(ptr),
        PoolKind::Large => pool.free_large(ptr),
        PoolKind::Jumbo => pool.free_jumbo(ptr),
    };
    if outcome == FreeOutcome::DestroyPool {
        let arena = unsafe { &*pool.arena };
        arena.destroy_pool(PoolRef(pool as *const Pool as *mut Pool));
    }
}

/// Free a prior allocation. Freeing null is a no-op; freeing anything
/// the heap does not own aborts.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    touch();
    let addr = ptr as usize;
    match lookup(addr) {
        Some(pool) => dispatch_free(pool, addr),
        None => abort_bad_pointer(addr, "free"),
    }
}

/// Resize a prior allocation, preserving the first
/// `min(old_size, size)` bytes. Shrinking returns the same pointer;
/// growing extends in place when the allocation is the tail of its
/// large pool, and copies otherwise.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }
    let size = if size == 0 { 8 } else { size };
    let addr = ptr as usize;
    let pool = match lookup(addr) {
        Some(pool) => pool,
        None => abort_bad_pointer(addr, "realloc"),
    };
    let old_size = match pool.kind() {
        PoolKind::Small => {
            let pm = pool.page_map(pool.page_index(addr));
            let class = pm.class_size();
            if class == 0 || (addr - pm.start.load(std::sync::atomic::Ordering::Acquire)) % class != 0 {
                abort_bad_pointer(addr, "realloc");
            }
            class
        }
        PoolKind::Large => match pool.large_find(addr) {
            Some((_, start, end)) => {
                if size > end - start && pool.large_grow_in_place(addr, size) {
                    return ptr;
                }
                end - start
            }
            None => abort_bad_pointer(addr, "realloc"),
        },
        PoolKind::Jumbo => pool.len(),
    };
    if size <= old_size {
        return ptr;
    }
    let fresh = alloc(size);
    if !fresh.is_null() {
        unsafe { std::ptr::copy_nonoverlapping(ptr, fresh, old_size) };
        dispatch_free(pool, addr);
    }
    fresh
}

/// Allocate `size` bytes aligned to `align`. `align` must be a power
/// of two of at least 8 and must divide `size`; anything else is
/// EINVAL.
pub fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
    if !align.is_power_of_two() || align < 8 || size == 0 || size % align != 0 {
        set_errno(libc::EINVAL);
        return null_mut();
    }
    if size >= MAX_LARGE_SIZE && align > PAGE_SIZE {
        // Jumbo pools are placed at page granularity; stronger
        // alignment cannot be honored there.
        set_errno(libc::EINVAL);
        return null_mut();
    }
    let p = route(heap().default_arena(), size, align.max(MIN_ALIGNMENT));
    if p.is_null() {
        set_errno(libc::ENOMEM);
    }
    p
}

/// POSIX-shaped aligned allocation. Returns 0, EINVAL, or ENOMEM.
pub fn posix_memalign(out: &mut *mut u8, align: usize, size: usize) -> i32 {
    if !align.is_power_of_two() || align < std::mem::size_of::<*mut u8>() {
        return libc::EINVAL;
    }
    if size >= MAX_LARGE_SIZE && align > PAGE_SIZE {
        return libc::EINVAL;
    }
    let size = if size == 0 { 8 } else { size };
    let p = route(heap().default_arena(), size, align.max(MIN_ALIGNMENT));
    if p.is_null() {
        return libc::ENOMEM;
    }
    *out = p;
    0
}

/// Actual capacity behind a prior allocation; 0 when the pointer is
/// not (or no longer) known to the heap.
pub fn usable_size(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let addr = ptr as usize;
    match lookup(addr) {
        Some(pool) => match pool.kind() {
            PoolKind::Small => pool.page_map(pool.page_index(addr)).class_size(),
            PoolKind::Large => pool
                .large_find(addr)
                .map(|(_, start, end)| end - start)
                .unwrap_or(0),
            PoolKind::Jumbo => pool.len(),
        },
        None => 0,
    }
}

// ---------------------------------------------------------------------
// Arena API
// ---------------------------------------------------------------------

pub fn arena_create() -> Result<u32> {
    heap().create_arena()
}

pub fn arena_destroy(id: u32) -> Result<()> {
    heap().destroy_arena(id)
}

/// Allocate from a specific arena.
pub fn arena_alloc(id: u32, size: usize) -> Result<NonNull<u8>> {
    let arena = heap().arena(id)?;
    let size = if size == 0 { 8 } else { size };
    NonNull::new(route(arena, size, MIN_ALIGNMENT)).ok_or(AllocError::OutOfAddressSpace)
}

/// Free through the arena API. The owning pool is found by address, so
/// this is the common free path.
pub fn arena_free(ptr: *mut u8) {
    free(ptr);
}

/// Stop the background sweeper threads. Memory stays mapped; this is
/// the process-exit hook.
pub fn shutdown() {
    #[cfg(feature = "sweeper")]
    crate::sweep::shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_allocations_are_distinct_and_non_null() {
        let a = alloc(0);
        let b = alloc(0);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        free(a);
        free(b);
    }

    #[test]
    fn calloc_overflow_returns_null() {
        assert!(calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn calloc_memory_reads_zero() {
        let p = calloc(64, 8);
        assert!(!p.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(p, 512) };
        assert!(bytes.iter().all(|&b| b == 0));
        free(p);
    }

    #[test]
    fn aligned_alloc_validates_arguments() {
        assert!(aligned_alloc(3, 48).is_null());
        assert!(aligned_alloc(0, 16).is_null());
        assert!(aligned_alloc(4, 16).is_null());
        assert!(aligned_alloc(64, 65).is_null());

        let p = aligned_alloc(256, 512);
        assert!(!p.is_null());
        assert_eq!(p as usize % 256, 0);
        free(p);
    }

    #[test]
    fn posix_memalign_contract() {
        let mut p: *mut u8 = std::ptr::null_mut();
        assert_eq!(posix_memalign(&mut p, 3, 64), libc::EINVAL);
        assert_eq!(posix_memalign(&mut p, 4, 64), libc::EINVAL);
        assert_eq!(posix_memalign(&mut p, 4096, 100), 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 4096, 0);
        free(p);
    }

    #[test]
    fn usable_size_reports_the_class() {
        let p = alloc(24);
        assert!(usable_size(p) >= 24);
        assert_eq!(usable_size(p), 32);
        free(p);
        assert_eq!(usable_size(std::ptr::null()), 0);
    }

    #[test]
    fn realloc_shrink_keeps_the_pointer() {
        let p = alloc(1 << 13);
        let q = realloc(p, 100);
        assert_eq!(p, q);
        free(q);
    }

    #[test]
    fn realloc_grow_preserves_contents() {
        let p = alloc(256);
        unsafe {
            for i in 0..256 {
                *p.add(i) = (i % 251) as u8;
            }
        }
        let q = realloc(p, 1 << 14);
        assert!(!q.is_null());
        unsafe {
            for i in 0..256 {
                assert_eq!(*q.add(i), (i % 251) as u8);
            }
        }
        free(q);
    }

    #[test]
    fn arena_alloc_uses_the_requested_arena() {
        let id = arena_create().unwrap();
        let p = arena_alloc(id, 64).unwrap();
        let pool = heap().radix.lookup(p.as_ptr() as usize).unwrap();
        assert_eq!(unsafe { &*(*pool).arena }.id, id);
        arena_free(p.as_ptr());
        arena_destroy(id).unwrap();
    }

    #[test]
    fn arena_alloc_on_missing_arena_errors() {
        assert!(arena_alloc(250, 64).is_err());
    }
}
