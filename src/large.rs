// # Large and Jumbo Allocation
//
// Requests above the small-bin ceiling draw from per-CPU lists of
// large pools. A list walk probes each pool without its lock; only a
// promising pool is locked and re-checked. When a list outgrows its
// cap the head pool is closed with `trim` and parked on the arena's
// inactive list, where the free path finds it through the radix tree.
//
// Anything at least POOL_SIZE - HALF_PAGE goes into a jumbo pool of
// its own, sized to the request rounded up to a page.

use crate::arena::Arena;
use crate::pool::{FreeOutcome, PoolRef};
use crate::types::{align_up, MAX_POOLS_PER_LIST, MIN_ALIGNMENT, PAGE_SIZE};

fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

/// Allocate from the arena's large pools. Null means out of address
/// space.
pub fn alloc_large(arena: &Arena, size: usize, align: usize) -> *mut u8 {
    let size = align_up(size, MIN_ALIGNMENT);
    let list = &arena.large_lists[current_cpu() % arena.large_lists.len()];

    let snapshot: Vec<PoolRef> = list.pools.lock().clone();
    for pr in &snapshot {
        let pool = unsafe { pr.get() };
        if pool.large_fits(size, align) {
            if let Some(p) = pool.large_allocate(size, align) {
                return p as *mut u8;
            }
        }
    }

    // No pool had room. Re-check the tail under the list lock (another
    // thread may have appended one), else grow the list.
    let mut pools = list.pools.lock();
    if let Some(&tail) = pools.last() {
        if !snapshot.contains(&tail) {
            if let Some(p) = unsafe { tail.get() }.large_allocate(size, align) {
                return p as *mut u8;
            }
        }
    }
    let fresh = match arena.new_large_pool() {
        Some(pr) => pr,
        None => return std::ptr::null_mut(),
    };
    pools.push(fresh);
    let demoted = if pools.len() > MAX_POOLS_PER_LIST {
        Some(pools.remove(0))
    } else {
        None
    };
    drop(pools);

    if let Some(head) = demoted {
        arena.inactive_large.lock().push(head);
        if unsafe { head.get() }.trim() == FreeOutcome::DestroyPool {
            arena.destroy_pool(head);
        }
    }

    match unsafe { fresh.get() }.large_allocate(size, align) {
        Some(p) => p as *mut u8,
        None => std::ptr::null_mut(),
    }
}

/// Allocate a dedicated jumbo pool for one oversized request.
pub fn alloc_jumbo(arena: &Arena, size: usize) -> *mut u8 {
    let len = align_up(size, PAGE_SIZE);
    match arena.new_jumbo_pool(len) {
        Some(pr) => unsafe { pr.get() }.start as *mut u8,
        None => std::ptr::null_mut(),
    }
}
