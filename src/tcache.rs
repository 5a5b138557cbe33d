// # Thread Caches and Small Bins
//
// The hot small-allocation path touches only thread-local state: a bin
// per size class pointing at the page currently being carved up, plus a
// run of pre-assigned pages refilled in bulk from the arena's current
// small pool. Liveness bits are still set atomically, because any
// thread may free a slot that another thread allocated.

use std::cell::RefCell;
use std::mem::size_of;
use std::sync::atomic::AtomicU64;

use crate::arena::{heap, Arena};
use crate::pool::{PageMap, Pool};
use crate::types::{
    bin_alloc_size, bin_max_alloc, bitmap_words, page_status, size_to_bin, MAX_ARENAS, NUM_BINS,
    PAGE_SIZE,
};

/// Per-size-class allocation head.
#[derive(Clone, Copy)]
pub struct Bin {
    next_alloc: usize,
    alloc_count: u32,
    max_alloc: u32,
    alloc_size: u32,
    page_map: *mut PageMap,
}

impl Bin {
    const EMPTY: Bin = Bin {
        next_alloc: 0,
        alloc_count: 0,
        max_alloc: 0,
        alloc_size: 0,
        page_map: std::ptr::null_mut(),
    };
}

pub struct ThreadCache {
    bins: [Bin; NUM_BINS],
    run_pool: *mut Pool,
    run_next: usize,
    run_end: usize,
}

impl ThreadCache {
    fn new() -> Self {
        Self {
            bins: [Bin::EMPTY; NUM_BINS],
            run_pool: std::ptr::null_mut(),
            run_next: 0,
            run_end: 0,
        }
    }

    /// Pull one page off the pre-assigned run, refilling the run from
    /// the arena when it is empty.
    fn take_page(&mut self, arena: &Arena) -> Option<(*mut Pool, usize)> {
        if self.run_next >= self.run_end {
            let (pool, addr, pages) = arena.refill_run()?;
            self.run_pool = pool.0;
            self.run_next = addr;
            self.run_end = addr + pages * PAGE_SIZE;
        }
        let addr = self.run_next;
        self.run_next += PAGE_SIZE;
        Some((self.run_pool, addr))
    }

    /// Serve one small allocation. Null means out of address space.
    pub fn alloc_small(&mut self, arena: &Arena, size: usize) -> *mut u8 {
        let bin_ix = size_to_bin(size);

        #[cfg(feature = "subpage-reuse")]
        if let Some(p) = arena.try_reuse(bin_ix) {
            return p;
        }

        let needs_page = {
            let bin = &self.bins[bin_ix];
            bin.page_map.is_null() || bin.alloc_count == bin.max_alloc
        };
        if needs_page {
            let (pool, page_addr) = match self.take_page(arena) {
                Some(got) => got,
                None => return std::ptr::null_mut(),
            };
            let bin = &mut self.bins[bin_ix];
            let pool = unsafe { &*pool };
            let pm = pool.page_map(pool.page_index(page_addr));
            let class = bin_alloc_size(bin_ix);
            let max_alloc = bin_max_alloc(bin_ix);
            let words = if max_alloc > 64 {
                alloc_zeroed_words(bitmap_words(max_alloc))
            } else {
                std::ptr::null_mut()
            };
            pm.init(page_addr, class, words);
            #[cfg(feature = "subpage-reuse")]
            if max_alloc > 64 {
                pm.init_safemap(alloc_zeroed_words(bitmap_words(max_alloc)));
            }
            bin.page_map = pm as *const PageMap as *mut PageMap;
            bin.next_alloc = page_addr;
            bin.alloc_count = 0;
            bin.max_alloc = max_alloc as u32;
            bin.alloc_size = class as u32;
        }

        let bin = &mut self.bins[bin_ix];
        let pm = unsafe { &*bin.page_map };
        let slot = bin.alloc_count as usize;
        let was_live = pm.set_slot(slot);
        debug_assert!(!was_live);
        let p = bin.next_alloc as *mut u8;
        bin.next_alloc += bin.alloc_size as usize;
        bin.alloc_count += 1;
        if bin.alloc_count == bin.max_alloc {
            pm.set_status(page_status::FULLY_ALLOCATED);
        }
        #[cfg(feature = "sweeper")]
        crate::sweep::trigger::record_small_alloc();
        p
    }
}

fn alloc_zeroed_words(words: usize) -> *mut AtomicU64 {
    let addr = heap().meta.alloc(words * 8);
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, words * 8) };
    addr as *mut AtomicU64
}

// ---------------------------------------------------------------------
// Per-thread cache table
// ---------------------------------------------------------------------

struct CacheTable {
    slots: [*mut ThreadCache; MAX_ARENAS],
}

impl CacheTable {
    fn new() -> Self {
        Self {
            slots: [std::ptr::null_mut(); MAX_ARENAS],
        }
    }
}

impl Drop for CacheTable {
    fn drop(&mut self) {
        let h = heap();
        for slot in self.slots {
            if !slot.is_null() {
                h.meta.free(slot as usize, size_of::<ThreadCache>());
            }
        }
    }
}

thread_local! {
    static CACHES: RefCell<CacheTable> = RefCell::new(CacheTable::new());
}

/// Run `f` on the calling thread's cache for `arena`, creating the
/// cache on first use. Returns None while the thread's TLS is being
/// torn down; the caller falls back to an uncached path.
pub fn with_cache<R>(arena: &Arena, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    CACHES
        .try_with(|cell| {
            let mut table = cell.borrow_mut();
            let slot = &mut table.slots[arena.id as usize];
            if slot.is_null() {
                let addr = heap().meta.alloc(size_of::<ThreadCache>()) as *mut ThreadCache;
                unsafe { std::ptr::write(addr, ThreadCache::new()) };
                *slot = addr;
            }
            f(unsafe { &mut **slot })
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HALF_PAGE, MIN_ALIGNMENT};

    #[test]
    fn small_allocations_are_aligned_and_distinct() {
        let arena = heap().default_arena();
        let mut seen = Vec::new();
        for _ in 0..64 {
            let p = with_cache(arena, |c| c.alloc_small(arena, 24)).unwrap();
            assert!(!p.is_null());
            assert_eq!(p as usize % MIN_ALIGNMENT, 0);
            assert!(!seen.contains(&(p as usize)));
            seen.push(p as usize);
        }
        for &p in &seen {
            crate::api::free(p as *mut u8);
        }
    }

    #[test]
    fn a_page_never_serves_more_than_its_slot_count() {
        let arena = heap().default_arena();
        // 512-byte slots: eight per page.
        let mut ptrs = Vec::new();
        for _ in 0..24 {
            let p = with_cache(arena, |c| c.alloc_small(arena, 512)).unwrap() as usize;
            assert_eq!(p % 512, 0);
            ptrs.push(p);
        }
        let mut per_page = std::collections::HashMap::new();
        for &p in &ptrs {
            *per_page.entry(p & !(PAGE_SIZE - 1)).or_insert(0usize) += 1;
        }
        assert!(per_page.values().all(|&n| n <= 8));
        assert!(per_page.len() >= 3);
        for p in ptrs {
            crate::api::free(p as *mut u8);
        }
    }

    #[test]
    fn largest_small_size_stays_in_a_small_pool() {
        let arena = heap().default_arena();
        let p = with_cache(arena, |c| c.alloc_small(arena, HALF_PAGE)).unwrap();
        assert!(!p.is_null());
        let pool = heap().radix.lookup(p as usize).unwrap();
        assert_eq!(unsafe { &*pool }.kind(), crate::pool::PoolKind::Small);
        crate::api::free(p);
    }
}
