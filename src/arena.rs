// # Arenas and the Global Heap
//
// The process-wide context: the metadata arena, the radix tree, the
// arena table, and the bounded free-address store. Arenas own the pool
// lists and route destruction; each allocation path borrows an arena
// and draws pools through it.
//
// Destroyed pools take one of two roads. With the sweeper enabled they
// are unlinked, dropped from the radix tree, and parked on the arena's
// pending queue until a cycle proves no reference to their range
// survives anywhere in scanned memory. Without the sweeper the range
// is retired on the spot: decommitted for small pools (the reservation
// stays, so the addresses remain dead) and unmapped for the rest.

use std::mem::size_of;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam::queue::ArrayQueue;
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{AllocError, Result};
use crate::metadata::MetaArena;
use crate::os::{suspend, vm};
#[cfg(feature = "subpage-reuse")]
use crate::pool::PageMap;
use crate::pool::{Pool, PoolKind, PoolRef};
use crate::radix::RadixTree;
use crate::types::{
    FREE_STORE_CAPACITY, MAX_ARENAS, MAX_LARGE_LISTS, PAGES_PER_REFILL, POOL_SIZE,
};
#[cfg(feature = "subpage-reuse")]
use crate::types::NUM_BINS;

/// Pending-queue capacity per arena. Overflow retires ranges without
/// certification, which forfeits reuse but never address safety.
#[cfg(feature = "sweeper")]
const PENDING_CAPACITY: usize = 65536;

pub struct LargeList {
    pub pools: Mutex<Vec<PoolRef>>,
}

pub struct Arena {
    pub id: u32,
    current_small: AtomicPtr<Pool>,
    small_lock: Mutex<()>,
    pub small_pools: Mutex<Vec<PoolRef>>,
    pub large_lists: Box<[LargeList]>,
    pub inactive_large: Mutex<Vec<PoolRef>>,
    pub jumbo_pools: Mutex<Vec<PoolRef>>,
    /// Destroyed pools awaiting sweeper certification. Bounded so the
    /// sweeper can pop and re-push entries while mutators are parked
    /// without ever allocating queue storage.
    #[cfg(feature = "sweeper")]
    pub pending: ArrayQueue<PoolRef>,
    /// Per-bin lists of page maps with sweeper-certified free slots.
    /// Heads are raw `*mut PageMap` stored as usize, chained through
    /// `PageMap::next_reuse`.
    #[cfg(feature = "subpage-reuse")]
    reuse: Box<[Mutex<usize>]>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn create(id: u32, meta: &MetaArena) -> *mut Arena {
        let lists = num_cpus::get().clamp(1, MAX_LARGE_LISTS);
        let large_lists = (0..lists)
            .map(|_| LargeList { pools: Mutex::new(Vec::new()) })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let arena = Arena {
            id,
            current_small: AtomicPtr::new(std::ptr::null_mut()),
            small_lock: Mutex::new(()),
            small_pools: Mutex::new(Vec::new()),
            large_lists,
            inactive_large: Mutex::new(Vec::new()),
            jumbo_pools: Mutex::new(Vec::new()),
            #[cfg(feature = "sweeper")]
            pending: ArrayQueue::new(PENDING_CAPACITY),
            #[cfg(feature = "subpage-reuse")]
            reuse: (0..NUM_BINS).map(|_| Mutex::new(0)).collect::<Vec<_>>().into_boxed_slice(),
        };
        let storage = meta.alloc_node(size_of::<Arena>()) as *mut Arena;
        unsafe { std::ptr::write(storage, arena) };
        storage
    }

    // -----------------------------------------------------------------
    // Pool creation
    // -----------------------------------------------------------------

    /// Hand a run of pages from the current small pool to a thread
    /// cache, retiring the pool and creating a new one when exhausted.
    pub fn refill_run(&self) -> Option<(PoolRef, usize, usize)> {
        loop {
            let cur = self.current_small.load(Ordering::Acquire);
            if !cur.is_null() {
                if let Some((addr, pages)) = unsafe { &*cur }.bump_pages(PAGES_PER_REFILL) {
                    return Some((PoolRef(cur), addr, pages));
                }
            }
            let _g = self.small_lock.lock();
            if self.current_small.load(Ordering::Acquire) != cur {
                // Another thread already installed a fresh pool.
                continue;
            }
            let fresh = self.new_small_pool()?;
            self.small_pools.lock().push(fresh);
            self.current_small.store(fresh.0, Ordering::Release);
        }
    }

    /// New small pool, reusing a sweeper-certified address if one is
    /// banked in the free-address store.
    fn new_small_pool(&self) -> Option<PoolRef> {
        let h = heap();
        let addr = match h.free_store.pop() {
            Some(reused) if vm::commit(reused, POOL_SIZE) => {
                debug!("small pool reusing certified range {:#x}", reused);
                reused
            }
            _ => vm::alloc_highwater(POOL_SIZE).ok()?,
        };
        let storage = h.meta.alloc_node(size_of::<Pool>()) as *mut Pool;
        Pool::init_small(storage, addr, self as *const Arena, h.meta.alloc_page_maps());
        h.radix.insert(&h.meta, storage);
        debug!("small pool created at {:#x}", addr);
        Some(PoolRef(storage))
    }

    pub fn new_large_pool(&self) -> Option<PoolRef> {
        let h = heap();
        let addr = vm::alloc_highwater(POOL_SIZE).ok()?;
        let storage = h.meta.alloc_node(size_of::<Pool>()) as *mut Pool;
        Pool::init_large(storage, addr, self as *const Arena, h.meta.alloc_tracking());
        h.radix.insert(&h.meta, storage);
        debug!("large pool created at {:#x}", addr);
        Some(PoolRef(storage))
    }

    pub fn new_jumbo_pool(&self, len: usize) -> Option<PoolRef> {
        let h = heap();
        let addr = vm::alloc_highwater(len).ok()?;
        let storage = h.meta.alloc_node(size_of::<Pool>()) as *mut Pool;
        Pool::init_jumbo(storage, addr, len, self as *const Arena);
        h.radix.insert(&h.meta, storage);
        self.jumbo_pools.lock().push(PoolRef(storage));
        debug!("jumbo pool created at {:#x} ({} bytes)", addr, len);
        Some(PoolRef(storage))
    }

    // -----------------------------------------------------------------
    // Destruction
    // -----------------------------------------------------------------

    fn unlink(&self, pr: PoolRef) {
        if self.current_small.load(Ordering::Acquire) == pr.0 {
            self.current_small.store(std::ptr::null_mut(), Ordering::Release);
        }
        self.small_pools.lock().retain(|&p| p != pr);
        for list in self.large_lists.iter() {
            list.pools.lock().retain(|&p| p != pr);
        }
        self.inactive_large.lock().retain(|&p| p != pr);
        self.jumbo_pools.lock().retain(|&p| p != pr);
    }

    /// Retire a fully freed pool. The radix entry goes away at once so
    /// dangling pointers into the range abort instead of resolving.
    pub fn destroy_pool(&self, pr: PoolRef) {
        let h = heap();
        self.unlink(pr);
        h.radix.remove(pr.0);
        #[cfg(feature = "sweeper")]
        {
            if self.pending.push(pr).is_err() {
                // Queue full: retire the range now. Certification only
                // gates address reuse, never address death.
                finalize_pool(pr, false);
            }
            return;
        }
        #[cfg(not(feature = "sweeper"))]
        finalize_pool(pr, false);
    }

    /// Snapshot every live pool for the sweeper's root set, pushing
    /// only into `out`'s existing capacity. Sets `overflow` instead of
    /// growing, because one caller runs while mutators are parked.
    #[cfg(feature = "sweeper")]
    pub fn live_pools_bounded(&self, out: &mut Vec<PoolRef>, overflow: &mut bool) {
        let mut push = |pr: PoolRef| {
            if out.len() == out.capacity() {
                *overflow = true;
            } else {
                out.push(pr);
            }
        };
        for &pr in self.small_pools.lock().iter() {
            push(pr);
        }
        for list in self.large_lists.iter() {
            for &pr in list.pools.lock().iter() {
                push(pr);
            }
        }
        for &pr in self.inactive_large.lock().iter() {
            push(pr);
        }
        for &pr in self.jumbo_pools.lock().iter() {
            push(pr);
        }
    }

    // -----------------------------------------------------------------
    // Sub-page reuse
    // -----------------------------------------------------------------

    /// Serve a small allocation from a slot the sweeper certified dead,
    /// if any page in this bin's reuse list still has one.
    #[cfg(feature = "subpage-reuse")]
    pub fn try_reuse(&self, bin_ix: usize) -> Option<*mut u8> {
        use crate::types::page_status;

        let mut head = self.reuse[bin_ix].lock();
        loop {
            let pm_ptr = *head as *mut PageMap;
            if pm_ptr.is_null() {
                return None;
            }
            let pm = unsafe { &*pm_ptr };
            while let Some(slot) = pm.grab_safe_slot() {
                if pm.status() & (page_status::READY_TO_RELEASE | page_status::RETURNED) != 0 {
                    // The page emptied and is being released; give the
                    // slot back and let the release finish.
                    pm.clear_slot(slot);
                    if let Some(pool) = heap().radix.lookup(pm.start.load(Ordering::Acquire)) {
                        if unsafe { &*pool }.try_release_page(pm) == crate::pool::FreeOutcome::DestroyPool {
                            let arena = unsafe { &*(*pool).arena };
                            arena.destroy_pool(PoolRef(pool));
                        }
                    }
                    continue;
                }
                let class = pm.class_size();
                let addr = pm.start.load(Ordering::Acquire) + slot * class;
                unsafe { std::ptr::write_bytes(addr as *mut u8, 0, class) };
                #[cfg(feature = "sweeper")]
                crate::sweep::trigger::record_small_alloc();
                return Some(addr as *mut u8);
            }
            *head = pm.next_reuse.swap(std::ptr::null_mut(), Ordering::AcqRel) as usize;
        }
    }

    /// Chain a page map into the bin's reuse list. Sweeper-only.
    #[cfg(feature = "subpage-reuse")]
    pub fn enqueue_reuse(&self, bin_ix: usize, pm: *mut PageMap) {
        let mut head = self.reuse[bin_ix].lock();
        unsafe { &*pm }.next_reuse.store(*head as *mut PageMap, Ordering::Release);
        *head = pm as usize;
    }

    /// Drop every reuse-list entry pointing into a page-map array that
    /// is about to be recycled.
    #[cfg(feature = "subpage-reuse")]
    pub fn purge_reuse(&self, maps: *mut PageMap, count: usize) {
        let lo = maps as usize;
        let hi = lo + count * size_of::<PageMap>();
        for bin in self.reuse.iter() {
            let mut head = bin.lock();
            let mut cur = *head as *mut PageMap;
            let mut prev: *mut PageMap = std::ptr::null_mut();
            while !cur.is_null() {
                let next = unsafe { &*cur }.next_reuse.load(Ordering::Acquire);
                if (cur as usize) >= lo && (cur as usize) < hi {
                    if prev.is_null() {
                        *head = next as usize;
                    } else {
                        unsafe { &*prev }.next_reuse.store(next, Ordering::Release);
                    }
                } else {
                    prev = cur;
                }
                cur = next;
            }
        }
    }

    #[cfg(feature = "subpage-reuse")]
    pub fn reuse_listed(&self, bin_ix: usize, pm: *const PageMap) -> bool {
        let head = self.reuse[bin_ix].lock();
        let mut cur = *head as *const PageMap;
        while !cur.is_null() {
            if cur == pm {
                return true;
            }
            cur = unsafe { &*cur }.next_reuse.load(Ordering::Acquire);
        }
        false
    }
}

/// Release a destroyed pool's address range. Takes no locks beyond the
/// lock-free radix slots, so it is safe to run while mutators are
/// suspended. Metadata recycling is a separate step
/// (`recycle_pool_metadata`) because the bin locks it takes may be
/// held by a suspended thread. Without the sweeper the metadata is
/// never recycled at all: the descriptor stays resident so any stale
/// list snapshot reads inert metadata instead of recycled memory.
pub fn finalize_pool(pr: PoolRef, to_store: bool) {
    let h = heap();
    let pool = unsafe { pr.get() };
    h.radix.remove(pr.0);
    match pool.kind() {
        PoolKind::Small => {
            vm::decommit(pool.start, pool.len());
            if to_store && h.free_store.push(pool.start).is_err() {
                // Store full: fall back to unmapping the range.
                vm::release(pool.start, pool.len());
            }
        }
        PoolKind::Large | PoolKind::Jumbo => {
            vm::release(pool.start, pool.len());
        }
    }
}

#[cfg(feature = "sweeper")]
pub fn recycle_pool_metadata(pr: PoolRef) {
    let h = heap();
    let pool = unsafe { pr.get() };
    match pool.kind() {
        PoolKind::Small => {
            for i in 0..crate::types::PAGES_PER_POOL {
                let pm = pool.page_map(i);
                let words = pm.word_count() * 8;
                if let Some(ext) = pm.external_words() {
                    h.meta.free(ext as usize, words);
                }
                #[cfg(feature = "subpage-reuse")]
                if let Some(ext) = pm.safemap_words() {
                    h.meta.free(ext as usize, words);
                }
            }
            h.meta.free_page_maps(pool.page_maps);
        }
        PoolKind::Large => {
            h.meta.free_tracking(pool.tracking);
        }
        PoolKind::Jumbo => {}
    }
    h.meta.free(pr.0 as usize, size_of::<Pool>());
}

// ---------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------

pub struct Heap {
    pub meta: MetaArena,
    pub radix: RadixTree,
    arenas: [AtomicPtr<Arena>; MAX_ARENAS],
    /// Bounded ring of certified small-pool addresses available for
    /// exact reuse. Overflow unmaps instead of evicting.
    pub free_store: ArrayQueue<usize>,
    #[cfg(feature = "sweeper")]
    pub sweep: crate::sweep::Sweeper,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

static HEAP: Lazy<Heap> = Lazy::new(Heap::new);

/// The process-wide heap, initialized on first use.
pub fn heap() -> &'static Heap {
    &HEAP
}

impl Heap {
    fn new() -> Self {
        suspend::install();
        let meta = MetaArena::new();
        const NULL_ARENA: AtomicPtr<Arena> = AtomicPtr::new(std::ptr::null_mut());
        let h = Heap {
            radix: RadixTree::new(),
            arenas: [NULL_ARENA; MAX_ARENAS],
            free_store: ArrayQueue::new(FREE_STORE_CAPACITY),
            #[cfg(feature = "sweeper")]
            sweep: crate::sweep::Sweeper::new(),
            meta,
        };
        h.arenas[0].store(Arena::create(0, &h.meta), Ordering::Release);
        h
    }

    pub fn default_arena(&self) -> &Arena {
        unsafe { &*self.arenas[0].load(Ordering::Acquire) }
    }

    pub fn arena(&self, id: u32) -> Result<&Arena> {
        let slot = self
            .arenas
            .get(id as usize)
            .ok_or(AllocError::UnknownArena(id))?;
        let p = slot.load(Ordering::Acquire);
        if p.is_null() {
            Err(AllocError::UnknownArena(id))
        } else {
            Ok(unsafe { &*p })
        }
    }

    pub fn create_arena(&self) -> Result<u32> {
        for id in 0..MAX_ARENAS {
            let slot = &self.arenas[id];
            if slot.load(Ordering::Acquire).is_null() {
                let fresh = Arena::create(id as u32, &self.meta);
                if slot
                    .compare_exchange(std::ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(id as u32);
                }
                // Lost the slot to a racing creator; the fresh arena
                // only holds metadata-arena storage, which is bounded
                // by MAX_ARENAS either way.
            }
        }
        Err(AllocError::ArenaLimit(MAX_ARENAS))
    }

    /// Tear down an arena: every pool it owns is released outright.
    /// Bulk free is the stated contract of arena destruction; the
    /// ranges are unmapped or decommitted, never recycled.
    pub fn destroy_arena(&self, id: u32) -> Result<()> {
        if id == 0 {
            return Err(AllocError::InvalidArgument("default arena is permanent"));
        }
        let slot = self
            .arenas
            .get(id as usize)
            .ok_or(AllocError::UnknownArena(id))?;
        let p = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return Err(AllocError::UnknownArena(id));
        }
        let arena = unsafe { &*p };
        let mut pools = Vec::new();
        pools.extend(arena.small_pools.lock().drain(..));
        for list in arena.large_lists.iter() {
            pools.extend(list.pools.lock().drain(..));
        }
        pools.extend(arena.inactive_large.lock().drain(..));
        pools.extend(arena.jumbo_pools.lock().drain(..));
        arena.current_small.store(std::ptr::null_mut(), Ordering::Release);
        #[cfg(feature = "sweeper")]
        while let Some(pr) = arena.pending.pop() {
            pools.push(pr);
        }
        for pr in pools {
            self.radix.remove(pr.0);
            finalize_pool(pr, false);
        }
        Ok(())
    }

    #[cfg(feature = "sweeper")]
    pub fn each_arena(&self, mut f: impl FnMut(&Arena)) {
        for slot in &self.arenas {
            let p = slot.load(Ordering::Acquire);
            if !p.is_null() {
                f(unsafe { &*p });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_arena_exists() {
        let h = heap();
        assert_eq!(h.default_arena().id, 0);
        assert!(h.arena(0).is_ok());
    }

    #[test]
    fn unknown_arena_is_an_error() {
        let h = heap();
        assert!(matches!(h.arena(9999), Err(AllocError::UnknownArena(_))));
    }

    #[test]
    fn arena_create_and_destroy_roundtrip() {
        let h = heap();
        let id = h.create_arena().unwrap();
        assert!(id > 0);
        assert!(h.arena(id).is_ok());
        h.destroy_arena(id).unwrap();
        assert!(h.arena(id).is_err());
        assert!(matches!(h.destroy_arena(id), Err(AllocError::UnknownArena(_))));
    }

    #[test]
    fn default_arena_cannot_be_destroyed() {
        let h = heap();
        assert!(matches!(
            h.destroy_arena(0),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn refill_grants_disjoint_runs() {
        let arena = heap().default_arena();
        let (pa, a, na) = arena.refill_run().unwrap();
        let (pb, b, nb) = arena.refill_run().unwrap();
        assert!(na >= 1 && nb >= 1);
        if pa == pb {
            assert!(b >= a + na * crate::types::PAGE_SIZE || a >= b + nb * crate::types::PAGE_SIZE);
        }
    }
}
