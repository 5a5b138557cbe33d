// # Page Pools
//
// A pool owns one contiguous address range obtained from the high-water
// reservation. Three variants share the descriptor, distinguished by a
// sentinel in `next_free_index`:
//
// - Small pools hand out 4 KiB pages to thread caches; one `PageMap`
//   per page tracks slot liveness.
// - Large pools bump-allocate arbitrary regions and record each
//   allocation's end pointer in a sorted tracking array.
// - Jumbo pools hold exactly one allocation and no auxiliary metadata.
//
// Freed memory is never handed out again; the free paths only clear
// liveness, return physical pages, and decide when the whole pool can
// be destroyed (`start_in_use >= end_in_use`).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(feature = "subpage-reuse")]
use std::sync::atomic::{AtomicPtr, AtomicU32};

use log::error;
use parking_lot::Mutex;

use crate::os::vm;
use crate::types::{
    align_down, align_up, page_status, track, JUMBO_POOL_SENTINEL, MIN_PAGES_TO_FREE, PAGES_PER_POOL,
    PAGE_SIZE, SMALL_POOL_SENTINEL, TRACKING_CAPACITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Small,
    Large,
    Jumbo,
}

/// Outcome of a free operation at pool level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    Done,
    /// The pool holds no live data; the caller must destroy it.
    DestroyPool,
}

fn abort_bad_pointer(ptr: usize, why: &str) -> ! {
    error!("invalid free of {:#x}: {}", ptr, why);
    std::process::abort();
}

// ---------------------------------------------------------------------
// Page maps
// ---------------------------------------------------------------------

/// Per-page metadata of a small pool. `alloc_size` carries the slot
/// size with three status bits in its low bits. The `bitmap` field is
/// the liveness word itself when at most 64 slots fit the page, and a
/// pointer to an external word array otherwise.
#[repr(C)]
pub struct PageMap {
    pub start: AtomicUsize,
    alloc_size: AtomicUsize,
    bitmap: AtomicU64,
    #[cfg(feature = "subpage-reuse")]
    safemap: AtomicU64,
    #[cfg(feature = "subpage-reuse")]
    pub epoch_counter: AtomicU32,
    #[cfg(feature = "subpage-reuse")]
    pub epochs_since_last_free: AtomicU32,
    #[cfg(feature = "subpage-reuse")]
    pub next_reuse: AtomicPtr<PageMap>,
}

impl PageMap {
    /// Bind this map to a fresh page. `external` supplies the zeroed
    /// word array when more than 64 slots fit, else null.
    pub fn init(&self, page_addr: usize, alloc_size: usize, external: *mut AtomicU64) {
        debug_assert!(alloc_size >= 64 || !external.is_null());
        self.start.store(page_addr, Ordering::Relaxed);
        self.bitmap.store(external as u64, Ordering::Relaxed);
        #[cfg(feature = "subpage-reuse")]
        self.safemap.store(0, Ordering::Relaxed);
        self.alloc_size.store(alloc_size, Ordering::Release);
    }

    #[cfg(feature = "subpage-reuse")]
    pub fn init_safemap(&self, external: *mut AtomicU64) {
        self.safemap.store(external as u64, Ordering::Relaxed);
    }

    /// Slot size with status bits masked off; zero for an unassigned page.
    #[inline]
    pub fn class_size(&self) -> usize {
        self.alloc_size.load(Ordering::Acquire) & !page_status::MASK
    }

    #[inline]
    pub fn status(&self) -> usize {
        self.alloc_size.load(Ordering::Acquire) & page_status::MASK
    }

    #[inline]
    pub fn set_status(&self, bits: usize) {
        self.alloc_size.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn max_alloc(&self) -> usize {
        let class = self.class_size();
        if class == 0 {
            0
        } else {
            PAGE_SIZE / class
        }
    }

    #[inline]
    fn external(&self) -> bool {
        let class = self.class_size();
        class != 0 && class < 64
    }

    #[inline]
    fn word(&self, w: usize) -> &AtomicU64 {
        if self.external() {
            unsafe { &*(self.bitmap.load(Ordering::Acquire) as *const AtomicU64).add(w) }
        } else {
            debug_assert_eq!(w, 0);
            &self.bitmap
        }
    }

    pub fn word_count(&self) -> usize {
        crate::types::bitmap_words(self.max_alloc())
    }

    /// Pointer to the external word array, if any, for teardown.
    pub fn external_words(&self) -> Option<*mut AtomicU64> {
        if self.external() {
            Some(self.bitmap.load(Ordering::Acquire) as *mut AtomicU64)
        } else {
            None
        }
    }

    /// Set the liveness bit for `slot`; returns the previous value.
    pub fn set_slot(&self, slot: usize) -> bool {
        let prev = self.word(slot / 64).fetch_or(1 << (slot % 64), Ordering::AcqRel);
        prev & (1 << (slot % 64)) != 0
    }

    /// Clear the liveness bit for `slot`; returns the previous value.
    pub fn clear_slot(&self, slot: usize) -> bool {
        let prev = self.word(slot / 64).fetch_and(!(1 << (slot % 64)), Ordering::AcqRel);
        prev & (1 << (slot % 64)) != 0
    }

    pub fn slot_live(&self, slot: usize) -> bool {
        self.word(slot / 64).load(Ordering::Acquire) & (1 << (slot % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        (0..self.word_count()).all(|w| self.word(w).load(Ordering::Acquire) == 0)
    }

    pub fn live_count(&self) -> usize {
        (0..self.word_count())
            .map(|w| self.word(w).load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

#[cfg(feature = "subpage-reuse")]
impl PageMap {
    #[inline]
    fn safe_word(&self, w: usize) -> &AtomicU64 {
        if self.external() {
            unsafe { &*(self.safemap.load(Ordering::Acquire) as *const AtomicU64).add(w) }
        } else {
            debug_assert_eq!(w, 0);
            &self.safemap
        }
    }

    pub fn safemap_words(&self) -> Option<*mut AtomicU64> {
        if self.external() {
            let p = self.safemap.load(Ordering::Acquire) as *mut AtomicU64;
            if p.is_null() {
                None
            } else {
                Some(p)
            }
        } else {
            None
        }
    }

    pub fn set_safe_slot(&self, slot: usize) {
        self.safe_word(slot / 64).fetch_or(1 << (slot % 64), Ordering::AcqRel);
    }

    /// Claim a slot the sweeper proved dead: set it live and clear its
    /// safemap bit. Returns the slot index, or None when the page has
    /// nothing left to hand out. Callers re-check the page status and
    /// back out with `clear_slot` if a release raced the claim.
    pub fn grab_safe_slot(&self) -> Option<usize> {
        for w in 0..self.word_count() {
            loop {
                let safe = self.safe_word(w).load(Ordering::Acquire);
                let live = self.word(w).load(Ordering::Acquire);
                let candidates = safe & !live;
                if candidates == 0 {
                    break;
                }
                let bit = candidates.trailing_zeros() as usize;
                let mask = 1u64 << bit;
                let prev = self.word(w).fetch_or(mask, Ordering::AcqRel);
                self.safe_word(w).fetch_and(!mask, Ordering::AcqRel);
                if prev & mask == 0 {
                    return Some(w * 64 + bit);
                }
                // Someone else claimed the bit first; try the next one.
            }
        }
        None
    }
}

// ---------------------------------------------------------------------
// Pool descriptor
// ---------------------------------------------------------------------

pub struct Pool {
    pub start: usize,
    pub end: usize,
    /// Lowest address not yet fully freed-and-released.
    pub start_in_use: AtomicUsize,
    /// One past the highest address not yet fully freed-and-released.
    pub end_in_use: AtomicUsize,
    /// Small: next page address to assign. Large: bump cursor.
    pub next_free_page: AtomicUsize,
    /// Variant sentinel, or the large pool's allocation count.
    pub next_free_index: AtomicUsize,
    /// Page-map array; null except for small pools.
    pub page_maps: *mut PageMap,
    /// Tracking array; null except for large pools.
    pub tracking: *mut AtomicUsize,
    /// Owning arena (non-owning backref).
    pub arena: *const crate::arena::Arena,
    pub lock: Mutex<()>,
}

// The raw pointers reference metadata-arena storage that lives until
// the pool is destroyed, and destruction is sequenced behind the pool
// lock and the arena lists.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

/// Send/Sync wrapper for pool pointers travelling through queues.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PoolRef(pub *mut Pool);

unsafe impl Send for PoolRef {}
unsafe impl Sync for PoolRef {}

impl PoolRef {
    /// The descriptor outlives every queue entry; see `Pool`.
    pub unsafe fn get<'a>(self) -> &'a Pool {
        &*self.0
    }
}

impl Pool {
    pub fn kind(&self) -> PoolKind {
        match self.next_free_index.load(Ordering::Acquire) {
            SMALL_POOL_SENTINEL => PoolKind::Small,
            JUMBO_POOL_SENTINEL => PoolKind::Jumbo,
            _ => PoolKind::Large,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Fully freed pools hold no live data and may be destroyed.
    pub fn fully_freed(&self) -> bool {
        self.start_in_use.load(Ordering::Acquire) >= self.end_in_use.load(Ordering::Acquire)
    }

    fn init_common(addr: usize, len: usize, arena: *const crate::arena::Arena) -> Pool {
        Pool {
            start: addr,
            end: addr + len,
            start_in_use: AtomicUsize::new(addr),
            end_in_use: AtomicUsize::new(addr + len),
            next_free_page: AtomicUsize::new(addr),
            next_free_index: AtomicUsize::new(0),
            page_maps: std::ptr::null_mut(),
            tracking: std::ptr::null_mut(),
            arena,
            lock: Mutex::new(()),
        }
    }

    /// Build a small pool descriptor over an address range the caller
    /// reserved. The page-map array comes zeroed from the metadata
    /// allocator: every page starts unassigned.
    pub fn init_small(
        storage: *mut Pool,
        addr: usize,
        arena: *const crate::arena::Arena,
        page_maps: *mut PageMap,
    ) {
        let mut p = Self::init_common(addr, crate::types::POOL_SIZE, arena);
        p.next_free_index = AtomicUsize::new(SMALL_POOL_SENTINEL);
        p.page_maps = page_maps;
        unsafe { std::ptr::write(storage, p) };
    }

    pub fn init_large(
        storage: *mut Pool,
        addr: usize,
        arena: *const crate::arena::Arena,
        tracking: *mut AtomicUsize,
    ) {
        let mut p = Self::init_common(addr, crate::types::POOL_SIZE, arena);
        p.tracking = tracking;
        unsafe {
            // Open-tail marker: no allocation lies beyond the cursor.
            (*tracking.add(0)).store(addr | track::SENTINEL, Ordering::Release);
            std::ptr::write(storage, p);
        }
    }

    pub fn init_jumbo(storage: *mut Pool, addr: usize, len: usize, arena: *const crate::arena::Arena) {
        let mut p = Self::init_common(addr, len, arena);
        p.next_free_index = AtomicUsize::new(JUMBO_POOL_SENTINEL);
        unsafe { std::ptr::write(storage, p) };
    }

    #[cfg(test)]
    pub(crate) fn for_test(start: usize, end: usize) -> Pool {
        let mut p = Self::init_common(start, end - start, std::ptr::null());
        p.next_free_index = AtomicUsize::new(JUMBO_POOL_SENTINEL);
        p
    }

    // -----------------------------------------------------------------
    // Small pool operations
    // -----------------------------------------------------------------

    pub fn page_map(&self, index: usize) -> &PageMap {
        debug_assert!(index < PAGES_PER_POOL);
        unsafe { &*self.page_maps.add(index) }
    }

    pub fn page_index(&self, addr: usize) -> usize {
        (addr - self.start) / PAGE_SIZE
    }

    /// Atomically claim up to `n` pages for a thread cache. Returns the
    /// first page address and the number actually granted; None when
    /// the pool is exhausted and must be retired.
    pub fn bump_pages(&self, n: usize) -> Option<(usize, usize)> {
        let bytes = n * PAGE_SIZE;
        let addr = self.next_free_page.fetch_add(bytes, Ordering::AcqRel);
        if addr >= self.end {
            return None;
        }
        let granted = ((self.end - addr) / PAGE_SIZE).min(n);
        Some((addr, granted))
    }

    /// Free one small slot. Aborts on any pointer that does not name a
    /// live slot: a silent return would let the caller believe the
    /// address could be recycled.
    pub fn free_small(&self, ptr: usize) -> FreeOutcome {
        let index = self.page_index(ptr);
        let pm = self.page_map(index);
        let class = pm.class_size();
        if class == 0 {
            abort_bad_pointer(ptr, "page not allocated");
        }
        let offset = ptr - pm.start.load(Ordering::Acquire);
        if offset % class != 0 {
            abort_bad_pointer(ptr, "not a slot boundary");
        }
        let slot = offset / class;
        if slot >= pm.max_alloc() {
            abort_bad_pointer(ptr, "slot out of range");
        }

        if cfg!(feature = "sweeper") {
            // Stale interior pointers inside the dead object must not
            // keep other pools alive through the conservative scan.
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, class) };
        }
        #[cfg(feature = "subpage-reuse")]
        pm.epochs_since_last_free.store(0, Ordering::Relaxed);

        if !pm.clear_slot(slot) {
            abort_bad_pointer(ptr, "already freed");
        }

        if pm.status() & page_status::FULLY_ALLOCATED != 0 && pm.is_empty() {
            pm.set_status(page_status::READY_TO_RELEASE);
            return self.try_release_page(pm);
        }
        FreeOutcome::Done
    }

    /// Return an empty, fully-allocated page's physical memory to the
    /// OS and recompute the in-use bounds.
    pub fn try_release_page(&self, pm: &PageMap) -> FreeOutcome {
        let _g = self.lock.lock();
        let status = pm.status();
        if status & page_status::READY_TO_RELEASE == 0
            || status & page_status::RETURNED != 0
            || !pm.is_empty()
        {
            return FreeOutcome::Done;
        }
        let page = pm.start.load(Ordering::Acquire);
        vm::decommit(page, PAGE_SIZE);
        pm.set_status(page_status::RETURNED);

        // Advance the in-use window over released pages at both ends.
        let mut s = self.start_in_use.load(Ordering::Acquire);
        while s < self.end_in_use.load(Ordering::Acquire) {
            let m = self.page_map(self.page_index(s));
            if m.status() & page_status::RETURNED == 0 {
                break;
            }
            s += PAGE_SIZE;
        }
        self.start_in_use.store(s, Ordering::Release);
        let mut e = self.end_in_use.load(Ordering::Acquire);
        while e > s {
            let m = self.page_map(self.page_index(e - PAGE_SIZE));
            if m.status() & page_status::RETURNED == 0 {
                break;
            }
            e -= PAGE_SIZE;
        }
        self.end_in_use.store(e, Ordering::Release);

        if s >= e {
            FreeOutcome::DestroyPool
        } else {
            FreeOutcome::Done
        }
    }

    // -----------------------------------------------------------------
    // Large pool operations
    // -----------------------------------------------------------------

    pub fn tracking_entry(&self, i: usize) -> &AtomicUsize {
        debug_assert!(i < TRACKING_CAPACITY);
        unsafe { &*self.tracking.add(i) }
    }

    pub fn alloc_count(&self) -> usize {
        self.next_free_index.load(Ordering::Acquire)
    }

    /// Start address of allocation `i`.
    fn alloc_start(&self, i: usize) -> usize {
        if i == 0 {
            self.start
        } else {
            track::addr(self.tracking_entry(i - 1).load(Ordering::Acquire))
        }
    }

    /// Whether no allocation can ever follow the recorded ones.
    fn closed(&self) -> bool {
        let count = self.alloc_count();
        count > 0 && track::tags(self.tracking_entry(count - 1).load(Ordering::Acquire)) & track::SENTINEL != 0
    }

    /// Unlocked feasibility probe used while walking a pool list.
    pub fn large_fits(&self, size: usize, align: usize) -> bool {
        if self.closed() {
            return false;
        }
        let cursor = self.next_free_page.load(Ordering::Acquire);
        let aligned = align_up(cursor, align);
        aligned.checked_add(size).is_some_and(|e| e <= self.end)
            && self.alloc_count() + 1 < TRACKING_CAPACITY
    }

    /// Record an allocation under the pool lock. When alignment skips
    /// the cursor forward, the previous allocation's end pointer grows
    /// to cover the gap, so the tracking array stays gapless.
    pub fn large_allocate(&self, size: usize, align: usize) -> Option<usize> {
        let _g = self.lock.lock();
        if self.closed() {
            return None;
        }
        let count = self.alloc_count();
        if count + 1 >= TRACKING_CAPACITY {
            return None;
        }
        let cursor = self.next_free_page.load(Ordering::Acquire);
        let aligned = align_up(cursor, align);
        let new_end = aligned.checked_add(size)?;
        if new_end > self.end {
            return None;
        }
        if aligned > cursor && count > 0 {
            let prev = self.tracking_entry(count - 1).load(Ordering::Acquire);
            self.tracking_entry(count - 1)
                .store(aligned | track::tags(prev), Ordering::Release);
        }
        self.tracking_entry(count).store(new_end, Ordering::Release);
        self.tracking_entry(count + 1)
            .store(new_end | track::SENTINEL, Ordering::Release);
        self.next_free_page.store(new_end, Ordering::Release);
        self.next_free_index.store(count + 1, Ordering::Release);
        Some(aligned)
    }

    /// Extend the trailing allocation in place. Only valid while the
    /// pool is open and `ptr` names the last recorded allocation.
    pub fn large_grow_in_place(&self, ptr: usize, new_size: usize) -> bool {
        let _g = self.lock.lock();
        if self.closed() {
            return false;
        }
        let count = self.alloc_count();
        if count == 0 || self.alloc_start(count - 1) != ptr {
            return false;
        }
        let new_end = match ptr.checked_add(align_up(new_size, crate::types::MIN_ALIGNMENT)) {
            Some(e) if e <= self.end => e,
            _ => return false,
        };
        self.tracking_entry(count - 1).store(new_end, Ordering::Release);
        self.tracking_entry(count)
            .store(new_end | track::SENTINEL, Ordering::Release);
        self.next_free_page.store(new_end, Ordering::Release);
        true
    }

    /// Locate the allocation starting at `ptr`: binary search over the
    /// end pointers, since each allocation starts where the previous
    /// one ends.
    pub fn large_find(&self, ptr: usize) -> Option<(usize, usize, usize)> {
        let count = self.alloc_count();
        if count == 0 {
            return None;
        }
        let index = if ptr == self.start {
            0
        } else {
            let mut lo = 0usize;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let end = track::addr(self.tracking_entry(mid).load(Ordering::Acquire));
                if end <= ptr {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            // lo is the allocation containing ptr; it matches only if
            // ptr is exactly its start.
            lo
        };
        if index >= count || self.alloc_start(index) != ptr {
            return None;
        }
        let end = track::addr(self.tracking_entry(index).load(Ordering::Acquire));
        Some((index, ptr, end))
    }

    /// Close the pool: record the unallocated tail as one freed
    /// allocation carrying the end-of-pool flag, then try to release
    /// its pages. Called when the pool leaves the active list.
    pub fn trim(&self) -> FreeOutcome {
        {
            let _g = self.lock.lock();
            if self.closed() {
                return FreeOutcome::Done;
            }
            let count = self.alloc_count();
            let cursor = self.next_free_page.load(Ordering::Acquire);
            // A pool that filled exactly has no tail pages to release;
            // its closing entry is born released.
            let tags = if cursor == self.end {
                track::FREE | track::UNMAPPED | track::SENTINEL
            } else {
                track::FREE | track::SENTINEL
            };
            self.tracking_entry(count).store(self.end | tags, Ordering::Release);
            self.next_free_index.store(count + 1, Ordering::Release);
        }
        self.release_run(self.alloc_count() - 1)
    }

    /// Free a large allocation. Aborts when `ptr` does not name a live
    /// allocation.
    pub fn free_large(&self, ptr: usize) -> FreeOutcome {
        let index = {
            let _g = self.lock.lock();
            let (index, ..) = match self.large_find(ptr) {
                Some(hit) => hit,
                None => abort_bad_pointer(ptr, "no such allocation"),
            };
            let entry = self.tracking_entry(index).load(Ordering::Acquire);
            if track::tags(entry) & track::FREE != 0 {
                abort_bad_pointer(ptr, "already freed");
            }
            self.tracking_entry(index).store(entry | track::FREE, Ordering::Release);
            index
        };
        self.release_run(index)
    }

    /// Release the page-aligned portion of the contiguous freed run
    /// around allocation `index`, then recompute the in-use bounds.
    fn release_run(&self, index: usize) -> FreeOutcome {
        let _g = self.lock.lock();
        let count = self.alloc_count();
        let joins = |i: usize| {
            track::tags(self.tracking_entry(i).load(Ordering::Acquire)) == track::FREE
        };

        let mut first = index;
        while first > 0 && joins(first - 1) {
            first -= 1;
        }
        let mut last = index;
        while last + 1 < count && joins(last + 1) {
            last += 1;
        }
        let run_start = self.alloc_start(first);
        let run_end = track::addr(self.tracking_entry(last).load(Ordering::Acquire));

        // Shrink to page boundaries, then extend back out where the
        // neighbouring region already gave up its boundary page.
        let left_released = first > 0
            && track::tags(self.tracking_entry(first - 1).load(Ordering::Acquire)) & track::UNMAPPED != 0;
        let right_released = last + 1 < count
            && track::tags(self.tracking_entry(last + 1).load(Ordering::Acquire)) & track::UNMAPPED != 0;
        let pstart = if left_released {
            align_down(run_start, PAGE_SIZE)
        } else {
            align_up(run_start, PAGE_SIZE)
        };
        let pend = if right_released {
            align_up(run_end, PAGE_SIZE)
        } else {
            align_down(run_end, PAGE_SIZE)
        };

        let island = left_released && right_released;
        if pend > pstart && (island || pend - pstart >= MIN_PAGES_TO_FREE * PAGE_SIZE) {
            vm::decommit(pstart, pend - pstart);
            for i in first..=last {
                self.tracking_entry(i).fetch_or(track::UNMAPPED, Ordering::AcqRel);
            }
            self.recompute_in_use();
        } else if island {
            // Sub-page island whose pages the neighbouring releases
            // already took; nothing left to decommit.
            for i in first..=last {
                self.tracking_entry(i).fetch_or(track::UNMAPPED, Ordering::AcqRel);
            }
            self.recompute_in_use();
        }

        if self.fully_freed() {
            FreeOutcome::DestroyPool
        } else {
            FreeOutcome::Done
        }
    }

    /// Recompute `start_in_use`/`end_in_use` from the tracking tags.
    /// Caller holds the pool lock.
    fn recompute_in_use(&self) {
        let count = self.alloc_count();
        let released =
            |i: usize| {
                let tags = track::tags(self.tracking_entry(i).load(Ordering::Acquire));
                tags & track::FREE != 0 && tags & track::UNMAPPED != 0
            };

        let mut first_live = 0;
        while first_live < count && released(first_live) {
            first_live += 1;
        }
        self.start_in_use.store(self.alloc_start(first_live), Ordering::Release);

        if self.closed() {
            let mut last_live = count;
            while last_live > 0 && released(last_live - 1) {
                last_live -= 1;
            }
            let e = if last_live == count {
                self.end
            } else {
                self.alloc_start(last_live)
            };
            self.end_in_use.store(e, Ordering::Release);
        }
    }

    // -----------------------------------------------------------------
    // Jumbo
    // -----------------------------------------------------------------

    /// A jumbo pool is one allocation; freeing it empties the pool.
    pub fn free_jumbo(&self, ptr: usize) -> FreeOutcome {
        if ptr != self.start {
            abort_bad_pointer(ptr, "not the allocation start");
        }
        let _g = self.lock.lock();
        if self.fully_freed() {
            abort_bad_pointer(ptr, "already freed");
        }
        self.start_in_use.store(self.end, Ordering::Release);
        FreeOutcome::DestroyPool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaArena;
    use crate::types::{MIN_ALIGNMENT, POOL_SIZE};

    fn make_large(meta: &MetaArena) -> (*mut Pool, usize) {
        let addr = vm::alloc_highwater(POOL_SIZE).unwrap();
        let storage = meta.alloc(std::mem::size_of::<Pool>()) as *mut Pool;
        Pool::init_large(storage, addr, std::ptr::null(), meta.alloc_tracking());
        (storage, addr)
    }

    #[test]
    fn large_allocations_are_recorded_in_order() {
        let meta = MetaArena::new();
        let (pool, base) = make_large(&meta);
        let pool = unsafe { &*pool };

        let a = pool.large_allocate(4096, MIN_ALIGNMENT).unwrap();
        let b = pool.large_allocate(8192, MIN_ALIGNMENT).unwrap();
        assert_eq!(a, base);
        assert_eq!(b, base + 4096);
        assert_eq!(pool.alloc_count(), 2);

        // Monotonic end pointers.
        let e0 = track::addr(pool.tracking_entry(0).load(Ordering::Relaxed));
        let e1 = track::addr(pool.tracking_entry(1).load(Ordering::Relaxed));
        assert!(e0 <= e1);

        assert_eq!(pool.large_find(a), Some((0, a, a + 4096)));
        assert_eq!(pool.large_find(b), Some((1, b, b + 8192)));
        assert_eq!(pool.large_find(base + 8), None);
    }

    #[test]
    fn aligned_allocation_grows_the_previous_entry() {
        let meta = MetaArena::new();
        let (pool, _base) = make_large(&meta);
        let pool = unsafe { &*pool };

        let a = pool.large_allocate(24, MIN_ALIGNMENT).unwrap();
        let b = pool.large_allocate(4096, 4096).unwrap();
        assert_eq!(b % 4096, 0);
        assert!(b > a);
        // The first allocation's recorded end moved up to b.
        let e0 = track::addr(pool.tracking_entry(0).load(Ordering::Relaxed));
        assert_eq!(e0, b);
        // So the second allocation is found by its aligned start.
        assert_eq!(pool.large_find(b).map(|(i, ..)| i), Some(1));
    }

    #[test]
    fn grow_in_place_updates_cursor_and_sentinel() {
        let meta = MetaArena::new();
        let (pool, base) = make_large(&meta);
        let pool = unsafe { &*pool };

        let a = pool.large_allocate(1 << 13, MIN_ALIGNMENT).unwrap();
        assert!(pool.large_grow_in_place(a, 1 << 14));
        assert_eq!(pool.large_find(a), Some((0, a, a + (1 << 14))));
        let sentinel = pool.tracking_entry(1).load(Ordering::Relaxed);
        assert_eq!(track::addr(sentinel), a + (1 << 14));
        assert!(track::tags(sentinel) & track::SENTINEL != 0);

        // A second allocation lands after the grown region.
        let b = pool.large_allocate(64, MIN_ALIGNMENT).unwrap();
        assert_eq!(b, a + (1 << 14));
        // Now the first allocation is no longer the tail.
        assert!(!pool.large_grow_in_place(a, 1 << 15));
        let _ = base;
    }

    #[test]
    fn freed_run_releases_pages_and_destroys_the_pool() {
        let meta = MetaArena::new();
        let (pool, base) = make_large(&meta);
        let pool = unsafe { &*pool };

        let a = pool.large_allocate(64 * 1024, MIN_ALIGNMENT).unwrap();
        let b = pool.large_allocate(64 * 1024, MIN_ALIGNMENT).unwrap();
        assert_eq!(pool.free_large(a), FreeOutcome::Done);
        assert_eq!(pool.free_large(b), FreeOutcome::Done);
        // The freed prefix is released, so the in-use window starts
        // after it.
        assert_eq!(pool.start_in_use.load(Ordering::Relaxed), b + 64 * 1024);

        // Closing the pool frees the tail; everything is now released.
        assert_eq!(pool.trim(), FreeOutcome::DestroyPool);
        assert!(pool.fully_freed());
        let _ = base;
    }

    #[test]
    fn trim_on_an_empty_pool_destroys_it() {
        let meta = MetaArena::new();
        let (pool, _) = make_large(&meta);
        let pool = unsafe { &*pool };
        assert_eq!(pool.trim(), FreeOutcome::DestroyPool);
    }

    #[test]
    fn middle_free_does_not_advance_bounds() {
        let meta = MetaArena::new();
        let (pool, base) = make_large(&meta);
        let pool = unsafe { &*pool };

        let a = pool.large_allocate(16 * 1024, MIN_ALIGNMENT).unwrap();
        let b = pool.large_allocate(16 * 1024, MIN_ALIGNMENT).unwrap();
        let c = pool.large_allocate(16 * 1024, MIN_ALIGNMENT).unwrap();
        assert_eq!(pool.free_large(b), FreeOutcome::Done);
        assert_eq!(pool.start_in_use.load(Ordering::Relaxed), base);
        assert!(!pool.fully_freed());
        let _ = (a, c);
    }
}
