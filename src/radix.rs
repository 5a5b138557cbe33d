// # Pointer-to-Pool Radix Tree
//
// Global lookup from any heap pointer to its owning pool. Three levels,
// indexed by pointer bits [47..40], [39..32], and [31..21]. Because pool
// starts are not pool-size-aligned, each leaf slot carries two entries:
// the pool whose start falls in the slot and the pool whose last byte
// falls in the slot. The guard gap between reservations keeps those two
// roles from ever needing more than one pool each.
//
// Growth happens under a single lock; readers are lock-free and only
// ever observe fully initialized nodes.

use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::metadata::MetaArena;
use crate::pool::Pool;
use crate::types::POOL_SIZE_BITS;

const FANOUT: usize = 256;
const L1_SHIFT: usize = 40;
const L2_SHIFT: usize = 32;
const LEAF_SLOTS: usize = 1 << (L2_SHIFT - POOL_SIZE_BITS);

struct Stem {
    leaves: [AtomicPtr<Leaf>; FANOUT],
}

struct Leaf {
    pool_start: [AtomicPtr<Pool>; LEAF_SLOTS],
    pool_end: [AtomicPtr<Pool>; LEAF_SLOTS],
}

pub struct RadixTree {
    stems: [AtomicPtr<Stem>; FANOUT],
    grow_lock: Mutex<()>,
}

#[inline]
fn indices(ptr: usize) -> (usize, usize, usize) {
    debug_assert!(ptr < 1 << 48);
    (
        (ptr >> L1_SHIFT) & (FANOUT - 1),
        (ptr >> L2_SHIFT) & (FANOUT - 1),
        (ptr >> POOL_SIZE_BITS) & (LEAF_SLOTS - 1),
    )
}

impl RadixTree {
    pub fn new() -> Self {
        const NULL_STEM: AtomicPtr<Stem> = AtomicPtr::new(std::ptr::null_mut());
        Self {
            stems: [NULL_STEM; FANOUT],
            grow_lock: Mutex::new(()),
        }
    }

    fn leaf_for(&self, meta: &MetaArena, ptr: usize) -> &Leaf {
        let (i1, i2, _) = indices(ptr);
        let mut stem = self.stems[i1].load(Ordering::Acquire);
        if stem.is_null() {
            let _g = self.grow_lock.lock();
            stem = self.stems[i1].load(Ordering::Acquire);
            if stem.is_null() {
                stem = meta.alloc_node(std::mem::size_of::<Stem>()) as *mut Stem;
                self.stems[i1].store(stem, Ordering::Release);
            }
        }
        let stem = unsafe { &*stem };
        let mut leaf = stem.leaves[i2].load(Ordering::Acquire);
        if leaf.is_null() {
            let _g = self.grow_lock.lock();
            leaf = stem.leaves[i2].load(Ordering::Acquire);
            if leaf.is_null() {
                leaf = meta.alloc_node(std::mem::size_of::<Leaf>()) as *mut Leaf;
                stem.leaves[i2].store(leaf, Ordering::Release);
            }
        }
        unsafe { &*leaf }
    }

    /// Record a pool under both its start and its last byte.
    pub fn insert(&self, meta: &MetaArena, pool: *mut Pool) {
        let (start, end) = {
            let p = unsafe { &*pool };
            (p.start, p.end)
        };
        let (_, _, start_slot) = indices(start);
        self.leaf_for(meta, start).pool_start[start_slot].store(pool, Ordering::Release);
        let (_, _, end_slot) = indices(end - 1);
        self.leaf_for(meta, end - 1).pool_end[end_slot].store(pool, Ordering::Release);
    }

    /// Find the pool owning `ptr`, if any.
    pub fn lookup(&self, ptr: usize) -> Option<*mut Pool> {
        if ptr >= 1 << 48 {
            return None;
        }
        let (i1, i2, slot) = indices(ptr);
        let stem = self.stems[i1].load(Ordering::Acquire);
        if stem.is_null() {
            return None;
        }
        let leaf = unsafe { &*stem }.leaves[i2].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        let leaf = unsafe { &*leaf };
        for candidate in [
            leaf.pool_start[slot].load(Ordering::Acquire),
            leaf.pool_end[slot].load(Ordering::Acquire),
        ] {
            if !candidate.is_null() {
                let p = unsafe { &*candidate };
                if ptr >= p.start && ptr < p.end {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Drop a pool's entries. Slots are cleared only if they still name
    /// this pool, so a racing insert for a reused slot is preserved.
    pub fn remove(&self, pool: *mut Pool) {
        let (start, end) = {
            let p = unsafe { &*pool };
            (p.start, p.end)
        };
        self.clear_slot(start, pool, true);
        self.clear_slot(end - 1, pool, false);
    }

    fn clear_slot(&self, ptr: usize, pool: *mut Pool, start_side: bool) {
        let (i1, i2, slot) = indices(ptr);
        let stem = self.stems[i1].load(Ordering::Acquire);
        if stem.is_null() {
            return;
        }
        let leaf = unsafe { &*stem }.leaves[i2].load(Ordering::Acquire);
        if leaf.is_null() {
            return;
        }
        let entry = if start_side {
            &unsafe { &*leaf }.pool_start[slot]
        } else {
            &unsafe { &*leaf }.pool_end[slot]
        };
        let _ = entry.compare_exchange(pool, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::POOL_SIZE;

    fn leaked_pool(start: usize, end: usize) -> *mut Pool {
        Box::into_raw(Box::new(Pool::for_test(start, end)))
    }

    #[test]
    fn lookup_resolves_interior_pointers() {
        let meta = MetaArena::new();
        let tree = RadixTree::new();
        // A pool that starts mid-slot and spills into the next one.
        let start = 0x4000_0010_0000;
        let pool = leaked_pool(start, start + POOL_SIZE);
        tree.insert(&meta, pool);

        assert_eq!(tree.lookup(start), Some(pool));
        assert_eq!(tree.lookup(start + 8), Some(pool));
        // Past the first slot boundary, resolved through the end entry.
        assert_eq!(tree.lookup(start + POOL_SIZE - 8), Some(pool));
        // Outside the pool.
        assert_eq!(tree.lookup(start - 8), None);
        assert_eq!(tree.lookup(start + POOL_SIZE), None);
    }

    #[test]
    fn adjacent_pools_resolve_independently() {
        let meta = MetaArena::new();
        let tree = RadixTree::new();
        let a_start = 0x4100_0008_0000;
        let a = leaked_pool(a_start, a_start + POOL_SIZE);
        let b_start = a_start + POOL_SIZE + 0x10000;
        let b = leaked_pool(b_start, b_start + POOL_SIZE);
        tree.insert(&meta, a);
        tree.insert(&meta, b);

        assert_eq!(tree.lookup(a_start + POOL_SIZE - 1), Some(a));
        assert_eq!(tree.lookup(b_start), Some(b));
        assert_eq!(tree.lookup(a_start + POOL_SIZE), None);
    }

    #[test]
    fn removed_pools_stop_resolving() {
        let meta = MetaArena::new();
        let tree = RadixTree::new();
        let start = 0x4200_0000_0000;
        let pool = leaked_pool(start, start + POOL_SIZE);
        tree.insert(&meta, pool);
        assert!(tree.lookup(start + 64).is_some());
        tree.remove(pool);
        assert_eq!(tree.lookup(start + 64), None);
    }

    #[test]
    fn lookup_misses_on_untouched_prefixes() {
        let tree = RadixTree::new();
        assert_eq!(tree.lookup(0x7fff_0000_0000), None);
        assert_eq!(tree.lookup(usize::MAX), None);
    }
}
