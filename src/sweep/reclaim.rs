// # Reclamation
//
// Runs against the frozen mark bitmap. A pending pool whose whole
// address range shows no mark was reachable from nothing the scan
// observed; its range can be retired for good (and, for small pools,
// banked for exact reuse). Sub-page mode additionally combs live small
// pages for dead free slots and feeds them back to the bins through
// per-arena reuse lists.

#[cfg(feature = "subpage-reuse")]
use std::sync::atomic::Ordering;

#[cfg(feature = "subpage-reuse")]
use log::debug;

use super::Sweeper;
use crate::arena::heap;
use crate::pool::PoolRef;

/// The profitability bound for sub-page recycling:
/// `(max_alloc / live) * epochs_since_free` must stay below this.
#[cfg(feature = "subpage-reuse")]
pub(super) const SUBPAGE_PROFIT_LIMIT: u32 = 100;

/// Split the pending queues into certified-dead pools (moved to `out`)
/// and retained ones (pushed back for the next cycle). Runs while the
/// mutator is parked: only lock-free queue hops and bitmap reads.
pub(super) fn certify_pending(sw: &Sweeper, out: &mut Vec<PoolRef>) {
    heap().each_arena(|arena| {
        let n = arena.pending.len();
        for _ in 0..n {
            let pr = match arena.pending.pop() {
                Some(p) => p,
                None => break,
            };
            let pool = unsafe { pr.get() };
            let marked = sw.bitmap.any_marked(pool.start, pool.end);
            if marked || out.len() == out.capacity() {
                // Retained: something may still point here, or there
                // is no room to process it this cycle.
                let _ = arena.pending.push(pr);
            } else {
                out.push(pr);
            }
        }
    });
}

/// Comb live small pools for slots that are free and unreferenced,
/// record them in the page safemaps, and queue the pages for reuse.
/// Runs after the mutator resumes but before the bitmap is cleared:
/// the marks are still frozen, and a slot freed since the freeze can
/// only lose reuse eligibility, never gain liveness unseen.
#[cfg(feature = "subpage-reuse")]
pub(super) fn subpage_pass(sw: &Sweeper) {
    use crate::types::{page_status, size_to_bin, PAGES_PER_POOL};

    let mut pages = 0usize;
    heap().each_arena(|arena| {
        let pools: Vec<PoolRef> = arena.small_pools.lock().clone();
        for pr in pools {
            let pool = unsafe { pr.get() };
            for i in 0..PAGES_PER_POOL {
                let pm = pool.page_map(i);
                let class = pm.class_size();
                if class == 0 {
                    continue;
                }
                let status = pm.status();
                if status & (page_status::RETURNED | page_status::READY_TO_RELEASE) != 0 {
                    continue;
                }
                if status & page_status::FULLY_ALLOCATED == 0 {
                    // Still being carved up by a bin; its free slots
                    // belong to the bump cursor, not to reuse.
                    continue;
                }
                pm.epoch_counter.fetch_add(1, Ordering::Relaxed);
                let epochs = pm.epochs_since_last_free.fetch_add(1, Ordering::Relaxed) + 1;
                let live = pm.live_count() as u32;
                let max_alloc = pm.max_alloc() as u32;
                if live == 0 || live == max_alloc {
                    continue;
                }
                if (max_alloc / live) * epochs >= SUBPAGE_PROFIT_LIMIT {
                    continue;
                }
                let base = pm.start.load(Ordering::Acquire);
                let mut eligible = false;
                for slot in 0..max_alloc as usize {
                    if pm.slot_live(slot) {
                        continue;
                    }
                    let addr = base + slot * class;
                    if !sw.bitmap.any_marked(addr, addr + class) {
                        pm.set_safe_slot(slot);
                        eligible = true;
                    }
                }
                if eligible {
                    let bin = size_to_bin(class);
                    let pm_ptr = pm as *const crate::pool::PageMap as *mut crate::pool::PageMap;
                    if !arena.reuse_listed(bin, pm_ptr) {
                        arena.enqueue_reuse(bin, pm_ptr);
                        pages += 1;
                    }
                }
            }
        }
    });
    if pages > 0 {
        debug!("sub-page pass queued {} pages for reuse", pages);
    }
}
