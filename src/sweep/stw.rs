// # Scan Phases
//
// One cycle scans twice. The concurrent phase clears the soft-dirty
// bits and, while the mutator keeps running, walks only the pages that
// come back soft-dirty — soft-dirty is how writes racing the scan are
// detected. The stop-the-world phase then parks the mutator and reads
// every present page, so the frozen bitmap holds a mark for every heap
// pointer that existed at the instant of suspension. That paired rule
// (soft-dirty-only while concurrent, all present pages under the
// pause) is the correctness argument; both phases must stay in place.

use log::debug;

use super::scan::ScanMode;
use super::{roots, Scratch, Sweeper};
use crate::arena::heap;
use crate::os::suspend::{self, SuspendGuard};
use crate::pool::PoolRef;

/// Snapshot every live pool. In bounded mode nothing may allocate; an
/// overflow fails the snapshot instead of growing the buffer.
pub(super) fn snapshot_pools(out: &mut Vec<PoolRef>, grow: bool) -> bool {
    loop {
        out.clear();
        let mut overflow = false;
        heap().each_arena(|arena| arena.live_pools_bounded(out, &mut overflow));
        if !overflow {
            return true;
        }
        if !grow {
            return false;
        }
        let extra = out.capacity().max(64);
        out.reserve(extra);
    }
}

/// Concurrent scan: clear soft-dirty, then walk the pages that come
/// back dirty while the mutator keeps running. Returns false when the
/// cycle cannot proceed (soft-dirty unavailable, unenumerable roots).
pub(super) fn concurrent_phase(sw: &'static Sweeper, scratch: &mut Scratch, probes: &[usize]) -> bool {
    if !sw.page_status.clear_soft_dirty() {
        debug!("soft-dirty clear failed; skipping cycle");
        return false;
    }
    loop {
        if roots::enumerate_into(probes, &mut scratch.maps, &mut scratch.excl, &mut scratch.roots) {
            break;
        }
        if scratch.maps.capacity() > 1 << 28 {
            debug!("memory map too large to enumerate; skipping cycle");
            return false;
        }
        scratch.maps.reserve(scratch.maps.capacity());
        scratch.excl.reserve(scratch.excl.capacity());
        scratch.roots.reserve(scratch.roots.capacity().max(256));
    }
    if !snapshot_pools(&mut scratch.pools, true) {
        return false;
    }

    for &(lo, hi) in &scratch.roots {
        sw.offer_range(lo, hi, ScanMode::SoftDirty);
    }
    for &pr in &scratch.pools {
        sw.offer_pool(pr, ScanMode::SoftDirty);
    }
    sw.dispatch_and_wait(ScanMode::SoftDirty);
    true
}

/// Grow the scratch buffers so the paused phase can re-enumerate
/// without a single allocation. Thread stacks and pools may have
/// appeared since the concurrent snapshot; double capacity plus slack
/// covers any realistic delta.
pub(super) fn reserve_for_pause(scratch: &mut Scratch, pending_total: usize) {
    // reserve() is relative to len: these bring each buffer to at
    // least twice its concurrent-phase footprint plus slack.
    scratch.maps.reserve(scratch.maps.len() + 4096);
    scratch.roots.reserve(scratch.roots.len() + 256);
    scratch.pools.reserve(scratch.pools.len() + 1024);
    scratch.certified.clear();
    scratch.certified.reserve(pending_total + 64);
}

/// Park the mutator and read every present page of the frozen address
/// space. On any enumeration failure the cycle is poisoned; the caller
/// still owns the guard and must resume.
pub(super) fn stop_the_world_phase(
    sw: &'static Sweeper,
    scratch: &mut Scratch,
    probes: &[usize],
) -> SuspendGuard {
    let guard = suspend::suspend_all();
    if !guard.complete() {
        sw.failed.store(true, std::sync::atomic::Ordering::Release);
        return guard;
    }
    // Pools created during the concurrent phase sit above the
    // cycle-start snapshot; widen the value filter to the frozen
    // high-water mark so references to them are marked too.
    sw.shared
        .high
        .store(crate::os::vm::high_water(), std::sync::atomic::Ordering::Release);
    let roots_ok = roots::enumerate_into(probes, &mut scratch.maps, &mut scratch.excl, &mut scratch.roots);
    let pools_ok = roots_ok && snapshot_pools(&mut scratch.pools, false);
    if roots_ok && pools_ok {
        for &(lo, hi) in &scratch.roots {
            sw.offer_range(lo, hi, ScanMode::AllPresent);
        }
        for &pr in &scratch.pools {
            sw.offer_pool(pr, ScanMode::AllPresent);
        }
        sw.dispatch_and_wait(ScanMode::AllPresent);
    } else {
        sw.failed.store(true, std::sync::atomic::Ordering::Release);
    }
    guard
}
