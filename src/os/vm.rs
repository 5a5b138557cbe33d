// # Virtual Memory Primitives
//
// Thin wrappers over mmap/madvise/mprotect/munmap plus the process-wide
// high-water reservation scheme. Every pool draws its address range from
// `alloc_highwater`, which never hands out the same range twice: the
// high-water mark only moves up, and a guard gap is left between
// reservations so adjacent pools can never be confused by an off-by-one
// pointer.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::error::{AllocError, Result};
use crate::types::{align_up, GUARD_GAP, PAGE_SIZE};

/// First address tried for pool reservations. Far above the usual break
/// and library mappings, far below the kernel boundary at 2^47.
const HIGH_WATER_BASE: usize = 0x4000_0000_0000;

/// Attempts to place a reservation before giving up on address space.
const MAX_PLACEMENT_RETRIES: usize = 64;

static HIGH_WATER: AtomicUsize = AtomicUsize::new(HIGH_WATER_BASE);

/// Lowest address owned by any pool, ever. Never decreases after the
/// first pool is created; together with the high-water mark it bounds
/// the range of values the sweeper treats as possible heap pointers.
static POOL_LOW: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Current high-water mark. Addresses at or above this have never been
/// handed to a pool.
pub fn high_water() -> usize {
    HIGH_WATER.load(Ordering::Acquire)
}

/// Lowest pool address, or `usize::MAX` before the first pool exists.
pub fn pool_low() -> usize {
    POOL_LOW.load(Ordering::Acquire)
}

fn note_pool_low(addr: usize) {
    let mut cur = POOL_LOW.load(Ordering::Relaxed);
    while addr < cur {
        match POOL_LOW.compare_exchange_weak(cur, addr, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

fn bump_high_water(past: usize) {
    let mut cur = HIGH_WATER.load(Ordering::Relaxed);
    while past > cur {
        match HIGH_WATER.compare_exchange_weak(cur, past, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

/// Reserve `size` bytes of read/write anonymous memory at an address no
/// lower than the current high-water mark, then bump the mark past the
/// reservation plus the guard gap.
///
/// This is the only source of pool address space. A range returned here
/// is never returned again: failed placements skip forward, successful
/// ones advance the mark.
pub fn alloc_highwater(size: usize) -> Result<usize> {
    debug_assert!(size % PAGE_SIZE == 0);
    let mut hint = high_water();
    for _ in 0..MAX_PLACEMENT_RETRIES {
        let p = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            let err = errno::errno();
            if err.0 == libc::EEXIST || err.0 == libc::EINVAL {
                // Collided with a foreign mapping, or raced another
                // reservation. Skip past whatever won the spot.
                let fresh = high_water();
                hint = if fresh > hint {
                    fresh
                } else {
                    align_up(hint + size + GUARD_GAP, PAGE_SIZE)
                };
                continue;
            }
            warn!("mmap failed: {}, hint {:#x}, size {}", err, hint, size);
            return Err(AllocError::OutOfAddressSpace);
        }
        let addr = p as usize;
        if addr != hint {
            // Kernel without MAP_FIXED_NOREPLACE treated the hint as
            // advisory. The placement is unusable: it may sit below
            // ranges we already retired.
            unsafe { libc::munmap(p, size) };
            hint = align_up(hint + size + GUARD_GAP, PAGE_SIZE);
            continue;
        }
        bump_high_water(addr + size + GUARD_GAP);
        note_pool_low(addr);
        return Ok(addr);
    }
    warn!("address space reservation failed after {} placements", MAX_PLACEMENT_RETRIES);
    Err(AllocError::OutOfAddressSpace)
}

/// Map `size` bytes of ordinary read/write anonymous memory with no
/// placement constraint. Used for sweeper-internal structures that must
/// stay out of the pool address range.
pub fn map_plain(size: usize) -> Result<usize> {
    let p = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        warn!("mmap failed: {}, size {}", errno::errno(), size);
        return Err(AllocError::OutOfAddressSpace);
    }
    Ok(p as usize)
}

/// Reserve `size` bytes of inaccessible address space (committed later
/// piece by piece with `commit`).
pub fn reserve_plain(size: usize) -> Result<usize> {
    let p = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        warn!("reserve failed: {}, size {}", errno::errno(), size);
        return Err(AllocError::OutOfAddressSpace);
    }
    Ok(p as usize)
}

/// Make a previously reserved or decommitted range accessible again.
/// The pages read as zero afterwards.
pub fn commit(addr: usize, size: usize) -> bool {
    let err = unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) };
    if err != 0 {
        warn!("commit error: addr {:#x}, size {:#x}, errno {}", addr, size, errno::errno().0);
    }
    err == 0
}

/// Return the physical pages behind a range to the OS and make the range
/// inaccessible, while keeping the address range reserved. Subsequent
/// touches fault; the addresses stay dead until explicitly recommitted.
pub fn decommit(addr: usize, size: usize) -> bool {
    debug_assert!(addr % PAGE_SIZE == 0 && size % PAGE_SIZE == 0);
    unsafe {
        if libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) != 0 {
            warn!("madvise error: addr {:#x}, size {:#x}, errno {}", addr, size, errno::errno().0);
            return false;
        }
        if libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE) != 0 {
            warn!("mprotect error: addr {:#x}, size {:#x}, errno {}", addr, size, errno::errno().0);
            return false;
        }
    }
    true
}

/// Drop the physical pages behind a range but keep it mapped read/write.
/// The next touch faults in a zero page. Used to clear the mark bitmap.
pub fn discard(addr: usize, size: usize) -> bool {
    let err = unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) };
    if err != 0 {
        warn!("madvise error: addr {:#x}, size {:#x}, errno {}", addr, size, errno::errno().0);
    }
    err == 0
}

/// Fully unmap a range. The addresses become available to foreign
/// mappings, but this allocator will never place a pool there again.
pub fn release(addr: usize, size: usize) {
    let err = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if err != 0 {
        warn!("munmap failed: {}, addr {:#x}, size {}", errno::errno(), addr, size);
    }
}
