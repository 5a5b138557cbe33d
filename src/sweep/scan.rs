// # Conservative Scan Workers
//
// Long-lived worker threads drain two producer queues (plain memory
// ranges and heap pools) and mark every word value that falls inside
// the heap address range. Each worker parks on its own binary
// semaphore between phases; the coordinator posts every gate to
// dispatch a phase and waits on the shared completion semaphore.
//
// Pages are read through process_vm_readv into a local buffer, so a
// page that vanishes between the pagemap check and the read costs a
// failed syscall instead of a fault.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;

use super::Sweeper;
use crate::os::pagemap::PageStatus;
use crate::os::suspend;
use crate::pool::{PoolKind, PoolRef};
use crate::types::{align_down, align_up, track, MAX_SCANNER, PAGES_PER_POOL, PAGE_SIZE};

/// Queue capacities. Overflowing work is scanned inline by the
/// coordinator instead of being dropped.
const RANGE_QUEUE_CAP: usize = 8192;
const POOL_QUEUE_CAP: usize = 65536;

/// Ranges are split so several workers share one big mapping.
pub(super) const RANGE_CHUNK: usize = 4 << 20;

/// Pagemap entries fetched per batch.
const BATCH_PAGES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanMode {
    /// Stop-the-world phase: every present page of the frozen world.
    AllPresent,
    /// Concurrent phase: only pages written since the soft-dirty bits
    /// were cleared at the start of the phase.
    SoftDirty,
}

/// A raw counting semaphore. Worker parking must not go through any
/// userspace lock the paused mutators might share; sem_post/sem_wait
/// talk to the kernel directly.
struct Sem(*mut libc::sem_t);

unsafe impl Send for Sem {}
unsafe impl Sync for Sem {}

impl Sem {
    fn new() -> Self {
        let sem = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        unsafe { libc::sem_init(sem, 0, 0) };
        Sem(sem)
    }

    fn post(&self) {
        unsafe { libc::sem_post(self.0) };
    }

    fn wait(&self) {
        unsafe {
            while libc::sem_wait(self.0) != 0 {
                if errno::errno().0 != libc::EINTR {
                    return;
                }
            }
        }
    }
}

pub(crate) struct ScanShared {
    pub ranges: ArrayQueue<(usize, usize)>,
    pub pools: ArrayQueue<PoolRef>,
    /// Per-worker dispatch gates and the shared completion gate.
    start: Vec<Sem>,
    done: Sem,
    mode: AtomicU8,
    shutdown: AtomicBool,
    /// Value filter for this cycle: `[low, high)` is the heap range.
    pub low: AtomicUsize,
    pub high: AtomicUsize,
}

impl ScanShared {
    pub fn new() -> Self {
        Self {
            ranges: ArrayQueue::new(RANGE_QUEUE_CAP),
            pools: ArrayQueue::new(POOL_QUEUE_CAP),
            start: (0..MAX_SCANNER).map(|_| Sem::new()).collect(),
            done: Sem::new(),
            mode: AtomicU8::new(0),
            shutdown: AtomicBool::new(false),
            low: AtomicUsize::new(0),
            high: AtomicUsize::new(0),
        }
    }

    fn mode(&self) -> ScanMode {
        if self.mode.load(Ordering::Acquire) == 0 {
            ScanMode::AllPresent
        } else {
            ScanMode::SoftDirty
        }
    }
}

impl Sweeper {
    /// Release the workers for one phase and wait until each signals
    /// completion.
    pub(super) fn dispatch_and_wait(&'static self, mode: ScanMode) {
        let mode_v = if mode == ScanMode::AllPresent { 0 } else { 1 };
        self.shared.mode.store(mode_v, Ordering::Release);
        for gate in &self.shared.start {
            gate.post();
        }
        for _ in 0..MAX_SCANNER {
            self.shared.done.wait();
        }
    }

    pub(super) fn shutdown_workers(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for gate in &self.shared.start {
            gate.post();
        }
    }

    /// Queue a range for the workers, or scan it here when the queue
    /// is full.
    pub(super) fn offer_range(&self, lo: usize, hi: usize, mode: ScanMode) {
        let mut cursor = lo;
        while cursor < hi {
            let end = (cursor + RANGE_CHUNK).min(hi);
            if self.shared.ranges.push((cursor, end)).is_err() {
                scan_range(self, cursor, end, mode);
            }
            cursor = end;
        }
    }

    pub(super) fn offer_pool(&self, pr: PoolRef, mode: ScanMode) {
        if self.shared.pools.push(pr).is_err() {
            scan_pool(self, pr, mode);
        }
    }
}

pub(super) fn worker_main(sw: &'static Sweeper, ix: usize) {
    suspend::exempt_current();
    let probe = 0usize;
    sw.probes.lock().push(&probe as *const usize as usize);

    loop {
        sw.shared.start[ix].wait();
        if sw.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        drain_work(sw, sw.shared.mode());
        sw.shared.done.post();
    }
}

/// Pop work until both queues are empty.
fn drain_work(sw: &Sweeper, mode: ScanMode) {
    loop {
        if let Some((lo, hi)) = sw.shared.ranges.pop() {
            scan_range(sw, lo, hi, mode);
            continue;
        }
        if let Some(pr) = sw.shared.pools.pop() {
            scan_pool(sw, pr, mode);
            continue;
        }
        break;
    }
}

static READV_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

/// Copy one page out of the address space without risking a fault on
/// a racing unmap.
fn read_page(addr: usize, buf: &mut [u8; PAGE_SIZE]) -> bool {
    if READV_UNSUPPORTED.load(Ordering::Relaxed) {
        // No safety net available; the pagemap filter already said the
        // page is present, and pages the mutator can unmap mid-cycle
        // are not scanned in this configuration.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), PAGE_SIZE);
        }
        return true;
    }
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: PAGE_SIZE,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: PAGE_SIZE,
    };
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if n == PAGE_SIZE as isize {
        return true;
    }
    if n < 0 && errno::errno().0 == libc::ENOSYS {
        READV_UNSUPPORTED.store(true, Ordering::Relaxed);
        return read_page(addr, buf);
    }
    false
}

/// Scan the 8-byte words of `[lo, hi)`, marking every value inside the
/// heap range.
pub(super) fn scan_range(sw: &Sweeper, lo: usize, hi: usize, mode: ScanMode) {
    let low = sw.shared.low.load(Ordering::Acquire);
    let high = sw.shared.high.load(Ordering::Acquire);
    let first_page = align_down(lo, PAGE_SIZE);
    let last_page = align_up(hi, PAGE_SIZE);

    let mut flags = [0u64; BATCH_PAGES];
    let mut buf = [0u8; PAGE_SIZE];
    let mut page = first_page;
    while page < last_page {
        let batch = ((last_page - page) / PAGE_SIZE).min(BATCH_PAGES);
        if !sw.page_status.read_range(page, &mut flags[..batch]) {
            // Cannot tell which pages are safe to read; poison the
            // cycle so no reclamation happens from partial marks.
            sw.failed.store(true, Ordering::Release);
            return;
        }
        for i in 0..batch {
            let f = PageStatus::flags(&flags, i);
            if !f.present {
                continue;
            }
            if mode == ScanMode::SoftDirty && !f.soft_dirty {
                continue;
            }
            let base = page + i * PAGE_SIZE;
            if !read_page(base, &mut buf) {
                continue;
            }
            let from = lo.max(base);
            let to = hi.min(base + PAGE_SIZE);
            let mut off = align_up(from, 8);
            while off + 8 <= to {
                let word = usize::from_ne_bytes(buf[off - base..off - base + 8].try_into().unwrap());
                if word >= low && word < high {
                    sw.bitmap.mark(word);
                }
                off += 8;
            }
        }
        page += batch * PAGE_SIZE;
    }
}

/// Scan the allocated portions of one pool, using its metadata to skip
/// freed or never-used space.
pub(super) fn scan_pool(sw: &Sweeper, pr: PoolRef, mode: ScanMode) {
    let pool = unsafe { pr.get() };
    match pool.kind() {
        PoolKind::Small => {
            for i in 0..PAGES_PER_POOL {
                let pm = pool.page_map(i);
                if pm.class_size() == 0 {
                    continue;
                }
                if pm.status() & crate::types::page_status::RETURNED != 0 {
                    continue;
                }
                if pm.is_empty() {
                    continue;
                }
                let base = pm.start.load(Ordering::Acquire);
                scan_range(sw, base, base + PAGE_SIZE, mode);
            }
        }
        PoolKind::Large => {
            let count = pool.alloc_count();
            let mut start = pool.start;
            for i in 0..count {
                let entry = pool.tracking_entry(i).load(Ordering::Acquire);
                let end = track::addr(entry);
                if track::tags(entry) & track::FREE == 0 {
                    scan_range(sw, start, end, mode);
                }
                start = end;
            }
        }
        PoolKind::Jumbo => {
            scan_range(sw, pool.start, pool.end, mode);
        }
    }
}
