// # Conservative Page Sweeper
//
// Background reclamation for the forward-only allocator. A trigger
// thread watches the small-allocation rate and kicks the coordinator
// when pressure relaxes; the coordinator runs the cycle state machine
//
//   Idle -> Scanning(concurrent) -> Scanning(STW) -> Reclaim -> Idle
//
// driving a fixed crew of scanner workers. Nothing here ever reports
// an error to the mutator: a cycle that cannot run soundly is skipped
// and retried on the next trigger.

pub mod bitmap;
pub mod reclaim;
pub mod roots;
pub mod scan;
pub mod stw;
pub mod trigger;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;
use std::time::Duration;

use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::arena::{self, heap};
use crate::os::pagemap::PageStatus;
use crate::os::{suspend, vm};
use crate::pool::{PoolKind, PoolRef};
use crate::types::MAX_SCANNER;

use bitmap::MarkBitmap;
use scan::ScanShared;

/// Runtime sweeper tunables. Everything else is compile-time.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Trigger sampling period.
    pub tick: Duration,
    /// Samples in the trigger's moving average.
    pub window: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1),
            window: 10,
        }
    }
}

static CONFIG: OnceCell<SweepConfig> = OnceCell::new();

/// Install a non-default configuration. Takes effect only when called
/// before the first allocation; returns false once the sweeper has
/// already latched its config.
pub fn configure(config: SweepConfig) -> bool {
    CONFIG.set(config).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SweepState {
    Idle = 0,
    ScanConcurrent = 1,
    ScanStw = 2,
    Reclaim = 3,
}

/// Coordinator-private buffers, pre-grown during the concurrent phase
/// so the paused phase never allocates.
pub(crate) struct Scratch {
    maps: Vec<u8>,
    excl: Vec<(usize, usize)>,
    roots: Vec<(usize, usize)>,
    pools: Vec<PoolRef>,
    certified: Vec<PoolRef>,
}

impl Scratch {
    fn new() -> Self {
        Self {
            maps: Vec::with_capacity(1 << 20),
            excl: Vec::with_capacity(4352),
            roots: Vec::with_capacity(1024),
            pools: Vec::with_capacity(1024),
            certified: Vec::with_capacity(256),
        }
    }
}

pub struct Sweeper {
    pub(crate) config: SweepConfig,
    pub(crate) running: AtomicBool,
    state: AtomicU8,
    pub(crate) bitmap: MarkBitmap,
    pub(crate) page_status: PageStatus,
    pub(crate) shared: ScanShared,
    /// Set by any worker that loses page-status visibility; a poisoned
    /// cycle marks nothing reclaimable.
    pub(crate) failed: AtomicBool,
    /// Stack probes of sweeper-internal threads, excluded from roots.
    pub(crate) probes: Mutex<Vec<usize>>,
    kick: Mutex<bool>,
    kick_cv: Condvar,
    cycles: Mutex<u64>,
    cycle_cv: Condvar,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self {
            config: CONFIG.get_or_init(SweepConfig::default).clone(),
            running: AtomicBool::new(false),
            state: AtomicU8::new(SweepState::Idle as u8),
            bitmap: MarkBitmap::new(),
            page_status: PageStatus::open(),
            shared: ScanShared::new(),
            failed: AtomicBool::new(false),
            probes: Mutex::new(Vec::new()),
            kick: Mutex::new(false),
            kick_cv: Condvar::new(),
            cycles: Mutex::new(0),
            cycle_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SweepState {
        match self.state.load(Ordering::Acquire) {
            1 => SweepState::ScanConcurrent,
            2 => SweepState::ScanStw,
            3 => SweepState::Reclaim,
            _ => SweepState::Idle,
        }
    }

    fn set_state(&self, s: SweepState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Ask the coordinator for a cycle; returns immediately.
    pub fn request_cycle(&self) {
        let mut k = self.kick.lock();
        *k = true;
        self.kick_cv.notify_all();
    }

    fn wait_one_cycle(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let target = *self.cycles.lock() + 1;
        self.request_cycle();
        let mut c = self.cycles.lock();
        while *c < target && self.running.load(Ordering::Acquire) {
            self.cycle_cv.wait(&mut c);
        }
    }

    fn run_cycle(&'static self, scratch: &mut Scratch) {
        let low = vm::pool_low();
        if low == usize::MAX {
            return;
        }
        self.failed.store(false, Ordering::Release);
        self.bitmap.set_base(low);
        self.shared.low.store(low, Ordering::Release);
        self.shared.high.store(vm::high_water(), Ordering::Release);
        let probes = self.probes.lock().clone();

        // Idle -> Scanning(concurrent)
        self.set_state(SweepState::ScanConcurrent);
        if !stw::concurrent_phase(self, scratch, &probes) {
            self.set_state(SweepState::Idle);
            self.bitmap.clear();
            return;
        }

        let mut pending_total = 0;
        heap().each_arena(|a| pending_total += a.pending.len());
        stw::reserve_for_pause(scratch, pending_total);

        // Scanning(concurrent) -> Scanning(STW)
        self.set_state(SweepState::ScanStw);
        let guard = stw::stop_the_world_phase(self, scratch, &probes);

        // Scanning(STW) -> Reclaim. The bitmap is frozen; retire every
        // certified range while the world is still paused. Only
        // syscalls and lock-free structures are touched here.
        self.set_state(SweepState::Reclaim);
        scratch.certified.clear();
        if !self.failed.load(Ordering::Acquire) {
            reclaim::certify_pending(self, &mut scratch.certified);
            for &pr in &scratch.certified {
                let small = unsafe { pr.get() }.kind() == PoolKind::Small;
                arena::finalize_pool(pr, small);
            }
        }
        self.page_status.clear_soft_dirty();

        // Reclaim -> Idle
        guard.resume();
        for &pr in &scratch.certified {
            #[cfg(feature = "subpage-reuse")]
            {
                let pool = unsafe { pr.get() };
                if pool.kind() == PoolKind::Small {
                    let owner = unsafe { &*pool.arena };
                    owner.purge_reuse(pool.page_maps, crate::types::PAGES_PER_POOL);
                }
            }
            arena::recycle_pool_metadata(pr);
        }
        if !self.failed.load(Ordering::Acquire) {
            #[cfg(feature = "subpage-reuse")]
            reclaim::subpage_pass(self);
        }
        debug!(
            "sweep cycle reclaimed {} pools ({} still pending)",
            scratch.certified.len(),
            pending_total.saturating_sub(scratch.certified.len()),
        );
        self.bitmap.clear();
        self.set_state(SweepState::Idle);
    }
}

fn coordinator_main(sw: &'static Sweeper) {
    suspend::exempt_current();
    let probe = 0usize;
    sw.probes.lock().push(&probe as *const usize as usize);

    let mut scratch = Scratch::new();
    loop {
        {
            let mut k = sw.kick.lock();
            while !*k && sw.running.load(Ordering::Acquire) {
                sw.kick_cv.wait(&mut k);
            }
            if !sw.running.load(Ordering::Acquire) {
                return;
            }
            *k = false;
        }
        sw.run_cycle(&mut scratch);
        let mut c = sw.cycles.lock();
        *c += 1;
        sw.cycle_cv.notify_all();
    }
}

static STARTED: Once = Once::new();

/// Spawn the coordinator, the scanner crew, and the trigger. Runs once
/// per process, on the first allocator entry.
pub fn ensure_started() {
    STARTED.call_once(|| {
        let sw: &'static Sweeper = &heap().sweep;
        sw.running.store(true, Ordering::Release);
        let mut threads = sw.threads.lock();
        let mut spawn = |name: &str, f: Box<dyn FnOnce() + Send>| -> bool {
            match std::thread::Builder::new().name(name.to_string()).spawn(f) {
                Ok(h) => {
                    threads.push(h);
                    true
                }
                Err(e) => {
                    log::error!("cannot spawn {}: {}; sweeper disabled", name, e);
                    false
                }
            }
        };
        let mut ok = true;
        for ix in 0..MAX_SCANNER {
            ok &= spawn(&format!("fwdalloc-scan{}", ix), Box::new(move || scan::worker_main(sw, ix)));
        }
        ok &= spawn("fwdalloc-sweep", Box::new(move || coordinator_main(sw)));
        ok &= spawn("fwdalloc-trigger", Box::new(move || trigger::trigger_main(sw)));
        if !ok {
            sw.running.store(false, Ordering::Release);
            sw.shutdown_workers();
            sw.request_cycle();
        }
    });
}

/// Run one full cycle synchronously. A cycle already in flight when
/// this is called may have scanned before the caller's latest frees,
/// so two waits guarantee one complete post-call cycle.
pub fn force_cycle() {
    ensure_started();
    let sw = &heap().sweep;
    sw.wait_one_cycle();
    sw.wait_one_cycle();
}

/// Stop every sweeper thread and join them. Idempotent; the allocator
/// keeps working without reclamation afterwards.
pub fn shutdown() {
    let sw = &heap().sweep;
    if !sw.running.swap(false, Ordering::AcqRel) {
        return;
    }
    sw.request_cycle();
    sw.shutdown_workers();
    sw.cycle_cv.notify_all();
    let handles: Vec<_> = sw.threads.lock().drain(..).collect();
    for h in handles {
        let _ = h.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweeper_reaches_idle_after_a_forced_cycle() {
        // Materialise at least one pool so the cycle has a range.
        let p = crate::api::alloc(64);
        force_cycle();
        assert_eq!(heap().sweep.state(), SweepState::Idle);
        crate::api::free(p);
    }

    #[test]
    fn forced_cycles_advance_the_counter() {
        let p = crate::api::alloc(64);
        let before = *heap().sweep.cycles.lock();
        force_cycle();
        let after = *heap().sweep.cycles.lock();
        assert!(after >= before + 2);
        crate::api::free(p);
    }
}
