// # Cycle Trigger
//
// Samples the small-allocation counter once per tick and keeps a
// moving average over the last few samples. A cycle is requested only
// when the current tick dropped below the average but stayed nonzero,
// and only once per such slump: the stop-the-world pause lands where
// allocation pressure has just relaxed, where reclaimable garbage is
// most likely to exist.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Sweeper;
use crate::os::suspend;

static SMALL_ALLOCS: AtomicU64 = AtomicU64::new(0);

/// Fast-path hook: one small allocation happened.
#[inline]
pub fn record_small_alloc() {
    SMALL_ALLOCS.fetch_add(1, Ordering::Relaxed);
}

/// One tick's decision. Returns (fire, new_descent). `descent` latches
/// after a fired cycle and re-arms once the rate climbs back to the
/// average, so one slump triggers one cycle.
pub(super) fn decide(avg: u64, current: u64, descent: bool) -> (bool, bool) {
    let fire = avg > current && current > 0 && !descent;
    let new_descent = if current >= avg { false } else { fire || descent };
    (fire, new_descent)
}

pub(super) fn trigger_main(sw: &'static Sweeper) {
    suspend::exempt_current();
    let probe = 0usize;
    sw.probes.lock().push(&probe as *const usize as usize);

    let window = sw.config.window.max(1);
    let mut samples: VecDeque<u64> = VecDeque::with_capacity(window);
    let mut descent = false;
    while sw.running.load(Ordering::Acquire) {
        std::thread::sleep(sw.config.tick);
        let current = SMALL_ALLOCS.swap(0, Ordering::Relaxed);
        if samples.len() == window {
            let avg = samples.iter().sum::<u64>() / window as u64;
            let (fire, next) = decide(avg, current, descent);
            descent = next;
            if fire {
                sw.request_cycle();
            }
            samples.pop_front();
        }
        samples.push_back(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_when_rate_drops_below_average() {
        let (fire, descent) = decide(100, 40, false);
        assert!(fire);
        assert!(descent);
    }

    #[test]
    fn does_not_fire_at_zero_rate() {
        let (fire, descent) = decide(100, 0, false);
        assert!(!fire);
        assert!(descent);
    }

    #[test]
    fn does_not_fire_twice_in_one_slump() {
        let (fire, descent) = decide(100, 40, false);
        assert!(fire && descent);
        let (fire, descent) = decide(90, 30, descent);
        assert!(!fire && descent);
        // Rate recovers: re-armed.
        let (fire, descent) = decide(80, 90, descent);
        assert!(!fire && !descent);
        let (fire, _) = decide(85, 20, descent);
        assert!(fire);
    }

    #[test]
    fn steady_rate_never_fires() {
        let (fire, descent) = decide(50, 50, false);
        assert!(!fire && !descent);
    }
}
