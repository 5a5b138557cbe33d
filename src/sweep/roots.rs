// # Root Enumeration
//
// Builds the list of memory ranges the scanners treat as pointer
// sources: every writable, non-executable, private mapping of the
// process except the allocator's own structures (metadata arena, the
// pool range itself, the mark bitmap, and the sweeper threads' stacks).
// Heap pools are scanned separately through their metadata, so live
// heap objects still reach other heap objects transitively.
//
// `enumerate_into` works entirely inside pre-reserved buffers. The
// stop-the-world phase re-enumerates while mutators are parked, and a
// parked thread may sit on the libc heap lock, so nothing on that path
// may allocate.

use crate::arena::heap;
use crate::os::{proc_maps, vm};

const SKIP_PATHS: [&str; 3] = ["[vvar]", "[vsyscall]", "[vdso]"];

fn push_bounded<T>(v: &mut Vec<T>, x: T) -> bool {
    if v.len() == v.capacity() {
        return false;
    }
    v.push(x);
    true
}

/// Subtract sorted, non-overlapping exclusions from `[start, end)` and
/// emit what remains. Returns false when `out` runs out of room.
fn subtract(start: usize, end: usize, exclusions: &[(usize, usize)], out: &mut Vec<(usize, usize)>) -> bool {
    let mut cursor = start;
    for &(xs, xe) in exclusions {
        if xe <= cursor {
            continue;
        }
        if xs >= end {
            break;
        }
        if xs > cursor && !push_bounded(out, (cursor, xs.min(end))) {
            return false;
        }
        cursor = cursor.max(xe);
        if cursor >= end {
            return true;
        }
    }
    if cursor < end {
        return push_bounded(out, (cursor, end));
    }
    true
}

/// Enumerate scan roots into pre-reserved buffers without allocating.
/// `probes` are stack addresses of sweeper threads; any mapping
/// containing one is the sweeper's own stack and is skipped wholesale,
/// or its dead frames would retain every pool they ever pointed at.
///
/// Returns false when a buffer is too small or the map cannot be read;
/// the cycle must then be abandoned, never run on partial roots.
pub fn enumerate_into(
    probes: &[usize],
    maps_buf: &mut Vec<u8>,
    exclusions: &mut Vec<(usize, usize)>,
    out: &mut Vec<(usize, usize)>,
) -> bool {
    let h = heap();
    exclusions.clear();
    out.clear();

    if !push_bounded(exclusions, h.meta.range()) {
        return false;
    }
    let low = vm::pool_low();
    if low != usize::MAX && !push_bounded(exclusions, (low, vm::high_water())) {
        return false;
    }
    if !h.sweep.bitmap.leaf_regions_bounded(exclusions) {
        return false;
    }
    exclusions.sort_unstable();

    if !proc_maps::read_into(maps_buf) {
        return false;
    }
    let text = match std::str::from_utf8(maps_buf) {
        Ok(t) => t,
        Err(_) => return false,
    };
    for region in text.lines().filter_map(proc_maps::parse_line_raw) {
        if !region.writable || region.executable || !region.private {
            continue;
        }
        if let Some(path) = region.path {
            if SKIP_PATHS.iter().any(|&s| path == s) {
                continue;
            }
        }
        if probes.iter().any(|&p| region.contains(p)) {
            continue;
        }
        if !subtract(region.start, region.end, exclusions, out) {
            return false;
        }
    }
    true
}

/// Allocating wrapper for the concurrent phase: grow the buffers until
/// the enumeration fits.
pub fn enumerate(probes: &[usize]) -> Vec<(usize, usize)> {
    let mut maps_buf = Vec::with_capacity(1 << 20);
    let mut exclusions = Vec::with_capacity(4352);
    let mut out = Vec::with_capacity(1024);
    loop {
        if enumerate_into(probes, &mut maps_buf, &mut exclusions, &mut out) {
            return out;
        }
        if maps_buf.capacity() > 1 << 28 {
            // Give up rather than grow without bound; the caller skips
            // the cycle.
            out.clear();
            return out;
        }
        maps_buf.reserve(maps_buf.capacity() * 2);
        exclusions.reserve(exclusions.capacity() * 2);
        out.reserve(out.capacity() * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtract_vec(start: usize, end: usize, excl: &[(usize, usize)]) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(16);
        assert!(subtract(start, end, excl, &mut out));
        out
    }

    #[test]
    fn subtract_carves_out_exclusions() {
        assert_eq!(
            subtract_vec(100, 200, &[(120, 130), (150, 160)]),
            vec![(100, 120), (130, 150), (160, 200)]
        );
    }

    #[test]
    fn subtract_handles_covering_exclusion() {
        assert!(subtract_vec(100, 200, &[(50, 250)]).is_empty());
    }

    #[test]
    fn subtract_without_overlap_keeps_the_range() {
        assert_eq!(subtract_vec(100, 200, &[(0, 50), (300, 400)]), vec![(100, 200)]);
    }

    #[test]
    fn subtract_reports_overflow() {
        let mut out = Vec::with_capacity(1);
        assert!(!subtract(100, 200, &[(120, 130), (150, 160)], &mut out));
    }

    #[test]
    fn enumerate_excludes_the_sweeper_stack_probe() {
        let probe = 0usize;
        let probe_addr = &probe as *const usize as usize;
        let roots = enumerate(&[probe_addr]);
        assert!(!roots.is_empty());
        assert!(!roots.iter().any(|&(s, e)| probe_addr >= s && probe_addr < e));
    }

    #[test]
    fn enumerate_excludes_the_metadata_arena() {
        let (ms, me) = heap().meta.range();
        let mid = (ms + me) / 2;
        let roots = enumerate(&[]);
        assert!(!roots.iter().any(|&(s, e)| mid >= s && mid < e));
    }
}
