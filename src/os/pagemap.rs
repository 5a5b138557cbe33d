// # Per-Page Status Queries
//
// Reader for `/proc/self/pagemap` (present and soft-dirty bits) and the
// writer that clears all soft-dirty bits through `/proc/self/clear_refs`.
// The sweeper uses these to skip pages that cannot hold fresh pointers.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use log::warn;

use crate::types::PAGE_SIZE;

const PM_PRESENT: u64 = 1 << 63;
const PM_SOFT_DIRTY: u64 = 1 << 55;

/// One pagemap entry, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags {
    pub present: bool,
    pub soft_dirty: bool,
}

impl PageFlags {
    #[inline]
    fn from_entry(entry: u64) -> Self {
        Self {
            present: entry & PM_PRESENT != 0,
            soft_dirty: entry & PM_SOFT_DIRTY != 0,
        }
    }
}

/// Open handles onto the pagemap interfaces, created once per process.
pub struct PageStatus {
    pagemap: Option<File>,
    clear_refs: Option<File>,
}

impl PageStatus {
    pub fn open() -> Self {
        let pagemap = File::open("/proc/self/pagemap")
            .map_err(|e| warn!("cannot open pagemap: {}", e))
            .ok();
        let clear_refs = OpenOptions::new()
            .write(true)
            .open("/proc/self/clear_refs")
            .map_err(|e| warn!("cannot open clear_refs: {}", e))
            .ok();
        Self { pagemap, clear_refs }
    }

    /// Read the flags of `buf.len()` consecutive pages starting at the
    /// page containing `addr`. Returns false (leaving `buf` untouched)
    /// if the read fails; callers treat that as "scan everything".
    pub fn read_range(&self, addr: usize, buf: &mut [u64]) -> bool {
        let file = match &self.pagemap {
            Some(f) => f,
            None => return false,
        };
        let offset = (addr / PAGE_SIZE) as u64 * 8;
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf.len() * 8)
        };
        match file.read_exact_at(bytes, offset) {
            Ok(()) => true,
            Err(e) => {
                warn!("pagemap read at {:#x} failed: {}", addr, e);
                false
            }
        }
    }

    /// Decode the flags of page `i` from a buffer filled by `read_range`.
    #[inline]
    pub fn flags(buf: &[u64], i: usize) -> PageFlags {
        PageFlags::from_entry(buf[i])
    }

    /// Clear every soft-dirty bit in the process. Returns false on
    /// failure; the sweeper skips the cycle rather than scan with stale
    /// dirty information.
    pub fn clear_soft_dirty(&self) -> bool {
        let file = match &self.clear_refs {
            Some(f) => f,
            None => return false,
        };
        match file.write_at(b"4", 0) {
            Ok(_) => true,
            Err(e) => {
                warn!("clear_refs write failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vm;
    use crate::types::POOL_SIZE;

    #[test]
    fn entry_decoding() {
        let f = PageFlags::from_entry(PM_PRESENT);
        assert!(f.present && !f.soft_dirty);
        let f = PageFlags::from_entry(PM_PRESENT | PM_SOFT_DIRTY);
        assert!(f.present && f.soft_dirty);
        let f = PageFlags::from_entry(0);
        assert!(!f.present && !f.soft_dirty);
    }

    #[test]
    fn touched_pages_are_present() {
        let status = PageStatus::open();
        let addr = vm::map_plain(2 * PAGE_SIZE).unwrap();
        unsafe { *(addr as *mut u8) = 1 };
        let mut buf = [0u64; 2];
        if status.read_range(addr, &mut buf) {
            assert!(PageStatus::flags(&buf, 0).present);
            // The second page was never touched.
            assert!(!PageStatus::flags(&buf, 1).present);
        }
        vm::release(addr, 2 * PAGE_SIZE);
    }

    #[test]
    fn decommit_clears_present() {
        let status = PageStatus::open();
        let addr = vm::alloc_highwater(POOL_SIZE).unwrap();
        unsafe { *(addr as *mut u8) = 1 };
        vm::decommit(addr, POOL_SIZE);
        let mut buf = [0u64; 1];
        if status.read_range(addr, &mut buf) {
            assert!(!PageStatus::flags(&buf, 0).present);
        }
        vm::release(addr, POOL_SIZE);
    }
}
