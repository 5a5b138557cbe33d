// # Process Memory Map Walker
//
// Parses `/proc/self/maps` into typed regions so the sweeper can pick
// its root set: writable, non-executable, private mappings that are not
// part of the allocator itself.

use log::warn;

/// Borrowed view of one maps line. Used on paths that must not touch
/// any allocator (the sweeper parses the map while mutators are
/// suspended, and a suspended thread may hold the libc heap lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRegion<'a> {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub private: bool,
    pub path: Option<&'a str>,
}

impl RawRegion<'_> {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRegion {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub private: bool,
    pub path: Option<String>,
}

impl MapRegion {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Parse one maps line without allocating, e.g.
/// `7f12aa000000-7f12aa021000 rw-p 00000000 00:00 0 [stack]`.
pub fn parse_line_raw(line: &str) -> Option<RawRegion<'_>> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    // offset, dev, inode
    let _ = fields.next()?;
    let _ = fields.next()?;
    let _ = fields.next()?;
    let path = fields.next();

    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let perms = perms.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    Some(RawRegion {
        start,
        end,
        readable: perms[0] == b'r',
        writable: perms[1] == b'w',
        executable: perms[2] == b'x',
        private: perms[3] == b'p',
        path,
    })
}

pub fn parse_line(line: &str) -> Option<MapRegion> {
    let raw = parse_line_raw(line)?;
    Some(MapRegion {
        start: raw.start,
        end: raw.end,
        readable: raw.readable,
        writable: raw.writable,
        executable: raw.executable,
        private: raw.private,
        path: raw.path.map(str::to_owned),
    })
}

/// Read `/proc/self/maps` into `buf` using only raw syscalls and the
/// buffer's existing capacity. Returns false when the file does not
/// fit or cannot be read; the caller grows the buffer (outside any
/// suspension window) and retries, or abandons the cycle.
pub fn read_into(buf: &mut Vec<u8>) -> bool {
    let fd = unsafe { libc::open(b"/proc/self/maps\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    if fd < 0 {
        warn!("cannot open /proc/self/maps: {}", errno::errno());
        return false;
    }
    let cap = buf.capacity();
    buf.clear();
    let mut len = 0usize;
    let ok = loop {
        if len == cap {
            break false;
        }
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr().add(len) as *mut libc::c_void, cap - len)
        };
        if n < 0 {
            if errno::errno().0 == libc::EINTR {
                continue;
            }
            break false;
        }
        if n == 0 {
            break true;
        }
        len += n as usize;
    };
    unsafe { libc::close(fd) };
    if ok {
        unsafe { buf.set_len(len) };
    }
    ok
}

/// Snapshot the current memory map. Returns an empty vector on failure;
/// the sweeper treats that as "no roots" and skips the cycle.
pub fn walk() -> Vec<MapRegion> {
    let text = match std::fs::read_to_string("/proc/self/maps") {
        Ok(t) => t,
        Err(e) => {
            warn!("cannot read /proc/self/maps: {}", e);
            return Vec::new();
        }
    };
    text.lines().filter_map(parse_line).collect()
}
