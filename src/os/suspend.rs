// # Mutator Suspension
//
// Parks every thread of the process (except the sweeper's own) for the
// stop-the-world phase. Threads are enumerated from /proc/self/task
// with raw syscalls and stopped with a thread-directed signal; the
// handler posts an ack and sleeps in `sigsuspend` until the resume
// signal arrives. The kernel spills the interrupted register file into
// the signal frame on the thread's own stack, so a conservative stack
// scan observes every register-held pointer.
//
// The stop handler's sa_mask blocks the resume signal, so a resume
// sent between the ack and the `sigsuspend` stays pending instead of
// being swallowed; `sigsuspend` then returns immediately.
//
// Everything on the suspend/resume path after the first thread stops
// must avoid the libc heap: a stopped thread may own its lock.

use std::mem;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::warn;
use parking_lot::{Mutex, MutexGuard};

pub const STOP_SIGNAL: libc::c_int = libc::SIGUSR1;
pub const RESUME_SIGNAL: libc::c_int = libc::SIGUSR2;

/// Acks outstanding longer than this mean a target thread died mid
/// protocol; the cycle is abandoned rather than waited on forever.
const ACK_TIMEOUT_SECS: i64 = 5;

static STOP_ACK: AtomicPtr<libc::sem_t> = AtomicPtr::new(null_mut());
static RESUME_ACK: AtomicPtr<libc::sem_t> = AtomicPtr::new(null_mut());

/// Sweeper-internal thread ids, never to be stopped.
static EXEMPT: Mutex<Vec<libc::pid_t>> = Mutex::new(Vec::new());

extern "C" fn stop_handler(_sig: libc::c_int) {
    unsafe {
        let stop_ack = STOP_ACK.load(Ordering::Acquire);
        let resume_ack = RESUME_ACK.load(Ordering::Acquire);
        if stop_ack.is_null() || resume_ack.is_null() {
            return;
        }
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::sigdelset(&mut mask, RESUME_SIGNAL);
        libc::sem_post(stop_ack);
        libc::sigsuspend(&mask);
        libc::sem_post(resume_ack);
    }
}

extern "C" fn resume_handler(_sig: libc::c_int) {
    // Delivery alone terminates the sigsuspend in stop_handler.
}

fn new_sem() -> *mut libc::sem_t {
    unsafe {
        let sem = Box::into_raw(Box::new(mem::zeroed::<libc::sem_t>()));
        if libc::sem_init(sem, 0, 0) != 0 {
            warn!("sem_init failed: {}", errno::errno());
        }
        sem
    }
}

/// Install the stop/resume handlers and the ack semaphores. Called
/// once from global initialization.
pub fn install() {
    STOP_ACK.store(new_sem(), Ordering::Release);
    RESUME_ACK.store(new_sem(), Ordering::Release);
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = stop_handler as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        // Hold resume back while the stop handler runs, so it can only
        // land inside the sigsuspend.
        libc::sigaddset(&mut sa.sa_mask, RESUME_SIGNAL);
        sa.sa_flags = libc::SA_RESTART;
        if libc::sigaction(STOP_SIGNAL, &sa, null_mut()) != 0 {
            warn!("sigaction(stop) failed: {}", errno::errno());
        }
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = resume_handler as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESTART;
        if libc::sigaction(RESUME_SIGNAL, &sa, null_mut()) != 0 {
            warn!("sigaction(resume) failed: {}", errno::errno());
        }
    }
}

fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn tgkill(tid: libc::pid_t, sig: libc::c_int) -> bool {
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) == 0 }
}

/// Mark the calling thread as sweeper-internal: block both protocol
/// signals and exempt it from suspension.
pub fn exempt_current() {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, STOP_SIGNAL);
        libc::sigaddset(&mut set, RESUME_SIGNAL);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, null_mut());
    }
    EXEMPT.lock().push(gettid());
}

/// Walk /proc/self/task with raw syscalls (no allocation, no libc
/// stdio). Returns false when the directory cannot be read.
fn for_each_task(mut f: impl FnMut(libc::pid_t)) -> bool {
    let fd = unsafe {
        libc::open(
            b"/proc/self/task\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_DIRECTORY,
        )
    };
    if fd < 0 {
        return false;
    }
    let mut buf = [0u8; 1 << 15];
    let ok = loop {
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n == 0 {
            break true;
        }
        if n < 0 {
            break false;
        }
        let mut off = 0usize;
        while off < n as usize {
            // struct linux_dirent64: ino, off, reclen at byte 16,
            // type, then the NUL-terminated name.
            let reclen = u16::from_ne_bytes([buf[off + 16], buf[off + 17]]) as usize;
            let name = &buf[off + 19..off + reclen];
            let mut tid: libc::pid_t = 0;
            let mut digits = false;
            for &b in name {
                if b == 0 {
                    break;
                }
                if !b.is_ascii_digit() {
                    digits = false;
                    break;
                }
                digits = true;
                tid = tid * 10 + (b - b'0') as libc::pid_t;
            }
            if digits {
                f(tid);
            }
            off += reclen;
        }
    };
    unsafe { libc::close(fd) };
    ok
}

fn sem_wait_timeout(sem: *mut libc::sem_t) -> bool {
    unsafe {
        let mut ts: libc::timespec = mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        ts.tv_sec += ACK_TIMEOUT_SECS;
        loop {
            if libc::sem_timedwait(sem, &ts) == 0 {
                return true;
            }
            match errno::errno().0 {
                libc::EINTR => continue,
                libc::ETIMEDOUT => {
                    warn!("suspension ack timed out");
                    return false;
                }
                _ => {
                    warn!("sem_timedwait failed: {}", errno::errno());
                    return false;
                }
            }
        }
    }
}

/// Holds every other non-exempt thread of the process parked.
pub struct SuspendGuard {
    _exempt: MutexGuard<'static, Vec<libc::pid_t>>,
    stopped: Vec<libc::pid_t>,
    complete: bool,
}

/// Stop the world. Threads spawned while stopping are caught by
/// re-reading the task list until a pass stops no one new. All
/// allocation happens before the first signal is sent.
pub fn suspend_all() -> SuspendGuard {
    let me = gettid();
    let mut estimated = 0usize;
    for_each_task(|_| estimated += 1);
    let mut stopped: Vec<libc::pid_t> = Vec::with_capacity(estimated * 2 + 64);
    let exempt = EXEMPT.lock();
    let stop_ack = STOP_ACK.load(Ordering::Acquire);

    let mut complete = true;
    loop {
        let mut newly = 0usize;
        let listed = for_each_task(|tid| {
            if tid == me || exempt.contains(&tid) || stopped.contains(&tid) {
                return;
            }
            if stopped.len() == stopped.capacity() {
                complete = false;
                return;
            }
            if tgkill(tid, STOP_SIGNAL) {
                stopped.push(tid);
                newly += 1;
            }
        });
        if !listed {
            complete = false;
        }
        for _ in 0..newly {
            if !sem_wait_timeout(stop_ack) {
                complete = false;
            }
        }
        if newly == 0 {
            break;
        }
    }
    SuspendGuard {
        _exempt: exempt,
        stopped,
        complete,
    }
}

impl SuspendGuard {
    /// Number of threads currently parked.
    pub fn stopped_count(&self) -> usize {
        self.stopped.len()
    }

    /// Whether every enumerated thread acknowledged its suspension.
    /// An incomplete pause poisons the cycle.
    pub fn complete(&self) -> bool {
        self.complete
    }

    /// Wake every parked thread and wait until each has left its
    /// handler.
    pub fn resume(self) {
        let resume_ack = RESUME_ACK.load(Ordering::Acquire);
        for &tid in &self.stopped {
            if !tgkill(tid, RESUME_SIGNAL) {
                warn!("resume of thread {} failed: {}", tid, errno::errno());
            }
        }
        for _ in 0..self.stopped.len() {
            if !sem_wait_timeout(resume_ack) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn task_walk_sees_this_thread() {
        let me = gettid();
        let mut seen = false;
        assert!(for_each_task(|tid| seen |= tid == me));
        assert!(seen);
    }

    #[test]
    fn suspend_parks_running_threads() {
        install();
        let running = Arc::new(AtomicBool::new(true));
        let counter = Arc::new(AtomicU64::new(0));
        let (r, c) = (running.clone(), counter.clone());
        let handle = std::thread::spawn(move || {
            while r.load(Ordering::Acquire) {
                c.fetch_add(1, Ordering::Relaxed);
            }
        });
        while counter.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }

        let guard = suspend_all();
        assert!(guard.stopped_count() >= 1);
        assert!(guard.complete());
        let before = counter.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        let after = counter.load(Ordering::Relaxed);
        assert_eq!(before, after, "thread kept running while suspended");
        guard.resume();

        std::thread::sleep(Duration::from_millis(5));
        assert!(counter.load(Ordering::Relaxed) > after, "thread did not resume");
        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
