// fwdalloc - forward-only, use-after-free-resistant heap allocator
//
// The virtual address of a freed object is never handed out again for
// a different object: pools only move forward through address space,
// and physical memory returns to the OS at page granularity once a
// page holds no live data. A concurrent conservative sweeper scans the
// process's writable memory for possible pointers and recycles whole
// pools (and, optionally, individual sub-page slots) that are provably
// unreferenced, bounding permanent address-space growth.
//
// Linux, 64-bit only. The C entry-point shims that interpose
// malloc/free live outside this crate; the same contract is exposed
// here as a Rust API.

pub mod api;
pub mod arena;
pub mod error;
pub mod large;
pub mod metadata;
pub mod os;
pub mod pool;
pub mod radix;
#[cfg(feature = "sweeper")]
pub mod sweep;
pub mod tcache;
pub mod types;

pub use api::{
    aligned_alloc, alloc, arena_alloc, arena_create, arena_destroy, arena_free, calloc, free,
    posix_memalign, realloc, shutdown, usable_size,
};
pub use error::{AllocError, Result};
#[cfg(feature = "sweeper")]
pub use sweep::{configure, force_cycle, SweepConfig};
