//! Concurrent fixed-size slab allocator.
//!
//! One [`Slab`] instance serves objects of a single size (8 to 4096 bytes)
//! out of a reserved range of 4kb pages, growing and shrinking its physical
//! footprint with demand. Allocation is lock-free (hash-seeded scans over
//! cacheline-spread atomic bitmaps, one CAS per probed word), deallocation
//! is wait-free, and any number of threads may call both concurrently.
//!
//! Intended for workloads that hammer a general-purpose malloc with small
//! uniform objects: per-connection state, per-task control blocks, message
//! envelopes.
//!
//! ```no_run
//! let slab = bitslab::Slab::new(64, 16).unwrap();
//! let p = slab.alloc().unwrap();
//! unsafe { slab.free(p.as_ptr()) };
//! ```

mod internal;
mod options;
mod os;
mod slab;
mod stats;
mod types;

pub use crate::slab::Slab;
pub use crate::types::{SlabError, SlabStats};
