//! KAIST educational Operating System.
//!
//! The parts of the host kernel the hypervisor's memory core depends on: the physical page
//! allocator and the file store that guest images are read from.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod fs;
pub mod mm;

pub use abyss::addressing;

/// Synchronization primitives.
pub mod sync {
    pub use spin_lock::{SpinLock, SpinLockGuard, TryLockError};
}
