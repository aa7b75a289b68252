//! Memory virtualization of the KeV hypervisor.
//!
//! This crate owns the second-level address translation of a guest: the extended page table that
//! maps guest-physical addresses to host frames ([`ept`]), the loader that populates guest memory
//! from a kernel image and a boot sector ([`loader`]), and the guest control structure that ties
//! both together ([`vm`]).
//!
//! Physical memory is never reached through a global. Every operation goes through the
//! [`FrameAllocator`](keos::mm::FrameAllocator) the [`EptManager`](ept::EptManager) was built
//! with, and cached translations are dropped through an injected
//! [`EptInvalidator`](abyss::x86_64::invept::EptInvalidator).

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod ept;
mod error;
pub mod loader;
pub mod vm;

pub use error::VmError;
