//! The abyss of kernel that operates hardwares.
//!
//! This crate contains the address types shared by the host kernel and the hypervisor,
//! and the few VMX instructions the guest memory core has to issue directly.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod addressing;
pub mod x86_64;
