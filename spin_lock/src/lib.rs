#![cfg_attr(not(test), no_std)]

pub mod smplock;
pub use smplock::*;
