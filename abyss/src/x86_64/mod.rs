//! x86_64 specific

pub mod invept;
