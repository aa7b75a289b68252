//! Invalidation of cached EPT translations.
//!
//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings
//!
//! Processors cache guest-physical and combined mappings derived from an EPT hierarchy.
//! Whenever entries are removed from the hierarchy, those caches must be flushed with `INVEPT`
//! before the released frames can be handed to anyone else.

/// Types of INVEPT operations.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate mappings associated with a single EPTP value.
    SingleContext = 1,
    /// Invalidate mappings associated with all EPTP values.
    AllContexts = 2,
}

/// Capability to drop cached translations of an EPT hierarchy.
///
/// The hypervisor receives this capability instead of executing `INVEPT` itself, so that the
/// memory core can run where VMX is not available.
pub trait EptInvalidator: Send + Sync {
    /// Invalidate every cached translation derived from the hierarchy `eptp` points to.
    fn invalidate(&self, eptp: u64);
}

/// Invalidator that executes the `INVEPT` instruction.
///
/// Only usable in VMX root operation.
#[derive(Debug, Clone, Copy)]
pub struct Invept(pub InveptType);

impl Default for Invept {
    fn default() -> Self {
        Self(InveptType::SingleContext)
    }
}

#[cfg(target_arch = "x86_64")]
impl EptInvalidator for Invept {
    fn invalidate(&self, eptp: u64) {
        // For all-context invalidation the descriptor's EPTP half is ignored.
        let descriptor: [u64; 2] = match self.0 {
            InveptType::SingleContext => [eptp, 0],
            InveptType::AllContexts => [0, 0],
        };
        log::trace!("invept {:?} {:#x}", self.0, eptp);
        unsafe {
            core::arch::asm!(
                "invept {0}, [{1}]",
                in(reg) self.0 as u64,
                in(reg) &descriptor,
                options(nostack)
            );
        }
    }
}

impl<T: EptInvalidator + ?Sized> EptInvalidator for &T {
    fn invalidate(&self, eptp: u64) {
        (**self).invalidate(eptp)
    }
}

impl<T: EptInvalidator + ?Sized> EptInvalidator for alloc::sync::Arc<T> {
    fn invalidate(&self, eptp: u64) {
        (**self).invalidate(eptp)
    }
}
