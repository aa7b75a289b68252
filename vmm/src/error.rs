use crate::ept::EptError;
use keos::fs;

/// Error while constructing a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The extended page table refused an operation.
    #[error("ept: {0}")]
    Ept(#[from] EptError),
    /// The guest image is malformed.
    #[error("bad image: {0}")]
    BadImage(&'static str),
    /// The image store failed to produce the guest image.
    #[error("i/o failure: {0}")]
    IoFailure(#[from] fs::Error),
    /// Guest-physical address outside of the guest's memory.
    #[error("guest-physical address out of range")]
    GpaOutOfRange,
}
