//! Error types for hook construction

use a64hook_alloc::AllocError;

/// Error type for trampoline build operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The prologue cannot be safely relocated
    #[error("prologue at {address:#x} cannot be relocated")]
    Unhookable { address: usize },

    /// Every scratch register is live across the prologue
    #[error("no scratch register free in prologue at {address:#x}")]
    NoScratchRegister { address: usize },

    /// The trampoline was out of branch range and no deflector could be
    /// placed either
    #[error("no deflector obtainable near {address:#x}")]
    DeflectorUnavailable { address: usize },

    /// Executable memory allocation failed outright
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),
}
