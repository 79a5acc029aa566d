//! a64hook core - AArch64 function interception
//!
//! Rewrites the first 4, 8 or 16 bytes of a target function into a
//! redirect that routes every call through shared enter/leave thunks,
//! with a per-function trampoline holding a relocated copy of the
//! displaced prologue.
//!
//! The embedding hook manager owns each [`FunctionContext`], serialises
//! backend calls, and is responsible for memory protection, thread
//! suspension and instruction-cache maintenance around activation.
//!
//! # Modules
//!
//! - [`backend`] - backend state and the shared CPU-state thunks
//! - [`context`] - the saved CPU context callbacks receive
//! - [`function`] - per-function hook state
//! - [`error`] - failure conditions

pub mod backend;
pub mod context;
pub mod error;
pub mod function;
mod patcher;
mod trampoline;

pub use a64hook_alloc::{AddressSpec, AllocError, CodeAllocator, CodeDeflector, CodeSlice};
pub use backend::InterceptorBackend;
pub use context::{CpuContext, VectorReg};
pub use error::HookError;
pub use function::{
    BackendData, BeginInvocationFn, EndInvocationFn, FunctionContext, InvocationCallbacks,
    BACKEND_DATA_SIZE,
};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::context::CpuContext;
    use crate::function::{FunctionContext, InvocationCallbacks};

    pub(crate) const NOP: u32 = 0xD503_201F;
    pub(crate) const RET: u32 = 0xD65F_03C0;
    pub(crate) const STP_FP_LR: u32 = 0xA9BF_7BFD;
    pub(crate) const MOV_FP_SP: u32 = 0x9100_03FD;
    pub(crate) const SUB_SP_32: u32 = 0xD100_83FF;

    pub(crate) unsafe extern "C" fn begin_stub(
        _ctx: *mut FunctionContext,
        _cpu: *mut CpuContext,
        _lr_slot: *mut u64,
        next_hop: *mut u64,
    ) {
        unsafe { *next_hop = 0 };
    }

    pub(crate) unsafe extern "C" fn end_stub(
        _ctx: *mut FunctionContext,
        _cpu: *mut CpuContext,
        next_hop: *mut u64,
    ) {
        unsafe { *next_hop = 0 };
    }

    pub(crate) fn test_callbacks() -> InvocationCallbacks {
        InvocationCallbacks {
            begin: begin_stub,
            end: end_stub,
        }
    }

    /// A word-aligned fake function body, padded to at least 8 words so
    /// the reach probe never reads past it.
    pub(crate) fn make_func(words: &[u32]) -> Vec<u32> {
        let mut body = words.to_vec();
        while body.len() < 8 {
            body.push(NOP);
        }
        body
    }

    pub(crate) fn read_word(base: *const u8, index: usize) -> u32 {
        // SAFETY: callers index within code they just emitted
        unsafe { std::ptr::read_unaligned((base as *const u32).add(index)) }
    }

    pub(crate) fn read_u64(base: *const u8, byte_offset: usize) -> u64 {
        // SAFETY: callers index within code they just emitted
        unsafe { std::ptr::read_unaligned(base.add(byte_offset) as *const u64) }
    }

    pub(crate) fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }
}
