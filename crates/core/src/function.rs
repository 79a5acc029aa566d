//! Per-function hook state
//!
//! A [`FunctionContext`] is owned by the hook manager driving this crate
//! and borrowed across every backend call. The backend fills in the
//! trampoline fields during build and reads them back during activation;
//! the generated on-enter and on-leave stubs embed the context's address,
//! so it must not move between build and destroy.

use a64hook_alloc::{CodeDeflector, CodeSlice};

use crate::context::CpuContext;

/// Space the context reserves for the redirect decision, sized for any
/// backend's private record.
pub const BACKEND_DATA_SIZE: usize = 16;

/// The reach analyser's decision for one function.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RedirectPlan {
    /// Bytes of prologue the redirect overwrites: 4, 8 or 16
    pub(crate) redirect_code_size: u32,
    /// Encoding index of the register the redirect may clobber
    pub(crate) scratch_reg: u8,
}

const _: () = assert!(std::mem::size_of::<RedirectPlan>() <= BACKEND_DATA_SIZE);

/// Opaque inline storage for the [`RedirectPlan`].
#[derive(Clone, Copy, Default)]
pub struct BackendData {
    bytes: [u8; BACKEND_DATA_SIZE],
}

impl BackendData {
    pub(crate) fn plan(&self) -> RedirectPlan {
        // SAFETY: RedirectPlan is plain data no larger than the buffer
        unsafe { std::ptr::read_unaligned(self.bytes.as_ptr() as *const RedirectPlan) }
    }

    pub(crate) fn set_plan(&mut self, plan: RedirectPlan) {
        // SAFETY: RedirectPlan is plain data no larger than the buffer
        unsafe { std::ptr::write_unaligned(self.bytes.as_mut_ptr() as *mut RedirectPlan, plan) }
    }
}

/// State of one hooked function.
pub struct FunctionContext {
    function_address: usize,
    pub(crate) trampoline_slice: Option<CodeSlice>,
    pub(crate) trampoline_deflector: Option<CodeDeflector>,
    pub(crate) on_enter_trampoline: *const u8,
    pub(crate) on_leave_trampoline: *const u8,
    pub(crate) on_invoke_trampoline: *const u8,
    pub(crate) overwritten_prologue: [u8; 16],
    pub(crate) overwritten_prologue_len: usize,
    pub(crate) backend_data: BackendData,
}

impl FunctionContext {
    pub fn new(function_address: usize) -> Self {
        Self {
            function_address,
            trampoline_slice: None,
            trampoline_deflector: None,
            on_enter_trampoline: std::ptr::null(),
            on_leave_trampoline: std::ptr::null(),
            on_invoke_trampoline: std::ptr::null(),
            overwritten_prologue: [0; 16],
            overwritten_prologue_len: 0,
            backend_data: BackendData::default(),
        }
    }

    /// Entry address of the hooked function.
    pub fn function_address(&self) -> usize {
        self.function_address
    }

    /// Stub diverting calls into the enter thunk.
    pub fn on_enter_trampoline(&self) -> *const u8 {
        self.on_enter_trampoline
    }

    /// Stub diverting returns into the leave thunk.
    pub fn on_leave_trampoline(&self) -> *const u8 {
        self.on_leave_trampoline
    }

    /// Relocated prologue; branching here runs the original function.
    pub fn on_invoke_trampoline(&self) -> *const u8 {
        self.on_invoke_trampoline
    }

    /// Snapshot of the bytes the redirect replaces.
    pub fn overwritten_prologue(&self) -> &[u8] {
        &self.overwritten_prologue[..self.overwritten_prologue_len]
    }

    /// True once a trampoline has been built and not yet destroyed.
    pub fn has_trampoline(&self) -> bool {
        self.trampoline_slice.is_some()
    }
}

/// `begin_invocation(ctx, cpu, lr_slot, next_hop_slot)`: runs on every
/// entry to a hooked function. Must store the next program counter into
/// `next_hop_slot`; may rewrite `lr_slot` to capture the return.
pub type BeginInvocationFn =
    unsafe extern "C" fn(*mut FunctionContext, *mut CpuContext, *mut u64, *mut u64);

/// `end_invocation(ctx, cpu, next_hop_slot)`: runs when a captured return
/// fires. Must store the next program counter into `next_hop_slot`.
pub type EndInvocationFn = unsafe extern "C" fn(*mut FunctionContext, *mut CpuContext, *mut u64);

/// The pair of high-level callbacks the thunks dispatch to.
#[derive(Clone, Copy)]
pub struct InvocationCallbacks {
    pub begin: BeginInvocationFn,
    pub end: EndInvocationFn,
}
