//! Per-function trampoline construction
//!
//! For every hooked function the backend emits one slice holding three
//! entry points: an on-enter stub (loads the context handle, dives into
//! the enter thunk), an on-leave stub (same for the leave thunk), and the
//! on-invoke code (the relocated original prologue plus a branch back to
//! the first byte the redirect did not clobber).

use a64hook_alloc::{AddressSpec, CodeSlice};
use a64hook_arch::relocator::can_relocate;
use a64hook_arch::{Reg, ADRP_MAX_DISTANCE, B_MAX_DISTANCE, LOGICAL_PAGE_SIZE};

use crate::backend::InterceptorBackend;
use crate::error::HookError;
use crate::function::{FunctionContext, RedirectPlan};

impl InterceptorBackend {
    /// Decide the redirect shape for `ctx` and acquire its slice.
    ///
    /// A 4-byte `B` reaches ±128 MiB, an 8-byte `ADRP+BR` ±4 GiB on page
    /// granularity, a 16-byte `LDR+BR` anywhere; smaller redirects clobber
    /// fewer prologue bytes, so the largest cleanly relocatable overwrite
    /// picks the shape. Returns whether a deflector is still needed.
    unsafe fn prepare_trampoline(
        &mut self,
        ctx: &mut FunctionContext,
    ) -> Result<bool, HookError> {
        let address = ctx.function_address();
        let (limit, scratch) = can_relocate(address as *const u8, 16);
        tracing::debug!(
            "prologue at {:#x}: relocation limit {}, scratch {:?}",
            address,
            limit,
            scratch
        );
        let scratch = scratch.ok_or(HookError::NoScratchRegister { address })?;

        let mut need_deflector = false;
        let (redirect_code_size, slice): (u32, CodeSlice) = if limit == 16 {
            (16, self.allocator.alloc_slice()?)
        } else if limit >= 8 {
            let spec = AddressSpec::new(address & !(LOGICAL_PAGE_SIZE - 1), ADRP_MAX_DISTANCE);
            match self
                .allocator
                .try_alloc_slice_near(&spec, LOGICAL_PAGE_SIZE)
            {
                Some(slice) => (8, slice),
                None => {
                    need_deflector = true;
                    (8, self.allocator.alloc_slice()?)
                }
            }
        } else if limit >= 4 {
            let spec = AddressSpec::new(address, B_MAX_DISTANCE);
            match self.allocator.try_alloc_slice_near(&spec, 0) {
                Some(slice) => (4, slice),
                None => {
                    need_deflector = true;
                    (4, self.allocator.alloc_slice()?)
                }
            }
        } else {
            return Err(HookError::Unhookable { address });
        };

        ctx.backend_data.set_plan(RedirectPlan {
            redirect_code_size,
            scratch_reg: scratch.encoding() as u8,
        });
        ctx.trampoline_slice = Some(slice);
        Ok(need_deflector)
    }

    /// Build the trampoline for `ctx`.
    ///
    /// On failure the context is left exactly as it was before the call;
    /// [`destroy_trampoline`](Self::destroy_trampoline) stays a no-op.
    ///
    /// # Safety
    /// - `ctx.function_address()` must point to at least 16 bytes of
    ///   readable AArch64 code
    /// - `ctx` must stay at a stable address until the hook is destroyed
    ///   (the emitted stubs embed its pointer)
    /// - calls for one backend must be serialised by the caller
    pub unsafe fn create_trampoline(
        &mut self,
        ctx: &mut FunctionContext,
    ) -> Result<(), HookError> {
        let need_deflector = self.prepare_trampoline(ctx)?;
        let plan = ctx.backend_data.plan();
        let address = ctx.function_address();
        let enter_thunk = self.enter_thunk_address();
        let leave_thunk = self.leave_thunk_address();

        let InterceptorBackend {
            allocator,
            writer: w,
            relocator,
            ..
        } = self;
        let (slice_data, slice_size) = {
            let slice = ctx.trampoline_slice.as_ref().expect("slice acquired above");
            (slice.data(), slice.size())
        };

        w.reset(slice_data);
        ctx.on_enter_trampoline = w.cur();

        if need_deflector {
            let redirect = plan.redirect_code_size as usize;
            let caller = AddressSpec::new(address + redirect - 4, B_MAX_DISTANCE);
            let return_address = address + redirect;
            let dedicated = plan.redirect_code_size == 4;

            let deflector = allocator.alloc_deflector(
                &caller,
                return_address,
                ctx.on_enter_trampoline as usize,
                dedicated,
            );
            let Some(deflector) = deflector else {
                ctx.trampoline_slice = None;
                ctx.on_enter_trampoline = std::ptr::null();
                return Err(HookError::DeflectorUnavailable { address });
            };
            ctx.trampoline_deflector = Some(deflector);

            if plan.redirect_code_size == 8 {
                // the patched prologue reached us through STP {X0, LR} + BL
                w.put_pop_reg_pair(Reg::X0, Reg::Lr);
            }
        }

        w.put_ldr_reg_address(Reg::X17, ctx as *mut FunctionContext as u64);
        w.put_ldr_reg_address(Reg::X16, enter_thunk);
        w.put_br_reg(Reg::X16);

        ctx.on_leave_trampoline = w.cur();

        w.put_ldr_reg_address(Reg::X17, ctx as *mut FunctionContext as u64);
        w.put_ldr_reg_address(Reg::X16, leave_thunk);
        w.put_br_reg(Reg::X16);

        w.flush();
        assert!(w.offset() <= slice_size, "trampoline stub overflow");

        ctx.on_invoke_trampoline = w.cur();

        relocator.reset(address as *const u8);
        let reloc_bytes = loop {
            let n = relocator.read_one();
            assert!(n != 0, "relocation stalled inside the redirect region");
            if n >= plan.redirect_code_size as usize {
                break n;
            }
        };
        relocator.write_all(w);

        if !relocator.eoi() {
            let resume = (address + reloc_bytes) as u64;
            let scratch =
                Reg::from_index(plan.scratch_reg as u32).expect("plan holds a valid register");
            w.put_ldr_reg_address(scratch, resume);
            w.put_br_reg(scratch);
        }

        w.flush();
        assert!(w.offset() <= slice_size, "trampoline overflow");

        ctx.overwritten_prologue_len = reloc_bytes;
        std::ptr::copy_nonoverlapping(
            address as *const u8,
            ctx.overwritten_prologue.as_mut_ptr(),
            reloc_bytes,
        );

        tracing::info!(
            "trampoline built for {:#x}: {}-byte redirect, {} prologue bytes relocated{}",
            address,
            plan.redirect_code_size,
            reloc_bytes,
            if ctx.trampoline_deflector.is_some() {
                " via deflector"
            } else {
                ""
            }
        );
        Ok(())
    }

    /// Release `ctx`'s trampoline memory. Idempotent; safe on a context
    /// whose build failed or never ran.
    pub fn destroy_trampoline(&mut self, ctx: &mut FunctionContext) {
        ctx.trampoline_slice = None;
        ctx.trampoline_deflector = None;
    }
}
