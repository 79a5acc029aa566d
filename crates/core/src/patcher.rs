//! Redirect installation and removal
//!
//! The host grants writable access to the prologue and handles thread
//! suspension, protection transitions and cache maintenance; this module
//! only ever writes whole 32-bit words, staged through a pointer that may
//! differ from the executing address.

use a64hook_arch::{reader, Reg};

use crate::backend::InterceptorBackend;
use crate::function::FunctionContext;

impl InterceptorBackend {
    /// Write the redirect for `ctx` over its prologue.
    ///
    /// `prologue` is a writable view of the bytes at
    /// `ctx.function_address()`; the writer's pc is pinned to the real
    /// address so PC-relative encodings resolve there. The final branch
    /// word is always written last: a thread resuming mid-patch executes
    /// either the unchanged original or the complete redirect, never a
    /// branch whose operand word is missing.
    ///
    /// # Safety
    /// - `ctx` must hold a built trampoline
    /// - `prologue` must be writable for `redirect` size bytes and alias
    ///   the target prologue
    /// - other threads must be kept out of the region by the host for any
    ///   redirect wider than one word
    pub unsafe fn activate_trampoline(&mut self, ctx: &mut FunctionContext, prologue: *mut u8) {
        let plan = ctx.backend_data.plan();
        let on_enter = ctx.on_enter_trampoline as u64;
        let w = &mut self.writer;
        w.reset(prologue);
        w.pc = ctx.function_address() as u64;

        if let Some(deflector) = &ctx.trampoline_deflector {
            match plan.redirect_code_size {
                8 => {
                    w.put_push_reg_pair(Reg::X0, Reg::Lr);
                    w.put_bl_imm(deflector.trampoline() as u64);
                }
                4 => w.put_b_imm(deflector.trampoline() as u64),
                _ => unreachable!("deflectors never pair with a 16-byte redirect"),
            }
        } else {
            match plan.redirect_code_size {
                4 => w.put_b_imm(on_enter),
                8 => {
                    w.put_adrp_reg_address(Reg::X16, on_enter);
                    w.put_br_reg(Reg::X16);
                }
                16 => {
                    w.put_ldr_reg_lit(Reg::X16, 8);
                    // pool word goes in before the BR
                    std::ptr::write_unaligned(prologue.add(8) as *mut u64, on_enter);
                    w.put_br_reg(Reg::X16);
                }
                _ => unreachable!("redirect size is always 4, 8 or 16"),
            }
        }

        assert!(
            w.offset() <= plan.redirect_code_size as usize,
            "redirect overflow"
        );
        tracing::debug!(
            "redirect installed at {:#x} -> {:#x}",
            ctx.function_address(),
            on_enter
        );
    }

    /// Restore the original prologue bytes.
    ///
    /// # Safety
    /// `prologue` must be writable and alias the target prologue of a
    /// context whose trampoline was built.
    pub unsafe fn deactivate_trampoline(&mut self, ctx: &mut FunctionContext, prologue: *mut u8) {
        std::ptr::copy_nonoverlapping(
            ctx.overwritten_prologue.as_ptr(),
            prologue,
            ctx.overwritten_prologue_len,
        );
        tracing::debug!("redirect removed from {:#x}", ctx.function_address());
    }

    /// If `address` holds an unconditional PC-relative jump, return its
    /// destination; lets the embedding manager walk redirect chains.
    ///
    /// # Safety
    /// `address` must point to at least 16 bytes of readable memory.
    pub unsafe fn resolve_redirect(&self, address: *const u8) -> Option<*const u8> {
        reader::try_get_relative_jump_target(address)
    }
}
