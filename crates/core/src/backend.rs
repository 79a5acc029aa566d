//! Interceptor backend and the shared enter/leave thunks
//!
//! The thunks are emitted once per backend. Both share a prolog/epilog
//! that spills the caller-visible CPU state into a [`CpuContext`] frame on
//! the current stack:
//!
//! ```text
//! SP + 0    alignment padding
//! SP + 8    CpuContext { pc, sp, x0..x28, fp, lr, q0..q7 }
//! SP + 400  next-hop slot, written by the callback
//! ```
//!
//! The epilog restores every register and finishes with
//! `ldp x16, x17, [sp], #16; br x16`, delivering control to whatever the
//! callback stored in the next-hop slot. X16/X17 are the AAPCS64
//! intra-procedure-call registers, so consuming them here cannot disturb
//! state the caller is entitled to.

use a64hook_alloc::{CodeAllocator, CodeSlice};
use a64hook_arch::{Arm64Relocator, Arm64Writer, Reg};

use crate::context::CpuContext;
use crate::error::HookError;
use crate::function::InvocationCallbacks;

/// Offset of the [`CpuContext`] record within the thunk frame.
pub(crate) const CPU_CONTEXT_OFFSET: u32 = 8;

/// Offset of the next-hop slot within the thunk frame.
pub(crate) const NEXT_HOP_OFFSET: u32 = CPU_CONTEXT_OFFSET + 33 * 8 + 8 * 16;

const _: () =
    assert!(NEXT_HOP_OFFSET as usize == CPU_CONTEXT_OFFSET as usize + std::mem::size_of::<CpuContext>());

/// One interception backend: shared thunks plus the reusable writer and
/// relocator every build runs through.
///
/// Not `Sync`; the embedding manager serialises hook creation, while the
/// code the backend emits runs from arbitrary threads.
pub struct InterceptorBackend {
    pub(crate) allocator: CodeAllocator,
    pub(crate) writer: Arm64Writer,
    pub(crate) relocator: Arm64Relocator,
    enter_thunk: CodeSlice,
    leave_thunk: CodeSlice,
}

impl InterceptorBackend {
    /// Build a backend over `allocator`, emitting the enter and leave
    /// thunks that dispatch to `callbacks`.
    pub fn new(
        allocator: CodeAllocator,
        callbacks: InvocationCallbacks,
    ) -> Result<Self, HookError> {
        let mut writer = Arm64Writer::new();

        let enter_thunk = allocator.alloc_slice()?;
        // SAFETY: freshly allocated slice, overflow asserted below
        unsafe { writer.reset(enter_thunk.data()) };
        emit_enter_thunk(&mut writer, callbacks.begin as usize as u64);
        writer.flush();
        assert!(writer.offset() <= enter_thunk.size(), "enter thunk overflow");

        let leave_thunk = allocator.alloc_slice()?;
        // SAFETY: freshly allocated slice, overflow asserted below
        unsafe { writer.reset(leave_thunk.data()) };
        emit_leave_thunk(&mut writer, callbacks.end as usize as u64);
        writer.flush();
        assert!(writer.offset() <= leave_thunk.size(), "leave thunk overflow");

        tracing::debug!(
            "thunks ready: enter at {:#x}, leave at {:#x}",
            enter_thunk.data() as usize,
            leave_thunk.data() as usize
        );

        Ok(Self {
            allocator,
            writer,
            relocator: Arm64Relocator::new(),
            enter_thunk,
            leave_thunk,
        })
    }

    pub(crate) fn enter_thunk_address(&self) -> u64 {
        self.enter_thunk.data() as u64
    }

    pub(crate) fn leave_thunk_address(&self) -> u64 {
        self.leave_thunk.data() as u64
    }
}

fn emit_enter_thunk(w: &mut Arm64Writer, begin_invocation: u64) {
    emit_prolog(w);

    w.put_add_reg_reg_imm(Reg::X1, Reg::Sp, CPU_CONTEXT_OFFSET);
    w.put_add_reg_reg_imm(
        Reg::X2,
        Reg::Sp,
        CPU_CONTEXT_OFFSET + std::mem::offset_of!(CpuContext, lr) as u32,
    );
    w.put_add_reg_reg_imm(Reg::X3, Reg::Sp, NEXT_HOP_OFFSET);

    // begin_invocation(ctx, cpu, lr_slot, next_hop_slot)
    w.put_mov_reg_reg(Reg::X0, Reg::X17);
    w.put_ldr_reg_address(Reg::Lr, begin_invocation);
    w.put_blr_reg(Reg::Lr);

    emit_epilog(w);
}

fn emit_leave_thunk(w: &mut Arm64Writer, end_invocation: u64) {
    emit_prolog(w);

    w.put_add_reg_reg_imm(Reg::X1, Reg::Sp, CPU_CONTEXT_OFFSET);
    w.put_add_reg_reg_imm(Reg::X2, Reg::Sp, NEXT_HOP_OFFSET);

    // end_invocation(ctx, cpu, next_hop_slot)
    w.put_mov_reg_reg(Reg::X0, Reg::X17);
    w.put_ldr_reg_address(Reg::Lr, end_invocation);
    w.put_blr_reg(Reg::Lr);

    emit_epilog(w);
}

fn emit_prolog(w: &mut Arm64Writer) {
    // reserve the next-hop slot
    w.put_sub_reg_reg_imm(Reg::Sp, Reg::Sp, 16);

    // caller-saved vector registers
    w.put_instruction(0xADBF_1FE6); // stp q6, q7, [sp, #-32]!
    w.put_instruction(0xADBF_17E4); // stp q4, q5, [sp, #-32]!
    w.put_instruction(0xADBF_0FE2); // stp q2, q3, [sp, #-32]!
    w.put_instruction(0xADBF_07E0); // stp q0, q1, [sp, #-32]!

    w.put_push_reg_pair(Reg::Fp, Reg::Lr);
    w.put_push_reg_pair(Reg::X27, Reg::X28);
    w.put_push_reg_pair(Reg::X25, Reg::X26);
    w.put_push_reg_pair(Reg::X23, Reg::X24);
    w.put_push_reg_pair(Reg::X21, Reg::X22);
    w.put_push_reg_pair(Reg::X19, Reg::X20);
    w.put_push_reg_pair(Reg::X17, Reg::X18);
    w.put_push_reg_pair(Reg::X15, Reg::X16);
    w.put_push_reg_pair(Reg::X13, Reg::X14);
    w.put_push_reg_pair(Reg::X11, Reg::X12);
    w.put_push_reg_pair(Reg::X9, Reg::X10);
    w.put_push_reg_pair(Reg::X7, Reg::X8);
    w.put_push_reg_pair(Reg::X5, Reg::X6);
    w.put_push_reg_pair(Reg::X3, Reg::X4);
    w.put_push_reg_pair(Reg::X1, Reg::X2);

    // reconstruct the entry SP and store it paired with X0
    w.put_add_reg_reg_imm(Reg::X1, Reg::Sp, 30 * 8 + 8 * 16 + 16);
    w.put_push_reg_pair(Reg::X1, Reg::X0);

    // alignment padding + dummy pc slot
    w.put_sub_reg_reg_imm(Reg::Sp, Reg::Sp, 16);
}

fn emit_epilog(w: &mut Arm64Writer) {
    // alignment padding + dummy pc slot
    w.put_add_reg_reg_imm(Reg::Sp, Reg::Sp, 16);

    // SP (discarded) + X0
    w.put_pop_reg_pair(Reg::X1, Reg::X0);

    w.put_pop_reg_pair(Reg::X1, Reg::X2);
    w.put_pop_reg_pair(Reg::X3, Reg::X4);
    w.put_pop_reg_pair(Reg::X5, Reg::X6);
    w.put_pop_reg_pair(Reg::X7, Reg::X8);
    w.put_pop_reg_pair(Reg::X9, Reg::X10);
    w.put_pop_reg_pair(Reg::X11, Reg::X12);
    w.put_pop_reg_pair(Reg::X13, Reg::X14);
    w.put_pop_reg_pair(Reg::X15, Reg::X16);
    w.put_pop_reg_pair(Reg::X17, Reg::X18);
    w.put_pop_reg_pair(Reg::X19, Reg::X20);
    w.put_pop_reg_pair(Reg::X21, Reg::X22);
    w.put_pop_reg_pair(Reg::X23, Reg::X24);
    w.put_pop_reg_pair(Reg::X25, Reg::X26);
    w.put_pop_reg_pair(Reg::X27, Reg::X28);
    w.put_pop_reg_pair(Reg::Fp, Reg::Lr);

    w.put_instruction(0xACC1_07E0); // ldp q0, q1, [sp], #32
    w.put_instruction(0xACC1_0FE2); // ldp q2, q3, [sp], #32
    w.put_instruction(0xACC1_17E4); // ldp q4, q5, [sp], #32
    w.put_instruction(0xACC1_1FE6); // ldp q6, q7, [sp], #32

    // consume the next-hop slot and go there
    w.put_pop_reg_pair(Reg::X16, Reg::X17);
    w.put_br_reg(Reg::X16);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_callbacks;

    fn thunk_words(address: u64, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| unsafe { std::ptr::read_unaligned((address as *const u32).add(i)) })
            .collect()
    }

    #[test]
    fn test_thunks_start_with_the_shared_prolog() {
        let backend =
            InterceptorBackend::new(CodeAllocator::new(), test_callbacks()).unwrap();
        for address in [backend.enter_thunk_address(), backend.leave_thunk_address()] {
            let words = thunk_words(address, 6);
            assert_eq!(words[0], 0xD100_43FF); // sub sp, sp, #16
            assert_eq!(words[1], 0xADBF_1FE6);
            assert_eq!(words[2], 0xADBF_17E4);
            assert_eq!(words[3], 0xADBF_0FE2);
            assert_eq!(words[4], 0xADBF_07E0);
            assert_eq!(words[5], 0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        }
    }

    #[test]
    fn test_enter_thunk_builds_callback_arguments() {
        let backend =
            InterceptorBackend::new(CodeAllocator::new(), test_callbacks()).unwrap();
        // prolog is 23 words; the argument setup follows
        let words = thunk_words(backend.enter_thunk_address() + 23 * 4, 5);
        assert_eq!(words[0], 0x9100_23E1); // add x1, sp, #8
        assert_eq!(words[1], 0x9104_23E2); // add x2, sp, #264 (&cpu.lr)
        assert_eq!(words[2], 0x9106_43E3); // add x3, sp, #400 (next hop)
        assert_eq!(words[3], 0xAA11_03E0); // mov x0, x17
        assert_eq!(words[4] & 0xFF00_001F, 0x5800_001E); // ldr x30, <pool>
    }

    #[test]
    fn test_leave_thunk_takes_three_arguments() {
        let backend =
            InterceptorBackend::new(CodeAllocator::new(), test_callbacks()).unwrap();
        let words = thunk_words(backend.leave_thunk_address() + 23 * 4, 4);
        assert_eq!(words[0], 0x9100_23E1); // add x1, sp, #8
        assert_eq!(words[1], 0x9106_43E2); // add x2, sp, #400 (next hop)
        assert_eq!(words[2], 0xAA11_03E0); // mov x0, x17
        assert_eq!(words[3] & 0xFF00_001F, 0x5800_001E); // ldr x30, <pool>
    }

    #[test]
    fn test_epilog_dispatches_through_x16() {
        let backend =
            InterceptorBackend::new(CodeAllocator::new(), test_callbacks()).unwrap();
        // 23-word prolog, 6 words of setup + call, then the 23-word epilog
        let words = thunk_words(backend.enter_thunk_address() + (23 + 6 + 21) * 4, 2);
        assert_eq!(words[0], 0xA8C1_47F0); // ldp x16, x17, [sp], #16
        assert_eq!(words[1], 0xD61F_0200); // br x16
    }
}
