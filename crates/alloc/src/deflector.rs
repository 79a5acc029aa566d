//! Deflector shims
//!
//! A deflector is a 16-byte shim placed within branch range of a patched
//! prologue when the trampoline itself could not be: an absolute load of
//! the far target through X16 followed by `br x16`.
//!
//! Dedicated shims own a whole page, so a hook whose redirect saves no
//! state gets a cell nothing else will ever touch. Shared shims pack into
//! communal deflector pages; each hook still owns its own cell.

use std::sync::Arc;

use a64hook_arch::{Arm64Writer, Reg};
use parking_lot::Mutex;

use crate::{alloc_page_near, unmap_page, AddressSpec, CodeAllocator, DeflectorPage, Inner};

/// Bytes per shim: `ldr x16, #8; br x16; .quad target`.
const DEFLECTOR_CELL_SIZE: usize = 16;

/// Owning handle to one deflector shim.
pub struct CodeDeflector {
    entry: *mut u8,
    target: usize,
    return_address: usize,
    dedicated: bool,
    page_base: usize,
    page_len: usize,
    cell: usize,
    owner: Arc<Mutex<Inner>>,
}

// SAFETY: the handle owns its cell exclusively; bookkeeping is mutex-guarded
unsafe impl Send for CodeDeflector {}

impl CodeDeflector {
    /// Entry point the patched prologue branches to.
    pub fn trampoline(&self) -> *const u8 {
        self.entry
    }

    /// Where the shim forwards control.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Address after the overwritten prologue bytes, kept for hooks whose
    /// shim has to hand control back linearly.
    pub fn return_address(&self) -> usize {
        self.return_address
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }
}

impl Drop for CodeDeflector {
    fn drop(&mut self) {
        if self.dedicated {
            // SAFETY: the page was mapped for this shim alone
            unsafe { unmap_page(self.page_base as *mut u8, self.page_len) };
            return;
        }
        let mut inner = self.owner.lock();
        if let Some(page) = inner
            .deflector_pages
            .iter_mut()
            .find(|p| p.base as usize == self.page_base)
        {
            page.free.push(self.cell);
            page.live -= 1;
            if page.live == 0 {
                tracing::debug!("deflector page {:#x} fully drained", self.page_base);
            }
        }
    }
}

impl CodeAllocator {
    /// Allocate a deflector shim within `caller` range, forwarding to
    /// `target`.
    pub fn alloc_deflector(
        &self,
        caller: &AddressSpec,
        return_address: usize,
        target: usize,
        dedicated: bool,
    ) -> Option<CodeDeflector> {
        let mut inner = self.inner().lock();
        let page_size = inner.page_size;

        if !dedicated {
            for page in &mut inner.deflector_pages {
                let base = page.base as usize;
                let found = page
                    .free
                    .iter()
                    .position(|&cell| caller.satisfied_by(base + cell * DEFLECTOR_CELL_SIZE));
                if let Some(index) = found {
                    let cell = page.free.swap_remove(index);
                    page.live += 1;
                    return Some(self.deflector_handle(
                        page.base,
                        page_size,
                        cell,
                        return_address,
                        target,
                        false,
                    ));
                }
            }
        }

        let base = alloc_page_near(page_size, caller)?;
        tracing::debug!(
            "mapped {} deflector page at {:#x} near {:#x}",
            if dedicated { "dedicated" } else { "shared" },
            base as usize,
            caller.near_address
        );

        if !dedicated {
            inner.deflector_pages.push(DeflectorPage {
                base,
                free: (1..page_size / DEFLECTOR_CELL_SIZE).rev().collect(),
                live: 1,
            });
        }
        Some(self.deflector_handle(base, page_size, 0, return_address, target, dedicated))
    }

    fn deflector_handle(
        &self,
        page_base: *mut u8,
        page_len: usize,
        cell: usize,
        return_address: usize,
        target: usize,
        dedicated: bool,
    ) -> CodeDeflector {
        // SAFETY: cell is within the page by construction
        let entry = unsafe { page_base.add(cell * DEFLECTOR_CELL_SIZE) };

        let mut w = Arm64Writer::new();
        // SAFETY: the cell is 16 writable bytes this shim exactly fills
        unsafe { w.reset(entry) };
        w.put_ldr_reg_address(Reg::X16, target as u64);
        w.put_br_reg(Reg::X16);
        w.flush();
        debug_assert_eq!(w.offset(), DEFLECTOR_CELL_SIZE);

        CodeDeflector {
            entry,
            target,
            return_address,
            dedicated,
            page_base: page_base as usize,
            page_len,
            cell,
            owner: Arc::clone(self.inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a64hook_arch::reader::try_get_relative_jump_target;
    use a64hook_arch::B_MAX_DISTANCE;

    fn caller_spec(allocator: &CodeAllocator) -> (AddressSpec, crate::CodeSlice) {
        let anchor = allocator.alloc_slice().unwrap();
        (
            AddressSpec::new(anchor.data() as usize, B_MAX_DISTANCE),
            anchor,
        )
    }

    #[test]
    fn test_shim_encoding_and_resolution() {
        let allocator = CodeAllocator::new();
        let (caller, _anchor) = caller_spec(&allocator);
        let deflector = allocator
            .alloc_deflector(&caller, caller.near_address + 8, 0x1234_5678_9ABC, false)
            .unwrap();

        let entry = deflector.trampoline();
        let words: Vec<u32> = (0..2)
            .map(|i| unsafe { std::ptr::read_unaligned((entry as *const u32).add(i)) })
            .collect();
        assert_eq!(words[0], 0x5800_0050); // ldr x16, #8
        assert_eq!(words[1], 0xD61F_0200); // br x16
        let resolved = unsafe { try_get_relative_jump_target(entry) };
        assert_eq!(resolved, Some(0x1234_5678_9ABCusize as *const u8));
    }

    #[test]
    fn test_dedicated_shims_are_never_shared() {
        let allocator = CodeAllocator::new();
        let (caller, _anchor) = caller_spec(&allocator);
        let a = allocator
            .alloc_deflector(&caller, 0, 0x1000, true)
            .unwrap();
        let b = allocator
            .alloc_deflector(&caller, 0, 0x2000, true)
            .unwrap();
        assert!(a.is_dedicated() && b.is_dedicated());
        assert_ne!(a.trampoline(), b.trampoline());
        // each owns its whole page
        let page_mask = !(4096usize - 1);
        assert_ne!(
            a.trampoline() as usize & page_mask,
            b.trampoline() as usize & page_mask
        );
    }

    #[test]
    fn test_shared_shims_pack_into_one_page() {
        let allocator = CodeAllocator::new();
        let (caller, _anchor) = caller_spec(&allocator);
        let a = allocator
            .alloc_deflector(&caller, 0, 0x1000, false)
            .unwrap();
        let b = allocator
            .alloc_deflector(&caller, 0, 0x2000, false)
            .unwrap();
        assert_ne!(a.trampoline(), b.trampoline());
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert!(
            (a.trampoline() as usize).abs_diff(b.trampoline() as usize) < page_size,
            "shared shims should land on the same page"
        );
        let ra = unsafe { try_get_relative_jump_target(a.trampoline()) };
        let rb = unsafe { try_get_relative_jump_target(b.trampoline()) };
        assert_eq!(ra, Some(0x1000 as *const u8));
        assert_eq!(rb, Some(0x2000 as *const u8));
    }

    #[test]
    fn test_shared_cell_returns_on_drop() {
        let allocator = CodeAllocator::new();
        let (caller, _anchor) = caller_spec(&allocator);
        let first = allocator
            .alloc_deflector(&caller, 0, 0x1000, false)
            .unwrap();
        let page = first.trampoline() as usize & !(4096 - 1);
        drop(first);
        let second = allocator
            .alloc_deflector(&caller, 0, 0x3000, false)
            .unwrap();
        assert_eq!(second.trampoline() as usize & !(4096 - 1), page);
    }
}
