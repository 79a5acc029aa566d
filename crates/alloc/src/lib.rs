//! Executable memory allocation for a64hook
//!
//! Hands out small executable slices carved from RWX pages, with optional
//! near-address placement so short-range branches can reach them, and
//! deflector shims for targets nothing can be placed near.
//!
//! Allocation granularity is a fixed [`SLICE_SIZE`]; a page holds
//! `page_size / SLICE_SIZE` slices tracked by a free list. Near placement
//! works the way the kernel lets it: probe `mmap` hints around the wanted
//! address and keep the first mapping that actually landed in range.

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;

mod deflector;

pub use deflector::CodeDeflector;

/// Size of one executable slice. Large enough for the enter/leave thunks
/// and for any per-function trampoline (at most four relocated
/// instructions plus stubs and literal pool).
pub const SLICE_SIZE: usize = 256;

/// Pages probed per step when hunting for a near mapping.
const NEAR_PROBE_STEP_PAGES: usize = 64;

/// Hint probes before giving up on a near mapping.
const NEAR_PROBE_ATTEMPTS: usize = 256;

/// Error type for executable memory operations
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The kernel refused to map an executable page
    #[error("failed to map executable page: {0}")]
    MmapFailed(#[from] nix::Error),
}

/// Placement constraint for near allocations.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpec {
    pub near_address: usize,
    pub max_distance: usize,
}

impl AddressSpec {
    pub fn new(near_address: usize, max_distance: usize) -> Self {
        Self {
            near_address,
            max_distance,
        }
    }

    pub(crate) fn satisfied_by(&self, address: usize) -> bool {
        address.abs_diff(self.near_address) <= self.max_distance
    }
}

struct SlicePage {
    base: *mut u8,
    free: Vec<usize>,
}

pub(crate) struct DeflectorPage {
    pub(crate) base: *mut u8,
    pub(crate) free: Vec<usize>,
    pub(crate) live: usize,
}

pub(crate) struct Inner {
    pub(crate) page_size: usize,
    slice_pages: Vec<SlicePage>,
    pub(crate) deflector_pages: Vec<DeflectorPage>,
}

// SAFETY: the raw page pointers are only dereferenced by slice owners; the
// bookkeeping itself is plain data behind the allocator mutex
unsafe impl Send for Inner {}

/// Cheaply clonable allocator handle.
///
/// Slices and deflectors keep the bookkeeping alive on their own, so the
/// handle may be dropped before them.
#[derive(Clone)]
pub struct CodeAllocator {
    inner: Arc<Mutex<Inner>>,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeAllocator {
    pub fn new() -> Self {
        // SAFETY: sysconf has no memory-safety preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        Self {
            inner: Arc::new(Mutex::new(Inner {
                page_size,
                slice_pages: Vec::new(),
                deflector_pages: Vec::new(),
            })),
        }
    }

    /// Allocate a slice with no placement constraint.
    pub fn alloc_slice(&self) -> Result<CodeSlice, AllocError> {
        let mut inner = self.inner.lock();

        for page in &mut inner.slice_pages {
            if let Some(slot) = page.free.pop() {
                return Ok(self.slice_handle(page.base, slot));
            }
        }

        let page_size = inner.page_size;
        let base = map_rwx_page(None, page_size)?;
        tracing::debug!("mapped executable page at {:#x}", base as usize);
        inner.slice_pages.push(SlicePage {
            base,
            free: (1..page_size / SLICE_SIZE).rev().collect(),
        });
        Ok(self.slice_handle(base, 0))
    }

    /// Allocate a slice whose start satisfies `spec` and `alignment`, or
    /// `None` when no such mapping could be obtained.
    pub fn try_alloc_slice_near(
        &self,
        spec: &AddressSpec,
        alignment: usize,
    ) -> Option<CodeSlice> {
        let mut inner = self.inner.lock();

        for page in &mut inner.slice_pages {
            let base = page.base as usize;
            let found = page.free.iter().position(|&slot| {
                let addr = base + slot * SLICE_SIZE;
                spec.satisfied_by(addr) && (alignment <= 1 || addr % alignment == 0)
            });
            if let Some(index) = found {
                let slot = page.free.swap_remove(index);
                return Some(self.slice_handle(page.base, slot));
            }
        }

        let page_size = inner.page_size;
        let base = alloc_page_near(page_size, spec)?;
        if alignment > 1 && (base as usize) % alignment != 0 {
            // page-aligned mappings satisfy every alignment we are asked for,
            // but stay honest if the OS page is ever smaller
            unsafe { unmap_page(base, page_size) };
            return None;
        }
        tracing::debug!(
            "mapped executable page at {:#x} near {:#x}",
            base as usize,
            spec.near_address
        );
        inner.slice_pages.push(SlicePage {
            base,
            free: (1..page_size / SLICE_SIZE).rev().collect(),
        });
        Some(self.slice_handle(base, 0))
    }

    fn slice_handle(&self, page_base: *mut u8, slot: usize) -> CodeSlice {
        CodeSlice {
            // SAFETY: slot is within the page by construction
            data: unsafe { page_base.add(slot * SLICE_SIZE) },
            page_base: page_base as usize,
            slot,
            owner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Mutex<Inner>> {
        &self.inner
    }
}

/// Owning handle to one executable slice. Dropping it returns the slice to
/// its page's free list.
pub struct CodeSlice {
    data: *mut u8,
    page_base: usize,
    slot: usize,
    owner: Arc<Mutex<Inner>>,
}

// SAFETY: the handle owns its slice exclusively; bookkeeping is mutex-guarded
unsafe impl Send for CodeSlice {}

impl CodeSlice {
    pub fn data(&self) -> *mut u8 {
        self.data
    }

    pub fn size(&self) -> usize {
        SLICE_SIZE
    }
}

impl Drop for CodeSlice {
    fn drop(&mut self) {
        let mut inner = self.owner.lock();
        if let Some(page) = inner
            .slice_pages
            .iter_mut()
            .find(|p| p.base as usize == self.page_base)
        {
            page.free.push(self.slot);
        }
    }
}

fn map_rwx_page(hint: Option<NonZeroUsize>, len: usize) -> Result<*mut u8, AllocError> {
    use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};

    // SAFETY: anonymous mapping, no file descriptor involved
    let ptr = unsafe {
        mmap_anonymous(
            hint,
            NonZeroUsize::new(len).expect("page size is never zero"),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )?
    };
    Ok(ptr.as_ptr() as *mut u8)
}

pub(crate) unsafe fn unmap_page(base: *mut u8, len: usize) {
    if let Some(ptr) = std::ptr::NonNull::new(base as *mut std::ffi::c_void) {
        let _ = nix::sys::mman::munmap(ptr, len);
    }
}

/// Map one RWX page within `spec`, probing hints at and below the wanted
/// address. The kernel is free to ignore a hint, so every mapping is
/// verified and unmapped again when it landed out of range.
pub(crate) fn alloc_page_near(page_size: usize, spec: &AddressSpec) -> Option<*mut u8> {
    let step = page_size * NEAR_PROBE_STEP_PAGES;
    let anchor = spec.near_address & !(page_size - 1);

    let hints =
        std::iter::once(anchor).chain((1..=NEAR_PROBE_ATTEMPTS).map(|k| anchor.saturating_sub(k * step)));
    for hint in hints {
        if hint == 0 {
            continue;
        }
        let Ok(base) = map_rwx_page(NonZeroUsize::new(hint), page_size) else {
            continue;
        };
        if spec.satisfied_by(base as usize) {
            return Some(base);
        }
        // landed out of range
        unsafe { unmap_page(base, page_size) };
    }

    tracing::error!(
        "no executable page obtainable within {:#x} of {:#x}",
        spec.max_distance,
        spec.near_address
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_allocation_is_usable_memory() {
        let allocator = CodeAllocator::new();
        let slice = allocator.alloc_slice().unwrap();
        assert!(!slice.data().is_null());
        assert_eq!(slice.size(), SLICE_SIZE);
        unsafe {
            std::ptr::write_bytes(slice.data(), 0xC5, SLICE_SIZE);
            assert_eq!(*slice.data().add(SLICE_SIZE - 1), 0xC5);
        }
    }

    #[test]
    fn test_slices_do_not_overlap() {
        let allocator = CodeAllocator::new();
        let a = allocator.alloc_slice().unwrap();
        let b = allocator.alloc_slice().unwrap();
        let c = allocator.alloc_slice().unwrap();
        let distance = |x: &CodeSlice, y: &CodeSlice| {
            (x.data() as usize).abs_diff(y.data() as usize)
        };
        assert!(distance(&a, &b) >= SLICE_SIZE);
        assert!(distance(&b, &c) >= SLICE_SIZE);
        assert!(distance(&a, &c) >= SLICE_SIZE);
    }

    #[test]
    fn test_freed_slice_is_reused() {
        let allocator = CodeAllocator::new();
        let first = allocator.alloc_slice().unwrap();
        let addr = first.data() as usize;
        drop(first);
        let second = allocator.alloc_slice().unwrap();
        assert_eq!(second.data() as usize, addr);
    }

    #[test]
    fn test_near_allocation_reuses_in_range_page() {
        let allocator = CodeAllocator::new();
        let anchor = allocator.alloc_slice().unwrap();
        let spec = AddressSpec::new(anchor.data() as usize, 1 << 20);
        let near = allocator.try_alloc_slice_near(&spec, 0).unwrap();
        // second slot of the page the anchor lives on
        assert!(spec.satisfied_by(near.data() as usize));
        assert!((near.data() as usize).abs_diff(anchor.data() as usize) < (1 << 20));
    }

    #[test]
    fn test_near_allocation_respects_alignment() {
        let allocator = CodeAllocator::new();
        let anchor = allocator.alloc_slice().unwrap();
        let spec = AddressSpec::new(anchor.data() as usize, a64hook_arch::B_MAX_DISTANCE);
        let aligned = allocator.try_alloc_slice_near(&spec, 4096).unwrap();
        assert_eq!(aligned.data() as usize % 4096, 0);
        assert!(spec.satisfied_by(aligned.data() as usize));
    }
}
