//! Host allocator hooks for C embedders.
//!
//! Hosts hand out memory by size only (a `malloc`-style pool), so every
//! block here is over-allocated and aligned inside, with the pool's original
//! pointer stored just below the aligned address:
//!
//! ```text
//! raw            aligned - HEADER    aligned
//!  | padding ...  | raw pointer       | size bytes ...
//! ```
//!
//! Two sources are provided:
//! - [`HookAllocator`]: function pointers plus user data, passed to
//!   `dspwasm_engine_new_with_allocator`
//! - `LinkAllocator` (feature `host-alloc`): the `dspwasm_host_alloc` /
//!   `dspwasm_host_free` symbols resolved at link time, also installed as the
//!   global allocator

use std::alloc::Layout;
use std::ffi::c_void;
use std::ptr::{self, NonNull};

use dsp_wasm_core::HostAllocator;

const HEADER: usize = size_of::<*mut u8>();

/// Host allocation callback: returns null when the pool is exhausted.
pub type DspWasmAllocFn = unsafe extern "C" fn(size: usize, user_data: *mut c_void) -> *mut c_void;

/// Host free callback.
pub type DspWasmFreeFn = unsafe extern "C" fn(ptr: *mut c_void, user_data: *mut c_void);

/// Allocator hooks supplied by a C host.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DspWasmAllocatorHooks {
    /// Allocate `size` bytes; null on exhaustion.
    pub allocate: Option<DspWasmAllocFn>,
    /// Free a block returned by `allocate`.
    pub free: Option<DspWasmFreeFn>,
    /// Passed unchanged to both callbacks.
    pub user_data: *mut c_void,
}

/// [`HostAllocator`] over C function-pointer hooks.
#[derive(Debug)]
pub struct HookAllocator {
    allocate: DspWasmAllocFn,
    free: DspWasmFreeFn,
    user_data: *mut c_void,
}

// SAFETY: the host promises its hooks and user data may be used from any
// thread that uses the engine.
#[allow(unsafe_code)]
unsafe impl Send for HookAllocator {}
#[allow(unsafe_code)]
unsafe impl Sync for HookAllocator {}

impl HookAllocator {
    /// Build from C hooks; `None` if either callback is missing.
    pub fn from_hooks(hooks: &DspWasmAllocatorHooks) -> Option<Self> {
        Some(Self {
            allocate: hooks.allocate?,
            free: hooks.free?,
            user_data: hooks.user_data,
        })
    }
}

#[allow(unsafe_code)]
unsafe impl HostAllocator for HookAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: the hook contract matches `allocate_aligned`'s.
        unsafe {
            allocate_aligned(layout, |size| {
                (self.allocate)(size, self.user_data).cast::<u8>()
            })
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // SAFETY: `ptr` came from `allocate` above.
        unsafe {
            let raw = original_pointer(ptr);
            (self.free)(raw.cast::<c_void>(), self.user_data);
        }
    }
}

/// Over-allocate through `raw_alloc` and return an address aligned for
/// `layout`, with the raw pointer stored in the header below it.
///
/// # Safety
///
/// `raw_alloc(n)` must return null or a block valid for `n` bytes.
#[allow(unsafe_code)]
pub(crate) unsafe fn allocate_aligned(
    layout: Layout,
    raw_alloc: impl FnOnce(usize) -> *mut u8,
) -> Option<NonNull<u8>> {
    let align = layout.align();
    let total = layout.size().checked_add(HEADER)?.checked_add(align - 1)?;

    let raw = NonNull::new(raw_alloc(total))?;
    let unaligned = raw.as_ptr() as usize + HEADER;
    let offset = HEADER + (align - unaligned % align) % align;

    // SAFETY: offset + size <= total, so both the header and the block lie
    // inside the raw allocation.
    unsafe {
        let aligned = raw.as_ptr().add(offset);
        ptr::write_unaligned(aligned.sub(HEADER).cast::<*mut u8>(), raw.as_ptr());
        NonNull::new(aligned)
    }
}

/// Recover the raw pointer stored by [`allocate_aligned`].
///
/// # Safety
///
/// `ptr` must come from [`allocate_aligned`].
#[allow(unsafe_code)]
pub(crate) unsafe fn original_pointer(ptr: NonNull<u8>) -> *mut u8 {
    // SAFETY: the header sits directly below every aligned block.
    unsafe { ptr::read_unaligned(ptr.as_ptr().sub(HEADER).cast::<*mut u8>()) }
}

#[cfg(feature = "host-alloc")]
pub use link::LinkAllocator;

#[cfg(feature = "host-alloc")]
mod link {
    #![allow(unsafe_code)]

    use std::alloc::{GlobalAlloc, Layout};
    use std::ffi::c_void;
    use std::ptr::{self, NonNull};

    use dsp_wasm_core::HostAllocator;

    use super::{allocate_aligned, original_pointer};

    unsafe extern "C" {
        fn dspwasm_host_alloc(size: usize) -> *mut c_void;
        fn dspwasm_host_free(ptr: *mut c_void);
    }

    /// Allocator backed by the host's link-time hooks.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LinkAllocator;

    // SAFETY: blocks come from `allocate_aligned` over the host hook.
    unsafe impl HostAllocator for LinkAllocator {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            unsafe { allocate_aligned(layout, |size| dspwasm_host_alloc(size).cast::<u8>()) }
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
            unsafe { dspwasm_host_free(original_pointer(ptr).cast::<c_void>()) }
        }
    }

    // SAFETY: zero-sized layouts never reach `alloc` (GlobalAlloc contract),
    // and `allocate_aligned` honors the requested alignment.
    unsafe impl GlobalAlloc for LinkAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            HostAllocator::allocate(self, layout).map_or(ptr::null_mut(), NonNull::as_ptr)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(ptr) = NonNull::new(ptr) {
                unsafe { HostAllocator::deallocate(self, ptr, layout) }
            }
        }
    }

    #[global_allocator]
    static GLOBAL: LinkAllocator = LinkAllocator;
}
