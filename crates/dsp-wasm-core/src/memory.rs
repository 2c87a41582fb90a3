//! Guest linear memory backed by the host allocator.
//!
//! [`HostMemoryCreator`] plugs into Wasmtime's `MemoryCreator` hook so that
//! every linear memory an engine creates is allocated, grown, and freed
//! through an [`AllocatorContext`]. The engine is configured without
//! virtual-memory reservations or guard pages when this creator is installed,
//! so a memory is one plain, zero-filled block of `byte_capacity` bytes.

use std::alloc::Layout;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};
use wasmtime::{LinearMemory, MemoryCreator, MemoryType};

use crate::allocator::AllocatorContext;

/// Alignment of every linear memory block.
const MEMORY_ALIGN: usize = 16;

/// Creates linear memories from an [`AllocatorContext`].
#[derive(Debug, Clone)]
pub struct HostMemoryCreator {
    allocator: AllocatorContext,
}

impl HostMemoryCreator {
    /// Create a memory creator drawing from `allocator`.
    pub fn new(allocator: AllocatorContext) -> Self {
        Self { allocator }
    }
}

#[allow(unsafe_code)]
unsafe impl MemoryCreator for HostMemoryCreator {
    fn new_memory(
        &self,
        ty: MemoryType,
        minimum: usize,
        maximum: Option<usize>,
        reserved_size_in_bytes: Option<usize>,
        guard_size_in_bytes: usize,
    ) -> Result<Box<dyn LinearMemory>, String> {
        if ty.is_shared() {
            return Err("shared memories are not supported".to_string());
        }
        if guard_size_in_bytes != 0 {
            return Err(format!(
                "engine requested {guard_size_in_bytes} guard bytes; host memories have none"
            ));
        }

        // A reservation beyond the minimum pins the base pointer, so the
        // whole reservation is allocated up front. The engine configures a
        // zero reservation, which leaves the block free to move on growth.
        let may_move = reserved_size_in_bytes.is_none_or(|reserved| reserved <= minimum);
        let capacity = minimum.max(reserved_size_in_bytes.unwrap_or(0));

        let memory = HostMemory::new(self.allocator.clone(), minimum, capacity, maximum, may_move)?;

        debug!(
            minimum,
            capacity,
            maximum = ?maximum,
            "Linear memory allocated from host allocator"
        );

        Ok(Box::new(memory))
    }
}

/// One linear memory block owned by the host allocator.
pub struct HostMemory {
    allocator: AllocatorContext,
    base: NonNull<u8>,
    capacity: usize,
    byte_size: usize,
    maximum: Option<usize>,
    may_move: bool,
}

// SAFETY: `HostMemory` exclusively owns its block; Wasmtime serializes
// access through the owning store.
#[allow(unsafe_code)]
unsafe impl Send for HostMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for HostMemory {}

impl HostMemory {
    fn new(
        allocator: AllocatorContext,
        byte_size: usize,
        capacity: usize,
        maximum: Option<usize>,
        may_move: bool,
    ) -> Result<Self, String> {
        let base = allocate_zeroed(&allocator, capacity)?;
        Ok(Self {
            allocator,
            base,
            capacity,
            byte_size,
            maximum,
            may_move,
        })
    }

    fn layout(capacity: usize) -> Option<Layout> {
        Layout::from_size_align(capacity, MEMORY_ALIGN).ok()
    }
}

#[allow(unsafe_code)]
unsafe impl LinearMemory for HostMemory {
    fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn byte_capacity(&self) -> usize {
        self.capacity
    }

    fn grow_to(&mut self, new_size: usize) -> wasmtime::Result<()> {
        if self.maximum.is_some_and(|max| new_size > max) {
            return Err(wasmtime::Error::msg("memory growth beyond declared maximum"));
        }

        // Bytes past `byte_size` were zeroed at allocation and never exposed.
        if new_size <= self.capacity {
            self.byte_size = new_size;
            return Ok(());
        }

        if !self.may_move {
            return Err(wasmtime::Error::msg(
                "memory growth beyond fixed reservation",
            ));
        }

        let new_base = allocate_zeroed(&self.allocator, new_size).map_err(wasmtime::Error::msg)?;

        // SAFETY: both blocks are live, distinct, and at least `byte_size`
        // bytes long.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr(), new_base.as_ptr(), self.byte_size);
        }
        release(&self.allocator, self.base, self.capacity);

        self.base = new_base;
        self.capacity = new_size;
        self.byte_size = new_size;
        Ok(())
    }

    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        release(&self.allocator, self.base, self.capacity);
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("byte_size", &self.byte_size)
            .field("capacity", &self.capacity)
            .field("maximum", &self.maximum)
            .finish_non_exhaustive()
    }
}

/// Allocate `capacity` zeroed bytes from the host allocator.
#[allow(unsafe_code)]
fn allocate_zeroed(allocator: &AllocatorContext, capacity: usize) -> Result<NonNull<u8>, String> {
    let layout = HostMemory::layout(capacity)
        .ok_or_else(|| format!("invalid linear memory size {capacity}"))?;

    let Some(block) = allocator.allocate(layout) else {
        warn!(capacity, "Linear memory allocation refused");
        return Err(format!(
            "host allocator could not provide {capacity} bytes of linear memory"
        ));
    };

    // SAFETY: the block is valid for `capacity` bytes.
    unsafe { ptr::write_bytes(block.as_ptr(), 0, capacity) };
    Ok(block)
}

/// Return a block obtained from [`allocate_zeroed`].
#[allow(unsafe_code)]
fn release(allocator: &AllocatorContext, base: NonNull<u8>, capacity: usize) {
    if let Some(layout) = HostMemory::layout(capacity) {
        // SAFETY: `base` was allocated with exactly this layout.
        unsafe { allocator.deallocate(base, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{LimitedAllocator, SystemAllocator};

    const PAGE: usize = 64 * 1024;

    fn memory(ctx: &AllocatorContext, pages: usize, max_pages: Option<usize>) -> HostMemory {
        HostMemory::new(ctx.clone(), pages * PAGE, pages * PAGE, max_pages.map(|p| p * PAGE), true)
            .unwrap()
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_memory_is_zeroed() {
        let ctx = AllocatorContext::system();
        let mem = memory(&ctx, 1, None);

        let bytes = unsafe { std::slice::from_raw_parts(mem.as_ptr(), mem.byte_size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_grow_preserves_contents() {
        let ctx = AllocatorContext::system();
        let mut mem = memory(&ctx, 1, None);

        unsafe { mem.as_ptr().add(10).write(0xAB) };
        mem.grow_to(2 * PAGE).unwrap();

        assert_eq!(mem.byte_size(), 2 * PAGE);
        assert_eq!(mem.byte_capacity(), 2 * PAGE);
        unsafe {
            assert_eq!(mem.as_ptr().add(10).read(), 0xAB);
            assert_eq!(mem.as_ptr().add(PAGE + 10).read(), 0);
        }

        // Old block returned, new block accounted
        assert_eq!(ctx.stats().bytes_in_use, 2 * PAGE);
    }

    #[test]
    fn test_grow_respects_maximum() {
        let ctx = AllocatorContext::system();
        let mut mem = memory(&ctx, 1, Some(1));

        assert!(mem.grow_to(2 * PAGE).is_err());
        assert_eq!(mem.byte_size(), PAGE);
    }

    #[test]
    fn test_grow_fails_when_pool_exhausted() {
        let ctx = AllocatorContext::new(LimitedAllocator::new(SystemAllocator, 2 * PAGE));
        let mut mem = memory(&ctx, 1, None);

        // Moving needs the old and the new block at once: 1 + 2 pages > 2 pages
        assert!(mem.grow_to(2 * PAGE).is_err());
        assert_eq!(mem.byte_size(), PAGE);
        assert_eq!(ctx.failures(), 1);
    }

    #[test]
    fn test_fixed_reservation_does_not_move() {
        let ctx = AllocatorContext::system();
        let mut mem = HostMemory::new(ctx.clone(), PAGE, 2 * PAGE, None, false).unwrap();
        let base = mem.as_ptr();

        mem.grow_to(2 * PAGE).unwrap();
        assert_eq!(mem.as_ptr(), base);
        assert!(mem.grow_to(3 * PAGE).is_err());
    }

    #[test]
    fn test_creator_with_zero_reservation_grows() {
        let ctx = AllocatorContext::new(LimitedAllocator::new(SystemAllocator, 8 * PAGE));
        let creator = HostMemoryCreator::new(ctx.clone());

        // Arguments as passed by an engine configured with `memory_reservation(0)`
        let mut mem = creator
            .new_memory(MemoryType::new(1, None), PAGE, Some(1 << 32), Some(0), 0)
            .unwrap();
        assert_eq!(mem.byte_capacity(), PAGE);

        mem.grow_to(2 * PAGE).unwrap();
        assert_eq!(mem.byte_size(), 2 * PAGE);
        assert_eq!(ctx.stats().bytes_in_use, 2 * PAGE);

        mem.grow_to(5 * PAGE).unwrap();
        assert_eq!(mem.byte_size(), 5 * PAGE);
    }

    #[test]
    fn test_creator_with_large_reservation_is_fixed() {
        let ctx = AllocatorContext::system();
        let creator = HostMemoryCreator::new(ctx.clone());

        let mut mem = creator
            .new_memory(MemoryType::new(1, None), PAGE, None, Some(3 * PAGE), 0)
            .unwrap();
        let base = mem.as_ptr();
        assert_eq!(mem.byte_capacity(), 3 * PAGE);

        mem.grow_to(3 * PAGE).unwrap();
        assert_eq!(mem.as_ptr(), base);
        assert!(mem.grow_to(4 * PAGE).is_err());
    }

    #[test]
    fn test_creator_rejects_guard_pages() {
        let creator = HostMemoryCreator::new(AllocatorContext::system());
        let result = creator.new_memory(MemoryType::new(1, None), PAGE, None, Some(0), PAGE);
        assert!(result.is_err());
    }

    #[test]
    fn test_drop_releases_block() {
        let ctx = AllocatorContext::system();
        {
            let _mem = memory(&ctx, 2, None);
            assert_eq!(ctx.stats().bytes_in_use, 2 * PAGE);
        }
        assert_eq!(ctx.stats().bytes_in_use, 0);
    }

    #[test]
    fn test_empty_memory() {
        let ctx = AllocatorContext::system();
        let mut mem = memory(&ctx, 0, None);

        assert_eq!(mem.byte_size(), 0);
        assert_eq!(ctx.stats().allocations, 0);

        mem.grow_to(PAGE).unwrap();
        assert_eq!(mem.byte_size(), PAGE);
    }
}
