//! Host allocator injection.
//!
//! The target device has no heap suited to runtime-sized allocations, so the
//! host decides where guest memory lives (typically an external SDRAM pool).
//! This module provides:
//! - [`HostAllocator`]: the allocate/free contract a host implements
//! - [`AllocatorContext`]: an explicit, shareable handle to one allocator,
//!   passed into [`Engine::with_allocator`](crate::Engine::with_allocator)
//! - [`SystemAllocator`] and [`LimitedAllocator`]: ready-made implementations
//!
//! Exhaustion is always reported as `None`, never as a panic; callers turn it
//! into a construction failure.

use std::alloc::{self, Layout};
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

/// A source of memory for the runtime.
///
/// # Safety
///
/// `allocate` must return either `None` or a block valid for reads and
/// writes of `layout.size()` bytes, aligned to `layout.align()`, that stays
/// valid until passed back to `deallocate` with the same layout.
/// Implementations are never called with a zero-sized layout.
#[allow(unsafe_code)]
pub unsafe trait HostAllocator: Send + Sync {
    /// Allocate a block for `layout`, or `None` when the pool is exhausted.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`HostAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Allocator backed by the process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

#[allow(unsafe_code)]
unsafe impl HostAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: the trait contract rules out zero-sized layouts.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Caps the bytes outstanding in an inner allocator.
///
/// Models a fixed-size memory pool: once `capacity` bytes are live, further
/// requests fail until something is freed.
#[derive(Debug)]
pub struct LimitedAllocator<A> {
    inner: A,
    capacity: usize,
    used: AtomicUsize,
}

impl<A: HostAllocator> LimitedAllocator<A> {
    /// Wrap `inner`, allowing at most `capacity` live bytes.
    pub fn new(inner: A, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Configured byte cap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[allow(unsafe_code)]
unsafe impl<A: HostAllocator> HostAllocator for LimitedAllocator<A> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= self.capacity)
            })
            .ok()?;

        let block = self.inner.allocate(layout);
        if block.is_none() {
            self.used.fetch_sub(size, Ordering::AcqRel);
        }
        block
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.deallocate(ptr, layout) };
        self.used.fetch_sub(layout.size(), Ordering::AcqRel);
    }
}

/// Point-in-time allocator usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes currently allocated through the context.
    pub bytes_in_use: usize,
    /// Highest `bytes_in_use` observed.
    pub peak_bytes: usize,
    /// Successful allocations since creation.
    pub allocations: usize,
    /// Requests the allocator refused.
    pub failures: usize,
}

#[derive(Default)]
struct Counters {
    bytes_in_use: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicUsize,
    failures: AtomicUsize,
}

struct ContextInner {
    allocator: Box<dyn HostAllocator>,
    counters: Counters,
}

/// Shared handle to the allocator every engine memory is drawn from.
///
/// Cloning is cheap. Each live linear memory holds a clone, so the allocator
/// outlives every block it handed out.
#[derive(Clone)]
pub struct AllocatorContext {
    inner: Arc<ContextInner>,
}

impl AllocatorContext {
    /// Create a context routing through `allocator`.
    pub fn new(allocator: impl HostAllocator + 'static) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                allocator: Box::new(allocator),
                counters: Counters::default(),
            }),
        }
    }

    /// Create a context backed by the process heap.
    pub fn system() -> Self {
        Self::new(SystemAllocator)
    }

    /// Allocate `layout`, recording usage. Zero-sized requests succeed
    /// without touching the allocator.
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return Some(dangling(layout));
        }

        let counters = &self.inner.counters;
        match self.inner.allocator.allocate(layout) {
            Some(ptr) => {
                let in_use =
                    counters.bytes_in_use.fetch_add(layout.size(), Ordering::AcqRel) + layout.size();
                counters.peak_bytes.fetch_max(in_use, Ordering::AcqRel);
                counters.allocations.fetch_add(1, Ordering::AcqRel);
                Some(ptr)
            }
            None => {
                counters.failures.fetch_add(1, Ordering::AcqRel);
                warn!(
                    size = layout.size(),
                    align = layout.align(),
                    "Host allocator exhausted"
                );
                None
            }
        }
    }

    /// Return a block obtained from [`AllocatorContext::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this context (or a clone of it)
    /// with the same `layout`, and must not be used afterwards.
    #[allow(unsafe_code)]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.allocator.deallocate(ptr, layout) };
        self.inner
            .counters
            .bytes_in_use
            .fetch_sub(layout.size(), Ordering::AcqRel);
    }

    /// Snapshot the usage counters.
    pub fn stats(&self) -> AllocatorStats {
        let counters = &self.inner.counters;
        AllocatorStats {
            bytes_in_use: counters.bytes_in_use.load(Ordering::Acquire),
            peak_bytes: counters.peak_bytes.load(Ordering::Acquire),
            allocations: counters.allocations.load(Ordering::Acquire),
            failures: counters.failures.load(Ordering::Acquire),
        }
    }

    /// Number of refused requests so far.
    pub fn failures(&self) -> usize {
        self.inner.counters.failures.load(Ordering::Acquire)
    }
}

impl fmt::Debug for AllocatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Well-aligned non-null pointer for zero-sized blocks.
fn dangling(layout: Layout) -> NonNull<u8> {
    NonNull::<u8>::dangling()
        .with_addr(NonZeroUsize::new(layout.align()).unwrap_or(NonZeroUsize::MIN))
}
