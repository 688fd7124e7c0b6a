// This module provides the pluggable allocation strategy used by a compilation context.
// ResourceAllocator is the caller-facing trait (allocate, allocate_zeroed, reallocate,
// free) and SystemAllocator is the default implementation over the global allocator.
// ContextAlloc is the cheap cloneable handle that the rest of the crate threads through
// its containers: it implements allocator_api2's Allocator trait so IR arenas,
// hashbrown tables and data blocks all draw from the caller's strategy. Allocation
// failure is routed to the context's error handler, which never returns, so container
// code never observes an allocation error.

//! Pluggable allocator and the per-context allocation handle.

use allocator_api2::alloc::{AllocError, Allocator};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

/// Unrecoverable resource failures reported through the context error handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("out of memory: failed to allocate {size} bytes (align {align})")]
    OutOfMemory { size: usize, align: usize },

    #[error("out of memory: failed to grow allocation from {old_size} to {new_size} bytes")]
    GrowFailed { old_size: usize, new_size: usize },
}

/// Error handler invoked for unrecoverable allocation failures.
///
/// The handler must not return: it either aborts the process or unwinds to a
/// top-level handler installed by the host.
pub type ErrorHandler = fn(&ResourceError) -> !;

/// Allocation strategy supplied when a context is created.
///
/// Implementations must be safe to use from several independent contexts running on
/// different threads at the same time.
pub trait ResourceAllocator: Send + Sync {
    /// Allocate a block for `layout`. `layout.size()` is never zero.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Allocate a zero-filled block for `layout`.
    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = self.allocate(layout)?;
        // SAFETY: `ptr` was just allocated with room for `layout.size()` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };
        Some(ptr)
    }

    /// Resize a block previously returned by this allocator.
    ///
    /// # Safety
    /// `ptr` must have been allocated by `self` with layout `old`.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let new_layout = Layout::from_size_align(new_size, old.align()).ok()?;
        let new_ptr = self.allocate(new_layout)?;
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old.size().min(new_size));
        self.free(ptr, old);
        Some(new_ptr)
    }

    /// Release a block.
    ///
    /// # Safety
    /// `ptr` must have been allocated by `self` with `layout`.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Default strategy backed by the process-wide global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl ResourceAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: callers never pass a zero-sized layout.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        NonNull::new(std::alloc::realloc(ptr.as_ptr(), old, new_size))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Default error handler: log the failure and abort.
pub fn abort_on_resource_error(err: &ResourceError) -> ! {
    log::error!("c2jit: {err}");
    std::process::abort()
}

struct Shared {
    strategy: Arc<dyn ResourceAllocator>,
    handler: Mutex<ErrorHandler>,
}

/// Allocation handle shared by every container belonging to one context.
#[derive(Clone)]
pub struct ContextAlloc {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ContextAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAlloc").finish_non_exhaustive()
    }
}

impl ContextAlloc {
    pub fn new(strategy: Arc<dyn ResourceAllocator>) -> Self {
        Self {
            shared: Arc::new(Shared {
                strategy,
                handler: Mutex::new(abort_on_resource_error),
            }),
        }
    }

    /// Handle over the global allocator, convenient for building IR outside a context.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemAllocator))
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.shared.handler.lock() = handler;
    }

    /// Report an unrecoverable failure. Never returns.
    pub fn fail(&self, err: ResourceError) -> ! {
        let handler = *self.shared.handler.lock();
        handler(&err)
    }

    /// Allocate raw bytes, invoking the error handler on failure.
    pub fn alloc_bytes(&self, layout: Layout, zeroed: bool) -> NonNull<u8> {
        if layout.size() == 0 {
            return dangling(layout);
        }
        let ptr = if zeroed {
            self.shared.strategy.allocate_zeroed(layout)
        } else {
            self.shared.strategy.allocate(layout)
        };
        match ptr {
            Some(ptr) => ptr,
            None => self.fail(ResourceError::OutOfMemory {
                size: layout.size(),
                align: layout.align(),
            }),
        }
    }

    /// Release bytes obtained from [`ContextAlloc::alloc_bytes`].
    ///
    /// # Safety
    /// `ptr` must come from this handle (or a clone) with the same `layout`.
    pub unsafe fn free_bytes(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.shared.strategy.free(ptr, layout);
        }
    }
}

fn dangling(layout: Layout) -> NonNull<u8> {
    // Alignment is a non-zero power of two, so it doubles as a well-aligned dangling address.
    NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling())
}

unsafe impl Allocator for ContextAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.alloc_bytes(layout, false);
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.alloc_bytes(layout, true);
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.free_bytes(ptr, layout)
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.resize(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.resize(ptr, old_layout, new_layout)
    }
}

impl ContextAlloc {
    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if old_layout.size() == 0 || new_layout.size() == 0 || old_layout.align() != new_layout.align() {
            // Fall back to allocate + copy + free when the strategy cannot resize in place.
            let new_ptr = self.alloc_bytes(new_layout, false);
            let n = old_layout.size().min(new_layout.size());
            if n > 0 {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), n);
            }
            self.free_bytes(ptr, old_layout);
            return Ok(NonNull::slice_from_raw_parts(new_ptr, new_layout.size()));
        }
        match self
            .shared
            .strategy
            .reallocate(ptr, old_layout, new_layout.size())
        {
            Some(p) => Ok(NonNull::slice_from_raw_parts(p, new_layout.size())),
            None => self.fail(ResourceError::GrowFailed {
                old_size: old_layout.size(),
                new_size: new_layout.size(),
            }),
        }
    }
}

/// Owned UTF-8 text stored in context memory, used for every name a context keeps.
#[derive(Clone)]
pub struct AllocStr {
    bytes: allocator_api2::vec::Vec<u8, ContextAlloc>,
}

impl AllocStr {
    pub fn new(alloc: &ContextAlloc, text: &str) -> Self {
        let mut bytes = allocator_api2::vec::Vec::with_capacity_in(text.len(), alloc.clone());
        bytes.extend_from_slice(text.as_bytes());
        Self { bytes }
    }

    /// Format straight into context memory.
    pub fn format(alloc: &ContextAlloc, args: std::fmt::Arguments<'_>) -> Self {
        let mut out = Self::new(alloc, "");
        // Writing into a vector cannot fail.
        let _ = std::fmt::Write::write_fmt(&mut out, args);
        out
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: the bytes are only ever filled from `&str` values.
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }
}

impl std::fmt::Write for AllocStr {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.bytes.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

impl std::ops::Deref for AllocStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl std::borrow::Borrow<str> for AllocStr {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq for AllocStr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for AllocStr {}

impl PartialEq<str> for AllocStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for AllocStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl std::hash::Hash for AllocStr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl std::fmt::Display for AllocStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for AllocStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        live: AtomicUsize,
    }

    impl ResourceAllocator for Counting {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            self.live.fetch_add(layout.size(), Ordering::SeqCst);
            SystemAllocator.allocate(layout)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live.fetch_sub(layout.size(), Ordering::SeqCst);
            SystemAllocator.free(ptr, layout)
        }
    }

    #[test]
    fn test_vec_routes_through_strategy() {
        let counting = Arc::new(Counting::default());
        let alloc = ContextAlloc::new(counting.clone());
        {
            let mut v: allocator_api2::vec::Vec<u64, ContextAlloc> =
                allocator_api2::vec::Vec::new_in(alloc.clone());
            for i in 0..100 {
                v.push(i);
            }
            assert!(counting.live.load(Ordering::SeqCst) >= 800);
            assert_eq!(v.iter().sum::<u64>(), 4950);
        }
        assert_eq!(counting.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_names_live_in_context_memory() {
        let counting = Arc::new(Counting::default());
        let alloc = ContextAlloc::new(counting.clone());
        {
            let mut table: hashbrown::HashMap<AllocStr, u32, hashbrown::DefaultHashBuilder, ContextAlloc> =
                hashbrown::HashMap::with_hasher_in(Default::default(), alloc.clone());
            table.insert(AllocStr::new(&alloc, "main"), 1);
            table.insert(AllocStr::format(&alloc, format_args!("i{}.{}", 3, "tmp")), 2);
            assert!(counting.live.load(Ordering::SeqCst) >= "main".len() + "i3.tmp".len());
            assert_eq!(table.get("main"), Some(&1));
            assert_eq!(table.get("i3.tmp"), Some(&2));
            assert!(table.get("mai").is_none());
            let name = AllocStr::new(&alloc, "fib");
            assert_eq!(name, "fib");
            assert_eq!(format!("{name} {name:?}"), "fib \"fib\"");
        }
        assert_eq!(counting.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_sized_allocation_is_free() {
        let alloc = ContextAlloc::system();
        let layout = Layout::from_size_align(0, 8).unwrap();
        let ptr = alloc.alloc_bytes(layout, false);
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        unsafe { alloc.free_bytes(ptr, layout) };
    }

    #[test]
    fn test_zeroed_default_method() {
        let counting = Counting::default();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = counting.allocate_zeroed(layout).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { counting.free(ptr, layout) };
        assert_eq!(counting.live.load(Ordering::SeqCst), 0);
    }
}
