//! A lock-guarded allocator for shared use.
//!
//! Kernels hold their page allocator in a `static`, so every operation must
//! go through one mutual-exclusion lock. [`LockedPageBuddy`] wraps a
//! [`PageBuddy`] in a [`spin::Mutex`] and re-exposes its operations on
//! `&self`. Each call holds the lock for a bounded number of index
//! operations and releases it on every exit path; malformed requests are
//! rejected before the lock is taken at all.

use core::{fmt, ptr::NonNull};

use spin::Mutex;

use crate::{
    buddy::{ArenaStats, PageBuddy},
    AllocError, BackingAllocator,
};

/// A [`PageBuddy`] behind a spin lock.
pub struct LockedPageBuddy<
    const DEPTH: usize,
    const PAGE_SIZE: usize,
    const MAX_ALLOC: usize,
    A: BackingAllocator,
> {
    inner: Mutex<PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>>,
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize, A: BackingAllocator>
    LockedPageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
    /// Wraps `buddy` for shared use.
    pub fn new(buddy: PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>) -> Self {
        LockedPageBuddy {
            inner: Mutex::new(buddy),
        }
    }

    /// Allocates a block of `count` contiguous pages under the lock.
    ///
    /// See [`PageBuddy::allocate_pages`].
    pub fn allocate_pages(&self, count: usize) -> Result<NonNull<u8>, AllocError> {
        // Reject malformed requests without contending for the lock.
        PageBuddy::<DEPTH, PAGE_SIZE, MAX_ALLOC, A>::request_level(count)?;

        self.inner.lock().allocate_pages(count)
    }

    /// Returns a block to the allocator under the lock.
    ///
    /// # Panics
    ///
    /// As [`PageBuddy::deallocate_pages`].
    ///
    /// # Safety
    ///
    /// As [`PageBuddy::deallocate_pages`].
    pub unsafe fn deallocate_pages(&self, ptr: NonNull<u8>) {
        unsafe { self.inner.lock().deallocate_pages(ptr) }
    }

    /// Returns a snapshot of arena occupancy.
    pub fn stats(&self) -> ArenaStats<DEPTH> {
        self.inner.lock().stats()
    }

    /// Consumes the wrapper, returning the inner allocator.
    pub fn into_inner(self) -> PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A> {
        self.inner.into_inner()
    }
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize, A: BackingAllocator>
    fmt::Debug for LockedPageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedPageBuddy").finish_non_exhaustive()
    }
}
