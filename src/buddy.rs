//! The page-frame buddy allocator.
//!
//! [`PageBuddy`] overlays a complete binary tree on a power-of-two page
//! arena. The root covers the whole arena; every split halves a block, and
//! each level keeps its own free list. Allocation pops the smallest
//! satisfying free block and splits it down to the requested size;
//! deallocation locates the block by descending address comparisons and
//! eagerly merges it with its buddy as far up the tree as it can.
//!
//! All bookkeeping lives in a metadata region separate from the arena; the
//! managed memory itself is never read or written.

use core::{alloc::Layout, fmt, mem::ManuallyDrop, num::NonZeroUsize, ptr::NonNull};

use crate::{
    align_up,
    free_list::FreeList,
    tree::{self, State, Tree, ROOT},
    AllocError, AllocInitError, BackingAllocator, BasePtr, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

#[cfg(test)]
use alloc::vec::Vec;

/// A binary-buddy physical page allocator.
///
/// This takes three const parameters:
/// - `DEPTH` is the number of levels in the tree; the arena holds
///   `2^(DEPTH - 1)` pages. `DEPTH` must lie in `2..=32`.
/// - `PAGE_SIZE` is the page size in bytes, a power of two.
/// - `MAX_ALLOC` is the largest page count a single request may ask for: a
///   power of two no larger than the arena. Kernels usually pin this well
///   below the arena size to match the largest contiguous request any
///   subsystem is expected to make.
///
/// The allocator's bookkeeping lives entirely in a separate metadata region
/// (see [`Self::metadata_layout`]); the managed arena is never read or
/// written, so it may be memory the CPU cannot access directly.
pub struct PageBuddy<
    const DEPTH: usize,
    const PAGE_SIZE: usize,
    const MAX_ALLOC: usize,
    A: BackingAllocator,
> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    /// Pointer to the region that backs the node table.
    ///
    /// This must not be used while the allocator exists; it is stored solely
    /// so that it may be returned in `into_raw_parts()`.
    metadata: NonNull<u8>,
    tree: Tree,
    free: [FreeList; DEPTH],
    backing_allocator: A,
}

// The node table is exclusively owned by the allocator, so sending the
// allocator to another thread moves sole access along with it.
unsafe impl<
        const DEPTH: usize,
        const PAGE_SIZE: usize,
        const MAX_ALLOC: usize,
        A: BackingAllocator + Send,
    > Send for PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize>
    PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, Raw>
{
    /// Constructs a `PageBuddy` from raw pointers.
    ///
    /// The managed arena begins at the first `PAGE_SIZE` boundary at or
    /// above `base` and spans [`Self::region_layout`]`.size()` bytes from
    /// there.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the const parameters are
    /// unsatisfiable, or [`AllocInitError::InvalidLocation`] if the arena
    /// span would overflow the address space at `base`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The arena described above must remain unused by anything else for
    ///   the lifetime of the allocator.
    /// - `metadata` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::metadata_layout`], and it must be
    ///   valid for reads and writes for the entire size indicated by that
    ///   `Layout`.
    ///
    /// [`Layout`]: core::alloc::Layout
    pub unsafe fn new_raw(
        base: NonNull<u8>,
        metadata: NonNull<u8>,
    ) -> Result<PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, Raw>, AllocInitError> {
        let parts = unsafe { PageBuddyParts::<DEPTH, PAGE_SIZE, MAX_ALLOC>::new(base, metadata)? };
        Ok(parts.with_backing_allocator(Raw))
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize>
    PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, Global>
{
    /// Constructs a `PageBuddy` backed by the global allocator.
    ///
    /// Both the arena and the node table are obtained from the global
    /// allocator and handed back when the allocator is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the const parameters are
    /// unsatisfiable, or [`AllocInitError::AllocFailed`] if the global
    /// allocator cannot provide one of the regions.
    pub fn try_new() -> Result<PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, Global>, AllocInitError> {
        if !Self::config_valid() {
            return Err(AllocInitError::InvalidConfig);
        }

        let region_layout = Self::region_layout();
        let metadata_layout = Self::metadata_layout();

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(metadata) => metadata,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            match PageBuddyParts::<DEPTH, PAGE_SIZE, MAX_ALLOC>::new(region, metadata) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global)),
                Err(err) => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                    Err(err)
                }
            }
        }
    }

    /// Like [`Self::try_new`], but panics on an invalid configuration and
    /// invokes [`handle_alloc_error`] on allocation failure.
    ///
    /// [`handle_alloc_error`]: alloc::alloc::handle_alloc_error
    pub fn new() -> PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, Global> {
        match Self::try_new() {
            Ok(buddy) => buddy,
            Err(AllocInitError::AllocFailed(layout)) => alloc::alloc::handle_alloc_error(layout),
            Err(err) => panic!("PageBuddy::new: {:?}", err),
        }
    }
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize, A: BackingAllocator> Drop
    for PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
    fn drop(&mut self) {
        let region_layout = Self::region_layout();
        let metadata_layout = Self::metadata_layout();

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout);
            self.backing_allocator
                .deallocate(self.metadata, metadata_layout);
        }
    }
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize, A: BackingAllocator>
    PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
    /// Number of pages in the arena.
    pub const PAGES: usize = 1 << DEPTH.saturating_sub(1);

    /// Number of nodes in the tree.
    pub const NODES: usize = 2 * Self::PAGES - 1;

    const fn config_valid() -> bool {
        DEPTH >= 2
            && DEPTH <= 32
            && PAGE_SIZE.is_power_of_two()
            && MAX_ALLOC.is_power_of_two()
            && MAX_ALLOC <= Self::PAGES
            && Self::PAGES.checked_mul(PAGE_SIZE).is_some()
    }

    /// Returns the layout requirements for the managed arena.
    pub fn region_layout() -> Layout {
        assert!(Self::config_valid());
        Layout::from_size_align(Self::PAGES * PAGE_SIZE, PAGE_SIZE).expect("arena layout error")
    }

    /// Returns the layout requirements for the metadata region.
    pub fn metadata_layout() -> Layout {
        assert!(Self::config_valid());
        Tree::metadata_layout(DEPTH)
    }

    /// Validates a request, returning the tree level it is served from.
    pub(crate) fn request_level(count: usize) -> Result<usize, AllocError> {
        if count == 0 {
            return Err(AllocError::ZeroPages);
        }
        if !count.is_power_of_two() {
            return Err(AllocError::NotPowerOfTwo);
        }
        if count > MAX_ALLOC {
            return Err(AllocError::TooLarge);
        }

        Ok(count.trailing_zeros() as usize)
    }

    /// Allocates a block of `count` contiguous pages.
    ///
    /// `count` must be a power of two no larger than `MAX_ALLOC`. The
    /// returned pointer is the base of the block, and its offset from the
    /// arena base is a multiple of `count * PAGE_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is malformed, or
    /// [`AllocError::OutOfMemory`] if no free block on any level can serve
    /// it. The allocator is unchanged on every error path.
    pub fn allocate_pages(&mut self, count: usize) -> Result<NonNull<u8>, AllocError> {
        let target = Self::request_level(count)?;

        // Smallest level at or above the target with a free node.
        let split_lvl = (target..DEPTH)
            .find(|&lvl| self.free[lvl].count() > 0)
            .ok_or_else(|| {
                log::warn!("arena exhausted: no free block for {} page(s)", count);
                AllocError::OutOfMemory
            })?;

        let mut id = self.free[split_lvl]
            .pop(&mut self.tree)
            .expect("level count out of sync with its list");

        // Split down to the target level. The descent always takes the left
        // child, so the returned block keeps the base address of the node
        // that was popped; each right child becomes a new free node one
        // level further down.
        while (self.tree.get(id).lvl as usize) > target {
            self.tree.get_mut(id).state = State::Inner;

            let right = tree::right_of(id);
            let right_lvl = {
                let node = self.tree.get_mut(right);
                node.state = State::Free;
                node.lvl as usize
            };
            self.free[right_lvl].push(&mut self.tree, right);

            id = tree::left_of(id);
        }

        let node = self.tree.get_mut(id);
        node.state = State::Used;

        let addr = NonZeroUsize::new(node.base).expect("block base address is never null");
        Ok(self.base.with_addr(addr))
    }

    /// Returns the block whose base address is `ptr` to the allocator,
    /// merging it with its buddy as far up the tree as possible.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not page aligned, lies outside the arena, is not
    /// the base address of an outstanding allocation, or has already been
    /// freed. These are caller bugs, and no state is modified before the
    /// check that detects them.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocate_pages`] on this
    /// allocator, and the block it denotes must not be accessed after this
    /// call.
    pub unsafe fn deallocate_pages(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.addr().get();
        let arena = self.tree.get(ROOT).base;

        if addr % PAGE_SIZE != 0 {
            panic!("deallocate_pages: address {:#x} is not page aligned", addr);
        }
        if addr < arena || addr >= arena + Self::PAGES * PAGE_SIZE {
            panic!("deallocate_pages: address {:#x} is outside the arena", addr);
        }

        // Walk down from the root. The used node owning `addr` is to the
        // left of every right child whose base exceeds it.
        let mut id = ROOT;
        while self.tree.get(id).state == State::Inner {
            let right = tree::right_of(id);
            id = if self.tree.get(right).base > addr {
                tree::left_of(id)
            } else {
                right
            };
        }

        {
            let node = self.tree.get(id);
            if node.state != State::Used || node.base != addr {
                panic!(
                    "deallocate_pages: double free or stray address {:#x}",
                    addr
                );
            }
        }

        if id == ROOT {
            self.tree.get_mut(ROOT).state = State::Free;
            self.free[DEPTH - 1].push(&mut self.tree, ROOT);
            return;
        }

        // Eager coalescing: while the buddy is free, retire both halves and
        // hand the merged block up to the parent.
        while id != ROOT {
            let buddy = tree::buddy_of(id);
            if self.tree.get(buddy).state != State::Free {
                break;
            }

            self.tree.get_mut(id).state = State::Absent;
            self.tree.get_mut(buddy).state = State::Absent;

            let buddy_lvl = self.tree.get(buddy).lvl as usize;
            self.free[buddy_lvl].unlink(&mut self.tree, buddy);

            id = tree::parent_of(id);
        }

        let lvl = {
            let node = self.tree.get_mut(id);
            node.state = State::Free;
            node.lvl as usize
        };
        self.free[lvl].push(&mut self.tree, id);
    }

    /// Per-level free-node counts, level 0 (single pages) first.
    pub fn free_counts(&self) -> [usize; DEPTH] {
        let mut counts = [0; DEPTH];
        for (lvl, list) in self.free.iter().enumerate() {
            counts[lvl] = list.count();
        }
        counts
    }

    /// Returns a snapshot of arena occupancy.
    pub fn stats(&self) -> ArenaStats<DEPTH> {
        let free_per_level = self.free_counts();
        let pages_free = free_per_level
            .iter()
            .enumerate()
            .map(|(lvl, &count)| count << lvl)
            .sum();

        ArenaStats {
            pages_total: Self::PAGES,
            pages_used: Self::PAGES - pages_free,
            pages_free,
            free_per_level,
        }
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and the metadata
    /// pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned region pointer becomes the sole owner of the
    /// region that was used to construct the allocator. As such, all
    /// allocations made from this allocator should be either freed or
    /// forgotten before calling this method.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        let this = ManuallyDrop::new(self);

        (this.base.ptr(), this.metadata)
    }
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize, A: BackingAllocator>
    fmt::Debug for PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBuddy")
            .field("base", &self.base)
            .field("free", &self.free)
            .finish_non_exhaustive()
    }
}

/// A snapshot of arena occupancy, as produced by [`PageBuddy::stats`].
///
/// `pages_used + pages_free` always equals `pages_total`, and the
/// `free_per_level[lvl]` blocks of `2^lvl` pages each sum to `pages_free`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaStats<const DEPTH: usize> {
    /// Pages in the arena.
    pub pages_total: usize,
    /// Pages currently owned by callers.
    pub pages_used: usize,
    /// Pages sitting on a free list.
    pub pages_free: usize,
    /// Free-node count per level, level 0 (single pages) first.
    pub free_per_level: [usize; DEPTH],
}

impl<const DEPTH: usize> fmt::Display for ArenaStats<DEPTH> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} pages used, {} free of {}",
            self.pages_used, self.pages_free, self.pages_total
        )?;
        for (lvl, count) in self.free_per_level.iter().enumerate() {
            writeln!(f, "level {:2}: {} free", lvl, count)?;
        }
        Ok(())
    }
}

/// Like a `PageBuddy`, but without a `Drop` impl or a backing allocator.
///
/// This assists in tacking on the allocator type parameter, because this
/// struct can be moved out of while `PageBuddy` itself cannot.
struct PageBuddyParts<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize> {
    base: BasePtr,
    metadata: NonNull<u8>,
    tree: Tree,
    free: [FreeList; DEPTH],
}

impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize>
    PageBuddyParts<DEPTH, PAGE_SIZE, MAX_ALLOC>
{
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A> {
        let PageBuddyParts {
            base,
            metadata,
            tree,
            free,
        } = self;

        PageBuddy {
            base,
            metadata,
            tree,
            free,
            backing_allocator,
        }
    }

    /// Validates the configuration, materializes the node table and seeds
    /// the top-level free list with the root.
    ///
    /// # Safety
    ///
    /// As [`PageBuddy::new_raw`].
    unsafe fn new(
        base: NonNull<u8>,
        metadata: NonNull<u8>,
    ) -> Result<PageBuddyParts<DEPTH, PAGE_SIZE, MAX_ALLOC>, AllocInitError> {
        if !PageBuddy::<DEPTH, PAGE_SIZE, MAX_ALLOC, Raw>::config_valid() {
            return Err(AllocInitError::InvalidConfig);
        }

        let pages = PageBuddy::<DEPTH, PAGE_SIZE, MAX_ALLOC, Raw>::PAGES;

        let arena_base =
            align_up(base.addr().get(), PAGE_SIZE).ok_or(AllocInitError::InvalidLocation)?;
        arena_base
            .checked_add(pages * PAGE_SIZE)
            .ok_or(AllocInitError::InvalidLocation)?;

        let mut tree = unsafe { Tree::materialize(DEPTH, PAGE_SIZE, arena_base, metadata) };

        let mut free = [FreeList::EMPTY; DEPTH];
        free[DEPTH - 1].push(&mut tree, ROOT);

        log::debug!(
            "pgbuddy: managing {} pages of {} bytes at {:#x}",
            pages,
            PAGE_SIZE,
            arena_base
        );

        Ok(PageBuddyParts {
            base: BasePtr::new(base),
            metadata,
            tree,
            free,
        })
    }
}

#[cfg(test)]
impl<const DEPTH: usize, const PAGE_SIZE: usize, const MAX_ALLOC: usize, A: BackingAllocator>
    PageBuddy<DEPTH, PAGE_SIZE, MAX_ALLOC, A>
{
    /// Walks the whole tree and every free list, asserting the structural
    /// invariants: the decomposition covers the arena exactly once, free
    /// lists agree with node states and counters, and no two free siblings
    /// are left uncoalesced.
    pub(crate) fn check_consistency(&self) {
        for lvl in 0..DEPTH {
            let mut walked = 0;
            let mut prev: Option<u32> = None;
            let mut cur = self.free[lvl].head();
            while let Some(id) = cur {
                let node = self.tree.get(id);
                assert_eq!(node.state, State::Free);
                assert_eq!(node.lvl as usize, lvl);
                assert_eq!(node.prev, prev);
                walked += 1;
                prev = cur;
                cur = node.next;
            }
            assert_eq!(
                self.free[lvl].count(),
                walked,
                "count mismatch at level {lvl}"
            );
        }

        let mut pages = 0;
        let mut free_nodes = 0;
        let mut stack = Vec::new();
        stack.push(ROOT);
        while let Some(id) = stack.pop() {
            let node = self.tree.get(id);
            match node.state {
                State::Inner => {
                    assert!(node.lvl > 0, "split a single page");
                    stack.push(tree::left_of(id));
                    stack.push(tree::right_of(id));
                }
                State::Used | State::Free => {
                    if node.state == State::Free {
                        free_nodes += 1;
                        if id != ROOT {
                            assert_ne!(
                                self.tree.get(tree::buddy_of(id)).state,
                                State::Free,
                                "uncoalesced free siblings"
                            );
                        }
                    }
                    pages += node.pages();
                    self.assert_subtree_absent(id);
                }
                State::Absent => panic!("absent node {id} inside the decomposition"),
            }
        }

        assert_eq!(pages, Self::PAGES, "decomposition does not cover the arena");
        assert_eq!(free_nodes, self.free_counts().iter().sum::<usize>());
    }

    fn has_children(id: u32) -> bool {
        2 * id as usize + 2 < Self::NODES
    }

    fn assert_subtree_absent(&self, id: u32) {
        let mut stack = Vec::new();
        if Self::has_children(id) {
            stack.push(tree::left_of(id));
            stack.push(tree::right_of(id));
        }
        while let Some(id) = stack.pop() {
            let node = self.tree.get(id);
            assert_eq!(node.state, State::Absent);
            assert_eq!(node.prev, None);
            assert_eq!(node.next, None);
            if Self::has_children(id) {
                stack.push(tree::left_of(id));
                stack.push(tree::right_of(id));
            }
        }
    }
}
