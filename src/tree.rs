//! The node tree overlaying the page arena.
//!
//! All `2 * PAGES - 1` nodes live in one flat, heap-indexed table inside a
//! caller-provided metadata region: the root at index 0, the children of
//! node `i` at `2i + 1` and `2i + 2`. Structural relations (parent, children,
//! buddy) are arithmetic on indices; only the lifecycle state, the block base
//! address and the free-list links are stored per node.

use core::{alloc::Layout, ptr::NonNull};

/// Index of the root node, which covers the whole arena.
pub(crate) const ROOT: u32 = 0;

/// Lifecycle state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Not part of the current decomposition of the arena.
    Absent,
    /// The block is owned by a caller.
    Used,
    /// The block has been split; its children cover it.
    Inner,
    /// The block is available, linked into its level's free list.
    Free,
}

/// A candidate block of `1 << lvl` contiguous pages at a fixed base address.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Node {
    pub state: State,
    /// Tree level: 0 at the leaves, `DEPTH - 1` at the root.
    pub lvl: u32,
    /// Byte address of the block's first page. Fixed at materialization.
    pub base: usize,
    /// Previous node on this level's free list; `Some` only while `Free`.
    pub prev: Option<u32>,
    /// Next node on this level's free list; `Some` only while `Free`.
    pub next: Option<u32>,
}

impl Node {
    /// Number of pages this node covers.
    pub fn pages(&self) -> usize {
        1 << self.lvl
    }
}

#[inline]
pub(crate) fn parent_of(id: u32) -> u32 {
    debug_assert_ne!(id, ROOT);
    (id - 1) / 2
}

#[inline]
pub(crate) fn left_of(id: u32) -> u32 {
    2 * id + 1
}

#[inline]
pub(crate) fn right_of(id: u32) -> u32 {
    2 * id + 2
}

/// The sibling under the same parent: the other half of the block that was
/// split to produce `id`.
#[inline]
pub(crate) fn buddy_of(id: u32) -> u32 {
    debug_assert_ne!(id, ROOT);
    if id % 2 == 1 {
        id + 1
    } else {
        id - 1
    }
}

/// The flat node table, backed by a metadata region supplied by the caller.
pub(crate) struct Tree {
    nodes: NonNull<Node>,
    len: usize,
}

impl Tree {
    /// Number of nodes in a tree of `depth` levels.
    pub fn node_count(depth: usize) -> usize {
        (1 << depth) - 1
    }

    /// Layout of the metadata region backing a tree of `depth` levels.
    pub fn metadata_layout(depth: usize) -> Layout {
        Layout::array::<Node>(Self::node_count(depth)).expect("node table layout error")
    }

    /// Writes the structural fields of every node and returns the table.
    ///
    /// The root covers the whole arena starting at `arena_base` and is the
    /// only node born `Free`; every other node starts `Absent`. A left child
    /// inherits its parent's base address; a right child starts half the
    /// parent's block further up.
    ///
    /// # Safety
    ///
    /// `metadata` must be valid for reads and writes for
    /// `metadata_layout(depth).size()` bytes and aligned to
    /// `metadata_layout(depth).align()`, and must not be accessed by anything
    /// else while the returned `Tree` is alive.
    pub unsafe fn materialize(
        depth: usize,
        page_size: usize,
        arena_base: usize,
        metadata: NonNull<u8>,
    ) -> Tree {
        let len = Self::node_count(depth);
        let nodes = metadata.cast::<Node>();

        unsafe {
            nodes.as_ptr().write(Node {
                state: State::Free,
                lvl: (depth - 1) as u32,
                base: arena_base,
                prev: None,
                next: None,
            });
        }

        for id in 1..len {
            // The parent is always initialized before its children.
            let parent = unsafe { nodes.as_ptr().add((id - 1) / 2).read() };
            let lvl = parent.lvl - 1;
            let base = if id % 2 == 1 {
                parent.base
            } else {
                parent.base + (1usize << lvl) * page_size
            };

            unsafe {
                nodes.as_ptr().add(id).write(Node {
                    state: State::Absent,
                    lvl,
                    base,
                    prev: None,
                    next: None,
                });
            }
        }

        Tree { nodes, len }
    }

    pub fn get(&self, id: u32) -> &Node {
        let id = id as usize;
        assert!(id < self.len);
        unsafe { &*self.nodes.as_ptr().add(id) }
    }

    pub fn get_mut(&mut self, id: u32) -> &mut Node {
        let id = id as usize;
        assert!(id < self.len);
        unsafe { &mut *self.nodes.as_ptr().add(id) }
    }
}
