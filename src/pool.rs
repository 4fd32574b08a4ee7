use std::{mem, ptr::NonNull};

use crate::{
    hooks::MemHooks,
    span::{Descriptor, Link},
};

/// Stack of [`Descriptor`] records that currently describe nothing.
///
/// A descriptor lands here when the span it described was handed out whole,
/// and leaves again the next time a chunk needs describing. Recycling them
/// is what keeps most chunk acquisitions from having to carve a new
/// descriptor out of the chunk itself.
///
/// ```text
///   head
///    |
/// +--v---------+    +------------+    +------------+
/// | Descriptor | -> | Descriptor | -> | Descriptor | -> None
/// +------------+    +------------+    +------------+
///     next_free         next_free         next_free
/// ```
///
/// The link lives in its own field; the stale span data of a pooled
/// descriptor is never reinterpreted.
///
/// Every method must be called with the base lock held.
pub(crate) struct DescriptorPool {
    head: Link<Descriptor>,
    len: usize,
}

impl DescriptorPool {
    /// Creates a new empty pool.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pops the most recently returned descriptor, if any.
    ///
    /// An empty pool is a normal outcome: the caller mints a descriptor
    /// somewhere else.
    pub fn try_take<H: MemHooks>(&mut self, hooks: &H) -> Option<NonNull<Descriptor>> {
        let node = self.head?;

        unsafe {
            self.head = node.as_ref().next_free;
        }
        self.len -= 1;

        hooks.mark_unspecified(node.cast(), mem::size_of::<Descriptor>());

        Some(node)
    }

    /// Pushes `node` onto the pool.
    ///
    /// # Safety
    /// `node` must be a valid descriptor referenced by no other structure.
    pub unsafe fn give_back<H: MemHooks>(&mut self, mut node: NonNull<Descriptor>, hooks: &H) {
        hooks.mark_unspecified(node.cast(), mem::size_of::<Descriptor>());

        unsafe {
            node.as_mut().next_free = self.head;
        }
        self.head = Some(node);
        self.len += 1;
    }
}
