use std::{mem, ptr::NonNull};

use crate::utils::CACHELINE;

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Bytes reserved at the tail of a chunk when its descriptor has to be
/// carved out of the chunk itself. One descriptor, rounded to a cache line.
pub(crate) const NODE_RESERVE: usize = {
    let size = mem::size_of::<Descriptor>();
    (size + CACHELINE - 1) & !(CACHELINE - 1)
};

/// A contiguous region of memory handed out by, or waiting in, the base allocator.
///
/// Spans never overlap any other live or indexed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    address: NonNull<u8>,
    size: usize,
    zeroed: bool,
}

impl Span {
    pub(crate) const fn new(address: NonNull<u8>, size: usize, zeroed: bool) -> Self {
        Self {
            address,
            size,
            zeroed,
        }
    }

    #[inline]
    pub const fn address(&self) -> NonNull<u8> {
        self.address
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether the content of the span is known to be zero-filled.
    #[inline]
    pub const fn zeroed(&self) -> bool {
        self.zeroed
    }

    /// One past the last byte of the span.
    #[inline]
    pub fn end(&self) -> usize {
        self.address.as_ptr() as usize + self.size
    }

    /// Ordering key of the available-span index: size first, address second.
    #[inline]
    pub(crate) fn key(&self) -> (usize, usize) {
        (self.size, self.address.as_ptr() as usize)
    }

    /// Splits off the low `size` bytes and returns them, keeping the remainder in `self`.
    ///
    /// `size` must be strictly smaller than the span.
    pub(crate) fn split_front(&mut self, size: usize) -> Span {
        debug_assert!(size < self.size);

        let front = Span::new(self.address, size, self.zeroed);

        // SAFETY: `size < self.size`, so the new start stays inside the span.
        self.address = unsafe { self.address.add(size) };
        self.size -= size;

        front
    }
}

/// The record describing a [`Span`] while it sits in the available-span
/// index or while it is recycled in the descriptor pool.
///
/// Descriptors are never allocated through the allocator they serve. Their
/// storage is either carved out of the tail of the chunk they first
/// describe, or recycled from the pool.
///
/// ```text
/// +---------------------+
/// |        span         |  -> address, size, zeroed
/// +---------------------+
/// |    left | right     |  -> available-span index links
/// +---------------------+
/// |       height        |
/// +---------------------+
/// |      next_free      |  -> descriptor pool link
/// +---------------------+
/// ```
///
/// A descriptor is referenced by at most one structure at a time: the
/// index, the pool, or a local variable while it moves between them.
pub(crate) struct Descriptor {
    pub span: Span,
    pub left: Link<Descriptor>,
    pub right: Link<Descriptor>,
    pub height: u8,
    pub next_free: Link<Descriptor>,
}

impl Descriptor {
    /// Writes a fresh descriptor for `span` at `addr` and returns it.
    ///
    /// # Safety
    /// `addr` must point to at least [`NODE_RESERVE`] writable bytes, suitably
    /// aligned for `Descriptor`, that nothing else references.
    pub unsafe fn init(addr: NonNull<Descriptor>, span: Span) -> NonNull<Descriptor> {
        unsafe {
            addr.as_ptr().write(Descriptor {
                span,
                left: None,
                right: None,
                height: 1,
                next_free: None,
            });
        }

        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_fits_its_reservation() {
        assert!(mem::size_of::<Descriptor>() <= NODE_RESERVE);
        assert_eq!(0, NODE_RESERVE % CACHELINE);
        assert!(mem::align_of::<Descriptor>() <= CACHELINE);
    }

    #[test]
    fn split_front_keeps_remainder() {
        let mut buf = [0u8; 256];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut span = Span::new(base, 256, true);

        let front = span.split_front(64);

        assert_eq!(base, front.address());
        assert_eq!(64, front.size());
        assert!(front.zeroed());
        assert_eq!(192, span.size());
        assert_eq!(front.end(), span.address().as_ptr() as usize);
        assert_eq!(base.as_ptr() as usize + 256, span.end());
    }

    #[test]
    fn key_orders_by_size_then_address() {
        let mut buf = [0u8; 256];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let low = Span::new(base, 64, true);
        let high = Span::new(unsafe { base.add(128) }, 64, true);
        let big = Span::new(base, 128, true);

        assert!(low.key() < high.key());
        assert!(high.key() < big.key());
    }
}
