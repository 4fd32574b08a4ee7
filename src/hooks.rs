use std::ptr::NonNull;

/// Integration point for memory analysis tooling.
///
/// The base allocator tells the hooks when a region stops carrying
/// meaningful content (a descriptor going back to the pool, a span handed
/// to a caller) and when a region becomes meaningful again (a descriptor
/// pulled back out of the pool). Memory handed out is physically zeroed,
/// but callers must treat it as unspecified, which is what these calls
/// communicate to a checker.
///
/// Every method defaults to a no-op.
pub trait MemHooks {
    /// `len` bytes at `addr` now hold meaningful content.
    fn mark_defined(&self, addr: NonNull<u8>, len: usize) {
        let _ = (addr, len);
    }

    /// `len` bytes at `addr` no longer hold meaningful content.
    fn mark_unspecified(&self, addr: NonNull<u8>, len: usize) {
        let _ = (addr, len);
    }
}

/// Hooks used when no analysis tooling is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl MemHooks for NoHooks {}
