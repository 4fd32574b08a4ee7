//! # Base allocator
//!
//! The bootstrap memory provider underneath a general purpose allocator. It
//! hands out raw, zero-filled memory for the allocator's own bookkeeping
//! (radix tree nodes, descriptors, arena metadata) without ever calling
//! back into the allocator it helps build.
//!
//! ```text
//!            alloc(size)
//!                 |
//!      +----------v-----------+    miss    +-----------------+
//!      | available-span index | ---------> | chunk acquisition | --> ChunkSource
//!      |  (size, address)     |            +-----------------+
//!      +----------^-----------+                 |       ^
//!                 | remainder                   v       |
//!                 +---------------------- descriptor pool
//! ```
//!
//! The hard part is self-hosting: the records that describe free spans need
//! memory too. When no recycled descriptor is available, the descriptor for
//! a new chunk is carved out of the tail of that very chunk, so no
//! allocation ever depends on one that hasn't happened yet.
//!
//! All state lives in one [`Base`] value guarded by a single lock. Memory is
//! never returned to the operating system and there is no per-allocation
//! free.

mod chunk;
mod error;
mod hooks;
mod kernel;
mod pool;
mod span;
mod tree;
mod utils;

#[doc(hidden)]
pub mod testing;

use std::{mem, ptr::NonNull};

use log::trace;
use spin::{mutex::SpinMutex, relax::Yield};

pub use error::BaseError;
pub use hooks::{MemHooks, NoHooks};
pub use kernel::{ChunkSource, DEFAULT_LG_CHUNK, OsChunks, page_size};
pub use span::Span;
pub use utils::{CACHELINE, cacheline_ceiling};

use pool::DescriptorPool;
use span::NODE_RESERVE;
use tree::SpanTree;

/// Whether the global counters are maintained.
const STATS: bool = cfg!(feature = "stats");

/// Byte and chunk counters. Only updated when the `stats` feature is on.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    /// Bytes dispensed to callers or consumed by self-hosted descriptors.
    pub allocated: usize,
    /// Bytes obtained from the chunk source.
    pub mapped: usize,
    /// Successful chunk requests.
    pub chunks: usize,
}

impl Counters {
    #[inline]
    pub fn record_allocated(&mut self, bytes: usize) {
        if STATS {
            self.allocated += bytes;
        }
    }

    #[inline]
    pub fn record_chunk(&mut self, bytes: usize) {
        if STATS {
            self.mapped += bytes;
            self.chunks += 1;
        }
    }
}

/// Everything the base lock protects.
pub(crate) struct State<C, H> {
    pub avail: SpanTree,
    pub pool: DescriptorPool,
    pub counters: Counters,
    pub chunks: C,
    pub hooks: H,
}

// Safety: the raw descriptor pointers are only touched while the base lock is held.
unsafe impl<C: Send, H: Send> Send for State<C, H> {}

impl<C, H> State<C, H> {
    pub(crate) const fn new(chunks: C, hooks: H) -> Self {
        Self {
            avail: SpanTree::new(),
            pool: DescriptorPool::new(),
            counters: Counters {
                allocated: 0,
                mapped: 0,
                chunks: 0,
            },
            chunks,
            hooks,
        }
    }
}

impl<C: ChunkSource, H: MemHooks> State<C, H> {
    /// Carves `csize` bytes, a cache line multiple, out of the best fitting
    /// indexed span or out of a fresh chunk.
    fn alloc(&mut self, csize: usize) -> Result<Span, BaseError> {
        let (mut node, reused) = match self.avail.find_at_least(csize) {
            Some(node) => {
                unsafe { self.avail.remove(node) };
                (node, true)
            }
            None => (self.acquire_chunk(csize)?, false),
        };

        let whole = unsafe { node.as_ref() }.span;

        let span = if whole.size() > csize {
            // Keep the remainder around for later requests.
            let front = unsafe { node.as_mut() }.span.split_front(csize);
            unsafe { self.avail.insert(node) };
            front
        } else {
            unsafe { self.pool.give_back(node, &self.hooks) };
            whole
        };

        self.counters.record_allocated(csize);
        self.hooks.mark_unspecified(span.address(), csize);

        trace!(
            "base alloc of {csize} bytes at {:p} ({})",
            span.address(),
            if reused { "indexed span" } else { "new chunk" }
        );

        Ok(span)
    }
}

/// Point-in-time view of the base allocator's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BaseStats {
    /// Bytes dispensed by [`Base::alloc`] plus bytes used by self-hosted descriptors.
    pub allocated: usize,
    /// Bytes obtained from the chunk source.
    pub mapped: usize,
    /// Number of chunks obtained from the chunk source.
    pub chunks: usize,
    /// Spans currently waiting in the available-span index.
    pub avail_spans: usize,
    /// Descriptors currently recycled in the pool.
    pub pooled_descriptors: usize,
}

/// The base allocator.
///
/// Construct one with [`Base::boot`] at startup and share it with whatever
/// needs metadata memory. It is `Sync`, every operation takes the one
/// internal lock.
///
/// Chunks obtained by a `Base` are never released, not even when it is
/// dropped: the memory it handed out may still be in use.
pub struct Base<C: ChunkSource = OsChunks, H: MemHooks = NoHooks> {
    // Waiters spin briefly, then yield: a holder may be blocked in the chunk source.
    state: SpinMutex<State<C, H>, Yield>,
}

impl<C: ChunkSource> Base<C, NoHooks> {
    /// Boots a base allocator drawing chunks from `chunks`.
    ///
    /// Fails with [`BaseError::InvalidGranularity`] when the granularity of
    /// `chunks` is not a power of two large enough for one self-hosted
    /// descriptor plus one cache line.
    pub fn boot(chunks: C) -> Result<Self, BaseError> {
        Self::boot_with_hooks(chunks, NoHooks)
    }
}

impl<C: ChunkSource, H: MemHooks> Base<C, H> {
    /// Like [`Base::boot`], reporting region state changes to `hooks`.
    pub fn boot_with_hooks(chunks: C, hooks: H) -> Result<Self, BaseError> {
        let granularity = chunks.granularity();
        if !granularity.is_power_of_two() || granularity < NODE_RESERVE + CACHELINE {
            return Err(BaseError::InvalidGranularity { granularity });
        }

        Ok(Self {
            state: SpinMutex::new(State::new(chunks, hooks)),
        })
    }

    /// Allocates `size` bytes rounded up to a multiple of [`CACHELINE`].
    ///
    /// The returned slice covers the whole rounded size and starts on a
    /// cache line boundary. Its bytes are zero, but callers must treat the
    /// content as unspecified: only the allocator itself builds on the zero
    /// fill, e.g. to skip clearing sparse radix tree nodes.
    ///
    /// A failure changes nothing. There is no retry.
    pub fn alloc(&self, size: usize) -> Result<NonNull<[u8]>, BaseError> {
        if size == 0 {
            return Err(BaseError::ZeroSize);
        }

        // Cache line granularity rules out false sharing between unrelated metadata.
        let csize = cacheline_ceiling(size).ok_or(BaseError::SizeOverflow { size })?;

        let span = self.state.lock().alloc(csize)?;

        Ok(NonNull::slice_from_raw_parts(span.address(), csize))
    }

    /// Total bytes dispensed so far, self-hosted descriptors included.
    ///
    /// Never decreases. Always zero without the `stats` feature.
    pub fn allocated_get(&self) -> usize {
        self.state.lock().counters.allocated
    }

    /// Snapshot of all counters, taken under the lock.
    pub fn stats(&self) -> BaseStats {
        let state = self.state.lock();

        BaseStats {
            allocated: state.counters.allocated,
            mapped: state.counters.mapped,
            chunks: state.counters.chunks,
            avail_spans: state.avail.len(),
            pooled_descriptors: state.pool.len(),
        }
    }

    /// Acquires the base lock ahead of a `fork`.
    ///
    /// Forking copies only the calling thread. Holding the lock across the
    /// fork guarantees no other thread is inside the allocator at that
    /// moment, so the child never inherits a lock nobody can release.
    ///
    /// Must be followed by [`Base::postfork_parent`] in the parent and
    /// [`Base::postfork_child`] in the child. On platforms without `fork`
    /// the three hooks are still well defined but have no use.
    pub fn prefork(&self) {
        mem::forget(self.state.lock());
    }

    /// Releases the lock taken by [`Base::prefork`] in the parent process.
    ///
    /// # Safety
    /// The calling thread must hold the lock through [`Base::prefork`].
    pub unsafe fn postfork_parent(&self) {
        unsafe { self.state.force_unlock() }
    }

    /// Releases the lock taken by [`Base::prefork`] in the child process,
    /// whose only thread is the one that forked.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child, before any other
    /// thread is started, after [`Base::prefork`] ran in the parent.
    pub unsafe fn postfork_child(&self) {
        unsafe { self.state.force_unlock() }
    }
}
