use std::{mem, ptr::NonNull};

use log::{debug, warn};

use crate::{
    State,
    error::BaseError,
    hooks::MemHooks,
    kernel::ChunkSource,
    span::{Descriptor, NODE_RESERVE, Span},
    utils::align,
};

impl<C: ChunkSource, H: MemHooks> State<C, H> {
    /// Obtains a fresh chunk of at least `min_size` usable bytes and returns a
    /// descriptor for all of it.
    ///
    /// The descriptor comes from the pool when it has one. Otherwise its
    /// storage is carved out of the tail of the new chunk, which is why the
    /// chunk is requested [`NODE_RESERVE`] bytes larger in that case:
    ///
    /// ```text
    /// chunk                                       chunk + csize
    /// +--------------------------------------------+------------+
    /// |               usable span                  | Descriptor |
    /// +--------------------------------------------+------------+
    ///                                              ^ chunk + csize - NODE_RESERVE
    /// ```
    ///
    /// The advertised span never includes the bytes of its own descriptor.
    /// On failure a descriptor taken from the pool goes straight back, so
    /// nothing changes.
    pub(crate) fn acquire_chunk(
        &mut self,
        min_size: usize,
    ) -> Result<NonNull<Descriptor>, BaseError> {
        debug_assert!(min_size != 0);

        let pooled = self.pool.try_take(&self.hooks);
        let reserve = if pooled.is_none() { NODE_RESERVE } else { 0 };

        let csize = min_size
            .checked_add(reserve)
            .and_then(|size| align(size, self.chunks.granularity()));

        let chunk = match csize {
            Some(csize) => self.chunks.request_chunk(csize).map(|chunk| (chunk, csize)),
            None => None,
        };

        let Some((chunk, mut csize)) = chunk else {
            if let Some(node) = pooled {
                unsafe { self.pool.give_back(node, &self.hooks) };
            }

            return Err(match csize {
                Some(requested) => {
                    warn!("chunk source could not supply {requested} bytes");
                    BaseError::OutOfMemory { requested }
                }
                None => BaseError::SizeOverflow { size: min_size },
            });
        };

        self.counters.record_chunk(csize);

        let node = match pooled {
            Some(node) => node,
            None => {
                csize -= reserve;

                // SAFETY: `reserve` bytes were added on top of the request, so
                // the descriptor lies inside the chunk, past the usable span.
                let at = unsafe { chunk.add(csize) };
                self.counters.record_allocated(reserve);
                self.hooks.mark_defined(at, mem::size_of::<Descriptor>());

                at.cast::<Descriptor>()
            }
        };

        debug!(
            "acquired chunk at {chunk:p}, {csize} usable bytes ({} descriptor)",
            if reserve == 0 { "pooled" } else { "self-hosted" }
        );

        // SAFETY: `node` is either a pooled descriptor nothing references or
        // fresh, cache line aligned storage at the tail of the new chunk.
        Ok(unsafe { Descriptor::init(node, Span::new(chunk, csize, true)) })
    }
}
