//! Test doubles shared by the unit and integration tests.

use std::{
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{kernel::ChunkSource, kernel::OsChunks, utils::align};

/// [`ChunkSource`] with a fixed 4096 byte granularity that counts requests
/// and can be told to start failing. Clones share their counters.
#[derive(Clone)]
pub struct CountingChunks {
    granularity: usize,
    inner: OsChunks,
    calls: Arc<AtomicUsize>,
    budget: Arc<AtomicUsize>,
}

impl Default for CountingChunks {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingChunks {
    pub fn new() -> Self {
        Self::with_granularity(4096)
    }

    pub fn with_granularity(granularity: usize) -> Self {
        Self {
            granularity,
            inner: OsChunks::with_lg_chunk(12),
            calls: Arc::new(AtomicUsize::new(0)),
            budget: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Number of chunk requests so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Lets `successes` more requests through, then fails every request.
    pub fn fail_after(&self, successes: usize) {
        self.budget.store(successes, Ordering::SeqCst);
    }
}

impl ChunkSource for CountingChunks {
    fn granularity(&self) -> usize {
        self.granularity
    }

    fn request_chunk(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()?;

        // Pages may be larger than the granularity we advertise.
        let size = align(size, self.inner.granularity())?;
        self.inner.request_chunk(size)
    }
}
