#![allow(dead_code)]

use std::ptr::NonNull;

pub use membase::testing::CountingChunks;

/// Cache line and chunk granularity the scenarios are written against.
pub const CACHELINE: usize = 64;
pub const GRANULARITY: usize = 4096;

pub fn addr(region: NonNull<[u8]>) -> usize {
    region.cast::<u8>().as_ptr() as usize
}
