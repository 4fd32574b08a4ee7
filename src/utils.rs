//! Size rounding helpers shared by the index, the chunk layer and the public API.

/// Width of a CPU cache line in bytes. Every base allocation is a multiple
/// of this so that unrelated metadata objects never share a line.
pub const CACHELINE: usize = 64;

/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Returns `None` when the rounded
/// value does not fit in a `usize`.
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(alignment - 1) {
        Some(sum) => Some(sum & !(alignment - 1)),
        None => None,
    }
}

/// Rounds `size` up to the next multiple of [`CACHELINE`].
#[inline]
pub const fn cacheline_ceiling(size: usize) -> Option<usize> {
    align(size, CACHELINE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_cacheline() {
        let alignments = vec![(1..65, 64), (65..129, 128), (129..193, 192)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(Some(expected), cacheline_ceiling(size));
            }
        }
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let alignments = vec![(1..4097, 4096), (4097..8193, 8192)];

        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(Some(expected), align(size, 4096));
            }
        }
    }

    #[test]
    fn aligned_values_are_unchanged() {
        assert_eq!(Some(0), cacheline_ceiling(0));
        assert_eq!(Some(4096), align(4096, 4096));
        assert_eq!(Some(128), cacheline_ceiling(128));
    }

    #[test]
    fn overflow_is_reported() {
        assert_eq!(None, cacheline_ceiling(usize::MAX));
        assert_eq!(None, align(usize::MAX - 10, 4096));
    }
}
