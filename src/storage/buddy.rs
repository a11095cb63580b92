//! Buddy allocator - power-of-two free lists with split and coalesce.
//!
//! [`FreeLists`] tracks which byte ranges of the container are free, one
//! ordered list of offsets per size class ("width", the log2 of the block
//! size). Allocation pops the smallest free offset of the requested width,
//! splitting a larger block when none is available; freeing coalesces a
//! block with its buddy (`offset XOR 2^width`) whenever both halves are
//! free, restoring the parent block at the next width up.
//!
//! # Invariants
//! - No two entries across any lists overlap.
//! - For any offset free at width `w`, its buddy is never simultaneously
//!   free at width `w` (it would have been coalesced).
//! - Every list is kept sorted ascending, so allocation order and root
//!   block serialization are deterministic.

use tracing::trace;

use crate::common::config::{MAX_WIDTH, MIN_WIDTH, NUM_WIDTHS};
use crate::common::{Error, Result};

/// The 32 free lists of a container, indexed by width.
#[derive(Debug, Clone, Default)]
pub struct FreeLists {
    lists: Vec<Vec<u32>>,
}

impl FreeLists {
    /// All lists empty. Used when deserializing a root block.
    pub fn new() -> Self {
        Self {
            lists: vec![Vec::new(); NUM_WIDTHS],
        }
    }

    /// The initial state of a fresh container.
    ///
    /// Seeds a single free block of the maximum width covering the whole
    /// addressable range, then reserves the minimum-width block at offset 0
    /// for the header region. The reservation splits the range into one
    /// free block at every width from `MIN_WIDTH` to `MAX_WIDTH - 1`, each
    /// at offset `2^width`.
    pub fn seeded() -> Self {
        let mut free = Self::new();
        free.lists[MAX_WIDTH as usize].push(0);
        let head = free
            .alloc(MIN_WIDTH)
            .expect("seeding cannot exhaust a full range");
        debug_assert_eq!(head, 0);
        free
    }

    /// The free offsets at one width, sorted ascending.
    pub fn list(&self, width: u8) -> &[u32] {
        &self.lists[width as usize]
    }

    /// Restore one width's list from deserialized offsets.
    pub(crate) fn set_list(&mut self, width: u8, offsets: Vec<u32>) {
        self.lists[width as usize] = offsets;
    }

    /// Total number of free offsets across all widths.
    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    /// Whether no space is free at any width.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a block of `2^width` bytes, returning its offset.
    ///
    /// The offset is aligned to `2^width` and not handed out again until
    /// freed. The smallest free offset of the requested width is preferred;
    /// otherwise the next larger class is split.
    ///
    /// # Errors
    /// `AllocationExhausted` when the request cannot be satisfied below the
    /// maximum width.
    pub fn alloc(&mut self, width: u8) -> Result<u32> {
        if width > MAX_WIDTH {
            return Err(Error::AllocationExhausted { width });
        }
        let list = &mut self.lists[width as usize];
        if !list.is_empty() {
            return Ok(list.remove(0));
        }
        let offset = self.alloc(width + 1)?;
        trace!(width, offset, "split");
        self.free(offset ^ (1u32 << width), width);
        Ok(offset)
    }

    /// Return a block of `2^width` bytes at `offset` to the free pool.
    ///
    /// Coalesces with the buddy block repeatedly while both halves of a
    /// parent are free.
    pub fn free(&mut self, mut offset: u32, mut width: u8) {
        loop {
            let list = &mut self.lists[width as usize];
            let buddy = offset ^ (1u32 << width);
            if let Ok(i) = list.binary_search(&buddy) {
                list.remove(i);
                trace!(width, offset, buddy, "coalesce");
                offset &= buddy;
                width += 1;
                continue;
            }
            let i = list.binary_search(&offset).unwrap_err();
            list.insert(i, offset);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Collects (offset, size) of every free block across all widths.
    fn free_ranges(free: &FreeLists) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for w in 0..NUM_WIDTHS as u8 {
            for &off in free.list(w) {
                out.push((u64::from(off), 1u64 << w));
            }
        }
        out.sort_unstable();
        out
    }

    /// Asserts free + allocated ranges exactly tile [0, 2^31).
    fn assert_tiles(free: &FreeLists, allocated: &[(u32, u8)]) {
        let mut ranges = free_ranges(free);
        ranges.extend(
            allocated
                .iter()
                .map(|&(off, w)| (u64::from(off), 1u64 << w)),
        );
        ranges.sort_unstable();

        let mut cursor = 0u64;
        for (off, size) in ranges {
            assert_eq!(off, cursor, "gap or overlap at offset {}", off);
            cursor = off + size;
        }
        assert_eq!(cursor, 1 << 31, "ranges do not cover the full space");
    }

    #[test]
    fn test_seeded_layout() {
        let free = FreeLists::seeded();
        // Header reservation consumed [0, 32); one block per width remains,
        // each at offset 2^width.
        for w in MIN_WIDTH..MAX_WIDTH {
            assert_eq!(free.list(w), &[1u32 << w], "width {}", w);
        }
        assert!(free.list(MAX_WIDTH).is_empty());
        assert_tiles(&free, &[(0, MIN_WIDTH)]);
    }

    #[test]
    fn test_alloc_pops_smallest_first() {
        let mut free = FreeLists::new();
        free.set_list(6, vec![64, 192, 320]);
        assert_eq!(free.alloc(6).unwrap(), 64);
        assert_eq!(free.alloc(6).unwrap(), 192);
        assert_eq!(free.list(6), &[320]);
    }

    #[test]
    fn test_alloc_splits_larger_block() {
        let mut free = FreeLists::new();
        free.set_list(8, vec![512]);
        let off = free.alloc(6).unwrap();
        assert_eq!(off, 512);
        assert_eq!(free.list(6), &[576]);
        assert_eq!(free.list(7), &[640]);
        assert!(free.list(8).is_empty());
    }

    #[test]
    fn test_alloc_exhausted() {
        let mut free = FreeLists::new();
        assert!(matches!(
            free.alloc(7),
            Err(Error::AllocationExhausted { .. })
        ));
    }

    #[test]
    fn test_free_coalesces_in_either_order() {
        for flip in [false, true] {
            let mut free = FreeLists::new();
            free.set_list(9, vec![1024]);
            let a = free.alloc(8).unwrap();
            let b = free.alloc(8).unwrap();
            assert_eq!((a, b), (1024, 1280));
            if flip {
                free.free(b, 8);
                free.free(a, 8);
            } else {
                free.free(a, 8);
                free.free(b, 8);
            }
            // Both halves freed must restore the original parent block.
            assert!(free.list(8).is_empty());
            assert_eq!(free.list(9), &[1024]);
        }
    }

    #[test]
    fn test_free_keeps_lists_sorted() {
        let mut free = FreeLists::new();
        free.free(192, 6);
        free.free(64, 6);
        free.free(320, 6);
        assert_eq!(free.list(6), &[64, 192, 320]);
    }

    /// Reproduces the free-list layout of a container whose root block was
    /// relocated once: superblock at 64, node page at 4096, root at 8192.
    #[test]
    fn test_relocated_root_layout() {
        let mut free = FreeLists::seeded();

        let root = free.alloc(11).unwrap();
        assert_eq!(root, 2048);
        let scratch = free.alloc(5).unwrap();
        assert_eq!(scratch, 32);
        let superblock = free.alloc(5).unwrap();
        assert_eq!(superblock, 64);
        free.free(scratch, 5);
        let page = free.alloc(12).unwrap();
        assert_eq!(page, 4096);
        let new_root = free.alloc(11).unwrap();
        assert_eq!(new_root, 8192);
        free.free(root, 11);

        assert_eq!(free.list(5), &[32, 96]);
        assert!(free.list(6).is_empty());
        assert_eq!(free.list(7), &[128]);
        assert_eq!(free.list(8), &[256]);
        assert_eq!(free.list(9), &[512]);
        assert_eq!(free.list(10), &[1024]);
        assert_eq!(free.list(11), &[2048, 10240]);
        assert_eq!(free.list(12), &[12288]);
        assert!(free.list(13).is_empty());
        for w in 14..=30u8 {
            assert_eq!(free.list(w), &[1u32 << w], "width {}", w);
        }
        assert!(free.list(31).is_empty());

        assert_tiles(
            &free,
            &[(0, 5), (64, 5), (4096, 12), (8192, 11)],
        );
    }

    proptest! {
        /// For any alloc/free sequence, free and allocated ranges stay
        /// pairwise disjoint and exactly tile the addressable space.
        #[test]
        fn prop_alloc_free_tiles_space(
            ops in proptest::collection::vec(
                (any::<bool>(), 5u8..14, any::<prop::sample::Index>()),
                1..64,
            )
        ) {
            let mut free = FreeLists::seeded();
            let mut allocated: Vec<(u32, u8)> = vec![(0, MIN_WIDTH)];

            for (is_alloc, width, index) in ops {
                if is_alloc {
                    let off = free.alloc(width).unwrap();
                    prop_assert_eq!(off % (1 << width), 0);
                    allocated.push((off, width));
                } else if allocated.len() > 1 {
                    // Never free the header reservation at index 0.
                    let i = 1 + index.index(allocated.len() - 1);
                    let (off, w) = allocated.swap_remove(i);
                    free.free(off, w);
                }
                assert_tiles(&free, &allocated);
            }
        }
    }
}
