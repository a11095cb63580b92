//! Store - the paged container.
//!
//! The [`Store`] owns the backing file, the buddy allocator's free lists,
//! the indirection table mapping logical block numbers to physical
//! addresses, and the named table of contents. All of that state lives in
//! memory for the life of an open session and is persisted into a single
//! root block (plus a small fixed header) on [`flush`](Store::flush).
//!
//! # Container layout
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────┐
//! │ header (36B) │ blocks at buddy-allocated offsets ...       │
//! │ at -4        │   root block: indirection + TOC + free lists│
//! └──────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Root block, all integers big-endian:
//! ```text
//! Offset  Size        Field
//! ------  ----        -----
//! 0       4           offset_count
//! 4       4           unused (must be 0)
//! 8       4×N         addresses, N = offset_count padded to 256
//! ...     4           toc_count
//! ...     1+len+4     toc entries (name_len, ascii name, block number)
//! ...     4+4×n, ×32  free lists (count, offsets), one per width
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, trace};

use crate::common::config::{
    HEADER_SIZE, HEADER_TRAILER, MAGIC, MAGIC1, NUM_WIDTHS, OFFSET_TABLE_CHUNK, ROOT_BLOCK,
};
use crate::common::{width_for, Address, BlockNumber, Error, Result};
use crate::storage::block::Block;
use crate::storage::buddy::FreeLists;
use crate::storage::file::ContainerFile;

/// An open container session.
///
/// # Concurrency
/// Single-threaded, synchronous. One exclusive writer per open session;
/// callers needing concurrent access must serialize externally.
///
/// # Blocks
/// [`get_block`](Store::get_block) always re-reads from storage and returns
/// a fresh copy; a mutated block must go back through
/// [`write_block`](Store::write_block) before any other code path re-reads
/// the same offset.
pub struct Store {
    file: ContainerFile,
    /// Indirection table: raw address per logical block number, 0 = unused.
    offsets: Vec<u32>,
    /// Table of contents: short ASCII name -> logical block number.
    toc: BTreeMap<String, u32>,
    free: FreeLists,
    /// Reserved header bytes, preserved byte-for-byte across sessions.
    trailer: [u8; 16],
    dirty: bool,
}

impl Store {
    /// Create a fresh container at `path`.
    ///
    /// The new container has an empty TOC and the documented initial
    /// free-list layout; its root block is written immediately.
    ///
    /// # Errors
    /// Fails if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = ContainerFile::create(path)?;
        let mut store = Self {
            file,
            offsets: vec![0],
            toc: BTreeMap::new(),
            free: FreeLists::seeded(),
            trailer: HEADER_TRAILER,
            dirty: true,
        };
        store.flush()?;
        debug!("created fresh container");
        Ok(store)
    }

    /// Open an existing container.
    ///
    /// # Errors
    /// `Format` on a bad magic, mismatched redundant root addresses, or a
    /// malformed root block.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = ContainerFile::open(path)?;

        let header = file.read_at(-4, HEADER_SIZE)?;
        let mut h = Block::from_parts(0, header);
        let magic1 = h.read_u32()?;
        let magic: [u8; 4] = h.read(4)?.try_into().expect("fixed-size read");
        if magic1 != MAGIC1 || magic != MAGIC {
            return Err(Error::Format("not a buddy container".into()));
        }
        let root_offset = h.read_u32()?;
        let root_size = h.read_u32()?;
        let root_offset_copy = h.read_u32()?;
        if root_offset != root_offset_copy {
            return Err(Error::Format("root addresses differ".into()));
        }
        let trailer: [u8; 16] = h.read(16)?.try_into().expect("fixed-size read");

        let data = file.read_at(i64::from(root_offset), root_size as usize)?;
        let mut root = Block::from_parts(root_offset, data);

        let count = root.read_u32()? as usize;
        if root.read_u32()? != 0 {
            return Err(Error::Format("nonzero reserved word in root block".into()));
        }
        let padded = count.div_ceil(OFFSET_TABLE_CHUNK) * OFFSET_TABLE_CHUNK;
        let mut offsets = Vec::with_capacity(count);
        for i in 0..padded {
            let raw = root.read_u32()?;
            if i < count {
                offsets.push(raw);
            }
        }

        let mut toc = BTreeMap::new();
        let toc_count = root.read_u32()?;
        for _ in 0..toc_count {
            let name_len = root.read_u8()? as usize;
            let name = String::from_utf8(root.read(name_len)?.to_vec())
                .map_err(|_| Error::Format("non-ASCII TOC name".into()))?;
            let value = root.read_u32()?;
            toc.insert(name, value);
        }

        let mut free = FreeLists::new();
        for width in 0..NUM_WIDTHS as u8 {
            let n = root.read_u32()? as usize;
            let mut list = Vec::with_capacity(n);
            for _ in 0..n {
                list.push(root.read_u32()?);
            }
            free.set_list(width, list);
        }

        debug!(
            blocks = offsets.len(),
            toc_entries = toc.len(),
            free_entries = free.len(),
            "opened container"
        );
        Ok(Self {
            file,
            offsets,
            toc,
            free,
            trailer,
            dirty: false,
        })
    }

    /// Open an existing container, or create one if the path is vacant.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate (or reallocate) a block with room for at least `bytes`.
    ///
    /// With `block = None`, the first unused logical block number is
    /// assigned. With `Some`, the existing block is resized: a no-op when
    /// the width already matches, otherwise the old address is released
    /// first and a fresh one assigned — the block number stays stable, the
    /// physical address may move.
    ///
    /// # Errors
    /// `AllocationExhausted` when the buddy allocator cannot satisfy the
    /// required width. This is fatal to the session.
    pub fn allocate(&mut self, bytes: u32, block: Option<BlockNumber>) -> Result<BlockNumber> {
        self.allocate_inner(bytes, block.map(|b| b.0)).map(BlockNumber)
    }

    fn allocate_inner(&mut self, bytes: u32, block: Option<u32>) -> Result<u32> {
        let width = width_for(bytes);
        let block = match block {
            Some(b) => b as usize,
            None => match self.offsets.iter().position(|&raw| raw == 0) {
                Some(i) => i,
                None => {
                    self.offsets.push(0);
                    self.offsets.len() - 1
                }
            },
        };

        let addr = Address::from_raw(self.offsets[block]);
        if !addr.is_null() {
            if addr.width() == width {
                return Ok(block as u32);
            }
            self.free.free(addr.offset(), addr.width());
            self.offsets[block] = 0;
            self.dirty = true;
        }

        let offset = self.free.alloc(width)?;
        self.offsets[block] = Address::new(offset, width).raw();
        self.dirty = true;
        trace!(block, offset, width, "allocated");
        Ok(block as u32)
    }

    /// Free a block's address and clear its indirection slot.
    ///
    /// The last slot is truncated away; interior slots are zeroed so their
    /// numbers can be reassigned.
    pub fn release(&mut self, block: BlockNumber) {
        let i = block.0 as usize;
        if i >= self.offsets.len() {
            return;
        }
        let addr = Address::from_raw(self.offsets[i]);
        if !addr.is_null() {
            self.free.free(addr.offset(), addr.width());
        }
        if i == self.offsets.len() - 1 {
            self.offsets.pop();
        } else {
            self.offsets[i] = 0;
        }
        self.dirty = true;
        trace!(block = i, "released");
    }

    /// Read the block behind a logical block number.
    ///
    /// Returns `None` for an unused slot. The returned block is a fresh
    /// copy; see the module docs on write-back.
    pub fn get_block(&mut self, block: BlockNumber) -> Result<Option<Block>> {
        let Some(&raw) = self.offsets.get(block.0 as usize) else {
            return Ok(None);
        };
        let addr = Address::from_raw(raw);
        if addr.is_null() {
            return Ok(None);
        }
        let data = self
            .file
            .read_at(i64::from(addr.offset()), addr.size() as usize)?;
        Ok(Some(Block::from_parts(addr.offset(), data)))
    }

    /// Write a mutated block back to storage.
    ///
    /// No-op when the block is clean, so redundant flushes are harmless.
    pub fn write_block(&mut self, block: &mut Block) -> Result<()> {
        if block.is_dirty() {
            self.file
                .write_at(i64::from(block.offset()), block.as_slice())?;
            block.clear_dirty();
        }
        Ok(())
    }

    // ========================================================================
    // Table of contents
    // ========================================================================

    /// Look up a named root.
    pub fn toc_get(&self, name: &str) -> Option<BlockNumber> {
        self.toc.get(name).copied().map(BlockNumber)
    }

    /// Register (or replace) a named root.
    pub fn toc_set(&mut self, name: &str, block: BlockNumber) {
        self.toc.insert(name.to_string(), block.0);
        self.dirty = true;
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist the indirection table, TOC, and free lists.
    ///
    /// Reallocates the root block if its serialized size changed width,
    /// rewrites the header, and always forces the durability barrier.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            // Reallocating the root changes the free lists, which changes
            // the serialized size; iterate until the width stabilizes.
            let mut size = self.root_block_size();
            loop {
                self.allocate_inner(size, Some(ROOT_BLOCK))?;
                let new_size = self.root_block_size();
                let width = Address::from_raw(self.offsets[ROOT_BLOCK as usize]).width();
                size = new_size;
                if width_for(new_size) == width {
                    break;
                }
            }

            let addr = Address::from_raw(self.offsets[ROOT_BLOCK as usize]);
            let mut root = Block::zeroed(addr.offset(), size as usize);
            self.write_root_block(&mut root)?;
            self.file
                .write_at(i64::from(addr.offset()), root.as_slice())?;

            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(&MAGIC1.to_be_bytes());
            header.extend_from_slice(&MAGIC);
            header.extend_from_slice(&addr.offset().to_be_bytes());
            header.extend_from_slice(&size.to_be_bytes());
            header.extend_from_slice(&addr.offset().to_be_bytes());
            header.extend_from_slice(&self.trailer);
            self.file.write_at(-4, &header)?;

            self.dirty = false;
            debug!(root_offset = addr.offset(), root_size = size, "flushed");
        }
        self.file.sync()
    }

    /// Flush and end the session.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Bytes required by the root block in its current state.
    fn root_block_size(&self) -> u32 {
        let padded = self.offsets.len().div_ceil(OFFSET_TABLE_CHUNK) * OFFSET_TABLE_CHUNK;
        let mut size = 8 + 4 * padded;
        size += 4;
        for name in self.toc.keys() {
            size += 1 + name.len() + 4;
        }
        size += NUM_WIDTHS * 4 + 4 * self.free.len();
        size as u32
    }

    fn write_root_block(&self, root: &mut Block) -> Result<()> {
        root.write_u32(self.offsets.len() as u32)?;
        root.write_u32(0)?;
        for &raw in &self.offsets {
            root.write_u32(raw)?;
        }
        let padding =
            self.offsets.len().div_ceil(OFFSET_TABLE_CHUNK) * OFFSET_TABLE_CHUNK - self.offsets.len();
        root.seek(root.pos() + 4 * padding)?;

        root.write_u32(self.toc.len() as u32)?;
        for (name, &value) in &self.toc {
            root.write_u8(name.len() as u8)?;
            root.write(name.as_bytes())?;
            root.write_u32(value)?;
        }

        for width in 0..NUM_WIDTHS as u8 {
            let list = self.free.list(width);
            root.write_u32(list.len() as u32)?;
            for &offset in list {
                root.write_u32(offset)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// The free offsets at one width, sorted ascending.
    pub fn free_list(&self, width: u8) -> &[u32] {
        self.free.list(width)
    }

    /// The physical address behind a logical block number, if allocated.
    pub fn block_address(&self, block: BlockNumber) -> Option<Address> {
        self.offsets
            .get(block.0 as usize)
            .map(|&raw| Address::from_raw(raw))
            .filter(|a| !a.is_null())
    }

    /// Number of indirection-table slots, used and unused.
    pub fn block_count(&self) -> usize {
        self.offsets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::create(dir.path().join("test.store")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_fresh_container_state() {
        let (store, _dir) = fresh();

        // Root block at 2048, width 11, holding 1264 serialized bytes.
        let addr = store.block_address(BlockNumber(ROOT_BLOCK)).unwrap();
        assert_eq!(addr.offset(), 2048);
        assert_eq!(addr.width(), 11);
        assert_eq!(store.root_block_size(), 1264);
        assert_eq!(store.block_count(), 1);

        // One free block at every width except 11 (root) and 31 (split).
        for w in 5..=10u8 {
            assert_eq!(store.free_list(w), &[1u32 << w]);
        }
        assert!(store.free_list(11).is_empty());
        for w in 12..=30u8 {
            assert_eq!(store.free_list(w), &[1u32 << w]);
        }
        assert!(store.free_list(31).is_empty());
    }

    #[test]
    fn test_allocate_same_width_is_noop() {
        let (mut store, _dir) = fresh();

        let b = store.allocate(20, None).unwrap();
        let addr = store.block_address(b).unwrap();
        assert_eq!(addr.width(), 5);

        // 25 bytes still fits width 5: address unchanged.
        let b2 = store.allocate(25, Some(b)).unwrap();
        assert_eq!(b2, b);
        assert_eq!(store.block_address(b).unwrap(), addr);
    }

    #[test]
    fn test_reallocate_releases_old_address() {
        let (mut store, _dir) = fresh();

        let b = store.allocate(20, None).unwrap();
        let old = store.block_address(b).unwrap();

        let b2 = store.allocate(100, Some(b)).unwrap();
        assert_eq!(b2, b);
        let new = store.block_address(b).unwrap();
        assert_eq!(new.width(), 7);
        assert_ne!(old, new);
        // Old 32-byte range back on a free list.
        assert!(store.free_list(5).contains(&old.offset()));
    }

    #[test]
    fn test_release_truncates_trailing_slot() {
        let (mut store, _dir) = fresh();

        let a = store.allocate(20, None).unwrap();
        let b = store.allocate(20, None).unwrap();
        assert_eq!(store.block_count(), 3);

        store.release(b);
        assert_eq!(store.block_count(), 2);

        store.release(a);
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn test_release_interior_slot_is_reused() {
        let (mut store, _dir) = fresh();

        let a = store.allocate(20, None).unwrap();
        let _b = store.allocate(20, None).unwrap();
        store.release(a);
        assert_eq!(store.block_count(), 3);

        let c = store.allocate(20, None).unwrap();
        assert_eq!(c, a);
        assert_eq!(store.block_count(), 3);
    }

    #[test]
    fn test_get_block_unallocated_is_none() {
        let (mut store, _dir) = fresh();
        assert!(store.get_block(BlockNumber(99)).unwrap().is_none());
    }

    #[test]
    fn test_block_write_back() {
        let (mut store, _dir) = fresh();

        let b = store.allocate(32, None).unwrap();
        let mut block = store.get_block(b).unwrap().unwrap();
        block.write(&[0xAB; 8]).unwrap();
        store.write_block(&mut block).unwrap();
        assert!(!block.is_dirty());

        let mut again = store.get_block(b).unwrap().unwrap();
        assert_eq!(again.read(8).unwrap(), &[0xAB; 8]);
    }
}
