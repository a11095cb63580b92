//! The directory tree - an ordered, duplicate-free sequence of records
//! kept across fixed-size node pages.
//!
//! # Node layout (big-endian)
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     next: 0 for a leaf, else the rightmost child
//! 4       4     count
//! 8       ...   leaf:     count records
//!               internal: count (child pointer, record) pairs
//! ```
//!
//! An internal node's records separate its children: the pointer before a
//! record leads to keys strictly below it, `next` to keys above the last.
//! Records are compared by `(folded name, structure id)`; an insert with an
//! existing key replaces the payload.
//!
//! Nodes are referenced purely by logical block number, never by in-memory
//! links; the path from the root is passed explicitly wherever an ancestor
//! chain is needed.

mod iter;

pub use iter::Records;

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::common::config::{DEFAULT_PAGE_SIZE, MIN_WIDTH, SUPERBLOCK_SIZE, TREE_TOC_NAME};
use crate::common::{BlockNumber, Error, Result};
use crate::record::{compare_names, FourCC, Record};
use crate::storage::{Block, Store};

/// All entries of one or more sibling nodes, flattened for redistribution.
///
/// `pointers` holds one child per entry plus the trailing child when the
/// nodes are internal; `before[i]` is the serialized size of everything
/// preceding entry `i`, so `before[count]` is the grand total.
struct Extracted {
    entries: Vec<Record>,
    pointers: Vec<u32>,
    before: Vec<usize>,
    internal: bool,
}

/// An open directory tree over a [`Store`].
///
/// The tree owns the store for the life of the session; [`close`](Tree::close)
/// flushes both. Counters (record count, node count, height) live in a
/// 20-byte superblock registered in the store's TOC.
pub struct Tree {
    store: Store,
    superblock: BlockNumber,
    root: BlockNumber,
    levels: u32,
    records: u32,
    nodes: u32,
    page_size: u32,
    dirty: bool,
}

impl Tree {
    /// Open the directory tree of a container, creating an empty one if the
    /// container has none.
    pub fn open(store: Store) -> Result<Tree> {
        Self::open_with_page_size(store, DEFAULT_PAGE_SIZE)
    }

    /// Like [`open`](Tree::open), with an explicit node page size used only
    /// when the tree does not exist yet.
    ///
    /// # Errors
    /// `Format` if an existing superblock is malformed, or if `page_size`
    /// is not a power of two of at least 32 bytes.
    pub fn open_with_page_size(mut store: Store, page_size: u32) -> Result<Tree> {
        if let Some(superblock) = store.toc_get(TREE_TOC_NAME) {
            let mut block = store
                .get_block(superblock)?
                .ok_or_else(|| Error::Format("dangling tree superblock".into()))?;
            let root = block.read_u32()?;
            let levels = block.read_u32()?;
            let records = block.read_u32()?;
            let nodes = block.read_u32()?;
            let stored_page = block.read_u32()?;
            if !stored_page.is_power_of_two() || stored_page < (1 << MIN_WIDTH) {
                return Err(Error::Format("bad tree page size".into()));
            }
            debug!(root, levels, records, nodes, page_size = stored_page, "opened tree");
            Ok(Tree {
                store,
                superblock,
                root: BlockNumber(root),
                levels,
                records,
                nodes,
                page_size: stored_page,
                dirty: false,
            })
        } else {
            if !page_size.is_power_of_two() || page_size < (1 << MIN_WIDTH) {
                return Err(Error::Format(
                    "page size must be a power of two of at least 32".into(),
                ));
            }
            let superblock = store.allocate(SUPERBLOCK_SIZE, None)?;
            let root = store.allocate(page_size, None)?;
            let mut block = store
                .get_block(root)?
                .ok_or_else(|| Error::Format("fresh root node vanished".into()))?;
            block.write_u32(0)?;
            block.write_u32(0)?;
            block.zero_fill();
            store.write_block(&mut block)?;
            store.toc_set(TREE_TOC_NAME, superblock);

            let mut tree = Tree {
                store,
                superblock,
                root,
                levels: 0,
                records: 0,
                nodes: 1,
                page_size,
                dirty: true,
            };
            tree.flush()?;
            debug!(page_size, "created tree");
            Ok(tree)
        }
    }

    /// Number of records in the tree.
    pub fn len(&self) -> u32 {
        self.records
    }

    /// Whether the tree holds no records.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Number of node pages.
    pub fn node_count(&self) -> u32 {
        self.nodes
    }

    /// Tree height: 0 for a single leaf root.
    pub fn height(&self) -> u32 {
        self.levels
    }

    /// Node page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// The underlying container, for introspection.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Persist the superblock and the container state.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            let mut block = self.fetch(self.superblock)?;
            block.write_u32(self.root.0)?;
            block.write_u32(self.levels)?;
            block.write_u32(self.records)?;
            block.write_u32(self.nodes)?;
            block.write_u32(self.page_size)?;
            block.zero_fill();
            self.store.write_block(&mut block)?;
            self.dirty = false;
        }
        self.store.flush()
    }

    /// Flush and end the session.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.store.close()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the first record matching a name and optional structure id.
    pub fn get(&mut self, name: &str, id: Option<FourCC>) -> Result<Option<Record>> {
        let mut node = self.root;
        let mut candidate = None;
        loop {
            let mut block = self.fetch(node)?;
            let next = block.read_u32()?;
            let count = block.read_u32()?;

            if next == 0 {
                for _ in 0..count {
                    let rec = Record::read(&mut block)?;
                    if rec.matches(name, id) {
                        return Ok(Some(rec));
                    }
                }
                return Ok(candidate);
            }

            let mut descend = BlockNumber(next);
            for _ in 0..count {
                let ptr = block.read_u32()?;
                let rec = Record::read(&mut block)?;
                match compare_names(name, rec.name()) {
                    Ordering::Less => {
                        descend = BlockNumber(ptr);
                        break;
                    }
                    Ordering::Equal => match id {
                        None => {
                            // A smaller-id match may hide in the left
                            // subtree; remember this one as fallback.
                            candidate = Some(rec);
                            descend = BlockNumber(ptr);
                            break;
                        }
                        Some(want) => {
                            if want == rec.id() {
                                return Ok(Some(rec));
                            }
                            if want < rec.id() {
                                descend = BlockNumber(ptr);
                                break;
                            }
                        }
                    },
                    Ordering::Greater => {}
                }
            }
            node = descend;
        }
    }

    /// Iterate all records in ascending key order.
    pub fn iter(&mut self) -> Result<Records<'_>> {
        Records::new(self)
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Insert a record, replacing any record with an equal key.
    pub fn insert(&mut self, record: Record) -> Result<()> {
        let mut path: Vec<BlockNumber> = Vec::new();
        let mut node = self.root;
        loop {
            let mut block = self.fetch(node)?;
            let next = block.read_u32()?;
            let count = block.read_u32()?;

            if next == 0 {
                drop(block);
                return self.insert_leaf(&path, node, &record);
            }

            let mut descend = BlockNumber(next);
            let mut replace_here = false;
            for _ in 0..count {
                let ptr = block.read_u32()?;
                let rec = Record::read(&mut block)?;
                match record.key_cmp(&rec) {
                    Ordering::Less => {
                        descend = BlockNumber(ptr);
                        break;
                    }
                    Ordering::Equal => {
                        replace_here = true;
                        break;
                    }
                    Ordering::Greater => {}
                }
            }
            if replace_here {
                drop(block);
                return self.insert_inner(&path, node, &record, 0);
            }
            path.push(node);
            node = descend;
        }
    }

    /// Insert into a leaf, splitting when the record does not fit.
    fn insert_leaf(&mut self, path: &[BlockNumber], node: BlockNumber, entry: &Record) -> Result<()> {
        let mut block = self.fetch(node)?;
        let next = block.read_u32()?;
        let mut count = block.read_u32()?;

        let mut insert_pos = None;
        let mut n = 0;
        while n < count {
            let pos = block.pos();
            let rec = Record::read(&mut block)?;
            match entry.key_cmp(&rec) {
                Ordering::Equal => {
                    // Replace semantics: drop the old record first.
                    block.seek(pos)?;
                    block.delete(rec.byte_len())?;
                    count -= 1;
                    self.records -= 1;
                    if insert_pos.is_none() {
                        insert_pos = Some(pos);
                    }
                }
                Ordering::Less => {
                    if insert_pos.is_none() {
                        insert_pos = Some(pos);
                    }
                    n += 1;
                }
                Ordering::Greater => n += 1,
            }
        }
        let used = block.pos();
        let insert_pos = insert_pos.unwrap_or(used);
        let remaining = self.page_size as usize - used;

        if remaining < entry.byte_len() {
            // A replace may have dropped the old record above; make the
            // header current before the split re-reads the node.
            block.seek(0)?;
            block.write_u32(next)?;
            block.write_u32(count)?;
            self.store.write_block(&mut block)?;
            drop(block);
            let (pivot, new_right) = self.split(node, entry, 0)?;
            match path.split_last() {
                Some((&parent, rest)) => self.insert_inner(rest, parent, &pivot, new_right.0),
                None => self.new_root(node, &pivot, new_right),
            }
        } else {
            block.seek(insert_pos)?;
            entry.insert_into(&mut block);
            block.seek(0)?;
            block.write_u32(next)?;
            block.write_u32(count + 1)?;
            self.store.write_block(&mut block)?;
            self.records += 1;
            self.dirty = true;
            Ok(())
        }
    }

    /// Insert into an internal node, with `right_ptr` becoming the child to
    /// the right of `entry`. Also the replace path for internal nodes: an
    /// equal record is removed (keeping its pointers) before reinsertion.
    fn insert_inner(
        &mut self,
        path: &[BlockNumber],
        node: BlockNumber,
        entry: &Record,
        right_ptr: u32,
    ) -> Result<()> {
        let mut block = self.fetch(node)?;
        let mut next = block.read_u32()?;
        let mut count = block.read_u32()?;
        let mut right_ptr = right_ptr;

        let mut insert_at: Option<(usize, u32)> = None;
        let mut n = 0;
        while n < count {
            let pos = block.pos();
            let ptr = block.read_u32()?;
            let rec = Record::read(&mut block)?;
            match entry.key_cmp(&rec) {
                Ordering::Equal => {
                    // Remove the record plus the pointer to its right; the
                    // displaced pointer rides along with the reinsertion.
                    if n == count - 1 {
                        right_ptr = next;
                        next = ptr;
                        block.seek(pos)?;
                    } else {
                        right_ptr = block.read_u32()?;
                        block.seek(pos + 4)?;
                    }
                    block.delete(rec.byte_len() + 4)?;
                    block.seek(pos)?;
                    count -= 1;
                    self.records -= 1;
                    if insert_at.is_none() {
                        insert_at = Some((pos, n));
                    }
                }
                Ordering::Less => {
                    if insert_at.is_none() {
                        insert_at = Some((pos, n));
                    }
                    n += 1;
                }
                Ordering::Greater => n += 1,
            }
        }
        let used = block.pos();
        let (insert_pos, insert_ndx) = insert_at.unwrap_or((used, count));
        let remaining = self.page_size as usize - used;

        if remaining < entry.byte_len() + 4 {
            // As in the leaf path, persist any replace-delete (and the
            // possibly swapped `next`) before the split re-reads the node.
            block.seek(0)?;
            block.write_u32(next)?;
            block.write_u32(count)?;
            self.store.write_block(&mut block)?;
            drop(block);
            let (pivot, new_right) = self.split(node, entry, right_ptr)?;
            match path.split_last() {
                Some((&parent, rest)) => self.insert_inner(rest, parent, &pivot, new_right.0),
                None => self.new_root(node, &pivot, new_right),
            }
        } else {
            if insert_ndx == count {
                // Append: the old rightmost child becomes the entry's left
                // child and `right_ptr` the new rightmost.
                block.seek(insert_pos)?;
                block.write_u32(next)?;
                entry.write(&mut block)?;
                next = right_ptr;
            } else {
                block.seek(insert_pos + 4)?;
                entry.insert_into(&mut block);
                block.insert(&right_ptr.to_be_bytes());
            }
            block.seek(0)?;
            block.write_u32(next)?;
            block.write_u32(count + 1)?;
            self.store.write_block(&mut block)?;
            self.records += 1;
            self.dirty = true;
            Ok(())
        }
    }

    /// Split one overfull node into two, returning the pivot record and the
    /// new right-hand node. The caller pushes the pivot into the parent.
    fn split(
        &mut self,
        node: BlockNumber,
        entry: &Record,
        right_ptr: u32,
    ) -> Result<(Record, BlockNumber)> {
        let new_right = self.store.allocate(self.page_size, None)?;
        let mut block = self.fetch(node)?;
        let mut right_block = self.fetch(new_right)?;

        let next = block.read_u32()?;
        let count = block.read_u32()?;
        let internal = next != 0;
        let entry_size = entry.byte_len() + if internal { 4 } else { 0 };

        let mut entries = Vec::with_capacity(count as usize + 1);
        let mut pointers = Vec::new();
        let mut before = Vec::with_capacity(count as usize + 2);
        let mut total = 0;
        let mut inserted = false;
        for _ in 0..count {
            let pos = block.pos();
            if internal {
                pointers.push(block.read_u32()?);
            }
            let rec = Record::read(&mut block)?;
            if !inserted && entry.key_cmp(&rec) == Ordering::Less {
                entries.push(entry.clone());
                if internal {
                    pointers.push(right_ptr);
                }
                before.push(total);
                total += entry_size;
                inserted = true;
            }
            entries.push(rec);
            before.push(total);
            total += block.pos() - pos;
        }
        if internal {
            pointers.push(next);
        }
        if !inserted {
            entries.push(entry.clone());
            if internal {
                pointers.push(right_ptr);
            }
            before.push(total);
            total += entry_size;
        }
        before.push(total);

        let ex = Extracted {
            entries,
            pointers,
            before,
            internal,
        };
        let page = self.page_size as usize;
        let Some(best) = split2_plan(&ex, page) else {
            return Err(Error::Overflow {
                len: entry.byte_len(),
                size: page,
            });
        };
        if best == ex.entries.len() {
            // The caller only splits when the entry did not fit.
            return Err(Error::Overflow {
                len: entry.byte_len(),
                size: page,
            });
        }

        write_node_range(&mut block, &ex, 0, best)?;
        write_node_range(&mut right_block, &ex, best + 1, ex.entries.len())?;
        self.store.write_block(&mut block)?;
        self.store.write_block(&mut right_block)?;

        self.nodes += 1;
        self.dirty = true;
        trace!(node = node.0, new_right = new_right.0, "split");
        Ok((ex.entries[best].clone(), new_right))
    }

    /// Allocate a new root holding one pivot and two children.
    fn new_root(&mut self, left: BlockNumber, pivot: &Record, right: BlockNumber) -> Result<()> {
        let new_root = self.store.allocate(self.page_size, None)?;
        let mut block = self.fetch(new_root)?;
        block.write_u32(right.0)?;
        block.write_u32(1)?;
        block.write_u32(left.0)?;
        pivot.write(&mut block)?;
        block.zero_fill();
        self.store.write_block(&mut block)?;

        self.root = new_root;
        self.levels += 1;
        self.nodes += 1;
        self.records += 1;
        self.dirty = true;
        trace!(root = new_root.0, levels = self.levels, "new root");
        Ok(())
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Delete every record whose name compares equal to `name`; with an id
    /// filter, only records carrying that structure id. Returns whether
    /// anything was removed.
    pub fn delete(&mut self, name: &str, id: Option<FourCC>) -> Result<bool> {
        let mut any = false;
        while self.delete_one(name, id)? {
            any = true;
        }
        Ok(any)
    }

    /// Locate and remove one batch of matching records; `true` if found.
    fn delete_one(&mut self, name: &str, id: Option<FourCC>) -> Result<bool> {
        let mut path: Vec<BlockNumber> = Vec::new();
        let mut node = self.root;
        loop {
            let mut block = self.fetch(node)?;
            let next = block.read_u32()?;
            let count = block.read_u32()?;

            if next == 0 {
                drop(block);
                let (found, underflow) = self.delete_leaf(node, name, id)?;
                if found && underflow && !path.is_empty() {
                    self.rebalance(&path, node)?;
                }
                return Ok(found);
            }

            let mut descend = BlockNumber(next);
            let mut found_here = false;
            for _ in 0..count {
                let ptr = block.read_u32()?;
                let rec = Record::read(&mut block)?;
                match compare_names(name, rec.name()) {
                    Ordering::Less => {
                        descend = BlockNumber(ptr);
                        break;
                    }
                    Ordering::Equal => {
                        if rec.matches(name, id) {
                            found_here = true;
                            break;
                        }
                        if let Some(want) = id {
                            if want < rec.id() {
                                descend = BlockNumber(ptr);
                                break;
                            }
                        }
                    }
                    Ordering::Greater => {}
                }
            }
            if found_here {
                drop(block);
                self.delete_inner(&path, node, name, id)?;
                return Ok(true);
            }
            path.push(node);
            node = descend;
        }
    }

    /// Remove all matching records from a leaf. Returns (found, underflow).
    fn delete_leaf(
        &mut self,
        node: BlockNumber,
        name: &str,
        id: Option<FourCC>,
    ) -> Result<(bool, bool)> {
        let mut block = self.fetch(node)?;
        let next = block.read_u32()?;
        let mut count = block.read_u32()?;

        let mut found = false;
        let mut n = 0;
        while n < count {
            let pos = block.pos();
            let rec = Record::read(&mut block)?;
            if rec.matches(name, id) {
                block.seek(pos)?;
                block.delete(rec.byte_len())?;
                count -= 1;
                self.records -= 1;
                found = true;
            } else {
                n += 1;
            }
        }
        if !found {
            return Ok((false, false));
        }
        let used = block.pos();
        block.seek(0)?;
        block.write_u32(next)?;
        block.write_u32(count)?;
        self.store.write_block(&mut block)?;
        self.dirty = true;
        Ok((true, used < self.min_usage()))
    }

    /// Remove one matching record from an internal node, promoting its
    /// in-order predecessor (the largest record of the left subtree) into
    /// the vacated separator position.
    fn delete_inner(
        &mut self,
        path: &[BlockNumber],
        node: BlockNumber,
        name: &str,
        id: Option<FourCC>,
    ) -> Result<()> {
        let mut block = self.fetch(node)?;
        let mut next = block.read_u32()?;
        let mut count = block.read_u32()?;

        let mut target = None;
        let mut n = 0;
        while n < count {
            let pos = block.pos();
            let ptr = block.read_u32()?;
            let rec = Record::read(&mut block)?;
            if rec.matches(name, id) {
                target = Some((pos, ptr, rec, n));
                break;
            }
            n += 1;
        }
        let Some((pos, left_child, rec, n)) = target else {
            return Err(Error::Format("inner delete target vanished".into()));
        };

        let right_ptr;
        if n == count - 1 {
            right_ptr = next;
            next = left_child;
            block.seek(pos)?;
        } else {
            right_ptr = block.read_u32()?;
            block.seek(pos + 4)?;
        }
        block.delete(rec.byte_len() + 4)?;
        count -= 1;
        block.seek(0)?;
        block.write_u32(next)?;
        block.write_u32(count)?;
        self.store.write_block(&mut block)?;
        self.records -= 1;
        self.dirty = true;

        // Walk to the rightmost leaf of the left subtree.
        let mut leaf = BlockNumber(left_child);
        loop {
            let mut b = self.fetch(leaf)?;
            let nn = b.read_u32()?;
            if nn == 0 {
                break;
            }
            leaf = BlockNumber(nn);
        }
        let (pred, leaf_underflow) = self.remove_last_record(leaf)?;
        self.insert_inner(path, node, &pred, right_ptr)?;

        if leaf_underflow {
            // The promotion may have restructured ancestors, so recompute
            // the leaf's path before rebalancing.
            let (found_leaf, leaf_path) = self.descend_toward(&pred)?;
            if found_leaf == leaf && !leaf_path.is_empty() {
                self.rebalance(&leaf_path, leaf)?;
            }
        }
        Ok(())
    }

    /// Remove and return the last (largest) record of a leaf.
    fn remove_last_record(&mut self, leaf: BlockNumber) -> Result<(Record, bool)> {
        let mut block = self.fetch(leaf)?;
        let next = block.read_u32()?;
        let count = block.read_u32()?;
        if count == 0 {
            return Err(Error::Format("empty leaf during inner delete".into()));
        }
        let mut last = None;
        for _ in 0..count {
            let pos = block.pos();
            let rec = Record::read(&mut block)?;
            last = Some((pos, rec));
        }
        let (pos, rec) = last.expect("count is nonzero");
        block.seek(pos)?;
        block.delete(rec.byte_len())?;
        block.seek(0)?;
        block.write_u32(next)?;
        block.write_u32(count - 1)?;
        self.store.write_block(&mut block)?;
        self.records -= 1;
        self.dirty = true;
        Ok((rec, pos < self.min_usage()))
    }

    /// Descend to the leaf that would precede `key`, collecting the path.
    ///
    /// At an equal separator the left child is taken, so for a key sitting
    /// in an internal node this lands on the rightmost leaf of its left
    /// subtree.
    fn descend_toward(&mut self, key: &Record) -> Result<(BlockNumber, Vec<BlockNumber>)> {
        let mut path = Vec::new();
        let mut node = self.root;
        loop {
            let mut block = self.fetch(node)?;
            let next = block.read_u32()?;
            let count = block.read_u32()?;
            if next == 0 {
                return Ok((node, path));
            }
            let mut descend = BlockNumber(next);
            for _ in 0..count {
                let ptr = block.read_u32()?;
                let rec = Record::read(&mut block)?;
                if key.key_cmp(&rec) != Ordering::Greater {
                    descend = BlockNumber(ptr);
                    break;
                }
            }
            path.push(node);
            node = descend;
        }
    }

    // ========================================================================
    // Rebalance
    // ========================================================================

    /// Redistribute an under-occupied node with its siblings.
    ///
    /// With two siblings, a 2-way redistribution (collapsing three nodes
    /// into two) is tried first, falling back to a 3-way rebalance; with a
    /// single sibling, a plain 2-way redistribution. Pivots removed from the
    /// parent are reinserted as the new separators, and the parent is itself
    /// rebalanced if it drops under the occupancy threshold. A root left
    /// childless hands the tree to its surviving child.
    fn rebalance(&mut self, path: &[BlockNumber], node: BlockNumber) -> Result<()> {
        let Some((&parent_num, parent_path)) = path.split_last() else {
            return Ok(()); // the root is exempt
        };

        let mut parent = self.fetch(parent_num)?;
        let mut parent_next = parent.read_u32()?;
        let mut parent_count = parent.read_u32()?;

        let mut left_node: Option<BlockNumber> = None;
        let mut left_pivot: Option<Record> = None;
        let mut left_pos = 0usize;
        let mut node_pos: Option<usize> = None;
        let mut right_node: Option<BlockNumber> = None;
        let mut right_pivot: Option<Record> = None;
        let mut right_pos = 0usize;
        let mut right_is_next = false;

        let mut prev_ptr: Option<u32> = None;
        let mut prev_rec: Option<Record> = None;
        let mut prev_pos = 0usize;
        for _ in 0..parent_count {
            let pos = parent.pos();
            let ptr = parent.read_u32()?;
            let rec = Record::read(&mut parent)?;
            if ptr == node.0 {
                node_pos = Some(pos);
                right_pivot = Some(rec.clone());
                left_node = prev_ptr.map(BlockNumber);
                left_pivot = prev_rec.clone();
                left_pos = prev_pos;
            } else if prev_ptr == Some(node.0) {
                right_node = Some(BlockNumber(ptr));
                right_pos = pos;
                break;
            }
            prev_ptr = Some(ptr);
            prev_rec = Some(rec);
            prev_pos = pos;
        }
        if parent_next == node.0 {
            node_pos = Some(parent.pos());
            left_node = prev_ptr.map(BlockNumber);
            left_pivot = prev_rec;
            left_pos = prev_pos;
        } else if node_pos.is_some() && right_node.is_none() {
            right_node = Some(BlockNumber(parent_next));
            right_pos = parent.pos();
            right_is_next = true;
        }
        let Some(node_pos) = node_pos else {
            // A reinsertion higher up may have restructured the ancestor
            // chain since this path was recorded; an under-occupied node is
            // still a valid one, so leave it for a later pass.
            trace!(node = node.0, parent = parent_num.0, "stale rebalance path");
            return Ok(());
        };

        let page = self.page_size as usize;
        // (pivot, pointer to its right) pairs going back into the parent
        let mut reinsert: Vec<(Record, u32)> = Vec::new();

        match (left_node, right_node) {
            (Some(ln), Some(rn)) => {
                let lp = left_pivot.ok_or_else(|| Error::Format("missing left pivot".into()))?;
                let rp = right_pivot.ok_or_else(|| Error::Format("missing right pivot".into()))?;
                let mut blocks = [self.fetch(ln)?, self.fetch(node)?, self.fetch(rn)?];
                let ex = extract(&mut blocks, &[lp, rp])?;
                self.records += 2;

                if let Some(best) = split2_plan(&ex, page) {
                    write_node_range(&mut blocks[0], &ex, 0, best)?;
                    self.store.write_block(&mut blocks[0])?;
                    if best == ex.entries.len() {
                        // Everything fits in the left sibling alone.
                        self.store.release(node);
                        self.store.release(rn);
                        self.nodes -= 2;
                    } else {
                        write_node_range(&mut blocks[1], &ex, best + 1, ex.entries.len())?;
                        self.store.write_block(&mut blocks[1])?;
                        self.store.release(rn);
                        self.nodes -= 1;
                        self.records -= 1;
                        reinsert.push((ex.entries[best].clone(), node.0));
                    }
                } else if let Some((i, j)) = split3_plan(&ex, page) {
                    write_node_range(&mut blocks[0], &ex, 0, i)?;
                    write_node_range(&mut blocks[1], &ex, i + 1, j)?;
                    write_node_range(&mut blocks[2], &ex, j + 1, ex.entries.len())?;
                    self.store.write_block(&mut blocks[0])?;
                    self.store.write_block(&mut blocks[1])?;
                    self.store.write_block(&mut blocks[2])?;
                    self.records -= 2;
                    reinsert.push((ex.entries[i].clone(), node.0));
                    reinsert.push((ex.entries[j].clone(), rn.0));
                } else {
                    trace!(node = node.0, "no feasible redistribution");
                    self.records -= 2;
                    return Ok(());
                }

                // Drop both pivots (and two child pointers) from the parent.
                if right_is_next {
                    parent.seek(left_pos)?;
                    parent.delete(right_pos - left_pos)?;
                    parent_next = ln.0;
                } else {
                    parent.seek(left_pos + 4)?;
                    parent.delete(right_pos - left_pos)?;
                }
                parent_count -= 2;
                self.records -= 2;
            }
            (Some(ln), None) => {
                let lp = left_pivot.ok_or_else(|| Error::Format("missing left pivot".into()))?;
                let mut blocks = [self.fetch(ln)?, self.fetch(node)?];
                let ex = extract(&mut blocks, &[lp])?;
                self.records += 1;

                let Some(best) = split2_plan(&ex, page) else {
                    trace!(node = node.0, "no feasible redistribution");
                    self.records -= 1;
                    return Ok(());
                };
                write_node_range(&mut blocks[0], &ex, 0, best)?;
                self.store.write_block(&mut blocks[0])?;
                if best == ex.entries.len() {
                    self.store.release(node);
                    self.nodes -= 1;
                } else {
                    write_node_range(&mut blocks[1], &ex, best + 1, ex.entries.len())?;
                    self.store.write_block(&mut blocks[1])?;
                    self.records -= 1;
                    reinsert.push((ex.entries[best].clone(), node.0));
                }

                let node_is_next = parent_next == node.0;
                if node_is_next {
                    parent.seek(left_pos)?;
                    parent.delete(node_pos - left_pos)?;
                    parent_next = ln.0;
                } else {
                    parent.seek(left_pos + 4)?;
                    parent.delete(node_pos - left_pos)?;
                }
                parent_count -= 1;
                self.records -= 1;
            }
            (None, Some(rn)) => {
                let rp = right_pivot.ok_or_else(|| Error::Format("missing right pivot".into()))?;
                let mut blocks = [self.fetch(node)?, self.fetch(rn)?];
                let ex = extract(&mut blocks, &[rp])?;
                self.records += 1;

                let Some(best) = split2_plan(&ex, page) else {
                    trace!(node = node.0, "no feasible redistribution");
                    self.records -= 1;
                    return Ok(());
                };
                write_node_range(&mut blocks[0], &ex, 0, best)?;
                self.store.write_block(&mut blocks[0])?;
                if best == ex.entries.len() {
                    self.store.release(rn);
                    self.nodes -= 1;
                } else {
                    write_node_range(&mut blocks[1], &ex, best + 1, ex.entries.len())?;
                    self.store.write_block(&mut blocks[1])?;
                    self.records -= 1;
                    reinsert.push((ex.entries[best].clone(), rn.0));
                }

                if right_is_next {
                    parent.seek(node_pos)?;
                    parent.delete(right_pos - node_pos)?;
                    parent_next = node.0;
                } else {
                    parent.seek(node_pos + 4)?;
                    parent.delete(right_pos - node_pos)?;
                }
                parent_count -= 1;
                self.records -= 1;
            }
            (None, None) => {
                return Err(Error::Format("node has no siblings in its parent".into()));
            }
        }

        parent.seek(0)?;
        parent.write_u32(parent_next)?;
        parent.write_u32(parent_count)?;
        self.store.write_block(&mut parent)?;
        drop(parent);
        self.dirty = true;

        for (pivot, right) in reinsert {
            self.insert_inner(parent_path, parent_num, &pivot, right)?;
        }

        let (count_after, used_after) = self.block_usage(parent_num)?;
        if self.root == parent_num {
            if count_after == 0 {
                // Childless root: the surviving child takes over.
                let mut pb = self.fetch(parent_num)?;
                let survivor = pb.read_u32()?;
                drop(pb);
                self.store.release(parent_num);
                self.root = BlockNumber(survivor);
                self.nodes -= 1;
                self.levels -= 1;
                trace!(root = survivor, levels = self.levels, "root collapsed");
            }
        } else if used_after < self.min_usage() {
            self.rebalance(parent_path, parent_num)?;
        }
        Ok(())
    }

    /// Record count and used bytes of a node.
    fn block_usage(&mut self, node: BlockNumber) -> Result<(u32, usize)> {
        let mut block = self.fetch(node)?;
        let next = block.read_u32()?;
        let count = block.read_u32()?;
        for _ in 0..count {
            if next != 0 {
                block.read_u32()?;
            }
            Record::read(&mut block)?;
        }
        Ok((count, block.pos()))
    }

    /// Occupancy threshold below which a node triggers rebalancing.
    fn min_usage(&self) -> usize {
        (self.page_size / 2) as usize
    }

    pub(crate) fn fetch(&mut self, node: BlockNumber) -> Result<Block> {
        self.store
            .get_block(node)?
            .ok_or_else(|| Error::Format(format!("missing tree node {}", node)))
    }

    pub(crate) fn root_node(&self) -> BlockNumber {
        self.root
    }
}

/// Read every entry (and child pointer) out of sibling blocks, separated by
/// the given parent pivots, with a running prefix-size table.
fn extract(blocks: &mut [Block], pivots: &[Record]) -> Result<Extracted> {
    let mut entries = Vec::new();
    let mut pointers = Vec::new();
    let mut before = Vec::new();
    let mut total = 0usize;
    let mut internal = false;

    for (i, block) in blocks.iter_mut().enumerate() {
        block.seek(0)?;
        let next = block.read_u32()?;
        let count = block.read_u32()?;
        if next != 0 {
            internal = true;
        }
        for _ in 0..count {
            let pos = block.pos();
            if next != 0 {
                pointers.push(block.read_u32()?);
            }
            let rec = Record::read(block)?;
            entries.push(rec);
            before.push(total);
            total += block.pos() - pos;
        }
        if next != 0 {
            pointers.push(next);
        }
        if let Some(pivot) = pivots.get(i) {
            entries.push(pivot.clone());
            before.push(total);
            total += pivot.byte_len() + if next != 0 { 4 } else { 0 };
        }
    }
    before.push(total);

    Ok(Extracted {
        entries,
        pointers,
        before,
        internal,
    })
}

/// Pick the split index minimizing the size difference of the two resulting
/// pages. Returns `entries.len()` when everything fits in a single page,
/// `None` when no feasible split exists.
fn split2_plan(ex: &Extracted, page: usize) -> Option<usize> {
    let count = ex.entries.len();
    let total = ex.before[count];
    if 8 + total <= page {
        return Some(count);
    }
    let mut best = None;
    let mut best_diff = 0usize;
    for i in 0..count {
        let left = 8 + ex.before[i];
        let right = 8 + total - ex.before[i + 1];
        if left > page {
            break;
        }
        if right > page {
            continue;
        }
        let diff = left.abs_diff(right);
        if best.is_none() || diff < best_diff {
            best = Some(i);
            best_diff = diff;
        }
    }
    best
}

/// Pick two split indices for a 3-way rebalance, minimizing the product of
/// pairwise page-size differences so all three pages stay balanced.
fn split3_plan(ex: &Extracted, page: usize) -> Option<(usize, usize)> {
    let count = ex.entries.len();
    let total = ex.before[count];
    let mut best = None;
    let mut best_diff = 0usize;
    for i in 1..count.saturating_sub(3) {
        let left = 8 + ex.before[i];
        let remaining = 16 + total - ex.before[i + 1];
        if left > page {
            break;
        }
        if remaining > 2 * page {
            continue;
        }
        for j in (i + 2)..(count - 1) {
            let mid = 8 + ex.before[j] - ex.before[i + 1];
            let right = 8 + total - ex.before[j + 1];
            if mid > page {
                break;
            }
            if right > page {
                continue;
            }
            let diff = left.abs_diff(mid) * right.abs_diff(mid);
            if best.is_none() || diff < best_diff {
                best = Some((i, j));
                best_diff = diff;
            }
        }
    }
    best
}

/// Serialize `entries[start..end]` (and their pointers) into a node block.
fn write_node_range(block: &mut Block, ex: &Extracted, start: usize, end: usize) -> Result<()> {
    block.seek(0)?;
    let next = if ex.internal { ex.pointers[end] } else { 0 };
    block.write_u32(next)?;
    block.write_u32((end - start) as u32)?;
    for k in start..end {
        if ex.internal {
            block.write_u32(ex.pointers[k])?;
        }
        ex.entries[k].write(block)?;
    }
    block.zero_fill();
    Ok(())
}
