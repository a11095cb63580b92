//! In-order traversal.
//!
//! [`Records`] is a pull iterator over the whole tree, maintaining an
//! explicit stack of `(node, position)` frames instead of recursion. Each
//! node is parsed once when its frame is pushed; descent is lazy, so only
//! the current root-to-leaf spine is held in memory. Traversal restarts
//! only from the root - there is no persisted cursor.

use crate::common::{BlockNumber, Result};
use crate::record::Record;
use crate::tree::Tree;

/// One partially-consumed node on the traversal stack.
struct Frame {
    records: Vec<Record>,
    /// Child pointers; empty for a leaf, `records.len() + 1` entries for an
    /// internal node (the trailing one is the rightmost child).
    children: Vec<u32>,
    idx: usize,
    child_visited: bool,
}

enum Step {
    Yield(Record),
    Descend(u32),
    Pop,
}

/// Iterator yielding every record exactly once in ascending key order.
pub struct Records<'a> {
    tree: &'a mut Tree,
    stack: Vec<Frame>,
    failed: bool,
}

impl<'a> Records<'a> {
    pub(crate) fn new(tree: &'a mut Tree) -> Result<Self> {
        let root = tree.root_node();
        let mut it = Self {
            tree,
            stack: Vec::new(),
            failed: false,
        };
        it.push_node(root)?;
        Ok(it)
    }

    fn push_node(&mut self, node: BlockNumber) -> Result<()> {
        let mut block = self.tree.fetch(node)?;
        let next = block.read_u32()?;
        let count = block.read_u32()?;

        let mut records = Vec::with_capacity(count as usize);
        let mut children = Vec::new();
        for _ in 0..count {
            if next != 0 {
                children.push(block.read_u32()?);
            }
            records.push(Record::read(&mut block)?);
        }
        if next != 0 {
            children.push(next);
        }
        self.stack.push(Frame {
            records,
            children,
            idx: 0,
            child_visited: false,
        });
        Ok(())
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let step = {
                let frame = self.stack.last_mut()?;
                if frame.children.is_empty() {
                    if frame.idx < frame.records.len() {
                        let rec = frame.records[frame.idx].clone();
                        frame.idx += 1;
                        Step::Yield(rec)
                    } else {
                        Step::Pop
                    }
                } else if !frame.child_visited {
                    frame.child_visited = true;
                    Step::Descend(frame.children[frame.idx])
                } else if frame.idx < frame.records.len() {
                    let rec = frame.records[frame.idx].clone();
                    frame.idx += 1;
                    frame.child_visited = false;
                    Step::Yield(rec)
                } else {
                    Step::Pop
                }
            };
            match step {
                Step::Yield(rec) => return Some(Ok(rec)),
                Step::Pop => {
                    self.stack.pop();
                }
                Step::Descend(child) => {
                    if let Err(e) = self.push_node(BlockNumber(child)) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}
