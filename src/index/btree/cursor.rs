use crate::error::{Result, TarnError};
use crate::index::Entry;
use crate::pager::{PageHandle, PageReadGuard, INVALID_PAGE_NUM};

use super::{node, BTreeIndex};

/// Position within a leaf. The read guard precedes the handle so the
/// latch releases before the pin when the position is replaced or
/// dropped.
struct LeafPos {
    guard: PageReadGuard,
    handle: PageHandle,
}

/// A location in the table. The cursor holds the read latch on exactly
/// one leaf page; stepping past the end of a leaf acquires the right
/// sibling's latch before releasing the current one. A cursor that steps
/// past the rightmost leaf is exhausted.
pub struct BTreeCursor<'t> {
    tree: &'t BTreeIndex,
    pos: Option<LeafPos>,
    cellnum: usize,
}

impl<'t> BTreeCursor<'t> {
    pub(crate) fn at(
        tree: &'t BTreeIndex,
        guard: PageReadGuard,
        handle: PageHandle,
        cellnum: usize,
    ) -> Self {
        Self {
            tree,
            pos: Some(LeafPos { guard, handle }),
            cellnum,
        }
    }

    /// True once the cursor has stepped past the rightmost leaf.
    pub fn is_exhausted(&self) -> bool {
        self.pos.is_none()
    }

    /// True when the cursor points past the last cell of its current
    /// leaf, e.g. on an empty table or at a missing key's insertion
    /// position.
    pub fn is_end(&self) -> bool {
        match &self.pos {
            Some(pos) => self.cellnum >= node::num_keys(&pos.guard[..]),
            None => true,
        }
    }

    /// The entry the cursor points at.
    pub fn entry(&self) -> Result<Entry> {
        let Some(pos) = &self.pos else {
            return Err(TarnError::NotFound("cursor entry"));
        };
        if self.cellnum >= node::num_keys(&pos.guard[..]) {
            return Err(TarnError::NotFound("cursor entry"));
        }
        Ok(Entry {
            key: node::leaf_key(&pos.guard[..], self.cellnum),
            value: node::leaf_value(&pos.guard[..], self.cellnum),
        })
    }

    /// Advances by one entry, hopping to the right sibling at the end of
    /// a leaf and skipping empty leaves. Returns true once the table is
    /// exhausted.
    pub fn step_forward(&mut self) -> bool {
        loop {
            let Some(pos) = &self.pos else {
                return true;
            };
            let n = node::num_keys(&pos.guard[..]);
            if self.cellnum + 1 < n {
                self.cellnum += 1;
                return false;
            }
            let next = node::right_sibling(&pos.guard[..]);
            if next == INVALID_PAGE_NUM {
                self.pos = None;
                self.cellnum = 0;
                return true;
            }
            let Ok(handle) = self.tree.node_page(next) else {
                self.pos = None;
                self.cellnum = 0;
                return true;
            };
            // Latch the sibling before the assignment drops the current
            // leaf's guard.
            let guard = handle.read();
            let sibling_keys = node::num_keys(&guard[..]);
            self.pos = Some(LeafPos { guard, handle });
            self.cellnum = 0;
            if sibling_keys > 0 {
                return false;
            }
        }
    }
}
