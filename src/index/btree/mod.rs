use std::path::Path;

use smallvec::SmallVec;

use crate::error::{Result, TarnError};
use crate::index::{read_meta, write_meta, Entry, Index, IndexKind, MetaPayload};
use crate::pager::{PageHandle, PageNum, PageReadGuard, PageWriteGuard, Pager};

pub(crate) mod node;

mod cursor;

pub use cursor::BTreeCursor;

use node::NodeKind;

/// Write-latched pages retained during a mutating descent, root first.
/// Guards precede handles in each element so the latch drops before the
/// pin.
type LatchPath = SmallVec<[(PageWriteGuard, PageHandle); 4]>;

/// Ordered `i64 -> i64` map stored as a B+-tree over the pager.
///
/// The root page number is fixed at creation: splitting a full root copies
/// its contents into a fresh child and turns the root into an internal
/// node above it, so descents never race a moving root.
pub struct BTreeIndex {
    name: String,
    pager: Pager,
    root_pn: PageNum,
}

impl BTreeIndex {
    pub fn create(base: &Path, name: &str, cache_frames: usize) -> Result<Self> {
        let path = base.join(name);
        let pager = Pager::create(&path, cache_frames)?;
        {
            let root = pager.new_page()?;
            let mut guard = root.write();
            node::init_leaf(&mut guard[..]);
        }
        let index = Self {
            name: name.to_string(),
            pager,
            root_pn: 0,
        };
        index.flush()?;
        Ok(index)
    }

    pub fn open(base: &Path, name: &str, cache_frames: usize) -> Result<Self> {
        let path = base.join(name);
        let (page_count, payload) = read_meta(&path)?;
        let MetaPayload::BTree { root } = payload else {
            return Err(TarnError::Corrupt(format!(
                "table {name} is not a b+tree"
            )));
        };
        let pager = Pager::open(&path, cache_frames)?;
        if page_count > pager.page_count() {
            return Err(TarnError::Corrupt(format!(
                "meta page count exceeds data file for table {name}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            pager,
            root_pn: root,
        })
    }

    /// Cursor at the first entry of the table.
    pub fn cursor_start(&self) -> Result<BTreeCursor<'_>> {
        let (guard, handle) = self.descend_to_leaf(|_| 0)?;
        Ok(BTreeCursor::at(self, guard, handle, 0))
    }

    /// Cursor at the last entry of the table; at the insertion position if
    /// the table is empty.
    pub fn cursor_end(&self) -> Result<BTreeCursor<'_>> {
        let (guard, handle) = self.descend_to_leaf(node::num_keys)?;
        let n = node::num_keys(&guard[..]);
        let cellnum = n.saturating_sub(1);
        Ok(BTreeCursor::at(self, guard, handle, cellnum))
    }

    /// Cursor at `key`, or at the position where it would be inserted.
    pub fn cursor_find(&self, key: i64) -> Result<BTreeCursor<'_>> {
        let (guard, handle) = self.descend_to_leaf(|data| node::child_index_for(data, key))?;
        let cellnum = match node::leaf_search(&guard[..], key) {
            Ok(pos) | Err(pos) => pos,
        };
        Ok(BTreeCursor::at(self, guard, handle, cellnum))
    }

    /// Entries with keys in `[lo, hi)`, in key order.
    pub fn scan_range(&self, lo: i64, hi: i64) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut cursor = self.cursor_find(lo)?;
        loop {
            if cursor.is_exhausted() {
                break;
            }
            if cursor.is_end() {
                if cursor.step_forward() {
                    break;
                }
                continue;
            }
            let entry = cursor.entry()?;
            if entry.key >= hi {
                break;
            }
            entries.push(entry);
            if cursor.step_forward() {
                break;
            }
        }
        Ok(entries)
    }

    /// Read-crab descent: the child's read latch is acquired before the
    /// parent's is released.
    fn descend_to_leaf<F>(&self, pick_child: F) -> Result<(PageReadGuard, PageHandle)>
    where
        F: Fn(&[u8]) -> usize,
    {
        let mut handle = self.node_page(self.root_pn)?;
        let mut guard = handle.read();
        loop {
            match node::node_kind(&guard[..])? {
                NodeKind::Leaf => return Ok((guard, handle)),
                NodeKind::Internal => {
                    let index = pick_child(&guard[..]);
                    let child_pn = node::internal_child(&guard[..], index);
                    let child = self.node_page(child_pn)?;
                    let child_guard = child.read();
                    guard = child_guard;
                    handle = child;
                }
            }
        }
    }

    /// Write-latches the leaf covering `key` for an operation that cannot
    /// split. Internal levels are crossed under read latches; the leaf
    /// write latch is taken while its parent is still read-latched, so the
    /// leaf cannot be restructured in between.
    fn latch_leaf_for_write(&self, key: i64) -> Result<(PageWriteGuard, PageHandle)> {
        loop {
            let root = self.node_page(self.root_pn)?;
            let root_guard = root.read();
            match node::node_kind(&root_guard[..])? {
                NodeKind::Leaf => {
                    drop(root_guard);
                    let write_guard = root.write();
                    if node::node_kind(&write_guard[..])? != NodeKind::Leaf {
                        // Lost a race with a root split; start over.
                        drop(write_guard);
                        continue;
                    }
                    return Ok((write_guard, root));
                }
                NodeKind::Internal => {
                    let mut handle = root;
                    let mut guard = root_guard;
                    loop {
                        let index = node::child_index_for(&guard[..], key);
                        let child_pn = node::internal_child(&guard[..], index);
                        let child = self.node_page(child_pn)?;
                        let child_read = child.read();
                        match node::node_kind(&child_read[..])? {
                            NodeKind::Internal => {
                                guard = child_read;
                                handle = child;
                            }
                            NodeKind::Leaf => {
                                drop(child_read);
                                let child_write = child.write();
                                drop(guard);
                                drop(handle);
                                return Ok((child_write, child));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Splitting the root keeps its page number: the old contents move to
    /// a fresh child and the root becomes an internal node with that
    /// single child.
    fn copy_root_down(&self, root_guard: &mut PageWriteGuard) -> Result<()> {
        let child = self.pager.new_page()?;
        {
            let mut child_guard = child.write();
            child_guard.copy_from_slice(&root_guard[..]);
        }
        node::init_internal(&mut root_guard[..]);
        node::set_internal_child(&mut root_guard[..], 0, child.page_num());
        Ok(())
    }

    fn split_leaf_and_insert(&self, path: &mut LatchPath, key: i64, value: i64) -> Result<()> {
        let (mut leaf_guard, _leaf_handle) = path
            .pop()
            .expect("split always starts from a latched leaf");
        let n = node::num_keys(&leaf_guard[..]);
        let keep = n / 2;
        let new_page = self.pager.new_page()?;
        let promoted = {
            let mut new_guard = new_page.write();
            node::init_leaf(&mut new_guard[..]);
            for i in keep..n {
                node::set_leaf_cell(
                    &mut new_guard[..],
                    i - keep,
                    node::leaf_key(&leaf_guard[..], i),
                    node::leaf_value(&leaf_guard[..], i),
                );
            }
            node::set_num_keys(&mut new_guard[..], n - keep);
            node::set_num_keys(&mut leaf_guard[..], keep);
            node::set_right_sibling(&mut new_guard[..], node::right_sibling(&leaf_guard[..]));
            node::set_right_sibling(&mut leaf_guard[..], new_page.page_num());
            let promoted = node::leaf_key(&new_guard[..], 0);
            let target = if key < promoted {
                &mut leaf_guard
            } else {
                &mut new_guard
            };
            match node::leaf_search(&target[..], key) {
                Err(pos) => node::leaf_insert_at(&mut target[..], pos, key, value),
                Ok(_) => {
                    return Err(TarnError::Corrupt(
                        "duplicate key surfaced during leaf split".into(),
                    ))
                }
            }
            promoted
        };
        drop(leaf_guard);
        self.insert_into_parent(path, promoted, new_page.page_num())
    }

    fn insert_into_parent(&self, path: &mut LatchPath, key: i64, right_pn: PageNum) -> Result<()> {
        let (mut parent_guard, _parent_handle) = path
            .pop()
            .expect("split always reaches a latched ancestor");
        let pos = node::child_index_for(&parent_guard[..], key);
        let n = node::num_keys(&parent_guard[..]);
        if n < node::INTERNAL_ORDER {
            node::internal_insert_at(&mut parent_guard[..], pos, key, right_pn);
            return Ok(());
        }
        // Full internal node: insert into scratch arrays, promote the
        // median, and rewrite both halves.
        let mut keys: Vec<i64> = (0..n)
            .map(|i| node::internal_key(&parent_guard[..], i))
            .collect();
        let mut children: Vec<PageNum> = (0..=n)
            .map(|i| node::internal_child(&parent_guard[..], i))
            .collect();
        keys.insert(pos, key);
        children.insert(pos + 1, right_pn);
        let median = keys.len() / 2;
        let promoted = keys[median];

        node::set_num_keys(&mut parent_guard[..], median);
        for (i, k) in keys[..median].iter().enumerate() {
            node::set_internal_key(&mut parent_guard[..], i, *k);
        }
        for (i, c) in children[..=median].iter().enumerate() {
            node::set_internal_child(&mut parent_guard[..], i, *c);
        }

        let new_page = self.pager.new_page()?;
        {
            let mut new_guard = new_page.write();
            node::init_internal(&mut new_guard[..]);
            let right_keys = &keys[median + 1..];
            node::set_num_keys(&mut new_guard[..], right_keys.len());
            for (i, k) in right_keys.iter().enumerate() {
                node::set_internal_key(&mut new_guard[..], i, *k);
            }
            for (i, c) in children[median + 1..].iter().enumerate() {
                node::set_internal_child(&mut new_guard[..], i, *c);
            }
        }
        drop(parent_guard);
        self.insert_into_parent(path, promoted, new_page.page_num())
    }

    pub(crate) fn node_page(&self, page_num: PageNum) -> Result<PageHandle> {
        self.pager.get_page(page_num).map_err(|err| match err {
            TarnError::NotFound(_) => {
                TarnError::Corrupt(format!("b+tree references missing page {page_num}"))
            }
            other => other,
        })
    }

    pub(crate) fn root_pn(&self) -> PageNum {
        self.root_pn
    }
}

impl Index for BTreeIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::BTree
    }

    fn pager(&self) -> &Pager {
        &self.pager
    }

    fn insert(&self, key: i64, value: i64) -> Result<()> {
        let _update = self.pager.update_guard();
        let mut path: LatchPath = SmallVec::new();
        let root = self.node_page(self.root_pn)?;
        let mut root_guard = root.write();
        if node::node_full(&root_guard[..])? {
            self.copy_root_down(&mut root_guard)?;
        }
        path.push((root_guard, root));
        loop {
            let next = {
                let (guard, _) = path.last().expect("descent path is never empty");
                match node::node_kind(&guard[..])? {
                    NodeKind::Leaf => None,
                    NodeKind::Internal => {
                        let index = node::child_index_for(&guard[..], key);
                        Some(node::internal_child(&guard[..], index))
                    }
                }
            };
            let Some(child_pn) = next else { break };
            let child = self.node_page(child_pn)?;
            let child_guard = child.write();
            // An ancestor only stays latched while the child could still
            // split into it.
            if !node::node_full(&child_guard[..])? {
                path.clear();
            }
            path.push((child_guard, child));
        }
        {
            let (leaf_guard, _) = path.last_mut().expect("descent path is never empty");
            match node::leaf_search(&leaf_guard[..], key) {
                Ok(_) => return Err(TarnError::Duplicate(key)),
                Err(pos) => {
                    if node::num_keys(&leaf_guard[..]) < node::LEAF_CAPACITY {
                        node::leaf_insert_at(&mut leaf_guard[..], pos, key, value);
                        return Ok(());
                    }
                }
            }
        }
        self.split_leaf_and_insert(&mut path, key, value)
    }

    fn update(&self, key: i64, value: i64) -> Result<()> {
        let _update = self.pager.update_guard();
        let (mut guard, _handle) = self.latch_leaf_for_write(key)?;
        match node::leaf_search(&guard[..], key) {
            Ok(pos) => {
                node::set_leaf_value(&mut guard[..], pos, value);
                Ok(())
            }
            Err(_) => Err(TarnError::NotFound("key")),
        }
    }

    /// Deletion shifts cells within the leaf and never rebalances;
    /// underfull nodes are tolerated.
    fn delete(&self, key: i64) -> Result<()> {
        let _update = self.pager.update_guard();
        let (mut guard, _handle) = self.latch_leaf_for_write(key)?;
        match node::leaf_search(&guard[..], key) {
            Ok(pos) => {
                node::leaf_remove_at(&mut guard[..], pos);
                Ok(())
            }
            Err(_) => Err(TarnError::NotFound("key")),
        }
    }

    fn find(&self, key: i64) -> Result<i64> {
        let (guard, _handle) = self.descend_to_leaf(|data| node::child_index_for(data, key))?;
        match node::leaf_search(&guard[..], key) {
            Ok(pos) => Ok(node::leaf_value(&guard[..], pos)),
            Err(_) => Err(TarnError::NotFound("key")),
        }
    }

    fn select(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut cursor = self.cursor_start()?;
        loop {
            if cursor.is_exhausted() {
                break;
            }
            if cursor.is_end() {
                if cursor.step_forward() {
                    break;
                }
                continue;
            }
            entries.push(cursor.entry()?);
            if cursor.step_forward() {
                break;
            }
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        self.pager.flush_all_pages()?;
        write_meta(
            self.pager.path(),
            self.pager.page_count(),
            &MetaPayload::BTree { root: self.root_pn },
        )
    }
}
