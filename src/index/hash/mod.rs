use std::collections::HashSet;
use std::hash::Hasher;
use std::path::Path;

use parking_lot::RwLock;
use siphasher::sip::SipHasher13;
use tracing::debug;

use crate::error::{Result, TarnError};
use crate::index::{read_meta, write_meta, Entry, Index, IndexKind, MetaPayload};
use crate::pager::{PageHandle, PageNum, Pager};

pub(crate) mod bucket;

pub use bucket::BUCKET_CAPACITY;

const HASH_KEY_0: u64 = 0x7461726e_68617368;
const HASH_KEY_1: u64 = 0x6469726563746f72;

/// 64-bit hash of a key; the low `depth` bits select a directory slot.
pub(crate) fn hash_key(key: i64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
    hasher.write(&key.to_le_bytes());
    hasher.finish()
}

fn slot_of(hash: u64, depth: u32) -> usize {
    (hash & ((1u64 << depth) - 1)) as usize
}

struct HashState {
    global_depth: u32,
    directory: Vec<PageNum>,
}

/// Unordered `i64 -> i64` map: an extendible hash table with a
/// `2^global_depth`-slot directory of bucket pages. Structural changes
/// (splits, directory doubling) happen under the state write lock so that
/// every slot that references a split bucket is repointed atomically.
pub struct HashIndex {
    name: String,
    pager: Pager,
    state: RwLock<HashState>,
}

impl HashIndex {
    pub fn create(base: &Path, name: &str, cache_frames: usize) -> Result<Self> {
        let path = base.join(name);
        let pager = Pager::create(&path, cache_frames)?;
        {
            let first = pager.new_page()?;
            let mut guard = first.write();
            bucket::init_bucket(&mut guard[..], 0);
        }
        let index = Self {
            name: name.to_string(),
            pager,
            state: RwLock::new(HashState {
                global_depth: 0,
                directory: vec![0],
            }),
        };
        index.flush()?;
        Ok(index)
    }

    pub fn open(base: &Path, name: &str, cache_frames: usize) -> Result<Self> {
        let path = base.join(name);
        let (page_count, payload) = read_meta(&path)?;
        let MetaPayload::Hash {
            global_depth,
            directory,
        } = payload
        else {
            return Err(TarnError::Corrupt(format!(
                "table {name} is not a hash table"
            )));
        };
        let pager = Pager::open(&path, cache_frames)?;
        if page_count > pager.page_count() {
            return Err(TarnError::Corrupt(format!(
                "meta page count exceeds data file for table {name}"
            )));
        }
        if directory
            .iter()
            .any(|&pn| pn < 0 || pn >= pager.page_count())
        {
            return Err(TarnError::Corrupt(format!(
                "hash directory for table {name} references missing pages"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            pager,
            state: RwLock::new(HashState {
                global_depth,
                directory,
            }),
        })
    }

    /// Current directory width in bits.
    pub fn depth(&self) -> u32 {
        self.state.read().global_depth
    }

    /// Snapshot of the directory: one bucket page number per slot.
    pub fn buckets(&self) -> Vec<PageNum> {
        self.state.read().directory.clone()
    }

    /// Doubles the directory without splitting any bucket; every new slot
    /// aliases the bucket of the slot it mirrors.
    pub fn extend_table(&self) -> Result<()> {
        let mut state = self.state.write();
        self.double_directory(&mut state)
    }

    /// All entries of the bucket stored at `page_num`; used by the join's
    /// pairwise probe.
    pub fn bucket_entries(&self, page_num: PageNum) -> Result<Vec<Entry>> {
        let handle = self.bucket_page(page_num)?;
        let guard = handle.read();
        Ok(bucket::bucket_entries(&guard[..]))
    }

    pub(crate) fn bucket_local_depth(&self, page_num: PageNum) -> Result<u32> {
        let handle = self.bucket_page(page_num)?;
        let guard = handle.read();
        Ok(bucket::local_depth(&guard[..]))
    }

    fn double_directory(&self, state: &mut HashState) -> Result<()> {
        if state.global_depth >= 32 {
            return Err(TarnError::Protocol(
                "hash directory cannot grow past 2^32 slots".into(),
            ));
        }
        state.directory.extend_from_within(..);
        state.global_depth += 1;
        debug!(
            table = %self.name,
            global_depth = state.global_depth,
            "hash directory doubled"
        );
        Ok(())
    }

    /// Splits the bucket at `old_pn`. The caller holds the state write
    /// lock; entries are redistributed by the bit that the deeper local
    /// depth exposes, and every slot that carried the old bucket with that
    /// bit set is repointed at the sibling.
    fn split_bucket(&self, state: &mut HashState, old_pn: PageNum) -> Result<()> {
        let old_handle = self.bucket_page(old_pn)?;
        let mut old_guard = old_handle.write();
        let old_depth = bucket::local_depth(&old_guard[..]);
        if old_depth == state.global_depth {
            self.double_directory(state)?;
        }
        let new_depth = old_depth + 1;
        bucket::set_local_depth(&mut old_guard[..], new_depth);

        let sibling = self.pager.new_page()?;
        let mut sibling_guard = sibling.write();
        bucket::init_bucket(&mut sibling_guard[..], new_depth);

        let entries = bucket::bucket_entries(&old_guard[..]);
        bucket::set_num_keys(&mut old_guard[..], 0);
        for entry in entries {
            if (hash_key(entry.key) >> old_depth) & 1 == 1 {
                bucket::bucket_append(&mut sibling_guard[..], entry.key, entry.value);
            } else {
                bucket::bucket_append(&mut old_guard[..], entry.key, entry.value);
            }
        }

        for slot in 0..state.directory.len() {
            if state.directory[slot] == old_pn && (slot >> old_depth) & 1 == 1 {
                state.directory[slot] = sibling.page_num();
            }
        }
        Ok(())
    }

    fn bucket_page(&self, page_num: PageNum) -> Result<PageHandle> {
        self.pager.get_page(page_num).map_err(|err| match err {
            TarnError::NotFound(_) => TarnError::Corrupt(format!(
                "hash directory references missing page {page_num}"
            )),
            other => other,
        })
    }
}

impl Index for HashIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hash
    }

    fn pager(&self) -> &Pager {
        &self.pager
    }

    fn insert(&self, key: i64, value: i64) -> Result<()> {
        let _update = self.pager.update_guard();
        let mut state = self.state.write();
        loop {
            let slot = slot_of(hash_key(key), state.global_depth);
            let page_num = state.directory[slot];
            let handle = self.bucket_page(page_num)?;
            let mut guard = handle.write();
            if bucket::bucket_search(&guard[..], key).is_some() {
                return Err(TarnError::Duplicate(key));
            }
            if bucket::num_keys(&guard[..]) < bucket::BUCKET_CAPACITY {
                bucket::bucket_append(&mut guard[..], key, value);
                return Ok(());
            }
            // Overflow: split and retry. Splitting may leave the target
            // bucket still full when every key shares the deeper suffix,
            // in which case the next round splits again.
            drop(guard);
            drop(handle);
            self.split_bucket(&mut state, page_num)?;
        }
    }

    fn update(&self, key: i64, value: i64) -> Result<()> {
        let _update = self.pager.update_guard();
        let state = self.state.read();
        let slot = slot_of(hash_key(key), state.global_depth);
        let handle = self.bucket_page(state.directory[slot])?;
        let mut guard = handle.write();
        match bucket::bucket_search(&guard[..], key) {
            Some(index) => {
                bucket::set_bucket_value(&mut guard[..], index, value);
                Ok(())
            }
            None => Err(TarnError::NotFound("key")),
        }
    }

    fn delete(&self, key: i64) -> Result<()> {
        let _update = self.pager.update_guard();
        let state = self.state.read();
        let slot = slot_of(hash_key(key), state.global_depth);
        let handle = self.bucket_page(state.directory[slot])?;
        let mut guard = handle.write();
        match bucket::bucket_search(&guard[..], key) {
            Some(index) => {
                bucket::bucket_remove_at(&mut guard[..], index);
                Ok(())
            }
            None => Err(TarnError::NotFound("key")),
        }
    }

    fn find(&self, key: i64) -> Result<i64> {
        let state = self.state.read();
        let slot = slot_of(hash_key(key), state.global_depth);
        let handle = self.bucket_page(state.directory[slot])?;
        let guard = handle.read();
        match bucket::bucket_search(&guard[..], key) {
            Some(index) => Ok(bucket::bucket_value(&guard[..], index)),
            None => Err(TarnError::NotFound("key")),
        }
    }

    /// Directory-order scan; buckets referenced by several slots are
    /// visited once.
    fn select(&self) -> Result<Vec<Entry>> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for &page_num in &state.directory {
            if !seen.insert(page_num) {
                continue;
            }
            let handle = self.bucket_page(page_num)?;
            let guard = handle.read();
            entries.extend(bucket::bucket_entries(&guard[..]));
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        self.pager.flush_all_pages()?;
        let state = self.state.read();
        write_meta(
            self.pager.path(),
            self.pager.page_count(),
            &MetaPayload::Hash {
                global_depth: state.global_depth,
                directory: state.directory.clone(),
            },
        )
    }
}
