use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::warn;

use crate::error::{Result, TarnError};

mod page;

pub use page::{
    Page, PageHandle, PageNum, PageReadGuard, PageWriteGuard, INVALID_PAGE_NUM, PAGE_SIZE,
};

pub const DEFAULT_CACHE_FRAMES: usize = 1024;

/// Read side of the pager-wide update barrier; held across every index
/// mutation.
pub type UpdateGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Write side of the update barrier; taken only by checkpoint to quiesce
/// writers before flushing.
pub type UpdateBarrier = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Buffer pool over a single backing file. Pages are pinned through
/// [`PageHandle`]s; unpinned pages form an LRU sequence ordered by release
/// time, and the least recently released one is evicted on cache pressure.
#[derive(Clone)]
pub struct Pager {
    inner: Arc<PagerInner>,
}

struct PagerInner {
    frames: Mutex<FrameTable>,
    barrier: Arc<RwLock<()>>,
    max_frames: usize,
    path: PathBuf,
}

struct FrameTable {
    file: File,
    resident: HashMap<PageNum, Arc<Page>>,
    unpinned: LruCache<PageNum, ()>,
    page_count: i64,
}

impl Pager {
    /// Opens an existing data file, or starts an empty one.
    pub fn open(path: &Path, max_frames: usize) -> Result<Self> {
        Self::open_inner(path, max_frames, false)
    }

    /// Creates a fresh data file, truncating anything already there.
    pub fn create(path: &Path, max_frames: usize) -> Result<Self> {
        Self::open_inner(path, max_frames, true)
    }

    fn open_inner(path: &Path, max_frames: usize, truncate: bool) -> Result<Self> {
        if max_frames == 0 {
            return Err(TarnError::Protocol(
                "page cache needs at least one frame".into(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(TarnError::Corrupt(format!(
                "data file {} is not page aligned",
                path.display()
            )));
        }
        Ok(Self {
            inner: Arc::new(PagerInner {
                frames: Mutex::new(FrameTable {
                    file,
                    resident: HashMap::new(),
                    unpinned: LruCache::unbounded(),
                    page_count: (len / PAGE_SIZE as u64) as i64,
                }),
                barrier: Arc::new(RwLock::new(())),
                max_frames,
                path: path.to_path_buf(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn page_count(&self) -> i64 {
        self.inner.frames.lock().page_count
    }

    /// Returns a pinned handle to `page_num`, reading it from disk if it is
    /// not resident. Fails with `NotFound` for pages past the end of the
    /// file and `Busy` if every frame is pinned.
    pub fn get_page(&self, page_num: PageNum) -> Result<PageHandle> {
        if page_num < 0 {
            return Err(TarnError::NotFound("page"));
        }
        let mut frames = self.inner.frames.lock();
        if let Some(page) = frames.resident.get(&page_num) {
            let page = Arc::clone(page);
            page.pin();
            frames.unpinned.pop(&page_num);
            return Ok(PageHandle::new(page, self.clone()));
        }
        if page_num >= frames.page_count {
            return Err(TarnError::NotFound("page"));
        }
        self.evict_for_space(&mut frames)?;
        let page = Arc::new(Page::new(page_num));
        {
            let mut buf = page.buf().write();
            read_page_at(&mut frames.file, page_num, &mut buf[..])?;
        }
        page.pin();
        frames.resident.insert(page_num, Arc::clone(&page));
        Ok(PageHandle::new(page, self.clone()))
    }

    /// Extends the file by one zeroed page and returns it pinned. The new
    /// page number equals the previous page count.
    pub fn new_page(&self) -> Result<PageHandle> {
        let mut frames = self.inner.frames.lock();
        self.evict_for_space(&mut frames)?;
        let page_num = frames.page_count;
        frames.page_count += 1;
        let new_len = frames.page_count as u64 * PAGE_SIZE as u64;
        frames.file.set_len(new_len)?;
        let page = Arc::new(Page::new(page_num));
        page.set_dirty(true);
        page.pin();
        frames.resident.insert(page_num, Arc::clone(&page));
        Ok(PageHandle::new(page, self.clone()))
    }

    fn evict_for_space(&self, frames: &mut FrameTable) -> Result<()> {
        while frames.resident.len() >= self.inner.max_frames {
            let Some((victim, ())) = frames.unpinned.pop_lru() else {
                warn!(
                    resident = frames.resident.len(),
                    "page cache exhausted with every frame pinned"
                );
                return Err(TarnError::Busy);
            };
            if let Some(page) = frames.resident.remove(&victim) {
                if page.is_dirty() {
                    let buf = page.buf().read();
                    write_page_at(&mut frames.file, victim, &buf)?;
                    page.set_dirty(false);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn release(&self, page: &Arc<Page>) {
        let mut frames = self.inner.frames.lock();
        if page.unpin() == 0 {
            frames.unpinned.push(page.page_num(), ());
        }
    }

    /// Writes every dirty resident page back to the file. Callers quiesce
    /// writers with [`Pager::lock_all_updates`] first.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut frames = self.inner.frames.lock();
        let dirty: Vec<Arc<Page>> = frames
            .resident
            .values()
            .filter(|page| page.is_dirty())
            .cloned()
            .collect();
        for page in &dirty {
            let buf = page.buf().read();
            write_page_at(&mut frames.file, page.page_num(), &buf)?;
            page.set_dirty(false);
        }
        frames.file.sync_data()?;
        Ok(())
    }

    /// Takes the pager-wide write barrier, blocking new updates until the
    /// guard drops.
    pub fn lock_all_updates(&self) -> UpdateBarrier {
        self.inner.barrier.write_arc()
    }

    /// Read side of the update barrier, taken by every mutating index
    /// operation.
    pub fn update_guard(&self) -> UpdateGuard {
        self.inner.barrier.read_arc()
    }

    #[cfg(test)]
    pub(crate) fn total_pins(&self) -> u64 {
        let frames = self.inner.frames.lock();
        frames
            .resident
            .values()
            .map(|page| u64::from(page.pin_count()))
            .sum()
    }
}

fn read_page_at(file: &mut File, page_num: PageNum, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))?;
    file.read_exact(buf)?;
    Ok(())
}

fn write_page_at(file: &mut File, page_num: PageNum, buf: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(page_num as u64 * PAGE_SIZE as u64))?;
    file.write_all(buf)?;
    Ok(())
}
