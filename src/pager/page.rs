use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use super::Pager;

/// Fixed size of every on-disk and in-cache page.
pub const PAGE_SIZE: usize = 4096;

pub type PageNum = i64;

/// Sentinel for "no page", used by leaf sibling pointers.
pub const INVALID_PAGE_NUM: PageNum = -1;

pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// A page frame resident in the cache: raw bytes behind a reader-writer
/// latch, plus the bookkeeping the pager needs for eviction.
pub struct Page {
    page_num: PageNum,
    buf: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl Page {
    pub(crate) fn new(page_num: PageNum) -> Self {
        Self {
            page_num,
            buf: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn page_num(&self) -> PageNum {
        self.page_num
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the pin count after the decrement.
    pub(crate) fn unpin(&self) -> u32 {
        self.pin_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn buf(&self) -> &Arc<RwLock<Box<[u8]>>> {
        &self.buf
    }
}

/// Pinned reference to a resident page. The pin is released when the
/// handle drops, at which point the page becomes an eviction candidate
/// again. Latch guards taken through a handle must be dropped before the
/// handle itself.
pub struct PageHandle {
    page: Arc<Page>,
    pager: Pager,
}

impl PageHandle {
    pub(crate) fn new(page: Arc<Page>, pager: Pager) -> Self {
        Self { page, pager }
    }

    pub fn page_num(&self) -> PageNum {
        self.page.page_num()
    }

    pub fn pin_count(&self) -> u32 {
        self.page.pin_count()
    }

    /// Acquires the page's read latch.
    pub fn read(&self) -> PageReadGuard {
        self.page.buf().read_arc()
    }

    /// Acquires the page's write latch and marks the page dirty.
    pub fn write(&self) -> PageWriteGuard {
        let guard = self.page.buf().write_arc();
        self.page.set_dirty(true);
        guard
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pager.release(&self.page);
    }
}
