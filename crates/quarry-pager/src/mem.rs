//! In-memory disk manager and page cache.
//!
//! These back the test suite. [`MemPageCache`] models the buffer pool's
//! side of the write-ahead contract: flushing a dirty frame first invokes
//! the flush hook (so the log can be forced through the frame's pageLSN),
//! then writes the image "to disk", then invokes the I/O hook.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use quarry_error::{QuarryError, Result};
use quarry_types::{Lsn, PageId, PartId};
use tracing::debug;

use crate::frame::PageFrame;
use crate::traits::{DiskManager, PageCache};

// ---------------------------------------------------------------------------
// MemDiskManager
// ---------------------------------------------------------------------------

/// Allocation bookkeeping with no bytes behind it.
#[derive(Debug, Default)]
pub struct MemDiskManager {
    parts: Mutex<HashMap<PartId, HashSet<u32>>>,
}

impl MemDiskManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiskManager for MemDiskManager {
    fn alloc_part(&self, part: PartId) -> Result<()> {
        let mut parts = self.parts.lock();
        if parts.contains_key(&part) {
            return Err(QuarryError::PartitionExists { part });
        }
        parts.insert(part, HashSet::new());
        Ok(())
    }

    fn free_part(&self, part: PartId) -> Result<()> {
        self.parts
            .lock()
            .remove(&part)
            .map(|_| ())
            .ok_or(QuarryError::UnknownPartition { part })
    }

    fn alloc_page(&self, page: PageId) -> Result<()> {
        let mut parts = self.parts.lock();
        let pages = parts
            .get_mut(&page.partition())
            .ok_or(QuarryError::UnknownPartition {
                part: page.partition(),
            })?;
        if !pages.insert(page.index()) {
            return Err(QuarryError::PageExists { page });
        }
        Ok(())
    }

    fn free_page(&self, page: PageId) -> Result<()> {
        let mut parts = self.parts.lock();
        let pages = parts
            .get_mut(&page.partition())
            .ok_or(QuarryError::UnknownPartition {
                part: page.partition(),
            })?;
        if !pages.remove(&page.index()) {
            return Err(QuarryError::UnknownPage { page });
        }
        Ok(())
    }

    fn part_exists(&self, part: PartId) -> bool {
        self.parts.lock().contains_key(&part)
    }

    fn page_exists(&self, page: PageId) -> bool {
        self.parts
            .lock()
            .get(&page.partition())
            .is_some_and(|pages| pages.contains(&page.index()))
    }
}

// ---------------------------------------------------------------------------
// MemPageCache
// ---------------------------------------------------------------------------

/// Hook invoked with a frame's pageLSN before that frame may leave the pool.
pub type FlushHook = Arc<dyn Fn(Lsn) + Send + Sync>;

/// Hook invoked with a page number after its image reaches disk.
pub type IoHook = Arc<dyn Fn(PageId) + Send + Sync>;

/// A buffer pool made of two maps: live frames and written-back images.
#[derive(Default)]
pub struct MemPageCache {
    frames: Mutex<HashMap<PageId, PageFrame>>,
    disk: Mutex<HashMap<PageId, (Lsn, Box<[u8]>)>>,
    flush_hook: RwLock<Option<FlushHook>>,
    io_hook: RwLock<Option<IoHook>>,
}

impl MemPageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the write-ahead hook (recovery manager's `page_flush_hook`).
    pub fn set_flush_hook(&self, hook: FlushHook) {
        *self.flush_hook.write() = Some(hook);
    }

    /// Install the post-write-back hook (recovery manager's `disk_io_hook`).
    pub fn set_io_hook(&self, hook: IoHook) {
        *self.io_hook.write() = Some(hook);
    }

    /// Write one frame back to disk, honoring the write-ahead order.
    ///
    /// No-op if the page is not buffered or not dirty.
    pub fn flush_page(&self, page: PageId) {
        let (page_lsn, image) = {
            let mut frames = self.frames.lock();
            let Some(frame) = frames.get_mut(&page) else {
                return;
            };
            if !frame.is_dirty() {
                return;
            }
            frame.mark_clean();
            (frame.page_lsn(), frame.image())
        };
        if let Some(hook) = self.flush_hook.read().clone() {
            hook(page_lsn);
        }
        debug!(page = %page, page_lsn = %page_lsn, "page write-back");
        self.disk.lock().insert(page, (page_lsn, image));
        if let Some(hook) = self.io_hook.read().clone() {
            hook(page);
        }
    }

    /// Write back every dirty frame.
    pub fn flush_all(&self) {
        let pages: Vec<PageId> = self.frames.lock().keys().copied().collect();
        for page in pages {
            self.flush_page(page);
        }
    }

    /// Write back and drop one frame (buffer pool eviction).
    pub fn evict(&self, page: PageId) {
        self.flush_page(page);
        self.frames.lock().remove(&page);
    }

    /// Drop every frame without write-back. Simulates a crash: only what
    /// reached disk (or the log) survives.
    pub fn crash(&self) {
        self.frames.lock().clear();
    }
}

impl PageCache for MemPageCache {
    fn with_page(&self, page: PageId, f: &mut dyn FnMut(&mut PageFrame)) -> Result<()> {
        let mut frames = self.frames.lock();
        let frame = frames.entry(page).or_insert_with(|| {
            // Fetch miss: load the written-back image, or start zeroed.
            self.disk.lock().get(&page).map_or_else(
                || PageFrame::zeroed(page),
                |(lsn, image)| PageFrame::from_image(page, *lsn, image.clone()),
            )
        });
        f(frame);
        Ok(())
    }

    fn page_lsn(&self, page: PageId) -> Result<Lsn> {
        let mut lsn = Lsn::ZERO;
        self.with_page(page, &mut |frame| lsn = frame.page_lsn())?;
        Ok(lsn)
    }

    fn for_each_page(&self, f: &mut dyn FnMut(PageId, bool)) {
        for (page, frame) in self.frames.lock().iter() {
            f(*page, frame.is_dirty());
        }
    }

    fn discard(&self, page: PageId) {
        self.frames.lock().remove(&page);
        self.disk.lock().remove(&page);
    }
}
