//! Trait seams for the out-of-scope storage collaborators.

use quarry_error::Result;
use quarry_types::{Lsn, PageId, PartId};

use crate::frame::PageFrame;

/// Partition and page allocation, as seen by logging and redo.
///
/// Allocation state must be visible on disk by the time a call returns —
/// which is why the recovery manager flushes the log *before* invoking
/// these during forward processing, and why redo tolerates finding the
/// disk already in the target state.
pub trait DiskManager: Send + Sync {
    /// Create partition `part`.
    fn alloc_part(&self, part: PartId) -> Result<()>;

    /// Drop partition `part` and every page in it.
    fn free_part(&self, part: PartId) -> Result<()>;

    /// Create the specific page `page` inside an existing partition.
    fn alloc_page(&self, page: PageId) -> Result<()>;

    /// Drop page `page`.
    fn free_page(&self, page: PageId) -> Result<()>;

    /// Whether partition `part` currently exists.
    fn part_exists(&self, part: PartId) -> bool;

    /// Whether page `page` currently exists.
    fn page_exists(&self, page: PageId) -> bool;
}

/// Buffered page access, as seen by logging, redo, and checkpointing.
///
/// `with_page` is the pin/unpin pairing: the frame is pinned for exactly
/// the closure's scope, on every exit path.
pub trait PageCache: Send + Sync {
    /// Pin `page`, run `f` over its frame, unpin.
    fn with_page(&self, page: PageId, f: &mut dyn FnMut(&mut PageFrame)) -> Result<()>;

    /// The page's current pageLSN (pins and unpins internally).
    fn page_lsn(&self, page: PageId) -> Result<Lsn>;

    /// Visit every buffered page with its dirty flag.
    fn for_each_page(&self, f: &mut dyn FnMut(PageId, bool));

    /// Drop a frame without write-back (the page was freed on disk).
    fn discard(&self, page: PageId);
}
