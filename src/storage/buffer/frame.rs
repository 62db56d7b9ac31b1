use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::common::types::{Lsn, PageNum, PoolId, INVALID_PAGE_NUM};
use crate::storage::page::{Page, PageType, PAGE_DIRTY_FLAG};

/// Identity of a cached page across all pools of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId {
    pub buffer_pool_id: PoolId,
    pub page_num: PageNum,
}

impl FrameId {
    pub fn new(buffer_pool_id: PoolId, page_num: PageNum) -> Self {
        Self {
            buffer_pool_id,
            page_num,
        }
    }

    pub fn invalid() -> Self {
        Self {
            buffer_pool_id: -1,
            page_num: INVALID_PAGE_NUM,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.buffer_pool_id >= 0 && self.page_num != INVALID_PAGE_NUM
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "buffer_pool_id:{},page_num:{}",
            self.buffer_pool_id, self.page_num
        )
    }
}

/// Nanoseconds since the first call in this process; monotonic.
fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// An in-memory cell holding one page plus cache bookkeeping.
///
/// Frames are shared as `Arc<Frame>`; the pin count keeps a frame immune to
/// eviction, and the page mutex serializes readers and writers of the data
/// region when more than one thread holds a pin.
pub struct Frame {
    pin_count: AtomicU32,
    acc_time: AtomicU64,
    frame_id: Mutex<FrameId>,
    page: Mutex<Page>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            pin_count: AtomicU32::new(0),
            acc_time: AtomicU64::new(0),
            frame_id: Mutex::new(FrameId::invalid()),
            page: Mutex::new(Page::new()),
        }
    }

    /// Restore the frame to its freshly-allocated state before it returns
    /// to the free pool.
    pub fn reset(&self) {
        self.pin_count.store(0, Ordering::SeqCst);
        self.acc_time.store(0, Ordering::SeqCst);
        *self.frame_id.lock() = FrameId::invalid();
        self.page.lock().init();
    }

    pub fn frame_id(&self) -> FrameId {
        *self.frame_id.lock()
    }

    pub fn set_frame_id(&self, frame_id: FrameId) {
        *self.frame_id.lock() = frame_id;
    }

    pub fn buffer_pool_id(&self) -> PoolId {
        self.frame_id.lock().buffer_pool_id
    }

    pub fn page(&self) -> MutexGuard<'_, Page> {
        self.page.lock()
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Saturating decrement: unpinning an unpinned frame is a no-op.
    pub fn unpin(&self) {
        let _ = self
            .pin_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn can_purge(&self) -> bool {
        self.pin_count.load(Ordering::SeqCst) == 0
    }

    /// Stamp the access time for LRU bookkeeping.
    pub fn access(&self) {
        self.acc_time.store(monotonic_ns(), Ordering::Relaxed);
    }

    pub fn acc_time(&self) -> u64 {
        self.acc_time.load(Ordering::Relaxed)
    }

    pub fn page_num(&self) -> PageNum {
        self.page.lock().header.page_num
    }

    pub fn set_page_num(&self, page_num: PageNum) {
        self.page.lock().header.page_num = page_num;
    }

    pub fn lsn(&self) -> Lsn {
        self.page.lock().header.lsn
    }

    pub fn set_lsn(&self, lsn: Lsn) {
        self.page.lock().header.lsn = lsn;
    }

    pub fn page_type(&self) -> PageType {
        PageType::from(self.page.lock().header.page_type)
    }

    pub fn set_page_type(&self, page_type: PageType) {
        self.page.lock().header.page_type = page_type as u8;
    }

    pub fn is_dirty(&self) -> bool {
        self.page.lock().header.flags & PAGE_DIRTY_FLAG != 0
    }

    pub fn mark_dirty(&self) {
        self.page.lock().header.flags |= PAGE_DIRTY_FLAG;
    }

    pub fn clear_dirty(&self) {
        self.page.lock().header.flags &= !PAGE_DIRTY_FLAG;
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
