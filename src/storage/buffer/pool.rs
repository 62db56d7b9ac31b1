//! Per-file page cache.
//!
//! A `BufferPool` fronts one data file. Page 0 is the file header: the pool
//! id, the page counters and the allocation bitmap live in its data region,
//! and the header page stays pinned in its frame for the pool's lifetime.
//! All page traffic flows through the shared frame manager, the write-ahead
//! log and the double-write buffer.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Weak};

use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use parking_lot::Mutex;

use crate::common::bitmap::Bitmap;
use crate::common::error::{DbError, Result};
use crate::common::io::{read_exact_at, write_all_at, ReadOutcome};
use crate::common::types::{Lsn, PageNum, PoolId, PAGE_SIZE};
use crate::storage::buffer::double_write::DoubleWriteBuffer;
use crate::storage::buffer::frame::Frame;
use crate::storage::buffer::frame_manager::FrameManager;
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::buffer::pool_log::BufferPoolLogHandler;
use crate::storage::clog::LogHandler;
use crate::storage::page::{Page, PageType, PAGE_DATA_SIZE, PAGE_DIRTY_FLAG, PAGE_HEADER_SIZE};

/// Fixed fields of the pool file header preceding the bitmap:
/// `{i32 buffer_pool_id, i32 page_count, i32 allocated_pages}`
const FILE_HEADER_FIXED_SIZE: usize = 12;

/// Largest page number a pool file can track: one bit per page in what
/// remains of the header page's data region.
pub const MAX_PAGE_NUM: usize = (PAGE_DATA_SIZE - FILE_HEADER_FIXED_SIZE) * 8;

/// Typed view over the header page's data region.
struct FileHeaderView<'a> {
    data: &'a mut [u8; PAGE_DATA_SIZE],
}

impl<'a> FileHeaderView<'a> {
    fn new(data: &'a mut [u8; PAGE_DATA_SIZE]) -> Self {
        Self { data }
    }

    fn buffer_pool_id(&self) -> PoolId {
        LittleEndian::read_i32(&self.data[0..4])
    }

    fn set_buffer_pool_id(&mut self, id: PoolId) {
        LittleEndian::write_i32(&mut self.data[0..4], id);
    }

    fn page_count(&self) -> i32 {
        LittleEndian::read_i32(&self.data[4..8])
    }

    fn set_page_count(&mut self, count: i32) {
        LittleEndian::write_i32(&mut self.data[4..8], count);
    }

    fn allocated_pages(&self) -> i32 {
        LittleEndian::read_i32(&self.data[8..12])
    }

    fn set_allocated_pages(&mut self, count: i32) {
        LittleEndian::write_i32(&mut self.data[8..12], count);
    }

    fn bitmap(&mut self) -> Bitmap<'_> {
        Bitmap::new(&mut self.data[FILE_HEADER_FIXED_SIZE..], MAX_PAGE_NUM)
    }
}

struct PoolInner {
    disposed_pages: BTreeSet<PageNum>,
}

/// Page cache for one pool file.
pub struct BufferPool {
    manager: Weak<BufferPoolManager>,
    frame_manager: Arc<FrameManager>,
    dblwr: Arc<DoubleWriteBuffer>,
    log_handler: BufferPoolLogHandler,
    file: File,
    buffer_pool_id: PoolId,
    hdr_frame: Arc<Frame>,
    filename: String,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Open (creating if absent) the pool file at `path`. The header page
    /// is loaded into a permanently pinned frame.
    pub(crate) fn open(
        manager: &Arc<BufferPoolManager>,
        frame_manager: Arc<FrameManager>,
        dblwr: Arc<DoubleWriteBuffer>,
        log_handler: Arc<LogHandler>,
        path: &Path,
    ) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| DbError::FileCreateErr(format!("{}: {}", path.display(), e)))?;

        let file_len = file.metadata().map_err(DbError::IoRead)?.len();
        let create = file_len == 0;

        let buffer_pool_id = if create {
            manager.allocate_pool_id()
        } else {
            // The frame cache is keyed by pool id, so the id has to come
            // straight from the file before the header frame can exist.
            let mut id_buf = [0u8; 4];
            if read_exact_at(&file, &mut id_buf, PAGE_HEADER_SIZE as u64)? == ReadOutcome::Eof {
                return Err(DbError::FileCorrupted(format!(
                    "{}: missing file header",
                    path.display()
                )));
            }
            let id = LittleEndian::read_i32(&id_buf);
            manager.note_pool_id(id);
            id
        };

        let hdr_frame =
            Self::allocate_frame_with(&frame_manager, manager, buffer_pool_id, 0)?;

        let init_result = if create {
            let bytes = {
                let mut page = hdr_frame.page();
                page.init();
                page.header.page_num = 0;
                page.header.page_type = PageType::Header as u8;
                let mut view = FileHeaderView::new(&mut page.data);
                view.set_buffer_pool_id(buffer_pool_id);
                view.set_page_count(1);
                view.set_allocated_pages(1);
                view.bitmap().set(0);
                page.calc_checksum();
                page.to_bytes()
            };

            write_all_at(&file, bytes.as_ref(), 0)
                .and_then(|_| file.sync_data().map_err(DbError::IoWrite))
                .map(|_| {
                    info!(
                        "created buffer pool file {}, buffer_pool_id={}",
                        path.display(),
                        buffer_pool_id
                    )
                })
        } else {
            Self::load_page_from(&dblwr, &file, buffer_pool_id, 0, &hdr_frame).and_then(|_| {
                let mut page = hdr_frame.page();
                let view = FileHeaderView::new(&mut page.data);
                if view.buffer_pool_id() != buffer_pool_id {
                    return Err(DbError::FileCorrupted(format!(
                        "{}: header pool id {} does not match {}",
                        path.display(),
                        view.buffer_pool_id(),
                        buffer_pool_id
                    )));
                }
                Ok(())
            })
        };
        if let Err(e) = init_result {
            let _ = frame_manager.free(hdr_frame.frame_id(), &hdr_frame);
            return Err(e);
        }

        Ok(Arc::new(Self {
            manager: Arc::downgrade(manager),
            frame_manager,
            dblwr,
            log_handler: BufferPoolLogHandler::new(buffer_pool_id, log_handler),
            file,
            buffer_pool_id,
            hdr_frame,
            filename: path.display().to_string(),
            inner: Mutex::new(PoolInner {
                disposed_pages: BTreeSet::new(),
            }),
        }))
    }

    pub fn id(&self) -> PoolId {
        self.buffer_pool_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Fetch a page, pinning its frame. The caller unpins when done.
    pub fn get_this_page(&self, page_num: PageNum) -> Result<Arc<Frame>> {
        self.check_page_num(page_num)?;

        if let Some(frame) = self.frame_manager.get(self.buffer_pool_id, page_num) {
            frame.access();
            return Ok(frame);
        }

        let frame = self.allocate_frame(page_num)?;
        if let Err(e) = self.load_page(page_num, &frame) {
            self.frame_manager.free(frame.frame_id(), &frame)?;
            return Err(e);
        }

        frame.access();
        Ok(frame)
    }

    /// Allocate a fresh page: log the allocation, claim the first free bit
    /// in the bitmap, and hand back a pinned, zeroed, dirty frame.
    pub fn allocate_page(&self) -> Result<Arc<Frame>> {
        let mut inner = self.inner.lock();

        let page_num = {
            let mut page = self.hdr_frame.page();
            let mut view = FileHeaderView::new(&mut page.data);
            // Recently disposed pages are the cheapest candidates; fall
            // back to a bitmap scan when none are tracked.
            let hint = inner
                .disposed_pages
                .iter()
                .next()
                .copied()
                .filter(|&n| !view.bitmap().get(n as usize));
            match hint.or_else(|| {
                view.bitmap().next_zero_bit(1).map(|n| n as PageNum)
            }) {
                Some(n) => n,
                None => return Err(DbError::FileFull),
            }
        };

        // Claim the frame before the log append: a full cache aborts the
        // allocation without leaving any trace to undo.
        let frame = self.allocate_frame(page_num)?;

        let lsn = match self.log_handler.allocate_page(page_num) {
            Ok(lsn) => lsn,
            Err(e) => {
                self.frame_manager.free(frame.frame_id(), &frame)?;
                return Err(e);
            }
        };

        {
            let mut page = self.hdr_frame.page();
            page.header.lsn = lsn;
            page.header.flags |= PAGE_DIRTY_FLAG;
            let mut view = FileHeaderView::new(&mut page.data);
            view.bitmap().set(page_num as usize);
            let allocated = view.allocated_pages() + 1;
            view.set_allocated_pages(allocated);
            if page_num >= view.page_count() {
                view.set_page_count(page_num + 1);
            }
        }
        inner.disposed_pages.remove(&page_num);

        {
            let mut page = frame.page();
            page.init();
            page.header.page_num = page_num;
            page.header.lsn = lsn;
            page.header.page_type = PageType::Data as u8;
            page.header.flags |= PAGE_DIRTY_FLAG;
        }
        frame.access();
        Ok(frame)
    }

    /// Release a page back to the file: log the disposal, clear its bitmap
    /// bit and drop any cached frame.
    pub fn dispose_page(&self, page_num: PageNum) -> Result<()> {
        if page_num <= 0 {
            return Err(DbError::InvalidPageNum(page_num));
        }

        let mut inner = self.inner.lock();
        {
            let mut page = self.hdr_frame.page();
            let mut view = FileHeaderView::new(&mut page.data);
            if page_num >= view.page_count() || !view.bitmap().get(page_num as usize) {
                return Err(DbError::InvalidPageNum(page_num));
            }
        }

        // The cached frame, if any, must not be in use elsewhere.
        let cached = self.frame_manager.get(self.buffer_pool_id, page_num);
        if let Some(frame) = &cached {
            if frame.pin_count() > 1 {
                frame.unpin();
                return Err(DbError::PageUnpinError(page_num));
            }
        }

        let lsn = match self.log_handler.deallocate_page(page_num) {
            Ok(lsn) => lsn,
            Err(e) => {
                if let Some(frame) = &cached {
                    frame.unpin();
                }
                return Err(e);
            }
        };

        {
            let mut page = self.hdr_frame.page();
            page.header.lsn = lsn;
            page.header.flags |= PAGE_DIRTY_FLAG;
            let mut view = FileHeaderView::new(&mut page.data);
            view.bitmap().clear(page_num as usize);
            let allocated = view.allocated_pages() - 1;
            view.set_allocated_pages(allocated);
        }
        inner.disposed_pages.insert(page_num);

        if let Some(frame) = cached {
            frame.clear_dirty();
            self.frame_manager.free(frame.frame_id(), &frame)?;
        }
        Ok(())
    }

    /// Decrement the caller's pin on a fetched frame.
    pub fn unpin_page(&self, frame: &Frame) -> Result<()> {
        frame.unpin();
        Ok(())
    }

    /// Write one dirty page out through the double-write buffer, honoring
    /// the write-ahead invariant first.
    pub fn flush_page(&self, frame: &Frame) -> Result<()> {
        self.flush_page_internal(frame)
    }

    pub(crate) fn flush_page_internal(&self, frame: &Frame) -> Result<()> {
        let mut page = frame.page();
        if page.header.flags & PAGE_DIRTY_FLAG == 0 {
            return Ok(());
        }

        // The log must durably cover this page's LSN before its image may
        // reach disk.
        self.log_handler.flush_page(&page)?;

        page.calc_checksum();
        let page_num = page.header.page_num;
        self.dblwr.add_page(self, page_num, &page)?;

        page.header.flags &= !PAGE_DIRTY_FLAG;
        Ok(())
    }

    /// Flush every cached page of this pool.
    pub fn flush_all_pages(&self) -> Result<()> {
        let frames = self.frame_manager.find_list(self.buffer_pool_id);

        let mut result = Ok(());
        for frame in frames {
            if result.is_ok() {
                result = self.flush_page_internal(&frame);
            }
            frame.unpin();
        }
        result
    }

    /// Evict one page from the cache, flushing it first if dirty.
    pub fn purge_page(&self, page_num: PageNum) -> Result<()> {
        let Some(frame) = self.frame_manager.get(self.buffer_pool_id, page_num) else {
            return Ok(());
        };

        if frame.pin_count() > 1 {
            frame.unpin();
            return Err(DbError::PageUnpinError(page_num));
        }

        if let Err(e) = self.flush_page_internal(&frame) {
            frame.unpin();
            return Err(e);
        }
        self.frame_manager.free(frame.frame_id(), &frame)
    }

    /// Evict every evictable page of this pool; pinned pages are skipped.
    pub fn purge_all_pages(&self) -> Result<()> {
        let frames = self.frame_manager.find_list(self.buffer_pool_id);

        for frame in frames {
            if frame.pin_count() > 1 {
                frame.unpin();
                continue;
            }
            if let Err(e) = self.flush_page_internal(&frame) {
                frame.unpin();
                return Err(e);
            }
            self.frame_manager.free(frame.frame_id(), &frame)?;
        }
        Ok(())
    }

    /// Close-time diagnostic: every page except the header must be
    /// unpinned. Drops the walker's own pins along the way.
    pub fn check_all_pages_unpinned(&self) -> Result<()> {
        let frames = self.frame_manager.find_list(self.buffer_pool_id);

        let mut result = Ok(());
        for frame in frames {
            frame.unpin();
            let expected = if frame.page_num() == 0 { 1 } else { 0 };
            if frame.pin_count() > expected {
                warn!(
                    "page is still pinned at close, frame_id={}, pin_count={}",
                    frame.frame_id(),
                    frame.pin_count()
                );
                result = Err(DbError::PageUnpinError(frame.page_num()));
            }
        }
        result
    }

    /// Flush everything, finish the double-write cycle and release every
    /// frame including the permanently pinned header.
    pub(crate) fn close(&self) -> Result<()> {
        self.flush_all_pages()?;
        self.dblwr.flush_pages()?;
        self.dblwr.clear_pages(self)?;

        let frames = self.frame_manager.find_list(self.buffer_pool_id);
        for frame in frames {
            if Arc::ptr_eq(&frame, &self.hdr_frame) {
                frame.unpin();
                continue;
            }
            if frame.pin_count() > 1 {
                frame.unpin();
                warn!(
                    "leaking pinned frame at close, frame_id={}",
                    frame.frame_id()
                );
                continue;
            }
            self.frame_manager.free(frame.frame_id(), &frame)?;
        }

        self.frame_manager
            .free(self.hdr_frame.frame_id(), &self.hdr_frame)?;
        self.file.sync_data().map_err(DbError::IoWrite)?;
        info!("closed buffer pool file {}", self.filename);
        Ok(())
    }

    /// Redo hook: re-apply a logged allocation to the header page. Applied
    /// only when the header has not seen this LSN yet, so replaying twice
    /// is a no-op.
    pub fn redo_allocate_page(&self, lsn: Lsn, page_num: PageNum) -> Result<()> {
        if page_num < 0 || page_num as usize >= MAX_PAGE_NUM {
            return Err(DbError::InvalidPageNum(page_num));
        }

        let _inner = self.inner.lock();
        let mut page = self.hdr_frame.page();
        if page.header.lsn >= lsn {
            return Ok(());
        }

        let mut view = FileHeaderView::new(&mut page.data);
        if !view.bitmap().get(page_num as usize) {
            view.bitmap().set(page_num as usize);
            let allocated = view.allocated_pages() + 1;
            view.set_allocated_pages(allocated);
        }
        if page_num >= view.page_count() {
            view.set_page_count(page_num + 1);
        }
        page.header.lsn = lsn;
        page.header.flags |= PAGE_DIRTY_FLAG;
        Ok(())
    }

    /// Redo hook: re-apply a logged disposal to the header page.
    pub fn redo_deallocate_page(&self, lsn: Lsn, page_num: PageNum) -> Result<()> {
        if page_num <= 0 || page_num as usize >= MAX_PAGE_NUM {
            return Err(DbError::InvalidPageNum(page_num));
        }

        let _inner = self.inner.lock();
        let mut page = self.hdr_frame.page();
        if page.header.lsn >= lsn {
            return Ok(());
        }

        let mut view = FileHeaderView::new(&mut page.data);
        if view.bitmap().get(page_num as usize) {
            view.bitmap().clear(page_num as usize);
            let allocated = view.allocated_pages() - 1;
            view.set_allocated_pages(allocated);
        }
        page.header.lsn = lsn;
        page.header.flags |= PAGE_DIRTY_FLAG;
        Ok(())
    }

    /// Redo-time fetch that tolerates pages the header does not cover yet.
    pub fn recover_page(&self, page_num: PageNum) -> Result<Arc<Frame>> {
        if page_num < 0 {
            return Err(DbError::InvalidPageNum(page_num));
        }

        if let Some(frame) = self.frame_manager.get(self.buffer_pool_id, page_num) {
            frame.access();
            return Ok(frame);
        }

        let frame = self.allocate_frame(page_num)?;
        if let Err(e) = self.load_page(page_num, &frame) {
            self.frame_manager.free(frame.frame_id(), &frame)?;
            return Err(e);
        }
        frame.access();
        Ok(frame)
    }

    /// Write one page image to its final location and sync it. This is the
    /// destination write of the double-write protocol.
    pub fn write_page(&self, page_num: PageNum, page: &Page) -> Result<()> {
        let bytes = page.to_bytes();
        write_all_at(&self.file, bytes.as_ref(), Self::page_offset(page_num))?;
        self.file.sync_data().map_err(DbError::IoWrite)
    }

    /// True when the on-disk image at `page_num` exists and its checksum
    /// verifies. Used by double-write recovery to spot torn pages.
    pub fn page_intact_on_disk(&self, page_num: PageNum) -> Result<bool> {
        let offset = Self::page_offset(page_num);
        let file_len = self.file.metadata().map_err(DbError::IoRead)?.len();
        if file_len < offset + PAGE_SIZE as u64 {
            return Ok(false);
        }

        let mut buf = [0u8; PAGE_SIZE];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(Page::from_bytes(&buf).verify_checksum())
    }

    /// Snapshot iterator over allocated page numbers, starting at
    /// `start_page`.
    pub fn iter_pages(&self, start_page: PageNum) -> BufferPoolIterator {
        let mut page = self.hdr_frame.page();
        let mut view = FileHeaderView::new(&mut page.data);
        let page_count = view.page_count();
        let bits =
            view.data[FILE_HEADER_FIXED_SIZE..FILE_HEADER_FIXED_SIZE + (page_count as usize + 7) / 8]
                .to_vec();
        BufferPoolIterator {
            bits,
            page_count,
            next_page: start_page.max(0),
        }
    }

    /// Total pages ever allocated, including disposed holes.
    pub fn page_count(&self) -> i32 {
        let mut page = self.hdr_frame.page();
        FileHeaderView::new(&mut page.data).page_count()
    }

    /// Pages currently marked allocated in the bitmap.
    pub fn allocated_pages(&self) -> i32 {
        let mut page = self.hdr_frame.page();
        FileHeaderView::new(&mut page.data).allocated_pages()
    }

    fn check_page_num(&self, page_num: PageNum) -> Result<()> {
        if page_num < 0 {
            return Err(DbError::InvalidPageNum(page_num));
        }

        let mut page = self.hdr_frame.page();
        let mut view = FileHeaderView::new(&mut page.data);
        if page_num >= view.page_count() || !view.bitmap().get(page_num as usize) {
            return Err(DbError::InvalidPageNum(page_num));
        }
        Ok(())
    }

    fn allocate_frame(&self, page_num: PageNum) -> Result<Arc<Frame>> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| DbError::Internal("buffer pool manager gone".to_string()))?;
        Self::allocate_frame_with(&self.frame_manager, &manager, self.buffer_pool_id, page_num)
    }

    /// Grab a free frame, purging one LRU victim if the allocator is dry.
    fn allocate_frame_with(
        frame_manager: &FrameManager,
        manager: &BufferPoolManager,
        buffer_pool_id: PoolId,
        page_num: PageNum,
    ) -> Result<Arc<Frame>> {
        if let Some(frame) = frame_manager.alloc(buffer_pool_id, page_num) {
            return Ok(frame);
        }

        frame_manager.purge_frames(1, |frame| manager.flush_frame(frame));

        frame_manager
            .alloc(buffer_pool_id, page_num)
            .ok_or(DbError::BufferPoolFull)
    }

    fn load_page(&self, page_num: PageNum, frame: &Frame) -> Result<()> {
        Self::load_page_from(&self.dblwr, &self.file, self.buffer_pool_id, page_num, frame)
    }

    /// Read a page image into `frame`. A crash-recovered copy in the
    /// double-write buffer is authoritative over the pool file.
    fn load_page_from(
        dblwr: &DoubleWriteBuffer,
        file: &File,
        buffer_pool_id: PoolId,
        page_num: PageNum,
        frame: &Frame,
    ) -> Result<()> {
        if let Some(mut staged) = dblwr.read_page(buffer_pool_id, page_num) {
            staged.header.flags &= !PAGE_DIRTY_FLAG;
            *frame.page() = staged;
            return Ok(());
        }

        let mut buf = [0u8; PAGE_SIZE];
        match read_exact_at(file, &mut buf, Self::page_offset(page_num))? {
            ReadOutcome::Eof => {
                // Allocated but never flushed: the image never reached the
                // file, so a fresh zeroed page is the correct content.
                let mut page = frame.page();
                page.init();
                page.header.page_num = page_num;
                Ok(())
            }
            ReadOutcome::Complete => {
                let mut page = Page::from_bytes(&buf);
                if !page.verify_checksum() {
                    return Err(DbError::FileCorrupted(format!(
                        "checksum mismatch on page {}",
                        page_num
                    )));
                }
                page.header.flags &= !PAGE_DIRTY_FLAG;
                *frame.page() = page;
                Ok(())
            }
        }
    }

    fn page_offset(page_num: PageNum) -> u64 {
        page_num as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_pool_id", &self.buffer_pool_id)
            .field("filename", &self.filename)
            .finish()
    }
}

/// Iterator over the allocated page numbers of one pool, taken from a
/// snapshot of the header bitmap.
pub struct BufferPoolIterator {
    bits: Vec<u8>,
    page_count: i32,
    next_page: PageNum,
}

impl Iterator for BufferPoolIterator {
    type Item = PageNum;

    fn next(&mut self) -> Option<PageNum> {
        while self.next_page < self.page_count {
            let page_num = self.next_page;
            self.next_page += 1;

            let index = page_num as usize;
            if self.bits[index / 8] & (1 << (index % 8)) != 0 {
                return Some(page_num);
            }
        }
        None
    }
}
