//! Double-write buffer: staging area that makes destination page writes
//! atomic against torn writes.
//!
//! Every flushed page is first written to a slot in the staging file. Once
//! a batch is staged, the file is synced and the pages go to their final
//! locations; a crash between those two steps leaves a valid copy in the
//! staging file for recovery to apply.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Weak;

use byteorder::{ByteOrder, LittleEndian};
use log::{info, trace, warn};
use parking_lot::Mutex;

use crate::common::error::{DbError, Result};
use crate::common::io::{read_exact_at, write_all_at, ReadOutcome};
use crate::common::types::{PageNum, PoolId, PAGE_SIZE};
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::buffer::pool::BufferPool;
use crate::storage::page::{crc32, Page};

/// Staging file header: just the slot count
const DWB_HEADER_SIZE: usize = 4;

/// One slot: `{buffer_pool_id, page_num, page_index, valid, page image}`
const DWB_RECORD_SIZE: usize = 13 + PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DoubleWritePageKey {
    buffer_pool_id: PoolId,
    page_num: PageNum,
}

struct DoubleWritePage {
    key: DoubleWritePageKey,
    page_index: i32,
    valid: bool,
    page: Box<Page>,
}

impl DoubleWritePage {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; DWB_RECORD_SIZE];
        LittleEndian::write_i32(&mut bytes[0..4], self.key.buffer_pool_id);
        LittleEndian::write_i32(&mut bytes[4..8], self.key.page_num);
        LittleEndian::write_i32(&mut bytes[8..12], self.page_index);
        bytes[12] = self.valid as u8;
        self.page
            .write_to((&mut bytes[13..13 + PAGE_SIZE]).try_into().unwrap());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let page_bytes: &[u8; PAGE_SIZE] = bytes[13..13 + PAGE_SIZE].try_into().unwrap();
        Self {
            key: DoubleWritePageKey {
                buffer_pool_id: LittleEndian::read_i32(&bytes[0..4]),
                page_num: LittleEndian::read_i32(&bytes[4..8]),
            },
            page_index: LittleEndian::read_i32(&bytes[8..12]),
            valid: bytes[12] != 0,
            page: Box::new(Page::from_bytes(page_bytes)),
        }
    }

    fn slot_offset(&self) -> u64 {
        DWB_HEADER_SIZE as u64 + self.page_index as u64 * DWB_RECORD_SIZE as u64
    }
}

/// Tagged double-write buffer: the disk-backed production variant or the
/// vacuous one that writes pages straight through (tests, read-only modes).
pub enum DoubleWriteBuffer {
    Disk(DiskDoubleWriteBuffer),
    Vacuous,
}

impl DoubleWriteBuffer {
    pub fn disk(manager: Weak<BufferPoolManager>, max_pages: usize) -> Self {
        DoubleWriteBuffer::Disk(DiskDoubleWriteBuffer::new(manager, max_pages))
    }

    pub fn vacuous() -> Self {
        DoubleWriteBuffer::Vacuous
    }

    pub fn open_file(&self, path: &Path) -> Result<()> {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.open_file(path),
            DoubleWriteBuffer::Vacuous => Ok(()),
        }
    }

    /// Stage one page on its way to the destination file. The vacuous
    /// variant writes it to the destination immediately.
    pub fn add_page(&self, pool: &BufferPool, page_num: PageNum, page: &Page) -> Result<()> {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.add_page(pool.id(), page_num, page),
            DoubleWriteBuffer::Vacuous => pool.write_page(page_num, page),
        }
    }

    /// Authoritative staged copy of a page, if one exists.
    pub fn read_page(&self, buffer_pool_id: PoolId, page_num: PageNum) -> Option<Page> {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.read_page(buffer_pool_id, page_num),
            DoubleWriteBuffer::Vacuous => None,
        }
    }

    /// Drop staged entries belonging to one pool, marking their slots
    /// invalid on disk. Used when a pool closes.
    pub fn clear_pages(&self, pool: &BufferPool) -> Result<()> {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.clear_pages(pool.id()),
            DoubleWriteBuffer::Vacuous => Ok(()),
        }
    }

    /// Complete the current staging cycle: sync, write every staged page to
    /// its destination, invalidate the slots and reset the header.
    pub fn flush_pages(&self) -> Result<()> {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.flush_pages(),
            DoubleWriteBuffer::Vacuous => Ok(()),
        }
    }

    /// Startup recovery: copy staged pages over destinations whose on-disk
    /// image is torn. Runs before WAL replay.
    pub fn recover(&self) -> Result<()> {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.recover(),
            DoubleWriteBuffer::Vacuous => Ok(()),
        }
    }

    /// Pages currently staged (always 0 for the vacuous variant).
    pub fn staged_pages(&self) -> usize {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.staged_pages(),
            DoubleWriteBuffer::Vacuous => 0,
        }
    }

    /// Slot count recorded in the on-disk header (0 for the vacuous
    /// variant).
    pub fn header_page_cnt(&self) -> i32 {
        match self {
            DoubleWriteBuffer::Disk(dwb) => dwb.header_page_cnt(),
            DoubleWriteBuffer::Vacuous => 0,
        }
    }
}

struct DwbInner {
    file: Option<File>,
    /// Slot count recorded in the on-disk header
    page_cnt: i32,
    pages: HashMap<DoubleWritePageKey, DoubleWritePage>,
}

/// Disk-backed double-write buffer.
pub struct DiskDoubleWriteBuffer {
    manager: Weak<BufferPoolManager>,
    max_pages: usize,
    inner: Mutex<DwbInner>,
}

impl DiskDoubleWriteBuffer {
    pub const DEFAULT_MAX_PAGES: usize = 16;

    fn new(manager: Weak<BufferPoolManager>, max_pages: usize) -> Self {
        Self {
            manager,
            max_pages,
            inner: Mutex::new(DwbInner {
                file: None,
                page_cnt: 0,
                pages: HashMap::new(),
            }),
        }
    }

    fn open_file(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_some() {
            return Err(DbError::BufferPoolOpened);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| DbError::FileCreateErr(format!("{}: {}", path.display(), e)))?;

        inner.file = Some(file);
        self.load_pages(&mut inner)?;
        Ok(())
    }

    /// Scan the staging file left over from the previous run. Slots whose
    /// payload checksum does not match are discarded; slots already marked
    /// invalid finished their cycle and carry no recovery obligation.
    fn load_pages(&self, inner: &mut DwbInner) -> Result<()> {
        let file = inner.file.as_ref().ok_or(DbError::FileNotOpen)?;

        let mut header_buf = [0u8; DWB_HEADER_SIZE];
        let page_cnt = match read_exact_at(file, &mut header_buf, 0)? {
            ReadOutcome::Eof => 0,
            ReadOutcome::Complete => LittleEndian::read_i32(&header_buf),
        };

        let mut record_buf = vec![0u8; DWB_RECORD_SIZE];
        for index in 0..page_cnt {
            let offset = DWB_HEADER_SIZE as u64 + index as u64 * DWB_RECORD_SIZE as u64;
            if read_exact_at(file, &mut record_buf, offset)? == ReadOutcome::Eof {
                warn!("double write buffer file truncated at slot {}", index);
                break;
            }

            let record = DoubleWritePage::from_bytes(&record_buf);
            if !record.valid {
                trace!("skipping invalidated double write slot {}", index);
                continue;
            }

            if crc32(&record.page.data) == record.page.header.check_sum {
                inner.pages.insert(record.key, record);
            } else {
                trace!(
                    "discarding double write slot {} with invalid checksum",
                    index
                );
            }
        }

        inner.page_cnt = page_cnt;
        info!(
            "double write buffer loaded, staged pages={}",
            inner.pages.len()
        );
        Ok(())
    }

    fn add_page(&self, buffer_pool_id: PoolId, page_num: PageNum, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(DbError::FileNotOpen);
        }

        let key = DoubleWritePageKey {
            buffer_pool_id,
            page_num,
        };

        if let Some(existing) = inner.pages.get_mut(&key) {
            *existing.page = page.clone();
            existing.valid = true;
            let bytes = existing.to_bytes();
            let offset = existing.slot_offset();
            trace!(
                "updated staged page, buffer_pool_id={}, page_num={}, lsn={}",
                buffer_pool_id,
                page_num,
                page.header.lsn
            );
            let file = inner.file.as_ref().unwrap();
            return write_all_at(file, &bytes, offset);
        }

        let page_index = inner.pages.len() as i32;

        // A slot beyond the recorded count grows the header first, so a
        // crash can never leave a staged slot the header does not cover.
        if page_index + 1 > inner.page_cnt {
            inner.page_cnt = page_index + 1;
            Self::write_header(&mut inner)?;
        }

        let record = DoubleWritePage {
            key,
            page_index,
            valid: true,
            page: Box::new(page.clone()),
        };
        let bytes = record.to_bytes();
        let offset = record.slot_offset();
        write_all_at(inner.file.as_ref().unwrap(), &bytes, offset)?;
        inner.pages.insert(key, record);
        trace!(
            "staged page, buffer_pool_id={}, page_num={}, lsn={}, staged={}",
            buffer_pool_id,
            page_num,
            page.header.lsn,
            inner.pages.len()
        );

        if inner.pages.len() >= self.max_pages {
            self.flush_pages_locked(&mut inner)?;
        }
        Ok(())
    }

    fn read_page(&self, buffer_pool_id: PoolId, page_num: PageNum) -> Option<Page> {
        let key = DoubleWritePageKey {
            buffer_pool_id,
            page_num,
        };
        let inner = self.inner.lock();
        inner.pages.get(&key).map(|record| (*record.page).clone())
    }

    fn clear_pages(&self, buffer_pool_id: PoolId) -> Result<()> {
        let mut inner = self.inner.lock();

        let keys: Vec<DoubleWritePageKey> = inner
            .pages
            .keys()
            .filter(|key| key.buffer_pool_id == buffer_pool_id)
            .copied()
            .collect();

        for key in keys {
            let mut record = inner.pages.remove(&key).unwrap();
            record.valid = false;
            let bytes = record.to_bytes();
            let offset = record.slot_offset();
            write_all_at(inner.file.as_ref().ok_or(DbError::FileNotOpen)?, &bytes, offset)?;
        }
        Ok(())
    }

    fn flush_pages(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(DbError::FileNotOpen);
        }
        self.flush_pages_locked(&mut inner)
    }

    /// The staged batch becomes durable, then lands at its destinations.
    /// Slot invalidation happens only after a destination write succeeds,
    /// and the header reset only after every slot is done; recovery can
    /// therefore trust whatever it finds.
    fn flush_pages_locked(&self, inner: &mut DwbInner) -> Result<()> {
        if inner.pages.is_empty() && inner.page_cnt == 0 {
            return Ok(());
        }

        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| DbError::Internal("buffer pool manager gone".to_string()))?;

        inner
            .file
            .as_ref()
            .ok_or(DbError::FileNotOpen)?
            .sync_data()
            .map_err(DbError::IoWrite)?;

        let keys: Vec<DoubleWritePageKey> = inner.pages.keys().copied().collect();
        for key in keys {
            let Some(pool) = manager.get_buffer_pool(key.buffer_pool_id) else {
                warn!(
                    "no open pool for staged page, buffer_pool_id={}, page_num={}",
                    key.buffer_pool_id, key.page_num
                );
                continue;
            };

            let mut record = inner.pages.remove(&key).unwrap();
            pool.write_page(key.page_num, &record.page)?;

            record.valid = false;
            let bytes = record.to_bytes();
            let offset = record.slot_offset();
            write_all_at(inner.file.as_ref().unwrap(), &bytes, offset)?;
        }

        inner.page_cnt = 0;
        Self::write_header(inner)?;
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.pages.is_empty() {
            return Ok(());
        }

        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| DbError::Internal("buffer pool manager gone".to_string()))?;

        let mut restored = 0;
        for (key, record) in inner.pages.iter() {
            let Some(pool) = manager.get_buffer_pool(key.buffer_pool_id) else {
                warn!(
                    "staged page for a pool that is not open, buffer_pool_id={}, page_num={}",
                    key.buffer_pool_id, key.page_num
                );
                continue;
            };

            if !pool.page_intact_on_disk(key.page_num)? {
                info!(
                    "restoring torn page from double write buffer, buffer_pool_id={}, page_num={}, lsn={}",
                    key.buffer_pool_id,
                    key.page_num,
                    record.page.header.lsn
                );
                pool.write_page(key.page_num, &record.page)?;
                restored += 1;
            }
        }

        info!("double write recovery done, pages restored={}", restored);
        Ok(())
    }

    fn write_header(inner: &mut DwbInner) -> Result<()> {
        let mut header_buf = [0u8; DWB_HEADER_SIZE];
        LittleEndian::write_i32(&mut header_buf, inner.page_cnt);
        write_all_at(
            inner.file.as_ref().ok_or(DbError::FileNotOpen)?,
            &header_buf,
            0,
        )
    }

    /// Slot count recorded in the on-disk header, for tests and tooling.
    pub fn header_page_cnt(&self) -> i32 {
        self.inner.lock().page_cnt
    }

    /// Number of pages currently staged in memory
    pub fn staged_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }
}
