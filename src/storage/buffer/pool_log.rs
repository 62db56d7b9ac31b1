//! WAL records owned by the buffer pool: page allocation and disposal.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::error::{DbError, Result};
use crate::common::types::{Lsn, PageNum, PoolId};
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::clog::{LogEntry, LogHandler, LogModule, LogReplayer};
use crate::storage::page::Page;

/// Operations the buffer pool writes ahead to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPoolOperation {
    Allocate,
    Deallocate,
}

impl BufferPoolOperation {
    pub fn type_id(self) -> i32 {
        match self {
            BufferPoolOperation::Allocate => 0,
            BufferPoolOperation::Deallocate => 1,
        }
    }

    pub fn from_type_id(type_id: i32) -> Result<Self> {
        match type_id {
            0 => Ok(BufferPoolOperation::Allocate),
            1 => Ok(BufferPoolOperation::Deallocate),
            other => Err(DbError::MessageInvalid(format!(
                "unknown buffer pool operation {}",
                other
            ))),
        }
    }
}

/// Payload of a BUFFER_POOL log entry, packed little-endian (12 bytes).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferPoolLogEntry {
    pub buffer_pool_id: PoolId,
    pub operation_type: i32,
    pub page_num: PageNum,
}

impl BufferPoolLogEntry {
    pub fn new(buffer_pool_id: PoolId, operation: BufferPoolOperation, page_num: PageNum) -> Self {
        Self {
            buffer_pool_id,
            operation_type: operation.type_id(),
            page_num,
        }
    }

    pub fn operation(&self) -> Result<BufferPoolOperation> {
        BufferPoolOperation::from_type_id(self.operation_type)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| DbError::Internal(format!("failed to encode buffer pool log entry: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| DbError::MessageInvalid(format!("bad buffer pool log entry: {}", e)))
    }
}

/// Per-pool façade over the shared log handler.
pub struct BufferPoolLogHandler {
    buffer_pool_id: PoolId,
    log_handler: Arc<LogHandler>,
}

impl BufferPoolLogHandler {
    pub fn new(buffer_pool_id: PoolId, log_handler: Arc<LogHandler>) -> Self {
        Self {
            buffer_pool_id,
            log_handler,
        }
    }

    /// Log a page allocation; returns the LSN to stamp on the header page.
    pub fn allocate_page(&self, page_num: PageNum) -> Result<Lsn> {
        self.append_log(BufferPoolOperation::Allocate, page_num)
    }

    /// Log a page disposal; returns the LSN to stamp on the header page.
    pub fn deallocate_page(&self, page_num: PageNum) -> Result<Lsn> {
        self.append_log(BufferPoolOperation::Deallocate, page_num)
    }

    /// Before a page image reaches disk, the log must already cover its
    /// LSN; a page flushed ahead of its log cannot be reconciled at
    /// restart.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        self.log_handler.wait_lsn(page.header.lsn)
    }

    fn append_log(&self, operation: BufferPoolOperation, page_num: PageNum) -> Result<Lsn> {
        let entry = BufferPoolLogEntry::new(self.buffer_pool_id, operation, page_num);
        self.log_handler
            .append(LogModule::BufferPool, entry.encode()?)
    }
}

/// Replays BUFFER_POOL log entries against the open pools during recovery.
pub struct BufferPoolLogReplayer {
    manager: Arc<BufferPoolManager>,
}

impl BufferPoolLogReplayer {
    pub fn new(manager: Arc<BufferPoolManager>) -> Self {
        Self { manager }
    }
}

impl LogReplayer for BufferPoolLogReplayer {
    fn replay(&self, entry: &LogEntry) -> Result<()> {
        if entry.module() != LogModule::BufferPool {
            return Ok(());
        }

        let record = BufferPoolLogEntry::decode(entry.payload())?;
        let Some(pool) = self.manager.get_buffer_pool(record.buffer_pool_id) else {
            warn!(
                "skipping replay for pool that is not open, buffer_pool_id={}, page_num={}",
                record.buffer_pool_id, record.page_num
            );
            return Ok(());
        };

        match record.operation()? {
            BufferPoolOperation::Allocate => pool.redo_allocate_page(entry.lsn(), record.page_num),
            BufferPoolOperation::Deallocate => {
                pool.redo_deallocate_page(entry.lsn(), record.page_num)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_packed_encoding() {
        let entry = BufferPoolLogEntry::new(3, BufferPoolOperation::Deallocate, 17);
        let bytes = entry.encode().unwrap();

        // {i32 pool_id, i32 operation, i32 page_num}, little-endian
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &3i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &17i32.to_le_bytes());

        assert_eq!(BufferPoolLogEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let entry = BufferPoolLogEntry {
            buffer_pool_id: 1,
            operation_type: 9,
            page_num: 2,
        };
        assert!(matches!(entry.operation(), Err(DbError::MessageInvalid(_))));
    }
}
