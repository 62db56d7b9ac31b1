use byteorder::{ByteOrder, LittleEndian};

use crate::common::error::{DbError, Result};
use crate::common::types::Lsn;

/// Coarse tag on a log entry identifying the subsystem that owns and
/// replays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogModule {
    BufferPool,
    BplusTree,
    RecordManager,
    Transaction,
    /// A module id this build does not know; carried through so foreign
    /// entries survive replay unharmed.
    Other(i32),
}

impl LogModule {
    pub fn index(self) -> i32 {
        match self {
            LogModule::BufferPool => 0,
            LogModule::BplusTree => 1,
            LogModule::RecordManager => 2,
            LogModule::Transaction => 3,
            LogModule::Other(id) => id,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LogModule::BufferPool => "BUFFER_POOL",
            LogModule::BplusTree => "BPLUS_TREE",
            LogModule::RecordManager => "RECORD_MANAGER",
            LogModule::Transaction => "TRANSACTION",
            LogModule::Other(_) => "UNKNOWN",
        }
    }
}

impl From<i32> for LogModule {
    fn from(id: i32) -> Self {
        match id {
            0 => LogModule::BufferPool,
            1 => LogModule::BplusTree,
            2 => LogModule::RecordManager,
            3 => LogModule::Transaction,
            other => LogModule::Other(other),
        }
    }
}

/// Fixed log entry header: `lsn ‖ data_size ‖ module_id`, little-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogHeader {
    pub lsn: Lsn,
    pub data_size: i32,
    pub module_id: i32,
}

impl LogHeader {
    /// Serialized header size in bytes
    pub const HEAD_SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::HEAD_SIZE] {
        let mut bytes = [0u8; Self::HEAD_SIZE];
        LittleEndian::write_u64(&mut bytes[0..8], self.lsn);
        LittleEndian::write_i32(&mut bytes[8..12], self.data_size);
        LittleEndian::write_i32(&mut bytes[12..16], self.module_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            lsn: LittleEndian::read_u64(&bytes[0..8]),
            data_size: LittleEndian::read_i32(&bytes[8..12]),
            module_id: LittleEndian::read_i32(&bytes[12..16]),
        }
    }
}

impl std::fmt::Display for LogHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lsn={},size={},module_id={},module_name={}",
            self.lsn,
            self.data_size,
            self.module_id,
            LogModule::from(self.module_id).name()
        )
    }
}

/// One complete log record: fixed header plus opaque payload.
///
/// Entries are move-only; the payload buffer travels with the entry and the
/// encoded form is `header ‖ payload` with no padding or delimiter; the
/// header's `data_size` is self-delimiting.
#[derive(Debug)]
pub struct LogEntry {
    header: LogHeader,
    data: Vec<u8>,
}

impl LogEntry {
    /// Hard cap on an encoded entry (header + payload): 4 MiB
    pub const MAX_SIZE: usize = 4 * 1024 * 1024;

    pub fn max_payload_size() -> usize {
        Self::MAX_SIZE - LogHeader::HEAD_SIZE
    }

    pub fn new(lsn: Lsn, module: LogModule, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::max_payload_size() {
            return Err(DbError::MessageInvalid(format!(
                "log entry payload too large: {} bytes",
                data.len()
            )));
        }

        Ok(Self {
            header: LogHeader {
                lsn,
                data_size: data.len() as i32,
                module_id: module.index(),
            },
            data,
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.header.lsn = lsn;
    }

    pub fn module(&self) -> LogModule {
        LogModule::from(self.header.module_id)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn payload_size(&self) -> usize {
        self.data.len()
    }

    /// Encoded size including the header
    pub fn total_size(&self) -> usize {
        LogHeader::HEAD_SIZE + self.data.len()
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},data_len={}", self.header, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_construction() {
        let entry = LogEntry::new(7, LogModule::Transaction, b"abc".to_vec()).unwrap();
        assert_eq!(entry.lsn(), 7);
        assert_eq!(entry.module(), LogModule::Transaction);
        assert_eq!(entry.payload(), b"abc");
        assert_eq!(entry.total_size(), LogHeader::HEAD_SIZE + 3);
    }

    #[test]
    fn test_payload_size_limit() {
        let max = LogEntry::max_payload_size();
        assert!(LogEntry::new(1, LogModule::BufferPool, vec![0u8; max]).is_ok());
        assert!(matches!(
            LogEntry::new(1, LogModule::BufferPool, vec![0u8; max + 1]),
            Err(DbError::MessageInvalid(_))
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let header = LogHeader {
            lsn: 0xABCDEF,
            data_size: 1234,
            module_id: LogModule::BplusTree.index(),
        };
        assert_eq!(LogHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn test_module_ids() {
        assert_eq!(LogModule::BufferPool.index(), 0);
        assert_eq!(LogModule::BplusTree.index(), 1);
        assert_eq!(LogModule::RecordManager.index(), 2);
        assert_eq!(LogModule::Transaction.index(), 3);
        assert_eq!(LogModule::from(2), LogModule::RecordManager);
        assert_eq!(LogModule::from(42), LogModule::Other(42));
    }
}
