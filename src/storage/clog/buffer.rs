use std::collections::VecDeque;
use std::time::Duration;

use log::error;
use parking_lot::{Condvar, Mutex};

use crate::common::error::Result;
use crate::common::types::Lsn;
use crate::storage::clog::entry::{LogEntry, LogModule};
use crate::storage::clog::file::LogFileWriter;

/// Configuration for the in-memory log staging buffer
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Upper bound on buffered bytes; `append` blocks at this point
    pub max_bytes: usize,

    /// Fraction of `max_bytes` at which a flush is signalled
    pub flush_threshold: f32,

    /// Entries drained per flush round
    pub default_batch_size: usize,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            flush_threshold: 0.75,
            default_batch_size: 1024,
        }
    }
}

struct BufferInner {
    entries: VecDeque<LogEntry>,
    bytes: usize,
    current_lsn: Lsn,
    flushed_lsn: Lsn,
}

/// Bounded FIFO of log entries staged for disk write.
///
/// Appenders assign LSNs under the buffer lock, so entries enter the deque
/// in strictly increasing LSN order and are flushed in that same order.
/// Once `flushed_lsn() >= L`, the entry with LSN `L` is durably on disk.
pub struct LogBuffer {
    inner: Mutex<BufferInner>,
    /// Signalled when buffered bytes cross the flush threshold
    flush_cv: Condvar,
    /// Broadcast whenever a flush makes progress
    flushed_cv: Condvar,
    config: LogBufferConfig,
}

impl LogBuffer {
    pub fn new(config: LogBufferConfig) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                entries: VecDeque::new(),
                bytes: 0,
                current_lsn: 0,
                flushed_lsn: 0,
            }),
            flush_cv: Condvar::new(),
            flushed_cv: Condvar::new(),
            config,
        }
    }

    /// Seed the LSN counters, typically with the last LSN found on disk so
    /// that new appends continue the dense sequence.
    pub fn init(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        inner.current_lsn = lsn;
        inner.flushed_lsn = lsn;
    }

    /// Stage one entry, assigning it the next LSN. Blocks while the buffer
    /// holds `max_bytes` or more.
    pub fn append(&self, module: LogModule, data: Vec<u8>) -> Result<Lsn> {
        let mut entry = LogEntry::new(0, module, data)?;

        let mut inner = self.inner.lock();
        while inner.bytes >= self.config.max_bytes {
            self.flush_cv.notify_one();
            self.flushed_cv.wait(&mut inner);
        }

        inner.current_lsn += 1;
        let lsn = inner.current_lsn;
        entry.set_lsn(lsn);
        inner.bytes += entry.total_size();
        inner.entries.push_back(entry);

        if self.should_flush(&inner) {
            self.flush_cv.notify_one();
        }

        Ok(lsn)
    }

    /// Drain up to `batch_size` entries through `writer` in FIFO order.
    ///
    /// On a writer error the failing entry stays at the head of the deque
    /// and the error is returned; the next call retries from the same
    /// position.
    pub fn flush_batch(&self, writer: &mut LogFileWriter, batch_size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return Ok(());
        }

        let batch_size = batch_size.min(inner.entries.len());
        let mut written = 0;
        while written < batch_size {
            let Some(entry) = inner.entries.front() else {
                break;
            };

            if let Err(e) = writer.write(entry) {
                error!("failed to write log entry, lsn={}: {}", entry.lsn(), e);
                if written > 0 {
                    self.flushed_cv.notify_all();
                }
                return Err(e);
            }

            let entry = inner.entries.pop_front().unwrap();
            inner.bytes -= entry.total_size();
            inner.flushed_lsn = entry.lsn();
            written += 1;
        }

        if !inner.entries.is_empty() && self.should_flush(&inner) {
            self.flush_cv.notify_one();
        }
        self.flushed_cv.notify_all();

        Ok(())
    }

    /// Drain every staged entry through `writer`.
    pub fn flush(&self, writer: &mut LogFileWriter) -> Result<()> {
        loop {
            let pending = self.inner.lock().entries.len();
            if pending == 0 {
                return Ok(());
            }
            self.flush_batch(writer, pending)?;
        }
    }

    /// Block until `flushed_lsn >= lsn`.
    pub fn wait_lsn(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        while inner.flushed_lsn < lsn {
            self.flush_cv.notify_one();
            self.flushed_cv.wait(&mut inner);
        }
    }

    /// Park the flusher thread until a flush is signalled, an entry is
    /// pending, or `timeout` elapses.
    pub fn wait_flush_signal(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            self.flush_cv.wait_for(&mut inner, timeout);
        }
    }

    pub fn current_lsn(&self) -> Lsn {
        self.inner.lock().current_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.inner.lock().flushed_lsn
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().bytes >= self.config.max_bytes
    }

    fn should_flush(&self, inner: &BufferInner) -> bool {
        inner.bytes as f32 >= self.config.max_bytes as f32 * self.config.flush_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_writer(dir: &TempDir) -> LogFileWriter {
        let path = dir.path().join("clog_0.log");
        let mut writer = LogFileWriter::new();
        writer.open(&path, 1_000_000).unwrap();
        writer
    }

    #[test]
    fn test_append_assigns_dense_lsns() {
        let buffer = LogBuffer::new(LogBufferConfig::default());

        let a = buffer.append(LogModule::Transaction, b"a".to_vec()).unwrap();
        let b = buffer.append(LogModule::Transaction, b"bb".to_vec()).unwrap();
        let c = buffer.append(LogModule::BplusTree, b"ccc".to_vec()).unwrap();

        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.current_lsn(), 3);
        assert_eq!(buffer.flushed_lsn(), 0);
    }

    #[test]
    fn test_flush_batch_advances_flushed_lsn() {
        let dir = TempDir::new().unwrap();
        let mut writer = test_writer(&dir);
        let buffer = LogBuffer::new(LogBufferConfig::default());

        for _ in 0..5 {
            buffer.append(LogModule::BufferPool, b"payload".to_vec()).unwrap();
        }

        buffer.flush_batch(&mut writer, 3).unwrap();
        assert_eq!(buffer.flushed_lsn(), 3);
        assert_eq!(buffer.len(), 2);

        buffer.flush(&mut writer).unwrap();
        assert_eq!(buffer.flushed_lsn(), 5);
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
    }

    #[test]
    fn test_wait_lsn_returns_once_flushed() {
        let dir = TempDir::new().unwrap();
        let mut writer = test_writer(&dir);
        let buffer = LogBuffer::new(LogBufferConfig::default());

        let lsn = buffer.append(LogModule::Transaction, b"x".to_vec()).unwrap();
        buffer.flush(&mut writer).unwrap();
        buffer.wait_lsn(lsn);
        assert!(buffer.flushed_lsn() >= lsn);
    }

    #[test]
    fn test_init_seeds_counters() {
        let buffer = LogBuffer::new(LogBufferConfig::default());
        buffer.init(41);

        let lsn = buffer.append(LogModule::Transaction, b"x".to_vec()).unwrap();
        assert_eq!(lsn, 42);
        assert_eq!(buffer.flushed_lsn(), 41);
    }
}
