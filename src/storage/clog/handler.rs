//! Log handler: the write surface of the WAL.
//!
//! The disk handler owns the staging buffer, the file set and a background
//! group-commit thread. Appenders stage entries and return immediately with
//! an assigned LSN; the flush thread drains batches to the current file,
//! rolling to the next `clog_` file when the LSN range fills up.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info};
use parking_lot::Mutex;

use crate::common::error::{DbError, Result};
use crate::common::types::Lsn;
use crate::storage::clog::buffer::{LogBuffer, LogBufferConfig};
use crate::storage::clog::entry::{LogEntry, LogModule};
use crate::storage::clog::file::{LogFileManager, LogFileReader, LogFileWriter};
use crate::storage::clog::replayer::LogReplayer;

/// Configuration for the WAL subsystem
#[derive(Debug, Clone)]
pub struct ClogConfig {
    /// LSN range width of each `clog_<start_lsn>.log` file
    pub max_entries_per_file: Lsn,

    /// Staging buffer tuning
    pub buffer: LogBufferConfig,

    /// Sync file data after each drained batch
    pub force_sync: bool,
}

impl Default for ClogConfig {
    fn default() -> Self {
        Self {
            max_entries_per_file: 100_000,
            buffer: LogBufferConfig::default(),
            force_sync: true,
        }
    }
}

/// Tagged log handler: the production disk-backed variant or the vacuous
/// one used by tests and read-only modes, chosen at construction.
pub enum LogHandler {
    Disk(Arc<DiskLogHandler>),
    /// Accepts every operation and records nothing; append returns LSN 0.
    Vacuous,
}

impl LogHandler {
    pub fn disk(dir: impl AsRef<Path>, config: ClogConfig) -> Result<Self> {
        Ok(LogHandler::Disk(Arc::new(DiskLogHandler::open(
            dir.as_ref(),
            config,
        )?)))
    }

    pub fn vacuous() -> Self {
        LogHandler::Vacuous
    }

    /// Start the background flush thread.
    pub fn start(&self) -> Result<()> {
        match self {
            LogHandler::Disk(handler) => handler.clone().start(),
            LogHandler::Vacuous => Ok(()),
        }
    }

    /// Stop the flush thread, draining every staged entry first.
    pub fn stop(&self) -> Result<()> {
        match self {
            LogHandler::Disk(handler) => handler.stop(),
            LogHandler::Vacuous => Ok(()),
        }
    }

    /// Stage one record and return its LSN.
    pub fn append(&self, module: LogModule, data: Vec<u8>) -> Result<Lsn> {
        match self {
            LogHandler::Disk(handler) => handler.buffer.append(module, data),
            LogHandler::Vacuous => Ok(0),
        }
    }

    /// Block until the entry with `lsn` is durably on disk. Without a
    /// running flush thread the drain happens inline on the caller.
    pub fn wait_lsn(&self, lsn: Lsn) -> Result<()> {
        match self {
            LogHandler::Disk(handler) => {
                if !handler.running.load(Ordering::SeqCst) {
                    handler.flush_pending()?;
                }
                handler.buffer.wait_lsn(lsn);
                Ok(())
            }
            LogHandler::Vacuous => Ok(()),
        }
    }

    pub fn current_lsn(&self) -> Lsn {
        match self {
            LogHandler::Disk(handler) => handler.buffer.current_lsn(),
            LogHandler::Vacuous => 0,
        }
    }

    pub fn flushed_lsn(&self) -> Lsn {
        match self {
            LogHandler::Disk(handler) => handler.buffer.flushed_lsn(),
            LogHandler::Vacuous => 0,
        }
    }

    /// Synchronously drain every staged entry to disk.
    pub fn flush(&self) -> Result<()> {
        match self {
            LogHandler::Disk(handler) => handler.flush_pending(),
            LogHandler::Vacuous => Ok(()),
        }
    }

    /// Walk on-disk entries with `lsn >= start_lsn` in LSN order.
    pub fn iterate<F>(&self, consumer: F, start_lsn: Lsn) -> Result<()>
    where
        F: FnMut(&LogEntry) -> Result<()>,
    {
        match self {
            LogHandler::Disk(handler) => handler.iterate(consumer, start_lsn),
            LogHandler::Vacuous => Ok(()),
        }
    }

    /// Feed on-disk entries with `lsn >= start_lsn` to `replayer`, then run
    /// its completion hook.
    pub fn replay(&self, replayer: &dyn LogReplayer, start_lsn: Lsn) -> Result<()> {
        match self {
            LogHandler::Disk(handler) => {
                handler.iterate(|entry| replayer.replay(entry), start_lsn)?;
                replayer.on_done()
            }
            LogHandler::Vacuous => Ok(()),
        }
    }
}

/// Disk-backed log handler.
pub struct DiskLogHandler {
    buffer: LogBuffer,
    files: Mutex<LogFileManager>,
    writer: Mutex<LogFileWriter>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    config: ClogConfig,
}

impl DiskLogHandler {
    fn open(dir: &Path, config: ClogConfig) -> Result<Self> {
        let mut files = LogFileManager::init(dir, config.max_entries_per_file)?;

        // Continue the dense LSN sequence from whatever is on disk.
        let last_lsn = files.last_lsn()?;
        let buffer = LogBuffer::new(config.buffer.clone());
        buffer.init(last_lsn);

        let mut writer = LogFileWriter::new();
        if files.file_count() == 0 {
            files.next_file(&mut writer)?;
        } else {
            files.last_file(&mut writer)?;
        }

        info!(
            "log handler opened, dir={}, last_lsn={}",
            dir.display(),
            last_lsn
        );

        Ok(Self {
            buffer,
            files: Mutex::new(files),
            writer: Mutex::new(writer),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            config,
        })
    }

    fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // The thread only holds a weak handle so an abandoned handler can
        // still be dropped; the loop exits once the last owner is gone.
        let weak = Arc::downgrade(&self);
        let handle = std::thread::Builder::new()
            .name("clog-flush".to_string())
            .spawn(move || loop {
                let Some(handler) = weak.upgrade() else {
                    break;
                };
                if !handler.running.load(Ordering::SeqCst) {
                    if let Err(e) = handler.flush_pending() {
                        error!("final log drain failed: {}", e);
                    }
                    break;
                }
                if let Err(e) = handler.flush_pending() {
                    error!("log flush failed: {}", e);
                }
                handler.buffer.wait_flush_signal(Duration::from_millis(50));
            })
            .map_err(|e| DbError::Internal(format!("failed to spawn flush thread: {}", e)))?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| DbError::Internal("flush thread panicked".to_string()))?;
        }

        // Drain anything staged after the thread exited.
        self.flush_pending()
    }

    /// Drain staged batches until the buffer is empty, rolling the file
    /// when the current one's LSN range fills up.
    fn flush_pending(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        loop {
            if self.buffer.is_empty() {
                return Ok(());
            }

            match self
                .buffer
                .flush_batch(&mut writer, self.config.buffer.default_batch_size)
            {
                Ok(()) => {
                    if self.config.force_sync {
                        writer.sync()?;
                    }
                }
                Err(DbError::FileFull) => {
                    self.files.lock().next_file(&mut writer)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn iterate<F>(&self, mut consumer: F, start_lsn: Lsn) -> Result<()>
    where
        F: FnMut(&LogEntry) -> Result<()>,
    {
        let covering = self.files.lock().files_covering(start_lsn);

        for (_, path) in covering {
            let mut reader = LogFileReader::new();
            reader.open(&path)?;
            reader.iterate(&mut consumer, start_lsn)?;
            reader.close();
        }
        Ok(())
    }
}

impl Drop for DiskLogHandler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Detach rather than join: this drop may run on the flush thread
        // itself when it held the last strong handle.
        drop(self.thread.lock().take());
        if let Err(e) = self.flush_pending() {
            error!("final log drain failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vacuous_handler_is_inert() {
        let handler = LogHandler::vacuous();
        assert_eq!(
            handler.append(LogModule::BufferPool, b"x".to_vec()).unwrap(),
            0
        );
        assert_eq!(handler.current_lsn(), 0);
        handler.wait_lsn(100).unwrap();
        handler.stop().unwrap();
    }

    #[test]
    fn test_append_and_flush() {
        let dir = TempDir::new().unwrap();
        let handler = LogHandler::disk(dir.path(), ClogConfig::default()).unwrap();

        let a = handler.append(LogModule::Transaction, b"a".to_vec()).unwrap();
        let b = handler.append(LogModule::Transaction, b"bb".to_vec()).unwrap();
        assert_eq!((a, b), (1, 2));

        handler.flush().unwrap();
        assert_eq!(handler.flushed_lsn(), 2);
        handler.wait_lsn(b).unwrap();
    }

    #[test]
    fn test_restart_continues_lsn_sequence() {
        let dir = TempDir::new().unwrap();

        {
            let handler = LogHandler::disk(dir.path(), ClogConfig::default()).unwrap();
            for _ in 0..5 {
                handler.append(LogModule::BufferPool, b"op".to_vec()).unwrap();
            }
            handler.flush().unwrap();
        }

        let handler = LogHandler::disk(dir.path(), ClogConfig::default()).unwrap();
        assert_eq!(handler.current_lsn(), 5);
        let next = handler.append(LogModule::BufferPool, b"op".to_vec()).unwrap();
        assert_eq!(next, 6);
    }

    #[test]
    fn test_background_thread_flushes() {
        let dir = TempDir::new().unwrap();
        let handler = LogHandler::disk(dir.path(), ClogConfig::default()).unwrap();
        handler.start().unwrap();

        let lsn = handler
            .append(LogModule::RecordManager, b"record".to_vec())
            .unwrap();
        handler.wait_lsn(lsn).unwrap();
        assert!(handler.flushed_lsn() >= lsn);

        handler.stop().unwrap();
    }
}
