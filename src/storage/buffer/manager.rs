//! Owner of the storage core: the shared frame manager, the double-write
//! buffer, the log handler and every open pool live here, and the manager
//! hands out non-owning handles between them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::info;
use parking_lot::Mutex;

use crate::common::error::{DbError, Result};
use crate::common::types::PoolId;
use crate::storage::buffer::double_write::{DiskDoubleWriteBuffer, DoubleWriteBuffer};
use crate::storage::buffer::frame::Frame;
use crate::storage::buffer::frame_manager::FrameManager;
use crate::storage::buffer::pool::BufferPool;
use crate::storage::buffer::pool_log::BufferPoolLogReplayer;
use crate::storage::clog::LogHandler;

/// Manager of all buffer pools of one database.
pub struct BufferPoolManager {
    self_weak: Weak<BufferPoolManager>,
    frame_manager: Arc<FrameManager>,
    dblwr: Arc<DoubleWriteBuffer>,
    log_handler: Arc<LogHandler>,
    pools: Mutex<HashMap<String, Arc<BufferPool>>>,
    id_to_pool: Mutex<HashMap<PoolId, Arc<BufferPool>>>,
    next_pool_id: AtomicI32,
}

impl BufferPoolManager {
    /// Build a manager with a vacuous double-write buffer. Page flushes go
    /// straight to their destination; intended for tests and read-only use.
    pub fn new(frame_capacity: usize, log_handler: LogHandler) -> Result<Arc<Self>> {
        Self::build(frame_capacity, log_handler, None)
    }

    /// Build a manager whose flushes stage through the disk double-write
    /// buffer at `dblwr_path`.
    pub fn with_double_write(
        frame_capacity: usize,
        log_handler: LogHandler,
        dblwr_path: &Path,
    ) -> Result<Arc<Self>> {
        Self::build(frame_capacity, log_handler, Some(dblwr_path))
    }

    fn build(
        frame_capacity: usize,
        log_handler: LogHandler,
        dblwr_path: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let frame_manager = Arc::new(FrameManager::new(frame_capacity)?);
        let log_handler = Arc::new(log_handler);

        let manager = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            self_weak: weak.clone(),
            frame_manager,
            dblwr: Arc::new(match dblwr_path {
                Some(_) => DoubleWriteBuffer::disk(
                    weak.clone(),
                    DiskDoubleWriteBuffer::DEFAULT_MAX_PAGES,
                ),
                None => DoubleWriteBuffer::vacuous(),
            }),
            log_handler,
            pools: Mutex::new(HashMap::new()),
            id_to_pool: Mutex::new(HashMap::new()),
            next_pool_id: AtomicI32::new(1),
        });

        if let Some(path) = dblwr_path {
            manager.dblwr.open_file(path)?;
        }
        Ok(manager)
    }

    /// Open (creating if absent) the pool file at `path`.
    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<Arc<BufferPool>> {
        let path = path.as_ref();
        let key = path.display().to_string();
        if self.pools.lock().contains_key(&key) {
            return Err(DbError::BufferPoolOpened);
        }

        let manager = self
            .self_weak
            .upgrade()
            .ok_or_else(|| DbError::Internal("buffer pool manager gone".to_string()))?;
        let pool = BufferPool::open(
            &manager,
            self.frame_manager.clone(),
            self.dblwr.clone(),
            self.log_handler.clone(),
            path,
        )?;

        {
            let mut pools = self.pools.lock();
            if pools.contains_key(&key) {
                drop(pools);
                pool.close()?;
                return Err(DbError::BufferPoolOpened);
            }
            pools.insert(key.clone(), pool.clone());
        }
        self.id_to_pool.lock().insert(pool.id(), pool.clone());
        info!("opened buffer pool file {}, buffer_pool_id={}", key, pool.id());
        Ok(pool)
    }

    /// Flush and close the pool file at `path`.
    pub fn close_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = path.as_ref().display().to_string();
        let pool = self
            .pools
            .lock()
            .get(&key)
            .cloned()
            .ok_or(DbError::FileNotOpen)?;

        // The pool stays registered while it closes: the double-write
        // flush inside `close` still routes destination writes by pool id.
        let result = pool.close();
        self.pools.lock().remove(&key);
        self.id_to_pool.lock().remove(&pool.id());
        result
    }

    pub fn get_buffer_pool(&self, buffer_pool_id: PoolId) -> Option<Arc<BufferPool>> {
        self.id_to_pool.lock().get(&buffer_pool_id).cloned()
    }

    /// Write back one frame through its owning pool; the eviction hook
    /// handed to the frame manager.
    pub fn flush_frame(&self, frame: &Arc<Frame>) -> Result<()> {
        let pool = self.get_buffer_pool(frame.buffer_pool_id()).ok_or_else(|| {
            DbError::Internal(format!("no pool for frame, frame_id={}", frame.frame_id()))
        })?;
        pool.flush_page_internal(frame)
    }

    /// Flush every pool, then complete the double-write cycle.
    pub fn flush_all(&self) -> Result<()> {
        let pools: Vec<Arc<BufferPool>> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.flush_all_pages()?;
        }
        self.dblwr.flush_pages()
    }

    /// Crash recovery: restore torn pages from the double-write buffer,
    /// then redo buffer-pool log entries. Pool files must be opened first.
    pub fn recover(self: &Arc<Self>) -> Result<()> {
        self.dblwr.recover()?;

        let replayer = BufferPoolLogReplayer::new(self.clone());
        self.log_handler.replay(&replayer, 0)
    }

    /// Clean shutdown: flush all pools, close them, and stop the log
    /// handler after it drains.
    pub fn shutdown(&self) -> Result<()> {
        let keys: Vec<String> = self.pools.lock().keys().cloned().collect();
        for key in keys {
            self.close_file(&key)?;
        }
        self.log_handler.stop()
    }

    pub fn log_handler(&self) -> &Arc<LogHandler> {
        &self.log_handler
    }

    pub fn frame_manager(&self) -> &Arc<FrameManager> {
        &self.frame_manager
    }

    pub fn double_write_buffer(&self) -> &Arc<DoubleWriteBuffer> {
        &self.dblwr
    }

    pub(crate) fn allocate_pool_id(&self) -> PoolId {
        self.next_pool_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Keep the id counter ahead of every id observed in opened files.
    pub(crate) fn note_pool_id(&self, buffer_pool_id: PoolId) {
        self.next_pool_id
            .fetch_max(buffer_pool_id + 1, Ordering::SeqCst);
    }
}
