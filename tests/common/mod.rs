use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use tarndb::storage::clog::{ClogConfig, LogHandler};
use tarndb::BufferPoolManager;

// Manager with a vacuous log handler and direct page writes; enough for
// pure buffer pool tests.
#[allow(dead_code)]
pub fn create_test_manager(frame_capacity: usize) -> Result<(Arc<BufferPoolManager>, TempDir)> {
    let dir = TempDir::new()?;
    let manager = BufferPoolManager::new(frame_capacity, LogHandler::vacuous())?;
    Ok((manager, dir))
}

// Manager with the full stack: disk WAL under `<dir>/clog` and the
// double-write staging file at `<dir>/dblwr.db`.
#[allow(dead_code)]
pub fn create_durable_manager(
    dir: &TempDir,
    frame_capacity: usize,
    clog_config: ClogConfig,
) -> Result<Arc<BufferPoolManager>> {
    let log_handler = LogHandler::disk(dir.path().join("clog"), clog_config)?;
    let manager = BufferPoolManager::with_double_write(
        frame_capacity,
        log_handler,
        &dir.path().join("dblwr.db"),
    )?;
    Ok(manager)
}

#[allow(dead_code)]
pub fn pool_file_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}
