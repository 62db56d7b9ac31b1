// Export public modules
pub mod common;
pub mod storage;

// Re-export key items for convenient access
pub use common::error::{DbError, Result};
pub use storage::buffer::{BufferPool, BufferPoolManager, FrameManager};
pub use storage::clog::{ClogConfig, LogHandler, LogModule, LogReplayer};
