pub mod double_write;
pub mod frame;
pub mod frame_manager;
pub mod lru;
pub mod manager;
pub mod pool;
pub mod pool_log;

pub use double_write::{DiskDoubleWriteBuffer, DoubleWriteBuffer};
pub use frame::{Frame, FrameId};
pub use frame_manager::FrameManager;
pub use manager::BufferPoolManager;
pub use pool::{BufferPool, BufferPoolIterator, MAX_PAGE_NUM};
pub use pool_log::{
    BufferPoolLogEntry, BufferPoolLogHandler, BufferPoolLogReplayer, BufferPoolOperation,
};
