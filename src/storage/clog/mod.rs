pub mod buffer;
pub mod entry;
pub mod file;
pub mod handler;
pub mod replayer;

pub use buffer::{LogBuffer, LogBufferConfig};
pub use entry::{LogEntry, LogHeader, LogModule};
pub use file::{LogFileManager, LogFileReader, LogFileWriter};
pub use handler::{ClogConfig, LogHandler};
pub use replayer::LogReplayer;
