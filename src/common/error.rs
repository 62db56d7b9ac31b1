use std::io;
use thiserror::Error;

use crate::common::types::PageNum;

/// Error codes surfaced by the storage core.
///
/// Success is `Ok(())`; every failure is one of these expressive codes,
/// propagated through return values rather than panics. Invariant
/// violations that imply memory corruption (e.g. freeing a frame that is
/// still pinned elsewhere) are asserts, not errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already opened: {0}")]
    FileOpened(String),

    #[error("file not open")]
    FileNotOpen,

    #[error("file is full")]
    FileFull,

    #[error("invalid file name: {0}")]
    FileNameInvalid(String),

    #[error("failed to create file: {0}")]
    FileCreateErr(String),

    #[error("file corrupted: {0}")]
    FileCorrupted(String),

    #[error("read I/O error: {0}")]
    IoRead(#[source] io::Error),

    #[error("write I/O error: {0}")]
    IoWrite(#[source] io::Error),

    #[error("seek I/O error: {0}")]
    IoSeek(#[source] io::Error),

    #[error("buffer pool is full")]
    BufferPoolFull,

    #[error("page {0} not found")]
    PageNotFound(PageNum),

    #[error("page {0} cannot be unpinned")]
    PageUnpinError(PageNum),

    #[error("invalid page number {0}")]
    InvalidPageNum(PageNum),

    #[error("buffer pool already opened")]
    BufferPoolOpened,

    #[error("frame pool is not initialized")]
    NoMemPool,

    #[error("message invalid: {0}")]
    MessageInvalid(String),
}

/// Result type used throughout the storage core
pub type Result<T> = std::result::Result<T, DbError>;
