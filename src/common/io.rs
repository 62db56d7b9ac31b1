//! Reliable file I/O helpers.
//!
//! Positioned reads and writes loop until the full count is transferred,
//! treating `Interrupted` (EINTR) and `WouldBlock` (EAGAIN) as retry. These
//! helpers block and must only be called from threads that may block on a
//! syscall. EOF on read is a distinguished outcome rather than an error, so
//! sequential readers can detect end-of-file cleanly.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;

use crate::common::error::{DbError, Result};

/// Outcome of a full-count read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole buffer was filled.
    Complete,
    /// End of file before any byte of the request was read.
    Eof,
}

/// Write the whole buffer at `offset`, retrying interrupted writes.
pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        match file.write_at(buf, offset) {
            Ok(0) => {
                return Err(DbError::IoWrite(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                )))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if retryable(&e) => continue,
            Err(e) => return Err(DbError::IoWrite(e)),
        }
    }
    Ok(())
}

/// Fill the whole buffer from `offset`. A clean EOF at the very start of the
/// request yields `ReadOutcome::Eof`; EOF in the middle of the request is a
/// short read and therefore an error.
pub fn read_exact_at(file: &File, buf: &mut [u8], mut offset: u64) -> Result<ReadOutcome> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(DbError::IoRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read: wanted {} bytes, got {}", buf.len(), filled),
                )));
            }
            Ok(n) => {
                filled += n;
                offset += n as u64;
            }
            Err(e) if retryable(&e) => continue,
            Err(e) => return Err(DbError::IoRead(e)),
        }
    }
    Ok(ReadOutcome::Complete)
}

/// Streaming variant of [`write_all_at`] for append-mode writers that track
/// position in the `File` cursor.
pub fn write_all_retry(file: &mut File, mut buf: &[u8]) -> Result<()> {
    use std::io::Write;
    while !buf.is_empty() {
        match file.write(buf) {
            Ok(0) => {
                return Err(DbError::IoWrite(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if retryable(&e) => continue,
            Err(e) => return Err(DbError::IoWrite(e)),
        }
    }
    Ok(())
}

/// Streaming variant of [`read_exact_at`] for sequential readers that track
/// position in the `File` cursor.
pub fn read_exact_retry(file: &mut File, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(DbError::IoRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read: wanted {} bytes, got {}", buf.len(), filled),
                )));
            }
            Ok(n) => filled += n,
            Err(e) if retryable(&e) => continue,
            Err(e) => return Err(DbError::IoRead(e)),
        }
    }
    Ok(ReadOutcome::Complete)
}

fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    #[test]
    fn test_write_then_read_at() {
        let file = tempfile::tempfile().unwrap();
        write_all_at(&file, b"hello world", 100).unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(
            read_exact_at(&file, &mut buf, 100).unwrap(),
            ReadOutcome::Complete
        );
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_eof_at_end() {
        let file = tempfile::tempfile().unwrap();
        write_all_at(&file, b"abc", 0).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(read_exact_at(&file, &mut buf, 3).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn test_short_read_is_error() {
        let file = tempfile::tempfile().unwrap();
        write_all_at(&file, b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            read_exact_at(&file, &mut buf, 0),
            Err(DbError::IoRead(_))
        ));
    }

    #[test]
    fn test_streaming_read() {
        let mut file = tempfile::tempfile().unwrap();
        write_all_at(&file, b"abcdef", 0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(
            read_exact_retry(&mut file, &mut buf).unwrap(),
            ReadOutcome::Complete
        );
        assert_eq!(&buf, b"abc");
        assert_eq!(
            read_exact_retry(&mut file, &mut buf).unwrap(),
            ReadOutcome::Complete
        );
        assert_eq!(&buf, b"def");
        assert_eq!(read_exact_retry(&mut file, &mut buf).unwrap(), ReadOutcome::Eof);
    }
}
