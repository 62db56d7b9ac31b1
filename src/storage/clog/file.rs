//! WAL file set: `clog_<start_lsn>.log` files tiling the LSN axis.
//!
//! Each file carries the contiguous range `[start_lsn, start_lsn +
//! max_entries_per_file)`. At most one file is open for append at a time.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::common::error::{DbError, Result};
use crate::common::io::{read_exact_retry, write_all_retry, ReadOutcome};
use crate::common::types::Lsn;
use crate::storage::clog::entry::{LogEntry, LogHeader, LogModule};

const CLOG_FILE_PREFIX: &str = "clog_";
const CLOG_FILE_SUFFIX: &str = ".log";

/// Append-only writer for one WAL file. Tracks the exclusive LSN upper
/// bound of the file; entries at or beyond it are rejected with `FileFull`.
pub struct LogFileWriter {
    file: Option<File>,
    path: PathBuf,
    last_lsn: Lsn,
    end_lsn: Lsn,
}

impl LogFileWriter {
    pub fn new() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
            last_lsn: 0,
            end_lsn: 0,
        }
    }

    pub fn open(&mut self, path: &Path, end_lsn: Lsn) -> Result<()> {
        if self.file.is_some() {
            warn!("log file {} already opened", self.path.display());
            return Err(DbError::FileOpened(self.path.display().to_string()));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                DbError::FileNotFound(format!("{}: {}", path.display(), e))
            })?;

        self.file = Some(file);
        self.path = path.to_path_buf();
        self.end_lsn = end_lsn;
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
        self.path.clear();
    }

    /// Append one entry: header then payload. A partial write surfaces as
    /// an error; there is no split-entry recovery.
    pub fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(DbError::FileNotOpen);
        };

        if entry.lsn() >= self.end_lsn {
            return Err(DbError::FileFull);
        }

        write_all_retry(file, &entry.header().to_bytes())?;
        write_all_retry(file, entry.payload())?;

        self.last_lsn = entry.lsn();
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_ref() {
            file.sync_data().map_err(DbError::IoWrite)?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// True when the next dense LSN would no longer fit in this file.
    pub fn is_full(&self) -> bool {
        self.last_lsn + 1 >= self.end_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for LogFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential reader over one WAL file.
pub struct LogFileReader {
    file: Option<File>,
    path: PathBuf,
}

impl LogFileReader {
    pub fn new() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
        }
    }

    pub fn open(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| {
            DbError::FileNotFound(format!("{}: {}", path.display(), e))
        })?;
        self.file = Some(file);
        self.path = path.to_path_buf();
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
        self.path.clear();
    }

    /// Decode entries with `lsn >= start_lsn` in file order and hand each to
    /// `callback`. A callback error aborts the iteration.
    pub fn iterate<F>(&mut self, mut callback: F, start_lsn: Lsn) -> Result<()>
    where
        F: FnMut(&LogEntry) -> Result<()>,
    {
        if self.file.is_none() {
            return Err(DbError::FileNotOpen);
        }

        self.go_to(start_lsn)?;

        let file = self.file.as_mut().unwrap();
        let mut header_buf = [0u8; LogHeader::HEAD_SIZE];
        loop {
            match read_exact_retry(file, &mut header_buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Complete => {}
            }

            let header = LogHeader::from_bytes(&header_buf);
            validate_header(&header, &self.path)?;

            let mut data = vec![0u8; header.data_size as usize];
            if read_exact_retry(file, &mut data)? == ReadOutcome::Eof {
                // A torn trailing entry: the process died mid-append. Replay
                // stops here; everything before it is consistent.
                warn!(
                    "log file {} ends with a truncated entry at lsn={}",
                    self.path.display(),
                    header.lsn
                );
                break;
            }

            let entry = LogEntry::new(header.lsn, LogModule::from(header.module_id), data)?;
            callback(&entry)?;
        }

        Ok(())
    }

    /// Position the cursor at the first entry with `lsn >= target`.
    fn go_to(&mut self, target: Lsn) -> Result<()> {
        let file = self.file.as_mut().ok_or(DbError::FileNotOpen)?;
        file.seek(SeekFrom::Start(0)).map_err(DbError::IoSeek)?;

        let mut header_buf = [0u8; LogHeader::HEAD_SIZE];
        loop {
            match read_exact_retry(file, &mut header_buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Complete => {}
            }

            let header = LogHeader::from_bytes(&header_buf);
            if header.lsn >= target {
                file.seek(SeekFrom::Current(-(LogHeader::HEAD_SIZE as i64)))
                    .map_err(DbError::IoSeek)?;
                break;
            }

            validate_header(&header, &self.path)?;
            file.seek(SeekFrom::Current(header.data_size as i64))
                .map_err(DbError::IoSeek)?;
        }

        Ok(())
    }
}

impl Default for LogFileReader {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_header(header: &LogHeader, path: &Path) -> Result<()> {
    if header.data_size < 0 || header.data_size as usize > LogEntry::max_payload_size() {
        return Err(DbError::IoRead(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "malformed log header in {}: {}",
                path.display(),
                header
            ),
        )));
    }
    Ok(())
}

/// Manager of the WAL directory: keeps the ordered `start_lsn -> path` map
/// and hands out writers for the newest file.
pub struct LogFileManager {
    dir: PathBuf,
    max_entries_per_file: Lsn,
    files: BTreeMap<Lsn, PathBuf>,
}

impl LogFileManager {
    pub fn init(dir: impl Into<PathBuf>, max_entries_per_file: Lsn) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .map_err(|e| DbError::FileCreateErr(format!("{}: {}", dir.display(), e)))?;
        }

        let mut files = BTreeMap::new();
        let entries = std::fs::read_dir(&dir).map_err(DbError::IoRead)?;
        for entry in entries {
            let entry = entry.map_err(DbError::IoRead)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(CLOG_FILE_PREFIX) || !name.ends_with(CLOG_FILE_SUFFIX) {
                continue;
            }

            match Self::lsn_from_filename(name) {
                Ok(lsn) => {
                    files.insert(lsn, path);
                }
                Err(_) => {
                    warn!("ignoring log file with invalid name: {}", name);
                }
            }
        }

        info!(
            "log file manager initialized, dir={}, files={}",
            dir.display(),
            files.len()
        );
        Ok(Self {
            dir,
            max_entries_per_file,
            files,
        })
    }

    /// Extract the start LSN from a `clog_<lsn>.log` file name.
    pub fn lsn_from_filename(filename: &str) -> Result<Lsn> {
        let stripped = filename
            .strip_prefix(CLOG_FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(CLOG_FILE_SUFFIX))
            .ok_or_else(|| DbError::FileNameInvalid(filename.to_string()))?;

        stripped
            .parse::<Lsn>()
            .map_err(|_| DbError::FileNameInvalid(filename.to_string()))
    }

    /// Paths of files whose start LSN is at or after `start_lsn`.
    pub fn list_files(&self, start_lsn: Lsn) -> Vec<PathBuf> {
        self.files.range(start_lsn..).map(|(_, p)| p.clone()).collect()
    }

    /// Files whose LSN range may still contain entries at or after
    /// `start_lsn`: every file starting after it, plus the last file
    /// starting at or before it.
    pub fn files_covering(&self, start_lsn: Lsn) -> Vec<(Lsn, PathBuf)> {
        let mut result: Vec<(Lsn, PathBuf)> = Vec::new();
        if let Some((&start, path)) = self.files.range(..=start_lsn).next_back() {
            result.push((start, path.clone()));
        }
        for (&start, path) in self.files.range(start_lsn + 1..) {
            result.push((start, path.clone()));
        }
        result
    }

    /// Open the file with the largest start LSN for append.
    pub fn last_file(&self, writer: &mut LogFileWriter) -> Result<()> {
        let (&start_lsn, path) = self
            .files
            .iter()
            .next_back()
            .ok_or_else(|| DbError::FileNotFound("no log files".to_string()))?;

        writer.open(path, start_lsn + self.max_entries_per_file)
    }

    /// Close the current writer and open a fresh file continuing the LSN
    /// tiling where the previous file's range ended.
    pub fn next_file(&mut self, writer: &mut LogFileWriter) -> Result<()> {
        writer.close();

        let next_lsn = self
            .files
            .keys()
            .next_back()
            .map(|&start| start + self.max_entries_per_file)
            .unwrap_or(0);

        let filename = format!("{}{}{}", CLOG_FILE_PREFIX, next_lsn, CLOG_FILE_SUFFIX);
        let path = self.dir.join(filename);
        writer.open(&path, next_lsn + self.max_entries_per_file)?;
        self.files.insert(next_lsn, path);
        Ok(())
    }

    /// Last LSN recorded on disk, scanning the newest file's headers.
    /// Returns 0 for an empty file set.
    pub fn last_lsn(&self) -> Result<Lsn> {
        let Some((&start_lsn, path)) = self.files.iter().next_back() else {
            return Ok(0);
        };

        // An empty newest file inherits the last LSN of its predecessor's
        // range: the roll only happens once the previous file is full.
        let mut last = start_lsn.saturating_sub(1);
        let mut reader = LogFileReader::new();
        reader.open(path)?;
        reader.iterate(
            |entry| {
                last = entry.lsn();
                Ok(())
            },
            0,
        )?;
        reader.close();
        Ok(last)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn max_entries_per_file(&self) -> Lsn {
        self.max_entries_per_file
    }
}
