//! Append-only operation log with crash-safe replay.
//!
//! Every stream and bucket persists its mutations as JSON Lines: one record per
//! line, each stamped with a monotonic sequence number. Complete lines are
//! always valid JSON, so a crash mid-write leaves at most one partial trailing
//! line, which replay truncates away.
//!
//! Logs grow until their owner decides enough records are dead, at which point
//! [`OpLog::rewrite`] replaces the file atomically with a compacted one.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::fsync::{fsync_file, write_atomic};

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// One line of the log.
///
/// The operation is flattened into the record, so an operation enum tagged
/// with `op` serializes as `{"seq":3,"ts":"...","op":"put",...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord<R> {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub op: R,
}

/// An append-only log of operations of type `R`.
pub struct OpLog<R> {
    file: File,
    path: PathBuf,
    next_seq: u64,
    /// Records currently in the file (replayed plus appended).
    records: u64,
    sync_writes: bool,
    _op: PhantomData<fn(R)>,
}

impl<R> std::fmt::Debug for OpLog<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLog")
            .field("path", &self.path)
            .field("next_seq", &self.next_seq)
            .field("records", &self.records)
            .finish()
    }
}

impl<R: Serialize + DeserializeOwned> OpLog<R> {
    /// Opens (or creates) a log and replays its valid prefix.
    ///
    /// Returns the log positioned for appending together with every record
    /// that survived replay, in order.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<(Self, Vec<LogRecord<R>>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (records, next_seq) = replay(&path)?;
        let file = open_append(&path)?;

        let log = OpLog {
            file,
            path,
            next_seq,
            records: records.len() as u64,
            sync_writes,
            _op: PhantomData,
        };
        Ok((log, records))
    }

    /// Appends an operation and returns the sequence number it was assigned.
    pub fn append(&mut self, op: &R) -> Result<u64> {
        let record = LogRecord {
            seq: self.next_seq,
            ts: Utc::now(),
            op,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;

        if self.sync_writes {
            fsync_file(&self.file)?;
        }

        self.next_seq += 1;
        self.records += 1;
        Ok(record.seq)
    }

    /// Replaces the whole log with `ops`, atomically.
    ///
    /// Sequence numbers keep counting from where the old log stopped, so
    /// records written after a rewrite are still strictly increasing.
    pub fn rewrite<'a>(&mut self, ops: impl IntoIterator<Item = &'a R>) -> Result<()>
    where
        R: 'a,
    {
        let mut contents = Vec::new();
        let mut seq = self.next_seq;
        let mut records = 0;
        for op in ops {
            let record = LogRecord {
                seq,
                ts: Utc::now(),
                op,
            };
            serde_json::to_writer(&mut contents, &record)?;
            contents.push(b'\n');
            seq += 1;
            records += 1;
        }

        write_atomic(&self.path, &contents)?;
        self.file = open_append(&self.path)?;
        self.next_seq = seq;
        self.records = records;
        Ok(())
    }
}

impl<R> OpLog<R> {
    /// Turns per-append fsync on or off.
    pub fn set_sync_writes(&mut self, sync_writes: bool) {
        self.sync_writes = sync_writes;
    }

    /// Forces an fsync of the log file.
    pub fn sync(&self) -> io::Result<()> {
        fsync_file(&self.file)
    }

    /// Number of records in the file.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
}

/// Replays a log file, truncating anything after the last valid record.
///
/// A line that fails to parse, or whose sequence number does not increase,
/// marks the end of the valid prefix. Returns the records and the next
/// sequence number to assign.
fn replay<R: DeserializeOwned>(path: &Path) -> Result<(Vec<LogRecord<R>>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();

    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    let mut max_seq: Option<u64> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            valid_len += bytes_read as u64;
            continue;
        }

        // A line without its newline was cut short by a crash, even if it parses.
        if !line.ends_with('\n') {
            break;
        }

        match serde_json::from_str::<LogRecord<R>>(trimmed) {
            Ok(record) => {
                if max_seq.is_some_and(|prev| record.seq <= prev) {
                    break;
                }
                max_seq = Some(record.seq);
                records.push(record);
                valid_len += bytes_read as u64;
            }
            Err(_) => break,
        }
    }

    if valid_len < file_len {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len)?;
        file.seek(io::SeekFrom::End(0))?;
        fsync_file(&file)?;
    }

    let next_seq = max_seq.map(|s| s + 1).unwrap_or(0);
    Ok((records, next_seq))
}
