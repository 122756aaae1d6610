use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::record::{RecordError, SnapshotRecord};

/// A snapshot could not be read.
///
/// Format problems are reported as [`SnapshotReaderError::Record`], distinct from plain
/// I/O failure: they mean the file is corrupt, not that it is temporarily unavailable.
#[derive(Debug, Error)]
pub enum SnapshotReaderError {
    #[error("I/O error reading snapshot {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bad record in snapshot {path:?} at line {line}: {source}")]
    Record {
        path: PathBuf,
        line: u64,
        #[source]
        source: RecordError,
    },
}

/// Sequential reader over one snapshot generation.
#[derive(Debug)]
pub struct SnapshotReader {
    generation: u64,
    path: PathBuf,
    input: BufReader<File>,
    buf: Vec<u8>,
    line: u64,
    records_read: u64,
}

impl SnapshotReader {
    pub fn open(path: impl AsRef<Path>, generation: u64) -> Result<Self, SnapshotReaderError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| SnapshotReaderError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            generation,
            path,
            input: BufReader::with_capacity(64 * 1024, file),
            buf: Vec::new(),
            line: 0,
            records_read: 0,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records returned by [`read`](Self::read) or passed over by
    /// [`skip_records`](Self::skip_records).
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// The next record, or `None` at end of file.
    pub fn read(&mut self) -> Result<Option<SnapshotRecord>, SnapshotReaderError> {
        loop {
            self.buf.clear();
            let n = self
                .input
                .read_until(b'\n', &mut self.buf)
                .map_err(|source| SnapshotReaderError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.line += 1;

            let record = match std::str::from_utf8(&self.buf) {
                Ok(text) => {
                    let text = text.trim_end_matches(['\n', '\r']);
                    if text.trim().is_empty() {
                        continue;
                    }
                    SnapshotRecord::from_line(text)
                }
                Err(err) => Err(RecordError::NotUtf8(err)),
            };
            let record = record.map_err(|source| SnapshotReaderError::Record {
                path: self.path.clone(),
                line: self.line,
                source,
            })?;
            self.records_read += 1;
            return Ok(Some(record));
        }
    }

    /// Pass over up to `count` records, returning how many were actually there.
    pub fn skip_records(&mut self, count: u64) -> Result<u64, SnapshotReaderError> {
        let mut skipped = 0;
        while skipped < count && self.read()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }
}

impl Iterator for SnapshotReader {
    type Item = Result<SnapshotRecord, SnapshotReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}
