use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::record::SnapshotRecord;

#[derive(Debug, Error)]
pub enum SnapshotWriterError {
    #[error("I/O error writing snapshot {generation}: {source}")]
    Io {
        generation: u64,
        #[source]
        source: io::Error,
    },

    #[error("snapshot {generation}: record {path:?} does not sort after {previous:?}")]
    OutOfOrder {
        generation: u64,
        path: String,
        previous: String,
    },

    #[error("snapshot {generation}: failed to encode record {path:?}: {source}")]
    Encode {
        generation: u64,
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SnapshotWriterError {
    /// Whether the underlying storage failed, as opposed to the records being invalid.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Appends records to a new generation.
///
/// The data goes to `snap.<N>.partial` until [`close`](Self::close) syncs it and renames
/// it into place. Dropping the writer leaves the partial file behind, exactly as a crash
/// would; [`abandon`](Self::abandon) removes it.
#[derive(Debug)]
pub struct SnapshotWriter {
    generation: u64,
    partial_path: PathBuf,
    final_path: PathBuf,
    out: BufWriter<File>,
    records: u64,
    last_path: Option<String>,
    fail_after: Option<u64>,
    fail_close: bool,
}

impl SnapshotWriter {
    pub(crate) fn create(
        partial_path: PathBuf,
        final_path: PathBuf,
        generation: u64,
        fail_after: Option<u64>,
        fail_close: bool,
    ) -> Result<Self, SnapshotWriterError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial_path)
            .map_err(|source| SnapshotWriterError::Io { generation, source })?;
        debug!(generation, path = ?partial_path, "Opened snapshot writer");
        Ok(Self {
            generation,
            partial_path,
            final_path,
            out: BufWriter::with_capacity(64 * 1024, file),
            records: 0,
            last_path: None,
            fail_after,
            fail_close,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn last_path(&self) -> Option<&str> {
        self.last_path.as_deref()
    }

    pub fn write(&mut self, record: &SnapshotRecord) -> Result<(), SnapshotWriterError> {
        if let Some(previous) = &self.last_path
            && record.path.as_str() <= previous.as_str()
        {
            return Err(SnapshotWriterError::OutOfOrder {
                generation: self.generation,
                path: record.path.clone(),
                previous: previous.clone(),
            });
        }

        if self.fail_after.is_some_and(|limit| self.records >= limit) {
            return Err(self.io_error(io::Error::new(
                io::ErrorKind::StorageFull,
                "injected write failure",
            )));
        }

        let line = record
            .to_line()
            .map_err(|source| SnapshotWriterError::Encode {
                generation: self.generation,
                path: record.path.clone(),
                source,
            })?;
        self.out
            .write_all(line.as_bytes())
            .and_then(|()| self.out.write_all(b"\n"))
            .map_err(|err| self.io_error(err))?;

        self.records += 1;
        self.last_path = Some(record.path.clone());
        Ok(())
    }

    /// Push buffered records to the file so a recovering reader can see them.
    pub fn flush(&mut self) -> Result<(), SnapshotWriterError> {
        self.out.flush().map_err(|err| self.io_error(err))
    }

    /// Make the generation durable and visible as complete. Returns the record count.
    pub fn close(mut self) -> Result<u64, SnapshotWriterError> {
        self.out.flush().map_err(|err| self.io_error(err))?;
        if self.fail_close {
            return Err(self.io_error(io::Error::new(
                io::ErrorKind::StorageFull,
                "injected close failure",
            )));
        }
        self.out
            .get_ref()
            .sync_all()
            .map_err(|err| self.io_error(err))?;
        fs::rename(&self.partial_path, &self.final_path).map_err(|err| self.io_error(err))?;
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir).map_err(|err| self.io_error(err))?;
        }
        debug!(
            generation = self.generation,
            records = self.records,
            "Closed snapshot"
        );
        Ok(self.records)
    }

    /// Throw the generation away.
    pub fn abandon(self) {
        let Self {
            generation,
            partial_path,
            out,
            ..
        } = self;
        drop(out);
        if let Err(err) = fs::remove_file(&partial_path) {
            warn!(generation, path = ?partial_path, %err, "Failed to remove abandoned snapshot");
        } else {
            debug!(generation, "Abandoned snapshot");
        }
    }

    fn io_error(&self, source: io::Error) -> SnapshotWriterError {
        SnapshotWriterError::Io {
            generation: self.generation,
            source,
        }
    }
}

/// Make renames and removals inside `dir` durable. A no-op where directories cannot be
/// synced.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
