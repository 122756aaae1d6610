//! Numbered snapshot generations on disk.
//!
//! A store is a directory holding `snap.<N>` files (complete generations) and at most a
//! few `snap.<N>.partial` files (generations being written, or left behind by a crash).
//! Generation numbers only ever grow: a new writer is numbered past every generation
//! present, partial or not.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checkpoint::MonitorCheckpoint;
use crate::event::Shutdown;

mod reader;
mod writer;

pub use reader::{SnapshotReader, SnapshotReaderError};
pub use writer::{SnapshotWriter, SnapshotWriterError};
pub use writer::sync_dir;

const PREFIX: &str = "snap.";
const PARTIAL_SUFFIX: &str = ".partial";

/// Complete generations that are always retained.
const RETAINED: usize = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on snapshot store {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Reader(#[from] SnapshotReaderError),

    #[error(transparent)]
    Writer(#[from] SnapshotWriterError),

    #[error("no complete snapshot in {dir:?}")]
    NoSnapshot { dir: PathBuf },

    #[error("snapshot generation {generation} is missing")]
    MissingGeneration { generation: u64 },

    #[error("snapshot generation {generation} has {found} records, checkpoint needs {expected}")]
    Truncated {
        generation: u64,
        expected: u64,
        found: u64,
    },

    #[error("interrupted")]
    Interrupted,
}

/// One generation file found in the store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
    pub generation: u64,
    pub complete: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    fail_writes_after: Option<u64>,
    fail_next_close: Arc<AtomicBool>,
}

impl SnapshotStore {
    /// Open (creating if needed) a store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            fail_writes_after: None,
            fail_next_close: Arc::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fault injection: writers opened from now on fail once they hold `records` records.
    pub fn fail_writes_after(&mut self, records: Option<u64>) {
        self.fail_writes_after = records;
    }

    /// Fault injection: the next writer opened fails when it is closed.
    pub fn fail_next_close(&self) {
        self.fail_next_close.store(true, Ordering::SeqCst);
    }

    /// Every generation file, sorted by generation.
    pub fn generations(&self) -> Result<Vec<GenerationInfo>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| self.io_error(source))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| self.io_error(source))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(name = ?entry.file_name(), "Ignoring non-UTF-8 file in snapshot store");
                continue;
            };
            match parse_name(name) {
                Some((generation, complete)) => found.push(GenerationInfo {
                    generation,
                    complete,
                    path: entry.path(),
                }),
                None => debug!(name, "Ignoring unrelated file in snapshot store"),
            }
        }
        found.sort_by_key(|info| (info.generation, info.complete));
        Ok(found)
    }

    fn complete_generations(&self) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .generations()?
            .into_iter()
            .filter(|info| info.complete)
            .map(|info| info.generation)
            .collect())
    }

    pub fn most_recent_generation(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.complete_generations()?.last().copied())
    }

    /// The highest complete generation strictly below `generation`.
    pub fn previous_generation(&self, generation: u64) -> Result<Option<u64>, StoreError> {
        Ok(self
            .complete_generations()?
            .into_iter()
            .rev()
            .find(|&g| g < generation))
    }

    pub fn open_new_snapshot_writer(&self) -> Result<SnapshotWriter, StoreError> {
        let next = self
            .generations()?
            .last()
            .map_or(1, |info| info.generation + 1);
        Ok(SnapshotWriter::create(
            self.partial_path(next),
            self.complete_path(next),
            next,
            self.fail_writes_after,
            self.fail_next_close.swap(false, Ordering::SeqCst),
        )?)
    }

    pub fn open_most_recent_snapshot(&self) -> Result<SnapshotReader, StoreError> {
        let generation = self
            .most_recent_generation()?
            .ok_or_else(|| StoreError::NoSnapshot {
                dir: self.dir.clone(),
            })?;
        self.open_snapshot(generation)
    }

    /// Open a complete generation.
    pub fn open_snapshot(&self, generation: u64) -> Result<SnapshotReader, StoreError> {
        let path = self.complete_path(generation);
        if !path.exists() {
            return Err(StoreError::MissingGeneration { generation });
        }
        Ok(SnapshotReader::open(path, generation)?)
    }

    /// Open a generation whether or not it was completed.
    fn open_any(&self, generation: u64) -> Result<SnapshotReader, StoreError> {
        let complete = self.complete_path(generation);
        let partial = self.partial_path(generation);
        let path = if complete.exists() {
            complete
        } else if partial.exists() {
            partial
        } else {
            return Err(StoreError::MissingGeneration { generation });
        };
        Ok(SnapshotReader::open(path, generation)?)
    }

    /// Garbage-collect generations no longer needed.
    ///
    /// The two most recent complete generations are kept, as is every generation at or
    /// above `watermark`. Partial generations older than the most recent complete one
    /// are removed under the same watermark rule. Returns how many files were deleted.
    pub fn delete_old_snapshots(&self, watermark: Option<u64>) -> Result<usize, StoreError> {
        let generations = self.generations()?;
        let complete: Vec<u64> = generations
            .iter()
            .filter(|info| info.complete)
            .map(|info| info.generation)
            .collect();
        let Some(&newest) = complete.last() else {
            return Ok(0);
        };
        let oldest_retained = complete
            .len()
            .checked_sub(RETAINED)
            .map_or(0, |idx| complete[idx]);
        let keep_from = watermark.map_or(oldest_retained, |w| w.min(oldest_retained));

        let mut deleted = 0;
        for info in generations {
            let stale = if info.complete {
                info.generation < keep_from
            } else {
                info.generation < newest && info.generation < keep_from
            };
            if stale {
                self.remove(&info)?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(deleted, keep_from, "Deleted old snapshots");
        }
        Ok(deleted)
    }

    /// Remove every partial generation except `keep`.
    pub fn discard_incomplete(&self, keep: Option<u64>) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for info in self.generations()? {
            if !info.complete && Some(info.generation) != keep {
                self.remove(&info)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove one generation, complete or partial. Returns whether anything was removed.
    pub fn delete_generation(&self, generation: u64) -> Result<bool, StoreError> {
        let mut deleted = false;
        for info in self.generations()? {
            if info.generation == generation {
                self.remove(&info)?;
                deleted = true;
            }
        }
        Ok(deleted)
    }

    /// Remove every generation.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let generations = self.generations()?;
        for info in &generations {
            self.remove(info)?;
        }
        Ok(generations.len())
    }

    /// Rebuild the state a consumer had been told about at `checkpoint`.
    ///
    /// Takes the first `offset_current` records of the checkpoint's generation (complete
    /// or partial) followed by the records of its previous generation from
    /// `offset_previous` onwards, and writes them as a new complete generation whose
    /// number is returned. The inputs are left untouched. When `shutdown` fires the
    /// half-written output is removed and [`StoreError::Interrupted`] returned.
    pub fn stitch(
        &self,
        checkpoint: &MonitorCheckpoint,
        shutdown: &Shutdown,
    ) -> Result<u64, StoreError> {
        let mut prefix = self.open_any(checkpoint.generation)?;
        let previous = match self.previous_generation(checkpoint.generation)? {
            Some(generation) => Some(self.open_snapshot(generation)?),
            None if checkpoint.offset_previous == 0 => None,
            None => {
                return Err(StoreError::MissingGeneration {
                    generation: checkpoint.generation.saturating_sub(1),
                });
            }
        };

        let mut writer = self.open_new_snapshot_writer()?;
        let output = writer.generation();
        info!(
            %checkpoint,
            output,
            previous = previous.as_ref().map(SnapshotReader::generation),
            "Stitching snapshot"
        );

        match copy_stitched(&mut writer, &mut prefix, previous, checkpoint, shutdown) {
            Ok(()) => {
                let records = writer.close()?;
                info!(output, records, "Stitched snapshot");
                Ok(output)
            }
            Err(err) => {
                warn!(output, %err, "Stitch failed, discarding output");
                writer.abandon();
                Err(err)
            }
        }
    }

    fn remove(&self, info: &GenerationInfo) -> Result<(), StoreError> {
        match fs::remove_file(&info.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: info.path.clone(),
                source,
            }),
        }
    }

    fn complete_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{generation}"))
    }

    fn partial_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{generation}{PARTIAL_SUFFIX}"))
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.dir.clone(),
            source,
        }
    }
}

fn copy_stitched(
    writer: &mut SnapshotWriter,
    prefix: &mut SnapshotReader,
    previous: Option<SnapshotReader>,
    checkpoint: &MonitorCheckpoint,
    shutdown: &Shutdown,
) -> Result<(), StoreError> {
    for copied in 0..checkpoint.offset_current {
        if shutdown.is_triggered() {
            return Err(StoreError::Interrupted);
        }
        let Some(record) = prefix.read()? else {
            return Err(StoreError::Truncated {
                generation: checkpoint.generation,
                expected: checkpoint.offset_current,
                found: copied,
            });
        };
        writer.write(&record)?;
    }

    let Some(mut previous) = previous else {
        return Ok(());
    };
    let skipped = previous.skip_records(checkpoint.offset_previous)?;
    if skipped < checkpoint.offset_previous {
        return Err(StoreError::Truncated {
            generation: previous.generation(),
            expected: checkpoint.offset_previous,
            found: skipped,
        });
    }
    while let Some(record) = previous.read()? {
        if shutdown.is_triggered() {
            return Err(StoreError::Interrupted);
        }
        writer.write(&record)?;
    }
    Ok(())
}

fn parse_name(name: &str) -> Option<(u64, bool)> {
    let rest = name.strip_prefix(PREFIX)?;
    let (digits, complete) = match rest.strip_suffix(PARTIAL_SUFFIX) {
        Some(digits) => (digits, false),
        None => (rest, true),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, complete))
}
