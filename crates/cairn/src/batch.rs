//! Replayable, checkpoint-addressed batches over a [`ChangeSource`].
//!
//! The consumer asks for a batch by presenting the checkpoint of the last change it
//! durably processed. Each batch is written to a recovery file before it is returned,
//! so a batch handed out just before a crash can be handed out again afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::change::{Change, ChangeSource};
use crate::checkpoint::MonitorCheckpoint;

mod recovery;

use recovery::{ReadFailure, RecoveryFile, RecoveryState};

/// The consumer-facing resume token.
///
/// Totally ordered, and round-trips through its string form `"<major>.<minor>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FileConnectorCheckpoint {
    major: u64,
    minor: u64,
}

impl FileConnectorCheckpoint {
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1)
    }
}

impl fmt::Display for FileConnectorCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid checkpoint {0:?}")]
pub struct ParseCheckpointError(String);

impl FromStr for FileConnectorCheckpoint {
    type Err = ParseCheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseCheckpointError(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        let number = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        };
        Ok(Self::new(number(major)?, number(minor)?))
    }
}

impl From<FileConnectorCheckpoint> for String {
    fn from(checkpoint: FileConnectorCheckpoint) -> Self {
        checkpoint.to_string()
    }
}

impl TryFrom<String> for FileConnectorCheckpoint {
    type Error = ParseCheckpointError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A change and the checkpoint to present once it has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAndChange {
    pub checkpoint: FileConnectorCheckpoint,
    pub change: Change,
}

#[derive(Debug, Error)]
pub enum CheckpointQueueError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("too many recovery files: {}", files.join(", "))]
    TooManyRecoveryFiles { files: Vec<String> },

    #[error("invalid recovery filename {name:?}")]
    InvalidRecoveryFilename { name: String },

    #[error("incomplete recovery file {name:?}: {reason}")]
    IncompleteRecoveryFile { name: String, reason: String },

    #[error("failed to encode recovery state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("checkpoint {checkpoint} was never issued")]
    UnknownCheckpoint { checkpoint: FileConnectorCheckpoint },

    #[error("checkpoint queue was not started")]
    NotStarted,
}

#[derive(Debug, Default)]
struct BatchState {
    resume_from: Option<FileConnectorCheckpoint>,
    batch: Vec<CheckpointAndChange>,
    last_major: u64,
    monitor_points: BTreeMap<String, MonitorCheckpoint>,
    /// Restored from disk and not handed out since.
    recovered: bool,
    file: Option<RecoveryFile>,
}

impl BatchState {
    fn final_checkpoint(&self) -> Option<FileConnectorCheckpoint> {
        self.batch.last().map(|entry| entry.checkpoint)
    }

    fn to_recovery(&self) -> RecoveryState {
        RecoveryState {
            version: recovery::VERSION,
            resume_from: self.resume_from,
            batch: self.batch.clone(),
            last_major: self.last_major,
            monitor_points: self.monitor_points.clone(),
        }
    }

    fn from_recovery(state: RecoveryState, file: RecoveryFile) -> Self {
        Self {
            resume_from: state.resume_from,
            batch: state.batch,
            last_major: state.last_major,
            monitor_points: state.monitor_points,
            recovered: true,
            file: Some(file),
        }
    }
}

/// Wraps a [`ChangeSource`] with crash-safe, replayable batches.
///
/// Single writer: one instance per persistence directory at a time.
pub struct CheckpointAndChangeQueue<S> {
    source: S,
    dir: PathBuf,
    max_batch: usize,
    state: Option<BatchState>,
}

impl<S: ChangeSource> CheckpointAndChangeQueue<S> {
    pub fn new(source: S, dir: impl Into<PathBuf>, max_batch: usize) -> Self {
        Self {
            source,
            dir: dir.into(),
            max_batch: max_batch.max(1),
            state: None,
        }
    }

    pub fn set_maximum_queue_size(&mut self, max_batch: usize) {
        self.max_batch = max_batch.max(1);
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Prepare to serve a consumer resuming at `checkpoint`, or from the beginning.
    ///
    /// Starting from the beginning discards any recovery state. Otherwise the recovery
    /// files are resolved: none means a clean start, one is restored, two means a crash
    /// while switching batches (the newer wins if it is complete). Anything else fails.
    pub fn start(
        &mut self,
        checkpoint: Option<FileConnectorCheckpoint>,
    ) -> Result<(), CheckpointQueueError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| CheckpointQueueError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let files = recovery::list(&self.dir)?;

        let Some(checkpoint) = checkpoint else {
            for file in &files {
                recovery::remove(file)?;
            }
            info!(removed = files.len(), "Starting from the beginning");
            self.state = Some(BatchState::default());
            return Ok(());
        };

        let state = match files.as_slice() {
            [] => {
                warn!(%checkpoint, "No recovery state, continuing after checkpoint");
                BatchState {
                    resume_from: Some(checkpoint),
                    last_major: checkpoint.major,
                    ..BatchState::default()
                }
            }
            [only] => match recovery::read(only) {
                Ok(state) => BatchState::from_recovery(state, only.clone()),
                Err(failure) => return Err(incomplete(only, failure)),
            },
            [older, newer] => match recovery::read(newer) {
                Ok(state) => {
                    recovery::remove(older)?;
                    BatchState::from_recovery(state, newer.clone())
                }
                Err(failure) => {
                    warn!(name = %newer.name(), ?failure, "Discarding unfinished recovery file");
                    let state =
                        recovery::read(older).map_err(|failure| incomplete(older, failure))?;
                    recovery::remove(newer)?;
                    BatchState::from_recovery(state, older.clone())
                }
            },
            _ => {
                return Err(CheckpointQueueError::TooManyRecoveryFiles {
                    files: files.iter().map(RecoveryFile::name).collect(),
                });
            }
        };

        info!(
            %checkpoint,
            batch = state.batch.len(),
            resume_from = ?state.resume_from.map(|c| c.to_string()),
            "Restored recovery state"
        );
        self.state = Some(state);
        Ok(())
    }

    /// The batch to process after `checkpoint`.
    ///
    /// Presenting the same checkpoint again returns the same batch. Presenting a
    /// checkpoint from the middle of the last batch returns the rest of that batch,
    /// topped up with new changes. Never blocks: the batch may be short or empty.
    pub fn resume(
        &mut self,
        checkpoint: Option<FileConnectorCheckpoint>,
    ) -> Result<Vec<CheckpointAndChange>, CheckpointQueueError> {
        let state = self.state.as_mut().ok_or(CheckpointQueueError::NotStarted)?;

        if let Some(checkpoint) = checkpoint
            && checkpoint.major > state.last_major
        {
            return Err(CheckpointQueueError::UnknownCheckpoint { checkpoint });
        }

        if checkpoint == state.resume_from && !state.batch.is_empty() {
            debug!(?checkpoint, "Replaying batch");
            state.recovered = false;
            return Ok(state.batch.clone());
        }

        let final_checkpoint = state.final_checkpoint();
        if state.recovered && checkpoint.is_some() && checkpoint == final_checkpoint {
            // After a crash the final checkpoint does not prove the batch was processed
            info!(?checkpoint, "Re-delivering recovered batch");
            state.recovered = false;
            return Ok(state.batch.clone());
        }

        if let Some(checkpoint) = checkpoint
            && let Some(pos) = state
                .batch
                .iter()
                .position(|entry| entry.checkpoint == checkpoint)
            && pos + 1 < state.batch.len()
        {
            let remainder = state.batch[pos + 1..].to_vec();
            debug!(%checkpoint, remaining = remainder.len(), "Resuming inside batch");
            return self.issue(Some(checkpoint), remainder);
        }

        let fresh = match (checkpoint, final_checkpoint) {
            (_, None) => true,
            (Some(checkpoint), Some(last)) => checkpoint >= last,
            (None, Some(_)) => false,
        };
        if fresh {
            return self.issue(checkpoint, Vec::new());
        }

        warn!(
            ?checkpoint,
            resume_from = ?state.resume_from,
            "Checkpoint is older than the current batch, returning it unchanged"
        );
        Ok(state.batch.clone())
    }

    /// Per monitor, the checkpoint of the newest change written to a recovery file.
    ///
    /// A monitor resumed from its point neither loses nor repeats changes.
    pub fn monitor_restart_points(&self) -> BTreeMap<String, MonitorCheckpoint> {
        self.state
            .as_ref()
            .map(|state| state.monitor_points.clone())
            .unwrap_or_default()
    }

    /// Build, persist and return a new batch under `resume_from`, starting with `carried`.
    fn issue(
        &mut self,
        resume_from: Option<FileConnectorCheckpoint>,
        carried: Vec<CheckpointAndChange>,
    ) -> Result<Vec<CheckpointAndChange>, CheckpointQueueError> {
        let state = self.state.as_mut().ok_or(CheckpointQueueError::NotStarted)?;

        let mut batch = carried;
        let mut next = match batch.last() {
            Some(entry) => entry.checkpoint.next_minor(),
            None => FileConnectorCheckpoint::new(state.last_major + 1, 1),
        };
        while batch.len() < self.max_batch {
            let Some(change) = self.source.get_next_change() else {
                break;
            };
            batch.push(CheckpointAndChange {
                checkpoint: next,
                change,
            });
            next = next.next_minor();
        }

        let unchanged =
            batch.is_empty() && state.batch.is_empty() && state.resume_from == resume_from;
        if let Some(last) = batch.last() {
            state.last_major = state.last_major.max(last.checkpoint.major);
        }
        for entry in &batch {
            let monitor = &entry.change.checkpoint.monitor;
            let newer = state
                .monitor_points
                .get(monitor)
                .is_none_or(|point| entry.change.checkpoint > *point);
            if newer {
                state
                    .monitor_points
                    .insert(monitor.clone(), entry.change.checkpoint.clone());
            }
        }
        state.resume_from = resume_from;
        state.batch = batch;
        state.recovered = false;

        if !unchanged {
            let sequence = state.file.as_ref().map_or(1, |file| file.sequence + 1);
            let written = recovery::write(&self.dir, sequence, &state.to_recovery())?;
            if let Some(old) = state.file.replace(written) {
                recovery::remove(&old)?;
            }
        }

        debug!(
            resume_from = ?state.resume_from.map(|c| c.to_string()),
            changes = state.batch.len(),
            "Issued batch"
        );
        Ok(state.batch.clone())
    }
}

impl<S> fmt::Debug for CheckpointAndChangeQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointAndChangeQueue")
            .field("dir", &self.dir)
            .field("max_batch", &self.max_batch)
            .field("started", &self.state.is_some())
            .finish_non_exhaustive()
    }
}

fn incomplete(file: &RecoveryFile, failure: ReadFailure) -> CheckpointQueueError {
    let reason = match failure {
        ReadFailure::Io(err) => err.to_string(),
        ReadFailure::Corrupt(err) => err.to_string(),
        ReadFailure::Version(version) => format!("unsupported version {version}"),
    };
    CheckpointQueueError::IncompleteRecoveryFile {
        name: file.name(),
        reason,
    }
}
