//! On-disk recovery files: `recovery.<n>`, one JSON document each.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CheckpointAndChange, CheckpointQueueError, FileConnectorCheckpoint};
use crate::checkpoint::MonitorCheckpoint;
use crate::store::sync_dir;

pub(super) const VERSION: u32 = 1;
const PREFIX: &str = "recovery";

/// Everything needed to hand the same batch out again after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct RecoveryState {
    pub version: u32,
    /// The checkpoint that was presented to obtain `batch`.
    pub resume_from: Option<FileConnectorCheckpoint>,
    pub batch: Vec<CheckpointAndChange>,
    /// Highest major number ever issued.
    pub last_major: u64,
    pub monitor_points: BTreeMap<String, MonitorCheckpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RecoveryFile {
    pub sequence: u64,
    pub path: PathBuf,
}

impl RecoveryFile {
    pub fn name(&self) -> String {
        file_name(self.sequence)
    }
}

pub(super) fn file_name(sequence: u64) -> String {
    format!("{PREFIX}.{sequence}")
}

/// Recovery files in `dir`, oldest first. Any file whose name starts with `recovery`
/// but is not `recovery.<n>` is an error.
pub(super) fn list(dir: &Path) -> Result<Vec<RecoveryFile>, CheckpointQueueError> {
    let io_error = |source: io::Error| CheckpointQueueError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut found = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let entry = entry.map_err(io_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(PREFIX) {
            debug!(%name, "Ignoring unrelated file in recovery directory");
            continue;
        }
        let sequence = name
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u64>().ok())
            .ok_or_else(|| CheckpointQueueError::InvalidRecoveryFilename { name: name.clone() })?;
        found.push(RecoveryFile {
            sequence,
            path: entry.path(),
        });
    }
    found.sort_by_key(|file| file.sequence);
    Ok(found)
}

/// Why a recovery file could not be used.
#[derive(Debug)]
pub(super) enum ReadFailure {
    Io(io::Error),
    Corrupt(serde_json::Error),
    Version(u32),
}

pub(super) fn read(file: &RecoveryFile) -> Result<RecoveryState, ReadFailure> {
    let bytes = fs::read(&file.path).map_err(ReadFailure::Io)?;
    let state: RecoveryState = serde_json::from_slice(&bytes).map_err(ReadFailure::Corrupt)?;
    if state.version != VERSION {
        return Err(ReadFailure::Version(state.version));
    }
    Ok(state)
}

/// Write `state` as `recovery.<sequence>` and make it durable.
pub(super) fn write(
    dir: &Path,
    sequence: u64,
    state: &RecoveryState,
) -> Result<RecoveryFile, CheckpointQueueError> {
    let path = dir.join(file_name(sequence));
    let io_error = |source: io::Error| CheckpointQueueError::Io {
        path: path.clone(),
        source,
    };

    let json = serde_json::to_vec(state).map_err(CheckpointQueueError::Encode)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(io_error)?;
    file.write_all(&json).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    sync_dir(dir).map_err(io_error)?;

    debug!(?path, changes = state.batch.len(), "Wrote recovery file");
    Ok(RecoveryFile { sequence, path })
}

pub(super) fn remove(file: &RecoveryFile) -> Result<(), CheckpointQueueError> {
    match fs::remove_file(&file.path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CheckpointQueueError::Io {
            path: file.path.clone(),
            source,
        }),
    }
}
