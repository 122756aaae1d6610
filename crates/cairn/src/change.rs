//! Change records handed downstream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checkpoint::MonitorCheckpoint;
use crate::event::MonitorEvent;
use crate::record::EntryType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    AddFile,
    DeleteFile,
    UpdateFileContent,
    UpdateFileMetadata,
    AddDir,
    DeleteDir,
    UpdateDirMetadata,
}

impl Action {
    pub fn is_directory_action(self) -> bool {
        matches!(self, Self::AddDir | Self::DeleteDir | Self::UpdateDirMetadata)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddFile => "ADD_FILE",
            Self::DeleteFile => "DELETE_FILE",
            Self::UpdateFileContent => "UPDATE_FILE_CONTENT",
            Self::UpdateFileMetadata => "UPDATE_FILE_METADATA",
            Self::AddDir => "ADD_DIR",
            Self::DeleteDir => "DELETE_DIR",
            Self::UpdateDirMetadata => "UPDATE_DIR_METADATA",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change to one path, with the monitor position it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub action: Action,
    pub file_system: String,
    pub path: String,
    pub checkpoint: MonitorCheckpoint,
}

impl Change {
    pub fn new(
        action: Action,
        file_system: impl Into<String>,
        path: impl Into<String>,
        checkpoint: MonitorCheckpoint,
    ) -> Self {
        Self {
            action,
            file_system: file_system.into(),
            path: path.into(),
            checkpoint,
        }
    }

    /// The change an event describes. Pass completions describe none.
    pub fn from_event(event: MonitorEvent) -> Option<Self> {
        let (action, entry) = match event {
            MonitorEvent::New(entry) => (
                match entry.entry_type {
                    EntryType::File => Action::AddFile,
                    EntryType::Directory => Action::AddDir,
                },
                entry,
            ),
            MonitorEvent::Deleted(entry) => (
                match entry.entry_type {
                    EntryType::File => Action::DeleteFile,
                    EntryType::Directory => Action::DeleteDir,
                },
                entry,
            ),
            MonitorEvent::ContentChanged(entry) => (Action::UpdateFileContent, entry),
            MonitorEvent::MetadataChanged(entry) => (
                match entry.entry_type {
                    EntryType::File => Action::UpdateFileMetadata,
                    EntryType::Directory => Action::UpdateDirMetadata,
                },
                entry,
            ),
            MonitorEvent::PassComplete(_) => return None,
        };
        Some(Self {
            action,
            file_system: entry.file_system,
            path: entry.path,
            checkpoint: entry.checkpoint,
        })
    }
}

/// A non-blocking supply of changes.
pub trait ChangeSource: Send {
    /// The next change, or `None` if none is available right now.
    fn get_next_change(&mut self) -> Option<Change>;
}

impl ChangeSource for std::collections::VecDeque<Change> {
    fn get_next_change(&mut self) -> Option<Change> {
        self.pop_front()
    }
}
