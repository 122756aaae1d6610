//! Cairn - change detection by snapshot diffing
//!
//! Each monitored root is scanned repeatedly. Every pass writes a sorted snapshot of the
//! tree and compares it against the previous one, emitting add, delete and update events
//! with checkpoints precise enough to resume a pass mid-way after a crash. Changes from
//! all monitors are batched behind durable recovery files, so a consumer that dies
//! before recording its progress is handed the same batch again.

pub mod batch;
pub mod change;
pub mod checkpoint;
pub mod checksum;
pub mod event;
pub mod filter;
pub mod manager;
pub mod monitor;
pub mod queue;
pub mod record;
pub mod store;
pub mod walker;

pub use batch::{
    CheckpointAndChange, CheckpointAndChangeQueue, CheckpointQueueError, FileConnectorCheckpoint,
    ParseCheckpointError,
};
pub use cairn_fs as fs;
pub use change::{Action, Change, ChangeSource};
pub use checkpoint::MonitorCheckpoint;
pub use checksum::{Blake3Checksum, ChecksumGenerator};
pub use event::{EntryEvent, EventSink, Interrupted, MonitorEvent, Shutdown};
pub use filter::{
    DocumentFilter, DocumentSink, ExtensionMimeTypeFinder, FilePatternMatcher, FilterConfig,
    FilterError, FilterReason, LoggingDocumentSink, MimeTypeFinder, RecordingDocumentSink,
};
pub use manager::{ManagerConfig, ManagerError, MonitorManager};
pub use monitor::{
    Monitor, MonitorConfig, MonitorError, MonitorHandle, MonitorParts, StartMode,
};
pub use queue::{ChangeQueue, ChangeSender, QueueConfig};
pub use record::{EntryType, RecordError, SnapshotRecord};
pub use store::{
    GenerationInfo, SnapshotReader, SnapshotReaderError, SnapshotStore, SnapshotWriter,
    SnapshotWriterError, StoreError,
};
pub use walker::{DiffWalker, WalkError, WalkParts, WalkSummary};
