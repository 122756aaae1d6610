//! The merge-walk between the live tree and the previous snapshot.
//!
//! The live tree is enumerated depth-first with each directory's children sorted by path.
//! Because directory paths end with `/`, that order is exactly the byte order of the full
//! paths, which is also the order of the records in a snapshot. The walker advances both
//! sequences in lock-step: a live path below the snapshot cursor is new, a snapshot path
//! below the live cursor is gone, equal paths are compared.
//!
//! Every record for the new generation is written before the event describing it is
//! dispatched, so the checkpoint carried by the event always describes a prefix of the
//! new snapshot plus a suffix of the old one that together form a consistent state.

use std::io;

use cairn_fs::{Acl, DirectoryListingError, ReadonlyFile, sort_by_path};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::checkpoint::MonitorCheckpoint;
use crate::checksum::ChecksumGenerator;
use crate::event::{EntryEvent, EventSink, Interrupted, MonitorEvent};
use crate::filter::{DocumentFilter, DocumentSink, FilterReason};
use crate::record::{EntryType, SnapshotRecord};
use crate::store::{SnapshotReader, SnapshotReaderError, SnapshotWriter, SnapshotWriterError};

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("scan root {path:?} is not usable: {source}")]
    Root {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("scan root could not be listed: {0}")]
    RootListing(#[source] DirectoryListingError),

    #[error(transparent)]
    Reader(#[from] SnapshotReaderError),

    #[error(transparent)]
    Writer(#[from] SnapshotWriterError),

    #[error("interrupted")]
    Interrupted,
}

impl From<Interrupted> for WalkError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Records written to the new snapshot.
    pub records: u64,
    /// Events dispatched, not counting the pass completion.
    pub events: u64,
    /// Checksums computed.
    pub checksums: u64,
    /// Entries left out by policy.
    pub skipped: u64,
    /// Entries whose previous state was carried forward because they could not be read.
    pub unobservable: u64,
}

/// Everything a walk borrows.
pub struct WalkParts<'a> {
    pub monitor: &'a str,
    /// The last complete generation, or `None` on a first scan.
    pub previous: Option<SnapshotReader>,
    pub writer: &'a mut SnapshotWriter,
    pub sink: &'a mut dyn EventSink,
    pub checksums: &'a dyn ChecksumGenerator,
    pub filter: &'a DocumentFilter,
    pub filter_log: &'a dyn DocumentSink,
    /// Milliseconds an unchanged checksum must persist before it is trusted.
    pub stability_window: i64,
    /// Scan time of this pass, epoch milliseconds.
    pub now: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Difference {
    New,
    Deleted,
    Content,
    Metadata,
}

struct FileFacts {
    last_modified: i64,
    length: u64,
    acl: Acl,
}

enum Observed {
    Vanished,
    Skipped(FilterReason),
    Unobservable(io::Error),
    File(FileFacts),
    Directory(SnapshotRecord),
}

type Children = Vec<Box<dyn ReadonlyFile>>;

pub struct DiffWalker<'a> {
    monitor: &'a str,
    previous: Option<SnapshotReader>,
    head: Option<SnapshotRecord>,
    consumed: u64,
    writer: &'a mut SnapshotWriter,
    sink: &'a mut dyn EventSink,
    checksums: &'a dyn ChecksumGenerator,
    filter: &'a DocumentFilter,
    filter_log: &'a dyn DocumentSink,
    stability_window: i64,
    now: i64,
    summary: WalkSummary,
    first_dispatched: Option<MonitorCheckpoint>,
    last_dispatched: Option<MonitorCheckpoint>,
}

impl<'a> DiffWalker<'a> {
    pub fn new(parts: WalkParts<'a>) -> Self {
        Self {
            monitor: parts.monitor,
            previous: parts.previous,
            head: None,
            consumed: 0,
            writer: parts.writer,
            sink: parts.sink,
            checksums: parts.checksums,
            filter: parts.filter,
            filter_log: parts.filter_log,
            stability_window: parts.stability_window,
            now: parts.now,
            summary: WalkSummary::default(),
            first_dispatched: None,
            last_dispatched: None,
        }
    }

    /// The checkpoint of the first event the sink accepted.
    pub fn first_dispatched(&self) -> Option<&MonitorCheckpoint> {
        self.first_dispatched.as_ref()
    }

    /// The checkpoint of the last event the sink accepted.
    pub fn last_dispatched(&self) -> Option<&MonitorCheckpoint> {
        self.last_dispatched.as_ref()
    }

    /// Current position in both record streams.
    pub fn checkpoint(&self) -> MonitorCheckpoint {
        MonitorCheckpoint::new(
            self.monitor,
            self.writer.generation(),
            self.writer.records_written(),
            self.consumed,
        )
    }

    /// Walk the tree under `root`, writing the new snapshot and dispatching events.
    ///
    /// Any failure at the root is fatal to the walk. Elsewhere, failures only affect the
    /// entry they occur on.
    pub fn walk(&mut self, root: &dyn ReadonlyFile) -> Result<WalkSummary, WalkError> {
        let children = self.visit_root(root)?;
        let mut stack = vec![children.into_iter()];

        while let Some(level) = stack.last_mut() {
            let Some(child) = level.next() else {
                stack.pop();
                continue;
            };
            if let Some(children) = self.visit(child.as_ref())? {
                stack.push(children.into_iter());
            }
        }

        // Whatever is left in the previous snapshot no longer exists
        while let Some(record) = self.take_head()? {
            self.emit(Difference::Deleted, &record)?;
        }

        self.summary.records = self.writer.records_written();
        debug!(monitor = self.monitor, summary = ?self.summary, "Walk finished");
        Ok(self.summary)
    }

    fn visit_root(&mut self, root: &dyn ReadonlyFile) -> Result<Children, WalkError> {
        let path = root.path().to_string();
        let root_error = |source: io::Error| WalkError::Root {
            path: path.clone(),
            source,
        };

        if !root.exists().map_err(root_error)? {
            return Err(root_error(io::Error::new(
                io::ErrorKind::NotFound,
                "root does not exist",
            )));
        }
        if !root.is_directory().map_err(root_error)? {
            return Err(root_error(io::Error::new(
                io::ErrorKind::NotADirectory,
                "root is not a directory",
            )));
        }
        if !root.can_read().map_err(root_error)? {
            return Err(root_error(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "root is not readable",
            )));
        }
        let record = SnapshotRecord::directory(
            root.file_system_type(),
            &path,
            root.last_modified().map_err(root_error)?,
            root.acl().map_err(root_error)?,
            self.now,
        );

        let mut children = root.list_files().map_err(WalkError::RootListing)?;
        sort_by_path(&mut children);

        self.report_deleted_before(&path)?;
        let previous = self.take_head_if(&path)?;
        self.record_directory(record, previous)?;
        Ok(children)
    }

    /// Merge one live entry. Returns the children to descend into, if any.
    fn visit(&mut self, file: &dyn ReadonlyFile) -> Result<Option<Children>, WalkError> {
        let path = file.path().to_string();
        if !file.has_exact_path() {
            // A lossy path may collide with a sibling, so it never touches either snapshot
            self.summary.skipped += 1;
            self.filter_log.add(&path, FilterReason::InvalidName);
            return Ok(None);
        }
        self.report_deleted_before(&path)?;
        let previous = self.take_head_if(&path)?;

        match self.observe(file) {
            Observed::Vanished => {
                debug!(%path, "Entry vanished during scan");
                if let Some(previous) = previous {
                    self.emit(Difference::Deleted, &previous)?;
                }
                Ok(None)
            }
            Observed::Skipped(reason) => {
                self.summary.skipped += 1;
                self.filter_log.add(&path, reason);
                if let Some(previous) = previous {
                    self.emit(Difference::Deleted, &previous)?;
                }
                Ok(None)
            }
            Observed::Unobservable(err) => {
                debug!(%path, %err, "Entry not observable");
                self.carry_forward(&path, previous)?;
                Ok(None)
            }
            Observed::File(facts) => {
                self.record_file(file, facts, previous)?;
                Ok(None)
            }
            Observed::Directory(record) => {
                self.record_directory(record, previous)?;
                match file.list_files() {
                    Ok(mut children) => {
                        sort_by_path(&mut children);
                        Ok(Some(children))
                    }
                    Err(err) => {
                        warn!(%path, %err, "Failed to list directory, keeping previous contents");
                        self.filter_log.add(&path, FilterReason::ListingFailed);
                        self.summary.unobservable += 1;
                        self.carry_subtree(&path)?;
                        Ok(None)
                    }
                }
            }
        }
    }

    fn observe(&self, file: &dyn ReadonlyFile) -> Observed {
        match self.try_observe(file) {
            Ok(observed) => observed,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Observed::Vanished,
            Err(err) => Observed::Unobservable(err),
        }
    }

    fn try_observe(&self, file: &dyn ReadonlyFile) -> io::Result<Observed> {
        if !file.exists()? {
            return Ok(Observed::Vanished);
        }
        let path = file.path();

        if file.is_directory()? {
            if self.filter.excludes_directory(path) {
                return Ok(Observed::Skipped(FilterReason::PatternMismatch));
            }
            if !file.can_read()? {
                return Ok(Observed::Skipped(FilterReason::Unreadable));
            }
            return Ok(Observed::Directory(SnapshotRecord::directory(
                file.file_system_type(),
                path,
                file.last_modified()?,
                file.acl()?,
                self.now,
            )));
        }

        if !file.is_regular_file()? {
            return Ok(Observed::Skipped(FilterReason::NotRegularFile));
        }
        if !self.filter.matches_file(path) {
            return Ok(Observed::Skipped(FilterReason::PatternMismatch));
        }
        if !file.can_read()? {
            return Ok(Observed::Skipped(FilterReason::Unreadable));
        }
        let length = file.length()?;
        if self.filter.is_too_big(length) {
            return Ok(Observed::Skipped(FilterReason::TooBig));
        }
        if self.filter.is_unsupported_mime_type(path) {
            return Ok(Observed::Skipped(FilterReason::UnsupportedMimeType));
        }

        Ok(Observed::File(FileFacts {
            last_modified: file.last_modified()?,
            length,
            acl: file.acl()?,
        }))
    }

    fn record_file(
        &mut self,
        file: &dyn ReadonlyFile,
        facts: FileFacts,
        previous: Option<SnapshotRecord>,
    ) -> Result<(), WalkError> {
        let path = file.path();
        let outcome = match &previous {
            Some(prev) if !prev.is_directory() => self.fingerprint(file, &facts, prev),
            _ => self.checksum(file).map(|checksum| {
                let record = SnapshotRecord {
                    file_system: file.file_system_type().to_string(),
                    path: path.to_string(),
                    entry_type: EntryType::File,
                    last_modified: facts.last_modified,
                    acl: facts.acl.clone(),
                    checksum,
                    scan_time: self.now,
                    stable: false,
                    size: Some(facts.length),
                };
                (record, Some(Difference::New))
            }),
        };

        let (record, difference) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(path, %err, "Checksum failed");
                return self.carry_forward(path, previous);
            }
        };

        if let Some(prev) = previous.as_ref().filter(|prev| prev.is_directory()) {
            self.emit(Difference::Deleted, prev)?;
        }
        self.writer.write(&record)?;
        if let Some(difference) = difference {
            self.emit(difference, &record)?;
        }
        Ok(())
    }

    /// Decide whether `prev`'s checksum can be reused, and what changed.
    fn fingerprint(
        &mut self,
        file: &dyn ReadonlyFile,
        facts: &FileFacts,
        prev: &SnapshotRecord,
    ) -> io::Result<(SnapshotRecord, Option<Difference>)> {
        let stat_changed = prev.last_modified != facts.last_modified
            || prev.size.is_some_and(|size| size != facts.length);
        let acl_changed = prev.acl != facts.acl;

        let mut record = SnapshotRecord {
            file_system: file.file_system_type().to_string(),
            path: file.path().to_string(),
            entry_type: EntryType::File,
            last_modified: facts.last_modified,
            acl: facts.acl.clone(),
            checksum: prev.checksum.clone(),
            scan_time: prev.scan_time,
            stable: prev.stable,
            size: Some(facts.length),
        };

        if stat_changed {
            record.checksum = self.checksum(file)?;
            record.scan_time = self.now;
            record.stable = false;
            let difference = if record.checksum != prev.checksum {
                Difference::Content
            } else {
                Difference::Metadata
            };
            return Ok((record, Some(difference)));
        }

        if acl_changed || !prev.stable {
            let checksum = self.checksum(file)?;
            if checksum != prev.checksum {
                record.checksum = checksum;
                record.scan_time = self.now;
                record.stable = false;
                return Ok((record, Some(Difference::Content)));
            }
            record.stable = prev.stable || self.now - prev.scan_time >= self.stability_window;
            return Ok((record, acl_changed.then_some(Difference::Metadata)));
        }

        trace!(path = %prev.path, "Reusing stable checksum");
        Ok((record, None))
    }

    fn record_directory(
        &mut self,
        mut record: SnapshotRecord,
        previous: Option<SnapshotRecord>,
    ) -> Result<(), WalkError> {
        match previous {
            Some(prev) if prev.is_directory() => {
                record.scan_time = prev.scan_time;
                self.writer.write(&record)?;
                if prev.acl != record.acl {
                    self.emit(Difference::Metadata, &record)?;
                }
            }
            Some(prev) => {
                self.emit(Difference::Deleted, &prev)?;
                self.writer.write(&record)?;
                self.emit(Difference::New, &record)?;
            }
            None => {
                self.writer.write(&record)?;
                self.emit(Difference::New, &record)?;
            }
        }
        Ok(())
    }

    /// Keep the previous state of an entry that cannot be observed this pass.
    fn carry_forward(
        &mut self,
        path: &str,
        previous: Option<SnapshotRecord>,
    ) -> Result<(), WalkError> {
        self.filter_log.add(path, FilterReason::IoError);
        self.summary.unobservable += 1;
        if let Some(previous) = previous {
            self.writer.write(&previous)?;
        }
        if path.ends_with(cairn_fs::SEPARATOR) {
            self.carry_subtree(path)?;
        }
        Ok(())
    }

    /// Copy the previous records strictly below directory `prefix`.
    fn carry_subtree(&mut self, prefix: &str) -> Result<(), WalkError> {
        loop {
            let inside = matches!(
                self.peek_head()?,
                Some(head) if head.path.len() > prefix.len() && head.path.starts_with(prefix)
            );
            if !inside {
                return Ok(());
            }
            if let Some(record) = self.take_head()? {
                self.writer.write(&record)?;
            }
        }
    }

    fn report_deleted_before(&mut self, path: &str) -> Result<(), WalkError> {
        loop {
            let before = matches!(self.peek_head()?, Some(head) if head.path.as_str() < path);
            if !before {
                return Ok(());
            }
            if let Some(record) = self.take_head()? {
                self.emit(Difference::Deleted, &record)?;
            }
        }
    }

    fn peek_head(&mut self) -> Result<Option<&SnapshotRecord>, WalkError> {
        if self.head.is_none()
            && let Some(reader) = self.previous.as_mut()
        {
            self.head = reader.read()?;
        }
        Ok(self.head.as_ref())
    }

    fn take_head(&mut self) -> Result<Option<SnapshotRecord>, WalkError> {
        self.peek_head()?;
        let record = self.head.take();
        if record.is_some() {
            self.consumed += 1;
        }
        Ok(record)
    }

    fn take_head_if(&mut self, path: &str) -> Result<Option<SnapshotRecord>, WalkError> {
        let matches = matches!(self.peek_head()?, Some(head) if head.path == path);
        if matches {
            self.take_head()
        } else {
            Ok(None)
        }
    }

    fn checksum(&mut self, file: &dyn ReadonlyFile) -> io::Result<String> {
        self.summary.checksums += 1;
        let mut input = file.input_stream()?;
        self.checksums.checksum(&mut input)
    }

    fn emit(&mut self, difference: Difference, record: &SnapshotRecord) -> Result<(), WalkError> {
        self.writer.flush()?;
        let checkpoint = self.checkpoint();
        let entry = EntryEvent {
            entry_type: record.entry_type,
            file_system: record.file_system.clone(),
            path: record.path.clone(),
            checkpoint: checkpoint.clone(),
        };
        let event = match difference {
            Difference::New => MonitorEvent::New(entry),
            Difference::Deleted => MonitorEvent::Deleted(entry),
            Difference::Content => MonitorEvent::ContentChanged(entry),
            Difference::Metadata => MonitorEvent::MetadataChanged(entry),
        };
        trace!(?event, "Dispatching");
        self.sink.dispatch(event)?;
        self.summary.events += 1;
        if self.first_dispatched.is_none() {
            self.first_dispatched = Some(checkpoint.clone());
        }
        self.last_dispatched = Some(checkpoint);
        Ok(())
    }
}
