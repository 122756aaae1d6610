//! One monitored root: repeated scan passes over a snapshot store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cairn_fs::FileSystemType;
use jiff::Timestamp;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::checkpoint::MonitorCheckpoint;
use crate::checksum::ChecksumGenerator;
use crate::event::{EventSink, MonitorEvent, Shutdown};
use crate::filter::{DocumentFilter, DocumentSink};
use crate::store::{
    SnapshotReaderError, SnapshotStore, SnapshotWriter, SnapshotWriterError, StoreError,
};
use crate::walker::{DiffWalker, WalkError, WalkParts, WalkSummary};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between passes.
    pub pass_interval: Duration,
    /// How long a recomputed checksum must stay unchanged before it is trusted.
    pub stability_window: Duration,
    /// Pause after a failed pass.
    pub error_backoff: Duration,
    /// Consecutive failed passes tolerated before giving up.
    pub max_consecutive_failures: u32,
    /// Until a guarantee is accepted, keep every generation from the first dispatched
    /// event onwards.
    pub retain_unacknowledged: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pass_interval: Duration::from_secs(1),
            stability_window: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
            max_consecutive_failures: 5,
            retain_unacknowledged: true,
        }
    }
}

/// What to do with the store before the first pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Forget all history: the first pass reports everything as new.
    Fresh,
    /// Diff against the latest complete generation.
    Continue,
    /// Rebuild the state at a checkpoint and continue from there.
    Resume(MonitorCheckpoint),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("snapshot is unreadable: {0}")]
    Reader(#[source] SnapshotReaderError),

    #[error("snapshot is inconsistent: {0}")]
    Writer(#[source] SnapshotWriterError),

    #[error("giving up after {failures} failed passes: {source}")]
    Walk {
        failures: u32,
        #[source]
        source: WalkError,
    },

    #[error("interrupted while recovering snapshot generation {generation}")]
    RecoveryInterrupted { generation: u64 },
}

/// Cloneable access to a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    name: Arc<str>,
    guarantee: Arc<Mutex<Option<MonitorCheckpoint>>>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record that everything up to `checkpoint` is durable downstream, so generations
    /// behind it may be collected. Older checkpoints are ignored. Returns whether the
    /// guarantee moved.
    pub fn accept_guarantee(&self, checkpoint: MonitorCheckpoint) -> bool {
        if checkpoint.monitor != *self.name {
            warn!(monitor = %self.name, %checkpoint, "Ignoring guarantee for another monitor");
            return false;
        }
        let mut guarantee = self.guarantee.lock();
        if guarantee
            .as_ref()
            .is_some_and(|current| current.is_at_or_after(&checkpoint))
        {
            return false;
        }
        debug!(%checkpoint, "Accepted guarantee");
        *guarantee = Some(checkpoint);
        true
    }

    pub fn guarantee(&self) -> Option<MonitorCheckpoint> {
        self.guarantee.lock().clone()
    }
}

/// Everything a monitor is built from.
pub struct MonitorParts {
    pub name: String,
    /// Root directory path, as understood by `file_system`.
    pub root: String,
    pub file_system: Arc<dyn FileSystemType>,
    pub store: SnapshotStore,
    pub sink: Box<dyn EventSink>,
    pub checksums: Arc<dyn ChecksumGenerator>,
    pub filter: DocumentFilter,
    pub filter_log: Arc<dyn DocumentSink>,
    pub config: MonitorConfig,
    pub shutdown: Shutdown,
    pub start: StartMode,
}

enum PassOutcome {
    Completed { summary: WalkSummary, generation: u64 },
    Stopped,
    Failed(WalkError),
}

pub struct Monitor {
    root: String,
    file_system: Arc<dyn FileSystemType>,
    store: SnapshotStore,
    sink: Box<dyn EventSink>,
    checksums: Arc<dyn ChecksumGenerator>,
    filter: DocumentFilter,
    filter_log: Arc<dyn DocumentSink>,
    config: MonitorConfig,
    shutdown: Shutdown,
    start: Option<StartMode>,
    handle: MonitorHandle,
    failures: u32,
    /// Last completed generation, if its pass dispatched nothing.
    quiet: Option<u64>,
}

impl Monitor {
    pub fn new(parts: MonitorParts) -> Self {
        let guarantee = match &parts.start {
            StartMode::Resume(checkpoint) => Some(checkpoint.clone()),
            _ => None,
        };
        Self {
            root: parts.root,
            file_system: parts.file_system,
            store: parts.store,
            sink: parts.sink,
            checksums: parts.checksums,
            filter: parts.filter,
            filter_log: parts.filter_log,
            config: parts.config,
            shutdown: parts.shutdown,
            start: Some(parts.start),
            handle: MonitorHandle {
                name: Arc::from(parts.name),
                guarantee: Arc::new(Mutex::new(guarantee)),
            },
            failures: 0,
            quiet: None,
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Scan until the sink or the shutdown signal interrupts.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        self.run_passes(u64::MAX).map(|_| ())
    }

    /// Run at most `passes` complete passes. Returns how many completed.
    ///
    /// Interruption is a normal return: the current generation stays on disk as a
    /// partial snapshot.
    pub fn run_passes(&mut self, passes: u64) -> Result<u64, MonitorError> {
        if self.shutdown.is_triggered() {
            return Ok(0);
        }
        if let Some(start) = self.start.take() {
            self.prepare(start)?;
        }

        let mut completed = 0;
        while completed < passes {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.pass()? {
                PassOutcome::Completed {
                    summary,
                    generation,
                } => {
                    completed += 1;
                    self.failures = 0;
                    info!(
                        monitor = self.name(),
                        records = summary.records,
                        events = summary.events,
                        checksums = summary.checksums,
                        "Pass complete"
                    );
                    self.compact_quiet(generation, summary.events == 0)?;
                    self.collect_garbage()?;
                    if completed < passes && self.pause(self.config.pass_interval) {
                        break;
                    }
                }
                PassOutcome::Stopped => {
                    // A partial generation may still build on the quiet one
                    self.quiet = None;
                    break;
                }
                PassOutcome::Failed(err) => {
                    self.quiet = None;
                    self.failures += 1;
                    if self.failures >= self.config.max_consecutive_failures {
                        error!(monitor = self.name(), %err, "Pass failed, giving up");
                        return Err(MonitorError::Walk {
                            failures: self.failures,
                            source: err,
                        });
                    }
                    warn!(
                        monitor = self.name(),
                        %err,
                        failures = self.failures,
                        "Pass failed, backing off"
                    );
                    if self.pause(self.config.error_backoff) {
                        break;
                    }
                }
            }
        }
        Ok(completed)
    }

    fn prepare(&mut self, start: StartMode) -> Result<(), MonitorError> {
        match start {
            StartMode::Fresh => {
                let deleted = self.store.delete_all()?;
                info!(monitor = self.name(), deleted, "Starting fresh");
            }
            StartMode::Continue => {
                self.store.discard_incomplete(None)?;
                info!(
                    monitor = self.name(),
                    generation = ?self.store.most_recent_generation()?,
                    "Continuing from latest snapshot"
                );
            }
            StartMode::Resume(checkpoint) => {
                info!(monitor = self.name(), %checkpoint, "Resuming from checkpoint");
                self.stitch(&checkpoint)?;
                self.store.discard_incomplete(Some(checkpoint.generation))?;
            }
        }
        Ok(())
    }

    fn pass(&mut self) -> Result<PassOutcome, MonitorError> {
        let root = match self.file_system.get_file(&self.root) {
            Ok(root) => root,
            Err(source) => {
                return Ok(PassOutcome::Failed(WalkError::Root {
                    path: self.root.clone(),
                    source,
                }));
            }
        };

        let previous = match self.store.most_recent_generation()? {
            Some(generation) => Some(self.store.open_snapshot(generation)?),
            None => None,
        };
        let mut writer = self.store.open_new_snapshot_writer()?;
        debug!(
            monitor = self.name(),
            generation = writer.generation(),
            previous = ?previous.as_ref().map(|reader| reader.generation()),
            "Starting pass"
        );

        let name = self.handle.name.clone();
        let (result, first, last, checkpoint) = {
            let mut walker = DiffWalker::new(WalkParts {
                monitor: &name,
                previous,
                writer: &mut writer,
                sink: self.sink.as_mut(),
                checksums: self.checksums.as_ref(),
                filter: &self.filter,
                filter_log: self.filter_log.as_ref(),
                stability_window: millis(self.config.stability_window),
                now: Timestamp::now().as_millisecond(),
            });
            let result = walker.walk(root.as_ref());
            (
                result,
                walker.first_dispatched().cloned(),
                walker.last_dispatched().cloned(),
                walker.checkpoint(),
            )
        };

        if let Some(first) = first
            && self.config.retain_unacknowledged
            && self.handle.guarantee().is_none()
        {
            self.handle.accept_guarantee(first);
        }

        let generation = writer.generation();
        match result {
            Ok(summary) => {
                if let Err(err) = writer.close() {
                    warn!(monitor = self.name(), %err, "Closing snapshot failed, recovering");
                    self.recover(generation, None, last)?;
                    return writer_failure(err);
                }
                match self.sink.dispatch(MonitorEvent::PassComplete(checkpoint)) {
                    Ok(()) => Ok(PassOutcome::Completed {
                        summary,
                        generation,
                    }),
                    Err(_) => Ok(PassOutcome::Stopped),
                }
            }
            Err(WalkError::Interrupted) => {
                debug!(monitor = self.name(), "Pass interrupted");
                match last {
                    Some(checkpoint) => {
                        // The partial generation stays, flushed up to the last dispatched
                        // event. Running again stitches there instead of rediffing.
                        drop(writer);
                        self.start = Some(StartMode::Resume(checkpoint));
                    }
                    None => writer.abandon(),
                }
                Ok(PassOutcome::Stopped)
            }
            Err(WalkError::Reader(err)) => {
                writer.abandon();
                Err(MonitorError::Reader(err))
            }
            Err(WalkError::Writer(err)) => {
                warn!(monitor = self.name(), %err, "Snapshot write failed, recovering");
                self.recover(generation, Some(writer), last)?;
                writer_failure(err)
            }
            Err(err) => {
                writer.abandon();
                Ok(PassOutcome::Failed(err))
            }
        }
    }

    /// Rebuild a consistent snapshot after writing `generation` failed. `writer` is gone
    /// when the failure happened while closing it.
    fn recover(
        &mut self,
        generation: u64,
        writer: Option<SnapshotWriter>,
        last: Option<MonitorCheckpoint>,
    ) -> Result<(), MonitorError> {
        let point = last.or_else(|| {
            self.handle
                .guarantee()
                .filter(|guarantee| guarantee.generation == generation)
        });

        match point {
            Some(checkpoint) => {
                drop(writer);
                self.stitch(&checkpoint)
            }
            None => {
                // Nothing from this generation reached the sink, so nothing to preserve
                match writer {
                    Some(writer) => writer.abandon(),
                    None => {
                        self.store.delete_generation(generation)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn stitch(&self, checkpoint: &MonitorCheckpoint) -> Result<(), MonitorError> {
        match self.store.stitch(checkpoint, &self.shutdown) {
            Ok(_) => Ok(()),
            Err(StoreError::Interrupted) => Err(MonitorError::RecoveryInterrupted {
                generation: checkpoint.generation,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop a quiet generation once its successor is quiet too.
    ///
    /// No checkpoint refers to a generation whose pass dispatched nothing, and with a
    /// quiet successor it is not the base of any referenced generation either.
    fn compact_quiet(&mut self, generation: u64, quiet: bool) -> Result<(), MonitorError> {
        let previous = std::mem::replace(&mut self.quiet, quiet.then_some(generation));
        let Some(candidate) = previous.filter(|_| quiet) else {
            return Ok(());
        };
        if self.store.previous_generation(generation)? != Some(candidate) {
            return Ok(());
        }
        if let Some(guarantee) = self.handle.guarantee()
            && (guarantee.generation == candidate
                || self.store.previous_generation(guarantee.generation)? == Some(candidate))
        {
            return Ok(());
        }
        if self.store.delete_generation(candidate)? {
            debug!(monitor = self.name(), generation = candidate, "Dropped quiet snapshot");
        }
        Ok(())
    }

    fn collect_garbage(&self) -> Result<(), MonitorError> {
        let watermark = match self.handle.guarantee() {
            Some(guarantee) => Some(
                self.store
                    .previous_generation(guarantee.generation)?
                    .unwrap_or(guarantee.generation),
            ),
            None => None,
        };
        self.store.delete_old_snapshots(watermark)?;
        Ok(())
    }

    /// Sleep, waking early on shutdown. Returns whether shutdown was requested.
    fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.shutdown.is_triggered();
        }
        self.shutdown.wait_timeout(duration)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name())
            .field("root", &self.root)
            .field("store", &self.store.dir())
            .finish_non_exhaustive()
    }
}

/// I/O failures are retried. Anything else means the walk produced an invalid snapshot,
/// which a retry would only repeat.
fn writer_failure(err: SnapshotWriterError) -> Result<PassOutcome, MonitorError> {
    if err.is_io() {
        Ok(PassOutcome::Failed(WalkError::Writer(err)))
    } else {
        Err(MonitorError::Writer(err))
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
