//! Runs one monitor thread per root, all feeding one checkpointed change stream.
//!
//! State directory layout:
//!
//! ```text
//! <state>/snapshots/<monitor-name>/snap.<N>
//! <state>/queue/recovery.<N>
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cairn_fs::{FileSystemRegistry, SEPARATOR, UnrecognizedPath};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::batch::{
    CheckpointAndChange, CheckpointAndChangeQueue, CheckpointQueueError, FileConnectorCheckpoint,
};
use crate::checkpoint::MonitorCheckpoint;
use crate::checksum::{Blake3Checksum, ChecksumGenerator};
use crate::event::Shutdown;
use crate::filter::{DocumentFilter, DocumentSink, FilterConfig, FilterError, LoggingDocumentSink};
use crate::monitor::{Monitor, MonitorConfig, MonitorError, MonitorHandle, MonitorParts, StartMode};
use crate::queue::{ChangeQueue, QueueConfig};
use crate::store::{SnapshotStore, StoreError};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Holds snapshots and recovery files.
    pub state_dir: PathBuf,
    /// Root directories to monitor.
    pub roots: Vec<String>,
    pub monitor: MonitorConfig,
    pub queue: QueueConfig,
    pub filter: FilterConfig,
    /// Changes per batch.
    pub max_batch: usize,
}

impl ManagerConfig {
    pub fn new(state_dir: impl Into<PathBuf>, roots: Vec<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            roots,
            monitor: MonitorConfig::default(),
            queue: QueueConfig::default(),
            filter: FilterConfig::default(),
            max_batch: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Queue(#[from] CheckpointQueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    UnrecognizedRoot(#[from] UnrecognizedPath),

    #[error("failed to start monitor thread for {root:?}: {source}")]
    Spawn {
        root: String,
        #[source]
        source: io::Error,
    },

    #[error("monitor for {root:?} failed: {source}")]
    Monitor {
        root: String,
        #[source]
        source: MonitorError,
    },

    #[error("monitor thread for {root:?} panicked")]
    MonitorPanicked { root: String },

    #[error("monitors are already running")]
    AlreadyStarted,

    #[error("monitors have not been started")]
    NotStarted,
}

struct RunningMonitor {
    root: String,
    handle: MonitorHandle,
    thread: JoinHandle<Result<(), MonitorError>>,
}

pub struct MonitorManager {
    config: ManagerConfig,
    registry: FileSystemRegistry,
    checksums: Arc<dyn ChecksumGenerator>,
    filter_log: Arc<dyn DocumentSink>,
    shutdown: Shutdown,
    queue: Option<CheckpointAndChangeQueue<ChangeQueue>>,
    monitors: Vec<RunningMonitor>,
}

impl MonitorManager {
    pub fn new(config: ManagerConfig, registry: FileSystemRegistry) -> Self {
        Self {
            config,
            registry,
            checksums: Arc::new(Blake3Checksum),
            filter_log: Arc::new(LoggingDocumentSink),
            shutdown: Shutdown::new(),
            queue: None,
            monitors: Vec::new(),
        }
    }

    pub fn with_checksums(mut self, checksums: Arc<dyn ChecksumGenerator>) -> Self {
        self.checksums = checksums;
        self
    }

    pub fn with_filter_log(mut self, filter_log: Arc<dyn DocumentSink>) -> Self {
        self.filter_log = filter_log;
        self
    }

    /// Stable name for the monitor of `root`: a short hash of its path.
    pub fn monitor_name(root: &str) -> String {
        let hash = blake3::hash(normalize_root(root).as_bytes());
        hex::encode(&hash.as_bytes()[..8])
    }

    /// Start every monitor for a consumer resuming at `checkpoint`.
    ///
    /// Monitors with a restart point in the recovery state resume there. The others
    /// start fresh, so their whole tree is reported again.
    pub fn start(
        &mut self,
        checkpoint: Option<FileConnectorCheckpoint>,
    ) -> Result<(), ManagerError> {
        if self.queue.is_some() {
            return Err(ManagerError::AlreadyStarted);
        }
        self.shutdown = Shutdown::new();

        let roots: BTreeSet<String> = self
            .config
            .roots
            .iter()
            .map(|root| normalize_root(root))
            .collect();
        if roots.len() < self.config.roots.len() {
            warn!("Ignoring duplicate roots");
        }

        let changes = ChangeQueue::new(self.config.queue.clone(), self.shutdown.clone());
        let mut monitors = Vec::with_capacity(roots.len());
        for root in &roots {
            let file_system = self.registry.file_system_for(root)?;
            let name = Self::monitor_name(root);
            let store = SnapshotStore::open(self.config.state_dir.join("snapshots").join(&name))?;
            monitors.push((root.clone(), name, file_system, store, changes.sender()));
        }

        let mut queue = CheckpointAndChangeQueue::new(
            changes,
            self.config.state_dir.join("queue"),
            self.config.max_batch,
        );
        queue.start(checkpoint)?;
        let points = queue.monitor_restart_points();

        for (root, name, file_system, store, sender) in monitors {
            let start = match points.get(&name) {
                Some(point) => StartMode::Resume(point.clone()),
                None => StartMode::Fresh,
            };
            info!(root = %root, monitor = %name, ?start, "Starting monitor");

            let mut monitor = Monitor::new(MonitorParts {
                name: name.clone(),
                root: root.clone(),
                file_system,
                store,
                sink: Box::new(sender),
                checksums: self.checksums.clone(),
                filter: DocumentFilter::new(&self.config.filter)?,
                filter_log: self.filter_log.clone(),
                config: self.config.monitor.clone(),
                shutdown: self.shutdown.clone(),
                start,
            });
            let handle = monitor.handle();
            let thread = thread::Builder::new()
                .name(format!("cairn-monitor-{name}"))
                .spawn(move || {
                    let result = monitor.run();
                    if let Err(err) = &result {
                        error!(monitor = monitor.name(), %err, "Monitor stopped");
                    }
                    result
                })
                .map_err(|source| ManagerError::Spawn {
                    root: root.clone(),
                    source,
                });
            match thread {
                Ok(thread) => self.monitors.push(RunningMonitor {
                    root,
                    handle,
                    thread,
                }),
                Err(err) => {
                    if let Err(stop) = self.stop_threads() {
                        warn!(%stop, "Monitor failed while aborting start");
                    }
                    return Err(err);
                }
            }
        }

        self.queue = Some(queue);
        Ok(())
    }

    /// Next batch for a consumer that has processed everything up to `checkpoint`.
    pub fn resume(
        &mut self,
        checkpoint: Option<FileConnectorCheckpoint>,
    ) -> Result<Vec<CheckpointAndChange>, ManagerError> {
        let queue = self.queue.as_mut().ok_or(ManagerError::NotStarted)?;
        let batch = queue.resume(checkpoint)?;

        let points = queue.monitor_restart_points();
        for monitor in &self.monitors {
            if let Some(point) = points.get(monitor.handle.name()) {
                monitor.handle.accept_guarantee(point.clone());
            }
        }
        Ok(batch)
    }

    pub fn restart_points(&self) -> BTreeMap<String, MonitorCheckpoint> {
        self.queue
            .as_ref()
            .map(CheckpointAndChangeQueue::monitor_restart_points)
            .unwrap_or_default()
    }

    pub fn handles(&self) -> Vec<MonitorHandle> {
        self.monitors.iter().map(|m| m.handle.clone()).collect()
    }

    /// Whether any monitor thread has exited.
    pub fn has_stopped_monitor(&self) -> bool {
        self.monitors.iter().any(|m| m.thread.is_finished())
    }

    /// Signal every monitor to stop and wait for them. Reports the first failure.
    pub fn stop(&mut self) -> Result<(), ManagerError> {
        if self.queue.take().is_none() && self.monitors.is_empty() {
            return Err(ManagerError::NotStarted);
        }
        self.stop_threads()
    }

    fn stop_threads(&mut self) -> Result<(), ManagerError> {
        self.shutdown.trigger();
        let mut first_error = None;
        for monitor in self.monitors.drain(..) {
            let failure = match monitor.thread.join() {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => ManagerError::Monitor {
                    root: monitor.root,
                    source,
                },
                Err(_) => ManagerError::MonitorPanicked { root: monitor.root },
            };
            first_error.get_or_insert(failure);
        }
        info!("Monitors stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for MonitorManager {
    fn drop(&mut self) {
        if !self.monitors.is_empty()
            && let Err(err) = self.stop_threads()
        {
            warn!(%err, "Monitor failed during shutdown");
        }
    }
}

fn normalize_root(root: &str) -> String {
    let mut root = root.to_string();
    if !root.ends_with(SEPARATOR) {
        root.push(SEPARATOR);
    }
    root
}
