//! Events emitted by the diff walker, and the cooperative shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::checkpoint::MonitorCheckpoint;
use crate::record::EntryType;

/// One difference between the live tree and the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEvent {
    pub entry_type: EntryType,
    pub file_system: String,
    pub path: String,
    pub checkpoint: MonitorCheckpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    New(EntryEvent),
    Deleted(EntryEvent),
    ContentChanged(EntryEvent),
    MetadataChanged(EntryEvent),
    /// A full pass finished and its snapshot is durable.
    PassComplete(MonitorCheckpoint),
}

impl MonitorEvent {
    pub fn checkpoint(&self) -> &MonitorCheckpoint {
        match self {
            Self::New(entry)
            | Self::Deleted(entry)
            | Self::ContentChanged(entry)
            | Self::MetadataChanged(entry) => &entry.checkpoint,
            Self::PassComplete(checkpoint) => checkpoint,
        }
    }

    pub fn entry(&self) -> Option<&EntryEvent> {
        match self {
            Self::New(entry)
            | Self::Deleted(entry)
            | Self::ContentChanged(entry)
            | Self::MetadataChanged(entry) => Some(entry),
            Self::PassComplete(_) => None,
        }
    }
}

/// The receiving side asked the producer to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Receives walker events in emission order.
///
/// Returning [`Interrupted`] stops the monitor cleanly after the current record.
pub trait EventSink: Send {
    fn dispatch(&mut self, event: MonitorEvent) -> Result<(), Interrupted>;
}

impl<F> EventSink for F
where
    F: FnMut(MonitorEvent) -> Result<(), Interrupted> + Send,
{
    fn dispatch(&mut self, event: MonitorEvent) -> Result<(), Interrupted> {
        self(event)
    }
}

/// A cloneable stop signal shared between monitors, queues and their owner.
///
/// Nothing is ever sent on the inner channel: triggering drops the only sender, which
/// disconnects every receiver at once. Blocking operations `select!` on
/// [`Shutdown::receiver`] to wake up.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            rx,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn trigger(&self) {
        self.tx.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`. Returns `true` if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
