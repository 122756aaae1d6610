//! Bounded hand-off between monitor threads and the consumer.
//!
//! Monitors push through a [`ChangeSender`]; when the queue is full the monitor thread
//! blocks, which throttles the walk to the consumer's pace. The consumer side never
//! blocks.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::debug;

use crate::change::{Change, ChangeSource};
use crate::event::{EventSink, Interrupted, MonitorEvent, Shutdown};

/// Target for the per-change activity log.
pub const ACTIVITY_TARGET: &str = "cairn::activity";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Changes buffered before producers block. At least 1.
    pub capacity: usize,
    /// Pause after a pass that produced no changes.
    pub idle_sleep: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            idle_sleep: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct ChangeQueue {
    tx: Sender<Change>,
    rx: Receiver<Change>,
    config: QueueConfig,
    shutdown: Shutdown,
}

impl ChangeQueue {
    pub fn new(config: QueueConfig, shutdown: Shutdown) -> Self {
        let config = QueueConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        let (tx, rx) = crossbeam_channel::bounded(config.capacity);
        Self {
            tx,
            rx,
            config,
            shutdown,
        }
    }

    /// A new producer handle. Every sender feeds the same queue.
    pub fn sender(&self) -> ChangeSender {
        ChangeSender {
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
            idle_sleep: self.config.idle_sleep,
            changes_this_pass: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl ChangeSource for ChangeQueue {
    fn get_next_change(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

/// The producing end, used as a monitor's event sink.
///
/// Directory events are dropped: only file changes travel downstream.
#[derive(Debug)]
pub struct ChangeSender {
    tx: Sender<Change>,
    shutdown: Shutdown,
    idle_sleep: Duration,
    changes_this_pass: u64,
}

impl ChangeSender {
    fn enqueue(&mut self, change: Change) -> Result<(), Interrupted> {
        let action = change.action;
        let path = change.path.clone();
        let checkpoint = change.checkpoint.clone();
        select! {
            send(self.tx, change) -> sent => sent.map_err(|_| Interrupted)?,
            recv(self.shutdown.receiver()) -> _ => return Err(Interrupted),
        }
        debug!(
            target: ACTIVITY_TARGET,
            %action,
            %path,
            %checkpoint,
            "Queued change"
        );
        self.changes_this_pass += 1;
        Ok(())
    }
}

impl EventSink for ChangeSender {
    fn dispatch(&mut self, event: MonitorEvent) -> Result<(), Interrupted> {
        if self.shutdown.is_triggered() {
            return Err(Interrupted);
        }

        if let MonitorEvent::PassComplete(checkpoint) = &event {
            let idle = self.changes_this_pass == 0;
            self.changes_this_pass = 0;
            if idle && !self.idle_sleep.is_zero() {
                debug!(%checkpoint, sleep = ?self.idle_sleep, "No changes this pass, sleeping");
                if self.shutdown.wait_timeout(self.idle_sleep) {
                    return Err(Interrupted);
                }
            }
            return Ok(());
        }

        match Change::from_event(event) {
            Some(change) if !change.action.is_directory_action() => self.enqueue(change),
            _ => Ok(()),
        }
    }
}
