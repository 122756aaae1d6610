//! Progress markers for a monitor's merge-walk.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How far one monitor had progressed through both snapshot streams when an event
/// was emitted.
///
/// `generation` is the snapshot being written. `offset_current` counts the records
/// written to it so far, `offset_previous` the records consumed from the snapshot it is
/// being compared against. Together they identify exactly which state the consumer has
/// been told about, which is what [`SnapshotStore::stitch`](crate::SnapshotStore::stitch)
/// rebuilds after a crash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorCheckpoint {
    pub monitor: String,
    pub generation: u64,
    pub offset_current: u64,
    pub offset_previous: u64,
}

impl MonitorCheckpoint {
    pub fn new(
        monitor: impl Into<String>,
        generation: u64,
        offset_current: u64,
        offset_previous: u64,
    ) -> Self {
        Self {
            monitor: monitor.into(),
            generation,
            offset_current,
            offset_previous,
        }
    }

    /// Whether `self` is at or beyond `other` in the same monitor's progress.
    pub fn is_at_or_after(&self, other: &MonitorCheckpoint) -> bool {
        self.monitor == other.monitor && self.position() >= other.position()
    }

    fn position(&self) -> (u64, u64, u64) {
        (self.generation, self.offset_current, self.offset_previous)
    }
}

impl fmt::Display for MonitorCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.monitor, self.generation, self.offset_current, self.offset_previous
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_ordered_within_a_monitor() {
        let early = MonitorCheckpoint::new("m", 3, 10, 9);
        let later = MonitorCheckpoint::new("m", 3, 11, 9);
        let next_generation = MonitorCheckpoint::new("m", 4, 0, 0);

        assert!(later.is_at_or_after(&early));
        assert!(next_generation.is_at_or_after(&later));
        assert!(!early.is_at_or_after(&later));
        assert!(!MonitorCheckpoint::new("other", 9, 0, 0).is_at_or_after(&early));
    }

    #[test]
    fn display() {
        assert_eq!(MonitorCheckpoint::new("m", 2, 5, 4).to_string(), "m@2:5/4");
    }
}
