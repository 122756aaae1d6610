//! Integration tests for monitors scanning an in-memory tree.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use cairn::fs::{Acl, MemoryFileSystem};
use cairn::{
    Action, Blake3Checksum, Change, ChangeQueue, ChangeSource, ChecksumGenerator,
    DocumentFilter, EventSink, FilterConfig, FilterReason, Interrupted, Monitor, MonitorCheckpoint,
    MonitorConfig, MonitorError, MonitorEvent, MonitorParts, QueueConfig, RecordingDocumentSink,
    Shutdown, SnapshotStore, StartMode, WalkError,
};

const ROOT: &str = "/data/";

/// Counts how many checksums were computed.
#[derive(Debug, Default)]
struct CountingChecksum {
    count: AtomicU64,
}

impl CountingChecksum {
    fn take(&self) -> u64 {
        self.count.swap(0, Ordering::SeqCst)
    }
}

impl ChecksumGenerator for CountingChecksum {
    fn checksum(&self, input: &mut dyn Read) -> io::Result<String> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Blake3Checksum.checksum(input)
    }
}

struct Harness {
    fs: MemoryFileSystem,
    dir: tempfile::TempDir,
    events: Arc<Mutex<Vec<MonitorEvent>>>,
    checksums: Arc<CountingChecksum>,
    filter_log: Arc<RecordingDocumentSink>,
}

impl Harness {
    fn new() -> Self {
        let fs = MemoryFileSystem::new();
        fs.add_dir(ROOT);
        Self {
            fs,
            dir: tempfile::tempdir().unwrap(),
            events: Arc::default(),
            checksums: Arc::default(),
            filter_log: Arc::new(RecordingDocumentSink::new()),
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            pass_interval: Duration::ZERO,
            stability_window: Duration::ZERO,
            error_backoff: Duration::ZERO,
            max_consecutive_failures: 3,
            retain_unacknowledged: true,
        }
    }

    fn store(&self) -> SnapshotStore {
        SnapshotStore::open(self.dir.path()).unwrap()
    }

    /// A monitor recording every event, accepting at most `limit` entry events.
    fn monitor_with(
        &self,
        start: StartMode,
        config: MonitorConfig,
        store: SnapshotStore,
        limit: Option<usize>,
    ) -> Monitor {
        let events = self.events.clone();
        let mut accepted = 0;
        let sink = move |event: MonitorEvent| -> Result<(), Interrupted> {
            if event.entry().is_some() {
                if limit.is_some_and(|limit| accepted >= limit) {
                    return Err(Interrupted);
                }
                accepted += 1;
            }
            events.lock().push(event);
            Ok(())
        };
        self.build(start, config, store, Box::new(sink))
    }

    fn build(
        &self,
        start: StartMode,
        config: MonitorConfig,
        store: SnapshotStore,
        sink: Box<dyn EventSink>,
    ) -> Monitor {
        Monitor::new(MonitorParts {
            name: "test".into(),
            root: ROOT.into(),
            file_system: Arc::new(self.fs.clone()),
            store,
            sink,
            checksums: self.checksums.clone(),
            filter: DocumentFilter::accept_all(),
            filter_log: self.filter_log.clone(),
            config,
            shutdown: Shutdown::new(),
            start,
        })
    }

    fn monitor(&self, start: StartMode) -> Monitor {
        self.monitor_with(start, Self::config(), self.store(), None)
    }

    /// Entry changes seen since the last call.
    fn changes(&self) -> Vec<(Action, String)> {
        self.events
            .lock()
            .drain(..)
            .filter_map(Change::from_event)
            .map(|change| (change.action, change.path))
            .collect()
    }

    fn last_checkpoint(&self) -> Option<MonitorCheckpoint> {
        self.events
            .lock()
            .iter()
            .rev()
            .find_map(|event| event.entry().map(|entry| entry.checkpoint.clone()))
    }
}

fn change(action: Action, path: &str) -> (Action, String) {
    (action, path.to_string())
}

// ============================================================================
// Change detection
// ============================================================================

#[test]
fn test_first_pass_reports_everything_new() {
    let h = Harness::new();
    h.fs.add_file("/data/sub/b.txt", "bee");
    h.fs.add_file("/data/a.txt", "ay");

    let mut monitor = h.monitor(StartMode::Fresh);
    assert_eq!(monitor.run_passes(1).unwrap(), 1);
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddDir, "/data/"),
            change(Action::AddFile, "/data/a.txt"),
            change(Action::AddDir, "/data/sub/"),
            change(Action::AddFile, "/data/sub/b.txt"),
        ]
    );

    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());
}

#[test]
fn test_pass_complete_follows_entry_events() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");

    h.monitor(StartMode::Fresh).run_passes(1).unwrap();
    let events = h.events.lock();
    assert!(matches!(events.last(), Some(MonitorEvent::PassComplete(_))));
    let checkpoints: Vec<_> = events.iter().map(|e| e.checkpoint().clone()).collect();
    assert!(checkpoints.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn test_modifications_deletions_and_acl_changes() {
    let h = Harness::new();
    h.fs.write_file("/data/a.txt", "one", 10_000);
    h.fs.write_file("/data/b.txt", "bee", 10_000);
    h.fs.write_file("/data/c.txt", "sea", 10_000);
    h.fs.add_file("/data/sub/d.txt", "dee");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    h.changes();

    h.fs.write_file("/data/a.txt", "two", 20_000);
    h.fs.set_modified("/data/b.txt", 20_000).unwrap();
    h.fs.set_acl("/data/c.txt", Acl::restricted(["alice"], ["staff"]))
        .unwrap();
    h.fs.remove("/data/sub/");
    h.fs.add_file("/data/z.txt", "zed");

    monitor.run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![
            change(Action::UpdateFileContent, "/data/a.txt"),
            change(Action::UpdateFileMetadata, "/data/b.txt"),
            change(Action::UpdateFileMetadata, "/data/c.txt"),
            change(Action::DeleteDir, "/data/sub/"),
            change(Action::DeleteFile, "/data/sub/d.txt"),
            change(Action::AddFile, "/data/z.txt"),
        ]
    );
}

#[test]
fn test_directory_acl_change_is_reported() {
    let h = Harness::new();
    h.fs.add_dir("/data/sub/");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    h.changes();

    h.fs.set_acl("/data/sub/", Acl::restricted(["bob"], Vec::<String>::new()))
        .unwrap();
    monitor.run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![change(Action::UpdateDirMetadata, "/data/sub/")]
    );
}

// ============================================================================
// Checksum stability
// ============================================================================

#[test]
fn test_checksums_stop_once_stable() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");
    h.fs.add_file("/data/b.txt", "bee");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    assert_eq!(h.checksums.take(), 2);

    // Unstable records are re-verified once, then trusted
    monitor.run_passes(1).unwrap();
    assert_eq!(h.checksums.take(), 2);
    monitor.run_passes(1).unwrap();
    assert_eq!(h.checksums.take(), 0);

    h.fs.add_file("/data/a.txt", "changed");
    monitor.run_passes(1).unwrap();
    assert_eq!(h.checksums.take(), 1);
    assert_eq!(
        h.changes().last(),
        Some(&change(Action::UpdateFileContent, "/data/a.txt"))
    );
}

#[test]
fn test_checksums_repeat_within_stability_window() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");

    let config = MonitorConfig {
        stability_window: Duration::from_secs(3600),
        ..Harness::config()
    };
    let mut monitor = h.monitor_with(StartMode::Fresh, config, h.store(), None);
    for _ in 0..3 {
        monitor.run_passes(1).unwrap();
        assert_eq!(h.checksums.take(), 1);
    }
    // Re-verification alone never produces an event
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddDir, "/data/"),
            change(Action::AddFile, "/data/a.txt"),
        ]
    );
}

// ============================================================================
// Skips and unobservable entries
// ============================================================================

#[test]
fn test_skipped_entries_are_reported_deleted() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");
    h.fs.add_file("/data/b.txt", "bee");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    h.changes();

    h.fs.set_readable("/data/a.txt", false).unwrap();
    monitor.run_passes(1).unwrap();
    assert_eq!(h.changes(), vec![change(Action::DeleteFile, "/data/a.txt")]);
    assert_eq!(
        h.filter_log.reason_for("/data/a.txt"),
        Some(FilterReason::Unreadable)
    );

    h.fs.set_readable("/data/a.txt", true).unwrap();
    monitor.run_passes(1).unwrap();
    assert_eq!(h.changes(), vec![change(Action::AddFile, "/data/a.txt")]);
}

#[test]
fn test_filter_patterns_and_size_limit() {
    let h = Harness::new();
    h.fs.add_file("/data/keep.txt", "ok");
    h.fs.add_file("/data/skip.log", "no");
    h.fs.add_file("/data/big.txt", vec![b'x'; 64]);
    h.fs.add_file("/data/tmp/t.txt", "no");

    let filter = DocumentFilter::new(&FilterConfig {
        include: vec!["**/*.txt".into()],
        exclude: vec!["**/tmp".into()],
        max_size: Some(16),
        ..FilterConfig::default()
    })
    .unwrap();
    let events = h.events.clone();
    let mut monitor = Monitor::new(MonitorParts {
        name: "filtered".into(),
        root: ROOT.into(),
        file_system: Arc::new(h.fs.clone()),
        store: h.store(),
        sink: Box::new(move |event: MonitorEvent| -> Result<(), Interrupted> {
            events.lock().push(event);
            Ok(())
        }),
        checksums: h.checksums.clone(),
        filter,
        filter_log: h.filter_log.clone(),
        config: Harness::config(),
        shutdown: Shutdown::new(),
        start: StartMode::Fresh,
    });

    monitor.run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddDir, "/data/"),
            change(Action::AddFile, "/data/keep.txt"),
        ]
    );
    assert_eq!(
        h.filter_log.reason_for("/data/big.txt"),
        Some(FilterReason::TooBig)
    );
    assert_eq!(
        h.filter_log.reason_for("/data/skip.log"),
        Some(FilterReason::PatternMismatch)
    );
    assert_eq!(
        h.filter_log.reason_for("/data/tmp/"),
        Some(FilterReason::PatternMismatch)
    );
}

#[test]
fn test_unobservable_entries_are_carried_forward() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");
    h.fs.add_file("/data/b.txt", "bee");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    h.changes();

    h.fs.fail_metadata("/data/a.txt", true).unwrap();
    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());
    assert_eq!(
        h.filter_log.reason_for("/data/a.txt"),
        Some(FilterReason::IoError)
    );

    h.fs.fail_metadata("/data/a.txt", false).unwrap();
    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());

    // A failed read is just as unobservable
    h.fs.write_file("/data/b.txt", "changed", 99_000);
    h.fs.fail_read("/data/b.txt", true).unwrap();
    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());

    h.fs.fail_read("/data/b.txt", false).unwrap();
    monitor.run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![change(Action::UpdateFileContent, "/data/b.txt")]
    );
}

#[test]
fn test_unobservable_directory_keeps_its_subtree() {
    let h = Harness::new();
    h.fs.add_file("/data/sub/a.txt", "ay");
    h.fs.add_file("/data/sub/b.txt", "bee");
    h.fs.add_file("/data/z.txt", "zed");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    h.changes();

    h.fs.fail_metadata("/data/sub/", true).unwrap();
    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());
    assert_eq!(
        h.filter_log.reason_for("/data/sub/"),
        Some(FilterReason::IoError)
    );

    let store = h.store();
    let latest = store.most_recent_generation().unwrap().unwrap();
    let paths: Vec<String> = store
        .open_snapshot(latest)
        .unwrap()
        .map(|record| record.unwrap().path)
        .collect();
    assert_eq!(
        paths,
        vec!["/data/", "/data/sub/", "/data/sub/a.txt", "/data/sub/b.txt", "/data/z.txt"]
    );
}

#[test]
fn test_listing_failure_keeps_previous_subtree() {
    let h = Harness::new();
    h.fs.add_file("/data/sub/a.txt", "ay");
    h.fs.add_file("/data/sub/b.txt", "bee");
    h.fs.add_file("/data/z.txt", "zed");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(1).unwrap();
    h.changes();

    h.fs.remove("/data/sub/a.txt");
    h.fs.fail_listing("/data/sub/", true).unwrap();
    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());
    assert_eq!(
        h.filter_log.reason_for("/data/sub/"),
        Some(FilterReason::ListingFailed)
    );

    h.fs.fail_listing("/data/sub/", false).unwrap();
    monitor.run_passes(1).unwrap();
    assert_eq!(h.changes(), vec![change(Action::DeleteFile, "/data/sub/a.txt")]);
}

// ============================================================================
// Failures and recovery
// ============================================================================

#[test]
fn test_missing_root_gives_up_after_retries() {
    let h = Harness::new();
    h.fs.remove(ROOT);

    let err = h.monitor(StartMode::Fresh).run_passes(1).unwrap_err();
    assert!(
        matches!(
            err,
            MonitorError::Walk {
                failures: 3,
                source: WalkError::Root { .. }
            }
        ),
        "{err:?}"
    );
}

#[test]
fn test_root_listing_failure_is_a_walk_error() {
    let h = Harness::new();
    h.fs.fail_listing(ROOT, true).unwrap();

    let err = h.monitor(StartMode::Fresh).run_passes(1).unwrap_err();
    assert!(matches!(
        err,
        MonitorError::Walk {
            source: WalkError::RootListing(_),
            ..
        }
    ));
}

#[test]
fn test_resume_after_interruption_neither_loses_nor_repeats() {
    let h = Harness::new();
    for name in ["a", "b", "c", "d"] {
        h.fs.add_file(&format!("/data/{name}.txt"), name);
    }

    // The sink stops accepting after the root, a and b
    let mut monitor = h.monitor_with(StartMode::Fresh, Harness::config(), h.store(), Some(3));
    assert_eq!(monitor.run_passes(1).unwrap(), 0);
    let checkpoint = h.last_checkpoint().unwrap();
    assert_eq!(checkpoint, MonitorCheckpoint::new("test", 1, 3, 0));
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddDir, "/data/"),
            change(Action::AddFile, "/data/a.txt"),
            change(Action::AddFile, "/data/b.txt"),
        ]
    );

    let mut monitor = h.monitor(StartMode::Resume(checkpoint.clone()));
    assert_eq!(monitor.handle().guarantee(), Some(checkpoint));
    monitor.run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddFile, "/data/c.txt"),
            change(Action::AddFile, "/data/d.txt"),
        ]
    );
}

#[test]
fn test_running_again_after_interruption_continues_the_pass() {
    let h = Harness::new();
    for name in ["a", "b", "c", "d"] {
        h.fs.add_file(&format!("/data/{name}.txt"), name);
    }

    let budget = Arc::new(AtomicU64::new(3));
    let events = h.events.clone();
    let remaining = budget.clone();
    let sink = move |event: MonitorEvent| -> Result<(), Interrupted> {
        if event.entry().is_some()
            && remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(Interrupted);
        }
        events.lock().push(event);
        Ok(())
    };
    let mut monitor = h.build(StartMode::Fresh, Harness::config(), h.store(), Box::new(sink));

    assert_eq!(monitor.run_passes(1).unwrap(), 0);
    assert_eq!(h.changes().len(), 3);

    budget.store(u64::MAX, Ordering::SeqCst);
    assert_eq!(monitor.run_passes(1).unwrap(), 1);
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddFile, "/data/c.txt"),
            change(Action::AddFile, "/data/d.txt"),
        ]
    );
}

#[test]
fn test_interruption_before_any_event_leaves_no_partial() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");

    let mut monitor = h.monitor_with(StartMode::Fresh, Harness::config(), h.store(), Some(0));
    assert_eq!(monitor.run_passes(1).unwrap(), 0);
    assert!(h.store().generations().unwrap().is_empty());
}

#[test]
fn test_resume_twice_from_same_checkpoint() {
    let h = Harness::new();
    for name in ["a", "b", "c"] {
        h.fs.add_file(&format!("/data/{name}.txt"), name);
    }

    let mut monitor = h.monitor_with(StartMode::Fresh, Harness::config(), h.store(), Some(2));
    monitor.run_passes(1).unwrap();
    let checkpoint = h.last_checkpoint().unwrap();
    h.changes();

    // Crash again while resuming, before any new event is accepted
    let mut monitor = h.monitor_with(
        StartMode::Resume(checkpoint.clone()),
        Harness::config(),
        h.store(),
        Some(0),
    );
    monitor.run_passes(1).unwrap();
    assert!(h.changes().is_empty());

    let mut monitor = h.monitor(StartMode::Resume(checkpoint));
    monitor.run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddFile, "/data/b.txt"),
            change(Action::AddFile, "/data/c.txt"),
        ]
    );
}

#[test]
fn test_writer_failure_preserves_dispatched_prefix() {
    let h = Harness::new();
    for name in ["a", "b", "c", "d"] {
        h.fs.add_file(&format!("/data/{name}.txt"), name);
    }

    let mut store = h.store();
    store.fail_writes_after(Some(3));
    let config = MonitorConfig {
        max_consecutive_failures: 1,
        ..Harness::config()
    };
    let err = h
        .monitor_with(StartMode::Fresh, config, store, None)
        .run_passes(1)
        .unwrap_err();
    assert!(matches!(
        err,
        MonitorError::Walk {
            source: WalkError::Writer(_),
            ..
        }
    ));
    assert_eq!(h.changes().len(), 3);

    // The dispatched prefix was rebuilt as a complete generation
    let store = h.store();
    let stitched = store.most_recent_generation().unwrap().unwrap();
    let paths: Vec<String> = store
        .open_snapshot(stitched)
        .unwrap()
        .map(|record| record.unwrap().path)
        .collect();
    assert_eq!(paths, vec!["/data/", "/data/a.txt", "/data/b.txt"]);

    h.monitor(StartMode::Continue).run_passes(1).unwrap();
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddFile, "/data/c.txt"),
            change(Action::AddFile, "/data/d.txt"),
        ]
    );
}

fn generations(store: &SnapshotStore) -> Vec<u64> {
    store
        .generations()
        .unwrap()
        .into_iter()
        .map(|info| info.generation)
        .collect()
}

#[test]
fn test_close_failure_recovers_like_a_write_failure() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");
    h.fs.add_file("/data/b.txt", "bee");

    let store = h.store();
    store.fail_next_close();
    let config = MonitorConfig {
        max_consecutive_failures: 2,
        ..Harness::config()
    };
    let mut monitor = h.monitor_with(StartMode::Fresh, config, store, None);

    // The failed pass is retried against the rebuilt generation, reporting nothing twice
    assert_eq!(monitor.run_passes(1).unwrap(), 1);
    assert_eq!(
        h.changes(),
        vec![
            change(Action::AddDir, "/data/"),
            change(Action::AddFile, "/data/a.txt"),
            change(Action::AddFile, "/data/b.txt"),
        ]
    );

    h.fs.add_file("/data/c.txt", "sea");
    monitor.run_passes(1).unwrap();
    assert_eq!(h.changes(), vec![change(Action::AddFile, "/data/c.txt")]);
}

#[test]
fn test_garbage_collection_follows_guarantee() {
    let h = Harness::new();
    let mut monitor = h.monitor(StartMode::Fresh);
    let handle = monitor.handle();
    for n in 0..4 {
        h.fs.add_file("/data/a.txt", format!("v{n}"));
        monitor.run_passes(1).unwrap();
    }

    // The first dispatched event pins generation 1 until it is acknowledged
    assert_eq!(generations(monitor.store()), vec![1, 2, 3, 4]);

    assert!(handle.accept_guarantee(MonitorCheckpoint::new("test", 3, 2, 2)));
    assert!(!handle.accept_guarantee(MonitorCheckpoint::new("test", 2, 2, 2)));
    assert!(!handle.accept_guarantee(MonitorCheckpoint::new("other", 9, 0, 0)));

    h.fs.add_file("/data/a.txt", "v4");
    monitor.run_passes(1).unwrap();
    assert_eq!(generations(monitor.store()), vec![2, 3, 4, 5]);
}

#[test]
fn test_quiet_passes_do_not_accumulate() {
    let h = Harness::new();
    h.fs.add_file("/data/a.txt", "ay");

    let mut monitor = h.monitor(StartMode::Fresh);
    monitor.run_passes(5).unwrap();
    assert_eq!(generations(monitor.store()), vec![1, 5]);

    h.fs.add_file("/data/b.txt", "bee");
    monitor.run_passes(1).unwrap();
    monitor.run_passes(1).unwrap();
    // Generation 5 is the base of generation 6, which reported b.txt
    assert_eq!(generations(monitor.store()), vec![1, 5, 6, 7]);
}

// ============================================================================
// Change queue
// ============================================================================

#[test]
fn test_change_queue_receives_file_changes_only() {
    let h = Harness::new();
    h.fs.add_file("/data/sub/b.txt", "bee");
    h.fs.add_file("/data/a.txt", "ay");

    let mut queue = ChangeQueue::new(
        QueueConfig {
            capacity: 16,
            idle_sleep: Duration::ZERO,
        },
        Shutdown::new(),
    );
    let mut monitor = Monitor::new(MonitorParts {
        name: "queued".into(),
        root: ROOT.into(),
        file_system: Arc::new(h.fs.clone()),
        store: h.store(),
        sink: Box::new(queue.sender()),
        checksums: h.checksums.clone(),
        filter: DocumentFilter::accept_all(),
        filter_log: h.filter_log.clone(),
        config: Harness::config(),
        shutdown: Shutdown::new(),
        start: StartMode::Fresh,
    });
    monitor.run_passes(1).unwrap();

    let mut changes = Vec::new();
    while let Some(change) = queue.get_next_change() {
        changes.push((change.action, change.path));
    }
    assert_eq!(
        changes,
        vec![
            change(Action::AddFile, "/data/a.txt"),
            change(Action::AddFile, "/data/sub/b.txt"),
        ]
    );
    assert!(queue.is_empty());
}
