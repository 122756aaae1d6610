//! Run a single monitor for a few passes and print what changed

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::info;

use cairn::fs::FileSystemRegistry;
use cairn::{
    Blake3Checksum, Change, DocumentFilter, Interrupted, LoggingDocumentSink, Monitor,
    MonitorConfig, MonitorEvent, MonitorParts, Shutdown, SnapshotStore, StartMode,
};

use super::{FilterArgs, resolve_root};

/// Run a single monitor for a few passes and print what changed
#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Root directory to scan
    root: PathBuf,

    /// Snapshot store directory
    #[arg(long, short = 's')]
    snapshots: PathBuf,

    /// Number of passes to run
    #[arg(long, short = 'n', default_value_t = 1)]
    passes: u64,

    /// Pause between passes
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Time a new checksum must hold before it is trusted
    #[arg(long, default_value_t = 10_000)]
    stability_window_ms: u64,

    #[command(flatten)]
    filter: FilterArgs,
}

pub fn run(args: ScanArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let root = resolve_root(&args.root)?;
    let registry = FileSystemRegistry::with_local();
    let file_system = registry.file_system_for(&root)?;
    let store = SnapshotStore::open(&args.snapshots)?;

    let sink = |event: MonitorEvent| -> Result<(), Interrupted> {
        if let Some(change) = Change::from_event(event) {
            print_change(&change).map_err(|_| Interrupted)?;
        }
        Ok(())
    };

    let mut monitor = Monitor::new(MonitorParts {
        name: "scan".into(),
        root: root.clone(),
        file_system,
        store,
        sink: Box::new(sink),
        checksums: Arc::new(Blake3Checksum),
        filter: DocumentFilter::new(&args.filter.to_config())?,
        filter_log: Arc::new(LoggingDocumentSink),
        config: MonitorConfig {
            pass_interval: Duration::from_millis(args.interval_ms),
            stability_window: Duration::from_millis(args.stability_window_ms),
            retain_unacknowledged: false,
            ..MonitorConfig::default()
        },
        shutdown: Shutdown::new(),
        start: StartMode::Continue,
    });

    let passes = monitor.run_passes(args.passes)?;
    info!(%root, passes, "Scan finished");
    Ok(())
}

fn print_change(change: &Change) -> io::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, change)?;
    writeln!(out)
}
