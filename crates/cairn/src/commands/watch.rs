//! Monitor roots and stream their changes as JSON lines

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::Args;
use tracing::{info, warn};

use cairn::fs::FileSystemRegistry;
use cairn::store::sync_dir;
use cairn::{FileConnectorCheckpoint, ManagerConfig, MonitorManager};

use super::{FilterArgs, resolve_root};

const CHECKPOINT_FILE: &str = "checkpoint";

/// Monitor roots and stream their changes as JSON lines
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Root directories to monitor
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Directory for snapshots, recovery files and the consumer checkpoint
    #[arg(long, short = 's')]
    state: PathBuf,

    /// Maximum changes per batch
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Changes buffered between monitors and the batcher
    #[arg(long, default_value_t = 1000)]
    queue_capacity: usize,

    /// Wait between polls when no changes are available
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Monitor pause after a pass that found nothing
    #[arg(long, default_value_t = 5000)]
    idle_sleep_ms: u64,

    /// Time a new checksum must hold before it is trusted
    #[arg(long, default_value_t = 10_000)]
    stability_window_ms: u64,

    /// Stop after this many non-empty batches
    #[arg(long)]
    max_batches: Option<u64>,

    #[command(flatten)]
    filter: FilterArgs,
}

pub fn run(args: WatchArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    fs::create_dir_all(&args.state)?;
    let roots = args
        .roots
        .iter()
        .map(|root| resolve_root(root))
        .collect::<io::Result<Vec<_>>>()?;

    let mut config = ManagerConfig::new(&args.state, roots);
    config.max_batch = args.batch_size;
    config.queue.capacity = args.queue_capacity;
    config.queue.idle_sleep = Duration::from_millis(args.idle_sleep_ms);
    config.monitor.stability_window = Duration::from_millis(args.stability_window_ms);
    config.filter = args.filter.to_config();

    let checkpoint_path = args.state.join(CHECKPOINT_FILE);
    let mut checkpoint = read_checkpoint(&checkpoint_path)?;
    info!(checkpoint = ?checkpoint.map(|c| c.to_string()), "Starting watch");

    let mut manager = MonitorManager::new(config, FileSystemRegistry::with_local());
    manager.start(checkpoint)?;

    let poll_interval = Duration::from_millis(args.poll_interval_ms);
    let mut batches = 0;
    let stdout = io::stdout();
    loop {
        if args.max_batches.is_some_and(|max| batches >= max) {
            break;
        }

        let batch = manager.resume(checkpoint)?;
        let Some(last) = batch.last() else {
            if manager.has_stopped_monitor() {
                warn!("A monitor has stopped, shutting down");
                break;
            }
            thread::sleep(poll_interval);
            continue;
        };

        let mut out = stdout.lock();
        for item in &batch {
            serde_json::to_writer(&mut out, item)?;
            writeln!(out)?;
        }
        out.flush()?;

        checkpoint = Some(last.checkpoint);
        write_checkpoint(&checkpoint_path, last.checkpoint)?;
        batches += 1;
    }

    manager.stop()?;
    Ok(())
}

fn read_checkpoint(
    path: &Path,
) -> Result<Option<FileConnectorCheckpoint>, Box<dyn std::error::Error + Send + Sync>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().parse()?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_checkpoint(path: &Path, checkpoint: FileConnectorCheckpoint) -> io::Result<()> {
    let staging = path.with_extension("new");
    fs::write(&staging, checkpoint.to_string())?;
    fs::File::open(&staging)?.sync_all()?;
    fs::rename(&staging, path)?;
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => sync_dir(dir),
        _ => sync_dir(Path::new(".")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_file_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        assert_eq!(read_checkpoint(&path).unwrap(), None);

        write_checkpoint(&path, FileConnectorCheckpoint::new(3, 7)).unwrap();
        write_checkpoint(&path, FileConnectorCheckpoint::new(4, 1)).unwrap();
        assert_eq!(
            read_checkpoint(&path).unwrap(),
            Some(FileConnectorCheckpoint::new(4, 1))
        );
        assert!(!path.with_extension("new").exists());
    }
}
