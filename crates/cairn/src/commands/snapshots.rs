//! Inspect a snapshot store

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Args;

use cairn::{SnapshotReader, SnapshotStore};

/// List the generations in a snapshot store
#[derive(Args, Debug)]
pub struct SnapshotsArgs {
    /// Snapshot store directory
    dir: PathBuf,
}

/// Print the records of one snapshot file as JSON lines
#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Snapshot file (complete or partial)
    file: PathBuf,
}

pub fn run(args: SnapshotsArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = SnapshotStore::open(&args.dir)?;
    let generations = store.generations()?;
    if generations.is_empty() {
        eprintln!("No snapshots in {:?}", args.dir);
        return Ok(());
    }

    let mut out = io::stdout().lock();
    for info in generations {
        let mut reader = SnapshotReader::open(&info.path, info.generation)?;
        let records = reader.skip_records(u64::MAX)?;
        writeln!(
            out,
            "{:>8}  {:<8}  {:>10} records  {}",
            info.generation,
            if info.complete { "complete" } else { "partial" },
            records,
            info.path.display()
        )?;
    }
    Ok(())
}

pub fn dump(args: DumpArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let reader = SnapshotReader::open(&args.file, 0)?;
    let mut out = io::stdout().lock();
    for record in reader {
        serde_json::to_writer(&mut out, &record?)?;
        writeln!(out)?;
    }
    Ok(())
}
