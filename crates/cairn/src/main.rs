use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(about = "Detect filesystem changes by diffing successive snapshots")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    Watch(commands::watch::WatchArgs),
    Scan(commands::scan::ScanArgs),
    Snapshots(commands::snapshots::SnapshotsArgs),
    Dump(commands::snapshots::DumpArgs),
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    match args.command {
        Command::Watch(args) => commands::watch::run(args),
        Command::Scan(args) => commands::scan::run(args),
        Command::Snapshots(args) => commands::snapshots::run(args),
        Command::Dump(args) => commands::snapshots::dump(args),
    }
}
