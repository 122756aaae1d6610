use std::path::{Path, PathBuf};

use clap::Args;

use cairn::FilterConfig;

pub mod scan;
pub mod snapshots;
pub mod watch;

/// Entry filtering options shared by the scanning commands.
#[derive(Args, Debug)]
pub struct FilterArgs {
    /// Only report files matching this glob (can be specified multiple times)
    #[arg(long)]
    include: Vec<String>,

    /// Skip files and directories matching this glob (can be specified multiple times)
    #[arg(long)]
    exclude: Vec<String>,

    /// Skip files larger than this many bytes
    #[arg(long)]
    max_size: Option<u64>,
}

impl FilterArgs {
    pub fn to_config(&self) -> FilterConfig {
        FilterConfig {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            max_size: self.max_size,
            ..FilterConfig::default()
        }
    }
}

/// Absolute form of a root given on the command line.
pub fn resolve_root(root: &Path) -> std::io::Result<String> {
    let root: PathBuf = root.canonicalize()?;
    Ok(root.to_string_lossy().into_owned())
}
