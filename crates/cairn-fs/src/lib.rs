//! Read-only views of filesystem entries.
//!
//! This crate provides the narrow capability set the change detector needs from a
//! filesystem backend: metadata, access control, content and sorted child listings.
//! Backends are selected per path through a [`FileSystemRegistry`].

use std::fmt;
use std::io::{self, Read};

use thiserror::Error;

mod acl;
#[cfg(unix)]
pub mod local;
pub mod memory;
mod registry;

pub use acl::Acl;
#[cfg(unix)]
pub use local::{LocalConfig, LocalFileSystem};
pub use memory::MemoryFileSystem;
pub use registry::{FileSystemRegistry, UnrecognizedPath};

/// Path separator used by every backend. Directory paths end with it.
pub const SEPARATOR: char = '/';

/// A directory could not be listed.
#[derive(Debug, Error)]
#[error("failed to list directory {path}: {source}")]
pub struct DirectoryListingError {
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl DirectoryListingError {
    pub fn new(path: impl Into<String>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// An immutable view of one filesystem entry at the time it was fetched.
///
/// Every accessor may fail; callers treat failures on anything but the scan root as
/// "this entry is not observable right now".
pub trait ReadonlyFile: fmt::Debug + Send + Sync {
    /// Name of the backend that produced this entry (e.g. `local`).
    fn file_system_type(&self) -> &str;

    /// Absolute path. Directories carry a trailing [`SEPARATOR`].
    fn path(&self) -> &str;

    /// Whether [`path`](Self::path) names this entry exactly. False when the native name
    /// is not valid UTF-8 and the path is only a lossy rendering of it.
    fn has_exact_path(&self) -> bool {
        true
    }

    /// Human-facing location, such as a `file://` URL.
    fn display_url(&self) -> String;

    fn exists(&self) -> io::Result<bool>;

    fn can_read(&self) -> io::Result<bool>;

    fn is_directory(&self) -> io::Result<bool>;

    fn is_regular_file(&self) -> io::Result<bool>;

    /// Content length in bytes.
    fn length(&self) -> io::Result<u64>;

    /// Last modification time in epoch milliseconds.
    fn last_modified(&self) -> io::Result<i64>;

    fn acl(&self) -> io::Result<Acl>;

    /// Open the content for reading.
    fn input_stream(&self) -> io::Result<Box<dyn Read + Send + '_>>;

    /// List the children of a directory, sorted by path.
    fn list_files(&self) -> Result<Vec<Box<dyn ReadonlyFile>>, DirectoryListingError>;
}

/// A filesystem backend that can produce [`ReadonlyFile`]s for the paths it recognises.
pub trait FileSystemType: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `path` belongs to this backend.
    fn is_path(&self, path: &str) -> bool;

    /// Fetch a fresh view of `path`.
    fn get_file(&self, path: &str) -> io::Result<Box<dyn ReadonlyFile>>;
}

/// Sort entries the way snapshots are ordered: byte-wise on the full path.
pub fn sort_by_path(files: &mut [Box<dyn ReadonlyFile>]) {
    files.sort_by(|a, b| a.path().cmp(b.path()));
}

/// Join a directory path and a child name, adding the directory marker when needed.
pub fn child_path(parent: &str, name: &str, is_directory: bool) -> String {
    let mut path = String::with_capacity(parent.len() + name.len() + 2);
    path.push_str(parent);
    if !path.ends_with(SEPARATOR) {
        path.push(SEPARATOR);
    }
    path.push_str(name);
    if is_directory {
        path.push(SEPARATOR);
    }
    path
}
