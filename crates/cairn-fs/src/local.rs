//! Local filesystem backend (unix).

use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use nix::unistd::{AccessFlags, Gid, Group, Uid, User, access};
use tracing::debug;

use crate::{Acl, DirectoryListingError, FileSystemType, ReadonlyFile, SEPARATOR, sort_by_path};

pub const LOCAL_FILE_SYSTEM: &str = "local";

/// Settings for the local backend, fixed at construction.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Report world-readable entries as [`Acl::Public`] instead of listing their owner.
    pub public_if_world_readable: bool,
    /// Resolve owner and group ids to names. When disabled, numeric ids are used.
    pub resolve_names: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            public_if_world_readable: true,
            resolve_names: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    config: LocalConfig,
}

impl LocalFileSystem {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    pub fn file(&self, path: impl AsRef<Path>) -> io::Result<LocalFile> {
        LocalFile::fetch(path.as_ref().to_path_buf(), self.config.clone())
    }
}

impl FileSystemType for LocalFileSystem {
    fn name(&self) -> &str {
        LOCAL_FILE_SYSTEM
    }

    fn is_path(&self, path: &str) -> bool {
        path.starts_with(SEPARATOR)
    }

    fn get_file(&self, path: &str) -> io::Result<Box<dyn ReadonlyFile>> {
        Ok(Box::new(self.file(path)?))
    }
}

/// A local path with the metadata read when it was fetched.
#[derive(Debug, Clone)]
pub struct LocalFile {
    os_path: PathBuf,
    path: String,
    exact: bool,
    metadata: Option<Metadata>,
    stat_error: Option<(io::ErrorKind, String)>,
    config: LocalConfig,
}

impl LocalFile {
    fn fetch(os_path: PathBuf, config: LocalConfig) -> io::Result<Self> {
        let metadata = match fs::symlink_metadata(&os_path) {
            Ok(metadata) => Some(metadata),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };

        let is_dir = metadata.as_ref().is_some_and(Metadata::is_dir);
        Ok(Self {
            path: display_path(&os_path, is_dir),
            exact: os_path.to_str().is_some(),
            os_path,
            metadata,
            stat_error: None,
            config,
        })
    }

    /// A child whose metadata could not be read. Its accessors fail with `err`.
    fn unobservable(os_path: PathBuf, is_dir: bool, err: &io::Error, config: LocalConfig) -> Self {
        Self {
            path: display_path(&os_path, is_dir),
            exact: os_path.to_str().is_some(),
            os_path,
            metadata: None,
            stat_error: Some((err.kind(), err.to_string())),
            config,
        }
    }

    fn stat_error(&self) -> io::Result<()> {
        match &self.stat_error {
            Some((kind, message)) => Err(io::Error::new(*kind, message.clone())),
            None => Ok(()),
        }
    }

    fn metadata(&self) -> io::Result<&Metadata> {
        self.stat_error()?;
        self.metadata
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.path.clone()))
    }

    fn owner_name(&self, uid: u32) -> String {
        if self.config.resolve_names
            && let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid))
        {
            return user.name;
        }
        uid.to_string()
    }

    fn group_name(&self, gid: u32) -> String {
        if self.config.resolve_names
            && let Ok(Some(group)) = Group::from_gid(Gid::from_raw(gid))
        {
            return group.name;
        }
        gid.to_string()
    }
}

impl ReadonlyFile for LocalFile {
    fn file_system_type(&self) -> &str {
        LOCAL_FILE_SYSTEM
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn has_exact_path(&self) -> bool {
        self.exact
    }

    fn display_url(&self) -> String {
        format!("file://{}", self.path)
    }

    fn exists(&self) -> io::Result<bool> {
        self.stat_error()?;
        Ok(self.metadata.is_some())
    }

    fn can_read(&self) -> io::Result<bool> {
        self.metadata()?;
        match access(&self.os_path, AccessFlags::R_OK) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::EACCES) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn is_directory(&self) -> io::Result<bool> {
        Ok(self.metadata()?.is_dir())
    }

    fn is_regular_file(&self) -> io::Result<bool> {
        // symlink_metadata: links are neither files nor directories here
        Ok(self.metadata()?.file_type().is_file())
    }

    fn length(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn last_modified(&self) -> io::Result<i64> {
        let modified = self.metadata()?.modified()?;
        let ts = Timestamp::try_from(modified).map_err(io::Error::other)?;
        Ok(ts.as_millisecond())
    }

    fn acl(&self) -> io::Result<Acl> {
        let metadata = self.metadata()?;
        let mode = metadata.permissions().mode();
        if self.config.public_if_world_readable && mode & 0o004 != 0 {
            return Ok(Acl::Public);
        }

        let users = [self.owner_name(metadata.uid())];
        let groups: Vec<String> = if mode & 0o040 != 0 {
            vec![self.group_name(metadata.gid())]
        } else {
            Vec::new()
        };
        Ok(Acl::restricted(users, groups))
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        let file = File::open(&self.os_path)?;
        Ok(Box::new(BufReader::with_capacity(128 * 1024, file)))
    }

    fn list_files(&self) -> Result<Vec<Box<dyn ReadonlyFile>>, DirectoryListingError> {
        let entries =
            fs::read_dir(&self.os_path).map_err(|err| DirectoryListingError::new(&self.path, err))?;

        let mut children: Vec<Box<dyn ReadonlyFile>> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| DirectoryListingError::new(&self.path, err))?;
            match LocalFile::fetch(entry.path(), self.config.clone()) {
                Ok(child) => children.push(Box::new(child)),
                Err(err) => {
                    // Keep the child so the walker reports it as unobservable
                    debug!(path = ?entry.path(), %err, "Failed to stat directory entry");
                    let is_dir = entry.file_type().is_ok_and(|kind| kind.is_dir());
                    children.push(Box::new(LocalFile::unobservable(
                        entry.path(),
                        is_dir,
                        &err,
                        self.config.clone(),
                    )));
                }
            }
        }

        sort_by_path(&mut children);
        Ok(children)
    }
}

fn display_path(os_path: &Path, is_dir: bool) -> String {
    let mut path = os_path.to_string_lossy().into_owned();
    if is_dir && !path.ends_with(SEPARATOR) {
        path.push(SEPARATOR);
    }
    path
}
