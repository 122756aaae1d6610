//! In-memory filesystem backend.
//!
//! Deterministic trees for tests and demos. Mutations go through the shared
//! [`MemoryFileSystem`] handle and are visible to every file fetched afterwards,
//! while a fetched [`MemoryFile`] keeps the metadata it saw at fetch time.
//! Failure hooks make entries unreadable or make their listing, content or
//! metadata calls fail.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Acl, DirectoryListingError, FileSystemType, ReadonlyFile, SEPARATOR};

pub const MEMORY_FILE_SYSTEM: &str = "memory";

#[derive(Debug, Clone)]
enum Kind {
    File(Arc<Vec<u8>>),
    Directory,
}

#[derive(Debug, Clone)]
struct Entry {
    kind: Kind,
    modified: i64,
    acl: Acl,
    readable: bool,
    fail_listing: bool,
    fail_read: bool,
    fail_metadata: bool,
}

impl Entry {
    fn new(kind: Kind, modified: i64) -> Self {
        Self {
            kind,
            modified,
            acl: Acl::Public,
            readable: true,
            fail_listing: false,
            fail_read: false,
            fail_metadata: false,
        }
    }
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    clock: i64,
}

impl Tree {
    fn tick(&mut self) -> i64 {
        self.clock += 1_000;
        self.clock
    }

    fn ensure_parents(&mut self, path: &str, modified: i64) {
        let trimmed = path.strip_suffix(SEPARATOR).unwrap_or(path);
        for (idx, ch) in trimmed.char_indices() {
            if ch == SEPARATOR {
                self.entries
                    .entry(trimmed[..=idx].to_string())
                    .or_insert_with(|| Entry::new(Kind::Directory, modified));
            }
        }
    }

    fn entry_mut(&mut self, path: &str) -> io::Result<&mut Entry> {
        self.entries
            .get_mut(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }
}

/// A cloneable handle to a shared in-memory tree.
#[derive(Debug, Clone)]
pub struct MemoryFileSystem {
    tree: Arc<RwLock<Tree>>,
    prefix: Arc<str>,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    /// A tree recognising absolute paths (`/...`).
    pub fn new() -> Self {
        Self::with_prefix("/")
    }

    /// A tree recognising only paths that start with `prefix`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            tree: Arc::new(RwLock::new(Tree::default())),
            prefix: Arc::from(prefix),
        }
    }

    /// Add a directory (path ends with `/`) and any missing parents.
    pub fn add_dir(&self, path: &str) {
        let mut tree = self.tree.write();
        let modified = tree.tick();
        tree.ensure_parents(path, modified);
        tree.entries
            .entry(path.to_string())
            .or_insert_with(|| Entry::new(Kind::Directory, modified));
    }

    /// Create or overwrite a file, stamping it with the next logical clock tick.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut tree = self.tree.write();
        let modified = tree.tick();
        Self::put_file(&mut tree, path, content.into(), modified);
    }

    /// Create or overwrite a file with an explicit modification time.
    pub fn write_file(&self, path: &str, content: impl Into<Vec<u8>>, modified: i64) {
        let mut tree = self.tree.write();
        Self::put_file(&mut tree, path, content.into(), modified);
    }

    fn put_file(tree: &mut Tree, path: &str, content: Vec<u8>, modified: i64) {
        tree.ensure_parents(path, modified);
        match tree.entries.get_mut(path) {
            Some(entry) => {
                entry.kind = Kind::File(Arc::new(content));
                entry.modified = modified;
            }
            None => {
                tree.entries.insert(
                    path.to_string(),
                    Entry::new(Kind::File(Arc::new(content)), modified),
                );
            }
        }
    }

    /// Remove an entry and, for directories, everything beneath it.
    pub fn remove(&self, path: &str) {
        let mut tree = self.tree.write();
        if path.ends_with(SEPARATOR) {
            tree.entries.retain(|key, _| !key.starts_with(path));
        } else {
            tree.entries.remove(path);
        }
    }

    pub fn set_modified(&self, path: &str, modified: i64) -> io::Result<()> {
        self.tree.write().entry_mut(path)?.modified = modified;
        Ok(())
    }

    pub fn set_acl(&self, path: &str, acl: Acl) -> io::Result<()> {
        self.tree.write().entry_mut(path)?.acl = acl;
        Ok(())
    }

    pub fn set_readable(&self, path: &str, readable: bool) -> io::Result<()> {
        self.tree.write().entry_mut(path)?.readable = readable;
        Ok(())
    }

    /// Make listing this directory fail.
    pub fn fail_listing(&self, path: &str, fail: bool) -> io::Result<()> {
        self.tree.write().entry_mut(path)?.fail_listing = fail;
        Ok(())
    }

    /// Make opening this file's content fail.
    pub fn fail_read(&self, path: &str, fail: bool) -> io::Result<()> {
        self.tree.write().entry_mut(path)?.fail_read = fail;
        Ok(())
    }

    /// Make every metadata accessor of this entry fail.
    pub fn fail_metadata(&self, path: &str, fail: bool) -> io::Result<()> {
        self.tree.write().entry_mut(path)?.fail_metadata = fail;
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.tree.read().entries.contains_key(path)
    }

    pub fn file(&self, path: &str) -> MemoryFile {
        MemoryFile {
            fs: self.clone(),
            path: path.to_string(),
            entry: self.tree.read().entries.get(path).cloned(),
        }
    }

    fn children(&self, parent: &str) -> Vec<MemoryFile> {
        let tree = self.tree.read();
        tree.entries
            .range::<str, _>((std::ops::Bound::Excluded(parent), std::ops::Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(parent))
            .filter(|(path, _)| {
                let rest = &path[parent.len()..];
                let rest = rest.strip_suffix(SEPARATOR).unwrap_or(rest);
                !rest.is_empty() && !rest.contains(SEPARATOR)
            })
            .map(|(path, entry)| MemoryFile {
                fs: self.clone(),
                path: path.clone(),
                entry: Some(entry.clone()),
            })
            .collect()
    }
}

impl FileSystemType for MemoryFileSystem {
    fn name(&self) -> &str {
        MEMORY_FILE_SYSTEM
    }

    fn is_path(&self, path: &str) -> bool {
        path.starts_with(&*self.prefix)
    }

    fn get_file(&self, path: &str) -> io::Result<Box<dyn ReadonlyFile>> {
        Ok(Box::new(self.file(path)))
    }
}

/// One entry of a [`MemoryFileSystem`], as seen when it was fetched.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    fs: MemoryFileSystem,
    path: String,
    entry: Option<Entry>,
}

impl MemoryFile {
    fn entry(&self) -> io::Result<&Entry> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.path.clone()))?;
        if entry.fail_metadata {
            return Err(io::Error::other(format!(
                "injected metadata failure on {}",
                self.path
            )));
        }
        Ok(entry)
    }
}

impl ReadonlyFile for MemoryFile {
    fn file_system_type(&self) -> &str {
        MEMORY_FILE_SYSTEM
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn display_url(&self) -> String {
        format!("memory://{}", self.path)
    }

    fn exists(&self) -> io::Result<bool> {
        Ok(self.entry.is_some())
    }

    fn can_read(&self) -> io::Result<bool> {
        Ok(self.entry()?.readable)
    }

    fn is_directory(&self) -> io::Result<bool> {
        Ok(matches!(self.entry()?.kind, Kind::Directory))
    }

    fn is_regular_file(&self) -> io::Result<bool> {
        Ok(matches!(self.entry()?.kind, Kind::File(_)))
    }

    fn length(&self) -> io::Result<u64> {
        Ok(match &self.entry()?.kind {
            Kind::File(content) => content.len() as u64,
            Kind::Directory => 0,
        })
    }

    fn last_modified(&self) -> io::Result<i64> {
        Ok(self.entry()?.modified)
    }

    fn acl(&self) -> io::Result<Acl> {
        Ok(self.entry()?.acl.clone())
    }

    fn input_stream(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        let entry = self.entry()?;
        if entry.fail_read || !entry.readable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot read {}", self.path),
            ));
        }
        match &entry.kind {
            Kind::File(content) => Ok(Box::new(Cursor::new(content.as_slice()))),
            Kind::Directory => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", self.path),
            )),
        }
    }

    fn list_files(&self) -> Result<Vec<Box<dyn ReadonlyFile>>, DirectoryListingError> {
        let entry = self
            .entry()
            .map_err(|err| DirectoryListingError::new(&self.path, err))?;
        if entry.fail_listing {
            return Err(DirectoryListingError::new(
                &self.path,
                io::Error::other("injected listing failure"),
            ));
        }
        if !matches!(entry.kind, Kind::Directory) {
            return Err(DirectoryListingError::new(
                &self.path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        // BTreeMap order is byte order, which is already snapshot order
        Ok(self
            .fs
            .children(&self.path)
            .into_iter()
            .map(|file| Box::new(file) as Box<dyn ReadonlyFile>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(file: &dyn ReadonlyFile) -> Vec<u8> {
        let mut buf = Vec::new();
        file.input_stream().unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn parents_are_created() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/data/sub/a.txt", "hello");
        assert!(fs.contains("/"));
        assert!(fs.contains("/data/"));
        assert!(fs.contains("/data/sub/"));
    }

    #[test]
    fn listing_returns_immediate_children_sorted() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/data/b.txt", "b");
        fs.add_file("/data/a/x.txt", "x");
        fs.add_file("/data/a.txt", "a");
        fs.add_file("/data0/zzz", "z");

        let root = fs.file("/data/");
        let names: Vec<String> = root
            .list_files()
            .unwrap()
            .iter()
            .map(|f| f.path().to_string())
            .collect();
        assert_eq!(names, vec!["/data/a.txt", "/data/a/", "/data/b.txt"]);
    }

    #[test]
    fn fetched_file_keeps_its_metadata() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/f", "one", 5_000);
        let before = fs.file("/f");
        fs.write_file("/f", "three", 9_000);

        assert_eq!(before.last_modified().unwrap(), 5_000);
        assert_eq!(read_all(&before), b"one");
        assert_eq!(fs.file("/f").length().unwrap(), 5);
    }

    #[test]
    fn remove_directory_removes_subtree() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/d/x", "x");
        fs.add_file("/d/y/z", "z");
        fs.remove("/d/");
        assert!(!fs.contains("/d/y/z"));
        assert!(!fs.file("/d/x").exists().unwrap());
    }

    #[test]
    fn injected_failures() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/d/x", "x");
        fs.fail_listing("/d/", true).unwrap();
        fs.fail_read("/d/x", true).unwrap();

        assert!(fs.file("/d/").list_files().is_err());
        assert!(fs.file("/d/x").input_stream().is_err());

        fs.fail_metadata("/d/x", true).unwrap();
        assert!(fs.file("/d/x").is_directory().is_err());
    }
}
