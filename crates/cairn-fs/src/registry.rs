use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::{FileSystemType, ReadonlyFile};

/// No registered backend recognised a path.
#[derive(Debug, Error)]
#[error("no filesystem backend recognises path {0:?}")]
pub struct UnrecognizedPath(pub String);

impl From<UnrecognizedPath> for io::Error {
    fn from(err: UnrecognizedPath) -> Self {
        io::Error::new(io::ErrorKind::NotFound, err)
    }
}

/// Ordered set of backends. The first backend whose [`FileSystemType::is_path`]
/// accepts a path handles it.
#[derive(Clone, Default)]
pub struct FileSystemRegistry {
    types: Vec<Arc<dyn FileSystemType>>,
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the local filesystem backend and default settings.
    #[cfg(unix)]
    pub fn with_local() -> Self {
        let mut registry = Self::new();
        registry.register(crate::LocalFileSystem::new(crate::LocalConfig::default()));
        registry
    }

    pub fn register(&mut self, file_system: impl FileSystemType + 'static) -> &mut Self {
        self.types.push(Arc::new(file_system));
        self
    }

    pub fn register_shared(&mut self, file_system: Arc<dyn FileSystemType>) -> &mut Self {
        self.types.push(file_system);
        self
    }

    /// The backend responsible for `path`.
    pub fn file_system_for(&self, path: &str) -> Result<Arc<dyn FileSystemType>, UnrecognizedPath> {
        let found = self
            .types
            .iter()
            .find(|fs| fs.is_path(path))
            .cloned()
            .ok_or_else(|| UnrecognizedPath(path.to_string()))?;
        debug!(path, backend = found.name(), "Resolved filesystem backend");
        Ok(found)
    }

    pub fn get_file(&self, path: &str) -> io::Result<Box<dyn ReadonlyFile>> {
        self.file_system_for(path)?.get_file(path)
    }

    pub fn names(&self) -> Vec<&str> {
        self.types.iter().map(|fs| fs.name()).collect()
    }
}

impl std::fmt::Debug for FileSystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemRegistry")
            .field("types", &self.names())
            .finish()
    }
}
