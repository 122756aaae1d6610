//! Which entries a scan records, and where skipped entries are reported.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

/// Why an entry was left out of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterReason {
    PatternMismatch,
    TooBig,
    UnsupportedMimeType,
    Unreadable,
    NotRegularFile,
    /// The native name has no exact UTF-8 path.
    InvalidName,
    /// Transient failure. The entry keeps its previous state.
    IoError,
    ListingFailed,
}

impl FilterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PatternMismatch => "PATTERN_MISMATCH",
            Self::TooBig => "TOO_BIG",
            Self::UnsupportedMimeType => "UNSUPPORTED_MIME_TYPE",
            Self::Unreadable => "UNREADABLE",
            Self::NotRegularFile => "NOT_REGULAR_FILE",
            Self::InvalidName => "INVALID_NAME",
            Self::IoError => "IO_EXCEPTION",
            Self::ListingFailed => "LISTING_FAILED",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer for skipped entries. Purely informational.
pub trait DocumentSink: Send + Sync {
    fn add(&self, path: &str, reason: FilterReason);
}

/// Forwards skips to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDocumentSink;

impl DocumentSink for LoggingDocumentSink {
    fn add(&self, path: &str, reason: FilterReason) {
        info!(path, %reason, "Skipped entry");
    }
}

/// Keeps every skip in memory.
#[derive(Debug, Default)]
pub struct RecordingDocumentSink {
    entries: Mutex<Vec<(String, FilterReason)>>,
}

impl RecordingDocumentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, FilterReason)> {
        self.entries.lock().clone()
    }

    pub fn reason_for(&self, path: &str) -> Option<FilterReason> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, reason)| *reason)
    }
}

impl DocumentSink for RecordingDocumentSink {
    fn add(&self, path: &str, reason: FilterReason) {
        self.entries.lock().push((path.to_string(), reason));
    }
}

/// Detects the MIME type of a path. Detection itself is provided by the embedder.
pub trait MimeTypeFinder: Send + Sync {
    fn mime_type(&self, path: &str) -> Option<String>;
}

/// Guesses from the file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionMimeTypeFinder;

impl MimeTypeFinder for ExtensionMimeTypeFinder {
    fn mime_type(&self, path: &str) -> Option<String> {
        mime_guess::from_path(path).first_raw().map(str::to_string)
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Filtering policy, fixed when a monitor is built.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    /// Files must match one of these globs. Empty accepts every file.
    pub include: Vec<String>,
    /// Files and directories matching any of these globs are skipped.
    pub exclude: Vec<String>,
    /// Files longer than this many bytes are skipped.
    pub max_size: Option<u64>,
    /// MIME types that are never recorded.
    pub excluded_mime_types: Vec<String>,
}

/// Include and exclude globs. `*` never crosses a `/`; use `**` for that.
#[derive(Debug, Clone)]
pub struct FilePatternMatcher {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl FilePatternMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, FilterError> {
        let include = if include.is_empty() {
            None
        } else {
            Some(build_set(include)?)
        };
        Ok(Self {
            include,
            exclude: build_set(exclude)?,
        })
    }

    /// Whether a file path passes both pattern lists.
    pub fn matches_file(&self, path: &str) -> bool {
        if self.exclude.is_match(path) {
            return false;
        }
        self.include.as_ref().is_none_or(|set| set.is_match(path))
    }

    /// Whether a directory is excluded. Directories are matched without their
    /// trailing separator, and include patterns never apply to them.
    pub fn excludes_directory(&self, path: &str) -> bool {
        let bare = path.strip_suffix('/').unwrap_or(path);
        self.exclude.is_match(bare) || self.exclude.is_match(path)
    }
}

impl Default for FilePatternMatcher {
    fn default() -> Self {
        Self {
            include: None,
            exclude: GlobSet::empty(),
        }
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, FilterError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| FilterError::Pattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FilterError::Pattern {
        pattern: patterns.join(", "),
        source,
    })
}

/// The complete skip policy applied by the walker.
#[derive(Clone, Default)]
pub struct DocumentFilter {
    patterns: FilePatternMatcher,
    max_size: Option<u64>,
    mime_finder: Option<Arc<dyn MimeTypeFinder>>,
    excluded_mime_types: HashSet<String>,
}

impl DocumentFilter {
    pub fn new(config: &FilterConfig) -> Result<Self, FilterError> {
        Ok(Self {
            patterns: FilePatternMatcher::new(&config.include, &config.exclude)?,
            max_size: config.max_size,
            mime_finder: None,
            excluded_mime_types: config.excluded_mime_types.iter().cloned().collect(),
        })
    }

    /// Accept everything.
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn with_mime_finder(mut self, finder: Arc<dyn MimeTypeFinder>) -> Self {
        self.mime_finder = Some(finder);
        self
    }

    pub fn matches_file(&self, path: &str) -> bool {
        self.patterns.matches_file(path)
    }

    pub fn excludes_directory(&self, path: &str) -> bool {
        self.patterns.excludes_directory(path)
    }

    pub fn is_too_big(&self, length: u64) -> bool {
        self.max_size.is_some_and(|max| length > max)
    }

    /// Whether the MIME type of `path` is excluded. Paths whose type cannot be
    /// determined are allowed.
    pub fn is_unsupported_mime_type(&self, path: &str) -> bool {
        if self.excluded_mime_types.is_empty() {
            return false;
        }
        let finder: &dyn MimeTypeFinder = match &self.mime_finder {
            Some(finder) => finder.as_ref(),
            None => &ExtensionMimeTypeFinder,
        };
        finder
            .mime_type(path)
            .is_some_and(|mime| self.excluded_mime_types.contains(&mime))
    }
}

impl fmt::Debug for DocumentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentFilter")
            .field("patterns", &self.patterns)
            .field("max_size", &self.max_size)
            .field("custom_mime_finder", &self.mime_finder.is_some())
            .field("excluded_mime_types", &self.excluded_mime_types)
            .finish()
    }
}
