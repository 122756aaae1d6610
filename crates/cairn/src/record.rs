//! Snapshot records and their line codec.
//!
//! A snapshot file holds one JSON object per line, each describing one path as it was
//! seen by a scan. Every line carries a `SCHEMA` discriminator so the format can
//! evolve; readers reject discriminators they do not know.

use cairn_fs::Acl;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Discriminator written on every record line.
pub const RECORD_SCHEMA: &str = "cairn.snapshot.record/1";

const SCHEMA_FIELD: &str = "SCHEMA";

const REQUIRED_FIELDS: [&str; 8] = [
    "FILESYS", "PATH", "TYPE", "MODTIME", "ACL", "CHECKSUM", "SCANTIME", "STABLE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "DIR")]
    Directory,
}

/// What one scan recorded about one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(rename = "FILESYS")]
    pub file_system: String,
    #[serde(rename = "PATH")]
    pub path: String,
    #[serde(rename = "TYPE")]
    pub entry_type: EntryType,
    /// Last modification time, epoch milliseconds.
    #[serde(rename = "MODTIME")]
    pub last_modified: i64,
    #[serde(rename = "ACL")]
    pub acl: Acl,
    /// Hex content checksum; empty for directories.
    #[serde(rename = "CHECKSUM")]
    pub checksum: String,
    /// When the current checksum was first observed, epoch milliseconds.
    #[serde(rename = "SCANTIME")]
    pub scan_time: i64,
    /// The checksum has been confirmed across scans separated by the stability window.
    #[serde(rename = "STABLE")]
    pub stable: bool,
    #[serde(rename = "SIZE", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl SnapshotRecord {
    pub fn directory(
        file_system: impl Into<String>,
        path: impl Into<String>,
        last_modified: i64,
        acl: Acl,
        scan_time: i64,
    ) -> Self {
        Self {
            file_system: file_system.into(),
            path: path.into(),
            entry_type: EntryType::Directory,
            last_modified,
            acl,
            checksum: String::new(),
            scan_time,
            stable: true,
            size: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    /// Encode as one line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Line<'a> {
            #[serde(rename = "SCHEMA")]
            schema: &'static str,
            #[serde(flatten)]
            record: &'a SnapshotRecord,
        }

        serde_json::to_string(&Line {
            schema: RECORD_SCHEMA,
            record: self,
        })
    }

    /// Decode one line.
    pub fn from_line(line: &str) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_str(line).map_err(RecordError::Malformed)?;
        let Value::Object(fields) = &value else {
            return Err(RecordError::NotAnObject);
        };

        match fields.get(SCHEMA_FIELD) {
            None => return Err(RecordError::MissingField(SCHEMA_FIELD)),
            Some(Value::String(schema)) if schema == RECORD_SCHEMA => {}
            Some(other) => return Err(RecordError::UnknownSchema(other.to_string())),
        }

        if let Some(missing) = REQUIRED_FIELDS
            .iter()
            .find(|name| !fields.contains_key(**name))
        {
            return Err(RecordError::MissingField(*missing));
        }

        serde_json::from_value(value).map_err(RecordError::InvalidField)
    }
}

/// A record line could not be decoded.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("record is not valid UTF-8: {0}")]
    NotUtf8(#[source] std::str::Utf8Error),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("unknown record schema {0}")]
    UnknownSchema(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(#[source] serde_json::Error),
}
