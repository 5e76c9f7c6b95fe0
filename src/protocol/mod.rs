//! Leader Protocol
//!
//! Request parameters, structured responses and the packetized file stream
//! spoken between a follower and its leader.

pub mod packet;
pub mod value;

pub use packet::{Packet, PacketReader, PacketWriter};
pub use value::{Value, ValueMap};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// Request parameter names
pub const PARAM_COMMAND: &str = "command";
pub const PARAM_INDEX_VERSION: &str = "indexversion";
pub const PARAM_FILE: &str = "file";
pub const PARAM_CONF_FILE: &str = "cf";
pub const PARAM_OFFSET: &str = "offset";
pub const PARAM_CHECKSUM: &str = "checksum";
pub const PARAM_COMPRESSION: &str = "compression";
pub const PARAM_WT: &str = "wt";

// Commands
pub const CMD_COMMIT_INFO: &str = "indexversion";
pub const CMD_FILE_LIST: &str = "filelist";
pub const CMD_FILE_CONTENT: &str = "filecontent";

// Response formats
pub const WT_BINARY: &str = "binary";
pub const WT_FILE_STREAM: &str = "filestream";

// Response keys
const KEY_VERSION: &str = "indexversion";
const KEY_GENERATION: &str = "generation";
const KEY_FILES: &str = "filelist";
const KEY_CONF_FILES: &str = "confFiles";
const KEY_NAME: &str = "name";
const KEY_SIZE: &str = "size";
const KEY_CHECKSUM: &str = "checksum";
const KEY_LAST_MODIFIED: &str = "lastmodified";
const KEY_ALIAS: &str = "alias";

/// Prefix of the index manifest file
pub const MANIFEST_PREFIX: &str = "segments_";

/// Check whether a file name is the index manifest
pub fn is_manifest(name: &str) -> bool {
    name.starts_with(MANIFEST_PREFIX)
}

/// Identity of an immutable index snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CommitPoint {
    pub version: i64,
    pub generation: i64,
}

impl CommitPoint {
    /// Version the leader reports before its first commit
    pub const NO_COMMIT: i64 = 0;

    pub fn new(version: i64, generation: i64) -> Self {
        Self { version, generation }
    }

    /// True when the leader has nothing to replicate yet
    pub fn is_empty(&self) -> bool {
        self.version == Self::NO_COMMIT
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::Protocol("commit info is not a map".into()))?;
        Ok(Self {
            version: required_i64(map, KEY_VERSION, "commit info")?,
            generation: required_i64(map, KEY_GENERATION, "commit info")?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(KEY_VERSION, Value::Long(self.version))
            .insert(KEY_GENERATION, Value::Long(self.generation));
        Value::Map(map)
    }
}

impl std::fmt::Display for CommitPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "version={} generation={}", self.version, self.generation)
    }
}

/// Whether a file belongs to the index or to the configuration set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Index,
    Conf,
}

/// A file as advertised by the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// Whole-file checksum; the leader sends it for configuration files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<i64>,
    /// Milliseconds since the epoch
    pub last_modified: i64,
    /// Local name for configuration files saved under a different name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// A single path component that stays inside its target directory
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, last_modified: i64) -> Self {
        Self {
            name: name.into(),
            size,
            checksum: None,
            last_modified,
            alias: None,
        }
    }

    pub fn with_checksum(mut self, checksum: i64) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name the file is stored under on this node
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Advertised modification time
    pub fn modified_time(&self) -> SystemTime {
        if self.last_modified >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.last_modified as u64)
        } else {
            UNIX_EPOCH
        }
    }

    pub fn is_manifest(&self) -> bool {
        is_manifest(&self.name)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::Protocol("file descriptor is not a map".into()))?;

        let name = map
            .get(KEY_NAME)
            .and_then(Value::as_str)
            .ok_or(Error::MissingField { field: KEY_NAME, context: "file descriptor" })?;
        if !is_plain_file_name(name) {
            return Err(Error::Protocol(format!("Illegal file name: {:?}", name)));
        }

        let size = required_i64(map, KEY_SIZE, "file descriptor")?;
        if size < 0 {
            return Err(Error::Protocol(format!("Negative size for {}: {}", name, size)));
        }

        let alias = match map.get(KEY_ALIAS) {
            Some(Value::Str(alias)) if is_plain_file_name(alias) => Some(alias.clone()),
            Some(Value::Str(alias)) => {
                return Err(Error::Protocol(format!("Illegal alias: {:?}", alias)))
            }
            _ => None,
        };

        Ok(Self {
            name: name.to_string(),
            size: size as u64,
            checksum: map.get(KEY_CHECKSUM).and_then(Value::as_i64),
            last_modified: map.get(KEY_LAST_MODIFIED).and_then(Value::as_i64).unwrap_or(0),
            alias,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(KEY_NAME, Value::Str(self.name.clone()))
            .insert(KEY_SIZE, Value::Long(self.size as i64))
            .insert(KEY_LAST_MODIFIED, Value::Long(self.last_modified));
        if let Some(checksum) = self.checksum {
            map.insert(KEY_CHECKSUM, Value::Long(checksum));
        }
        if let Some(alias) = &self.alias {
            map.insert(KEY_ALIAS, Value::Str(alias.clone()));
        }
        Value::Map(map)
    }
}

/// Files making up a leader commit point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<FileDescriptor>,
    pub conf_files: Vec<FileDescriptor>,
}

impl FileList {
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::Protocol("file list is not a map".into()))?;
        Ok(Self {
            files: descriptor_list(map, KEY_FILES)?,
            conf_files: descriptor_list(map, KEY_CONF_FILES)?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(
            KEY_FILES,
            Value::List(self.files.iter().map(FileDescriptor::to_value).collect()),
        );
        if !self.conf_files.is_empty() {
            map.insert(
                KEY_CONF_FILES,
                Value::List(self.conf_files.iter().map(FileDescriptor::to_value).collect()),
            );
        }
        Value::Map(map)
    }
}

/// Parameters of one file-content request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub name: String,
    pub kind: FileKind,
    pub version: i64,
    pub offset: u64,
    pub checksum: bool,
}

impl FileRequest {
    /// Form parameters for the request, in a stable order
    pub fn params(&self, internal_compression: bool) -> Vec<(&'static str, String)> {
        let mut params = vec![
            (PARAM_COMMAND, CMD_FILE_CONTENT.to_string()),
            (PARAM_INDEX_VERSION, self.version.to_string()),
        ];
        match self.kind {
            FileKind::Index => params.push((PARAM_FILE, self.name.clone())),
            FileKind::Conf => params.push((PARAM_CONF_FILE, self.name.clone())),
        }
        if internal_compression {
            params.push((PARAM_COMPRESSION, "true".to_string()));
        }
        if self.checksum {
            params.push((PARAM_CHECKSUM, "true".to_string()));
        }
        params.push((PARAM_WT, WT_FILE_STREAM.to_string()));
        if self.offset > 0 {
            params.push((PARAM_OFFSET, self.offset.to_string()));
        }
        params
    }
}

fn required_i64(map: &ValueMap, field: &'static str, context: &'static str) -> Result<i64> {
    map.get(field)
        .and_then(Value::as_i64)
        .ok_or(Error::MissingField { field, context })
}

fn descriptor_list(map: &ValueMap, key: &str) -> Result<Vec<FileDescriptor>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::List(items)) => items.iter().map(FileDescriptor::from_value).collect(),
        Some(_) => Err(Error::Protocol(format!("'{}' is not a list", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_point_from_response() {
        let cp = CommitPoint::new(5, 2);
        let decoded = CommitPoint::from_value(&value::decode(&value::encode(&cp.to_value())).unwrap()).unwrap();
        assert_eq!(decoded, cp);
        assert!(!decoded.is_empty());
        assert!(CommitPoint::new(0, 1).is_empty());
    }

    #[test]
    fn test_commit_point_missing_generation() {
        let mut map = ValueMap::new();
        map.insert("indexversion", Value::Long(3));
        let err = CommitPoint::from_value(&Value::Map(map)).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "generation", .. }));
    }

    #[test]
    fn test_file_list_with_alias() {
        let list = FileList {
            files: vec![FileDescriptor::new("segments_5", 10, 1_000)],
            conf_files: vec![FileDescriptor::new("schema-follower.xml", 42, 2_000)
                .with_checksum(99)
                .with_alias("schema.xml")],
        };
        let decoded = FileList::from_value(&list.to_value()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.conf_files[0].local_name(), "schema.xml");
        assert_eq!(decoded.files[0].local_name(), "segments_5");
        assert!(decoded.files[0].is_manifest());
    }

    #[test]
    fn test_absent_conf_files_is_empty() {
        let mut map = ValueMap::new();
        map.insert("filelist", Value::List(vec![]));
        let list = FileList::from_value(&Value::Map(map)).unwrap();
        assert!(list.files.is_empty());
        assert!(list.conf_files.is_empty());
    }

    #[test]
    fn test_path_traversal_rejected() {
        for bad in ["../etc/passwd", "a/b", "..", ""] {
            let desc = FileDescriptor::new(bad, 1, 0);
            assert!(FileDescriptor::from_value(&desc.to_value()).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_illegal_alias_rejected() {
        for bad in ["../schema.xml", "conf/schema.xml", "..", ".", ""] {
            let desc = FileDescriptor::new("schema-follower.xml", 1, 0).with_alias(bad);
            assert!(FileDescriptor::from_value(&desc.to_value()).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_file_request_params() {
        let req = FileRequest {
            name: "schema.xml".into(),
            kind: FileKind::Conf,
            version: 7,
            offset: 0,
            checksum: true,
        };
        let params = req.params(false);
        assert!(params.contains(&("cf", "schema.xml".to_string())));
        assert!(params.contains(&("checksum", "true".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "offset"));

        let resumed = FileRequest { offset: 4096, kind: FileKind::Index, ..req };
        let params = resumed.params(true);
        assert!(params.contains(&("file", "schema.xml".to_string())));
        assert!(params.contains(&("offset", "4096".to_string())));
        assert!(params.contains(&("compression", "true".to_string())));
    }

    #[test]
    fn test_manifest_detection() {
        assert!(is_manifest("segments_1"));
        assert!(is_manifest("segments_a9"));
        assert!(!is_manifest("segments.gen"));
        assert!(!is_manifest("_0.cfs"));
    }
}
