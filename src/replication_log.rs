//! Replication Log
//!
//! Counters and timestamps of past installs, kept in
//! `<data_dir>/replication.properties`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::properties;

/// File name of the replication log
pub const REPLICATION_PROPERTIES: &str = "replication.properties";

const TIMES_INDEX_REPLICATED: &str = "timesIndexReplicated";
const INDEX_REPLICATED_AT: &str = "indexReplicatedAt";
const TIMES_CONFIG_REPLICATED: &str = "timesConfigReplicated";
const CONF_FILES_REPLICATED_AT: &str = "confFilesReplicatedAt";
const CONF_FILES_REPLICATED: &str = "confFilesReplicated";

/// Persisted replication history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationLogEntry {
    pub times_index_replicated: u64,
    /// Epoch milliseconds of the last index install
    pub index_replicated_at: Option<i64>,
    pub times_config_replicated: u64,
    /// Epoch milliseconds of the last configuration install
    pub conf_files_replicated_at: Option<i64>,
    /// Configuration files changed by the last configuration install
    pub conf_files_replicated: Vec<String>,
}

impl ReplicationLogEntry {
    fn from_properties(props: &BTreeMap<String, String>) -> Self {
        let number = |key: &str| -> Option<i64> { props.get(key).and_then(|v| v.parse().ok()) };
        Self {
            times_index_replicated: number(TIMES_INDEX_REPLICATED).unwrap_or(0) as u64,
            index_replicated_at: number(INDEX_REPLICATED_AT),
            times_config_replicated: number(TIMES_CONFIG_REPLICATED).unwrap_or(0) as u64,
            conf_files_replicated_at: number(CONF_FILES_REPLICATED_AT),
            conf_files_replicated: props
                .get(CONF_FILES_REPLICATED)
                .map(|v| parse_list(v))
                .unwrap_or_default(),
        }
    }

    fn to_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert(TIMES_INDEX_REPLICATED.into(), self.times_index_replicated.to_string());
        if let Some(at) = self.index_replicated_at {
            props.insert(INDEX_REPLICATED_AT.into(), at.to_string());
        }
        props.insert(TIMES_CONFIG_REPLICATED.into(), self.times_config_replicated.to_string());
        if let Some(at) = self.conf_files_replicated_at {
            props.insert(CONF_FILES_REPLICATED_AT.into(), at.to_string());
        }
        if !self.conf_files_replicated.is_empty() {
            props.insert(
                CONF_FILES_REPLICATED.into(),
                format!("[{}]", self.conf_files_replicated.join(", ")),
            );
        }
        props
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

/// Handle on the replication log of one data directory
#[derive(Debug, Clone)]
pub struct ReplicationLog {
    path: PathBuf,
}

impl ReplicationLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(REPLICATION_PROPERTIES),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current history; a missing file reads as all-zero counters
    pub fn load(&self) -> Result<ReplicationLogEntry> {
        Ok(properties::load(&self.path)?
            .map(|props| ReplicationLogEntry::from_properties(&props))
            .unwrap_or_default())
    }

    /// Count one index install, plus a configuration install when
    /// `conf_files` is non-empty. Failures are logged and swallowed.
    pub fn record(&self, conf_files: &[String]) -> Option<ReplicationLogEntry> {
        match self.try_record(conf_files) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Exception while updating statistics: {}", e);
                None
            }
        }
    }

    fn try_record(&self, conf_files: &[String]) -> Result<ReplicationLogEntry> {
        let mut entry = self.load()?;
        let now = chrono::Utc::now().timestamp_millis();

        entry.times_index_replicated += 1;
        entry.index_replicated_at = Some(now);

        if !conf_files.is_empty() {
            entry.times_config_replicated += 1;
            entry.conf_files_replicated_at = Some(now);
            entry.conf_files_replicated = conf_files.to_vec();
        }

        properties::store(&self.path, "Replication details", &entry.to_properties())?;
        Ok(entry)
    }
}
