//! Configuration File Cache
//!
//! Remembers the checksum of each local configuration file together with the
//! size and modification time it was computed at, so unchanged files are not
//! re-hashed on every cycle.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use crate::checksum::checksum_file;
use crate::error::Result;
use crate::protocol::FileDescriptor;

/// Cached checksum of one local configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedChecksum {
    size: u64,
    modified: SystemTime,
    checksum: u32,
}

/// Local configuration checksums keyed by local file name
#[derive(Debug, Default)]
pub struct ConfFileCache {
    entries: HashMap<String, CachedChecksum>,
}

impl ConfFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of `conf_dir/name`, or `None` when the file does not exist
    fn local_checksum(&mut self, conf_dir: &Path, name: &str) -> Result<Option<u32>> {
        let path = conf_dir.join(name);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries.remove(name);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified()?;

        if let Some(cached) = self.entries.get(name) {
            if cached.size == meta.len() && cached.modified == modified {
                return Ok(Some(cached.checksum));
            }
        }

        let checksum = checksum_file(&path)?;
        self.entries.insert(
            name.to_string(),
            CachedChecksum {
                size: meta.len(),
                modified,
                checksum,
            },
        );
        Ok(Some(checksum))
    }

    /// Advertised configuration files that differ from the local copies.
    ///
    /// A file is modified when it is missing locally or its checksum differs.
    /// Without an advertised checksum only presence and size are compared.
    pub fn modified_files(
        &mut self,
        conf_dir: &Path,
        advertised: &[FileDescriptor],
    ) -> Result<Vec<FileDescriptor>> {
        let mut modified = Vec::new();

        for file in advertised {
            let name = file.local_name();
            let changed = match (self.local_checksum(conf_dir, name)?, file.checksum) {
                (None, _) => true,
                (Some(local), Some(remote)) => i64::from(local) != remote,
                (Some(_), None) => std::fs::metadata(conf_dir.join(name))?.len() != file.size,
            };

            if changed {
                tracing::debug!("Configuration file {} differs from the leader's copy", name);
                modified.push(file.clone());
            }
        }

        Ok(modified)
    }

    /// Refresh cached checksums for files that were just installed
    pub fn record_installed(&mut self, conf_dir: &Path, names: &[String]) {
        for name in names {
            self.entries.remove(name);
            if let Err(e) = self.local_checksum(conf_dir, name) {
                tracing::warn!("Unable to checksum installed configuration file {}: {}", name, e);
            }
        }
    }
}
