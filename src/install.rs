//! Snapshot Installation
//!
//! Moves downloaded files from a cycle's scratch directory into the live
//! index and configuration directories.
//!
//! Index files are renamed one by one with the manifest (`segments_*`) last,
//! so the live directory never holds a manifest that refers to files that
//! are not there yet. A failed rename removes everything this install moved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::error::{Error, Result};
use crate::properties;
use crate::protocol::FileDescriptor;

/// Properties file naming the live index directory
pub const INDEX_PROPERTIES: &str = "index.properties";

const INDEX_KEY: &str = "index";

/// Timestamp layout for scratch directories and conf backups
const DATE_FMT: &str = "%Y%m%d%H%M%S%3f";

/// Format a timestamp the way directory and backup names carry it
pub fn timestamp_suffix(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format(DATE_FMT).to_string()
}

/// Order in which downloaded index files are moved into place
pub fn install_order(files: &[FileDescriptor]) -> Vec<&str> {
    let (manifests, others): (Vec<&FileDescriptor>, Vec<&FileDescriptor>) =
        files.iter().partition(|f| f.is_manifest());
    others
        .into_iter()
        .chain(manifests)
        .map(|f| f.name.as_str())
        .collect()
}

/// Index changes made live by one install, kept so that a later failure in
/// the same cycle can take them back
#[derive(Debug)]
pub enum IndexInstall {
    /// Files moved into the live index directory
    Files(Vec<PathBuf>),
    /// `index.properties` was pointed at a freshly downloaded directory
    Switched {
        data_dir: PathBuf,
        previous: Option<String>,
        dir: PathBuf,
    },
}

impl IndexInstall {
    /// Put the live index back the way it was before this install
    pub async fn undo(self) {
        match self {
            IndexInstall::Files(moved) => rollback(&moved).await,
            IndexInstall::Switched {
                data_dir,
                previous,
                dir,
            } => {
                if let Err(e) = write_index_dir(&data_dir, previous.as_deref()) {
                    tracing::error!("Unable to restore {}: {}", INDEX_PROPERTIES, e);
                }
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::error!("Unable to delete {:?}: {}", dir, e);
                }
                tracing::info!("Index directory restored to {:?}", previous);
            }
        }
    }
}

/// Move downloaded index files from `tmp_dir` into `index_dir`.
///
/// On failure every file moved by this call is deleted again and an install
/// error is returned; the caller discards `tmp_dir`.
pub async fn install_index_files(
    tmp_dir: &Path,
    index_dir: &Path,
    files: &[FileDescriptor],
) -> Result<IndexInstall> {
    let mut moved: Vec<PathBuf> = Vec::new();

    for name in install_order(files) {
        let from = tmp_dir.join(name);
        let to = index_dir.join(name);

        if let Err(e) = tokio::fs::rename(&from, &to).await {
            tracing::error!("Unable to move index file from {:?} to {:?}: {}", from, to, e);
            rollback(&moved).await;
            return Err(Error::Install(format!(
                "Unable to move {} into {:?}: {}",
                name, index_dir, e
            )));
        }
        tracing::debug!("Installed {}", name);
        moved.push(to);
    }

    Ok(IndexInstall::Files(moved))
}

async fn rollback(moved: &[PathBuf]) {
    for path in moved {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::error!("Rollback could not delete {:?}: {}", path, e);
        }
    }
}

/// Make `dir`, a directory inside `data_dir`, the live index directory
pub fn install_index_dir(data_dir: &Path, dir: PathBuf) -> Result<IndexInstall> {
    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Install(format!("Index directory {:?} has no name", dir)))?;

    let previous = read_index_properties(&data_dir.join(INDEX_PROPERTIES)).unwrap_or_else(|e| {
        tracing::error!("Unable to load {}: {}", INDEX_PROPERTIES, e);
        None
    });
    switch_index_dir(data_dir, &dir_name)?;

    Ok(IndexInstall::Switched {
        data_dir: data_dir.to_path_buf(),
        previous,
        dir,
    })
}

/// A conf file moved into place, with the backup of what it replaced
struct ConfMove {
    target: PathBuf,
    backup: Option<PathBuf>,
}

/// Move every file in `tmp_conf_dir` into `conf_dir`, renaming an existing
/// file aside as `<name>.<timestamp of its last modification>` first.
///
/// Either all files are installed or, on failure, the configuration
/// directory is restored to what it held before.
pub async fn install_conf_files(tmp_conf_dir: &Path, conf_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(tmp_conf_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut done: Vec<ConfMove> = Vec::new();
    for name in &names {
        match install_conf_file(tmp_conf_dir, conf_dir, name).await {
            Ok(step) => done.push(step),
            Err(e) => {
                restore_conf(done).await;
                return Err(e);
            }
        }
    }

    Ok(names)
}

async fn install_conf_file(tmp_conf_dir: &Path, conf_dir: &Path, name: &str) -> Result<ConfMove> {
    let target = conf_dir.join(name);

    let backup = match tokio::fs::metadata(&target).await {
        Ok(meta) => {
            let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
            let backup = conf_dir.join(format!("{}.{}", name, timestamp_suffix(modified)));
            tokio::fs::rename(&target, &backup).await.map_err(|e| {
                Error::Install(format!("Unable to rename {:?} to {:?}: {}", target, backup, e))
            })?;
            tracing::info!("Backed up {} as {:?}", name, backup);
            Some(backup)
        }
        Err(_) => None,
    };

    let source = tmp_conf_dir.join(name);
    if let Err(e) = tokio::fs::rename(&source, &target).await {
        let step = ConfMove { target: target.clone(), backup };
        restore_conf(vec![step]).await;
        return Err(Error::Install(format!(
            "Unable to rename {:?} to {:?}: {}",
            source, target, e
        )));
    }

    Ok(ConfMove { target, backup })
}

/// Undo conf moves, newest first
async fn restore_conf(done: Vec<ConfMove>) {
    for step in done.into_iter().rev() {
        if let Err(e) = tokio::fs::remove_file(&step.target).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!("Rollback could not delete {:?}: {}", step.target, e);
            }
        }
        if let Some(backup) = step.backup {
            if let Err(e) = tokio::fs::rename(&backup, &step.target).await {
                tracing::error!("Unable to restore {:?} from {:?}: {}", step.target, backup, e);
            }
        }
    }
}

/// Point `index.properties` at a different index directory
pub fn switch_index_dir(data_dir: &Path, dir_name: &str) -> Result<()> {
    write_index_dir(data_dir, Some(dir_name))?;
    tracing::info!("New index installed. Index directory is now {}", dir_name);
    Ok(())
}

/// Set or, with `None`, remove the `index` entry of `index.properties`
fn write_index_dir(data_dir: &Path, dir_name: Option<&str>) -> Result<()> {
    let path = data_dir.join(INDEX_PROPERTIES);
    let mut props = match properties::load(&path) {
        Ok(props) => props.unwrap_or_default(),
        Err(e) => {
            tracing::error!("Unable to load {}: {}", INDEX_PROPERTIES, e);
            BTreeMap::new()
        }
    };
    match dir_name {
        Some(name) => props.insert(INDEX_KEY.to_string(), name.to_string()),
        None => props.remove(INDEX_KEY),
    };
    properties::store(&path, "index properties", &props)
        .map_err(|e| Error::Install(format!("Unable to write {}: {}", INDEX_PROPERTIES, e)))
}

/// Index directory named by an `index.properties` file, if any
pub fn read_index_properties(path: &Path) -> Result<Option<String>> {
    Ok(properties::load(path)?
        .and_then(|props| props.get(INDEX_KEY).cloned())
        .filter(|name| !name.is_empty()))
}
