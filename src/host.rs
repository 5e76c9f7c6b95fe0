//! Local Index Host
//!
//! The follower-side server whose index is being replicated. The replication
//! client only needs its directories, its current commit point and two ways
//! of making a newly installed snapshot visible: a cheap commit, or a full
//! reload when configuration changed or the index directory was switched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::install::{read_index_properties, INDEX_PROPERTIES};
use crate::protocol::CommitPoint;

/// Operations the replication client needs from the local server
#[async_trait]
pub trait IndexHost: Send + Sync {
    /// Commit point of the live index reader
    async fn commit_point(&self) -> Result<CommitPoint>;

    /// Directory holding replication state and scratch directories
    fn data_dir(&self) -> PathBuf;

    /// Live index directory
    fn index_dir(&self) -> PathBuf;

    /// Live configuration directory
    fn conf_dir(&self) -> PathBuf;

    /// Open the newly installed files (refresh searchers)
    async fn commit(&self, installed: CommitPoint) -> Result<()>;

    /// Reload configuration and reopen the index
    async fn reload(&self, installed: CommitPoint) -> Result<()>;
}

/// File name of the persisted commit point
const COMMIT_FILE: &str = "commit_point.json";

/// Directory name used when `index.properties` names none
const DEFAULT_INDEX_DIR: &str = "index";

/// Standalone host that mirrors a leader's files into plain directories.
///
/// The index directory is resolved through `index.properties` so that a
/// full-copy install can switch to a fresh directory. The installed commit
/// point is persisted as JSON next to it.
pub struct DirectoryHost {
    data_dir: PathBuf,
    conf_dir: PathBuf,
    current: RwLock<CommitPoint>,
}

impl DirectoryHost {
    /// Open (or initialise) a host rooted at `data_dir`
    pub fn open(data_dir: impl Into<PathBuf>, conf_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let conf_dir = conf_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&conf_dir)?;

        let host = Self {
            data_dir,
            conf_dir,
            current: RwLock::new(CommitPoint::default()),
        };
        std::fs::create_dir_all(host.index_dir())?;

        let current = load_commit_point(&host.data_dir.join(COMMIT_FILE))?;
        tracing::info!("Index host opened at {:?} ({})", host.data_dir, current);
        Ok(Self {
            current: RwLock::new(current),
            ..host
        })
    }

    async fn store(&self, installed: CommitPoint) -> Result<()> {
        let path = self.data_dir.join(COMMIT_FILE);
        let json = serde_json::to_vec_pretty(&installed)?;
        tokio::fs::write(&path, json).await?;
        *self.current.write().await = installed;
        Ok(())
    }
}

fn load_commit_point(path: &Path) -> Result<CommitPoint> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CommitPoint::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl IndexHost for DirectoryHost {
    async fn commit_point(&self) -> Result<CommitPoint> {
        Ok(*self.current.read().await)
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn index_dir(&self) -> PathBuf {
        let props = self.data_dir.join(INDEX_PROPERTIES);
        let name = match read_index_properties(&props) {
            Ok(Some(name)) => name,
            Ok(None) => DEFAULT_INDEX_DIR.to_string(),
            Err(e) => {
                tracing::error!("Unable to load {:?}: {}", props, e);
                DEFAULT_INDEX_DIR.to_string()
            }
        };
        self.data_dir.join(name)
    }

    fn conf_dir(&self) -> PathBuf {
        self.conf_dir.clone()
    }

    async fn commit(&self, installed: CommitPoint) -> Result<()> {
        self.store(installed).await?;
        tracing::info!("Committed replicated index ({})", installed);
        Ok(())
    }

    async fn reload(&self, installed: CommitPoint) -> Result<()> {
        let index_dir = self.index_dir();
        if !index_dir.is_dir() {
            return Err(Error::Host(format!("Index directory {:?} is missing", index_dir)));
        }
        self.store(installed).await?;
        tracing::info!("Reloaded with index {:?} ({})", index_dir, installed);
        Ok(())
    }
}
