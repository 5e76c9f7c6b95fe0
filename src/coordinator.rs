//! Replication Client
//!
//! Runs replication cycles for one follower: compare commit points with the
//! leader, fetch what is missing into a scratch directory, install it and
//! make the local server pick it up.
//!
//! At most one cycle runs at a time. Scheduled ticks that find a cycle
//! running are skipped; manual triggers are rejected.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::conf_cache::ConfFileCache;
use crate::error::{Error, Result};
use crate::fetcher::FileFetcher;
use crate::host::IndexHost;
use crate::install::{
    install_conf_files, install_index_dir, install_index_files, timestamp_suffix, IndexInstall,
};
use crate::protocol::{CommitPoint, FileDescriptor, FileKind};
use crate::replication_log::{ReplicationLog, ReplicationLogEntry};
use crate::session::{SessionMonitor, SessionStatus, TransferSession};
use crate::transport::LeaderTransport;

/// Why a cycle had nothing to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    /// The leader has not committed anything yet
    LeaderEmpty,
    /// Local and leader commit points are equal
    InSync,
}

/// What a successful install did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallSummary {
    pub commit: CommitPoint,
    pub full_copy: bool,
    pub index_files: Vec<String>,
    pub conf_files: Vec<String>,
    pub bytes_downloaded: u64,
    /// A full reload was issued instead of a commit
    pub reloaded: bool,
}

/// Result of one replication cycle
#[derive(Debug)]
pub enum CycleOutcome {
    NoOp(NoOpReason),
    Installed(InstallSummary),
    Aborted,
    Failed(Error),
}

impl CycleOutcome {
    fn kind(&self) -> &'static str {
        match self {
            CycleOutcome::NoOp(_) => "noop",
            CycleOutcome::Installed(_) => "installed",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

/// Outcome of the most recent cycle, as reported by status
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub finished_at: DateTime<Utc>,
    pub result: &'static str,
    pub message: String,
}

impl From<&CycleOutcome> for CycleReport {
    fn from(outcome: &CycleOutcome) -> Self {
        let message = match outcome {
            CycleOutcome::NoOp(NoOpReason::LeaderEmpty) => "Leader has no commit yet".to_string(),
            CycleOutcome::NoOp(NoOpReason::InSync) => "Follower in sync with leader".to_string(),
            CycleOutcome::Installed(summary) => format!(
                "Installed {} index and {} conf files ({})",
                summary.index_files.len(),
                summary.conf_files.len(),
                summary.commit
            ),
            CycleOutcome::Aborted => "Replication aborted by user".to_string(),
            CycleOutcome::Failed(e) => e.to_string(),
        };
        Self {
            finished_at: Utc::now(),
            result: outcome.kind(),
            message,
        }
    }
}

/// Replication status for operators
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub leader: String,
    pub replicating: bool,
    /// Commit point of the live local index
    pub local: Option<CommitPoint>,
    /// Progress of the running cycle
    pub session: Option<SessionStatus>,
    pub last_cycle: Option<CycleReport>,
    pub history: ReplicationLogEntry,
}

/// Follower-side replication client
pub struct ReplicationClient {
    transport: Arc<dyn LeaderTransport>,
    host: Arc<dyn IndexHost>,
    monitor: SessionMonitor,
    cycle_lock: Arc<Mutex<()>>,
    conf_cache: std::sync::Mutex<ConfFileCache>,
    log: ReplicationLog,
    last_cycle: RwLock<Option<CycleReport>>,
    /// Set while a reload spawned by a cycle has not finished
    reload_pending: Arc<AtomicBool>,
}

impl ReplicationClient {
    /// Create a client. Fails when no leader address is configured.
    pub fn new(transport: Arc<dyn LeaderTransport>, host: Arc<dyn IndexHost>) -> Result<Self> {
        if transport.leader().trim().is_empty() {
            return Err(Error::Config("Leader URL is required for a follower".into()));
        }

        let log = ReplicationLog::new(&host.data_dir());
        Ok(Self {
            transport,
            host,
            monitor: SessionMonitor::new(),
            cycle_lock: Arc::new(Mutex::new(())),
            conf_cache: std::sync::Mutex::new(ConfFileCache::new()),
            log,
            last_cycle: RwLock::new(None),
            reload_pending: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn leader(&self) -> String {
        self.transport.leader()
    }

    /// Whether a cycle is running right now
    pub fn is_busy(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Ask the running cycle to stop. Ignored when nothing is running.
    pub fn abort(&self) -> bool {
        if self.is_busy() {
            tracing::info!("Abort requested for running replication");
            self.monitor.abort_signal().raise();
            true
        } else {
            tracing::info!("No replication in progress, abort ignored");
            false
        }
    }

    /// Run one cycle, waiting for a running one to finish first
    pub async fn run_cycle(&self) -> CycleOutcome {
        let _guard = self.cycle_lock.lock().await;
        self.monitor.abort_signal().clear();
        self.run_locked().await
    }

    /// Start a cycle in the background unless one is already running
    pub fn spawn_cycle(self: &Arc<Self>) -> Result<JoinHandle<CycleOutcome>> {
        let guard = Arc::clone(&self.cycle_lock)
            .try_lock_owned()
            .map_err(|_| Error::CycleInProgress)?;
        self.monitor.abort_signal().clear();
        let client = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            client.run_locked().await
        }))
    }

    /// Snapshot of replication state. Never waits for the running cycle.
    pub async fn status(&self) -> ReplicationStatus {
        let local = match self.host.commit_point().await {
            Ok(commit) => Some(commit),
            Err(e) => {
                tracing::warn!("Unable to read local commit point: {}", e);
                None
            }
        };
        let history = self.log.load().unwrap_or_else(|e| {
            tracing::warn!("Unable to read {:?}: {}", self.log.path(), e);
            ReplicationLogEntry::default()
        });
        let last_cycle = match self.last_cycle.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        ReplicationStatus {
            leader: self.transport.leader(),
            replicating: self.is_busy(),
            local,
            session: self.monitor.status(),
            last_cycle,
            history,
        }
    }

    /// Body of a cycle. The caller holds the cycle lock and has cleared any
    /// abort request left over from before it was taken.
    async fn run_locked(&self) -> CycleOutcome {
        let outcome = match self.replicate().await {
            Ok(outcome) => outcome,
            Err(e) if e.is_abort() => {
                tracing::error!("User aborted Replication");
                CycleOutcome::Aborted
            }
            Err(e) => {
                tracing::error!("Index fetch failed: {}", e);
                CycleOutcome::Failed(e)
            }
        };

        self.monitor.abort_signal().clear();
        let report = CycleReport::from(&outcome);
        match self.last_cycle.write() {
            Ok(mut guard) => *guard = Some(report),
            Err(poisoned) => *poisoned.into_inner() = Some(report),
        }
        outcome
    }

    async fn replicate(&self) -> Result<CycleOutcome> {
        let leader = self.transport.commit_info().await.map_err(|e| {
            tracing::error!("Leader at {} is not available: {}", self.transport.leader(), e);
            e
        })?;
        tracing::info!("Leader's version: {}, generation: {}", leader.version, leader.generation);
        if leader.is_empty() {
            return Ok(CycleOutcome::NoOp(NoOpReason::LeaderEmpty));
        }

        let local = self.host.commit_point().await?;
        tracing::info!("Follower's version: {}, generation: {}", local.version, local.generation);
        if local == leader {
            return Ok(CycleOutcome::NoOp(NoOpReason::InSync));
        }

        tracing::info!("Starting replication process");
        let list = self.transport.file_list(leader.version).await?;
        tracing::info!("Number of files in latest index in leader: {}", list.files.len());
        if list.files.is_empty() {
            return Err(Error::Protocol(format!(
                "No files to download for index version {}",
                leader.version
            )));
        }

        let mut session = TransferSession::begin(&self.monitor, leader);
        let data_dir = self.host.data_dir();
        let index_dir = self.host.index_dir();
        let conf_dir = self.host.conf_dir();

        // Generation comparison is a heuristic for diverged histories
        let full_copy =
            local.generation >= leader.generation || is_index_stale(&index_dir, &list.files);
        let index_files: Vec<FileDescriptor> = if full_copy {
            list.files.clone()
        } else {
            list.files
                .iter()
                .filter(|f| !index_dir.join(&f.name).exists())
                .cloned()
                .collect()
        };
        if full_copy {
            tracing::info!("Full copy of the index required");
        }
        session.plan_index(full_copy, index_files.clone());

        let tmp_index = tempfile::Builder::new()
            .prefix(&format!("index.{}.", timestamp_suffix(SystemTime::now())))
            .tempdir_in(&data_dir)?;
        let mut bytes = self
            .fetch_all(&mut session, FileKind::Index, &index_files, tmp_index.path())
            .await?;

        let modified_conf = if list.conf_files.is_empty() {
            Vec::new()
        } else {
            self.lock_conf_cache().modified_files(&conf_dir, &list.conf_files)?
        };
        session.plan_conf(modified_conf.clone());

        let mut conf_installed = Vec::new();
        let index_names: Vec<String> = index_files.iter().map(|f| f.name.clone()).collect();

        if !modified_conf.is_empty() {
            tracing::info!("Configuration files are modified, {:?}", names(&modified_conf));
            let tmp_conf = tempfile::Builder::new().prefix("conf.").tempdir_in(&conf_dir)?;
            bytes += self
                .fetch_all(&mut session, FileKind::Conf, &modified_conf, tmp_conf.path())
                .await?;

            let index_installed = self
                .install_index(full_copy, tmp_index, &index_dir, &index_files, &data_dir)
                .await?;
            conf_installed = match install_conf_files(tmp_conf.path(), &conf_dir).await {
                Ok(names) => names,
                Err(e) => {
                    index_installed.undo().await;
                    return Err(e);
                }
            };
            self.lock_conf_cache().record_installed(&conf_dir, &conf_installed);
            self.spawn_reload(leader);
        } else {
            let index_installed = self
                .install_index(full_copy, tmp_index, &index_dir, &index_files, &data_dir)
                .await?;
            if full_copy {
                self.spawn_reload(leader);
            } else if let Err(e) = self.host.commit(leader).await {
                index_installed.undo().await;
                return Err(e);
            }
        }

        self.log.record(&conf_installed);
        tracing::info!(
            "Replicated {} index files and {} conf files ({} bytes) up to {}",
            index_names.len(),
            conf_installed.len(),
            bytes,
            leader
        );

        Ok(CycleOutcome::Installed(InstallSummary {
            commit: leader,
            full_copy,
            index_files: index_names,
            reloaded: full_copy || !conf_installed.is_empty(),
            conf_files: conf_installed,
            bytes_downloaded: bytes,
        }))
    }

    async fn fetch_all(
        &self,
        session: &mut TransferSession<'_>,
        kind: FileKind,
        files: &[FileDescriptor],
        dir: &Path,
    ) -> Result<u64> {
        let fetcher = FileFetcher::new(
            self.transport.as_ref(),
            session.target().version,
            kind,
            self.monitor.abort_signal(),
            self.monitor.progress(),
        );

        let mut bytes = 0;
        for file in files {
            session.start_file(file);
            let save_as = match kind {
                FileKind::Index => file.name.as_str(),
                FileKind::Conf => file.local_name(),
            };
            bytes += fetcher.fetch(file, dir, save_as).await?;
            session.finish_file(kind);
        }
        Ok(bytes)
    }

    /// Make downloaded index files live. A full copy keeps the scratch
    /// directory and points `index.properties` at it.
    async fn install_index(
        &self,
        full_copy: bool,
        tmp_index: tempfile::TempDir,
        index_dir: &Path,
        files: &[FileDescriptor],
        data_dir: &Path,
    ) -> Result<IndexInstall> {
        if !full_copy {
            return install_index_files(tmp_index.path(), index_dir, files).await;
        }

        let kept = tmp_index.keep();
        tracing::debug!("Keeping {:?} as the new index directory", kept);
        match install_index_dir(data_dir, kept.clone()) {
            Ok(installed) => Ok(installed),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&kept).await {
                    tracing::error!("Unable to delete {:?}: {}", kept, rm);
                }
                Err(e)
            }
        }
    }

    /// Whether a reload issued by the last cycle is still running
    pub fn is_reloading(&self) -> bool {
        self.reload_pending.load(Ordering::Acquire)
    }

    fn spawn_reload(&self, commit: CommitPoint) {
        let host = Arc::clone(&self.host);
        let pending = Arc::clone(&self.reload_pending);
        pending.store(true, Ordering::Release);
        tokio::spawn(async move {
            if let Err(e) = host.reload(commit).await {
                tracing::error!("Could not reload after replication: {}", e);
            }
            pending.store(false, Ordering::Release);
        });
    }

    fn lock_conf_cache(&self) -> std::sync::MutexGuard<'_, ConfFileCache> {
        self.conf_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// True when a local file listed by the leader has a different size
fn is_index_stale(index_dir: &Path, files: &[FileDescriptor]) -> bool {
    files.iter().any(|file| match std::fs::metadata(index_dir.join(&file.name)) {
        Ok(meta) => meta.len() != file.size,
        Err(_) => false,
    })
}

fn names(files: &[FileDescriptor]) -> Vec<&str> {
    files.iter().map(|f| f.local_name()).collect()
}
