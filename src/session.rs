//! Transfer Session
//!
//! Per-cycle progress state. The coordinator owns the mutable
//! [`TransferSession`]; status readers only ever see immutable snapshots
//! published through the [`SessionMonitor`], plus a byte counter for the file
//! in flight. Readers never block the transfer and never mutate anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{CommitPoint, FileDescriptor, FileKind};

/// Cancellation flag shared between the controller and the transfer loop
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Ask the running cycle to stop at the next packet boundary
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bytes written so far for the file in flight
#[derive(Debug, Default)]
pub struct TransferProgress(AtomicU64);

impl TransferProgress {
    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Release);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Immutable view of a cycle at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub started_at: DateTime<Utc>,
    /// Leader commit point being replicated
    pub target: CommitPoint,
    pub full_copy: bool,
    pub index_files_to_download: Vec<FileDescriptor>,
    pub conf_files_to_download: Vec<FileDescriptor>,
    pub index_files_downloaded: Vec<FileDescriptor>,
    pub conf_files_downloaded: Vec<FileDescriptor>,
    pub current_file: Option<FileDescriptor>,
}

impl SessionSnapshot {
    fn new(target: CommitPoint) -> Self {
        Self {
            started_at: Utc::now(),
            target,
            full_copy: false,
            index_files_to_download: Vec::new(),
            conf_files_to_download: Vec::new(),
            index_files_downloaded: Vec::new(),
            conf_files_downloaded: Vec::new(),
            current_file: None,
        }
    }
}

/// What a status reader gets for a running cycle
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    /// Bytes written for `current_file`
    pub current_file_bytes_downloaded: u64,
    pub elapsed_secs: i64,
}

/// Publication point for the running cycle's progress
#[derive(Debug, Default)]
pub struct SessionMonitor {
    snapshot: RwLock<Option<Arc<SessionSnapshot>>>,
    progress: TransferProgress,
    abort: AbortSignal,
}

impl SessionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Latest published snapshot
    pub fn current(&self) -> Option<Arc<SessionSnapshot>> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Copy of the running cycle's progress, if any
    pub fn status(&self) -> Option<SessionStatus> {
        let snapshot = self.current()?;
        Some(SessionStatus {
            current_file_bytes_downloaded: self.progress.get(),
            elapsed_secs: (Utc::now() - snapshot.started_at).num_seconds(),
            snapshot: (*snapshot).clone(),
        })
    }

    fn publish(&self, snapshot: Option<Arc<SessionSnapshot>>) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// Mutable state of one replication cycle.
///
/// Every change is republished to the monitor. Dropping the session clears
/// the monitor, whichever way the cycle ended.
pub struct TransferSession<'a> {
    monitor: &'a SessionMonitor,
    state: SessionSnapshot,
}

impl<'a> TransferSession<'a> {
    pub fn begin(monitor: &'a SessionMonitor, target: CommitPoint) -> Self {
        monitor.progress.reset();
        let session = Self {
            monitor,
            state: SessionSnapshot::new(target),
        };
        session.publish();
        session
    }

    pub fn target(&self) -> CommitPoint {
        self.state.target
    }

    /// Record which index files will be fetched and in which mode
    pub fn plan_index(&mut self, full_copy: bool, files: Vec<FileDescriptor>) {
        self.state.full_copy = full_copy;
        self.state.index_files_to_download = files;
        self.publish();
    }

    pub fn plan_conf(&mut self, files: Vec<FileDescriptor>) {
        self.state.conf_files_to_download = files;
        self.publish();
    }

    /// Mark `file` as the one in flight
    pub fn start_file(&mut self, file: &FileDescriptor) {
        self.monitor.progress.reset();
        self.state.current_file = Some(file.clone());
        self.publish();
    }

    /// Move the in-flight file to the downloaded list of its kind
    pub fn finish_file(&mut self, kind: FileKind) {
        if let Some(file) = self.state.current_file.take() {
            match kind {
                FileKind::Index => self.state.index_files_downloaded.push(file),
                FileKind::Conf => self.state.conf_files_downloaded.push(file),
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.monitor.publish(Some(Arc::new(self.state.clone())));
    }
}

impl Drop for TransferSession<'_> {
    fn drop(&mut self) {
        self.monitor.publish(None);
        self.monitor.progress.reset();
    }
}
