//! IndexSync - Follower-side Index Replication
//!
//! Keeps a follower node's on-disk search index and configuration in sync
//! with a leader by periodically comparing commit points and transferring
//! only the files that changed.
//!
//! # Architecture
//!
//! A [`coordinator::ReplicationClient`] runs one replication cycle at a time:
//! it asks the leader for its latest commit point, downloads missing files
//! into a scratch directory with the [`fetcher::FileFetcher`], installs them
//! with the manifest moved last, and has the local server commit or reload.
//! The [`scheduler::PollScheduler`] triggers cycles on a timer; the HTTP API
//! exposes status and operator controls.
//!
//! # Features
//!
//! - Packetized file transfer with per-packet Adler-32 verification
//! - Resume from the last confirmed offset after a bad packet or a dropped connection
//! - Incremental and full-copy modes
//! - Configuration file replication with timestamped backups
//! - Abortable cycles and runtime poll switches

pub mod api;
pub mod checksum;
pub mod conf_cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod host;
pub mod install;
pub mod properties;
pub mod protocol;
pub mod replication_log;
pub mod scheduler;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::IndexSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::IndexSyncConfig;
    pub use crate::coordinator::{CycleOutcome, ReplicationClient, ReplicationStatus};
    pub use crate::error::{Error, Result};
    pub use crate::host::{DirectoryHost, IndexHost};
    pub use crate::protocol::{CommitPoint, FileDescriptor, FileList};
    pub use crate::scheduler::{PollControl, PollScheduler};
    pub use crate::transport::{HttpTransport, LeaderTransport};
}
