//! IndexSync Error Types

use thiserror::Error;

/// Result type alias for IndexSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// IndexSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Missing field '{field}' in {context}")]
    MissingField { field: &'static str, context: &'static str },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Leader returned HTTP {status} for {command}")]
    LeaderStatus { status: u16, command: &'static str },

    // Transfer errors
    #[error("Checksum mismatch for {file} at offset {offset}")]
    ChecksumMismatch { file: String, offset: u64 },

    #[error("Fetch failed for {file} after {attempts} attempts: {reason}")]
    RetriesExhausted { file: String, attempts: u32, reason: String },

    #[error("Unable to download {file} completely. Downloaded {downloaded}!={expected}")]
    IncompleteDownload { file: String, downloaded: u64, expected: u64 },

    #[error("Replication aborted by user")]
    Aborted,

    // Install errors
    #[error("Install failed: {0}")]
    Install(String),

    // Local server errors
    #[error("Index host error: {0}")]
    Host(String),

    // Control errors
    #[error("A replication cycle is already in progress")]
    CycleInProgress,

    #[error("Invalid poll interval '{0}': must be in the format HH:mm:ss")]
    InvalidInterval(String),

    #[error("Poll interval must be greater than zero")]
    ZeroInterval,

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl Error {
    /// Check if this error is worth retrying from the last confirmed offset
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::LeaderStatus { .. }
                | Error::ChecksumMismatch { .. }
                | Error::Protocol(_)
        )
    }

    /// Check if this error is the user-abort signal
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
