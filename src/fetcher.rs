//! File Fetcher
//!
//! Pulls one file from the leader packet by packet. Each packet is checked
//! against the checksum the leader sent with it; a bad packet or a broken
//! connection reopens the stream at the last confirmed offset instead of
//! starting over. After [`MAX_RETRIES`] consecutive failures the fetch gives up.
//!
//! A fetch either leaves a complete file with the advertised modification
//! time, or no file at all.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::protocol::{FileDescriptor, FileKind, FileRequest, Packet, PacketReader};
use crate::session::{AbortSignal, TransferProgress};
use crate::transport::{ByteStream, LeaderTransport};

/// Consecutive failures tolerated for one file
pub const MAX_RETRIES: u32 = 5;

/// How one response stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// All advertised bytes were received
    Complete,
    /// The leader sent a non-positive packet length
    NoContent,
}

/// Per-file transfer state
#[derive(Debug)]
struct FetchState {
    confirmed: u64,
    errors: u32,
    checksum: Checksum,
}

/// Downloads files of one commit point
pub struct FileFetcher<'a> {
    transport: &'a dyn LeaderTransport,
    version: i64,
    kind: FileKind,
    abort: &'a AbortSignal,
    progress: &'a TransferProgress,
}

impl<'a> FileFetcher<'a> {
    pub fn new(
        transport: &'a dyn LeaderTransport,
        version: i64,
        kind: FileKind,
        abort: &'a AbortSignal,
        progress: &'a TransferProgress,
    ) -> Self {
        Self {
            transport,
            version,
            kind,
            abort,
            progress,
        }
    }

    /// Download `file` into `dest_dir/save_as`, truncating anything there.
    ///
    /// Returns the number of bytes written. On any error the destination
    /// file is removed.
    pub async fn fetch(&self, file: &FileDescriptor, dest_dir: &Path, save_as: &str) -> Result<u64> {
        let path = dest_dir.join(save_as);
        let mut out = File::create(&path).await?;
        let mut state = FetchState {
            confirmed: 0,
            errors: 0,
            checksum: Checksum::new(),
        };

        let mut result = self.download(file, &mut out, &mut state).await;
        if let Ok(end) = result {
            result = out.flush().await.map_err(Error::from).map(|()| end);
        }

        let result = result.and_then(|end| {
            if state.confirmed == file.size {
                Ok(())
            } else {
                if end == StreamEnd::NoContent {
                    tracing::warn!("No content received for file: {}", file.name);
                }
                Err(Error::IncompleteDownload {
                    file: file.name.clone(),
                    downloaded: state.confirmed,
                    expected: file.size,
                })
            }
        });

        match result {
            Ok(()) => {
                let out = out.into_std().await;
                if let Err(e) = out.set_modified(file.modified_time()) {
                    tracing::warn!("Unable to set modification time of {:?}: {}", path, e);
                }
                tracing::debug!("Fetched {} ({} bytes)", file.name, file.size);
                Ok(file.size)
            }
            Err(e) => {
                drop(out);
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    tracing::error!("Error deleting file in cleanup {:?}: {}", path, rm);
                }
                Err(e)
            }
        }
    }

    async fn download(&self, file: &FileDescriptor, out: &mut File, state: &mut FetchState) -> Result<StreamEnd> {
        if file.size == 0 {
            return Ok(StreamEnd::Complete);
        }

        loop {
            if self.abort.is_raised() {
                return Err(Error::Aborted);
            }

            let request = FileRequest {
                name: file.name.clone(),
                kind: self.kind,
                version: self.version,
                offset: state.confirmed,
                checksum: true,
            };

            let attempt = match self.transport.open_file(&request).await {
                Ok(stream) => self.read_packets(stream, file, out, state).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(end) => return Ok(end),
                Err(e) if e.is_retryable() => {
                    state.errors += 1;
                    tracing::warn!(
                        "Error in fetching packets for {} at offset {} ({} of {}): {}",
                        file.name,
                        state.confirmed,
                        state.errors,
                        MAX_RETRIES,
                        e
                    );
                    if state.errors > MAX_RETRIES {
                        return Err(Error::RetriesExhausted {
                            file: file.name.clone(),
                            attempts: state.errors,
                            reason: e.to_string(),
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_packets(
        &self,
        stream: ByteStream,
        file: &FileDescriptor,
        out: &mut File,
        state: &mut FetchState,
    ) -> Result<StreamEnd> {
        let mut reader = PacketReader::new(StreamReader::new(stream), true);

        loop {
            if self.abort.is_raised() {
                return Err(Error::Aborted);
            }

            let (payload, sent) = match reader.next_packet().await? {
                Packet::End => return Ok(StreamEnd::NoContent),
                Packet::Data { payload, checksum } => (payload, checksum),
            };

            if let Some(sent) = sent {
                state.checksum.reset();
                state.checksum.update(payload);
                if i64::from(state.checksum.value()) != sent {
                    tracing::error!(
                        "Checksum not matched between client and server for: {}",
                        file.name
                    );
                    return Err(Error::ChecksumMismatch {
                        file: file.name.clone(),
                        offset: state.confirmed,
                    });
                }
            }

            out.write_all(payload).await?;
            state.confirmed += payload.len() as u64;
            state.errors = 0;
            self.progress.add(payload.len() as u64);

            if state.confirmed >= file.size {
                return Ok(StreamEnd::Complete);
            }
        }
    }
}
