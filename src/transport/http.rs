//! HTTP Leader Transport
//!
//! POSTs form-encoded commands to the leader's replication endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{inflate, ByteStream, LeaderTransport};
use crate::config::{Compression, LeaderConfig};
use crate::error::{Error, Result};
use crate::protocol::{
    value, CommitPoint, FileList, FileRequest, CMD_COMMIT_INFO, CMD_FILE_LIST,
    PARAM_COMMAND, PARAM_INDEX_VERSION, PARAM_WT, WT_BINARY,
};

/// Leader transport over HTTP
pub struct HttpTransport {
    /// Leader replication endpoint
    url: String,
    /// Pooled HTTP client
    client: reqwest::Client,
    /// Caps concurrent requests to the leader
    permits: Arc<Semaphore>,
    /// Stream compression mode
    compression: Compression,
}

impl HttpTransport {
    /// Create a transport for the configured leader
    pub fn new(config: &LeaderConfig) -> Result<Self> {
        config.validate()?;

        let external = config.compression == Compression::External;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.max_connections)
            .gzip(external)
            .deflate(external)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url.trim().to_string(),
            client,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            compression: config.compression,
        })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Transport("Connection pool closed".into()))
    }

    /// Send a structured command and decode the response document
    async fn command(
        &self,
        command: &'static str,
        extra: &[(&'static str, String)],
    ) -> Result<value::Value> {
        let _permit = self.acquire().await?;

        let mut params = vec![
            (PARAM_COMMAND, command.to_string()),
            (PARAM_WT, WT_BINARY.to_string()),
        ];
        params.extend_from_slice(extra);

        let response = self.client.post(&self.url).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(Error::LeaderStatus {
                status: response.status().as_u16(),
                command,
            });
        }

        let body = response.bytes().await?;
        value::decode(&body)
    }
}

#[async_trait]
impl LeaderTransport for HttpTransport {
    async fn commit_info(&self) -> Result<CommitPoint> {
        let response = self.command(CMD_COMMIT_INFO, &[]).await?;
        CommitPoint::from_value(&response)
    }

    async fn file_list(&self, version: i64) -> Result<FileList> {
        let response = self
            .command(CMD_FILE_LIST, &[(PARAM_INDEX_VERSION, version.to_string())])
            .await?;
        FileList::from_value(&response)
    }

    async fn open_file(&self, request: &FileRequest) -> Result<ByteStream> {
        let permit = self.acquire().await?;
        let params = request.params(self.compression == Compression::Internal);

        let response = self.client.post(&self.url).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(Error::LeaderStatus {
                status: response.status().as_u16(),
                command: crate::protocol::CMD_FILE_CONTENT,
            });
        }

        let body: ByteStream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .map(move |chunk| {
                // The permit lives exactly as long as the stream
                let _held = &permit;
                chunk
            })
            .boxed();

        Ok(match self.compression {
            Compression::Internal => inflate(body),
            _ => body,
        })
    }

    fn leader(&self) -> String {
        self.url.clone()
    }
}
