//! Leader Transport
//!
//! The seam between the replication client and the leader node. The HTTP
//! implementation is the production path; tests plug in an in-memory leader.

mod http;

pub use http::HttpTransport;

use std::io::Write;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::ZlibDecoder;
use futures::stream::{BoxStream, StreamExt};

use crate::error::Result;
use crate::protocol::{CommitPoint, FileList, FileRequest};

/// Raw, already-decompressed body of a file-content response
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Requests a follower sends to its leader
#[async_trait]
pub trait LeaderTransport: Send + Sync {
    /// Latest replicable commit point on the leader
    async fn commit_info(&self) -> Result<CommitPoint>;

    /// Index and configuration files making up `version`
    async fn file_list(&self, version: i64) -> Result<FileList>;

    /// Open a packet stream for one file. The connection backing the stream
    /// is released when the stream is dropped.
    async fn open_file(&self, request: &FileRequest) -> Result<ByteStream>;

    /// Human readable leader address
    fn leader(&self) -> String;
}

/// Inflate a zlib-compressed body chunk by chunk
pub fn inflate(stream: ByteStream) -> ByteStream {
    let mut decoder = ZlibDecoder::new(Vec::new());
    stream
        .map(move |chunk| {
            let chunk = chunk?;
            decoder.write_all(&chunk)?;
            decoder.flush()?;
            Ok(Bytes::from(std::mem::take(decoder.get_mut())))
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use futures::stream;

    #[tokio::test]
    async fn test_inflate_across_chunk_boundaries() {
        let original: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&original).unwrap();
        let compressed = encoder.finish().unwrap();

        let chunks: Vec<std::io::Result<Bytes>> = compressed
            .chunks(97)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut inflated = inflate(stream::iter(chunks).boxed());

        let mut out = Vec::new();
        while let Some(chunk) = inflated.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, original);
    }

    #[tokio::test]
    async fn test_inflate_rejects_garbage() {
        let chunks = vec![Ok(Bytes::from_static(b"definitely not zlib"))];
        let mut inflated = inflate(stream::iter(chunks).boxed());
        assert!(inflated.next().await.unwrap().is_err());
    }
}
