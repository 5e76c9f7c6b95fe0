//! File Content Packet Stream
//!
//! A file-content response is a sequence of packets:
//!
//! ```text
//! i32   length      big-endian; <= 0 ends the stream with no content
//! i64   checksum    only when checksums were requested
//! [u8]  payload     `length` bytes
//! ```
//!
//! The stream otherwise ends once the advertised file size has been sent.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::checksum::checksum_of;
use crate::error::{Error, Result};

/// Largest packet a reader will accept
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// Packet size used by [`PacketWriter::default`]
pub const DEFAULT_PACKET_SIZE: usize = 1024 * 1024;

/// One packet read off the stream
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Payload bytes with the sender's checksum, if one was sent
    Data { payload: &'a [u8], checksum: Option<i64> },
    /// Non-positive length marker
    End,
}

/// Reads packets from a decoded response body
pub struct PacketReader<R> {
    reader: R,
    with_checksum: bool,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Create a reader; `with_checksum` must match what was requested
    pub fn new(reader: R, with_checksum: bool) -> Self {
        Self {
            reader,
            with_checksum,
            buf: Vec::new(),
        }
    }

    /// Read the next packet. Stream read failures surface as transport errors.
    pub async fn next_packet(&mut self) -> Result<Packet<'_>> {
        let length = self.reader.read_i32().await.map_err(interrupted)?;
        if length <= 0 {
            return Ok(Packet::End);
        }

        let length = length as usize;
        if length > MAX_PACKET_SIZE {
            return Err(Error::Protocol(format!(
                "Packet of {} bytes exceeds limit of {}",
                length, MAX_PACKET_SIZE
            )));
        }

        let checksum = if self.with_checksum {
            Some(self.reader.read_i64().await.map_err(interrupted)?)
        } else {
            None
        };

        if self.buf.len() < length {
            self.buf.resize(length, 0);
        }
        self.reader
            .read_exact(&mut self.buf[..length])
            .await
            .map_err(interrupted)?;

        Ok(Packet::Data {
            payload: &self.buf[..length],
            checksum,
        })
    }
}

fn interrupted(e: std::io::Error) -> Error {
    Error::Transport(format!("Packet stream interrupted: {}", e))
}

/// Frames file content into packets
#[derive(Debug, Clone, Copy)]
pub struct PacketWriter {
    packet_size: usize,
    with_checksum: bool,
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_SIZE, true)
    }
}

impl PacketWriter {
    pub fn new(packet_size: usize, with_checksum: bool) -> Self {
        Self {
            packet_size: packet_size.max(1),
            with_checksum,
        }
    }

    /// Append one framed packet to `buf`
    pub fn encode_packet(&self, buf: &mut BytesMut, payload: &[u8]) {
        buf.reserve(payload.len() + 12);
        buf.put_i32(payload.len() as i32);
        if self.with_checksum {
            buf.put_i64(checksum_of(payload) as i64);
        }
        buf.put_slice(payload);
    }

    /// Append the no-content terminator
    pub fn encode_end(&self, buf: &mut BytesMut) {
        buf.put_i32(0);
    }

    /// Frame `data[offset..]`, one buffer per packet. An offset at or past the
    /// end yields a single terminator.
    pub fn encode_packets(&self, data: &[u8], offset: u64) -> Vec<Bytes> {
        let start = (offset as usize).min(data.len());
        let remaining = &data[start..];

        if remaining.is_empty() {
            let mut buf = BytesMut::with_capacity(4);
            self.encode_end(&mut buf);
            return vec![buf.freeze()];
        }

        remaining
            .chunks(self.packet_size)
            .map(|chunk| {
                let mut buf = BytesMut::new();
                self.encode_packet(&mut buf, chunk);
                buf.freeze()
            })
            .collect()
    }

    /// Frame `data[offset..]` as one contiguous body
    pub fn encode_stream(&self, data: &[u8], offset: u64) -> Bytes {
        let mut body = BytesMut::new();
        for packet in self.encode_packets(data, offset) {
            body.put_slice(&packet);
        }
        body.freeze()
    }
}
