//! Packet and file checksums
//!
//! Adler-32 over byte chunks, computed identically by the leader when it
//! frames a packet and by the follower when it verifies one.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use adler::Adler32;

use crate::error::Result;

/// Streaming Adler-32 checksum
#[derive(Debug, Clone)]
pub struct Checksum {
    inner: Adler32,
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

impl Checksum {
    pub fn new() -> Self {
        Self { inner: Adler32::new() }
    }

    /// Feed more bytes into the running checksum
    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.write_slice(bytes);
    }

    /// Current checksum value
    pub fn value(&self) -> u32 {
        self.inner.checksum()
    }

    /// Start over, as if nothing had been fed
    pub fn reset(&mut self) {
        self.inner = Adler32::new();
    }
}

/// Checksum of a single buffer
pub fn checksum_of(bytes: &[u8]) -> u32 {
    adler::adler32_slice(bytes)
}

/// Checksum of a whole file on disk
pub fn checksum_file(path: &Path) -> Result<u32> {
    let reader = BufReader::new(File::open(path)?);
    Ok(adler::adler32(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_value() {
        // Reference value from RFC 1950
        assert_eq!(checksum_of(b"Wikipedia"), 0x11E6_0398);
        assert_eq!(checksum_of(b""), 1);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut sum = Checksum::new();
        for chunk in data.chunks(333) {
            sum.update(chunk);
        }
        assert_eq!(sum.value(), checksum_of(&data));

        sum.reset();
        assert_eq!(sum.value(), 1);
    }

    #[test]
    fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.xml");
        std::fs::write(&path, b"<schema/>").unwrap();

        assert_eq!(checksum_file(&path).unwrap(), checksum_of(b"<schema/>"));
    }
}
