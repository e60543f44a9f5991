//! Gzip helpers for the WebSocket frame path

use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Outgoing payloads below this size are never compressed; the gzip header
/// overhead outweighs the gain.
pub const COMPRESS_THRESHOLD: usize = 512;

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let input = "the quick brown fox ".repeat(100);
        let compressed = gzip_compress(input.as_bytes()).unwrap();
        assert!(compressed.len() < input.len());
        let restored = gzip_decompress(&compressed).unwrap();
        assert_eq!(restored, input.as_bytes());
    }

    #[test]
    fn rejects_garbage() {
        assert!(gzip_decompress(b"definitely not gzip").is_err());
    }
}
