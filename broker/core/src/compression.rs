//! Per-queue compression (§4.12). `flate2`'s `GzEncoder`/`GzDecoder` mirrors the teacher's
//! `serde_json`-everywhere preference for reaching into the ecosystem rather than hand-rolling a
//! codec.

use crate::error::{BrokerError, BrokerResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    pub level: u32,
    pub min_size: usize,
    pub auto_enable: bool,
}

impl Default for CompressionConfig {
    fn default() -> CompressionConfig {
        CompressionConfig { algorithm: CompressionAlgorithm::None, level: 6, min_size: 256, auto_enable: false }
    }
}

pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// `CMF`/`FLG` mod-31 check shared by every zlib-header detector: `CM` (low nibble of `CMF`) must
/// be 8 (deflate) and the 16-bit big-endian `CMF:FLG` word must be a multiple of 31.
fn looks_zlib_wrapped(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    let cmf = data[0];
    let flg = data[1];
    (cmf & 0x0F) == 8 && (u16::from(cmf) * 256 + u16::from(flg)) % 31 == 0
}

/// Heuristic container-format sniff used on receive even when the `Compressed` property is
/// absent, per §6's GZIP detection note (gzip magic, or the CMF/FLG mod-31 check for zlib).
pub fn looks_compressed(data: &[u8]) -> bool {
    (data.len() >= 2 && data[0] == GZIP_MAGIC[0] && data[1] == GZIP_MAGIC[1]) || looks_zlib_wrapped(data)
}

/// Compresses `data`, returning the encoded bytes and the wall-clock duration of the operation
/// (sampled into the queue's metrics per §1.2).
pub fn compress(data: &[u8], level: u32) -> BrokerResult<(Vec<u8>, std::time::Duration)> {
    let started = Instant::now();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data).map_err(|_| BrokerError::InternalError)?;
    let encoded = encoder.finish().map_err(|_| BrokerError::InternalError)?;
    Ok((encoded, started.elapsed()))
}

pub fn decompress(data: &[u8]) -> BrokerResult<(Vec<u8>, std::time::Duration)> {
    let started = Instant::now();
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|_| BrokerError::InternalError)?;
    Ok((out, started.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_gzip() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let (compressed, _) = compress(&original, 6).unwrap();
        assert!(looks_compressed(&compressed));
        let (decompressed, _) = decompress(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn non_gzip_data_is_not_mistaken_for_compressed() {
        assert!(!looks_compressed(b"plain text"));
    }
}
