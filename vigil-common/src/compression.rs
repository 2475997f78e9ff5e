//! Gzip compression for metric payloads
//!
//! Batches are compressed before they leave the agent; the server inflates
//! request bodies that arrive with `Content-Encoding: gzip`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::Result;

/// Upper bound on an inflated request body
pub const MAX_DECOMPRESSED_SIZE: u64 = 32 << 20;

/// Compress `data` with gzip at the default level
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    debug!("Compressed {} bytes to {} bytes", data.len(), compressed.len());
    Ok(compressed)
}

/// Inflate a gzip stream, refusing to grow past `MAX_DECOMPRESSED_SIZE`
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data).take(MAX_DECOMPRESSED_SIZE + 1);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;

    if decompressed.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(crate::error::VigilError::InvalidMetric(
            "decompressed payload too large".into(),
        ));
    }
    Ok(decompressed)
}
