//! Gzip helpers for large payloads (item batches, job task lists).

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::codec::DecodeError;
use crate::error::ProtocolError;

/// Upper bound on an inflated payload. Anything larger is treated as corrupt.
pub const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress(e.to_string()))?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(DecodeError::Decompress(format!(
            "inflated payload exceeds {MAX_INFLATED_LEN} bytes"
        )));
    }
    Ok(out)
}
