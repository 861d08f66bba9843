// compression.rs — raw deflate helpers for cache files and large MPI payloads
//
// Raw deflate (no zlib header), matching windowBits = -15 semantics so the
// at-rest format stays stable across toolchain versions.

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

/// Maximum decompressed size accepted from untrusted input (worker
/// results, cache files) to prevent decompression bombs.
pub const MAX_DECOMPRESS_SIZE: usize = 0x4000000; // 64 MB

/// Compress data unconditionally using raw deflate.
pub fn compress_data(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut compressed = Vec::with_capacity(data.len() / 2 + 64);
    encoder
        .read_to_end(&mut compressed)
        .map_err(|e| format!("compression failed: {}", e))?;
    Ok(compressed)
}

/// Decompress raw deflate data with a hard output-size cap.
pub fn decompress_data(data: &[u8], max_size: usize) -> Result<Vec<u8>, String> {
    let max_size = max_size.min(MAX_DECOMPRESS_SIZE);
    let mut decoder = DeflateDecoder::new(data);
    let mut decompressed = Vec::with_capacity(data.len().saturating_mul(4).min(max_size));

    let mut buffer = [0u8; 4096];
    loop {
        match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if decompressed.len() + n > max_size {
                    return Err(format!(
                        "decompressed data exceeds limit of {} bytes",
                        max_size
                    ));
                }
                decompressed.extend_from_slice(&buffer[..n]);
            }
            Err(e) => return Err(format!("decompression failed: {}", e)),
        }
    }
    Ok(decompressed)
}

/// Decompress data whose uncompressed size is recorded alongside it.
pub fn decompress_with_size(data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, String> {
    if uncompressed_size > MAX_DECOMPRESS_SIZE {
        return Err(format!(
            "uncompressed size {} exceeds maximum {}",
            uncompressed_size, MAX_DECOMPRESS_SIZE
        ));
    }
    let decompressed = decompress_data(data, uncompressed_size)?;
    if decompressed.len() != uncompressed_size {
        return Err(format!(
            "size mismatch: expected {}, got {}",
            uncompressed_size,
            decompressed.len()
        ));
    }
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let original: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        let compressed = compress_data(&original).unwrap();
        let back = decompress_with_size(&compressed, original.len()).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn test_size_limit() {
        let original = vec![0u8; 100000];
        let compressed = compress_data(&original).unwrap();
        assert!(decompress_data(&compressed, 1000).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let compressed = compress_data(b"some bytes").unwrap();
        assert!(decompress_with_size(&compressed, 3).is_err());
    }
}
