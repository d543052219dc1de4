//! Wire encoding of values stored in the remote tier
//!
//! Values travel as JSON text. Payloads at or above `min_size_bytes` are
//! compressed and framed as `!cmp:<encoding>:<base64>`; everything else is
//! stored as plain JSON. Decoding never fails loudly: a frame that cannot be
//! decoded reads as absent.

use crate::cache::config::{CompressionConfig, CompressionEncoding};
use crate::error::{CacheError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::{debug, warn};

/// Prefix marking a compressed payload
pub const COMPRESSED_PREFIX: &str = "!cmp:";

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_WINDOW_BITS: u32 = 22;

/// Compression codec configured once per cache
#[derive(Debug, Clone)]
pub struct CompressionCodec {
    config: CompressionConfig,
}

impl CompressionCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether a JSON payload is large enough to be compressed
    pub fn should_compress(&self, json: &str) -> bool {
        self.config.enabled && json.len() >= self.config.min_size_bytes
    }

    /// Produce the wire string for a JSON payload
    ///
    /// Falls back to the raw JSON when compression is off, the payload is small
    /// or the compressor fails.
    pub fn encode(&self, json: String) -> String {
        if !self.should_compress(&json) {
            return json;
        }

        match self.compress(&json) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(error = %e, "Failed to compress cache value, storing raw JSON");
                json
            }
        }
    }

    /// Compress a JSON payload into a `!cmp:` frame
    pub fn compress(&self, json: &str) -> Result<String> {
        let encoding = self.config.encoding;
        let bytes = match encoding {
            CompressionEncoding::Brotli => brotli_compress(json.as_bytes(), self.config.brotli_quality)?,
            CompressionEncoding::Gzip => gzip_compress(json.as_bytes(), self.config.gzip_level)?,
        };

        debug!(
            encoding = %encoding,
            original = json.len(),
            compressed = bytes.len(),
            "Compressed cache payload"
        );
        Ok(format!("{}{}:{}", COMPRESSED_PREFIX, encoding, STANDARD.encode(bytes)))
    }

    /// Recover the JSON payload from a wire string
    ///
    /// Plain strings are returned as-is. Malformed frames yield `None`.
    pub fn decompress(&self, raw: &str) -> Option<String> {
        let Some(payload) = raw.strip_prefix(COMPRESSED_PREFIX) else {
            return Some(raw.to_string());
        };

        let snippet: String = raw.chars().take(32).collect();

        let Some((name, body)) = payload.split_once(':').filter(|(name, _)| !name.is_empty()) else {
            warn!(raw = %snippet, "Malformed compressed payload header");
            return None;
        };

        let encoding = match name.parse::<CompressionEncoding>() {
            Ok(encoding) => encoding,
            Err(_) => {
                warn!(raw = %snippet, encoding = %name, "Unknown compressed payload encoding");
                return None;
            }
        };

        if body.is_empty() {
            warn!(raw = %snippet, "Compressed payload missing body");
            return None;
        }

        let bytes = match STANDARD.decode(body) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to decode compressed payload");
                return None;
            }
        };

        let decompressed = match encoding {
            CompressionEncoding::Brotli => brotli_decompress(&bytes),
            CompressionEncoding::Gzip => gzip_decompress(&bytes),
        };

        match decompressed {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "Failed to decompress payload");
                None
            }
        }
    }
}

fn brotli_compress(data: &[u8], quality: u32) -> Result<Vec<u8>> {
    let mut compressed = Vec::new();
    let mut reader = brotli::CompressorReader::new(data, BROTLI_BUFFER_SIZE, quality.min(11), BROTLI_WINDOW_BITS);
    reader
        .read_to_end(&mut compressed)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(compressed)
}

fn brotli_decompress(data: &[u8]) -> Result<String> {
    let mut json = String::new();
    brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE)
        .read_to_string(&mut json)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(json)
}

fn gzip_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::Compression(e.to_string()))
}

fn gzip_decompress(data: &[u8]) -> Result<String> {
    let mut json = String::new();
    GzDecoder::new(data)
        .read_to_string(&mut json)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(encoding: CompressionEncoding) -> CompressionCodec {
        CompressionCodec::new(CompressionConfig {
            enabled: true,
            min_size_bytes: 256,
            encoding,
            brotli_quality: 5,
            gzip_level: 6,
        })
    }

    fn large_json() -> String {
        let items: Vec<_> = (0..100)
            .map(|i| serde_json::json!({ "id": i, "name": format!("exercise-{}", i), "sets": [8, 10, 12] }))
            .collect();
        serde_json::to_string(&items).unwrap()
    }

    #[test]
    fn test_brotli_round_trip() {
        let codec = codec(CompressionEncoding::Brotli);
        let json = large_json();

        let wire = codec.encode(json.clone());
        assert!(wire.starts_with("!cmp:brotli:"));
        assert!(wire.len() < json.len());
        assert_eq!(codec.decompress(&wire), Some(json));
    }

    #[test]
    fn test_gzip_round_trip() {
        let codec = codec(CompressionEncoding::Gzip);
        let json = large_json();

        let wire = codec.encode(json.clone());
        assert!(wire.starts_with("!cmp:gzip:"));
        assert_eq!(codec.decompress(&wire), Some(json));
    }

    #[test]
    fn test_frame_names_its_own_encoding() {
        // A gzip frame decodes even when the codec is configured for brotli
        let wire = codec(CompressionEncoding::Gzip).encode(large_json());
        assert_eq!(codec(CompressionEncoding::Brotli).decompress(&wire), Some(large_json()));
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let codec = codec(CompressionEncoding::Brotli);
        let json = r#"{"name":"A"}"#.to_string();

        let wire = codec.encode(json.clone());
        assert!(!wire.starts_with(COMPRESSED_PREFIX));
        assert_eq!(wire, json);
        assert_eq!(codec.decompress(&wire), Some(json));
    }

    #[test]
    fn test_disabled_codec_never_compresses() {
        let mut config = codec(CompressionEncoding::Brotli).config().clone();
        config.enabled = false;
        let codec = CompressionCodec::new(config);

        let json = large_json();
        assert_eq!(codec.encode(json.clone()), json);
    }

    #[test]
    fn test_threshold_counts_utf8_bytes() {
        let codec = codec(CompressionEncoding::Gzip);
        // 127 two-byte characters plus quotes: 256 bytes
        let json = format!("\"{}\"", "é".repeat(127));
        assert!(json.len() >= 256);
        assert!(codec.should_compress(&json));
    }

    #[test]
    fn test_malformed_payloads_read_as_absent() {
        let codec = codec(CompressionEncoding::Brotli);

        assert_eq!(codec.decompress("!cmp:brotli:"), None);
        assert_eq!(codec.decompress("!cmp:brotli:%%%"), None);
        assert_eq!(codec.decompress("!cmp:brotli"), None);
        assert_eq!(codec.decompress("!cmp::aGVsbG8="), None);
        assert_eq!(codec.decompress("!cmp:zstd:aGVsbG8="), None);
        // valid base64, but not a gzip stream
        assert_eq!(codec.decompress("!cmp:gzip:aGVsbG8="), None);
    }
}
