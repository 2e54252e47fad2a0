// Payload transport compression
//
// Event bodies may travel as gzip-then-base64 when that actually shrinks
// them. The encoded form is a small JSON wrapper so receivers can tell the
// two apart without sniffing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::p2p::error::P2pError;

pub const GZIP_BASE64_ENCODING: &str = "gzip+base64";

#[derive(Debug, Serialize, Deserialize)]
pub struct CompressedBody {
    pub encoding: String,
    pub data: String,
}

pub fn gzip_base64(raw: &[u8]) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(raw)?;
    Ok(BASE64.encode(encoder.finish()?))
}

pub fn gunzip_base64(encoded: &str) -> Result<Vec<u8>, P2pError> {
    let compressed = BASE64
        .decode(encoded)
        .map_err(|error| P2pError::MalformedResponse {
            peer: String::new(),
            reason: format!("invalid base64 body: {}", error),
        })?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|error| P2pError::MalformedResponse {
            peer: String::new(),
            reason: format!("invalid gzip body: {}", error),
        })?;
    Ok(raw)
}

/// Compress when it pays off: returns the wrapper body only if the encoded
/// form is smaller than the raw JSON.
pub fn maybe_compress(raw: &[u8]) -> Option<CompressedBody> {
    let encoded = gzip_base64(raw).ok()?;
    if encoded.len() < raw.len() {
        Some(CompressedBody {
            encoding: GZIP_BASE64_ENCODING.to_string(),
            data: encoded,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let raw = br#"{"type":"block.added","payload":{"height":42}}"#;
        let encoded = gzip_base64(raw).unwrap();
        assert_eq!(gunzip_base64(&encoded).unwrap(), raw);
    }

    #[test]
    fn test_small_bodies_stay_raw() {
        // gzip overhead dominates tiny payloads
        assert!(maybe_compress(b"{}").is_none());
    }

    #[test]
    fn test_repetitive_bodies_compress() {
        let raw = "x".repeat(4096);
        let body = maybe_compress(raw.as_bytes()).unwrap();
        assert_eq!(body.encoding, GZIP_BASE64_ENCODING);
        assert!(body.data.len() < raw.len());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(gunzip_base64("!!!").is_err());
        let valid_base64_bad_gzip = base64::engine::general_purpose::STANDARD.encode(b"junk");
        assert!(gunzip_base64(&valid_base64_bad_gzip).is_err());
    }
}
