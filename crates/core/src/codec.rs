//! Compression codec and ledger wire envelope.
//!
//! Current envelope (`v = "2.0"`):
//!
//! ```json
//! {"v":"2.0","c":true,"d":"<base64 gzip>","meta":{"originalSize":10240,"compressedSize":312,"ratio":0.0305}}
//! ```
//!
//! `d` holds the raw payload text when `c` is false. Messages without `v`/`c` are legacy
//! and are read as the raw, uncompressed payload.

use crate::config::CompressionConfig;
use crate::error::{CoreError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// Envelope version emitted by this codec
pub const ENVELOPE_VERSION: &str = "2.0";

/// Size bookkeeping attached to every envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMeta {
    pub original_size: usize,
    pub compressed_size: usize,
    /// compressed / original, four decimals; 1.0 when not compressed
    pub ratio: f64,
    /// Set when compression was attempted and fell back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Versioned wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: String,
    pub c: bool,
    pub d: String,
    pub meta: EnvelopeMeta,
}

impl Envelope {
    fn passthrough(payload: &str, error: Option<String>) -> Self {
        Self {
            v: ENVELOPE_VERSION.to_string(),
            c: false,
            d: payload.to_string(),
            meta: EnvelopeMeta {
                original_size: payload.len(),
                compressed_size: payload.len(),
                ratio: 1.0,
                error,
            },
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.c
    }

    /// Serialized bytes as submitted to the ledger
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Payload recovered from a ledger message
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub payload: String,
    pub compressed: bool,
    /// `None` for legacy messages
    pub version: Option<String>,
}

/// Gzip + base64 codec with a size threshold
#[derive(Debug, Clone)]
pub struct CompressionCodec {
    enabled: bool,
    min_size_bytes: usize,
}

impl CompressionCodec {
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_size_bytes: config.min_size_bytes,
        }
    }

    /// Wrap a payload, compressing it when it is at or above the threshold.
    ///
    /// Never fails: a compression error yields an uncompressed envelope with the error
    /// recorded in `meta.error`.
    pub fn compress(&self, payload: &str) -> Envelope {
        if !self.enabled || payload.len() < self.min_size_bytes {
            return Envelope::passthrough(payload, None);
        }
        Self::envelope_from(payload, gzip(payload.as_bytes()))
    }

    fn envelope_from(payload: &str, compressed: io::Result<Vec<u8>>) -> Envelope {
        match compressed {
            Ok(bytes) => {
                let original_size = payload.len();
                let compressed_size = bytes.len();
                let ratio = round4(compressed_size as f64 / original_size.max(1) as f64);

                debug!(original_size, compressed_size, ratio, "Payload compressed");

                Envelope {
                    v: ENVELOPE_VERSION.to_string(),
                    c: true,
                    d: BASE64.encode(bytes),
                    meta: EnvelopeMeta {
                        original_size,
                        compressed_size,
                        ratio,
                        error: None,
                    },
                }
            }
            Err(e) => {
                warn!(error = %e, size = payload.len(), "Compression failed, sending uncompressed");
                Envelope::passthrough(payload, Some(e.to_string()))
            }
        }
    }

    /// Reverse [`CompressionCodec::compress`] exactly
    pub fn decompress(&self, envelope: &Envelope) -> Result<String> {
        if !envelope.c {
            return Ok(envelope.d.clone());
        }

        let bytes = BASE64
            .decode(envelope.d.as_bytes())
            .map_err(|e| CoreError::Codec(format!("invalid base64 body: {}", e)))?;

        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(|e| CoreError::Codec(format!("gzip decode failed: {}", e)))?;
        Ok(out)
    }

    /// Decode a raw ledger message, accepting both current and legacy formats
    pub fn decode_message(&self, raw: &[u8]) -> Result<DecodedMessage> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| CoreError::Codec(format!("message is not UTF-8: {}", e)))?;

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return Ok(Self::legacy(text)),
        };

        let versioned = value.get("v").is_some() && value.get("c").is_some();
        if !versioned {
            return Ok(Self::legacy(text));
        }

        let envelope: Envelope = serde_json::from_value(value)?;
        let payload = self.decompress(&envelope)?;
        Ok(DecodedMessage {
            payload,
            compressed: envelope.c,
            version: Some(envelope.v),
        })
    }

    /// Decode a base64 message as returned by topic reads
    pub fn decode_base64_message(&self, message_b64: &str) -> Result<DecodedMessage> {
        let raw = BASE64
            .decode(message_b64.trim().as_bytes())
            .map_err(|e| CoreError::Codec(format!("invalid base64 message: {}", e)))?;
        self.decode_message(&raw)
    }

    fn legacy(text: &str) -> DecodedMessage {
        DecodedMessage {
            payload: text.to_string(),
            compressed: false,
            version: None,
        }
    }
}

fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(threshold: usize) -> CompressionCodec {
        CompressionCodec::new(&CompressionConfig {
            enabled: true,
            min_size_bytes: threshold,
        })
    }

    fn clinical_text(len: usize) -> String {
        "patient vitals stable; bp 120/80; hr 72; ".repeat(len / 40 + 1)[..len].to_string()
    }

    #[test]
    fn test_small_payload_passes_through() {
        let input = "x".repeat(50);
        let env = codec(100).compress(&input);
        assert!(!env.c);
        assert_eq!(env.d, input);
        assert_eq!(env.meta.ratio, 1.0);
    }

    #[test]
    fn test_large_payload_round_trip() {
        let input = clinical_text(10 * 1024);
        let c = codec(100);
        let env = c.compress(&input);

        assert!(env.c);
        assert_eq!(env.meta.original_size, 10 * 1024);
        assert!(env.meta.compressed_size < env.meta.original_size);
        assert!(env.meta.ratio < 1.0);
        assert_eq!(c.decompress(&env).unwrap(), input);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let input = "y".repeat(100);
        assert!(codec(100).compress(&input).c);
        assert!(!codec(101).compress(&input).c);
    }

    #[test]
    fn test_disabled_codec_never_compresses() {
        let c = CompressionCodec::new(&CompressionConfig {
            enabled: false,
            min_size_bytes: 1,
        });
        assert!(!c.compress(&clinical_text(4096)).c);
    }

    #[test]
    fn test_compression_error_falls_back() {
        let err = io::Error::new(io::ErrorKind::Other, "encoder exploded");
        let env = CompressionCodec::envelope_from("payload", Err(err));
        assert!(!env.c);
        assert_eq!(env.d, "payload");
        assert_eq!(env.meta.error.as_deref(), Some("encoder exploded"));
    }

    #[test]
    fn test_wire_field_names() {
        let env = codec(10).compress(&clinical_text(200));
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["v"], "2.0");
        assert_eq!(json["c"], true);
        assert!(json["meta"]["originalSize"].is_number());
        assert!(json["meta"]["compressedSize"].is_number());
        assert!(json["meta"].get("error").is_none());
    }

    #[test]
    fn test_decode_current_message() {
        let c = codec(10);
        let input = clinical_text(500);
        let bytes = c.compress(&input).to_bytes().unwrap();

        let decoded = c.decode_message(&bytes).unwrap();
        assert_eq!(decoded.payload, input);
        assert!(decoded.compressed);
        assert_eq!(decoded.version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_decode_legacy_message() {
        let legacy = r#"{"hash":"abc","entityType":"prescription"}"#;
        let decoded = codec(10).decode_message(legacy.as_bytes()).unwrap();
        assert_eq!(decoded.payload, legacy);
        assert!(!decoded.compressed);
        assert!(decoded.version.is_none());
    }

    #[test]
    fn test_decode_base64_message() {
        let c = codec(1_000_000);
        let bytes = c.compress("{\"kind\":\"event\"}").to_bytes().unwrap();
        let decoded = c.decode_base64_message(&BASE64.encode(bytes)).unwrap();
        assert_eq!(decoded.payload, "{\"kind\":\"event\"}");
    }

    #[test]
    fn test_corrupt_body_is_codec_error() {
        let mut env = codec(10).compress(&clinical_text(300));
        env.d = "not base64!!".to_string();
        assert!(matches!(codec(10).decompress(&env), Err(CoreError::Codec(_))));
    }
}
