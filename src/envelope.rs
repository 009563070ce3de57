//! Versioned serialization envelope
//!
//! Layout: `b"MDCE"` magic, one envelope-version byte, one codec-id byte,
//! then the codec body, zstd-compressed when the entry's `compressed` flag
//! is set. The header is never compressed, so a version or codec mismatch is
//! detected before any payload parsing is attempted.

use crate::codecs::JsonCodec;
use crate::config::CompressionConfig;
use crate::error::{CacheError, CacheResult};
use crate::traits::CacheCodec;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"MDCE";

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2;

/// Output of [`Envelope::encode`]
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    /// Compression was wanted but failed; the payload is stored raw
    pub compression_failed: bool,
    /// Uncompressed codec body length
    pub body_len: usize,
}

/// Envelope encoder/decoder
#[derive(Debug, Clone)]
pub struct Envelope<C: CacheCodec = JsonCodec> {
    codec: C,
    compression: CompressionConfig,
}

impl Envelope<JsonCodec> {
    /// JSON envelope with the given compression settings
    #[must_use]
    pub const fn json(compression: CompressionConfig) -> Self {
        Self {
            codec: JsonCodec,
            compression,
        }
    }
}

impl<C: CacheCodec> Envelope<C> {
    #[must_use]
    pub const fn new(codec: C, compression: CompressionConfig) -> Self {
        Self { codec, compression }
    }

    #[must_use]
    pub const fn compression(&self) -> &CompressionConfig {
        &self.compression
    }

    fn wants_compression(&self, body_len: usize) -> bool {
        self.compression.level > 0 && body_len > self.compression.threshold_bytes
    }

    /// Serialize `value`, compressing bodies above the configured threshold.
    ///
    /// # Errors
    ///
    /// `CacheError::Serialization` if the codec cannot represent the value.
    /// A compression failure is not an error: the raw body is stored instead.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<EncodedPayload> {
        let body = self
            .codec
            .serialize(value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(ENVELOPE_VERSION);
        bytes.push(self.codec.id());

        if !self.wants_compression(body.len()) {
            bytes.extend_from_slice(&body);
            return Ok(EncodedPayload {
                bytes,
                compressed: false,
                compression_failed: false,
                body_len: body.len(),
            });
        }

        match zstd::stream::encode_all(body.as_slice(), self.compression.level) {
            Ok(packed) => {
                debug!(
                    original = body.len(),
                    compressed = packed.len(),
                    "Compressed cache payload"
                );
                bytes.extend_from_slice(&packed);
                Ok(EncodedPayload {
                    bytes,
                    compressed: true,
                    compression_failed: false,
                    body_len: body.len(),
                })
            }
            Err(e) => {
                warn!(error = %e, size = body.len(), "Compression failed, storing payload uncompressed");
                bytes.extend_from_slice(&body);
                Ok(EncodedPayload {
                    bytes,
                    compressed: false,
                    compression_failed: true,
                    body_len: body.len(),
                })
            }
        }
    }

    /// Decode bytes produced by [`encode`](Self::encode).
    ///
    /// `key` only labels the error.
    ///
    /// # Errors
    ///
    /// `CacheError::CorruptEntry` on a bad header, an envelope version or codec
    /// mismatch, a decompression failure or a body the codec rejects.
    pub fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8], compressed: bool) -> CacheResult<T> {
        let corrupt = |reason: String| CacheError::CorruptEntry {
            key: key.to_string(),
            reason,
        };

        let (header, body) = bytes
            .split_at_checked(HEADER_LEN)
            .ok_or_else(|| corrupt(format!("payload shorter than {HEADER_LEN}-byte header")))?;
        let (magic, version_and_codec) = header.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(corrupt("missing envelope magic".into()));
        }
        match version_and_codec {
            [version, codec] => {
                if *version != ENVELOPE_VERSION {
                    return Err(corrupt(format!(
                        "envelope version {version} does not match supported version {ENVELOPE_VERSION}"
                    )));
                }
                if *codec != self.codec.id() {
                    return Err(corrupt(format!(
                        "codec id {codec} does not match {} ({})",
                        self.codec.id(),
                        self.codec.name()
                    )));
                }
            }
            _ => return Err(corrupt("truncated envelope header".into())),
        }

        let inflated;
        let body = if compressed {
            inflated = zstd::stream::decode_all(body).map_err(|e| corrupt(format!("decompression failed: {e}")))?;
            inflated.as_slice()
        } else {
            body
        };

        self.codec
            .deserialize(body)
            .map_err(|e| corrupt(format!("decode failed: {e}")))
    }
}
