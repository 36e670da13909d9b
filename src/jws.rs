//! Compact signed JSON envelopes (`header.payload.signature`)
//!
//! The signature covers the encoded `header.payload` text, so the original
//! string is kept verbatim and identity is defined by it alone.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// URL-safe base64 that tolerates padding and non-canonical trailing bits
const SEGMENT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed signed envelope: {0}")]
pub struct MalformedEnvelope(String);

#[derive(Clone)]
pub struct SignedEnvelope {
    original: String,
    header: String,
    payload: String,
    signature: Vec<u8>,
    /// Length of `header.payload` within `original`
    signed_len: usize,
}

impl SignedEnvelope {
    pub fn parse(value: &str) -> Result<Self, MalformedEnvelope> {
        let segments: Vec<&str> = value.split('.').collect();
        if segments.len() != 3 {
            return Err(MalformedEnvelope(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }

        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(MalformedEnvelope(format!("segment {} is empty", index)));
            }
            if !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            {
                return Err(MalformedEnvelope(format!(
                    "segment {} is outside the base64url alphabet",
                    index
                )));
            }
        }

        let decode = |index: usize| {
            SEGMENT_ENGINE
                .decode(segments[index])
                .map_err(|e| MalformedEnvelope(format!("segment {}: {}", index, e)))
        };

        let text = |index: usize| {
            String::from_utf8(decode(index)?)
                .map_err(|e| MalformedEnvelope(format!("segment {}: {}", index, e)))
        };

        let header = text(0)?;
        let payload = text(1)?;
        let signature = decode(2)?;

        Ok(Self {
            original: value.to_string(),
            header,
            payload,
            signature,
            signed_len: segments[0].len() + 1 + segments[1].len(),
        })
    }

    /// The envelope exactly as received
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Decoded header JSON text
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Decoded payload JSON text
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Bytes covered by the signature: the encoded `header.payload`
    pub fn signed_bytes(&self) -> &[u8] {
        &self.original.as_bytes()[..self.signed_len]
    }
}

impl PartialEq for SignedEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl Eq for SignedEnvelope {}

impl Hash for SignedEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.original.hash(state);
    }
}

impl fmt::Debug for SignedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedEnvelope")
            .field("header", &self.header)
            .field("len", &self.original.len())
            .finish()
    }
}

impl FromStr for SignedEnvelope {
    type Err = MalformedEnvelope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SignedEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for SignedEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        SignedEnvelope::parse(&value).map_err(de::Error::custom)
    }
}
