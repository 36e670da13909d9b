//! Platform integrity attestation (SafetyNet-style signed envelopes)
//!
//! Verification of an envelope proceeds in a fixed order, first failure wins:
//! 1. Header and payload decode as strict JSON
//! 2. Header algorithm is `RS256`
//! 3. Header carries at least two certificates (`x5c`)
//! 4. Leaf certificate names exactly one DNS subject, the attestation host
//! 5. Signature over the encoded `header.payload` verifies with the leaf key
//! 6. Certificate chain is trusted as of the payload's own timestamp
//!
//! Payload semantics (device verdict, package, nonce, freshness) are enrollment
//! specific and are checked by the caller on the returned payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{ChainNotTrusted, ChainValidator, EncodedCertificate};
use crate::error::{reasons, Rejection};
use crate::jws::SignedEnvelope;

/// The only accepted header algorithm
pub const SUPPORTED_ALGORITHM: &str = "RS256";

/// Default subject of the attestation signing certificate
pub const ATTESTATION_HOSTNAME: &str = "attest.android.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrityHeader {
    pub alg: String,
    pub x5c: Vec<EncodedCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IntegrityPayload {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp_ms: DateTime<Utc>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub nonce: Vec<u8>,
    pub apk_package_name: String,
    pub apk_digest_sha256: String,
    pub apk_certificate_digest_sha256: Vec<String>,
    pub cts_profile_match: bool,
    pub basic_integrity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("header is not valid JSON: {0}")]
    HeaderJson(serde_json::Error),

    #[error("payload is not valid JSON: {0}")]
    PayloadJson(serde_json::Error),

    #[error("unsupported algorithm {0}")]
    Algorithm(String),

    #[error("expected at least 2 certificates, found {0}")]
    ChainSize(usize),

    #[error("leaf certificate is not issued to the attestation host")]
    SubjectAltName,

    #[error("signature does not verify: {0}")]
    Signature(crate::error::Error),

    #[error(transparent)]
    Untrusted(#[from] ChainNotTrusted),
}

impl IntegrityError {
    pub fn reasons(&self) -> &'static [&'static str] {
        match self {
            IntegrityError::HeaderJson(_) => &[reasons::BAD_JWS, reasons::JWS_HEADER_JSON],
            IntegrityError::PayloadJson(_) => &[reasons::BAD_JWS, reasons::JWS_PAYLOAD_JSON],
            IntegrityError::Algorithm(_) => &[reasons::BAD_JWS, reasons::JWS_HEADER_ALG],
            IntegrityError::ChainSize(_) => &[reasons::BAD_JWS, reasons::JWS_HEADER_X5C],
            IntegrityError::SubjectAltName => &[reasons::BAD_JWS, reasons::JWS_HEADER_X5C_SAN],
            IntegrityError::Signature(_) => &[reasons::BAD_JWS, reasons::JWS_SIGNATURE],
            IntegrityError::Untrusted(_) => &[reasons::BAD_JWS, reasons::JWS_HEADER_NO_TRUST],
        }
    }
}

impl From<IntegrityError> for Rejection {
    fn from(err: IntegrityError) -> Self {
        Rejection::client(err.reasons()).with_cause(err)
    }
}

/// A verified integrity token
#[derive(Debug, Clone)]
pub struct IntegrityToken {
    pub header: IntegrityHeader,
    pub payload: IntegrityPayload,
}

/// Verifies integrity envelopes against the attestation service anchors
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    validator: ChainValidator,
    hostname: String,
}

impl IntegrityValidator {
    pub fn new(validator: ChainValidator) -> Self {
        Self::with_hostname(validator, ATTESTATION_HOSTNAME)
    }

    pub fn with_hostname(validator: ChainValidator, hostname: impl Into<String>) -> Self {
        Self {
            validator,
            hostname: hostname.into(),
        }
    }

    pub fn verify(&self, envelope: &SignedEnvelope) -> Result<IntegrityToken, IntegrityError> {
        // 1. Strict JSON
        let header: IntegrityHeader =
            serde_json::from_str(envelope.header()).map_err(IntegrityError::HeaderJson)?;
        let payload: IntegrityPayload =
            serde_json::from_str(envelope.payload()).map_err(IntegrityError::PayloadJson)?;

        // 2. Algorithm
        if header.alg != SUPPORTED_ALGORITHM {
            return Err(IntegrityError::Algorithm(header.alg));
        }

        // 3. Chain size
        if header.x5c.len() < 2 {
            return Err(IntegrityError::ChainSize(header.x5c.len()));
        }

        let leaf = &header.x5c[0];

        // 4. Leaf bound to the attestation host
        if !self.names_only_host(leaf) {
            return Err(IntegrityError::SubjectAltName);
        }

        // 5. Signature with the leaf key and its declared algorithm
        leaf.verify_message(envelope.signed_bytes(), envelope.signature())
            .map_err(IntegrityError::Signature)?;

        // 6. Trust as of the token's own timestamp
        self.validator.validate(&header.x5c, payload.timestamp_ms)?;

        debug!(
            timestamp = %payload.timestamp_ms,
            package = %payload.apk_package_name,
            "Verified integrity attestation"
        );

        Ok(IntegrityToken { header, payload })
    }

    fn names_only_host(&self, leaf: &EncodedCertificate) -> bool {
        match leaf.subject_alt_dns_names() {
            Ok(Some(names)) => matches!(names.as_slice(), [Some(name)] if *name == self.hostname),
            _ => false,
        }
    }
}
