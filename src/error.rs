//! Error types for device enrollment
//!
//! Two kinds of failure flow through the crate:
//! - [`Error`]: infrastructure and parsing failures with a human-readable context string
//! - [`Rejection`]: a decision about an enrollment attempt, carrying a status class and
//!   the machine-readable reason codes that are returned to the device

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Certificate parsing failed: {0}")]
    Certificate(String),

    #[error("Trust anchor loading failed: {0}")]
    TrustAnchor(String),

    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Collaborator call failed: {0}")]
    Collaborator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reason codes surfaced to the device in `error.reasons`
pub mod reasons {
    pub const BAD_PAYLOAD: &str = "bad-payload";
    pub const TOKEN_TOO_SHORT: &str = "token-too-short";
    pub const NOT_ENOUGH_CERTIFICATES: &str = "not-enough-certificates";
    pub const INCORRECT_SIZE: &str = "incorrect-size";
    pub const NEGATIVE_COUNTER: &str = "negative-counter";

    pub const BAD_POW: &str = "bad-pow";
    pub const BAD_SIGNATURE: &str = "bad-signature";
    pub const BAD_IDENTITY_AGREEMENT: &str = "bad-identity-agreement";
    pub const LOW_ORDER_POINT: &str = "low-order-point";

    pub const BAD_JWS: &str = "bad-jws";
    pub const JWS_HEADER_JSON: &str = "jws-header-json";
    pub const JWS_PAYLOAD_JSON: &str = "jws-payload-json";
    pub const JWS_HEADER_ALG: &str = "jws-header-alg";
    pub const JWS_HEADER_X5C: &str = "jws-header-x5c";
    pub const JWS_HEADER_X5C_SAN: &str = "jws-header-x5c-san";
    pub const JWS_SIGNATURE: &str = "jws-signature";
    pub const JWS_HEADER_NO_TRUST: &str = "jws-header-no-trust";

    pub const BAD_SAFETYNET: &str = "bad-safetynet";
    pub const INCOMPATIBLE_DEVICE: &str = "incompatible-device";
    pub const UNKNOWN_PACKAGE_NAME: &str = "unknown-package-name";
    pub const NONCE_NOT_TOKEN: &str = "nonce-not-token";
    pub const STALE_ATTESTATION: &str = "stale-attestation";

    pub const BAD_KEYATTESTATION: &str = "bad-keyattestation";
    pub const NOT_ATTESTATION: &str = "not-attestation";
    pub const NOT_TRUSTED: &str = "not-trusted";
    pub const BAD_EXT: &str = "bad-ext";

    pub const BAD_DEVICE_CERTIFICATE: &str = "bad-device-certificate";
    pub const OLD_KEYMASTER: &str = "old-keymaster";
    pub const ATTESTATION_NOT_TEE: &str = "attestation-not-tee";
    pub const ATTESTATION_NOT_STRONGBOX: &str = "attestation-not-strongbox";
    pub const KEYMASTER_NOT_TEE: &str = "keymaster-not-tee";
    pub const KEYMASTER_NOT_STRONGBOX: &str = "keymaster-not-strongbox";
    pub const BAD_PURPOSE: &str = "bad-purpose";
    pub const BAD_EC_CURVE: &str = "bad-ec-curve";
    pub const ORIGIN_NOT_GENERATED: &str = "origin-not-generated";
    pub const CHALLENGE_MISMATCH: &str = "challenge-mismatch";

    pub const BODY_IS_OCTET_STREAM: &str = "body-is-octet-stream";
    pub const BODY_NOT_JSON: &str = "body-not-json";
    pub const BODY_BAD_JSON: &str = "body-bad-json";
    pub const NOT_YOUR_FAULT: &str = "not-your-fault";
}

/// Who is at fault for a rejected enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The device sent something unacceptable (HTTP 400)
    ClientFault,
    /// The service failed on its own (HTTP 500)
    ServerFault,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::ClientFault => 400,
            Status::ServerFault => 500,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A terminal enrollment failure
///
/// `reasons` is ordered from general to most specific. `cause` is kept for
/// server-side diagnostics only and is never serialized into a response.
#[derive(Error, Debug)]
#[error("enrollment rejected ({status}): {}", .reasons.join(", "))]
pub struct Rejection {
    pub status: Status,
    pub reasons: Vec<&'static str>,
    pub track: Option<String>,
    #[source]
    pub cause: Option<Cause>,
}

impl Rejection {
    /// Client-fault rejection with the given reason codes
    pub fn client(reasons: &[&'static str]) -> Self {
        Self {
            status: Status::ClientFault,
            reasons: reasons.to_vec(),
            track: None,
            cause: None,
        }
    }

    /// Opaque server-fault rejection; the cause stays server-side
    pub fn server(cause: impl Into<Cause>) -> Self {
        Self {
            status: Status::ServerFault,
            reasons: vec![reasons::NOT_YOUR_FAULT],
            track: None,
            cause: Some(cause.into()),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_track(mut self, track: impl Into<String>) -> Self {
        self.track = Some(track.into());
        self
    }

    pub fn is_client_fault(&self) -> bool {
        self.status == Status::ClientFault
    }
}
