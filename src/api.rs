//! Enrollment wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attestation::KeyDescription;
use crate::chain::EncodedCertificate;
use crate::error::Rejection;
use crate::jws::SignedEnvelope;

/// Enrollment request sent by a device
///
/// Decoding is strict: unknown fields, bad base64, unparseable certificates
/// and malformed envelopes all fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnrollmentRequest {
    /// Keystore chain for the device signing key, leaf first
    pub device_certificate: Vec<EncodedCertificate>,

    /// Device X25519 public value
    #[serde(with = "crate::encoding::base64_bytes")]
    pub identity_agreement: Vec<u8>,

    /// Integrity attestation bound to `token`
    pub safety_net: SignedEnvelope,

    /// Push registration token, doubles as the enrollment nonce
    pub token: String,

    #[serde(with = "crate::encoding::base64_bytes")]
    pub signature: Vec<u8>,

    /// Proof-of-work counter
    pub hashcash20: i32,
}

impl EnrollmentRequest {
    /// Bytes the device key signs: certificates, agreement, envelope, token
    pub fn signed_message(&self) -> Vec<u8> {
        let mut message = Vec::new();
        for cert in &self.device_certificate {
            message.extend_from_slice(cert.der());
        }
        message.extend_from_slice(&self.identity_agreement);
        message.extend_from_slice(self.safety_net.original().as_bytes());
        message.extend_from_slice(self.token.as_bytes());
        message
    }

    /// Buffers covered by the proof of work, in order
    pub fn work_buffers(&self) -> Vec<&[u8]> {
        let mut buffers: Vec<&[u8]> = self.device_certificate.iter().map(|c| c.der()).collect();
        buffers.push(&self.identity_agreement);
        buffers.push(self.safety_net.original().as_bytes());
        buffers.push(self.token.as_bytes());
        buffers.push(&self.signature);
        buffers
    }
}

/// Enrollment response: exactly one of `result` or `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EnrollmentResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl EnrollmentResponse {
    pub fn success(result: EnrollmentResult) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: ErrorBody) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResult {
    /// Keyed-hash secret handed to the device once
    #[serde(with = "crate::encoding::base64_bytes")]
    pub identity_key: Vec<u8>,

    pub certificate_description: KeyDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

impl From<&Rejection> for ErrorBody {
    fn from(rejection: &Rejection) -> Self {
        Self {
            code: rejection.status.code(),
            reasons: rejection.reasons.iter().map(|r| r.to_string()).collect(),
            track: rejection.track.clone(),
        }
    }
}

/// Push message announcing a completed enrollment to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistrationMessage {
    #[serde(rename = "FCM")]
    pub fcm: RegistrationPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPayload {
    /// Service half of the identity agreement
    #[serde(with = "crate::encoding::base64_bytes")]
    pub identity_agreement: Vec<u8>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl DeviceRegistrationMessage {
    pub fn new(identity_agreement: &[u8], timestamp: DateTime<Utc>) -> Self {
        Self {
            fcm: RegistrationPayload {
                identity_agreement: identity_agreement.to_vec(),
                timestamp,
            },
        }
    }
}
