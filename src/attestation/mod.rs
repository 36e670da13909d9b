//! Android key attestation
//!
//! A device proves its signing key lives in secure hardware by presenting the
//! keystore certificate chain for that key:
//!
//! ## Step 1: Extension presence
//! The leaf must carry the non-critical key attestation extension.
//!
//! ## Step 2: Chain trust
//! The chain must validate against the pinned hardware vendor root as of the
//! reference instant.
//!
//! ## Step 3: Decoding
//! The extension is decoded into a [`KeyDescription`]. Policy is applied
//! separately by [`KeystorePolicy`].

pub mod decode;
pub mod policy;
pub mod types;

pub use decode::{decode_certificate, DecodeError, KEY_ATTESTATION_OID};
pub use policy::KeystorePolicy;
pub use types::{AuthorizationList, KeyDescription, RootOfTrust, VerifiedBootState};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::chain::{ChainNotTrusted, ChainValidator, EncodedCertificate};
use crate::error::{reasons, Rejection};

#[derive(Debug, thiserror::Error)]
pub enum KeystoreAttestationError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    NotTrusted(#[from] ChainNotTrusted),
}

impl KeystoreAttestationError {
    pub fn reasons(&self) -> &'static [&'static str] {
        match self {
            KeystoreAttestationError::Decode(DecodeError::NotAnAttestationCertificate) => {
                &[reasons::BAD_KEYATTESTATION, reasons::NOT_ATTESTATION]
            }
            KeystoreAttestationError::Decode(DecodeError::MalformedExtension(_)) => {
                &[reasons::BAD_KEYATTESTATION, reasons::BAD_EXT]
            }
            KeystoreAttestationError::NotTrusted(_) => {
                &[reasons::BAD_KEYATTESTATION, reasons::NOT_TRUSTED]
            }
        }
    }
}

impl From<KeystoreAttestationError> for Rejection {
    fn from(err: KeystoreAttestationError) -> Self {
        Rejection::client(err.reasons()).with_cause(err)
    }
}

/// Verifies keystore chains against the hardware vendor anchors
#[derive(Debug, Clone)]
pub struct KeystoreAttestation {
    validator: ChainValidator,
}

impl KeystoreAttestation {
    pub fn new(validator: ChainValidator) -> Self {
        Self { validator }
    }

    /// Verify `chain` (leaf first) as of `at` and decode the leaf's key description
    pub fn verify(
        &self,
        chain: &[EncodedCertificate],
        at: DateTime<Utc>,
    ) -> Result<KeyDescription, KeystoreAttestationError> {
        let leaf = chain
            .first()
            .ok_or(DecodeError::NotAnAttestationCertificate)?;

        // 1. Extension presence
        if !leaf.has_non_critical_extension(&KEY_ATTESTATION_OID) {
            return Err(DecodeError::NotAnAttestationCertificate.into());
        }

        // 2. Chain trust
        self.validator.validate(chain, at)?;

        // 3. Decode
        let description = decode_certificate(leaf)?;
        debug!(
            attestation_version = description.attestation_version,
            keymaster_version = description.keymaster_version,
            "Decoded key attestation"
        );

        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TrustAnchors;
    use chrono::TimeZone;

    const KEYSTORE_CHAIN: &str = include_str!("../../tests/fixtures/keystore-chain.pem");
    const KEYSTORE_ROOT: &str = include_str!("../../anchors/android-keystore-root.pem");
    const INTEGRITY_ROOT: &str = include_str!("../../anchors/safetynet-root.pem");

    fn chain() -> Vec<EncodedCertificate> {
        pem::parse_many(KEYSTORE_CHAIN)
            .unwrap()
            .into_iter()
            .map(|p| EncodedCertificate::from_der(p.into_contents()).unwrap())
            .collect()
    }

    fn attestation(root: &str) -> KeystoreAttestation {
        KeystoreAttestation::new(ChainValidator::new(TrustAnchors::from_pem(root).unwrap()))
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 7, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_verify_captured_chain() {
        let desc = attestation(KEYSTORE_ROOT).verify(&chain(), at()).unwrap();
        assert_eq!(desc.keymaster_version, 4);
        assert_eq!(desc.tee_enforced.purpose, Some(vec![types::PURPOSE_SIGN]));
    }

    #[test]
    fn test_intermediate_is_not_attestation() {
        let err = attestation(KEYSTORE_ROOT).verify(&chain()[1..], at()).unwrap_err();
        assert_eq!(err.reasons(), &["bad-keyattestation", "not-attestation"]);
    }

    #[test]
    fn test_untrusted_root() {
        let err = attestation(INTEGRITY_ROOT).verify(&chain(), at()).unwrap_err();
        assert_eq!(err.reasons(), &["bad-keyattestation", "not-trusted"]);

        let rejection: Rejection = err.into();
        assert!(rejection.is_client_fault());
        assert!(rejection.cause.is_some());
    }
}
