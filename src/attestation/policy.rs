//! Enrollment policy over a decoded key description
//!
//! Each rule is an independent rejection, checked in order:
//! 1. Keymaster version is a supported generation
//! 2. Attestation and keymaster run in a TEE or StrongBox
//! 3. The key has exactly one purpose, signing
//! 4. The key is on the supported EC curve
//! 5. The key was generated on the device, not imported
//! 6. The attestation challenge is the digest of the enrollment token

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::types::{
    KeyDescription, EC_CURVE_P_256, KEYMASTER_V2, KEYMASTER_V3, KEYMASTER_V4, ORIGIN_GENERATED,
    PURPOSE_SIGN, SECURITY_LEVEL_STRONGBOX, SECURITY_LEVEL_TRUSTED_ENVIRONMENT,
};
use crate::error::{reasons, Rejection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystorePolicy {
    supported_keymaster_versions: Vec<i64>,
}

impl Default for KeystorePolicy {
    fn default() -> Self {
        Self {
            supported_keymaster_versions: vec![KEYMASTER_V2, KEYMASTER_V3, KEYMASTER_V4],
        }
    }
}

impl KeystorePolicy {
    pub fn new(supported_keymaster_versions: Vec<i64>) -> Self {
        Self { supported_keymaster_versions }
    }

    /// Check `description` against policy for an enrollment bound to `token`
    pub fn enforce(&self, description: &KeyDescription, token: &str) -> Result<(), Rejection> {
        if !self
            .supported_keymaster_versions
            .contains(&description.keymaster_version)
        {
            return Err(device_certificate(&[reasons::OLD_KEYMASTER]));
        }

        if !is_hardware_level(description.attestation_security_level) {
            return Err(device_certificate(&[
                reasons::ATTESTATION_NOT_TEE,
                reasons::ATTESTATION_NOT_STRONGBOX,
            ]));
        }

        if !is_hardware_level(description.keymaster_security_level) {
            return Err(device_certificate(&[
                reasons::KEYMASTER_NOT_TEE,
                reasons::KEYMASTER_NOT_STRONGBOX,
            ]));
        }

        let tee = &description.tee_enforced;

        match tee.purpose.as_deref() {
            Some([PURPOSE_SIGN]) => {}
            _ => return Err(device_certificate(&[reasons::BAD_PURPOSE])),
        }

        if tee.ec_curve != Some(EC_CURVE_P_256) {
            return Err(device_certificate(&[reasons::BAD_EC_CURVE]));
        }

        if tee.origin != Some(ORIGIN_GENERATED) {
            return Err(device_certificate(&[reasons::ORIGIN_NOT_GENERATED]));
        }

        let expected = Sha256::digest(token.as_bytes());
        if !bool::from(description.attestation_challenge.as_slice().ct_eq(expected.as_slice())) {
            return Err(device_certificate(&[reasons::CHALLENGE_MISMATCH]));
        }

        Ok(())
    }
}

fn is_hardware_level(level: i64) -> bool {
    level == SECURITY_LEVEL_TRUSTED_ENVIRONMENT || level == SECURITY_LEVEL_STRONGBOX
}

fn device_certificate(specific: &[&'static str]) -> Rejection {
    let mut all = vec![reasons::BAD_DEVICE_CERTIFICATE];
    all.extend_from_slice(specific);
    Rejection::client(&all)
}
