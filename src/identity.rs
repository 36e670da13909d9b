//! Device identity derivation
//!
//! For every enrollment the service generates a fresh HMAC-SHA512 key and a fresh
//! X25519 key pair. The identity handle is
//! `HMAC(key, X25519(service_secret, device_agreement))`, so it cannot be linked
//! to the device's agreement value without the service-held key.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use x25519_dalek::{EphemeralSecret, PublicKey};

type HmacSha512 = Hmac<Sha512>;

/// Length of the per-enrollment keyed-hash secret
pub const IDENTITY_KEY_LEN: usize = 64;

/// Length of an X25519 public value
pub const AGREEMENT_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("agreement value must be {AGREEMENT_LEN} bytes, got {0}")]
    AgreementLength(usize),

    #[error("agreement value is a low-order point")]
    LowOrderPoint,

    #[error("identity key rejected by HMAC")]
    Key,
}

/// Durable identity issued to an enrolled device
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Service half of the agreement, sent to the device
    pub agreement_public_value: [u8; AGREEMENT_LEN],
    /// Keyed hash of the shared secret; the device's durable identifier
    pub identity_handle: Vec<u8>,
    /// Secret keyed-hash key, returned to the device once
    pub identity_key: Vec<u8>,
}

impl DeviceIdentity {
    /// Short, non-secret prefix for log correlation
    pub fn handle_prefix(&self) -> String {
        hex::encode(&self.identity_handle[..self.identity_handle.len().min(4)])
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("agreement_public_value", &hex::encode(self.agreement_public_value))
            .field("identity_handle", &self.handle_prefix())
            .finish_non_exhaustive()
    }
}

/// Derive a fresh identity from the device's agreement value
pub fn derive(device_agreement: &[u8]) -> Result<DeviceIdentity, IdentityError> {
    let device_public: [u8; AGREEMENT_LEN] = device_agreement
        .try_into()
        .map_err(|_| IdentityError::AgreementLength(device_agreement.len()))?;

    let mut identity_key = vec![0u8; IDENTITY_KEY_LEN];
    OsRng.fill_bytes(&mut identity_key);

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let agreement_public_value = PublicKey::from(&secret).to_bytes();

    let shared = secret.diffie_hellman(&PublicKey::from(device_public));
    if !shared.was_contributory() {
        return Err(IdentityError::LowOrderPoint);
    }

    let mut mac = <HmacSha512 as Mac>::new_from_slice(&identity_key)
        .map_err(|_| IdentityError::Key)?;
    mac.update(shared.as_bytes());
    let identity_handle = mac.finalize().into_bytes().to_vec();

    Ok(DeviceIdentity {
        agreement_public_value,
        identity_handle,
        identity_key,
    })
}
