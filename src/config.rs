//! Enrollment configuration
//!
//! Every field has a default, so an empty TOML document yields the production
//! policy. Trust anchors default to the bundled roots and may be replaced with
//! PEM bundles on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chain::TrustAnchors;
use crate::error::Result;

const KEYSTORE_ROOTS: &str = include_str!("../anchors/android-keystore-root.pem");
const INTEGRITY_ROOTS: &str = include_str!("../anchors/safetynet-root.pem");

/// One day
const MAX_FRESHNESS_WINDOW_SECS: u64 = 86_400;

/// Inclusive bounds on the device signature length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureLength {
    pub min: usize,
    pub max: usize,
}

impl SignatureLength {
    pub fn exactly(len: usize) -> Self {
        Self { min: len, max: len }
    }

    pub fn contains(&self, len: usize) -> bool {
        (self.min..=self.max).contains(&len)
    }
}

impl Default for SignatureLength {
    fn default() -> Self {
        Self::exactly(32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnrollmentConfig {
    /// Application package the integrity verdict must name
    pub package_name: String,

    /// DNS name the integrity signing certificate must carry
    pub attestation_hostname: String,

    /// Maximum age of an integrity verdict, in seconds
    pub freshness_window_secs: u64,

    pub pow_difficulty_bytes: usize,
    pub pow_trailing_mask: u8,

    pub min_token_length: usize,
    pub min_certificates: usize,
    pub signature_length: SignatureLength,
    pub agreement_length: usize,

    pub supported_keymaster_versions: Vec<i64>,

    /// PEM bundle replacing the bundled hardware keystore root
    pub keystore_roots_pem: Option<PathBuf>,

    /// PEM bundle replacing the bundled integrity service root
    pub integrity_roots_pem: Option<PathBuf>,

    /// Push topic every enrolled device is subscribed to
    pub push_topic: String,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            package_name: "me.stojan.pasbox".to_string(),
            attestation_hostname: crate::integrity::ATTESTATION_HOSTNAME.to_string(),
            freshness_window_secs: 120,
            pow_difficulty_bytes: crate::pow::DIFFICULTY_BYTES,
            pow_trailing_mask: crate::pow::TRAILING_MASK,
            min_token_length: 16,
            min_certificates: 2,
            signature_length: SignatureLength::default(),
            agreement_length: crate::identity::AGREEMENT_LEN,
            supported_keymaster_versions: vec![2, 3, 4],
            keystore_roots_pem: None,
            integrity_roots_pem: None,
            push_topic: "android-devices".to_string(),
        }
    }
}

impl EnrollmentConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.package_name.is_empty() {
            return Err(ConfigError::Validation("package_name must not be empty".into()));
        }
        if self.attestation_hostname.is_empty() {
            return Err(ConfigError::Validation(
                "attestation_hostname must not be empty".into(),
            ));
        }
        if self.freshness_window_secs > MAX_FRESHNESS_WINDOW_SECS {
            return Err(ConfigError::Validation(format!(
                "freshness_window_secs must be at most {}, got {}",
                MAX_FRESHNESS_WINDOW_SECS, self.freshness_window_secs
            )));
        }
        if self.pow_difficulty_bytes >= 32 {
            return Err(ConfigError::Validation(format!(
                "pow_difficulty_bytes must be below 32, got {}",
                self.pow_difficulty_bytes
            )));
        }
        if self.min_certificates < 2 {
            return Err(ConfigError::Validation(format!(
                "min_certificates must be at least 2, got {}",
                self.min_certificates
            )));
        }
        if self.signature_length.min > self.signature_length.max {
            return Err(ConfigError::Validation(format!(
                "signature_length.min ({}) exceeds max ({})",
                self.signature_length.min, self.signature_length.max
            )));
        }
        if self.agreement_length != crate::identity::AGREEMENT_LEN {
            return Err(ConfigError::Validation(format!(
                "agreement_length must be {}, got {}",
                crate::identity::AGREEMENT_LEN,
                self.agreement_length
            )));
        }
        if self.supported_keymaster_versions.is_empty() {
            return Err(ConfigError::Validation(
                "supported_keymaster_versions must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.freshness_window_secs.min(MAX_FRESHNESS_WINDOW_SECS) as i64)
    }

    /// Anchors for device keystore chains
    pub fn keystore_anchors(&self) -> Result<TrustAnchors> {
        load_anchors(self.keystore_roots_pem.as_deref(), KEYSTORE_ROOTS)
    }

    /// Anchors for integrity token chains
    pub fn integrity_anchors(&self) -> Result<TrustAnchors> {
        load_anchors(self.integrity_roots_pem.as_deref(), INTEGRITY_ROOTS)
    }
}

fn load_anchors(path: Option<&Path>, bundled: &str) -> Result<TrustAnchors> {
    match path {
        Some(path) => {
            let bundle = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
            TrustAnchors::from_pem(&bundle)
        }
        None => TrustAnchors::from_pem(bundled),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
