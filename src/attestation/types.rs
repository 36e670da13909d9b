//! Core types for Android key attestation
//!
//! These mirror the `KeyDescription` ASN.1 schema. Every authorization field is
//! optional: absence means "not asserted", never `false`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const KEYMASTER_V2: i64 = 2;
pub const KEYMASTER_V3: i64 = 3;
pub const KEYMASTER_V4: i64 = 4;

pub const SECURITY_LEVEL_SOFTWARE: i64 = 0;
pub const SECURITY_LEVEL_TRUSTED_ENVIRONMENT: i64 = 1;
pub const SECURITY_LEVEL_STRONGBOX: i64 = 2;

pub const PURPOSE_SIGN: i64 = 2;
pub const PURPOSE_VERIFY: i64 = 3;

pub const EC_CURVE_P_256: i64 = 1;

pub const ORIGIN_GENERATED: i64 = 0;

pub const DIGEST_SHA2_256: i64 = 4;

/// Decoded attestation extension of a keystore certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDescription {
    pub attestation_version: i64,
    pub attestation_security_level: i64,
    pub keymaster_version: i64,
    pub keymaster_security_level: i64,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub attestation_challenge: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub unique_id: Vec<u8>,
    pub software_enforced: AuthorizationList,
    pub tee_enforced: AuthorizationList,
}

/// Sparse set of key properties asserted by one enforcement layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec_curve: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsa_public_exponent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_resistance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "chrono::serde::ts_milliseconds_option")]
    pub active_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "chrono::serde::ts_milliseconds_option")]
    pub origination_expire_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "chrono::serde::ts_milliseconds_option")]
    pub usage_expire_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_auth_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_auth_type: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_while_on_body: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_user_presence_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_confirmation_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_device_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_applications: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub application_id: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "chrono::serde::ts_milliseconds_option")]
    pub creation_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_of_trust: Option<RootOfTrust>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_patch_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_application_id: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_brand: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_device: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_product: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_serial: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_imei: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_meid: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_manufacturer: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub attestation_id_model: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_patch_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_patch_level: Option<i64>,
}

/// Verified boot state reported by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerifiedBootState {
    Verified,
    SelfSigned,
    Unverified,
    Failed,
}

impl VerifiedBootState {
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Verified),
            1 => Some(Self::SelfSigned),
            2 => Some(Self::Unverified),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootOfTrust {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub verified_boot_key: Vec<u8>,
    pub device_locked: bool,
    pub verified_boot_state: VerifiedBootState,
    /// Absent in attestation versions older than 3
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::encoding::base64_bytes_opt")]
    pub verified_boot_hash: Option<Vec<u8>>,
}
