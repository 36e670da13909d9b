//! Serde adapters for binary fields on the wire
//!
//! Binary values travel as standard, padded base64 strings.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de, Deserialize, Deserializer, Serializer};

/// `Vec<u8>` as a standard base64 string
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        STANDARD
            .decode(value.as_bytes())
            .map_err(|e| de::Error::custom(format!("value is not a base64 string: {}", e)))
    }
}

/// `Option<Vec<u8>>` as an optional standard base64 string
pub mod base64_bytes_opt {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|value| {
                STANDARD
                    .decode(value.as_bytes())
                    .map_err(|e| de::Error::custom(format!("value is not a base64 string: {}", e)))
            })
            .transpose()
    }
}
