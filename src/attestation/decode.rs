//! DER decoding of the key attestation extension
//!
//! ```text
//! KeyDescription ::= SEQUENCE {
//!     attestationVersion         INTEGER,
//!     attestationSecurityLevel   SecurityLevel,
//!     keymasterVersion           INTEGER,
//!     keymasterSecurityLevel     SecurityLevel,
//!     attestationChallenge       OCTET STRING,
//!     uniqueId                   OCTET STRING,
//!     softwareEnforced           AuthorizationList,
//!     teeEnforced                AuthorizationList,
//! }
//! ```
//!
//! `AuthorizationList` is a SEQUENCE of `[n] EXPLICIT` elements whose tag numbers
//! go well past 30, so tags are read by hand rather than through `der::Tag`.
//! No policy is applied here.

use chrono::{DateTime, Utc};
use der::asn1::{AnyRef, Null, ObjectIdentifier, OctetStringRef};
use der::{Decode, Length, Reader, SliceReader, Tag, Tagged};

use super::types::{AuthorizationList, KeyDescription, RootOfTrust, VerifiedBootState};
use crate::chain::EncodedCertificate;

/// Key attestation extension OID
pub const KEY_ATTESTATION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.11129.2.1.17");

/// Authorization tags that are recognized, sorted for binary search
const KNOWN_TAGS: [u32; 36] = [
    1, 2, 3, 5, 6, 10, //
    200, //
    303, //
    400, 401, 402, //
    503, 504, 505, 506, 507, 508, 509, //
    600, 601, //
    701, 702, 704, 705, 706, //
    709, 710, 711, 712, 713, 714, 715, 716, 717, 718, 719,
];

/// Tag numbers longer than this many base-128 bytes are rejected
const MAX_TAG_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("certificate has no key attestation extension")]
    NotAnAttestationCertificate,

    #[error("malformed key attestation extension: {0}")]
    MalformedExtension(String),
}

fn malformed(context: &str, e: impl std::fmt::Display) -> DecodeError {
    DecodeError::MalformedExtension(format!("{}: {}", context, e))
}

/// Decode the attestation extension of `cert`
///
/// The extension must be present and non-critical.
pub fn decode_certificate(cert: &EncodedCertificate) -> Result<KeyDescription, DecodeError> {
    match cert.extension_value(&KEY_ATTESTATION_OID) {
        Some((false, value)) => decode_key_description(value),
        _ => Err(DecodeError::NotAnAttestationCertificate),
    }
}

/// Decode a DER `KeyDescription` sequence
pub fn decode_key_description(bytes: &[u8]) -> Result<KeyDescription, DecodeError> {
    let any = AnyRef::from_der(bytes).map_err(|e| malformed("KeyDescription", e))?;
    if any.tag() != Tag::Sequence {
        return Err(malformed("KeyDescription", format!("expected SEQUENCE, got {}", any.tag())));
    }

    let mut reader = SliceReader::new(any.value()).map_err(|e| malformed("KeyDescription", e))?;

    let attestation_version = read_integer(&mut reader, "attestationVersion")?;
    let attestation_security_level = read_enumerated(&mut reader, "attestationSecurityLevel")?;
    let keymaster_version = read_integer(&mut reader, "keymasterVersion")?;
    let keymaster_security_level = read_enumerated(&mut reader, "keymasterSecurityLevel")?;
    let attestation_challenge = read_octets(&mut reader, "attestationChallenge")?;
    let unique_id = read_octets(&mut reader, "uniqueId")?;
    let software_enforced = read_authorization_list(&mut reader, "softwareEnforced")?;
    let tee_enforced = read_authorization_list(&mut reader, "teeEnforced")?;

    // Later schema versions may append elements; they are not interpreted.

    Ok(KeyDescription {
        attestation_version,
        attestation_security_level,
        keymaster_version,
        keymaster_security_level,
        attestation_challenge,
        unique_id,
        software_enforced,
        tee_enforced,
    })
}

fn read_any<'a>(reader: &mut SliceReader<'a>, field: &str) -> Result<AnyRef<'a>, DecodeError> {
    if reader.is_finished() {
        return Err(malformed(field, "missing element"));
    }
    reader.decode::<AnyRef<'a>>().map_err(|e| malformed(field, e))
}

fn read_integer(reader: &mut SliceReader<'_>, field: &str) -> Result<i64, DecodeError> {
    integer(read_any(reader, field)?, field)
}

fn read_enumerated(reader: &mut SliceReader<'_>, field: &str) -> Result<i64, DecodeError> {
    enumerated(read_any(reader, field)?, field)
}

fn read_octets(reader: &mut SliceReader<'_>, field: &str) -> Result<Vec<u8>, DecodeError> {
    octets(read_any(reader, field)?, field)
}

fn read_authorization_list(
    reader: &mut SliceReader<'_>,
    field: &str,
) -> Result<AuthorizationList, DecodeError> {
    let any = read_any(reader, field)?;
    if any.tag() != Tag::Sequence {
        return Err(malformed(field, format!("expected SEQUENCE, got {}", any.tag())));
    }
    decode_authorization_list(any.value()).map_err(|e| match e {
        DecodeError::MalformedExtension(msg) => malformed(field, msg),
        other => other,
    })
}

fn integer(any: AnyRef<'_>, field: &str) -> Result<i64, DecodeError> {
    any.decode_as::<i64>().map_err(|e| malformed(field, e))
}

/// ENUMERATED shares INTEGER's content encoding
fn enumerated(any: AnyRef<'_>, field: &str) -> Result<i64, DecodeError> {
    if any.tag() != Tag::Enumerated {
        return Err(malformed(field, format!("expected ENUMERATED, got {}", any.tag())));
    }
    AnyRef::new(Tag::Integer, any.value())
        .and_then(|value| value.decode_as::<i64>())
        .map_err(|e| malformed(field, e))
}

fn octets(any: AnyRef<'_>, field: &str) -> Result<Vec<u8>, DecodeError> {
    any.decode_as::<OctetStringRef<'_>>()
        .map(|octets| octets.as_bytes().to_vec())
        .map_err(|e| malformed(field, e))
}

/// BOOLEAN, accepting any non-zero content as true
fn boolean(any: AnyRef<'_>, field: &str) -> Result<bool, DecodeError> {
    match (any.tag(), any.value()) {
        (Tag::Boolean, [value]) => Ok(*value != 0),
        (Tag::Boolean, _) => Err(malformed(field, "BOOLEAN must be one byte")),
        (tag, _) => Err(malformed(field, format!("expected BOOLEAN, got {}", tag))),
    }
}

/// One `[n] EXPLICIT` element of an authorization list
struct TaggedElement<'a> {
    number: u32,
    explicit: bool,
    content: &'a [u8],
}

fn read_tagged_element<'a>(reader: &mut SliceReader<'a>) -> der::Result<TaggedElement<'a>> {
    let first = reader.read_byte()?;

    let number = if first & 0x1f == 0x1f {
        // High tag number form: base-128, most significant group first
        let mut number: u32 = 0;
        let mut consumed = 0;
        loop {
            let byte = reader.read_byte()?;
            consumed += 1;
            // A leading 0x80 group pads the number and is not DER
            if consumed > MAX_TAG_BYTES || (consumed == 1 && byte == 0x80) {
                return Err(der::ErrorKind::TagNumberInvalid.into());
            }
            number = (number << 7) | u32::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                break;
            }
        }
        number
    } else {
        u32::from(first & 0x1f)
    };

    let length = Length::decode(reader)?;
    let content = reader.read_slice(length)?;

    Ok(TaggedElement {
        number,
        // context-specific class, constructed
        explicit: first & 0xe0 == 0xa0,
        content,
    })
}

/// Slot table filled by a single pass over the tagged elements
struct TagSlots<'a> {
    slots: [Option<AnyRef<'a>>; KNOWN_TAGS.len()],
}

impl<'a> TagSlots<'a> {
    fn collect(content: &'a [u8]) -> Result<Self, DecodeError> {
        let mut slots = [None; KNOWN_TAGS.len()];
        let mut reader = SliceReader::new(content).map_err(|e| malformed("AuthorizationList", e))?;

        while !reader.is_finished() {
            let element =
                read_tagged_element(&mut reader).map_err(|e| malformed("AuthorizationList", e))?;

            if !element.explicit {
                continue;
            }

            // Unknown tags are skipped without looking at their content
            if let Ok(index) = KNOWN_TAGS.binary_search(&element.number) {
                let inner = AnyRef::from_der(element.content)
                    .map_err(|e| malformed(&format!("tag {}", element.number), e))?;
                slots[index] = Some(inner);
            }
        }

        Ok(Self { slots })
    }

    fn get(&self, tag: u32) -> Option<AnyRef<'a>> {
        KNOWN_TAGS.binary_search(&tag).ok().and_then(|index| self.slots[index])
    }

    fn int(&self, tag: u32) -> Result<Option<i64>, DecodeError> {
        self.get(tag).map(|any| integer(any, &format!("tag {}", tag))).transpose()
    }

    fn int_set(&self, tag: u32) -> Result<Option<Vec<i64>>, DecodeError> {
        let Some(any) = self.get(tag) else {
            return Ok(None);
        };

        let field = format!("tag {}", tag);
        if any.tag() != Tag::Set {
            return Err(malformed(&field, format!("expected SET, got {}", any.tag())));
        }

        let mut reader = SliceReader::new(any.value()).map_err(|e| malformed(&field, e))?;
        let mut values = Vec::new();
        while !reader.is_finished() {
            values.push(reader.decode::<i64>().map_err(|e| malformed(&field, e))?);
        }
        Ok(Some(values))
    }

    fn instant(&self, tag: u32) -> Result<Option<DateTime<Utc>>, DecodeError> {
        self.int(tag)?
            .map(|millis| {
                DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| malformed(&format!("tag {}", tag), "timestamp out of range"))
            })
            .transpose()
    }

    fn bytes(&self, tag: u32) -> Result<Option<Vec<u8>>, DecodeError> {
        self.get(tag).map(|any| octets(any, &format!("tag {}", tag))).transpose()
    }

    /// A present NULL is an asserted flag
    fn flag(&self, tag: u32) -> Result<Option<bool>, DecodeError> {
        self.get(tag)
            .map(|any| {
                any.decode_as::<Null>()
                    .map(|_| true)
                    .map_err(|e| malformed(&format!("tag {}", tag), e))
            })
            .transpose()
    }

    fn root_of_trust(&self, tag: u32) -> Result<Option<RootOfTrust>, DecodeError> {
        self.get(tag).map(decode_root_of_trust).transpose()
    }
}

/// Decode the content octets of an `AuthorizationList` SEQUENCE
pub fn decode_authorization_list(content: &[u8]) -> Result<AuthorizationList, DecodeError> {
    let tags = TagSlots::collect(content)?;

    Ok(AuthorizationList {
        purpose: tags.int_set(1)?,
        algorithm: tags.int(2)?,
        key_size: tags.int(3)?,
        digest: tags.int_set(5)?,
        padding: tags.int_set(6)?,
        ec_curve: tags.int(10)?,
        rsa_public_exponent: tags.int(200)?,
        rollback_resistance: tags.flag(303)?,
        active_date_time: tags.instant(400)?,
        origination_expire_date_time: tags.instant(401)?,
        usage_expire_date_time: tags.instant(402)?,
        no_auth_required: tags.flag(503)?,
        user_auth_type: tags.int(504)?,
        auth_timeout: tags.int(505)?,
        allow_while_on_body: tags.flag(506)?,
        trusted_user_presence_required: tags.flag(507)?,
        trusted_confirmation_required: tags.flag(508)?,
        unlocked_device_required: tags.flag(509)?,
        all_applications: tags.flag(600)?,
        application_id: tags.bytes(601)?,
        creation_date_time: tags.instant(701)?,
        origin: tags.int(702)?,
        root_of_trust: tags.root_of_trust(704)?,
        os_version: tags.int(705)?,
        os_patch_level: tags.int(706)?,
        attestation_application_id: tags.bytes(709)?,
        attestation_id_brand: tags.bytes(710)?,
        attestation_id_device: tags.bytes(711)?,
        attestation_id_product: tags.bytes(712)?,
        attestation_id_serial: tags.bytes(713)?,
        attestation_id_imei: tags.bytes(714)?,
        attestation_id_meid: tags.bytes(715)?,
        attestation_id_manufacturer: tags.bytes(716)?,
        attestation_id_model: tags.bytes(717)?,
        vendor_patch_level: tags.int(718)?,
        boot_patch_level: tags.int(719)?,
    })
}

fn decode_root_of_trust(any: AnyRef<'_>) -> Result<RootOfTrust, DecodeError> {
    const FIELD: &str = "rootOfTrust";

    if any.tag() != Tag::Sequence {
        return Err(malformed(FIELD, format!("expected SEQUENCE, got {}", any.tag())));
    }

    let mut reader = SliceReader::new(any.value()).map_err(|e| malformed(FIELD, e))?;

    let verified_boot_key = read_octets(&mut reader, "verifiedBootKey")?;
    let device_locked = boolean(read_any(&mut reader, "deviceLocked")?, "deviceLocked")?;
    let state = read_enumerated(&mut reader, "verifiedBootState")?;
    let verified_boot_state = VerifiedBootState::from_value(state)
        .ok_or_else(|| malformed("verifiedBootState", format!("unknown value {}", state)))?;

    let verified_boot_hash = if reader.is_finished() {
        None
    } else {
        Some(read_octets(&mut reader, "verifiedBootHash")?)
    };

    Ok(RootOfTrust {
        verified_boot_key,
        device_locked,
        verified_boot_state,
        verified_boot_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::types::{EC_CURVE_P_256, ORIGIN_GENERATED, PURPOSE_SIGN};

    /// Extension captured from a Pixel keystore key (attestation v3, keymaster 4, TEE)
    const CAPTURED_EXTENSION: &str = "3082011a0201030a01010201040a010104202ff271aabe9d6b8fa276d275fa9eeaf542afb4292992ade3bc4c15e6a4e018d604003051bf853d080206016ba4464d21bf854541043f303d3117301504106d652e73746f6a616e2e706173626f7802010131220420e1a84ced9885a0bb4c84d26d247737169bcf65802dffe05680f45de8e6d36b32308194a1053103020102a203020103a30402020100aa03020101bf8377020500bf853e03020100bf85404c304a04209d77474fa4fea6f0b28636222fbcee2bb1e6ff9856c736c85b8ea6e3467f2bba0101ff0a010004200000000000000000000000000000000000000000000000000000000000000000bf8541050203015f90bf85420502030314adbf854e03020100bf854f03020100";

    /// Wrap `content` in a TLV with a single-byte tag
    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(der_length(content.len()));
        out.extend_from_slice(content);
        out
    }

    fn der_length(len: usize) -> Vec<u8> {
        if len < 0x80 {
            vec![len as u8]
        } else if len <= 0xff {
            vec![0x81, len as u8]
        } else {
            vec![0x82, (len >> 8) as u8, len as u8]
        }
    }

    /// `[tag] EXPLICIT inner`, using high tag form where needed
    fn explicit(tag: u32, inner: &[u8]) -> Vec<u8> {
        let mut out = if tag < 31 {
            vec![0xa0 | tag as u8]
        } else {
            let mut groups = vec![(tag & 0x7f) as u8];
            let mut rest = tag >> 7;
            while rest > 0 {
                groups.push(0x80 | (rest & 0x7f) as u8);
                rest >>= 7;
            }
            groups.reverse();
            let mut out = vec![0xbf];
            out.extend(groups);
            out
        };
        out.extend(der_length(inner.len()));
        out.extend_from_slice(inner);
        out
    }

    fn int(value: u8) -> Vec<u8> {
        tlv(0x02, &[value])
    }

    fn key_description(software: &[u8], tee: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(int(3));
        body.extend(tlv(0x0a, &[1]));
        body.extend(int(4));
        body.extend(tlv(0x0a, &[1]));
        body.extend(tlv(0x04, &[0xaa; 32]));
        body.extend(tlv(0x04, &[]));
        body.extend(tlv(0x30, software));
        body.extend(tlv(0x30, tee));
        tlv(0x30, &body)
    }

    #[test]
    fn test_decode_captured_extension() {
        let bytes = hex::decode(CAPTURED_EXTENSION).unwrap();
        let desc = decode_key_description(&bytes).unwrap();

        assert_eq!(desc.attestation_version, 3);
        assert_eq!(desc.attestation_security_level, 1);
        assert_eq!(desc.keymaster_version, 4);
        assert_eq!(desc.keymaster_security_level, 1);
        assert_eq!(
            hex::encode(&desc.attestation_challenge),
            "2ff271aabe9d6b8fa276d275fa9eeaf542afb4292992ade3bc4c15e6a4e018d6"
        );
        assert!(desc.unique_id.is_empty());

        let sw = &desc.software_enforced;
        assert_eq!(sw.creation_date_time.map(|t| t.timestamp_millis()), Some(1_561_829_199_137));
        assert_eq!(sw.attestation_application_id.as_ref().map(Vec::len), Some(63));
        assert_eq!(sw.purpose, None);

        let tee = &desc.tee_enforced;
        assert_eq!(tee.purpose, Some(vec![PURPOSE_SIGN]));
        assert_eq!(tee.algorithm, Some(3));
        assert_eq!(tee.key_size, Some(256));
        assert_eq!(tee.ec_curve, Some(EC_CURVE_P_256));
        assert_eq!(tee.no_auth_required, Some(true));
        assert_eq!(tee.origin, Some(ORIGIN_GENERATED));
        assert_eq!(tee.os_version, Some(90000));
        assert_eq!(tee.os_patch_level, Some(201901));
        assert_eq!(tee.vendor_patch_level, Some(0));
        assert_eq!(tee.boot_patch_level, Some(0));
        assert_eq!(tee.all_applications, None);

        let rot = tee.root_of_trust.as_ref().unwrap();
        assert!(rot.device_locked);
        assert_eq!(rot.verified_boot_state, VerifiedBootState::Verified);
        assert_eq!(rot.verified_boot_key.len(), 32);
        assert_eq!(rot.verified_boot_hash, Some(vec![0u8; 32]));
    }

    #[test]
    fn test_unknown_tag_is_ignored() {
        let mut tee = explicit(999, &int(7));
        tee.extend(explicit(1, &tlv(0x31, &int(2))));
        let bytes = key_description(&[], &tee);

        let desc = decode_key_description(&bytes).unwrap();
        assert_eq!(desc.software_enforced, AuthorizationList::default());
        assert_eq!(
            desc.tee_enforced,
            AuthorizationList { purpose: Some(vec![2]), ..Default::default() }
        );
    }

    #[test]
    fn test_positional_type_mismatch() {
        // keymasterVersion encoded as an OCTET STRING
        let mut body = Vec::new();
        body.extend(int(3));
        body.extend(tlv(0x0a, &[1]));
        body.extend(tlv(0x04, &[4]));
        body.extend(tlv(0x0a, &[1]));
        body.extend(tlv(0x04, &[]));
        body.extend(tlv(0x04, &[]));
        body.extend(tlv(0x30, &[]));
        body.extend(tlv(0x30, &[]));

        let err = decode_key_description(&tlv(0x30, &body)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedExtension(msg) if msg.contains("keymasterVersion")));
    }

    #[test]
    fn test_security_level_must_be_enumerated() {
        let mut body = Vec::new();
        body.extend(int(3));
        body.extend(int(1));
        let err = decode_key_description(&tlv(0x30, &body)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedExtension(_)));
    }

    #[test]
    fn test_truncated_sequence() {
        let mut body = Vec::new();
        body.extend(int(3));
        body.extend(tlv(0x0a, &[1]));
        let err = decode_key_description(&tlv(0x30, &body)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedExtension(msg) if msg.contains("missing")));
    }

    #[test]
    fn test_known_tag_with_wrong_type() {
        // ecCurve as OCTET STRING
        let tee = explicit(10, &tlv(0x04, &[1]));
        let err = decode_key_description(&key_description(&[], &tee)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedExtension(msg) if msg.contains("teeEnforced")));
    }

    #[test]
    fn test_null_flags_and_sets_keep_order() {
        let mut tee = explicit(5, &tlv(0x31, &[int(4), int(1)].concat()));
        tee.extend(explicit(509, &tlv(0x05, &[])));
        let desc = decode_key_description(&key_description(&[], &tee)).unwrap();

        assert_eq!(desc.tee_enforced.digest, Some(vec![4, 1]));
        assert_eq!(desc.tee_enforced.unlocked_device_required, Some(true));
        assert_eq!(desc.tee_enforced.trusted_user_presence_required, None);
    }

    #[test]
    fn test_root_of_trust_without_hash() {
        let rot = tlv(
            0x30,
            &[tlv(0x04, &[1, 2]), tlv(0x01, &[0x00]), tlv(0x0a, &[2])].concat(),
        );
        let tee = explicit(704, &rot);
        let desc = decode_key_description(&key_description(&[], &tee)).unwrap();

        let rot = desc.tee_enforced.root_of_trust.unwrap();
        assert!(!rot.device_locked);
        assert_eq!(rot.verified_boot_state, VerifiedBootState::Unverified);
        assert_eq!(rot.verified_boot_hash, None);
    }

    #[test]
    fn test_unknown_boot_state() {
        let rot = tlv(
            0x30,
            &[tlv(0x04, &[]), tlv(0x01, &[0xff]), tlv(0x0a, &[9])].concat(),
        );
        let tee = explicit(704, &rot);
        assert!(decode_key_description(&key_description(&[], &tee)).is_err());
    }

    #[test]
    fn test_padded_high_tag_number() {
        // [704] with its first group padded: bf 80 85 40
        let rot = tlv(0x30, &[tlv(0x04, &[]), tlv(0x01, &[0xff]), tlv(0x0a, &[0])].concat());
        let mut tee = vec![0xbf, 0x80, 0x85, 0x40];
        tee.extend(der_length(rot.len()));
        tee.extend(rot);

        let err = decode_key_description(&key_description(&[], &tee)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedExtension(msg) if msg.contains("AuthorizationList")));
    }

    #[test]
    fn test_not_a_sequence() {
        assert!(matches!(
            decode_key_description(&int(1)),
            Err(DecodeError::MalformedExtension(_))
        ));
        assert!(decode_key_description(&[]).is_err());
    }
}
