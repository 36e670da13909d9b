//! Certificate chain validation against pinned trust anchors
//!
//! A chain is supplied leaf first: `[leaf, intermediate, ..., last]`. Validation
//! at a reference instant proceeds as follows:
//! 1. Every supplied certificate is inside its validity window
//! 2. Each certificate names the next one as issuer and carries its signature
//! 3. Every issuer is a CA (basic constraints, key usage, path length)
//! 4. No certificate carries a critical extension we do not understand
//! 5. The last certificate is a pinned anchor itself, or is issued by one
//!
//! Revocation is not checked.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use der::asn1::ObjectIdentifier;
use der::{Any, Decode, Encode, Tag, Tagged};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha384, Sha512};
use x509_cert::der::oid::db::{rfc5280, rfc5912};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, SubjectAltName};
use x509_cert::name::{Name, RelativeDistinguishedName};
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;

use crate::error::{Error, Result};

/// Critical extensions the validator knows how to process
const UNDERSTOOD_CRITICAL_EXTENSIONS: [ObjectIdentifier; 4] = [
    rfc5280::ID_CE_BASIC_CONSTRAINTS,
    rfc5280::ID_CE_KEY_USAGE,
    rfc5280::ID_CE_EXT_KEY_USAGE,
    rfc5280::ID_CE_SUBJECT_ALT_NAME,
];

/// A parsed X.509 certificate that keeps the exact bytes it was decoded from
///
/// The original encoding is what devices hash and sign, so it is never
/// re-serialized.
#[derive(Clone)]
pub struct EncodedCertificate {
    der: Vec<u8>,
    certificate: Certificate,
}

impl EncodedCertificate {
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        let certificate = Certificate::from_der(&der)
            .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {}", e)))?;

        Ok(Self { der, certificate })
    }

    /// Parse a standard base64 DER certificate
    pub fn from_base64(value: &str) -> Result<Self> {
        Self::from_der(STANDARD.decode(value.as_bytes())?)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Algorithm the issuer used to sign this certificate
    pub fn signature_algorithm(&self) -> ObjectIdentifier {
        self.certificate.signature_algorithm.oid
    }

    pub fn public_key(&self) -> &SubjectPublicKeyInfoOwned {
        &self.certificate.tbs_certificate.subject_public_key_info
    }

    /// Verify `signature` over `message` with this certificate's public key
    ///
    /// The algorithm is the certificate's own declared signature algorithm,
    /// so a P-256 key certified with ecdsa-with-SHA256 verifies ECDSA/SHA-256.
    pub fn verify_message(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_signature(&self.signature_algorithm(), self.public_key(), message, signature)
    }

    /// DNS names from the subject alternative name extension
    ///
    /// Returns `None` when the extension is absent. Other general name kinds
    /// are reported as `None` entries so callers can count every entry.
    pub fn subject_alt_dns_names(&self) -> Result<Option<Vec<Option<String>>>> {
        let san = self
            .certificate
            .tbs_certificate
            .get::<SubjectAltName>()
            .map_err(|e| Error::Certificate(format!("Invalid subject alternative name: {}", e)))?;

        Ok(san.map(|(_, SubjectAltName(names))| {
            names
                .iter()
                .map(|name| match name {
                    GeneralName::DnsName(dns) => Some(dns.as_str().to_string()),
                    _ => None,
                })
                .collect()
        }))
    }

    /// Whether the certificate carries `oid` as a non-critical extension
    pub fn has_non_critical_extension(&self, oid: &ObjectIdentifier) -> bool {
        self.extension_value(oid).map(|(critical, _)| !critical).unwrap_or(false)
    }

    /// Raw value of the extension `oid`, with its criticality
    pub fn extension_value(&self, oid: &ObjectIdentifier) -> Option<(bool, &[u8])> {
        self.certificate
            .tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| &ext.extn_id == oid)
            .map(|ext| (ext.critical, ext.extn_value.as_bytes()))
    }

    fn tbs_der(&self) -> Result<Vec<u8>> {
        self.certificate
            .tbs_certificate
            .to_der()
            .map_err(|e| Error::Certificate(format!("Failed to encode TBS: {}", e)))
    }

    fn signature_bytes(&self) -> &[u8] {
        self.certificate.signature.raw_bytes()
    }

    /// Verify that `issuer` signed this certificate
    fn verify_issued_by(&self, issuer: &EncodedCertificate) -> Result<()> {
        verify_signature(
            &self.signature_algorithm(),
            issuer.public_key(),
            &self.tbs_der()?,
            self.signature_bytes(),
        )
    }

    fn names_issuer(&self, issuer: &EncodedCertificate) -> bool {
        names_match(
            &self.certificate.tbs_certificate.issuer,
            &issuer.certificate.tbs_certificate.subject,
        )
    }

    fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }
}

impl PartialEq for EncodedCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for EncodedCertificate {}

impl fmt::Debug for EncodedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedCertificate")
            .field("subject", &self.subject())
            .field("len", &self.der.len())
            .finish()
    }
}

impl Serialize for EncodedCertificate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.der))
    }
}

impl<'de> Deserialize<'de> for EncodedCertificate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        EncodedCertificate::from_base64(&value).map_err(de::Error::custom)
    }
}

/// Pinned root certificates, loaded once and read-only afterwards
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    anchors: Vec<EncodedCertificate>,
}

impl TrustAnchors {
    pub fn new(anchors: Vec<EncodedCertificate>) -> Result<Self> {
        if anchors.is_empty() {
            return Err(Error::TrustAnchor("At least one trust anchor is required".into()));
        }
        Ok(Self { anchors })
    }

    /// Load every `CERTIFICATE` block of a PEM bundle
    pub fn from_pem(bundle: &str) -> Result<Self> {
        let pems = pem::parse_many(bundle)
            .map_err(|e| Error::TrustAnchor(format!("Failed to parse PEM bundle: {}", e)))?;

        let anchors = pems
            .into_iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(|p| EncodedCertificate::from_der(p.into_contents()))
            .collect::<Result<Vec<_>>>()?;

        Self::new(anchors)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    fn contains(&self, cert: &EncodedCertificate) -> bool {
        self.anchors.iter().any(|anchor| anchor == cert)
    }

    /// Find an anchor that issued `cert`
    fn issuer_of(&self, cert: &EncodedCertificate) -> Option<&EncodedCertificate> {
        self.anchors
            .iter()
            .find(|anchor| cert.names_issuer(anchor) && cert.verify_issued_by(anchor).is_ok())
    }
}

/// A chain did not validate against the pinned anchors
///
/// The message is diagnostic only; callers map every instance to one coarse reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("certificate chain not trusted: {reason}")]
pub struct ChainNotTrusted {
    reason: String,
}

impl ChainNotTrusted {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Validates chains against one pinned anchor set
#[derive(Debug, Clone)]
pub struct ChainValidator {
    anchors: TrustAnchors,
}

impl ChainValidator {
    pub fn new(anchors: TrustAnchors) -> Self {
        Self { anchors }
    }

    pub fn anchors(&self) -> &TrustAnchors {
        &self.anchors
    }

    /// Validate `chain` (leaf first) as of `at`
    pub fn validate(
        &self,
        chain: &[EncodedCertificate],
        at: DateTime<Utc>,
    ) -> std::result::Result<(), ChainNotTrusted> {
        let last = chain.last().ok_or_else(|| ChainNotTrusted::new("empty chain"))?;

        // 1. Validity windows
        for (index, cert) in chain.iter().enumerate() {
            check_validity(cert, at)
                .map_err(|reason| ChainNotTrusted::new(format!("certificate {}: {}", index, reason)))?;
        }

        // 2-4. Linkage, issuer constraints and critical extensions
        for (index, cert) in chain.iter().enumerate() {
            check_critical_extensions(cert)
                .map_err(|reason| ChainNotTrusted::new(format!("certificate {}: {}", index, reason)))?;

            if let Some(issuer) = chain.get(index + 1) {
                if !cert.names_issuer(issuer) {
                    return Err(ChainNotTrusted::new(format!(
                        "certificate {} issuer does not match subject of certificate {}",
                        index,
                        index + 1
                    )));
                }

                // Certificates below this issuer, leaf excluded
                check_issuer_constraints(issuer, index)
                    .map_err(|reason| ChainNotTrusted::new(format!("certificate {}: {}", index + 1, reason)))?;

                cert.verify_issued_by(issuer).map_err(|e| {
                    ChainNotTrusted::new(format!("certificate {} signature: {}", index, e))
                })?;
            }
        }

        // 5. Anchor termination
        if self.anchors.contains(last) {
            return Ok(());
        }

        match self.anchors.issuer_of(last) {
            Some(anchor) => {
                check_issuer_constraints(anchor, chain.len() - 1)
                    .map_err(|reason| ChainNotTrusted::new(format!("anchor: {}", reason)))?;
                Ok(())
            }
            None => Err(ChainNotTrusted::new(format!(
                "no trust anchor issued {}",
                last.subject()
            ))),
        }
    }
}

/// Distinguished name comparison after RFC 5280 §7.1 string preparation
///
/// Directory strings match regardless of their ASN.1 string type, letter case,
/// or runs of whitespace. Other attribute values must be byte-identical.
fn names_match(a: &Name, b: &Name) -> bool {
    a == b || (a.0.len() == b.0.len() && a.0.iter().zip(b.0.iter()).all(|(x, y)| rdns_match(x, y)))
}

fn rdns_match(a: &RelativeDistinguishedName, b: &RelativeDistinguishedName) -> bool {
    a.0.len() == b.0.len()
        && a.0
            .iter()
            .all(|atv| b.0.iter().any(|other| attributes_match(atv, other)))
}

fn attributes_match(a: &AttributeTypeAndValue, b: &AttributeTypeAndValue) -> bool {
    if a.oid != b.oid {
        return false;
    }
    match (prepared_string(&a.value), prepared_string(&b.value)) {
        (Some(x), Some(y)) => x == y,
        _ => a.value == b.value,
    }
}

fn prepared_string(value: &Any) -> Option<String> {
    let text = match value.tag() {
        Tag::Utf8String
        | Tag::PrintableString
        | Tag::Ia5String
        | Tag::VisibleString
        | Tag::TeletexString => std::str::from_utf8(value.value()).ok()?.to_string(),
        Tag::BmpString => {
            let units: Vec<u16> = value
                .value()
                .chunks(2)
                .map(|pair| match pair {
                    [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
                    _ => None,
                })
                .collect::<Option<_>>()?;
            String::from_utf16(&units).ok()?
        }
        _ => return None,
    };

    Some(text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
}

fn check_validity(cert: &EncodedCertificate, at: DateTime<Utc>) -> std::result::Result<(), String> {
    let validity = &cert.certificate.tbs_certificate.validity;
    let at_ms = at.timestamp_millis();
    let not_before = validity.not_before.to_unix_duration().as_millis() as i64;
    let not_after = validity.not_after.to_unix_duration().as_millis() as i64;

    if at_ms < not_before {
        return Err(format!("not valid before {:?}", validity.not_before));
    }
    if at_ms > not_after {
        return Err(format!("expired at {:?}", validity.not_after));
    }
    Ok(())
}

fn check_critical_extensions(cert: &EncodedCertificate) -> std::result::Result<(), String> {
    let Some(extensions) = cert.certificate.tbs_certificate.extensions.as_ref() else {
        return Ok(());
    };

    for ext in extensions.iter().filter(|ext| ext.critical) {
        if !UNDERSTOOD_CRITICAL_EXTENSIONS.contains(&ext.extn_id) {
            return Err(format!("unrecognized critical extension {}", ext.extn_id));
        }
    }
    Ok(())
}

/// `intermediates_below` counts the CA certificates between `issuer` and the leaf
fn check_issuer_constraints(
    issuer: &EncodedCertificate,
    intermediates_below: usize,
) -> std::result::Result<(), String> {
    let tbs = &issuer.certificate.tbs_certificate;

    let constraints = tbs
        .get::<BasicConstraints>()
        .map_err(|e| format!("invalid basic constraints: {}", e))?;

    match constraints {
        Some((_, bc)) if bc.ca => {
            if let Some(limit) = bc.path_len_constraint {
                if intermediates_below > usize::from(limit) {
                    return Err(format!("path length {} exceeds constraint {}", intermediates_below, limit));
                }
            }
        }
        _ => return Err("issuer is not a CA".into()),
    }

    if let Some((_, usage)) = tbs
        .get::<KeyUsage>()
        .map_err(|e| format!("invalid key usage: {}", e))?
    {
        if !usage.key_cert_sign() {
            return Err("issuer key usage lacks keyCertSign".into());
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    fn digest(self, message: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(message).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(message).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(message).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SignatureScheme {
    RsaPkcs1(HashAlgorithm),
    Ecdsa(HashAlgorithm),
}

fn signature_scheme(algorithm: &ObjectIdentifier) -> Result<SignatureScheme> {
    let scheme = if *algorithm == rfc5912::SHA_256_WITH_RSA_ENCRYPTION {
        SignatureScheme::RsaPkcs1(HashAlgorithm::Sha256)
    } else if *algorithm == rfc5912::SHA_384_WITH_RSA_ENCRYPTION {
        SignatureScheme::RsaPkcs1(HashAlgorithm::Sha384)
    } else if *algorithm == rfc5912::SHA_512_WITH_RSA_ENCRYPTION {
        SignatureScheme::RsaPkcs1(HashAlgorithm::Sha512)
    } else if *algorithm == rfc5912::ECDSA_WITH_SHA_256 {
        SignatureScheme::Ecdsa(HashAlgorithm::Sha256)
    } else if *algorithm == rfc5912::ECDSA_WITH_SHA_384 {
        SignatureScheme::Ecdsa(HashAlgorithm::Sha384)
    } else if *algorithm == rfc5912::ECDSA_WITH_SHA_512 {
        SignatureScheme::Ecdsa(HashAlgorithm::Sha512)
    } else {
        return Err(Error::UnsupportedAlgorithm(algorithm.to_string()));
    };

    Ok(scheme)
}

/// Verify `signature` over `message` with `key` under the declared `algorithm`
pub(crate) fn verify_signature(
    algorithm: &ObjectIdentifier,
    key: &SubjectPublicKeyInfoOwned,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    match signature_scheme(algorithm)? {
        SignatureScheme::RsaPkcs1(hash) => verify_rsa_pkcs1(hash, key, message, signature),
        SignatureScheme::Ecdsa(hash) => verify_ecdsa(key, &hash.digest(message), signature),
    }
}

/// Verify an RSA PKCS#1 v1.5 signature
fn verify_rsa_pkcs1(
    hash: HashAlgorithm,
    key: &SubjectPublicKeyInfoOwned,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::pkcs8::DecodePublicKey;
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    if key.algorithm.oid != rfc5912::RSA_ENCRYPTION {
        return Err(Error::SignatureVerification(format!(
            "RSA signature with non-RSA key {}",
            key.algorithm.oid
        )));
    }

    let spki_der = key
        .to_der()
        .map_err(|e| Error::SignatureVerification(format!("Failed to encode SPKI: {}", e)))?;

    let rsa_pubkey = RsaPublicKey::from_public_key_der(&spki_der)
        .map_err(|e| Error::SignatureVerification(format!("Invalid RSA public key: {}", e)))?;

    let sig = Signature::try_from(signature)
        .map_err(|e| Error::SignatureVerification(format!("Invalid signature format: {}", e)))?;

    let verified = match hash {
        HashAlgorithm::Sha256 => VerifyingKey::<Sha256>::new(rsa_pubkey).verify(message, &sig),
        HashAlgorithm::Sha384 => VerifyingKey::<Sha384>::new(rsa_pubkey).verify(message, &sig),
        HashAlgorithm::Sha512 => VerifyingKey::<Sha512>::new(rsa_pubkey).verify(message, &sig),
    };

    verified.map_err(|e| Error::SignatureVerification(format!("RSA verification failed: {}", e)))
}

/// Verify a DER-encoded ECDSA signature over a precomputed digest
fn verify_ecdsa(key: &SubjectPublicKeyInfoOwned, prehash: &[u8], signature: &[u8]) -> Result<()> {
    use p256::ecdsa::signature::hazmat::PrehashVerifier;

    if key.algorithm.oid != rfc5912::ID_EC_PUBLIC_KEY {
        return Err(Error::SignatureVerification(format!(
            "ECDSA signature with non-EC key {}",
            key.algorithm.oid
        )));
    }

    let curve = key
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::SignatureVerification("EC key without named curve".into()))?
        .decode_as::<ObjectIdentifier>()
        .map_err(|e| Error::SignatureVerification(format!("Invalid EC parameters: {}", e)))?;

    let point = key.subject_public_key.raw_bytes();

    if curve == rfc5912::SECP_256_R_1 {
        let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .map_err(|e| Error::SignatureVerification(format!("Invalid P-256 key: {}", e)))?;
        let sig = p256::ecdsa::Signature::from_der(signature)
            .map_err(|e| Error::SignatureVerification(format!("Invalid signature format: {}", e)))?;
        verifying_key
            .verify_prehash(prehash, &sig)
            .map_err(|e| Error::SignatureVerification(format!("ECDSA verification failed: {}", e)))
    } else if curve == rfc5912::SECP_384_R_1 {
        let verifying_key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
            .map_err(|e| Error::SignatureVerification(format!("Invalid P-384 key: {}", e)))?;
        let sig = p384::ecdsa::Signature::from_der(signature)
            .map_err(|e| Error::SignatureVerification(format!("Invalid signature format: {}", e)))?;
        verifying_key
            .verify_prehash(prehash, &sig)
            .map_err(|e| Error::SignatureVerification(format!("ECDSA verification failed: {}", e)))
    } else {
        Err(Error::UnsupportedAlgorithm(format!("EC curve {}", curve)))
    }
}
