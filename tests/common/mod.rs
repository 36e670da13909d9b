//! Shared fixtures for enrollment integration tests
//!
//! Builds a throwaway PKI with rcgen: a keystore root and intermediate that
//! issue a P-256 device leaf carrying a key attestation extension, and an
//! integrity root and RSA intermediate that issue the token signing leaf.

#![allow(dead_code)]

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams, CustomExtension,
    DistinguishedName, DnType, IsCa, KeyPair, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};

use device_enrollment::chain::{EncodedCertificate, TrustAnchors};
use device_enrollment::collaborators::InMemoryBackend;
use device_enrollment::config::SignatureLength;
use device_enrollment::pow::ProofOfWork;
use device_enrollment::{EnrollmentConfig, EnrollmentService, Pipeline};

const INTEGRITY_INTERMEDIATE_KEY: &str = include_str!("../fixtures/integrity-intermediate-key.pem");
const INTEGRITY_LEAF_KEY: &str = include_str!("../fixtures/integrity-leaf-key.pem");

pub const TOKEN: &str = "fcm-registration-token-0001:APA91bH";
pub const PACKAGE: &str = "me.stojan.pasbox";

const KEY_ATTESTATION_OID: [u64; 10] = [1, 3, 6, 1, 4, 1, 11129, 2, 1, 17];

/// Minimal DER writer for building attestation extensions
pub mod der {
    fn length(len: usize) -> Vec<u8> {
        if len < 0x80 {
            return vec![len as u8];
        }
        let bytes: Vec<u8> = len.to_be_bytes().into_iter().skip_while(|b| *b == 0).collect();
        let mut out = vec![0x80 | bytes.len() as u8];
        out.extend(bytes);
        out
    }

    pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(length(content.len()));
        out.extend_from_slice(content);
        out
    }

    fn integer_content(value: i64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 7 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        bytes[start..].to_vec()
    }

    pub fn integer(value: i64) -> Vec<u8> {
        tlv(0x02, &integer_content(value))
    }

    pub fn enumerated(value: i64) -> Vec<u8> {
        tlv(0x0a, &integer_content(value))
    }

    pub fn boolean(value: bool) -> Vec<u8> {
        tlv(0x01, &[if value { 0xff } else { 0x00 }])
    }

    pub fn octets(value: &[u8]) -> Vec<u8> {
        tlv(0x04, value)
    }

    pub fn sequence(items: &[Vec<u8>]) -> Vec<u8> {
        tlv(0x30, &items.concat())
    }

    pub fn set_of_integers(values: &[i64]) -> Vec<u8> {
        let items: Vec<Vec<u8>> = values.iter().map(|v| integer(*v)).collect();
        tlv(0x31, &items.concat())
    }

    /// `[number] EXPLICIT`, using the high tag number form above 30
    pub fn explicit(number: u32, inner: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if number < 31 {
            out.push(0xa0 | number as u8);
        } else {
            out.push(0xbf);
            let mut groups = Vec::new();
            let mut n = number;
            loop {
                groups.push((n & 0x7f) as u8);
                n >>= 7;
                if n == 0 {
                    break;
                }
            }
            groups.reverse();
            let last = groups.len() - 1;
            for (i, group) in groups.iter().enumerate() {
                out.push(if i == last { *group } else { group | 0x80 });
            }
        }
        out.extend(length(inner.len()));
        out.extend_from_slice(inner);
        out
    }
}

/// Properties asserted by the device leaf's attestation extension
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub keymaster_version: i64,
    pub attestation_security_level: i64,
    pub keymaster_security_level: i64,
    pub purpose: Vec<i64>,
    pub ec_curve: i64,
    pub origin: i64,
    /// Defaults to SHA-256 of the token
    pub challenge: Option<Vec<u8>>,
    pub with_extension: bool,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            keymaster_version: 4,
            attestation_security_level: 1,
            keymaster_security_level: 1,
            purpose: vec![2],
            ec_curve: 1,
            origin: 0,
            challenge: None,
            with_extension: true,
        }
    }
}

impl DeviceSpec {
    pub fn key_description(&self, token: &str) -> Vec<u8> {
        let challenge = self
            .challenge
            .clone()
            .unwrap_or_else(|| Sha256::digest(token.as_bytes()).to_vec());

        let software_enforced = der::sequence(&[
            der::explicit(701, &der::integer(1_704_067_200_000)),
            der::explicit(709, &der::octets(b"attestation-application-id")),
        ]);

        let root_of_trust = der::sequence(&[
            der::octets(&[0x11; 32]),
            der::boolean(true),
            der::enumerated(0),
            der::octets(&[0x22; 32]),
        ]);

        let tee_enforced = der::sequence(&[
            der::explicit(1, &der::set_of_integers(&self.purpose)),
            der::explicit(2, &der::integer(3)),
            der::explicit(3, &der::integer(256)),
            der::explicit(5, &der::set_of_integers(&[4])),
            der::explicit(10, &der::integer(self.ec_curve)),
            der::explicit(503, &[0x05, 0x00]),
            der::explicit(702, &der::integer(self.origin)),
            der::explicit(704, &root_of_trust),
            der::explicit(705, &der::integer(110_000)),
            der::explicit(706, &der::integer(202_401)),
        ]);

        der::sequence(&[
            der::integer(3),
            der::enumerated(self.attestation_security_level),
            der::integer(self.keymaster_version),
            der::enumerated(self.keymaster_security_level),
            der::octets(&challenge),
            der::octets(&[]),
            software_enforced,
            tee_enforced,
        ])
    }
}

/// A device signing key with its keystore chain, leaf first
pub struct Device {
    pub chain: Vec<Vec<u8>>,
    pub key: p256::ecdsa::SigningKey,
}

impl Device {
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: p256::ecdsa::Signature = self.key.sign(message);
        signature.to_der().as_bytes().to_vec()
    }
}

/// Parts of an enrollment request, before signing and proof of work
pub struct RequestParts {
    pub token: String,
    pub device: Device,
    pub envelope: String,
    pub agreement: [u8; 32],
}

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

fn params(common_name: &str, ca: bool) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Enrollment Test PKI");
    params.distinguished_name = dn;
    params.not_before = date_time_ymd(2024, 1, 1);
    params.not_after = date_time_ymd(2034, 1, 1);
    if ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }
    params
}

fn root(common_name: &str) -> Authority {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let cert = params(common_name, true).self_signed(&key).unwrap();
    Authority { cert, key }
}

pub struct Fixture {
    pub now: DateTime<Utc>,
    pub config: EnrollmentConfig,
    keystore_root: Authority,
    keystore_intermediate: Authority,
    integrity_root: Authority,
    integrity_chain: Vec<Vec<u8>>,
    integrity_signer: rsa::pkcs1v15::SigningKey<Sha256>,
}

impl Fixture {
    pub fn new() -> Self {
        let keystore_root = root("Keystore Test Root");
        let keystore_intermediate = {
            let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
            let cert = params("Keystore Test Intermediate", true)
                .signed_by(&key, &keystore_root.cert, &keystore_root.key)
                .unwrap();
            Authority { cert, key }
        };

        let integrity_root = root("Integrity Test Root");
        let integrity_intermediate = {
            let key = KeyPair::from_pem_and_sign_algo(INTEGRITY_INTERMEDIATE_KEY, &PKCS_RSA_SHA256).unwrap();
            let cert = params("Integrity Test Intermediate", true)
                .signed_by(&key, &integrity_root.cert, &integrity_root.key)
                .unwrap();
            Authority { cert, key }
        };
        let integrity_leaf = {
            let key = KeyPair::from_pem_and_sign_algo(INTEGRITY_LEAF_KEY, &PKCS_RSA_SHA256).unwrap();
            let mut leaf_params = CertificateParams::new(vec!["attest.android.com".to_string()]).unwrap();
            leaf_params.distinguished_name = params("attest.android.com", false).distinguished_name;
            leaf_params.not_before = date_time_ymd(2024, 1, 1);
            leaf_params.not_after = date_time_ymd(2034, 1, 1);
            leaf_params
                .signed_by(&key, &integrity_intermediate.cert, &integrity_intermediate.key)
                .unwrap()
        };

        let integrity_signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(
            rsa::RsaPrivateKey::from_pkcs8_pem(INTEGRITY_LEAF_KEY).unwrap(),
        );

        let config = EnrollmentConfig {
            pow_difficulty_bytes: 1,
            pow_trailing_mask: 0xF0,
            signature_length: SignatureLength { min: 8, max: 72 },
            ..Default::default()
        };

        Self {
            now: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            config,
            keystore_root,
            keystore_intermediate,
            integrity_root,
            integrity_chain: vec![integrity_leaf.der().to_vec(), integrity_intermediate.cert.der().to_vec()],
            integrity_signer,
        }
    }

    pub fn keystore_anchors(&self) -> TrustAnchors {
        anchor(&self.keystore_root.cert)
    }

    pub fn integrity_anchors(&self) -> TrustAnchors {
        anchor(&self.integrity_root.cert)
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(&self.config, self.keystore_anchors(), self.integrity_anchors()).unwrap()
    }

    pub fn service(&self) -> EnrollmentService<InMemoryBackend> {
        EnrollmentService::new(self.pipeline(), InMemoryBackend::new(), self.config.push_topic.clone())
    }

    /// Integrity certificates as carried in `x5c`, leaf first
    pub fn integrity_chain(&self) -> &[Vec<u8>] {
        &self.integrity_chain
    }

    /// A passing integrity verdict for `token`
    pub fn payload(&self, token: &str) -> serde_json::Value {
        serde_json::json!({
            "timestampMs": (self.now - chrono::Duration::seconds(30)).timestamp_millis(),
            "nonce": STANDARD.encode(token),
            "apkPackageName": PACKAGE,
            "apkDigestSha256": STANDARD.encode([0x33; 32]),
            "apkCertificateDigestSha256": [STANDARD.encode([0x44; 32])],
            "ctsProfileMatch": true,
            "basicIntegrity": true,
            "evaluationType": "BASIC,HARDWARE_BACKED"
        })
    }

    pub fn header(&self) -> serde_json::Value {
        serde_json::json!({
            "alg": "RS256",
            "x5c": self.integrity_chain.iter().map(|c| STANDARD.encode(c)).collect::<Vec<_>>()
        })
    }

    /// Sign `header.payload` with the integrity leaf key
    pub fn envelope_with(&self, header: &serde_json::Value, payload: &serde_json::Value) -> String {
        let signed = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string())
        );
        let signature = self.integrity_signer.sign(signed.as_bytes());
        format!("{}.{}", signed, URL_SAFE_NO_PAD.encode(signature.to_vec()))
    }

    pub fn envelope(&self, payload: &serde_json::Value) -> String {
        self.envelope_with(&self.header(), payload)
    }

    /// A device leaf for `token` under the keystore intermediate
    pub fn device(&self, token: &str, spec: &DeviceSpec) -> Device {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();

        let mut leaf_params = params("Android Keystore Key", false);
        if spec.with_extension {
            leaf_params.custom_extensions.push(CustomExtension::from_oid_content(
                &KEY_ATTESTATION_OID,
                spec.key_description(token),
            ));
        }
        let leaf = leaf_params
            .signed_by(&key, &self.keystore_intermediate.cert, &self.keystore_intermediate.key)
            .unwrap();

        let signing_key = {
            use p256::pkcs8::DecodePrivateKey;
            p256::ecdsa::SigningKey::from_pkcs8_der(&key.serialize_der()).unwrap()
        };

        Device {
            chain: vec![leaf.der().to_vec(), self.keystore_intermediate.cert.der().to_vec()],
            key: signing_key,
        }
    }

    /// Parts of a fully valid request for `token`
    pub fn parts(&self, token: &str) -> RequestParts {
        RequestParts {
            token: token.to_string(),
            device: self.device(token, &DeviceSpec::default()),
            envelope: self.envelope(&self.payload(token)),
            agreement: agreement(),
        }
    }

    /// Sign and solve `parts` into a request document
    pub fn request_from(&self, parts: &RequestParts) -> serde_json::Value {
        let mut message = Vec::new();
        for cert in &parts.device.chain {
            message.extend_from_slice(cert);
        }
        message.extend_from_slice(&parts.agreement);
        message.extend_from_slice(parts.envelope.as_bytes());
        message.extend_from_slice(parts.token.as_bytes());
        let signature = parts.device.sign(&message);

        let mut proof = ProofOfWork::new(self.config.pow_difficulty_bytes, self.config.pow_trailing_mask).unwrap();
        for cert in &parts.device.chain {
            proof.add(cert);
        }
        proof
            .add(&parts.agreement)
            .add(parts.envelope.as_bytes())
            .add(parts.token.as_bytes())
            .add(&signature);
        let counter = proof.solve(1 << 24).unwrap();

        serde_json::json!({
            "deviceCertificate": parts.device.chain.iter().map(|c| STANDARD.encode(c)).collect::<Vec<_>>(),
            "identityAgreement": STANDARD.encode(parts.agreement),
            "safetyNet": parts.envelope,
            "token": parts.token,
            "signature": STANDARD.encode(&signature),
            "hashcash20": counter
        })
    }

    /// A fully valid request document for `token`
    pub fn request(&self, token: &str) -> serde_json::Value {
        self.request_from(&self.parts(token))
    }
}

fn anchor(cert: &Certificate) -> TrustAnchors {
    TrustAnchors::new(vec![EncodedCertificate::from_der(cert.der().to_vec()).unwrap()]).unwrap()
}

/// A fresh device X25519 public value
pub fn agreement() -> [u8; 32] {
    use x25519_dalek::{EphemeralSecret, PublicKey};
    PublicKey::from(&EphemeralSecret::random_from_rng(rand::rngs::OsRng)).to_bytes()
}
