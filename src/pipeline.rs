//! Enrollment validation pipeline
//!
//! An enrollment request passes through a fixed list of stages, cheapest
//! first. The first stage to fail ends the run with its rejection; nothing is
//! retried and nothing outside the pipeline is touched before `Complete`.
//!
//! ```text
//! StructuralCheck → ProofOfWork → DeviceSignature → IntegrityAttestation
//!     → KeystoreAttestationPolicy → IdentityDerivation → Complete
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::api::EnrollmentRequest;
use crate::attestation::{KeyDescription, KeystoreAttestation, KeystorePolicy};
use crate::chain::{ChainValidator, TrustAnchors};
use crate::config::{ConfigError, EnrollmentConfig, SignatureLength};
use crate::error::{reasons, Rejection, Result};
use crate::identity::{self, DeviceIdentity, IdentityError};
use crate::integrity::{IntegrityPayload, IntegrityValidator};
use crate::pow::ProofOfWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    StructuralCheck,
    ProofOfWork,
    DeviceSignature,
    IntegrityAttestation,
    KeystoreAttestationPolicy,
    IdentityDerivation,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::StructuralCheck => "structural-check",
            Stage::ProofOfWork => "proof-of-work",
            Stage::DeviceSignature => "device-signature",
            Stage::IntegrityAttestation => "integrity-attestation",
            Stage::KeystoreAttestationPolicy => "keystore-attestation-policy",
            Stage::IdentityDerivation => "identity-derivation",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// A device that passed every stage
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub identity: DeviceIdentity,
    pub description: KeyDescription,
    pub integrity: IntegrityPayload,
}

#[derive(Debug)]
pub enum Outcome {
    Complete(Enrollment),
    Rejected { stage: Stage, rejection: Rejection },
}

impl Outcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete(_))
    }
}

/// Values accumulated by earlier stages for later ones
#[derive(Default)]
struct Context {
    integrity: Option<IntegrityPayload>,
    description: Option<KeyDescription>,
    identity: Option<DeviceIdentity>,
}

type Step = fn(&Pipeline, &EnrollmentRequest, DateTime<Utc>, &mut Context) -> std::result::Result<(), Rejection>;

static STEPS: [(Stage, Step); 6] = [
    (Stage::StructuralCheck, structural_check),
    (Stage::ProofOfWork, proof_of_work),
    (Stage::DeviceSignature, device_signature),
    (Stage::IntegrityAttestation, integrity_attestation),
    (Stage::KeystoreAttestationPolicy, keystore_attestation_policy),
    (Stage::IdentityDerivation, identity_derivation),
];

#[derive(Debug, Clone)]
struct Limits {
    min_token_length: usize,
    min_certificates: usize,
    signature_length: SignatureLength,
    agreement_length: usize,
}

/// Validates enrollment requests
///
/// Holds only immutable state, so one instance serves any number of
/// concurrent requests.
#[derive(Debug, Clone)]
pub struct Pipeline {
    limits: Limits,
    /// Empty puzzle with the configured difficulty
    proof: ProofOfWork,
    integrity: IntegrityValidator,
    keystore: KeystoreAttestation,
    policy: KeystorePolicy,
    package_name: String,
    freshness_window: chrono::Duration,
}

impl Pipeline {
    /// Build a pipeline from a configuration that must pass validation
    pub fn new(
        config: &EnrollmentConfig,
        keystore_anchors: TrustAnchors,
        integrity_anchors: TrustAnchors,
    ) -> Result<Self> {
        config.validate()?;

        let proof = ProofOfWork::new(config.pow_difficulty_bytes, config.pow_trailing_mask)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(Self {
            limits: Limits {
                min_token_length: config.min_token_length,
                min_certificates: config.min_certificates,
                signature_length: config.signature_length,
                agreement_length: config.agreement_length,
            },
            proof,
            integrity: IntegrityValidator::with_hostname(
                ChainValidator::new(integrity_anchors),
                config.attestation_hostname.clone(),
            ),
            keystore: KeystoreAttestation::new(ChainValidator::new(keystore_anchors)),
            policy: KeystorePolicy::new(config.supported_keymaster_versions.clone()),
            package_name: config.package_name.clone(),
            freshness_window: config.freshness_window(),
        })
    }

    /// Build a pipeline with the anchors named by `config`
    pub fn from_config(config: &EnrollmentConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config, config.keystore_anchors()?, config.integrity_anchors()?)
    }

    /// Stages in the order they run
    pub fn stages() -> impl Iterator<Item = Stage> {
        STEPS.iter().map(|(stage, _)| *stage).chain(std::iter::once(Stage::Complete))
    }

    /// Run every stage against `request` with `now` as the reference instant
    pub fn run(&self, request: &EnrollmentRequest, now: DateTime<Utc>) -> Outcome {
        let mut context = Context::default();

        for (stage, step) in STEPS.iter() {
            debug!(stage = %stage, "Running enrollment stage");
            if let Err(rejection) = step(self, request, now, &mut context) {
                info!(
                    stage = %stage,
                    reasons = ?rejection.reasons,
                    cause = ?rejection.cause.as_ref().map(|c| c.to_string()),
                    "Enrollment rejected"
                );
                return Outcome::Rejected {
                    stage: *stage,
                    rejection,
                };
            }
        }

        match (context.identity, context.description, context.integrity) {
            (Some(identity), Some(description), Some(integrity)) => {
                debug!(handle = %identity.handle_prefix(), "Enrollment complete");
                Outcome::Complete(Enrollment {
                    identity,
                    description,
                    integrity,
                })
            }
            _ => Outcome::Rejected {
                stage: Stage::Complete,
                rejection: Rejection::server("pipeline finished without every stage result"),
            },
        }
    }
}

fn structural_check(
    pipeline: &Pipeline,
    request: &EnrollmentRequest,
    _now: DateTime<Utc>,
    _context: &mut Context,
) -> std::result::Result<(), Rejection> {
    let limits = &pipeline.limits;

    // Measured in UTF-16 code units, as the device counts it
    if request.token.encode_utf16().count() < limits.min_token_length {
        return Err(Rejection::client(&[reasons::BAD_PAYLOAD, reasons::TOKEN_TOO_SHORT]));
    }

    if request.device_certificate.len() < limits.min_certificates {
        return Err(Rejection::client(&[
            reasons::BAD_PAYLOAD,
            reasons::NOT_ENOUGH_CERTIFICATES,
        ]));
    }

    if !limits.signature_length.contains(request.signature.len()) {
        return Err(Rejection::client(&[reasons::BAD_SIGNATURE, reasons::INCORRECT_SIZE]));
    }

    if request.identity_agreement.len() != limits.agreement_length {
        return Err(Rejection::client(&[
            reasons::BAD_IDENTITY_AGREEMENT,
            reasons::INCORRECT_SIZE,
        ]));
    }

    if request.hashcash20 < 0 {
        return Err(Rejection::client(&[reasons::BAD_POW, reasons::NEGATIVE_COUNTER]));
    }

    Ok(())
}

fn proof_of_work(
    pipeline: &Pipeline,
    request: &EnrollmentRequest,
    _now: DateTime<Utc>,
    _context: &mut Context,
) -> std::result::Result<(), Rejection> {
    let mut proof = pipeline.proof.clone();
    for buffer in request.work_buffers() {
        proof.add(buffer);
    }

    // Sign was checked in the structural stage
    if !proof.verify(request.hashcash20 as u32) {
        return Err(Rejection::client(&[reasons::BAD_POW]));
    }

    Ok(())
}

fn device_signature(
    _pipeline: &Pipeline,
    request: &EnrollmentRequest,
    _now: DateTime<Utc>,
    _context: &mut Context,
) -> std::result::Result<(), Rejection> {
    let leaf = request
        .device_certificate
        .first()
        .ok_or_else(|| Rejection::client(&[reasons::BAD_PAYLOAD, reasons::NOT_ENOUGH_CERTIFICATES]))?;

    leaf.verify_message(&request.signed_message(), &request.signature)
        .map_err(|e| Rejection::client(&[reasons::BAD_SIGNATURE]).with_cause(e))
}

fn integrity_attestation(
    pipeline: &Pipeline,
    request: &EnrollmentRequest,
    now: DateTime<Utc>,
    context: &mut Context,
) -> std::result::Result<(), Rejection> {
    let token = pipeline.integrity.verify(&request.safety_net)?;
    let payload = token.payload;

    if !(payload.basic_integrity && payload.cts_profile_match) {
        return Err(Rejection::client(&[reasons::BAD_SAFETYNET, reasons::INCOMPATIBLE_DEVICE]));
    }

    if payload.apk_package_name != pipeline.package_name {
        return Err(Rejection::client(&[reasons::BAD_SAFETYNET, reasons::UNKNOWN_PACKAGE_NAME]));
    }

    if std::str::from_utf8(&payload.nonce).ok() != Some(request.token.as_str()) {
        return Err(Rejection::client(&[reasons::BAD_SAFETYNET, reasons::NONCE_NOT_TOKEN]));
    }

    if payload.timestamp_ms < now - pipeline.freshness_window {
        return Err(Rejection::client(&[reasons::BAD_SAFETYNET, reasons::STALE_ATTESTATION]));
    }

    context.integrity = Some(payload);
    Ok(())
}

fn keystore_attestation_policy(
    pipeline: &Pipeline,
    request: &EnrollmentRequest,
    now: DateTime<Utc>,
    context: &mut Context,
) -> std::result::Result<(), Rejection> {
    let description = pipeline.keystore.verify(&request.device_certificate, now)?;
    pipeline.policy.enforce(&description, &request.token)?;

    context.description = Some(description);
    Ok(())
}

fn identity_derivation(
    _pipeline: &Pipeline,
    request: &EnrollmentRequest,
    _now: DateTime<Utc>,
    context: &mut Context,
) -> std::result::Result<(), Rejection> {
    let identity = identity::derive(&request.identity_agreement).map_err(|err| match err {
        IdentityError::AgreementLength(_) => {
            Rejection::client(&[reasons::BAD_IDENTITY_AGREEMENT, reasons::INCORRECT_SIZE]).with_cause(err)
        }
        IdentityError::LowOrderPoint => {
            Rejection::client(&[reasons::BAD_IDENTITY_AGREEMENT, reasons::LOW_ORDER_POINT]).with_cause(err)
        }
        IdentityError::Key => Rejection::server(err),
    })?;

    context.identity = Some(identity);
    Ok(())
}
