//! # Device Enrollment
//!
//! Hardware-attested enrollment of Android devices into an identity service.
//!
//! ## Verification Stages
//!
//! Every enrollment request runs the same fixed pipeline, cheapest checks
//! first, and stops at the first failure:
//!
//! ### Step 1: Structural Checks
//! - Token, certificate chain, signature, agreement value and counter sizes
//!
//! ### Step 2: Proof of Work
//! - SHA-256 over the request buffers and counter must have a zero prefix
//!
//! ### Step 3: Device Signature
//! - The hardware-backed leaf key signs the certificates, agreement value,
//!   integrity envelope and token
//!
//! ### Step 4: Integrity Attestation
//! - Verifies the signed integrity verdict, its certificate chain, and that it
//!   is fresh, names this application and carries the token as its nonce
//!
//! ### Step 5: Key Attestation
//! - Validates the keystore chain against the hardware root
//! - Decodes the attestation extension and enforces TEE-only signing keys
//!   whose challenge is the digest of the token
//!
//! ### Step 6: Identity Derivation
//! - X25519 agreement with a fresh service key, keyed with a fresh HMAC-SHA512
//!   secret, yields the device's durable identity handle
//!
//! ## Example
//!
//! ```rust,ignore
//! use device_enrollment::{EnrollmentConfig, EnrollmentService, InboundRequest};
//! use device_enrollment::collaborators::InMemoryBackend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EnrollmentConfig::from_file("enrollment.toml".as_ref())?;
//!     let service = EnrollmentService::from_config(&config, InMemoryBackend::new())?;
//!
//!     let response = service
//!         .handle(InboundRequest::json(body, "request-id", chrono::Utc::now()))
//!         .await;
//!     println!("{}", response.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod attestation;
pub mod chain;
pub mod collaborators;
pub mod config;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod jws;
pub mod pipeline;
pub mod pow;
pub mod service;

pub use api::{EnrollmentRequest, EnrollmentResponse};
pub use config::EnrollmentConfig;
pub use error::{Error, Rejection};
pub use pipeline::{Outcome, Pipeline, Stage};
pub use service::{EnrollmentService, InboundRequest, OutboundResponse};
