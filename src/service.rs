//! Enrollment service boundary
//!
//! [`EnrollmentService::handle`] takes a transport-neutral inbound request and
//! always produces a response:
//! 1. Reject binary bodies and anything not declared as JSON
//! 2. Strictly decode the enrollment request
//! 3. Run the validation pipeline
//! 4. Register the device with the push and storage collaborators
//!
//! Client faults carry their reason codes. Anything else, a panic included,
//! becomes an opaque `not-your-fault` with the request id as its tracking code.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{error, info};

use crate::api::{DeviceRegistrationMessage, EnrollmentRequest, EnrollmentResponse, EnrollmentResult, ErrorBody};
use crate::collaborators::{registration_key, token_key, DeviceRecord, DeviceStore, Notifier, PushRegistrar, TopicSubscriber};
use crate::config::EnrollmentConfig;
use crate::error::{reasons, Rejection, Result, Status};
use crate::pipeline::{Enrollment, Outcome, Pipeline};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An enrollment request as received by the transport
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Set by transports that deliver the body base64-encoded
    pub body_is_binary: bool,
    pub request_id: String,
    pub received_at: DateTime<Utc>,
}

impl InboundRequest {
    /// A JSON text body
    pub fn json(body: impl Into<Vec<u8>>, request_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            body: body.into(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body_is_binary: false,
            request_id: request_id.into(),
            received_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: EnrollmentResponse,
}

impl OutboundResponse {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

/// Validates enrollments and hands completed ones to the collaborators
pub struct EnrollmentService<B> {
    pipeline: Pipeline,
    backend: B,
    push_topic: String,
}

impl<B> EnrollmentService<B>
where
    B: PushRegistrar + TopicSubscriber + Notifier + DeviceStore,
{
    pub fn new(pipeline: Pipeline, backend: B, push_topic: impl Into<String>) -> Self {
        Self {
            pipeline,
            backend,
            push_topic: push_topic.into(),
        }
    }

    /// Load anchors and build the pipeline described by `config`
    pub fn from_config(config: &EnrollmentConfig, backend: B) -> Result<Self> {
        Ok(Self::new(
            Pipeline::from_config(config)?,
            backend,
            config.push_topic.clone(),
        ))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn handle(&self, inbound: InboundRequest) -> OutboundResponse {
        let outcome = AssertUnwindSafe(self.enroll(&inbound))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(Rejection::server(panic_message(payload))));

        match outcome {
            Ok(result) => OutboundResponse {
                status: 200,
                body: EnrollmentResponse::success(result),
            },
            Err(mut rejection) => {
                if rejection.status == Status::ServerFault {
                    rejection = rejection.with_track(inbound.request_id.clone());
                    error!(
                        track = %inbound.request_id,
                        cause = ?rejection.cause.as_ref().map(|c| c.to_string()),
                        "Enrollment failed"
                    );
                }

                OutboundResponse {
                    status: rejection.status.code(),
                    body: EnrollmentResponse::failure(ErrorBody::from(&rejection)),
                }
            }
        }
    }

    async fn enroll(&self, inbound: &InboundRequest) -> std::result::Result<EnrollmentResult, Rejection> {
        if inbound.body_is_binary {
            return Err(Rejection::client(&[reasons::BODY_IS_OCTET_STREAM]));
        }

        if inbound.content_type.as_deref() != Some(JSON_CONTENT_TYPE) {
            return Err(Rejection::client(&[reasons::BODY_NOT_JSON]));
        }

        let request: EnrollmentRequest = serde_json::from_slice(&inbound.body).map_err(|e| {
            Rejection::client(&[reasons::BODY_BAD_JSON])
                .with_track(inbound.request_id.clone())
                .with_cause(e)
        })?;

        let enrollment = match self.pipeline.run(&request, inbound.received_at) {
            Outcome::Complete(enrollment) => enrollment,
            Outcome::Rejected { rejection, .. } => return Err(rejection),
        };

        self.register(&request, &enrollment, inbound.received_at)
            .await
            .map_err(Rejection::server)?;

        Ok(EnrollmentResult {
            identity_key: enrollment.identity.identity_key,
            certificate_description: enrollment.description,
        })
    }

    async fn register(
        &self,
        request: &EnrollmentRequest,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let identity = &enrollment.identity;

        let endpoint = self.backend.create_endpoint(&request.token).await?;
        let subscription = self.backend.subscribe(&endpoint, &self.push_topic).await?;

        let message = DeviceRegistrationMessage::new(&identity.agreement_public_value, now);
        let record = DeviceRecord {
            identity: identity.identity_handle.clone(),
            safety_net: request.safety_net.original().to_string(),
            device_certificate: request.device_certificate.clone(),
            token: request.token.clone(),
            endpoint: endpoint.clone(),
            subscription,
            hashcash20: request.hashcash20,
            updated_at: now,
            created_at: None,
        };

        let identity_key = registration_key(&identity.identity_handle);
        let token_key = token_key(&request.token);

        let (published, by_identity, by_token) = tokio::join!(
            self.backend.publish(&endpoint, &message),
            self.backend.upsert(&identity_key, record.clone()),
            self.backend.upsert(&token_key, record),
        );
        published?;
        by_identity?;
        by_token?;

        info!(
            handle = %identity.handle_prefix(),
            endpoint = %endpoint,
            "Device enrolled"
        );

        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("enrollment panicked: {}", message)
}
