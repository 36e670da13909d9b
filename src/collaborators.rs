//! Downstream collaborators of a completed enrollment
//!
//! After the pipeline completes, the device's push token is registered as an
//! endpoint, the endpoint is subscribed to the device topic, and then a
//! registration message is published while the device record is stored under
//! both of its keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::DeviceRegistrationMessage;
use crate::chain::EncodedCertificate;
use crate::error::{Error, Result};

/// Creates push endpoints for device tokens
#[allow(async_fn_in_trait)]
pub trait PushRegistrar: Send + Sync {
    async fn create_endpoint(&self, token: &str) -> Result<String>;
}

/// Subscribes push endpoints to topics
#[allow(async_fn_in_trait)]
pub trait TopicSubscriber: Send + Sync {
    async fn subscribe(&self, endpoint: &str, topic: &str) -> Result<String>;
}

/// Delivers messages to a push endpoint
#[allow(async_fn_in_trait)]
pub trait Notifier: Send + Sync {
    async fn publish(&self, endpoint: &str, message: &DeviceRegistrationMessage) -> Result<()>;
}

/// Idempotent device record storage
///
/// `upsert` overwrites every field except `created_at`, which keeps the value
/// from the first write.
#[allow(async_fn_in_trait)]
pub trait DeviceStore: Send + Sync {
    async fn upsert(&self, key: &str, record: DeviceRecord) -> Result<()>;
}

/// Store key for a device's derived identity handle
pub fn registration_key(identity_handle: &[u8]) -> String {
    format!("registration/android/{}", hex::encode(identity_handle))
}

/// Store key for a device's push token
pub fn token_key(token: &str) -> String {
    format!("token/fcm/{}", token)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Derived identity handle
    #[serde(with = "crate::encoding::base64_bytes")]
    pub identity: Vec<u8>,
    /// Integrity envelope exactly as submitted
    pub safety_net: String,
    pub device_certificate: Vec<EncodedCertificate>,
    pub token: String,
    pub endpoint: String,
    pub subscription: String,
    pub hashcash20: i32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Process-local backend implementing every collaborator
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    endpoints: Mutex<HashMap<String, String>>,
    subscriptions: Mutex<Vec<(String, String)>>,
    published: Mutex<Vec<(String, DeviceRegistrationMessage)>>,
    records: Mutex<HashMap<String, DeviceRecord>>,
    sequence: AtomicU64,
    fail_store: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `upsert` fail
    pub fn fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    pub async fn record(&self, key: &str) -> Option<DeviceRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn published(&self) -> Vec<(String, DeviceRegistrationMessage)> {
        self.published.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions.lock().await.clone()
    }

    fn next_id(&self, kind: &str) -> String {
        format!("{}-{}", kind, self.sequence.fetch_add(1, Ordering::SeqCst))
    }
}

impl PushRegistrar for InMemoryBackend {
    async fn create_endpoint(&self, token: &str) -> Result<String> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(token) {
            return Ok(endpoint.clone());
        }
        let endpoint = self.next_id("endpoint");
        endpoints.insert(token.to_string(), endpoint.clone());
        Ok(endpoint)
    }
}

impl TopicSubscriber for InMemoryBackend {
    async fn subscribe(&self, endpoint: &str, topic: &str) -> Result<String> {
        self.subscriptions
            .lock()
            .await
            .push((endpoint.to_string(), topic.to_string()));
        Ok(self.next_id("subscription"))
    }
}

impl Notifier for InMemoryBackend {
    async fn publish(&self, endpoint: &str, message: &DeviceRegistrationMessage) -> Result<()> {
        self.published
            .lock()
            .await
            .push((endpoint.to_string(), message.clone()));
        Ok(())
    }
}

impl DeviceStore for InMemoryBackend {
    async fn upsert(&self, key: &str, mut record: DeviceRecord) -> Result<()> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(Error::Collaborator(format!("Device store rejected {}", key)));
        }

        let mut records = self.records.lock().await;
        let created_at = records
            .get(key)
            .and_then(|existing| existing.created_at)
            .unwrap_or(record.updated_at);
        record.created_at = Some(created_at);
        records.insert(key.to_string(), record);
        Ok(())
    }
}
