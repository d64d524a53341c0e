//! Event transformation
//!
//! Wraps a raw route payload in the canonical envelope.

use bytes::Bytes;
use chrono::Utc;
use events_core::error::Result;
use events_core::message::{
    Envelope, GatewayEvent, BASE64_ENCODING, JSON_CONTENT_TYPE, SPEC_VERSION,
};
use uuid::Uuid;

/// Builds envelopes on behalf of one gateway
#[derive(Debug, Clone)]
pub struct EventTransformer {
    gateway_name: String,
}

impl EventTransformer {
    pub fn new(gateway_name: impl Into<String>) -> Self {
        Self {
            gateway_name: gateway_name.into(),
        }
    }

    /// Build an envelope for a payload seen by event source `source_name`
    ///
    /// `id` and `time` are fresh on every call; everything else follows
    /// from the inputs.
    pub fn transform(&self, source_name: &str, source_type: &str, payload: Bytes) -> Result<Envelope> {
        let envelope = Envelope {
            event_type: source_type.to_string(),
            spec_version: SPEC_VERSION.to_string(),
            source: self.gateway_name.clone(),
            id: Uuid::new_v4().simple().to_string(),
            time: Utc::now(),
            data_content_type: JSON_CONTENT_TYPE.to_string(),
            subject: source_name.to_string(),
            data_content_encoding: BASE64_ENCODING.to_string(),
            data: payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Transform a forwarded route event
    pub fn transform_event(&self, event: GatewayEvent) -> Result<Envelope> {
        self.transform(&event.name, &event.source_type, event.payload)
    }
}
