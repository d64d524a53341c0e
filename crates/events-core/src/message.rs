//! Message types for the event gateway
//!
//! Defines the raw event handed over by a route and the canonical envelope
//! that is fanned out to subscribers. The envelope serializes with the
//! CloudEvents v0.3 attribute names.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// CloudEvents spec version stamped on every envelope
pub const SPEC_VERSION: &str = "0.3";

/// Content type of envelope data produced by the gateway
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encoding marker for base64 data in structured mode
pub const BASE64_ENCODING: &str = "base64";

/// Raw occurrence produced by an event source, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    /// Name of the event source (route) that produced the payload
    pub name: String,
    /// Type of the event source, e.g. `slack` or `webhook`
    pub source_type: String,
    /// Payload bytes exactly as queued by the route
    pub payload: Bytes,
}

impl GatewayEvent {
    pub fn new(name: impl Into<String>, source_type: impl Into<String>, payload: Bytes) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            payload,
        }
    }
}

/// Canonical event envelope
///
/// Built once per inbound occurrence and never mutated afterwards; every
/// subscriber send reads the same instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type of occurrence, taken from the event source type
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(rename = "specversion")]
    pub spec_version: String,

    /// Producer of the event (the gateway)
    pub source: String,

    /// Identifier unique per dispatch attempt
    pub id: String,

    /// Wall clock at transform time
    pub time: DateTime<Utc>,

    #[serde(rename = "datacontenttype")]
    pub data_content_type: String,

    /// Event source that saw the occurrence
    pub subject: String,

    /// Always `base64` for envelopes produced by the gateway
    #[serde(
        rename = "datacontentencoding",
        default = "default_encoding",
        skip_serializing_if = "String::is_empty"
    )]
    pub data_content_encoding: String,

    /// Opaque payload
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

fn default_encoding() -> String {
    BASE64_ENCODING.to_string()
}

/// Base64 encoding for the binary payload
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    /// Check the attributes CloudEvents requires to be present
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("type", &self.event_type),
            ("specversion", &self.spec_version),
            ("source", &self.source),
            ("id", &self.id),
            ("subject", &self.subject),
        ];
        for (attribute, value) in required {
            if value.trim().is_empty() {
                return Err(GatewayError::encoding(format!(
                    "envelope attribute {} must not be empty",
                    attribute
                )));
            }
        }
        Ok(())
    }

    /// Serialize to JSON bytes (structured content mode)
    pub fn to_bytes(&self) -> std::result::Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize from structured JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Attribute headers for the HTTP binary content mode
    ///
    /// The payload travels as the raw request body; `datacontenttype` becomes
    /// the `Content-Type` header and is therefore not repeated here.
    pub fn binary_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ce-specversion", self.spec_version.clone()),
            ("ce-type", self.event_type.clone()),
            ("ce-source", self.source.clone()),
            ("ce-id", self.id.clone()),
            ("ce-time", self.time.to_rfc3339()),
            ("ce-subject", self.subject.clone()),
        ]
    }
}
