//! Slack event source
//!
//! Handles the Slack Events API (JSON bodies) and interactive components
//! (form-encoded bodies carrying a `payload` field). Requests are
//! authenticated with Slack's signing secret scheme:
//!
//! ```text
//! X-Slack-Signature = "v0=" + hex(HMAC-SHA256(secret, "v0:{timestamp}:{body}"))
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use events_core::config::{RouteConfig, SourceType};
use events_core::error::{GatewayError, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::route::{Classification, RouteSource, WebhookRequest};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-slack-signature";
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

const SIGNATURE_VERSION: &str = "v0";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Outer Events API body
#[derive(Debug, Deserialize)]
struct EventsApiBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event: Option<serde_json::Value>,
}

/// Slack route source
pub struct SlackSource {
    signing_secret: Option<String>,
    token: Option<String>,
    tolerance: Duration,
}

impl SlackSource {
    pub fn new(signing_secret: Option<String>, token: Option<String>, tolerance: Duration) -> Self {
        Self {
            signing_secret: signing_secret.filter(|secret| !secret.is_empty()),
            token: token.filter(|token| !token.is_empty()),
            tolerance,
        }
    }

    pub fn from_config(config: &RouteConfig) -> Self {
        Self::new(
            config.signing_secret.clone(),
            config.token.clone(),
            config.signature_tolerance,
        )
    }

    /// Verify the signature against a given clock, in unix seconds
    pub fn verify_at(&self, request: &WebhookRequest, now: i64) -> Result<()> {
        let Some(secret) = self.signing_secret.as_deref() else {
            return Ok(());
        };

        let timestamp = request
            .header(TIMESTAMP_HEADER)
            .ok_or_else(|| GatewayError::verification("missing request timestamp"))?;
        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| GatewayError::verification("malformed request timestamp"))?;
        if now.abs_diff(sent_at) > self.tolerance.as_secs() {
            return Err(GatewayError::verification("request timestamp outside tolerance"));
        }

        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| GatewayError::verification("missing request signature"))?;
        let expected = compute_signature(secret, timestamp, &request.body)?;

        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(GatewayError::verification("signature mismatch"));
        }
        Ok(())
    }

    fn check_token(&self, token: Option<&str>) -> Result<()> {
        match self.token.as_deref() {
            Some(expected) if token != Some(expected) => {
                Err(GatewayError::verification("invalid verification token"))
            }
            _ => Ok(()),
        }
    }

    fn classify_interaction(&self, body: &[u8]) -> Result<Classification> {
        let payload = url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| GatewayError::parse("interaction body has no payload field"))?;

        let value: serde_json::Value = serde_json::from_str(&payload)
            .map_err(|e| GatewayError::parse_with_source("failed to parse interaction payload", e))?;
        if !value.is_object() {
            return Err(GatewayError::parse("interaction payload is not an object"));
        }

        let data = serde_json::to_vec(&value)
            .map_err(|e| GatewayError::parse_with_source("failed to encode interaction", e))?;
        Ok(Classification::Interaction(Bytes::from(data)))
    }

    fn classify_event(&self, body: &[u8]) -> Result<Classification> {
        let outer: EventsApiBody = serde_json::from_slice(body)
            .map_err(|e| GatewayError::parse_with_source("failed to parse event body", e))?;
        self.check_token(outer.token.as_deref())?;

        match outer.kind.as_str() {
            "url_verification" => {
                let challenge = outer
                    .challenge
                    .ok_or_else(|| GatewayError::parse("url_verification without challenge"))?;
                info!("Answering Slack URL verification");
                Ok(Classification::Challenge(challenge))
            }
            "event_callback" => {
                let inner = outer
                    .event
                    .ok_or_else(|| GatewayError::parse("event_callback without event"))?;
                let data = serde_json::to_vec(&inner)
                    .map_err(|e| GatewayError::parse_with_source("failed to encode event", e))?;
                Ok(Classification::Event(Bytes::from(data)))
            }
            other => {
                debug!(kind = other, "Ignoring Slack callback type");
                Ok(Classification::Acknowledged)
            }
        }
    }
}

fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::verification(format!("invalid signing secret: {}", e)))?;
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    Ok(format!(
        "{}={}",
        SIGNATURE_VERSION,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[async_trait]
impl RouteSource for SlackSource {
    fn source_type(&self) -> SourceType {
        SourceType::Slack
    }

    fn verify(&self, request: &WebhookRequest) -> Result<()> {
        self.verify_at(request, Utc::now().timestamp())
    }

    fn classify(&self, request: &WebhookRequest) -> Result<Classification> {
        if request.content_type() == Some(FORM_CONTENT_TYPE) {
            self.classify_interaction(&request.body)
        } else {
            self.classify_event(&request.body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderMap, HeaderValue, Method};

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const NOW: i64 = 1_531_420_618;

    fn request(content_type: &'static str, body: &'static str) -> WebhookRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        WebhookRequest::new(Method::POST, headers, Bytes::from_static(body.as_bytes()))
    }

    fn signed(body: &'static str, timestamp: i64) -> WebhookRequest {
        let mut request = request("application/json", body);
        let ts = timestamp.to_string();
        let signature = compute_signature(SECRET, &ts, body.as_bytes()).unwrap();
        request
            .headers
            .insert(TIMESTAMP_HEADER, HeaderValue::from_str(&ts).unwrap());
        request
            .headers
            .insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        request
    }

    fn source() -> SlackSource {
        SlackSource::new(Some(SECRET.into()), None, Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let request = signed(r#"{"type":"event_callback","event":{}}"#, NOW);
        assert!(source().verify_at(&request, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let mut request = signed(r#"{"type":"event_callback","event":{}}"#, NOW);
        request.body = Bytes::from_static(br#"{"type":"event_callback","event":{"x":1}}"#);
        assert!(matches!(
            source().verify_at(&request, NOW),
            Err(GatewayError::Verification { .. })
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let request = signed(r#"{"type":"event_callback","event":{}}"#, NOW);
        assert!(source().verify_at(&request, NOW + 301).is_err());
    }

    #[test]
    fn test_verification_skipped_without_secret() {
        let source = SlackSource::new(None, None, Duration::from_secs(300));
        let request = request("application/json", "{}");
        assert!(source.verify_at(&request, NOW).is_ok());
    }

    #[test]
    fn test_url_verification_yields_challenge() {
        let request = request(
            "application/json",
            r#"{"type":"url_verification","token":"tok","challenge":"T123"}"#,
        );
        assert_eq!(
            source().classify(&request).unwrap(),
            Classification::Challenge("T123".into())
        );
    }

    #[test]
    fn test_event_callback_yields_inner_event() {
        let request = request(
            "application/json",
            r#"{"type":"event_callback","event":{"type":"message","text":"hi"}}"#,
        );
        let Classification::Event(data) = source().classify(&request).unwrap() else {
            panic!("expected event payload");
        };
        let inner: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(inner["text"], "hi");
    }

    #[test]
    fn test_form_payload_yields_interaction() {
        let request = request(
            "application/x-www-form-urlencoded; charset=utf-8",
            "payload=%7B%22type%22%3A%22block_actions%22%7D",
        );
        let Classification::Interaction(data) = source().classify(&request).unwrap() else {
            panic!("expected interaction payload");
        };
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["type"], "block_actions");
    }

    #[test]
    fn test_malformed_bodies_are_parse_errors() {
        let bad_json = request("application/json", "{not json");
        assert!(matches!(
            source().classify(&bad_json),
            Err(GatewayError::Parse { .. })
        ));

        let no_payload = request("application/x-www-form-urlencoded", "other=1");
        assert!(matches!(
            source().classify(&no_payload),
            Err(GatewayError::Parse { .. })
        ));
    }

    #[test]
    fn test_token_mismatch_rejected() {
        let source = SlackSource::new(None, Some("expected".into()), Duration::from_secs(300));
        let request = request(
            "application/json",
            r#"{"type":"event_callback","token":"other","event":{}}"#,
        );
        assert!(matches!(
            source.classify(&request),
            Err(GatewayError::Verification { .. })
        ));
    }

    #[test]
    fn test_unknown_callback_type_acknowledged() {
        let request = request("application/json", r#"{"type":"app_rate_limited"}"#);
        assert_eq!(
            source().classify(&request).unwrap(),
            Classification::Acknowledged
        );
    }
}
