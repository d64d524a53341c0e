//! Consumer model
//!
//! A consumer declares how it wants to receive events (HTTP, NATS or both)
//! and which subscription record each protocol's entry belongs in.

use events_core::config::ControllerConfig;
use events_core::error::{GatewayError, Result};
use events_core::store::check_record_segment;
use events_core::subscription::{HttpSubscription, NatsSubscription, SubscriptionRef};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// HTTP delivery settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProtocol {
    /// Port on the backing service, kept as text the way it is declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub subscription_ref: Option<SubscriptionRef>,
}

/// NATS delivery settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsProtocol {
    #[serde(rename = "serverURL")]
    pub server_url: String,
    pub subject: String,
    #[serde(default)]
    pub subscription_ref: Option<SubscriptionRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventProtocol {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsProtocol>,
}

/// Service fronting the consumer's HTTP server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ConsumerResources>,
}

/// An event consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub event_protocol: EventProtocol,
    #[serde(default)]
    pub status: ConsumerStatus,
}

impl Consumer {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_http(mut self, protocol: HttpProtocol) -> Self {
        self.event_protocol.http = Some(protocol);
        self
    }

    pub fn with_nats(mut self, protocol: NatsProtocol) -> Self {
        self.event_protocol.nats = Some(protocol);
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.status.resources = Some(ConsumerResources {
            service: Some(ServiceRef {
                name: name.into(),
                namespace: namespace.into(),
            }),
        });
        self
    }

    /// `namespace/name` key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn service(&self) -> Option<&ServiceRef> {
        self.status
            .resources
            .as_ref()
            .and_then(|resources| resources.service.as_ref())
    }

    /// Reject consumers that cannot be reconciled
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::validation("consumer name must not be empty"));
        }
        if self.namespace.trim().is_empty() {
            return Err(GatewayError::validation(format!(
                "consumer {}: namespace must not be empty",
                self.name
            )));
        }
        self.check_segment("namespace", &self.namespace)?;

        let protocol = &self.event_protocol;
        if protocol.http.is_none() && protocol.nats.is_none() {
            return Err(GatewayError::validation(format!(
                "consumer {}: no event protocol declared",
                self.key()
            )));
        }

        if let Some(http) = &protocol.http {
            self.check_ref("http", http.subscription_ref.as_ref())?;
            if let Some(endpoint) = http.endpoint.as_deref().filter(|e| !e.is_empty()) {
                if !endpoint.starts_with('/') {
                    return Err(GatewayError::validation(format!(
                        "consumer {}: endpoint {} must start with '/'",
                        self.key(),
                        endpoint
                    )));
                }
            }
            if let Some(port) = http.port.as_deref().filter(|p| !p.is_empty()) {
                parse_port(port).ok_or_else(|| {
                    GatewayError::validation(format!(
                        "consumer {}: invalid port {}",
                        self.key(),
                        port
                    ))
                })?;
            }
        }

        if let Some(nats) = &protocol.nats {
            self.check_ref("nats", nats.subscription_ref.as_ref())?;
            if nats.server_url.trim().is_empty() || nats.subject.trim().is_empty() {
                return Err(GatewayError::validation(format!(
                    "consumer {}: nats protocol needs a server URL and a subject",
                    self.key()
                )));
            }
        }
        Ok(())
    }

    fn check_ref(&self, protocol: &str, reference: Option<&SubscriptionRef>) -> Result<()> {
        let reference = match reference {
            Some(reference) if !reference.name.trim().is_empty() => reference,
            _ => {
                return Err(GatewayError::validation(format!(
                    "consumer {}: {} protocol has no subscription reference",
                    self.key(),
                    protocol
                )))
            }
        };
        self.check_segment(&format!("{} subscription reference name", protocol), &reference.name)?;
        if let Some(namespace) = reference.namespace.as_deref().filter(|n| !n.is_empty()) {
            self.check_segment(&format!("{} subscription reference namespace", protocol), namespace)?;
        }
        Ok(())
    }

    /// Namespaces and record names become store path segments
    fn check_segment(&self, field: &str, value: &str) -> Result<()> {
        check_record_segment(&format!("consumer {}: {}", self.key(), field), value)
    }

    /// Desired HTTP entry and the record it belongs in
    ///
    /// `None` when the consumer has no HTTP protocol or its backing service
    /// does not exist yet.
    pub fn http_entry(&self, defaults: &ControllerConfig) -> Option<(RecordLocation, HttpSubscription)> {
        let http = self.event_protocol.http.as_ref()?;
        let service = self.service()?;
        let location = RecordLocation::resolve(http.subscription_ref.as_ref()?, &self.namespace);

        let port = http
            .port
            .as_deref()
            .and_then(parse_port)
            .unwrap_or(defaults.default_port);
        let endpoint = http
            .endpoint
            .as_deref()
            .filter(|endpoint| !endpoint.is_empty())
            .unwrap_or(defaults.default_endpoint.as_str());

        let url = format!(
            "http://{}.{}.{}:{}{}",
            service.name, service.namespace, defaults.dns_suffix, port, endpoint
        );
        Some((
            location,
            HttpSubscription {
                name: self.name.clone(),
                url,
            },
        ))
    }

    /// Desired NATS entry and the record it belongs in
    pub fn nats_entry(&self) -> Option<(RecordLocation, NatsSubscription)> {
        let nats = self.event_protocol.nats.as_ref()?;
        let location = RecordLocation::resolve(nats.subscription_ref.as_ref()?, &self.namespace);
        Some((
            location,
            NatsSubscription {
                name: self.name.clone(),
                server_url: nats.server_url.clone(),
                subject: nats.subject.clone(),
            },
        ))
    }

    /// Record holding this consumer's HTTP entry, whether or not the service exists
    pub fn http_record(&self) -> Option<RecordLocation> {
        let reference = self.event_protocol.http.as_ref()?.subscription_ref.as_ref()?;
        Some(RecordLocation::resolve(reference, &self.namespace))
    }

    /// Record holding this consumer's NATS entry
    pub fn nats_record(&self) -> Option<RecordLocation> {
        let reference = self.event_protocol.nats.as_ref()?.subscription_ref.as_ref()?;
        Some(RecordLocation::resolve(reference, &self.namespace))
    }
}

fn parse_port(port: &str) -> Option<u16> {
    port.trim().parse::<u16>().ok().filter(|port| *port != 0)
}

/// Namespace and name of a subscription record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocation {
    pub namespace: String,
    pub name: String,
}

impl RecordLocation {
    fn resolve(reference: &SubscriptionRef, default_namespace: &str) -> Self {
        Self {
            namespace: reference.resolve_namespace(default_namespace).to_string(),
            name: reference.name.clone(),
        }
    }
}

impl fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ============================================================================
// Change notifications
// ============================================================================

/// Kind of change observed on a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
    Other(String),
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Other(kind) => kind,
        }
    }
}

impl FromStr for ChangeKind {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "ADD" => Self::Add,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Other(s.to_string()),
        })
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChangeKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str().to_ascii_uppercase())
    }
}

impl<'de> Deserialize<'de> for ChangeKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        Ok(ChangeKind::from_str(&kind).unwrap_or_else(|never| match never {}))
    }
}

/// One observed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerChange {
    pub kind: ChangeKind,
    pub consumer: Consumer,
}

impl ConsumerChange {
    pub fn new(kind: ChangeKind, consumer: Consumer) -> Self {
        Self { kind, consumer }
    }

    /// Work queue key
    pub fn key(&self) -> String {
        self.consumer.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_consumer() -> Consumer {
        Consumer::new("team", "x")
            .with_http(HttpProtocol {
                subscription_ref: Some(SubscriptionRef::new("subs")),
                ..Default::default()
            })
            .with_service("x-svc", "team")
    }

    #[test]
    fn test_http_url_uses_defaults() {
        let (location, entry) = http_consumer()
            .http_entry(&ControllerConfig::default())
            .unwrap();
        assert_eq!(entry.url, "http://x-svc.team.svc.cluster.local:9300/");
        assert_eq!(entry.name, "x");
        assert_eq!(location.to_string(), "team/subs");
    }

    #[test]
    fn test_http_url_uses_declared_port_and_endpoint() {
        let mut consumer = http_consumer();
        if let Some(http) = consumer.event_protocol.http.as_mut() {
            http.port = Some("8080".into());
            http.endpoint = Some("/events".into());
        }
        let (_, entry) = consumer.http_entry(&ControllerConfig::default()).unwrap();
        assert_eq!(entry.url, "http://x-svc.team.svc.cluster.local:8080/events");
    }

    #[test]
    fn test_http_entry_waits_for_service() {
        let mut consumer = http_consumer();
        consumer.status = ConsumerStatus::default();
        assert!(consumer.http_entry(&ControllerConfig::default()).is_none());
        assert!(consumer.http_record().is_some());
    }

    #[test]
    fn test_validation_rules() {
        assert!(http_consumer().validate().is_ok());

        assert!(Consumer::new("team", "x").validate().is_err());
        assert!(Consumer::new("", "x").validate().is_err());

        let mut bad_endpoint = http_consumer();
        bad_endpoint.event_protocol.http.as_mut().unwrap().endpoint = Some("events".into());
        assert!(bad_endpoint.validate().is_err());

        let mut bad_port = http_consumer();
        bad_port.event_protocol.http.as_mut().unwrap().port = Some("0".into());
        assert!(bad_port.validate().is_err());

        let no_ref = Consumer::new("team", "x").with_http(HttpProtocol::default());
        assert!(no_ref.validate().is_err());

        let escaping_ref = Consumer::new("team", "x").with_nats(NatsProtocol {
            server_url: "nats://n:4222".into(),
            subject: "s".into(),
            subscription_ref: Some(SubscriptionRef {
                name: "../../outside".into(),
                namespace: None,
            }),
        });
        assert!(escaping_ref.validate().is_err());

        let escaping_namespace = Consumer::new("team", "x").with_nats(NatsProtocol {
            server_url: "nats://n:4222".into(),
            subject: "s".into(),
            subscription_ref: Some(SubscriptionRef {
                name: "subs".into(),
                namespace: Some("..".into()),
            }),
        });
        assert!(escaping_namespace.validate().is_err());

        assert!(Consumer::new("a/b", "x").validate().is_err());

        let no_subject = Consumer::new("team", "x").with_nats(NatsProtocol {
            server_url: "nats://n:4222".into(),
            subject: String::new(),
            subscription_ref: Some(SubscriptionRef::new("subs")),
        });
        assert!(matches!(
            no_subject.validate(),
            Err(GatewayError::Validation { .. })
        ));
    }

    #[test]
    fn test_change_notification_json() {
        let change: ConsumerChange = serde_json::from_str(
            r#"{"kind":"DELETE","consumer":{"name":"x","namespace":"team",
                "eventProtocol":{"nats":{"serverURL":"nats://n:4222","subject":"s",
                "subscriptionRef":{"name":"subs","namespace":"shared"}}}}}"#,
        )
        .unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        assert_eq!(change.key(), "team/x");
        let (location, entry) = change.consumer.nats_entry().unwrap();
        assert_eq!(location.to_string(), "shared/subs");
        assert_eq!(entry.subject, "s");
    }

    #[test]
    fn test_unknown_change_kind_preserved() {
        let kind: ChangeKind = "RESYNC".parse().unwrap();
        assert_eq!(kind, ChangeKind::Other("RESYNC".into()));
        assert_eq!("update".parse::<ChangeKind>().unwrap(), ChangeKind::Update);
    }
}
