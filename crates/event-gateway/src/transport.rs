//! Subscriber transports
//!
//! HTTP subscribers receive the envelope in CloudEvents binary mode: the raw
//! payload is the request body and the attributes travel as `ce-*` headers.
//! NATS subscribers receive the structured JSON envelope on their subject.

use async_trait::async_trait;
use events_core::config::DispatchConfig;
use events_core::error::{GatewayError, Result};
use events_core::message::Envelope;
use events_core::strategy::{EventTransport, TransportFactory};
use events_core::subscription::{HttpSubscription, NatsSubscription, Protocol, SubscriptionEntry};
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ============================================================================
// HTTP
// ============================================================================

/// HTTP subscriber client
pub struct HttpTransport {
    name: String,
    destination: String,
    url: url::Url,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Bind a client to the entry's URL
    ///
    /// `client` is cloned per subscriber; clones share one connection pool.
    pub fn new(subscription: &HttpSubscription, client: reqwest::Client) -> Result<Self> {
        let url = url::Url::parse(&subscription.url).map_err(|e| {
            GatewayError::construction_with_source(
                &subscription.name,
                format!("invalid URL {}", subscription.url),
                e,
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::TransportConstruction {
                subscriber: subscription.name.clone(),
                message: format!("unsupported scheme {}", url.scheme()),
                source: None,
            });
        }
        Ok(Self {
            name: subscription.name.clone(),
            destination: subscription.url.clone(),
            url,
            client,
        })
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, envelope.data_content_type.as_str())
            .body(envelope.data.clone());
        for (name, value) in envelope.binary_headers() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::send_with_source(&self.name, format!("POST {} failed", self.url), e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::send(
                &self.name,
                format!("{} responded with {}", self.url, status),
            ));
        }
        debug!(subscriber = %self.name, status = %status, "Delivered over HTTP");
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn destination(&self) -> String {
        self.destination.clone()
    }
}

// ============================================================================
// NATS
// ============================================================================

/// NATS subscriber client
pub struct NatsTransport {
    name: String,
    server_url: String,
    subject: String,
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connect to the entry's server
    pub async fn connect(subscription: &NatsSubscription, connect_timeout: Duration) -> Result<Self> {
        if subscription.subject.trim().is_empty() {
            return Err(GatewayError::TransportConstruction {
                subscriber: subscription.name.clone(),
                message: "subject must not be empty".to_string(),
                source: None,
            });
        }

        let client = async_nats::ConnectOptions::new()
            .name(format!("event-gateway/{}", subscription.name))
            .connection_timeout(connect_timeout)
            .connect(subscription.server_url.as_str())
            .await
            .map_err(|e| {
                GatewayError::construction_with_source(
                    &subscription.name,
                    format!("failed to connect to {}", subscription.server_url),
                    e,
                )
            })?;

        info!(
            subscriber = %subscription.name,
            server = %subscription.server_url,
            subject = %subscription.subject,
            "Connected NATS subscriber"
        );
        Ok(Self {
            name: subscription.name.clone(),
            server_url: subscription.server_url.clone(),
            subject: subscription.subject.clone(),
            client,
        })
    }
}

#[async_trait]
impl EventTransport for NatsTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.to_bytes().map_err(|e| {
            GatewayError::serialization_with_source("Failed to serialize envelope", e)
        })?;

        self.client
            .publish(self.subject.clone(), payload)
            .await
            .map_err(|e| {
                GatewayError::send_with_source(
                    &self.name,
                    format!("publish to {} failed", self.subject),
                    e,
                )
            })?;
        self.client.flush().await.map_err(|e| {
            GatewayError::nats_with_source(format!("flush to {} failed", self.server_url), e)
        })?;

        debug!(subscriber = %self.name, subject = %self.subject, "Delivered over NATS");
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Nats
    }

    fn destination(&self) -> String {
        NatsSubscription {
            name: self.name.clone(),
            server_url: self.server_url.clone(),
            subject: self.subject.clone(),
        }
        .destination()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds network transports
pub struct NetworkTransportFactory {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl NetworkTransportFactory {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.send_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            connect_timeout: config.connect_timeout,
        })
    }
}

#[async_trait]
impl TransportFactory for NetworkTransportFactory {
    async fn http(&self, subscription: &HttpSubscription) -> Result<Arc<dyn EventTransport>> {
        Ok(Arc::new(HttpTransport::new(subscription, self.http.clone())?))
    }

    async fn nats(&self, subscription: &NatsSubscription) -> Result<Arc<dyn EventTransport>> {
        Ok(Arc::new(
            NatsTransport::connect(subscription, self.connect_timeout).await?,
        ))
    }
}
