//! Configuration types for the event gateway and subscription controller
//!
//! Uses the `config` crate for layered configuration from files and environment.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Root configuration shared by both binaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway identity and event loop
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Webhook routes served by the gateway
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Fan-out configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Subscription record the gateway reads
    #[serde(default)]
    pub subscription: SubscriptionSourceConfig,

    /// Record storage shared by gateway and controller
    #[serde(default)]
    pub store: StoreConfig,

    /// Reconciliation controller configuration
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminApiConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Gateway
// ============================================================================

/// Gateway identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Gateway name, used as the envelope `source`
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Capacity of the channel between route forwarders and the dispatch loop
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_gateway_name() -> String {
    "event-gateway".to_string()
}

fn default_event_buffer() -> usize {
    256
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Kind of event source behind a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Slack Events API and interactive components
    Slack,
    /// Plain webhook, body forwarded as-is
    Webhook,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Webhook => "webhook",
        }
    }
}

/// One webhook route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Event source name
    pub name: String,

    #[serde(default = "default_source_type")]
    pub source_type: SourceType,

    /// HTTP path, e.g. `/slack`
    pub endpoint: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_route_port")]
    pub port: u16,

    /// Capacity of the route's data channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Shared secret for request signatures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,

    /// Verification token expected in request bodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Maximum age of a signed request
    #[serde(with = "humantime_serde", default = "default_signature_tolerance")]
    pub signature_tolerance: Duration,

    /// Activate the route as soon as it is registered
    #[serde(default = "default_true")]
    pub activate_on_start: bool,
}

fn default_source_type() -> SourceType {
    SourceType::Webhook
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_route_port() -> u16 {
    12000
}

fn default_channel_capacity() -> usize {
    16
}

fn default_signature_tolerance() -> Duration {
    Duration::from_secs(5 * 60)
}

impl RouteConfig {
    pub fn new(name: impl Into<String>, source_type: SourceType, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type,
            endpoint: endpoint.into(),
            method: default_method(),
            port: default_route_port(),
            channel_capacity: default_channel_capacity(),
            signing_secret: None,
            token: None,
            signature_tolerance: default_signature_tolerance(),
            activate_on_start: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::config("route name must not be empty"));
        }
        if !self.endpoint.starts_with('/') {
            return Err(GatewayError::config(format!(
                "route {}: endpoint {} must start with '/'",
                self.name, self.endpoint
            )));
        }
        if !matches!(self.method.to_ascii_uppercase().as_str(), "GET" | "POST" | "PUT") {
            return Err(GatewayError::config(format!(
                "route {}: unsupported method {}",
                self.name, self.method
            )));
        }
        if self.channel_capacity == 0 {
            return Err(GatewayError::config(format!(
                "route {}: channel_capacity must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on a single subscriber send
    #[serde(with = "humantime_serde", default = "default_send_timeout")]
    pub send_timeout: Duration,

    /// Connection timeout for HTTP subscriber clients
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Drop cached clients whose subscriber left the record
    #[serde(default)]
    pub evict_stale_clients: bool,
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout: default_send_timeout(),
            connect_timeout: default_connect_timeout(),
            evict_stale_clients: false,
        }
    }
}

// ============================================================================
// Subscription record
// ============================================================================

/// Record observed by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSourceConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_subscription_name")]
    pub name: String,

    /// How often the gateway re-reads the record
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub refresh_interval: Duration,
}

fn default_namespace() -> String {
    "argo-events".to_string()
}

fn default_subscription_name() -> String {
    "default".to_string()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for SubscriptionSourceConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            name: default_subscription_name(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// Storage location of subscription records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

fn default_store_dir() -> String {
    "/var/lib/event-gateway/subscriptions".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Reconciliation controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Size of the worker pool draining the work queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Consumer HTTP port when the consumer does not declare one
    #[serde(default = "default_consumer_port")]
    pub default_port: u16,

    /// Consumer HTTP path when the consumer does not declare one
    #[serde(default = "default_consumer_endpoint")]
    pub default_endpoint: String,

    /// Suffix appended to `{service}.{namespace}` to form a host name
    #[serde(default = "default_dns_suffix")]
    pub dns_suffix: String,

    /// Retry policy for store conflicts
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_workers() -> usize {
    2
}

fn default_consumer_port() -> u16 {
    9300
}

fn default_consumer_endpoint() -> String {
    "/".to_string()
}

fn default_dns_suffix() -> String {
    "svc.cluster.local".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_port: default_consumer_port(),
            default_endpoint: default_consumer_endpoint(),
            dns_suffix: default_dns_suffix(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Maximum backoff delay
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

// ============================================================================
// Admin and observability
// ============================================================================

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApiConfig {
    /// Enable admin API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

fn default_admin_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for AdminApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl GatewayConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix EVENT_GATEWAY_
        builder = builder.add_source(
            config::Environment::with_prefix("EVENT_GATEWAY")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Check cross-field constraints the type system does not enforce
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut endpoints = HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !names.insert(route.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "duplicate route name {}",
                    route.name
                )));
            }
            if !endpoints.insert((route.port, route.endpoint.as_str())) {
                return Err(GatewayError::config(format!(
                    "endpoint {} registered twice on port {}",
                    route.endpoint, route.port
                )));
            }
        }
        let durations = [
            ("subscription.refresh_interval", self.subscription.refresh_interval),
            ("dispatch.send_timeout", self.dispatch.send_timeout),
            ("dispatch.connect_timeout", self.dispatch.connect_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(GatewayError::config(format!("{} must be positive", field)));
            }
        }
        if self.controller.workers == 0 {
            return Err(GatewayError::config("controller.workers must be positive"));
        }
        let retry = &self.controller.retry;
        if retry.max_attempts == 0 {
            return Err(GatewayError::config(
                "controller.retry.max_attempts must be positive",
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(GatewayError::config(format!(
                "controller.retry.multiplier must be a finite value >= 1.0, got {}",
                retry.multiplier
            )));
        }
        Ok(())
    }
}
