//! Webhook routes and their lifecycle
//!
//! A route binds an event source to an `(port, endpoint)` pair. Requests are
//! verified and classified by the route's [`RouteSource`]; event payloads are
//! placed on the route's bounded data channel, which a forwarder task drains
//! into the gateway's event loop.
//!
//! ```text
//! RegisteredInactive ──activate──► Active ◄──activate── Inactive
//!                                    │                     ▲
//!                                    └─────deactivate──────┘
//!        any state ──terminate──► Terminated
//! ```

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use events_core::config::{RouteConfig, SourceType};
use events_core::error::{GatewayError, Result};
use events_core::message::GatewayEvent;
use events_core::metrics::GatewayMetrics;
use events_core::strategy::HealthCheck;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// Route state
// ============================================================================

/// Lifecycle state of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    RegisteredInactive,
    Active,
    Inactive,
    Terminated,
}

impl RouteState {
    fn as_u8(self) -> u8 {
        match self {
            Self::RegisteredInactive => 0,
            Self::Active => 1,
            Self::Inactive => 2,
            Self::Terminated => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Active,
            2 => Self::Inactive,
            3 => Self::Terminated,
            _ => Self::RegisteredInactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisteredInactive => "registered_inactive",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests, classification and responses
// ============================================================================

/// Inbound webhook request, body fully buffered
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn new(method: Method, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            headers,
            body,
        }
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Media type of the body without parameters
    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }
}

/// What a request body turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Handshake; the token is echoed to the caller and nothing is queued
    Challenge(String),
    /// Structured interaction payload
    Interaction(Bytes),
    /// Generic event payload
    Event(Bytes),
    /// Well-formed but carries nothing to forward
    Acknowledged,
}

/// Source-specific request handling behind a route
#[async_trait]
pub trait RouteSource: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Establish request authenticity; must not have side effects
    fn verify(&self, request: &WebhookRequest) -> Result<()>;

    /// Classify the body into exactly one payload kind
    fn classify(&self, request: &WebhookRequest) -> Result<Classification>;

    /// Runs after the route becomes active
    async fn post_activate(&self) -> Result<()> {
        Ok(())
    }

    /// Runs after the route stops accepting traffic
    async fn post_inactivate(&self) -> Result<()> {
        Ok(())
    }
}

/// Response written back to the webhook caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookResponse {
    pub fn success() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/plain; charset=utf-8",
            body: "success".to_string(),
        }
    }

    /// Challenge token echoed verbatim
    pub fn challenge(token: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text",
            body: token,
        }
    }

    pub fn error(err: &GatewayError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            content_type: "text/plain; charset=utf-8",
            body: err.to_string(),
        }
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type))],
            self.body,
        )
            .into_response()
    }
}

// ============================================================================
// Route
// ============================================================================

/// Route counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RouteStats {
    pub received: u64,
    pub rejected: u64,
    pub enqueued: u64,
}

/// A webhook route
pub struct Route {
    config: RouteConfig,
    method: Method,
    source: Arc<dyn RouteSource>,
    state: AtomicU8,
    sender: RwLock<Option<mpsc::Sender<Bytes>>>,
    metrics: GatewayMetrics,
    received: AtomicU64,
    rejected: AtomicU64,
    enqueued: AtomicU64,
}

impl Route {
    /// Create a route in the `RegisteredInactive` state
    ///
    /// Returns the receiving half of the route's data channel.
    pub fn new(
        config: RouteConfig,
        source: Arc<dyn RouteSource>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Bytes>)> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::config(format!("invalid method {}", config.method)))?;
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        let route = Arc::new(Self {
            method,
            source,
            state: AtomicU8::new(RouteState::RegisteredInactive.as_u8()),
            sender: RwLock::new(Some(tx)),
            metrics: GatewayMetrics::new("route"),
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            config,
        });
        Ok((route, rx))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn source_type(&self) -> SourceType {
        self.source.source_type()
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn state(&self) -> RouteState {
        RouteState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> RouteStats {
        RouteStats {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
        }
    }

    /// Whether requests with `method` are routed here
    pub fn accepts(&self, method: &Method) -> bool {
        &self.method == method
    }

    /// Move to `Active`
    ///
    /// Returns `false` if the route was already active.
    pub async fn activate(&self) -> Result<bool> {
        let changed = self.transition(RouteState::Active, |state| {
            matches!(state, RouteState::RegisteredInactive | RouteState::Inactive)
        })?;
        if changed {
            info!(route = %self.name(), endpoint = %self.endpoint(), port = self.port(), "Route activated");
            self.metrics.set_route_active(self.name(), true);
            if let Err(e) = self.source.post_activate().await {
                error!(route = %self.name(), error = %e, "Post-activate hook failed");
            }
        }
        Ok(changed)
    }

    /// Move to `Inactive`; the route keeps existing but rejects traffic
    ///
    /// Payloads already on the data channel are still forwarded.
    pub async fn deactivate(&self) -> Result<bool> {
        let changed = self.transition(RouteState::Inactive, |state| state == RouteState::Active)?;
        if changed {
            info!(route = %self.name(), "Route deactivated");
            self.metrics.set_route_active(self.name(), false);
            if let Err(e) = self.source.post_inactivate().await {
                error!(route = %self.name(), error = %e, "Post-inactivate hook failed");
            }
        }
        Ok(changed)
    }

    /// Move to `Terminated` and close the data channel
    pub async fn terminate(&self) {
        let previous = RouteState::from_u8(
            self.state
                .swap(RouteState::Terminated.as_u8(), Ordering::SeqCst),
        );
        if previous == RouteState::Terminated {
            return;
        }
        self.sender.write().await.take();
        self.metrics.set_route_active(self.name(), false);
        if previous == RouteState::Active {
            if let Err(e) = self.source.post_inactivate().await {
                error!(route = %self.name(), error = %e, "Post-inactivate hook failed");
            }
        }
        info!(route = %self.name(), "Route terminated");
    }

    fn transition(&self, target: RouteState, allowed: impl Fn(RouteState) -> bool) -> Result<bool> {
        let result = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                allowed(RouteState::from_u8(current)).then_some(target.as_u8())
            });
        match result {
            Ok(_) => Ok(true),
            Err(current) => match RouteState::from_u8(current) {
                RouteState::Terminated => Err(GatewayError::Internal(format!(
                    "route {} is terminated",
                    self.name()
                ))),
                _ => Ok(false),
            },
        }
    }

    /// Handle one webhook request
    ///
    /// Always produces exactly one response.
    pub async fn handle_request(&self, request: &WebhookRequest) -> WebhookResponse {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_request(self.name());
        debug!(route = %self.name(), method = %request.method, "Request received");

        match self.process(request).await {
            Ok(response) => response,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_rejected(self.name(), e.kind());
                match e {
                    GatewayError::InactiveRoute { .. } => {
                        warn!(route = %self.name(), "Endpoint is not active, rejecting request")
                    }
                    _ => error!(route = %self.name(), error = %e, "Failed to process request"),
                }
                WebhookResponse::error(&e)
            }
        }
    }

    async fn process(&self, request: &WebhookRequest) -> Result<WebhookResponse> {
        if self.state() != RouteState::Active {
            return Err(GatewayError::inactive(self.name()));
        }

        self.source.verify(request)?;

        let payload = match self.source.classify(request)? {
            Classification::Challenge(token) => {
                debug!(route = %self.name(), "Answering challenge");
                return Ok(WebhookResponse::challenge(token));
            }
            Classification::Acknowledged => return Ok(WebhookResponse::success()),
            Classification::Interaction(payload) | Classification::Event(payload) => payload,
        };

        // Lock is released before waiting on channel capacity
        let sender = self.sender.read().await.clone();
        let sender = sender.ok_or_else(|| GatewayError::inactive(self.name()))?;
        sender
            .send(payload)
            .await
            .map_err(|_| GatewayError::inactive(self.name()))?;

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_enqueued(self.name());
        debug!(route = %self.name(), "Payload queued on data channel");
        Ok(WebhookResponse::success())
    }
}

/// Drain a route's data channel into the gateway event loop
///
/// Ends when the route is terminated or the event loop goes away.
pub fn spawn_forwarder(
    route: &Route,
    mut data: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<GatewayEvent>,
) -> JoinHandle<()> {
    let name = route.name().to_string();
    let source_type = route.source_type().as_str();
    tokio::spawn(async move {
        while let Some(payload) = data.recv().await {
            let event = GatewayEvent::new(name.clone(), source_type, payload);
            if events.send(event).await.is_err() {
                warn!(route = %name, "Event loop closed, stopping forwarder");
                return;
            }
        }
        debug!(route = %name, "Data channel closed");
    })
}

// ============================================================================
// Registry
// ============================================================================

/// Routes keyed by `(port, endpoint)`
#[derive(Default)]
pub struct RouteRegistry {
    routes: HashMap<(u16, String), Arc<Route>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; endpoints must be unique per port
    pub fn register(&mut self, route: Arc<Route>) -> Result<()> {
        if self.by_name(route.name()).is_some() {
            return Err(GatewayError::config(format!(
                "route {} registered twice",
                route.name()
            )));
        }
        let key = (route.port(), route.endpoint().to_string());
        if self.routes.contains_key(&key) {
            return Err(GatewayError::config(format!(
                "endpoint {} already registered on port {}",
                key.1, key.0
            )));
        }
        self.routes.insert(key, route);
        Ok(())
    }

    /// Route serving `path` on `port`
    pub fn lookup(&self, port: u16, path: &str) -> Option<Arc<Route>> {
        self.routes.get(&(port, path.to_string())).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.values().find(|route| route.name() == name).cloned()
    }

    /// Distinct listener ports
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.routes.keys().map(|(port, _)| *port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Ready once at least one route accepts events
#[async_trait]
impl HealthCheck for RouteRegistry {
    async fn health_check(&self) -> Result<()> {
        if self.routes().any(|route| route.state() == RouteState::Active) {
            Ok(())
        } else {
            Err(GatewayError::Internal("no active routes".to_string()))
        }
    }

    fn component_name(&self) -> &'static str {
        "route_registry"
    }
}
