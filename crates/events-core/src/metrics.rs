//! Metrics for the event gateway
//!
//! Provides Prometheus-compatible metrics for observability.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Route metrics
    pub const ROUTE_REQUESTS_TOTAL: &str = "event_gateway_route_requests_total";
    pub const ROUTE_REJECTED_TOTAL: &str = "event_gateway_route_rejected_total";
    pub const ROUTE_ENQUEUED_TOTAL: &str = "event_gateway_route_enqueued_total";
    pub const ROUTE_ACTIVE: &str = "event_gateway_route_active";

    // Dispatch metrics
    pub const DISPATCH_TOTAL: &str = "event_gateway_dispatch_total";
    pub const DISPATCH_LATENCY: &str = "event_gateway_dispatch_latency_seconds";
    pub const SEND_FAILURES_TOTAL: &str = "event_gateway_send_failures_total";
    pub const CLIENTS_CACHED: &str = "event_gateway_clients_cached";

    // Controller metrics
    pub const RECONCILE_TOTAL: &str = "subscription_controller_reconcile_total";
    pub const STORE_WRITES_TOTAL: &str = "subscription_controller_store_writes_total";
    pub const STORE_CONFLICTS_TOTAL: &str = "subscription_controller_store_conflicts_total";
    pub const QUEUE_DEPTH: &str = "subscription_controller_queue_depth";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const ROUTE: &str = "route";
    pub const REASON: &str = "reason";
    pub const PROTOCOL: &str = "protocol";
    pub const OUTCOME: &str = "outcome";
    pub const KIND: &str = "kind";
}

/// Gateway metrics
#[derive(Clone)]
pub struct GatewayMetrics {
    component: String,
}

impl GatewayMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record an inbound request on a route
    pub fn record_request(&self, route: &str) {
        counter!(
            names::ROUTE_REQUESTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ROUTE => route.to_string(),
        )
        .increment(1);
    }

    /// Record a rejected request
    pub fn record_rejected(&self, route: &str, reason: &str) {
        counter!(
            names::ROUTE_REJECTED_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ROUTE => route.to_string(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Record a payload placed on a route's data channel
    pub fn record_enqueued(&self, route: &str) {
        counter!(
            names::ROUTE_ENQUEUED_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ROUTE => route.to_string(),
        )
        .increment(1);
    }

    /// Set route activity (1 = active, 0 = not)
    pub fn set_route_active(&self, route: &str, active: bool) {
        gauge!(
            names::ROUTE_ACTIVE,
            labels::ROUTE => route.to_string(),
        )
        .set(if active { 1.0 } else { 0.0 });
    }

    /// Record the aggregate outcome of one dispatch
    pub fn record_dispatch(&self, outcome: &str) {
        counter!(
            names::DISPATCH_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Record dispatch latency
    pub fn record_dispatch_latency(&self, duration: Duration) {
        histogram!(
            names::DISPATCH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record one failed subscriber send
    pub fn record_send_failure(&self, protocol: &str) {
        counter!(
            names::SEND_FAILURES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::PROTOCOL => protocol.to_string(),
        )
        .increment(1);
    }

    /// Set cached client count for a protocol
    pub fn set_cached_clients(&self, protocol: &str, count: usize) {
        gauge!(
            names::CLIENTS_CACHED,
            labels::PROTOCOL => protocol.to_string(),
        )
        .set(count as f64);
    }
}

/// Controller metrics
#[derive(Clone)]
pub struct ControllerMetrics {
    component: String,
}

impl ControllerMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record a reconciliation outcome
    pub fn record_reconcile(&self, kind: &str, outcome: &str) {
        counter!(
            names::RECONCILE_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::KIND => kind.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Record a store write
    pub fn record_store_write(&self, protocol: &str) {
        counter!(
            names::STORE_WRITES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::PROTOCOL => protocol.to_string(),
        )
        .increment(1);
    }

    /// Record an optimistic concurrency conflict
    pub fn record_conflict(&self) {
        counter!(
            names::STORE_CONFLICTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Set pending notification count
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::COMPONENT => self.component.clone(),
        )
        .set(depth as f64);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
