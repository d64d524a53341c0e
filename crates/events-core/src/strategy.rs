//! Strategy traits for the event gateway
//!
//! Each trait is a seam where an implementation can be swapped: production
//! code plugs in network transports, tests plug in recording doubles.
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     └── HealthCheck
//!
//! TransportFactory (builds per-subscriber clients)
//!     │
//!     └── EventTransport (sends one envelope to one subscriber)
//!             └── HttpTransport, NatsTransport, ...
//! ```

use crate::error::Result;
use crate::message::Envelope;
use crate::subscription::{HttpSubscription, NatsSubscription, Protocol};
use async_trait::async_trait;
use std::sync::Arc;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
///
/// Provides graceful startup and shutdown semantics.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    ///
    /// May be called even if start() failed.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check
    ///
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Transport Strategies
// ============================================================================

/// Client bound to a single subscriber destination
///
/// Implementations must be safe to call concurrently; the dispatch engine
/// shares one instance across every in-flight send to that subscriber.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Deliver one envelope
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Protocol this client speaks
    fn protocol(&self) -> Protocol;

    /// Destination, for logs
    fn destination(&self) -> String;
}

/// Builds transport clients from subscription entries
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build an HTTP client for the entry
    async fn http(&self, subscription: &HttpSubscription) -> Result<Arc<dyn EventTransport>>;

    /// Build a NATS client for the entry
    async fn nats(&self, subscription: &NatsSubscription) -> Result<Arc<dyn EventTransport>>;
}
