//! # Events Core
//!
//! Core types, strategy traits, and utilities shared by the event gateway
//! and the subscription controller.
//!
//! ## Architecture
//!
//! ```text
//!  webhook ──► Route ──► Transformer ──► DispatchEngine ──► subscribers
//!                                              ▲
//!                                              │ reads
//!                                     ┌────────┴────────┐
//!                                     │ Subscription    │
//!                                     │ record (store)  │
//!                                     └────────▲────────┘
//!                                              │ writes
//!  consumer changes ──► WorkQueue ──► Reconciler
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod store;
pub mod strategy;
pub mod subscription;

pub use config::*;
pub use error::*;
pub use message::*;
pub use metrics::*;
pub use store::*;
pub use strategy::*;
pub use subscription::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::GatewayConfig;
    pub use crate::error::{GatewayError, Result};
    pub use crate::message::{Envelope, GatewayEvent};
    pub use crate::store::SubscriptionStore;
    pub use crate::strategy::{EventTransport, HealthCheck, Lifecycle, TransportFactory};
    pub use crate::subscription::{
        HttpSubscription, NatsSubscription, Protocol, Subscription, SubscriptionSpec,
    };
}
