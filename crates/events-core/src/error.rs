//! Error types for the event gateway
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for gateway and controller operations
pub type Result<T> = std::result::Result<T, GatewayError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type shared by the gateway and the subscription controller
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Request arrived on a route that is not accepting traffic
    #[error("endpoint is inactive")]
    InactiveRoute { route: String },

    /// Request authenticity could not be established
    #[error("verification failed: {message}")]
    Verification { message: String },

    /// Request body could not be classified
    #[error("parse error: {message}")]
    Parse {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Payload could not be attached to an envelope
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// A transport client for one subscriber could not be built
    #[error("failed to create transport for subscriber {subscriber}: {message}")]
    TransportConstruction {
        subscriber: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Sending an envelope to one subscriber failed
    #[error("failed to send to subscriber {subscriber}: {message}")]
    TransportSend {
        subscriber: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Optimistic concurrency check failed on write
    #[error("conflict updating {namespace}/{name}: stored version {current}, write based on {attempted}")]
    StoreConflict {
        namespace: String,
        name: String,
        current: u64,
        attempted: u64,
    },

    /// Requested object does not exist
    #[error("{namespace}/{name} not found")]
    StoreNotFound { namespace: String, name: String },

    /// Store I/O failure
    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Consumer spec is malformed
    #[error("validation error: {message}")]
    Validation { message: String },

    /// NATS connection or messaging errors
    #[error("NATS error: {message}")]
    Nats {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation timeout
    #[error("Timeout: {operation} exceeded {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Retry limit exceeded
    #[error("Retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    /// Graceful shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create an inactive route error
    pub fn inactive(route: impl Into<String>) -> Self {
        Self::InactiveRoute {
            route: route.into(),
        }
    }

    /// Create a verification error
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a parse error with source
    pub fn parse_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Parse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create a transport construction error with source
    pub fn construction_with_source(
        subscriber: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransportConstruction {
            subscriber: subscriber.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport send error
    pub fn send(subscriber: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportSend {
            subscriber: subscriber.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport send error with source
    pub fn send_with_source(
        subscriber: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransportSend {
            subscriber: subscriber.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a not-found error
    pub fn not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::StoreNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a store error with source
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a NATS error with source
    pub fn nats_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Nats {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error with source
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Check if the error comes from a failed optimistic concurrency check
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StoreConflict { .. })
    }

    /// HTTP status reported to a webhook caller for this error
    ///
    /// Inactive routes are the caller's problem (400); everything else that can
    /// surface on the request path is reported as a server-side failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InactiveRoute { .. } => 400,
            Self::Shutdown => 503,
            _ => 500,
        }
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InactiveRoute { .. } => "inactive_route",
            Self::Verification { .. } => "verification",
            Self::Parse { .. } => "parse",
            Self::Encoding { .. } => "encoding",
            Self::TransportConstruction { .. } => "transport_construction",
            Self::TransportSend { .. } => "transport_send",
            Self::StoreConflict { .. } => "store_conflict",
            Self::StoreNotFound { .. } => "store_not_found",
            Self::Store { .. } => "store",
            Self::Validation { .. } => "validation",
            Self::Nats { .. } => "nats",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::Timeout { .. } => "timeout",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub consumer: Option<String>,
    pub subscription: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            consumer: None,
            subscription: None,
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref consumer) = self.consumer {
            write!(f, " consumer={}", consumer)?;
        }
        if let Some(ref subscription) = self.subscription {
            write!(f, " subscription={}", subscription)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                consumer = ?ctx.consumer,
                subscription = ?ctx.subscription,
                "Operation failed"
            );
            e
        })
    }
}
