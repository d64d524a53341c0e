//! Subscription dispatch engine
//!
//! Keeps one transport client per subscriber name and protocol, built lazily
//! from the subscription record, and fans each envelope out to every
//! subscriber in the current snapshot of the record.
//!
//! Cache locks are held for a single lookup or insert; client construction
//! and sends happen outside them.

use events_core::config::DispatchConfig;
use events_core::error::{GatewayError, Result};
use events_core::message::Envelope;
use events_core::metrics::{GatewayMetrics, LatencyTimer};
use events_core::strategy::{EventTransport, TransportFactory};
use events_core::subscription::{Protocol, SubscriptionEntry, SubscriptionSpec};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

type ClientCache = RwLock<HashMap<String, Arc<dyn EventTransport>>>;

/// Aggregate result of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every subscriber in the snapshot accepted the envelope
    Success { delivered: usize },
    /// At least one subscriber could not be reached
    PartialFailure {
        delivered: usize,
        failed: Vec<String>,
    },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn delivered(&self) -> usize {
        match self {
            Self::Success { delivered } | Self::PartialFailure { delivered, .. } => *delivered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::PartialFailure { .. } => "partial_failure",
        }
    }
}

/// Summary of one refresh pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub created: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// Cached client counts
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub http_clients: usize,
    pub nats_clients: usize,
    pub http_subscribers: usize,
    pub nats_subscribers: usize,
}

/// Fan-out engine
pub struct DispatchEngine {
    config: DispatchConfig,
    factory: Arc<dyn TransportFactory>,
    http_clients: ClientCache,
    nats_clients: ClientCache,
    snapshot: RwLock<Arc<SubscriptionSpec>>,
    metrics: GatewayMetrics,
}

impl DispatchEngine {
    pub fn new(config: DispatchConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            factory,
            http_clients: RwLock::new(HashMap::new()),
            nats_clients: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(SubscriptionSpec::default())),
            metrics: GatewayMetrics::new("dispatch"),
        }
    }

    /// Adopt a new copy of the record and build clients for new entries
    ///
    /// Construction failures are logged and retried on the next refresh.
    /// Existing clients are left alone; with `evict_stale_clients` set, clients
    /// whose entry left the record or changed destination are dropped first.
    pub async fn refresh_subscribers(&self, spec: &SubscriptionSpec) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        if self.config.evict_stale_clients {
            summary.evicted += evict_stale(&self.http_clients, &spec.http).await;
            summary.evicted += evict_stale(&self.nats_clients, &spec.nats).await;
        }

        for entry in &spec.http {
            if self.cached(&self.http_clients, &entry.name).await.is_some() {
                continue;
            }
            let built = self.factory.http(entry).await;
            self.install(&self.http_clients, entry, built, &mut summary)
                .await;
        }
        for entry in &spec.nats {
            if self.cached(&self.nats_clients, &entry.name).await.is_some() {
                continue;
            }
            let built = self.factory.nats(entry).await;
            self.install(&self.nats_clients, entry, built, &mut summary)
                .await;
        }

        *self.snapshot.write().await = Arc::new(spec.clone());

        let stats = self.cache_stats().await;
        self.metrics
            .set_cached_clients(Protocol::Http.as_str(), stats.http_clients);
        self.metrics
            .set_cached_clients(Protocol::Nats.as_str(), stats.nats_clients);

        if summary != RefreshSummary::default() {
            info!(
                created = summary.created,
                failed = summary.failed,
                evicted = summary.evicted,
                "Refreshed subscriber clients"
            );
        }
        summary
    }

    async fn cached(&self, cache: &ClientCache, name: &str) -> Option<Arc<dyn EventTransport>> {
        cache.read().await.get(name).cloned()
    }

    async fn install<E: SubscriptionEntry>(
        &self,
        cache: &ClientCache,
        entry: &E,
        built: Result<Arc<dyn EventTransport>>,
        summary: &mut RefreshSummary,
    ) {
        match built {
            Ok(client) => {
                cache
                    .write()
                    .await
                    .entry(entry.name().to_string())
                    .or_insert(client);
                summary.created += 1;
                debug!(
                    subscriber = %entry.name(),
                    protocol = %E::PROTOCOL,
                    destination = %entry.destination(),
                    "Created subscriber client"
                );
            }
            Err(e) => {
                summary.failed += 1;
                warn!(
                    subscriber = %entry.name(),
                    protocol = %E::PROTOCOL,
                    destination = %entry.destination(),
                    error = %e,
                    "Failed to create subscriber client, will retry on next refresh"
                );
            }
        }
    }

    /// Send `envelope` to every subscriber in the current snapshot
    ///
    /// Only a malformed envelope fails the call; unreachable subscribers are
    /// reported through [`DispatchOutcome::PartialFailure`].
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchOutcome> {
        envelope.validate()?;
        let metrics = self.metrics.clone();
        let _timer = LatencyTimer::start(move |elapsed| metrics.record_dispatch_latency(elapsed));
        let snapshot = self.snapshot.read().await.clone();

        let mut targets = Vec::with_capacity(snapshot.len());
        for entry in &snapshot.http {
            let client = self.cached(&self.http_clients, &entry.name).await;
            targets.push((entry.name.clone(), Protocol::Http, client));
        }
        for entry in &snapshot.nats {
            let client = self.cached(&self.nats_clients, &entry.name).await;
            targets.push((entry.name.clone(), Protocol::Nats, client));
        }

        let sends = targets
            .into_iter()
            .map(|(name, protocol, client)| async move {
                let result = match client {
                    Some(client) => self.send_one(client.as_ref(), envelope, &name).await,
                    None => Err(GatewayError::send(&name, "no client available")),
                };
                (name, protocol, result)
            });

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (name, protocol, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        subscriber = %name,
                        protocol = %protocol,
                        event_id = %envelope.id,
                        error = %e,
                        "Failed to send event to subscriber"
                    );
                    self.metrics.record_send_failure(protocol.as_str());
                    failed.push(name);
                }
            }
        }

        let outcome = if failed.is_empty() {
            DispatchOutcome::Success { delivered }
        } else {
            DispatchOutcome::PartialFailure { delivered, failed }
        };
        self.metrics.record_dispatch(outcome.as_str());
        trace!(event_id = %envelope.id, outcome = outcome.as_str(), delivered, "Dispatched event");
        Ok(outcome)
    }

    async fn send_one(
        &self,
        client: &dyn EventTransport,
        envelope: &Envelope,
        name: &str,
    ) -> Result<()> {
        let timeout = self.config.send_timeout;
        match tokio::time::timeout(timeout, client.send(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(
                format!("send to {} ({})", name, client.destination()),
                timeout.as_millis() as u64,
            )),
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let snapshot = self.snapshot.read().await.clone();
        CacheStats {
            http_clients: self.http_clients.read().await.len(),
            nats_clients: self.nats_clients.read().await.len(),
            http_subscribers: snapshot.http.len(),
            nats_subscribers: snapshot.nats.len(),
        }
    }
}

/// Drop clients whose entry is gone or points elsewhere
async fn evict_stale<E: SubscriptionEntry>(cache: &ClientCache, entries: &[E]) -> usize {
    let wanted: HashMap<&str, String> = entries
        .iter()
        .map(|entry| (entry.name(), entry.destination()))
        .collect();

    let mut cache = cache.write().await;
    let stale: HashSet<String> = cache
        .iter()
        .filter(|(name, client)| {
            wanted
                .get(name.as_str())
                .map_or(true, |destination| *destination != client.destination())
        })
        .map(|(name, _)| name.clone())
        .collect();

    for name in &stale {
        cache.remove(name);
        debug!(subscriber = %name, protocol = %E::PROTOCOL, "Evicted subscriber client");
    }
    stale.len()
}
