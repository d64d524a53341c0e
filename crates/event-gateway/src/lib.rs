//! # Event Gateway
//!
//! Receives webhooks from external event sources, wraps each payload in a
//! CloudEvents envelope and fans it out to every subscriber listed in the
//! gateway's subscription record.
//!
//! ## Flow
//!
//! ```text
//! HTTP listener ──► Route ──data channel──► forwarder ──► event loop
//!                                                            │
//!                                   EventTransformer ◄───────┘
//!                                          │
//!                                   DispatchEngine ──► HTTP / NATS subscribers
//! ```
//!
//! The subscription record is re-read from the store on an interval and
//! handed to [`DispatchEngine::refresh_subscribers`].

pub mod admin_api;
pub mod dispatch;
pub mod route;
pub mod slack;
pub mod transform;
pub mod transport;
pub mod webhook;

pub use admin_api::*;
pub use dispatch::*;
pub use route::*;
pub use slack::*;
pub use transform::*;
pub use transport::*;
pub use webhook::*;

use bytes::Bytes;
use events_core::config::{GatewayConfig, RouteConfig, SourceType};
use events_core::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Gateway counters shared with the admin API
#[derive(Debug, Default)]
pub struct GatewayCounters {
    received: AtomicU64,
    dispatched: AtomicU64,
    partial_failures: AtomicU64,
    encoding_failures: AtomicU64,
}

impl GatewayCounters {
    pub fn snapshot(&self) -> GatewayStats {
        GatewayStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            partial_failures: self.partial_failures.load(Ordering::Relaxed),
            encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
        }
    }
}

/// Gateway statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewayStats {
    pub received: u64,
    pub dispatched: u64,
    pub partial_failures: u64,
    pub encoding_failures: u64,
}

/// Build the source for a route definition
pub fn source_for(config: &RouteConfig) -> Arc<dyn RouteSource> {
    match config.source_type {
        SourceType::Slack => Arc::new(SlackSource::from_config(config)),
        SourceType::Webhook => Arc::new(WebhookSource),
    }
}

/// Main gateway server
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<RouteRegistry>,
    data_channels: Mutex<Vec<(Arc<Route>, mpsc::Receiver<Bytes>)>>,
    transformer: Arc<EventTransformer>,
    engine: Arc<DispatchEngine>,
    store: Arc<dyn SubscriptionStore>,
    counters: Arc<GatewayCounters>,
    dispatches: TaskTracker,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Register every configured route
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn SubscriptionStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let mut registry = RouteRegistry::new();
        let mut data_channels = Vec::with_capacity(config.routes.len());
        for route_config in &config.routes {
            let (route, rx) = Route::new(route_config.clone(), source_for(route_config))?;
            registry.register(route.clone())?;
            data_channels.push((route, rx));
        }

        Ok(Self {
            transformer: Arc::new(EventTransformer::new(config.gateway.name.clone())),
            engine: Arc::new(DispatchEngine::new(config.dispatch.clone(), factory)),
            registry: Arc::new(registry),
            data_channels: Mutex::new(data_channels),
            store,
            counters: Arc::new(GatewayCounters::default()),
            dispatches: TaskTracker::new(),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    /// Get statistics
    pub fn stats(&self) -> GatewayStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Re-read the subscription record and refresh subscriber clients
    pub async fn refresh_from_store(&self) -> Result<RefreshSummary> {
        let source = &self.config.subscription;
        let record = self.store.get(&source.namespace, &source.name).await?;
        Ok(self.engine.refresh_subscribers(&record.spec).await)
    }

    /// Run the gateway until ctrl-c or [`Gateway::stop`]
    pub async fn run(&self) -> Result<()> {
        info!(
            gateway = %self.config.gateway.name,
            routes = self.registry.len(),
            "Starting event gateway"
        );
        self.running.store(true, Ordering::SeqCst);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Start admin API if enabled
        if self.config.admin.enabled {
            let state = AdminState {
                registry: self.registry.clone(),
                engine: self.engine.clone(),
                counters: self.counters.clone(),
            };
            let listen = self.config.admin.listen.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_admin_server(listen, state, shutdown).await {
                    error!(error = %e, "Admin API stopped");
                }
            }));
        }

        // Initial record read; a missing record just means no subscribers yet
        if let Err(e) = self.refresh_from_store().await {
            warn!(error = %e, "Initial subscription refresh failed");
        }

        // Data channels → event loop
        let (events_tx, mut events_rx) = mpsc::channel(self.config.gateway.event_buffer.max(1));
        for (route, rx) in self.data_channels.lock().await.drain(..) {
            tasks.push(spawn_forwarder(&route, rx, events_tx.clone()));
        }
        drop(events_tx);

        for port in self.registry.ports() {
            let registry = self.registry.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = serve_port(port, registry, shutdown).await {
                    error!(port, error = %e, "Webhook listener stopped");
                }
            }));
        }

        for route in self.registry.routes() {
            if route.config().activate_on_start {
                route.activate().await?;
            }
        }

        let mut refresh = tokio::time::interval(self.config.subscription.refresh_interval);
        refresh.tick().await;

        info!("Gateway started, waiting for events");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = self.shutdown.cancelled() => break,
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_from_store().await {
                        debug!(error = %e, "Subscription refresh failed");
                    }
                }
                event = events_rx.recv() => match event {
                    Some(event) => self.spawn_dispatch(event),
                    None => {
                        warn!("All routes closed");
                        break;
                    }
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        for route in self.registry.routes() {
            route.terminate().await;
        }

        // Payloads already acknowledged to their senders are still dispatched
        let mut drained = 0usize;
        while let Some(event) = events_rx.recv().await {
            self.spawn_dispatch(event);
            drained += 1;
        }
        if drained > 0 {
            info!(events = drained, "Dispatching events queued before shutdown");
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Gateway task panicked");
            }
        }
        self.dispatches.close();
        self.dispatches.wait().await;

        info!(stats = ?self.stats(), "Gateway stopped");
        Ok(())
    }

    fn spawn_dispatch(&self, event: GatewayEvent) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let transformer = self.transformer.clone();
        let engine = self.engine.clone();
        let counters = self.counters.clone();

        self.dispatches.spawn(async move {
            let source = event.name.clone();
            let envelope = match transformer.transform_event(event) {
                Ok(envelope) => envelope,
                Err(e) => {
                    counters.encoding_failures.fetch_add(1, Ordering::Relaxed);
                    error!(event_source = %source, error = %e, "Failed to build envelope");
                    return;
                }
            };

            match engine.dispatch(&envelope).await {
                Ok(outcome) => {
                    counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    match outcome {
                        DispatchOutcome::Success { delivered } => {
                            debug!(event_id = %envelope.id, event_source = %source, delivered, "Event dispatched");
                        }
                        DispatchOutcome::PartialFailure { delivered, failed } => {
                            counters.partial_failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                event_id = %envelope.id,
                                event_source = %source,
                                delivered,
                                failed = ?failed,
                                "Event dispatched with failures"
                            );
                        }
                    }
                }
                Err(e) => {
                    counters.encoding_failures.fetch_add(1, Ordering::Relaxed);
                    error!(event_id = %envelope.id, error = %e, "Failed to dispatch event");
                }
            }
        });
    }

    /// Stop the gateway
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::RecordingFactory;
    use axum::http::StatusCode;
    use events_core::store::InMemorySubscriptionStore;
    use events_core::subscription::Subscription;
    use std::time::Duration;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.admin.enabled = false;
        config.subscription.namespace = "ns".into();
        config.subscription.name = "subs".into();
        config
    }

    #[tokio::test]
    async fn test_refresh_from_store() {
        let store = Arc::new(InMemorySubscriptionStore::with_records([Subscription::new(
            "ns", "subs",
        )
        .with_http("a", "http://a/")
        .with_http("b", "http://b/")]));
        let factory = Arc::new(RecordingFactory::default());
        let gateway = Gateway::new(config(), store, factory).unwrap();

        let summary = gateway.refresh_from_store().await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(gateway.engine().cache_stats().await.http_subscribers, 2);
    }

    #[tokio::test]
    async fn test_missing_record_reported() {
        let gateway = Gateway::new(
            config(),
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(RecordingFactory::default()),
        )
        .unwrap();
        assert!(matches!(
            gateway.refresh_from_store().await,
            Err(GatewayError::StoreNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_routes_registered_from_config() {
        let mut config = config();
        let mut slack = RouteConfig::new("slack", SourceType::Slack, "/slack");
        slack.port = 12001;
        config.routes.push(slack);
        config
            .routes
            .push(RouteConfig::new("hooks", SourceType::Webhook, "/hooks"));

        let gateway = Gateway::new(
            config,
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(RecordingFactory::default()),
        )
        .unwrap();
        assert_eq!(gateway.registry().ports(), vec![12000, 12001]);
        assert_eq!(
            gateway.registry().by_name("slack").unwrap().source_type(),
            SourceType::Slack
        );
    }

    #[tokio::test]
    async fn test_event_flows_to_subscribers() {
        let store = Arc::new(InMemorySubscriptionStore::with_records([
            Subscription::new("ns", "subs").with_http("a", "http://a/"),
        ]));
        let factory = Arc::new(RecordingFactory::default());
        let gateway = Gateway::new(config(), store, factory.clone()).unwrap();
        gateway.refresh_from_store().await.unwrap();

        gateway.spawn_dispatch(GatewayEvent::new(
            "hooks",
            "webhook",
            Bytes::from_static(b"{}"),
        ));

        for _ in 0..50 {
            if gateway.stats().dispatched == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gateway.stats().dispatched, 1);
        assert_eq!(factory.total_sent(), 1);
    }

    #[tokio::test]
    async fn test_queued_payloads_dispatched_on_shutdown() {
        let store = Arc::new(InMemorySubscriptionStore::with_records([
            Subscription::new("ns", "subs").with_http("a", "http://a/"),
        ]));
        let factory = Arc::new(RecordingFactory::default());
        let mut config = config();
        let mut hooks = RouteConfig::new("hooks", SourceType::Webhook, "/hooks");
        hooks.port = 0;
        config.routes.push(hooks);
        let gateway = Gateway::new(config, store, factory.clone()).unwrap();

        let route = gateway.registry().by_name("hooks").unwrap();
        route.activate().await.unwrap();
        for _ in 0..10 {
            let response = route.handle_request(&crate::route::tests::post("payload")).await;
            assert_eq!(response.status, StatusCode::OK);
        }

        gateway.stop();
        gateway.run().await.unwrap();

        let stats = gateway.stats();
        assert_eq!(stats.received, 10);
        assert_eq!(stats.dispatched, 10);
        assert_eq!(factory.total_sent(), 10);
        assert!(!gateway.is_running());
    }
}
