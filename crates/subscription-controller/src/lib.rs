//! # Subscription Controller
//!
//! Watches consumer changes and keeps subscription records in step with
//! them, so gateways pick up new, moved and removed subscribers on their
//! next refresh.
//!
//! ## Components
//!
//! - `WorkQueue`: per-consumer ordering, cross-consumer concurrency
//! - `Reconciler`: read-modify-write of subscription records with conflict retry
//! - `Controller`: worker pool draining the queue into the reconciler

pub mod consumer;
pub mod queue;
pub mod reconciler;
pub mod retry;

pub use consumer::*;
pub use queue::*;
pub use reconciler::*;
pub use retry::*;

use events_core::config::ControllerConfig;
use events_core::metrics::ControllerMetrics;
use events_core::prelude::*;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Controller statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ControllerStats {
    pub submitted: u64,
    pub reconciled: u64,
    pub failed: u64,
    pub writes: u64,
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    reconciled: AtomicU64,
    failed: AtomicU64,
    writes: AtomicU64,
    conflicts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ControllerStats {
        ControllerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Main controller orchestrator
pub struct Controller {
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    workers: usize,
    counters: Arc<Counters>,
    metrics: ControllerMetrics,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Controller {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: ControllerConfig) -> Self {
        let workers = config.workers.max(1);
        Self::with_reconciler(Reconciler::new(store, config), workers)
    }

    pub fn with_reconciler(reconciler: Reconciler, workers: usize) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            reconciler: Arc::new(reconciler),
            workers: workers.max(1),
            counters: Arc::new(Counters::default()),
            metrics: ControllerMetrics::new("controller"),
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Queue a consumer change
    pub async fn submit(&self, change: ConsumerChange) -> Result<()> {
        let key = change.key();
        if !self.queue.push(change).await {
            return Err(GatewayError::Shutdown);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let depth = self.queue.depth().await;
        self.metrics.set_queue_depth(depth);
        debug!(consumer = %key, depth, "Queued consumer change");
        Ok(())
    }

    pub fn stats(&self) -> ControllerStats {
        self.counters.snapshot()
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }
}

#[async_trait]
impl Lifecycle for Controller {
    /// Spawn the worker pool
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(workers = self.workers, "Starting subscription controller");

        let mut handles = self.handles.lock().await;
        for id in 0..self.workers {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            let counters = self.counters.clone();
            let metrics = self.metrics.clone();
            handles.push(tokio::spawn(async move {
                run_worker(id, queue, reconciler, counters, metrics).await;
            }));
        }
        Ok(())
    }

    /// Stop accepting changes, finish queued ones and wait for the workers
    async fn stop(&self) -> Result<()> {
        self.queue.close().await;
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let mut panicked = 0;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Controller worker panicked");
                panicked += 1;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!(stats = ?self.stats(), "Subscription controller stopped");
        if panicked > 0 {
            return Err(GatewayError::Internal(format!(
                "{} controller workers panicked",
                panicked
            )));
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    counters: Arc<Counters>,
    metrics: ControllerMetrics,
) {
    debug!(worker = id, "Worker started");
    while let Some(lease) = queue.pop().await {
        let Lease { key, change } = lease;
        match reconciler
            .on_consumer_changed(&change.consumer, &change.kind)
            .await
        {
            Ok(report) => {
                counters.reconciled.fetch_add(1, Ordering::Relaxed);
                counters
                    .writes
                    .fetch_add(report.writes() as u64, Ordering::Relaxed);
                counters
                    .conflicts
                    .fetch_add(u64::from(report.conflicts), Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = id, consumer = %key, error = %e, "Consumer change not applied");
            }
        }
        queue.done(&key).await;
        metrics.set_queue_depth(queue.depth().await);
    }
    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use events_core::store::InMemorySubscriptionStore;
    use events_core::subscription::SubscriptionRef;

    fn nats_change(name: &str, subject: &str, kind: ChangeKind) -> ConsumerChange {
        ConsumerChange::new(
            kind,
            Consumer::new("team", name).with_nats(NatsProtocol {
                server_url: "nats://nats:4222".into(),
                subject: subject.into(),
                subscription_ref: Some(SubscriptionRef::new("subs")),
            }),
        )
    }

    fn controller(store: Arc<InMemorySubscriptionStore>) -> Controller {
        let reconciler = Reconciler::new(store, ControllerConfig::default())
            .with_retry_policy(RetryPolicy::immediate(10));
        Controller::with_reconciler(reconciler, 4)
    }

    #[tokio::test]
    async fn test_changes_applied_in_order_per_consumer() {
        let store = Arc::new(InMemorySubscriptionStore::with_records([
            Subscription::new("team", "subs"),
        ]));
        let controller = controller(store.clone());
        controller.start().await.unwrap();

        controller
            .submit(nats_change("a", "one", ChangeKind::Add))
            .await
            .unwrap();
        controller
            .submit(nats_change("a", "two", ChangeKind::Update))
            .await
            .unwrap();
        controller
            .submit(nats_change("b", "b", ChangeKind::Add))
            .await
            .unwrap();
        controller
            .submit(nats_change("b", "b", ChangeKind::Delete))
            .await
            .unwrap();
        controller.stop().await.unwrap();

        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.nats.len(), 1);
        assert_eq!(record.spec.nats[0].name, "a");
        assert_eq!(record.spec.nats[0].subject, "two");

        let stats = controller.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.reconciled, 4);
        assert_eq!(stats.writes, 4);
    }

    #[tokio::test]
    async fn test_many_consumers_share_one_record() {
        let store = Arc::new(InMemorySubscriptionStore::with_records([
            Subscription::new("team", "subs"),
        ]));
        let controller = controller(store.clone());
        controller.start().await.unwrap();

        for i in 0..8 {
            controller
                .submit(nats_change(&format!("c{}", i), "s", ChangeKind::Add))
                .await
                .unwrap();
        }
        controller.stop().await.unwrap();

        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.nats.len(), 8);
        assert_eq!(controller.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_failures_counted() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let controller = controller(store);
        controller.start().await.unwrap();
        controller
            .submit(nats_change("a", "s", ChangeKind::Add))
            .await
            .unwrap();
        controller.stop().await.unwrap();
        assert_eq!(controller.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(events_core::store::FileSubscriptionStore::new(dir.path()));
        store.create(Subscription::new("team", "subs")).await.unwrap();

        let controller = Controller::new(store.clone(), ControllerConfig::default());
        controller.start().await.unwrap();
        controller
            .submit(nats_change("a", "s", ChangeKind::Update))
            .await
            .unwrap();
        controller.stop().await.unwrap();

        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.nats.len(), 1);
        assert_eq!(record.metadata.resource_version, 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let controller = controller(Arc::new(InMemorySubscriptionStore::new()));
        controller.start().await.unwrap();
        controller.stop().await.unwrap();
        assert!(matches!(
            controller.submit(nats_change("a", "s", ChangeKind::Add)).await,
            Err(GatewayError::Shutdown)
        ));
    }
}
