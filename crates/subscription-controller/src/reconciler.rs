//! Subscription reconciliation
//!
//! Keeps subscription records in line with consumers. Every pass re-reads
//! the record, applies the change in memory and writes only when the
//! in-memory copy actually changed. Store conflicts restart the pass from a
//! fresh read.

use events_core::config::ControllerConfig;
use events_core::error::{ErrorContext, ErrorContextExt, GatewayError, Result};
use events_core::metrics::ControllerMetrics;
use events_core::store::SubscriptionStore;
use events_core::subscription::{
    swap_remove_entry, upsert_entry, EntryChange, HttpSubscription, NatsSubscription,
    SubscriptionEntry,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::consumer::{ChangeKind, Consumer, RecordLocation};
use crate::retry::RetryPolicy;

/// What reconciliation did to one protocol's record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOutcome {
    /// Entry appended, updated or removed
    Written,
    /// Record already matched
    Unchanged,
    /// Nothing to reconcile for this protocol yet
    Skipped,
}

/// Result of one notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub http: Option<ProtocolOutcome>,
    pub nats: Option<ProtocolOutcome>,
    /// Conflicts retried across both protocols
    pub conflicts: u32,
    /// Change kind was not understood; nothing was done
    pub ignored: bool,
}

impl ReconcileReport {
    /// Number of store writes performed
    pub fn writes(&self) -> usize {
        [self.http, self.nats]
            .iter()
            .filter(|outcome| **outcome == Some(ProtocolOutcome::Written))
            .count()
    }
}

/// Reconciles consumers into subscription records
pub struct Reconciler {
    store: Arc<dyn SubscriptionStore>,
    config: ControllerConfig,
    retry: RetryPolicy,
    metrics: ControllerMetrics,
}

impl Reconciler {
    pub fn new(store: Arc<dyn SubscriptionStore>, config: ControllerConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            store,
            config,
            retry,
            metrics: ControllerMetrics::new("reconciler"),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Apply one observed change
    ///
    /// `Add` is handled as `Update`. Unknown kinds are logged and leave every
    /// record untouched. Both protocols are attempted even if one fails; the
    /// first error is returned.
    pub async fn on_consumer_changed(
        &self,
        consumer: &Consumer,
        kind: &ChangeKind,
    ) -> Result<ReconcileReport> {
        if let ChangeKind::Other(other) = kind {
            error!(consumer = %consumer.key(), kind = %other, "Unknown consumer change kind");
            self.metrics.record_reconcile(kind.as_str(), "ignored");
            return Ok(ReconcileReport {
                ignored: true,
                ..Default::default()
            });
        }

        if let Err(e) = consumer.validate() {
            error!(consumer = %consumer.key(), error = %e, "Invalid consumer, skipping reconciliation");
            self.metrics.record_reconcile(kind.as_str(), "invalid");
            return Err(e);
        }

        let result = match kind {
            ChangeKind::Delete => self.remove_consumer(consumer).await,
            _ => self.upsert_consumer(consumer).await,
        };

        match &result {
            Ok(report) => {
                self.metrics.record_reconcile(kind.as_str(), "success");
                info!(
                    consumer = %consumer.key(),
                    kind = %kind,
                    writes = report.writes(),
                    conflicts = report.conflicts,
                    "Reconciled consumer"
                );
            }
            Err(_) => self.metrics.record_reconcile(kind.as_str(), "error"),
        }
        result
    }

    async fn upsert_consumer(&self, consumer: &Consumer) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut first_error = None;

        if consumer.event_protocol.http.is_some() {
            match consumer.http_entry(&self.config) {
                Some((location, desired)) => {
                    let outcome = self
                        .apply(
                            &location,
                            &consumer.name,
                            &mut report.conflicts,
                            |entries: &mut Vec<HttpSubscription>| {
                                upsert_entry(entries, desired.clone())
                            },
                        )
                        .await
                        .with_context(context("upsert_http", consumer, &location));
                    report.http = keep_first_error(outcome, &mut first_error);
                }
                None => {
                    debug!(consumer = %consumer.key(), "Backing service not available yet, skipping HTTP subscription");
                    report.http = Some(ProtocolOutcome::Skipped);
                }
            }
        }

        if let Some((location, desired)) = consumer.nats_entry() {
            let outcome = self
                .apply(
                    &location,
                    &consumer.name,
                    &mut report.conflicts,
                    |entries: &mut Vec<NatsSubscription>| upsert_entry(entries, desired.clone()),
                )
                .await
                .with_context(context("upsert_nats", consumer, &location));
            report.nats = keep_first_error(outcome, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn remove_consumer(&self, consumer: &Consumer) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut first_error = None;
        let name = consumer.name.as_str();

        if let Some(location) = consumer.http_record() {
            let outcome = self
                .apply(
                    &location,
                    name,
                    &mut report.conflicts,
                    |entries: &mut Vec<HttpSubscription>| removal(swap_remove_entry(entries, name)),
                )
                .await
                .with_context(context("remove_http", consumer, &location));
            report.http = keep_first_error(outcome, &mut first_error);
        }

        if let Some(location) = consumer.nats_record() {
            let outcome = self
                .apply(
                    &location,
                    name,
                    &mut report.conflicts,
                    |entries: &mut Vec<NatsSubscription>| removal(swap_remove_entry(entries, name)),
                )
                .await
                .with_context(context("remove_nats", consumer, &location));
            report.nats = keep_first_error(outcome, &mut first_error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Fetch, mutate, and write if changed; retried on conflict
    async fn apply<E, F>(
        &self,
        location: &RecordLocation,
        consumer: &str,
        conflicts: &mut u32,
        mut mutate: F,
    ) -> Result<ProtocolOutcome>
    where
        E: SubscriptionEntry,
        F: FnMut(&mut Vec<E>) -> EntryChange,
    {
        let mut attempt = 1;
        loop {
            let mut record = self.store.get(&location.namespace, &location.name).await?;

            let change = mutate(E::entries_mut(&mut record.spec));
            if !change.is_write() {
                debug!(
                    consumer,
                    subscription = %location,
                    protocol = %E::PROTOCOL,
                    "Subscription already up to date"
                );
                return Ok(ProtocolOutcome::Unchanged);
            }

            match self.store.update(record).await {
                Ok(saved) => {
                    self.metrics.record_store_write(E::PROTOCOL.as_str());
                    info!(
                        consumer,
                        subscription = %location,
                        protocol = %E::PROTOCOL,
                        change = ?change,
                        version = saved.metadata.resource_version,
                        "Updated subscription record"
                    );
                    return Ok(ProtocolOutcome::Written);
                }
                Err(e) if e.is_conflict() => {
                    *conflicts += 1;
                    self.metrics.record_conflict();
                    if !self.retry.should_retry(attempt) {
                        return Err(GatewayError::RetryExhausted {
                            attempts: attempt,
                            message: format!("updating {}: {}", location, e),
                        });
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(
                        consumer,
                        subscription = %location,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Subscription changed underneath, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn context(operation: &str, consumer: &Consumer, location: &RecordLocation) -> ErrorContext {
    ErrorContext::new("reconciler", operation)
        .with_consumer(consumer.key())
        .with_subscription(location.to_string())
}

/// Map a swap-remove result onto an entry change
fn removal<E>(removed: Option<E>) -> EntryChange {
    if removed.is_some() {
        EntryChange::Updated
    } else {
        EntryChange::Unchanged
    }
}

fn keep_first_error(
    outcome: Result<ProtocolOutcome>,
    first_error: &mut Option<GatewayError>,
) -> Option<ProtocolOutcome> {
    match outcome {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            if first_error.is_none() {
                *first_error = Some(e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{HttpProtocol, NatsProtocol};
    use async_trait::async_trait;
    use events_core::store::InMemorySubscriptionStore;
    use events_core::subscription::{Subscription, SubscriptionRef};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn store_with(record: Subscription) -> Arc<InMemorySubscriptionStore> {
        Arc::new(InMemorySubscriptionStore::with_records([record]))
    }

    fn reconciler(store: Arc<dyn SubscriptionStore>) -> Reconciler {
        Reconciler::new(store, ControllerConfig::default()).with_retry_policy(RetryPolicy::immediate(5))
    }

    fn http_consumer(name: &str, port: &str) -> Consumer {
        Consumer::new("team", name)
            .with_http(HttpProtocol {
                port: Some(port.into()),
                endpoint: None,
                subscription_ref: Some(SubscriptionRef::new("subs")),
            })
            .with_service(format!("{}-svc", name), "team")
    }

    fn nats_consumer(name: &str, subject: &str) -> Consumer {
        Consumer::new("team", name).with_nats(NatsProtocol {
            server_url: "nats://nats:4222".into(),
            subject: subject.into(),
            subscription_ref: Some(SubscriptionRef::new("subs")),
        })
    }

    #[tokio::test]
    async fn test_update_appends_then_is_idempotent() {
        let store = store_with(Subscription::new("team", "subs"));
        let reconciler = reconciler(store.clone());
        let consumer = http_consumer("x", "9300");

        let report = reconciler
            .on_consumer_changed(&consumer, &ChangeKind::Update)
            .await
            .unwrap();
        assert_eq!(report.http, Some(ProtocolOutcome::Written));
        assert_eq!(store.write_count(), 1);

        let report = reconciler
            .on_consumer_changed(&consumer, &ChangeKind::Update)
            .await
            .unwrap();
        assert_eq!(report.http, Some(ProtocolOutcome::Unchanged));
        assert_eq!(store.write_count(), 1);

        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.http.len(), 1);
        assert_eq!(record.spec.http[0].url, "http://x-svc.team.svc.cluster.local:9300/");
    }

    #[tokio::test]
    async fn test_moved_destination_written_once() {
        let store = store_with(Subscription::new("team", "subs").with_http("x", "http://old/"));
        let reconciler = reconciler(store.clone());
        let consumer = http_consumer("x", "9400");

        reconciler
            .on_consumer_changed(&consumer, &ChangeKind::Update)
            .await
            .unwrap();
        reconciler
            .on_consumer_changed(&consumer, &ChangeKind::Update)
            .await
            .unwrap();

        assert_eq!(store.write_count(), 1);
        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.http.len(), 1);
        assert_eq!(record.spec.http[0].url, "http://x-svc.team.svc.cluster.local:9400/");
    }

    #[tokio::test]
    async fn test_delete_swap_removes_entry() {
        let store = store_with(
            Subscription::new("team", "subs")
                .with_http("a", "http://a/")
                .with_http("b", "http://b/")
                .with_http("c", "http://c/"),
        );
        let reconciler = reconciler(store.clone());

        let report = reconciler
            .on_consumer_changed(&http_consumer("b", "9300"), &ChangeKind::Delete)
            .await
            .unwrap();
        assert_eq!(report.writes(), 1);

        let record = store.get("team", "subs").await.unwrap();
        let mut names: Vec<_> = record.spec.http.iter().map(|e| e.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_delete_absent_name_writes_nothing() {
        let store = store_with(Subscription::new("team", "subs").with_http("a", "http://a/"));
        let reconciler = reconciler(store.clone());

        let report = reconciler
            .on_consumer_changed(&http_consumer("zzz", "9300"), &ChangeKind::Delete)
            .await
            .unwrap();
        assert_eq!(report.http, Some(ProtocolOutcome::Unchanged));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_skips_http() {
        let store = store_with(Subscription::new("team", "subs"));
        let reconciler = reconciler(store.clone());
        let mut consumer = http_consumer("x", "9300");
        consumer.status = Default::default();

        let report = reconciler
            .on_consumer_changed(&consumer, &ChangeKind::Update)
            .await
            .unwrap();
        assert_eq!(report.http, Some(ProtocolOutcome::Skipped));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_nats_subject_change_updates_in_place() {
        let store = store_with(Subscription::new("team", "subs").with_nats(
            "n",
            "nats://nats:4222",
            "old",
        ));
        let reconciler = reconciler(store.clone());

        reconciler
            .on_consumer_changed(&nats_consumer("n", "new"), &ChangeKind::Add)
            .await
            .unwrap();
        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.nats.len(), 1);
        assert_eq!(record.spec.nats[0].subject, "new");
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_consumer_not_applied() {
        let store = store_with(Subscription::new("team", "subs"));
        let reconciler = reconciler(store.clone());
        let consumer = nats_consumer("n", "");

        assert!(matches!(
            reconciler
                .on_consumer_changed(&consumer, &ChangeKind::Update)
                .await,
            Err(GatewayError::Validation { .. })
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_ignored() {
        let store = store_with(Subscription::new("team", "subs"));
        let reconciler = reconciler(store.clone());

        let report = reconciler
            .on_consumer_changed(&http_consumer("x", "9300"), &ChangeKind::Other("RESYNC".into()))
            .await
            .unwrap();
        assert!(report.ignored);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let reconciler = reconciler(store.clone());
        assert!(matches!(
            reconciler
                .on_consumer_changed(&nats_consumer("n", "s"), &ChangeKind::Update)
                .await,
            Err(GatewayError::StoreNotFound { .. })
        ));
    }

    /// Store whose first `n` updates lose a race with another writer
    struct RacingStore {
        inner: InMemorySubscriptionStore,
        races: AtomicU32,
    }

    #[async_trait]
    impl SubscriptionStore for RacingStore {
        async fn get(&self, namespace: &str, name: &str) -> Result<Subscription> {
            self.inner.get(namespace, name).await
        }

        async fn update(&self, subscription: Subscription) -> Result<Subscription> {
            if self.races.load(Ordering::SeqCst) > 0 {
                self.races.fetch_sub(1, Ordering::SeqCst);
                // Someone else appends an unrelated entry first
                let mut other = self
                    .inner
                    .get(&subscription.metadata.namespace, &subscription.metadata.name)
                    .await?;
                other.spec.http.push(HttpSubscription {
                    name: format!("other-{}", other.metadata.resource_version),
                    url: "http://other/".into(),
                });
                self.inner.update(other).await?;
            }
            self.inner.update(subscription).await
        }

        fn name(&self) -> &'static str {
            "racing_store"
        }
    }

    #[tokio::test]
    async fn test_conflict_retried_with_fresh_read() {
        let store = Arc::new(RacingStore {
            inner: InMemorySubscriptionStore::with_records([Subscription::new("team", "subs")]),
            races: AtomicU32::new(2),
        });
        let reconciler = reconciler(store.clone());

        let report = reconciler
            .on_consumer_changed(&http_consumer("x", "9300"), &ChangeKind::Update)
            .await
            .unwrap();
        assert_eq!(report.conflicts, 2);
        assert_eq!(report.http, Some(ProtocolOutcome::Written));

        // Concurrent writes survive alongside ours
        let record = store.get("team", "subs").await.unwrap();
        assert_eq!(record.spec.http.len(), 3);
        assert!(record.spec.http.iter().any(|e| e.name == "x"));
    }

    #[tokio::test]
    async fn test_conflict_retries_exhausted() {
        let store = Arc::new(RacingStore {
            inner: InMemorySubscriptionStore::with_records([Subscription::new("team", "subs")]),
            races: AtomicU32::new(10),
        });
        let reconciler = Reconciler::new(store, ControllerConfig::default())
            .with_retry_policy(RetryPolicy::immediate(3));

        assert!(matches!(
            reconciler
                .on_consumer_changed(&http_consumer("x", "9300"), &ChangeKind::Update)
                .await,
            Err(GatewayError::RetryExhausted { attempts: 3, .. })
        ));
    }
}
