//! Subscription record storage
//!
//! The record lives in an external object store. Both the controller (writer)
//! and the gateway (reader) talk to it through [`SubscriptionStore`], which
//! exposes get-by-name and update with optimistic concurrency: an update must
//! carry the `resource_version` it was read at, otherwise it fails with
//! [`GatewayError::StoreConflict`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::subscription::Subscription;

/// Subscription store strategy
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fetch the current copy of a record
    async fn get(&self, namespace: &str, name: &str) -> Result<Subscription>;

    /// Write a record read at `metadata.resource_version`
    ///
    /// Returns the stored copy with its new version.
    async fn update(&self, subscription: Subscription) -> Result<Subscription>;

    /// Get store name
    fn name(&self) -> &'static str;
}

fn check_version(stored: &Subscription, incoming: &Subscription) -> Result<()> {
    if stored.metadata.resource_version != incoming.metadata.resource_version {
        return Err(GatewayError::StoreConflict {
            namespace: incoming.metadata.namespace.clone(),
            name: incoming.metadata.name.clone(),
            current: stored.metadata.resource_version,
            attempted: incoming.metadata.resource_version,
        });
    }
    Ok(())
}

fn stamp_update(stored: &Subscription, mut incoming: Subscription) -> Subscription {
    incoming.metadata.resource_version = stored.metadata.resource_version + 1;
    incoming.status.created_at = stored.status.created_at.or(incoming.status.created_at);
    incoming.status.updated_at = Some(Utc::now());
    incoming
}

fn stamp_create(mut subscription: Subscription) -> Subscription {
    let now = Utc::now();
    subscription.metadata.resource_version = 1;
    subscription.status.created_at = Some(now);
    subscription.status.updated_at = Some(now);
    subscription
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory subscription store
///
/// Counts successful updates so callers can assert write behaviour.
pub struct InMemorySubscriptionStore {
    records: RwLock<HashMap<String, Subscription>>,
    writes: AtomicU64,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Create store seeded with records
    pub fn with_records(records: impl IntoIterator<Item = Subscription>) -> Self {
        let map = records
            .into_iter()
            .map(|record| (record.key(), stamp_create(record)))
            .collect();
        Self {
            records: RwLock::new(map),
            writes: AtomicU64::new(0),
        }
    }

    /// Insert a new record; fails if one already exists under the same key
    pub async fn create(&self, subscription: Subscription) -> Result<Subscription> {
        let mut records = self.records.write().await;
        let key = subscription.key();
        if let Some(existing) = records.get(&key) {
            return Err(GatewayError::StoreConflict {
                namespace: subscription.metadata.namespace.clone(),
                name: subscription.metadata.name.clone(),
                current: existing.metadata.resource_version,
                attempted: 0,
            });
        }
        let stored = stamp_create(subscription);
        records.insert(key, stored.clone());
        Ok(stored)
    }

    /// Number of successful updates
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for InMemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Subscription> {
        self.records
            .read()
            .await
            .get(&format!("{}/{}", namespace, name))
            .cloned()
            .ok_or_else(|| GatewayError::not_found(namespace, name))
    }

    async fn update(&self, subscription: Subscription) -> Result<Subscription> {
        let mut records = self.records.write().await;
        let key = subscription.key();
        let stored = records.get(&key).ok_or_else(|| {
            GatewayError::not_found(&subscription.metadata.namespace, &subscription.metadata.name)
        })?;
        check_version(stored, &subscription)?;

        let updated = stamp_update(stored, subscription);
        records.insert(key, updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    fn name(&self) -> &'static str {
        "memory_store"
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// File-backed subscription store
///
/// Records live at `{root}/{namespace}/{name}.json`. Writes go through a
/// temp file and rename. The version check and write run under a process-local
/// lock; the store is not meant to be shared between processes that write.
pub struct FileSubscriptionStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// Check that a namespace or record name is usable as a single path segment
pub fn check_record_segment(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::validation(format!("{} must not be empty", field)));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        return Err(GatewayError::validation(format!(
            "{} {:?} must not contain '/', '\\' or '..'",
            field, value
        )));
    }
    Ok(())
}

impl FileSubscriptionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        check_record_segment("namespace", namespace)?;
        check_record_segment("name", name)?;
        Ok(self.root.join(namespace).join(format!("{}.json", name)))
    }

    async fn read(&self, path: &Path, namespace: &str, name: &str) -> Result<Subscription> {
        match fs::read(path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| {
                GatewayError::serialization_with_source(
                    format!("Failed to parse subscription {}/{}", namespace, name),
                    e,
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::not_found(namespace, name))
            }
            Err(e) => Err(GatewayError::store_with_source(
                format!("Failed to read {}", path.display()),
                e,
            )),
        }
    }

    async fn write(&self, path: &Path, subscription: &Subscription) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                GatewayError::store_with_source("Failed to create store directory", e)
            })?;
        }

        let content = serde_json::to_vec_pretty(subscription).map_err(|e| {
            GatewayError::serialization_with_source("Failed to serialize subscription", e)
        })?;

        // Write atomically via temp file
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .await
            .map_err(|e| GatewayError::store_with_source("Failed to write subscription", e))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| GatewayError::store_with_source("Failed to rename subscription", e))?;
        Ok(())
    }

    /// Insert a new record; fails if the file already exists
    pub async fn create(&self, subscription: Subscription) -> Result<Subscription> {
        let _guard = self.write_lock.lock().await;
        let (namespace, name) = (
            subscription.metadata.namespace.clone(),
            subscription.metadata.name.clone(),
        );
        let path = self.path(&namespace, &name)?;

        match self.read(&path, &namespace, &name).await {
            Ok(existing) => Err(GatewayError::StoreConflict {
                namespace,
                name,
                current: existing.metadata.resource_version,
                attempted: 0,
            }),
            Err(GatewayError::StoreNotFound { .. }) => {
                let stored = stamp_create(subscription);
                self.write(&path, &stored).await?;
                info!(subscription = %stored.key(), "Created subscription record");
                Ok(stored)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SubscriptionStore for FileSubscriptionStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Subscription> {
        self.read(&self.path(namespace, name)?, namespace, name).await
    }

    async fn update(&self, subscription: Subscription) -> Result<Subscription> {
        let _guard = self.write_lock.lock().await;
        let (namespace, name) = (
            subscription.metadata.namespace.clone(),
            subscription.metadata.name.clone(),
        );
        let path = self.path(&namespace, &name)?;

        let stored = self.read(&path, &namespace, &name).await?;
        check_version(&stored, &subscription)?;

        let updated = stamp_update(&stored, subscription);
        self.write(&path, &updated).await?;
        debug!(
            subscription = %updated.key(),
            version = updated.metadata.resource_version,
            "Saved subscription record"
        );
        Ok(updated)
    }

    fn name(&self) -> &'static str {
        "file_store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_update_bumps_version() {
        let store = InMemorySubscriptionStore::with_records([Subscription::new("ns", "subs")]);

        let mut record = store.get("ns", "subs").await.unwrap();
        assert_eq!(record.metadata.resource_version, 1);
        record.spec.http.clear();

        let saved = store.update(record).await.unwrap();
        assert_eq!(saved.metadata.resource_version, 2);
        assert!(saved.status.updated_at.is_some());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_stale_write_conflicts() {
        let store = InMemorySubscriptionStore::with_records([Subscription::new("ns", "subs")]);

        let first = store.get("ns", "subs").await.unwrap();
        let second = first.clone();
        store.update(first).await.unwrap();

        let err = store.update(second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_missing_record() {
        let store = InMemorySubscriptionStore::new();
        assert!(matches!(
            store.get("ns", "nope").await,
            Err(GatewayError::StoreNotFound { .. })
        ));
        assert!(matches!(
            store.update(Subscription::new("ns", "nope")).await,
            Err(GatewayError::StoreNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileSubscriptionStore::new(dir.path());

        store
            .create(Subscription::new("ns", "subs").with_http("a", "http://a/"))
            .await
            .unwrap();

        let mut record = store.get("ns", "subs").await.unwrap();
        record.spec.http[0].url = "http://b/".into();
        store.update(record).await.unwrap();

        // New instance sees persisted value
        let reopened = FileSubscriptionStore::new(dir.path());
        let record = reopened.get("ns", "subs").await.unwrap();
        assert_eq!(record.spec.http[0].url, "http://b/");
        assert_eq!(record.metadata.resource_version, 2);
        assert!(record.status.created_at.is_some());
    }

    #[tokio::test]
    async fn test_file_store_conflict_and_duplicate_create() {
        let dir = tempdir().unwrap();
        let store = FileSubscriptionStore::new(dir.path());
        store.create(Subscription::new("ns", "subs")).await.unwrap();

        assert!(store
            .create(Subscription::new("ns", "subs"))
            .await
            .unwrap_err()
            .is_conflict());

        let stale = store.get("ns", "subs").await.unwrap();
        store.update(stale.clone()).await.unwrap();
        assert!(store.update(stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_file_store_stays_under_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("store");
        let store = FileSubscriptionStore::new(&root);

        assert!(matches!(
            store.create(Subscription::new("..", "escaped")).await,
            Err(GatewayError::Validation { .. })
        ));
        assert!(matches!(
            store.get("ns", "../../etc/passwd").await,
            Err(GatewayError::Validation { .. })
        ));
        assert!(matches!(
            store.get("a\\b", "subs").await,
            Err(GatewayError::Validation { .. })
        ));
        assert!(store.get("", "subs").await.is_err());
        assert!(!dir.path().join("escaped.json").exists());
    }
}
