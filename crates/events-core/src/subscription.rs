//! Subscription record
//!
//! The persisted list of subscriber destinations, one ordered sequence per
//! protocol. Entries are keyed by consumer name: a consumer owns at most one
//! entry per protocol.
//!
//! Removal swaps the last entry into the removed slot and truncates, so it is
//! O(1) and does **not** preserve order. Nothing reading the record may rely on
//! entry order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity and concurrency token of a stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Bumped by the store on every successful write
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            resource_version: 0,
        }
    }

    /// `namespace/name` key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Reference from a consumer (or gateway) to a subscription record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub name: String,
    /// Defaults to the namespace of the referencing object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SubscriptionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Resolve the namespace, falling back to the referencing object's
    pub fn resolve_namespace<'a>(&'a self, default: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => namespace,
            _ => default,
        }
    }
}

/// Subscriber reachable over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSubscription {
    pub name: String,
    pub url: String,
}

/// Subscriber reachable over NATS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsSubscription {
    pub name: String,
    #[serde(rename = "serverURL")]
    pub server_url: String,
    pub subject: String,
}

/// Protocol tag for a subscription entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Nats,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Nats => "nats",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common view over per-protocol entries
pub trait SubscriptionEntry: Clone + PartialEq + Send + Sync {
    const PROTOCOL: Protocol;

    /// Consumer name owning the entry
    fn name(&self) -> &str;

    /// Human readable destination, for logs
    fn destination(&self) -> String;

    /// Copy destination fields from `other`, returning whether anything changed
    fn update_destination(&mut self, other: &Self) -> bool;

    /// The record section holding entries of this protocol
    fn entries_mut(spec: &mut SubscriptionSpec) -> &mut Vec<Self>;
}

impl SubscriptionEntry for HttpSubscription {
    const PROTOCOL: Protocol = Protocol::Http;

    fn name(&self) -> &str {
        &self.name
    }

    fn destination(&self) -> String {
        self.url.clone()
    }

    fn update_destination(&mut self, other: &Self) -> bool {
        if self.url == other.url {
            return false;
        }
        self.url = other.url.clone();
        true
    }

    fn entries_mut(spec: &mut SubscriptionSpec) -> &mut Vec<Self> {
        &mut spec.http
    }
}

impl SubscriptionEntry for NatsSubscription {
    const PROTOCOL: Protocol = Protocol::Nats;

    fn name(&self) -> &str {
        &self.name
    }

    fn destination(&self) -> String {
        format!("{} ({})", self.server_url, self.subject)
    }

    fn update_destination(&mut self, other: &Self) -> bool {
        let mut changed = false;
        if self.subject != other.subject {
            self.subject = other.subject.clone();
            changed = true;
        }
        if self.server_url != other.server_url {
            self.server_url = other.server_url.clone();
            changed = true;
        }
        changed
    }

    fn entries_mut(spec: &mut SubscriptionSpec) -> &mut Vec<Self> {
        &mut spec.nats
    }
}

/// Outcome of an upsert against one protocol sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryChange {
    Appended,
    Updated,
    Unchanged,
}

impl EntryChange {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Position of the entry owned by `name`
pub fn find_entry<E: SubscriptionEntry>(entries: &[E], name: &str) -> Option<usize> {
    entries.iter().position(|entry| entry.name() == name)
}

/// Append `desired` or patch the existing entry with the same name in place
pub fn upsert_entry<E: SubscriptionEntry>(entries: &mut Vec<E>, desired: E) -> EntryChange {
    match find_entry(entries, desired.name()) {
        Some(index) => {
            if entries[index].update_destination(&desired) {
                EntryChange::Updated
            } else {
                EntryChange::Unchanged
            }
        }
        None => {
            entries.push(desired);
            EntryChange::Appended
        }
    }
}

/// Remove the entry owned by `name` by swapping the last entry into its slot
///
/// Order of the remaining entries is not preserved.
pub fn swap_remove_entry<E: SubscriptionEntry>(entries: &mut Vec<E>, name: &str) -> Option<E> {
    find_entry(entries, name).map(|index| entries.swap_remove(index))
}

/// Destinations per protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    #[serde(default)]
    pub http: Vec<HttpSubscription>,
    #[serde(default)]
    pub nats: Vec<NatsSubscription>,
}

impl SubscriptionSpec {
    pub fn is_empty(&self) -> bool {
        self.http.is_empty() && self.nats.is_empty()
    }

    pub fn len(&self) -> usize {
        self.http.len() + self.nats.len()
    }
}

/// Write timestamps maintained by the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Subscription record: a named, namespaced object with one section per protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SubscriptionSpec,
    #[serde(default)]
    pub status: SubscriptionStatus,
}

impl Subscription {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: SubscriptionSpec::default(),
            status: SubscriptionStatus::default(),
        }
    }

    pub fn with_http(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.spec.http.push(HttpSubscription {
            name: name.into(),
            url: url.into(),
        });
        self
    }

    pub fn with_nats(
        mut self,
        name: impl Into<String>,
        server_url: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        self.spec.nats.push(NatsSubscription {
            name: name.into(),
            server_url: server_url.into(),
            subject: subject.into(),
        });
        self
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }
}
