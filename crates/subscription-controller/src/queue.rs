//! Keyed work queue
//!
//! Changes for the same consumer are handed out one at a time and in arrival
//! order; changes for different consumers may be processed concurrently.

use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{Mutex, Notify};

use crate::consumer::ConsumerChange;

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<ConsumerChange>>,
    /// Keys with pending work and no active lease, in arrival order
    ready: VecDeque<String>,
    active: HashSet<String>,
    len: usize,
    closed: bool,
}

/// A change leased to one worker; return the key with [`WorkQueue::done`]
#[derive(Debug)]
pub struct Lease {
    pub key: String,
    pub change: ConsumerChange,
}

/// Work queue with at most one in-flight change per key
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a change; returns false once the queue is closed
    pub async fn push(&self, change: ConsumerChange) -> bool {
        let key = change.key();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return false;
            }
            let queue = state.pending.entry(key.clone()).or_default();
            let was_idle = queue.is_empty();
            queue.push_back(change);
            state.len += 1;
            if was_idle && !state.active.contains(&key) {
                state.ready.push_back(key);
            }
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next change whose key is not leased
    ///
    /// Returns `None` after [`WorkQueue::close`] once every remaining change
    /// has been handed out.
    pub async fn pop(&self) -> Option<Lease> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(lease) = state.take_ready() {
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(lease);
                }
                if state.closed && state.len == 0 {
                    // Wake the next waiter so it observes the close too
                    self.notify.notify_one();
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a lease, making the key's next change available
    pub async fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock().await;
            state.active.remove(key);
            let has_more = state
                .pending
                .get(key)
                .map(|queue| !queue.is_empty())
                .unwrap_or(false);
            if has_more {
                state.ready.push_back(key.to_string());
            } else {
                state.pending.remove(key);
            }
            has_more || (state.closed && state.len == 0)
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting changes; already queued changes are still handed out
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Changes not yet handed out
    pub async fn depth(&self) -> usize {
        self.state.lock().await.len
    }

    /// Keys currently leased
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

impl QueueState {
    fn take_ready(&mut self) -> Option<Lease> {
        while let Some(key) = self.ready.pop_front() {
            if self.active.contains(&key) {
                continue;
            }
            let Some(change) = self.pending.get_mut(&key).and_then(|queue| queue.pop_front())
            else {
                continue;
            };
            self.len -= 1;
            self.active.insert(key.clone());
            return Some(Lease { key, change });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ChangeKind, Consumer};
    use std::sync::Arc;
    use std::time::Duration;

    fn change(name: &str, kind: ChangeKind) -> ConsumerChange {
        ConsumerChange::new(kind, Consumer::new("team", name))
    }

    #[tokio::test]
    async fn test_same_key_in_order_one_at_a_time() {
        let queue = WorkQueue::new();
        queue.push(change("x", ChangeKind::Add)).await;
        queue.push(change("x", ChangeKind::Update)).await;
        queue.push(change("x", ChangeKind::Delete)).await;

        let first = queue.pop().await.unwrap();
        assert_eq!(first.change.kind, ChangeKind::Add);

        // Key still leased, nothing else to hand out
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.pop()).await;
        assert!(blocked.is_err());

        queue.done(&first.key).await;
        let second = queue.pop().await.unwrap();
        assert_eq!(second.change.kind, ChangeKind::Update);
        queue.done(&second.key).await;
        let third = queue.pop().await.unwrap();
        assert_eq!(third.change.kind, ChangeKind::Delete);
        queue.done(&third.key).await;
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_different_keys_leased_together() {
        let queue = WorkQueue::new();
        queue.push(change("a", ChangeKind::Update)).await;
        queue.push(change("a", ChangeKind::Update)).await;
        queue.push(change("b", ChangeKind::Update)).await;

        let a = queue.pop().await.unwrap();
        let b = queue.pop().await.unwrap();
        assert_eq!(a.key, "team/a");
        assert_eq!(b.key, "team/b");
        assert_eq!(queue.in_flight().await, 2);
        assert_eq!(queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_waiting_worker_woken_by_push() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|lease| lease.key) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(change("late", ChangeKind::Add)).await;

        let key = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.as_deref(), Some("team/late"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = WorkQueue::new();
        queue.push(change("x", ChangeKind::Update)).await;
        queue.close().await;

        assert!(!queue.push(change("y", ChangeKind::Update)).await);
        let lease = queue.pop().await.unwrap();
        queue.done(&lease.key).await;
        assert!(queue.pop().await.is_none());
    }
}
