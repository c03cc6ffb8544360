//! Tether work queue: a deduplicating FIFO of keys with in-flight tracking.
//!
//! A key is *dirty* while it waits to be processed and *processing* between
//! [`WorkQueue::get`] and [`WorkQueue::done`]. Adding a dirty key is a no-op, and a
//! key added while processing is parked until `done`, so no two workers ever hold
//! the same key at once.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

pub mod limiter;

pub use limiter::{ExponentialBackoff, RateLimiter};

struct State<K> {
    order: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_limiter(name, ExponentialBackoff::default())
    }

    pub fn with_limiter(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                order: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        })
    }

    // Critical sections never panic mid-update, so a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &str { &self.name }

    /// Enqueue `key` unless it is already pending. Keys in flight are requeued on `done`.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down { return; }
        if !st.dirty.insert(key.clone()) {
            counter!("queue_coalesced_total", 1u64, "queue" => self.name.clone());
            return;
        }
        counter!("queue_adds_total", 1u64, "queue" => self.name.clone());
        if st.processing.contains(&key) {
            debug!(queue = %self.name, key = ?key, "key in flight; deferring until done");
            return;
        }
        st.order.push_back(key);
        gauge!("queue_depth", st.order.len() as f64, "queue" => self.name.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(self: &Arc<Self>) -> Option<Lease<K>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if st.shutting_down { return None; }
                if let Some(key) = st.order.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.order.is_empty();
                    gauge!("queue_depth", st.order.len() as f64, "queue" => self.name.clone());
                    drop(st);
                    if more { self.notify.notify_one(); }
                    return Some(Lease { queue: Arc::clone(self), key });
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer in flight. A re-add that arrived meanwhile is queued now.
    /// Calling this for a key that is not in flight does nothing.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        if !st.processing.remove(key) || st.shutting_down || !st.dirty.contains(key) { return; }
        st.order.push_back(key.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Stop handing out keys. Blocked and future `get` calls return `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        debug!(queue = %self.name, "queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    /// Add `key` after `delay`. Must be called from within a tokio runtime.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if self.is_shutting_down() { return; }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Requeue `key` after its backoff delay and count one more failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        counter!("queue_retries_total", 1u64, "queue" => self.name.clone());
        debug!(queue = %self.name, key = ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }
}

/// A key handed out by [`WorkQueue::get`]. Dropping the lease marks the key done,
/// including on early return or unwinding.
pub struct Lease<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    queue: Arc<WorkQueue<K>>,
    key: K,
}

impl<K> Lease<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn key(&self) -> &K { &self.key }

    pub fn queue(&self) -> &Arc<WorkQueue<K>> { &self.queue }

    /// Mark the key done now instead of at end of scope.
    pub fn release(self) { drop(self) }
}

impl<K> Deref for Lease<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    type Target = K;
    fn deref(&self) -> &K { &self.key }
}

impl<K> Drop for Lease<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    fn drop(&mut self) { self.queue.done(&self.key); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q() -> Arc<WorkQueue<String>> { WorkQueue::new("test") }

    async fn try_get(q: &Arc<WorkQueue<String>>) -> Option<Lease<String>> {
        tokio::time::timeout(Duration::from_millis(50), q.get()).await.ok().flatten()
    }

    #[tokio::test]
    async fn burst_of_adds_yields_one_dequeue() {
        let q = q();
        for _ in 0..5 { q.add("default/pod-a".to_string()); }
        assert_eq!(q.len(), 1);
        let lease = try_get(&q).await.expect("one item");
        assert_eq!(lease.key(), "default/pod-a");
        drop(lease);
        assert!(try_get(&q).await.is_none());
    }

    #[tokio::test]
    async fn fifo_by_first_occurrence() {
        let q = q();
        q.add("a".into());
        q.add("b".into());
        q.add("a".into());
        q.add("c".into());
        let order: Vec<String> = {
            let mut out = Vec::new();
            while let Some(l) = try_get(&q).await { out.push(l.key().clone()); }
            out
        };
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn readd_while_in_flight_waits_for_done() {
        let q = q();
        q.add("k".into());
        let lease = try_get(&q).await.unwrap();
        q.add("k".into());
        q.add("k".into());
        assert_eq!(q.len(), 0);
        assert!(try_get(&q).await.is_none(), "in-flight key must not be handed out twice");
        drop(lease);
        assert_eq!(q.len(), 1);
        let again = try_get(&q).await.expect("requeued after done");
        assert_eq!(again.key(), "k");
        assert_eq!(q.in_flight(), 1);
        drop(again);
        assert_eq!(q.in_flight(), 0);
        assert!(try_get(&q).await.is_none());
    }

    #[tokio::test]
    async fn explicit_done_matches_drop() {
        let q = q();
        q.add("k".into());
        let lease = try_get(&q).await.unwrap();
        q.add("k".into());
        lease.release();
        assert!(try_get(&q).await.is_some());
    }

    #[tokio::test]
    async fn explicit_done_then_lease_drop_requeues_once() {
        let q = q();
        q.add("k".into());
        let lease = try_get(&q).await.unwrap();
        q.add("k".into());
        q.done(lease.key());
        drop(lease);
        assert_eq!(q.len(), 1);
        let again = try_get(&q).await.expect("requeued once");
        assert_eq!(again.key(), "k");
        assert!(try_get(&q).await.is_none(), "key must not be handed out twice");
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test]
    async fn done_for_pending_key_is_a_noop() {
        let q = q();
        q.add("k".into());
        q.done(&"k".to_string());
        q.done(&"k".to_string());
        assert_eq!(q.len(), 1);
        let lease = try_get(&q).await.unwrap();
        assert_eq!(lease.key(), "k");
        assert!(try_get(&q).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiters() {
        let q = q();
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await.is_none() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();
        let got_none = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("waiter stopped").unwrap();
        assert!(got_none);
        q.add("late".into());
        assert!(q.is_empty());
        assert!(q.get().await.is_none());
    }

    #[tokio::test]
    async fn blocked_get_wakes_on_add() {
        let q = q();
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await.map(|l| l.key().clone()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.add("x".into());
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn rate_limited_add_arrives_later_and_counts() {
        let q: Arc<WorkQueue<String>> = WorkQueue::with_limiter(
            "rl",
            ExponentialBackoff::new(Duration::from_millis(20), Duration::from_secs(1)),
        );
        q.add_rate_limited("k".into());
        assert!(q.is_empty());
        assert_eq!(q.num_requeues(&"k".to_string()), 1);
        let lease = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap().unwrap();
        assert_eq!(lease.key(), "k");
        q.forget(lease.key());
        assert_eq!(q.num_requeues(&"k".to_string()), 0);
    }
}
