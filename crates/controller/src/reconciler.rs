//! The worker loop: dequeue a key, consult the cache, create or delete the derived resource.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tether_core::{
    CacheError, DerivedKey, DerivedPayload, KeyError, ObjectCache, PrimaryKey, ResourceStore, StoreError,
};
use tether_queue::WorkQueue;
use tracing::{debug, error, info, warn};

/// What happens to a key whose reconcile failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Log and drop the event; the next event for the key is the only recovery.
    #[default]
    Drop,
    /// Requeue through the queue's backoff, giving up after `max_retries` attempts.
    Requeue { max_retries: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// Create hit an existing resource with the same identifier.
    AlreadyPresent,
    Deleted,
    /// Delete found nothing to remove.
    AlreadyAbsent,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::AlreadyPresent => "already_present",
            Outcome::Deleted => "deleted",
            Outcome::AlreadyAbsent => "already_absent",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("deriving resource id: {0}")]
    Key(#[from] KeyError),
    #[error("cache lookup: {0}")]
    Cache(#[from] CacheError),
    #[error("create {id}: {source}")]
    Create { id: DerivedKey, source: StoreError },
    #[error("delete {id}: {source}")]
    Delete { id: DerivedKey, source: StoreError },
}

impl ReconcileError {
    /// A malformed key and a poisoned cache fail the same way every time.
    pub fn is_retryable(&self) -> bool { !matches!(self, ReconcileError::Key(_) | ReconcileError::Cache(_)) }

    fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Key(_) => "key",
            ReconcileError::Cache(_) => "cache",
            ReconcileError::Create { .. } => "create",
            ReconcileError::Delete { .. } => "delete",
        }
    }
}

pub struct Reconciler {
    cache: Arc<dyn ObjectCache>,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue<PrimaryKey>>,
    retry: RetryPolicy,
    report: bool,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn ObjectCache>, store: Arc<dyn ResourceStore>, queue: Arc<WorkQueue<PrimaryKey>>) -> Self {
        Self { cache, store, queue, retry: RetryPolicy::Drop, report: false }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Log the derived resources after every processed key.
    pub fn with_report(mut self, report: bool) -> Self {
        self.report = report;
        self
    }

    /// Converge the derived resource for `key` with what the cache holds right now.
    pub async fn reconcile(&self, key: &PrimaryKey) -> Result<Outcome, ReconcileError> {
        let id = DerivedKey::for_primary(key)?;
        match self.cache.get(key)? {
            Some(obj) => {
                let payload = DerivedPayload::from_object(key, &obj);
                info!(key = %key, id = %id, "add: creating derived resource");
                match self.store.create(&id, &payload).await {
                    Ok(()) => Ok(Outcome::Created),
                    Err(StoreError::AlreadyExists(msg)) => {
                        debug!(key = %key, id = %id, msg = %msg, "derived resource already exists");
                        Ok(Outcome::AlreadyPresent)
                    }
                    Err(source) => Err(ReconcileError::Create { id, source }),
                }
            }
            None => {
                info!(key = %key, id = %id, "delete: removing derived resource");
                match self.store.delete(&id).await {
                    Ok(()) => Ok(Outcome::Deleted),
                    Err(StoreError::NotFound(msg)) => {
                        debug!(key = %key, id = %id, msg = %msg, "derived resource already gone");
                        Ok(Outcome::AlreadyAbsent)
                    }
                    Err(source) => Err(ReconcileError::Delete { id, source }),
                }
            }
        }
    }

    /// Handle one key end to end. Returns `false` once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(lease) = self.queue.get().await else {
            info!("queue shut down; worker exiting");
            return false;
        };
        let key = lease.key().clone();
        let started = Instant::now();
        let res = AssertUnwindSafe(self.reconcile(&key)).catch_unwind().await;
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(Ok(outcome)) => {
                counter!("reconcile_total", 1u64, "outcome" => outcome.as_str());
                debug!(key = %key, outcome = outcome.as_str(), "reconciled");
                self.queue.forget(&key);
            }
            Ok(Err(e)) => self.handle_error(&key, e),
            Err(_) => {
                counter!("reconcile_panics_total", 1u64);
                error!(key = %key, "reconcile panicked; key released");
            }
        }
        drop(lease);
        if self.report { self.report_derived().await; }
        true
    }

    fn handle_error(&self, key: &PrimaryKey, e: ReconcileError) {
        counter!("reconcile_errors_total", 1u64, "kind" => e.kind());
        match self.retry {
            RetryPolicy::Requeue { max_retries } if e.is_retryable() => {
                let attempts = self.queue.num_requeues(key);
                if attempts < max_retries {
                    warn!(key = %key, error = %e, attempt = attempts + 1, "reconcile failed; requeueing with backoff");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(key = %key, error = %e, attempts, "reconcile failed; retries exhausted, dropping event");
                    self.queue.forget(key);
                }
            }
            _ => warn!(key = %key, error = %e, "reconcile failed; dropping event"),
        }
    }

    async fn report_derived(&self) {
        match self.store.list().await {
            Ok(items) => {
                info!(count = items.len(), "current derived resources");
                for r in &items {
                    debug!(id = %r.id, key = %r.payload.pod_key, name = %r.payload.pod_name, ip = %r.payload.pod_ip, uid = %r.payload.pod_uid, "derived");
                }
            }
            Err(e) => warn!(error = %e, "listing derived resources failed"),
        }
    }

    /// Process keys until the queue shuts down.
    pub async fn run(self: Arc<Self>) {
        while self.process_next().await {}
    }
}
