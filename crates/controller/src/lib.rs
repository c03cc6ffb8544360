//! Tether controller: mirrors every observed pod as a derived resource.
//!
//! An informer task applies watch events to the [`Cache`] and pushes keys into a
//! [`WorkQueue`]; a pool of reconcilers drains the queue. Workers start only after
//! the initial listing has filled the cache. When the watch ends the informer is
//! restarted, relisting into the cache. A single cancellation token stops both sides.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use tether_core::{ObjectCache, PrimaryKey, ResourceStore, WatchSource};
use tether_queue::WorkQueue;
use tether_store::{run_informer, Cache};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod reconciler;

pub use reconciler::{Outcome, ReconcileError, Reconciler, RetryPolicy};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// List derived resources after each processed key.
    pub report: bool,
    pub queue_name: String,
    /// Pause before relisting once the watch has ended or a relist failed.
    pub relist_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            retry: RetryPolicy::Drop,
            report: true,
            queue_name: "pods".into(),
            relist_delay: Duration::from_secs(1),
        }
    }
}

pub struct Controller {
    source: Arc<dyn WatchSource>,
    store: Arc<dyn ResourceStore>,
    cache: Arc<Cache>,
    queue: Arc<WorkQueue<PrimaryKey>>,
    cfg: ControllerConfig,
}

impl Controller {
    pub fn new(source: Arc<dyn WatchSource>, store: Arc<dyn ResourceStore>, cfg: ControllerConfig) -> Self {
        let queue = WorkQueue::new(cfg.queue_name.clone());
        Self { source, store, cache: Arc::new(Cache::new()), queue, cfg }
    }

    pub fn cache(&self) -> &Arc<Cache> { &self.cache }

    pub fn queue(&self) -> &Arc<WorkQueue<PrimaryKey>> { &self.queue }

    fn reconciler(&self) -> Arc<Reconciler> {
        let cache: Arc<dyn ObjectCache> = self.cache.clone();
        Arc::new(
            Reconciler::new(cache, Arc::clone(&self.store), Arc::clone(&self.queue))
                .with_retry(self.cfg.retry)
                .with_report(self.cfg.report),
        )
    }

    fn spawn_informer(&self, cancel: &CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(run_informer(
            Arc::clone(&self.source),
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            cancel.child_token(),
        ))
    }

    /// Run until `cancel` fires. Fails only if the first list cannot complete.
    /// After that, an ended watch or a failed relist is retried after `relist_delay`.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut informer = self.spawn_informer(&cancel);

        tokio::select! {
            _ = self.cache.wait_synced() => {}
            _ = cancel.cancelled() => {
                info!("cancelled before cache sync");
                self.queue.shutdown();
                informer.abort();
                return Ok(());
            }
            res = &mut informer => {
                if let Err(e) = join_result(res) {
                    self.queue.shutdown();
                    return Err(e);
                }
                if cancel.is_cancelled() {
                    info!("cancelled before cache sync");
                    self.queue.shutdown();
                    return Ok(());
                }
                if !self.cache.has_synced() {
                    self.queue.shutdown();
                    return Err(anyhow!("informer stopped before cache sync"));
                }
                warn!("watch ended right after sync; relisting");
                informer = self.spawn_informer(&cancel);
            }
        }

        let workers = self.cfg.workers.max(1);
        let reconciler = self.reconciler();
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|i| {
                let r = Arc::clone(&reconciler);
                tokio::spawn(async move {
                    r.run().await;
                    debug!(worker = i, "worker stopped");
                })
            })
            .collect();
        info!(workers, cached = ?self.cache.len().ok(), pending = self.queue.len(), "controller started");

        let mut informer_done = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = &mut informer => {
                    match join_result(res) {
                        Ok(()) => warn!("watch ended; relisting"),
                        Err(e) => warn!(error = %format!("{:#}", e), "informer failed; relisting"),
                    }
                    counter!("informer_restarts_total", 1u64);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            informer_done = true;
                            break;
                        }
                        _ = tokio::time::sleep(self.cfg.relist_delay) => {}
                    }
                    informer = self.spawn_informer(&cancel);
                }
            }
        }

        info!("shutting down controller");
        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await { error!(error = %e, "worker task failed"); }
        }
        if !informer_done {
            if let Err(e) = join_result(informer.await) { warn!(error = %e, "informer ended with error"); }
        }
        info!("controller stopped");
        Ok(())
    }
}

fn join_result(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.context("informer task failed")?
}
