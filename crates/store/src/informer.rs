//! Informer: list, mark synced, then apply watch events to the cache and queue.
//!
//! For every event the cache is mutated *before* the key is enqueued, so the first
//! dequeue of a key observes the state that triggered it.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use metrics::counter;
use tether_core::{CacheError, ObjectCache, PrimaryKey, WatchEvent, WatchSource};
use tether_queue::WorkQueue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Cache;

/// Apply one watch event: mutate the cache, then enqueue the affected key(s).
pub fn apply_event(cache: &Cache, queue: &WorkQueue<PrimaryKey>, ev: WatchEvent) -> Result<(), CacheError> {
    match ev {
        WatchEvent::Added(obj) => {
            counter!("informer_events_total", 1u64, "kind" => "added");
            let key = obj.key();
            cache.upsert(key.clone(), obj)?;
            debug!(key = %key, "added");
            queue.add(key);
        }
        WatchEvent::Removed(obj) => {
            counter!("informer_events_total", 1u64, "kind" => "removed");
            let key = obj.key();
            cache.remove(&key)?;
            debug!(key = %key, "removed");
            queue.add(key);
        }
        WatchEvent::Restarted(objs) => {
            counter!("informer_events_total", 1u64, "kind" => "restarted");
            let listed = objs.len();
            let changed = cache.replace(objs)?;
            debug!(listed, changed = changed.len(), "watch restarted");
            for key in changed { queue.add(key); }
        }
    }
    Ok(())
}

/// Run until `cancel` fires or the watch stream ends. A failed list is returned as an
/// error. Running again relists and enqueues only the keys that changed meanwhile.
pub async fn run_informer<S>(
    source: Arc<S>,
    cache: Arc<Cache>,
    queue: Arc<WorkQueue<PrimaryKey>>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: WatchSource + ?Sized,
{
    let objs = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("informer cancelled during list");
            return Ok(());
        }
        res = source.list() => res.context("list of primary objects")?,
    };
    let listed = objs.len();
    let changed = cache.replace(objs)?;
    for key in changed { queue.add(key); }
    cache.mark_synced();
    info!(objects = listed, "informer synced");

    let mut stream = source.watch();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("informer cancelled");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(ev)) => {
                    if let Err(e) = apply_event(&cache, &queue, ev) {
                        warn!(error = %e, "dropping watch event");
                    }
                }
                Some(Err(e)) => {
                    counter!("informer_watch_errors_total", 1u64);
                    warn!(error = %e, "watch stream error");
                }
                None => {
                    warn!("watch stream ended");
                    break;
                }
            }
        }
    }
    info!("informer stopped");
    Ok(())
}
