//! Pod list+watch as a [`WatchSource`].

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::{future, stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tether_core::{PrimaryObject, WatchEvent, WatchSource};
use tracing::{debug, info, warn};

pub struct PodSource {
    api: Api<Pod>,
}

impl PodSource {
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        info!(ns = %namespace, "pod source scoped to namespace");
        Self { api: Api::namespaced(client, namespace) }
    }

    pub fn all(client: Client) -> Self { Self { api: Api::all(client) } }
}

/// Keep the identity and the few fields the derived resource needs.
pub fn project_pod(pod: &Pod) -> Option<PrimaryObject> {
    let Some(name) = pod.metadata.name.clone() else {
        warn!("pod without metadata.name; skipping");
        return None;
    };
    let status = pod.status.as_ref();
    Some(PrimaryObject {
        namespace: pod.metadata.namespace.clone(),
        name,
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        address: status.and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()),
        phase: status.and_then(|s| s.phase.clone()),
    })
}

fn into_event(ev: watcher::Event<Pod>) -> Option<WatchEvent> {
    match ev {
        watcher::Event::Applied(p) => project_pod(&p).map(WatchEvent::Added),
        watcher::Event::Deleted(p) => project_pod(&p).map(WatchEvent::Removed),
        watcher::Event::Restarted(list) => {
            debug!(count = list.len(), "pod watch restart");
            Some(WatchEvent::Restarted(list.iter().filter_map(project_pod).collect()))
        }
    }
}

#[async_trait::async_trait]
impl WatchSource for PodSource {
    async fn list(&self) -> Result<Vec<PrimaryObject>> {
        let pods = self.api.list(&ListParams::default()).await.context("listing pods")?;
        Ok(pods.items.iter().filter_map(project_pod).collect())
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>> {
        watcher::watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .filter_map(|res| {
                future::ready(match res {
                    Ok(ev) => into_event(ev).map(Ok),
                    Err(e) => Some(Err(anyhow::Error::new(e).context("pod watch"))),
                })
            })
            .boxed()
    }
}
