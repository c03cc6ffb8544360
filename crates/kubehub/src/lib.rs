//! Tether kubehub: kube client wiring and the adapters the controller consumes.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client,
};
use tracing::info;

pub mod dynamic;
pub mod pods;

pub use dynamic::{DynamicStore, TargetResource};
pub use pods::PodSource;

/// Build a client from an explicit kubeconfig path, or fall back to the
/// in-cluster / `$KUBECONFIG` discovery `kube` does by default.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?;
            info!(cluster_url = %cfg.cluster_url, "kube client configured from file");
            Client::try_from(cfg).context("constructing kube client")
        }
        None => Client::try_default().await.context("constructing default kube client"),
    }
}
