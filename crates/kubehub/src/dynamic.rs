//! Derived resources as dynamic objects: the only place the typed payload meets the wire.

#![forbid(unsafe_code)]

use std::time::Instant;

use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tether_core::{DerivedKey, DerivedPayload, DerivedResource, ResourceStore, StoreError};
use tracing::warn;

/// Which custom resource the derived records are written as, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespace: String,
}

impl Default for TargetResource {
    fn default() -> Self {
        Self {
            group: "stable.example.com".into(),
            version: "v1".into(),
            kind: "Testcr".into(),
            plural: "testcrs".into(),
            namespace: "default".into(),
        }
    }
}

impl TargetResource {
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

pub struct DynamicStore {
    api: Api<DynamicObject>,
    ar: ApiResource,
    namespace: String,
}

impl DynamicStore {
    pub fn new(client: Client, target: &TargetResource) -> Self {
        let ar = target.api_resource();
        let api = Api::namespaced_with(client, &target.namespace, &ar);
        Self { api, ar, namespace: target.namespace.clone() }
    }
}

pub fn to_dynamic(ar: &ApiResource, namespace: &str, id: &DerivedKey, payload: &DerivedPayload) -> Result<DynamicObject, StoreError> {
    let spec = serde_json::to_value(payload).map_err(|e| StoreError::Transport(format!("encoding payload: {}", e)))?;
    Ok(DynamicObject::new(id.as_str(), ar).within(namespace).data(serde_json::json!({ "spec": spec })))
}

/// `None` when the object has no name or its spec does not decode as a payload.
pub fn from_dynamic(obj: &DynamicObject) -> Option<DerivedResource> {
    let name = obj.metadata.name.as_deref()?;
    let spec = obj.data.get("spec")?;
    let payload: DerivedPayload = serde_json::from_value(spec.clone()).ok()?;
    Some(DerivedResource { id: DerivedKey::from_stored(name), payload })
}

pub fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        kube::Error::Api(ae) => StoreError::Api { code: ae.code, message: ae.message },
        other => StoreError::Transport(other.to_string()),
    }
}

fn observe(op: &'static str, started: Instant, res: &Result<(), StoreError>) {
    histogram!("store_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
    if res.is_err() { counter!("store_call_errors_total", 1u64, "op" => op); }
}

#[async_trait::async_trait]
impl ResourceStore for DynamicStore {
    async fn create(&self, id: &DerivedKey, payload: &DerivedPayload) -> Result<(), StoreError> {
        let started = Instant::now();
        let obj = to_dynamic(&self.ar, &self.namespace, id, payload)?;
        let res = self.api.create(&PostParams::default(), &obj).await.map(|_| ()).map_err(classify);
        observe("create", started, &res);
        res
    }

    async fn delete(&self, id: &DerivedKey) -> Result<(), StoreError> {
        let started = Instant::now();
        let res = self.api.delete(id.as_str(), &DeleteParams::default()).await.map(|_| ()).map_err(classify);
        observe("delete", started, &res);
        res
    }

    async fn list(&self) -> Result<Vec<DerivedResource>, StoreError> {
        let list = self.api.list(&ListParams::default()).await.map_err(classify)?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            match from_dynamic(obj) {
                Some(r) => out.push(r),
                None => warn!(name = ?obj.metadata.name, "derived object with unreadable spec; skipping"),
            }
        }
        Ok(out)
    }
}
