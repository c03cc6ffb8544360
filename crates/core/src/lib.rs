//! Tether core types, errors and the seams between watch, cache, queue and store.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod key;

pub use key::{DerivedKey, PrimaryKey, DERIVED_KEY_LEN};

/// Snapshot of a primary object at observation time. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryObject {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: String,
    /// Pod IP, once assigned.
    pub address: Option<String>,
    pub phase: Option<String>,
}

impl PrimaryObject {
    pub fn key(&self) -> PrimaryKey { PrimaryKey::from_parts(self.namespace.as_deref(), &self.name) }
}

/// Spec of a derived resource. Field names follow the `Testcr` schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedPayload {
    #[serde(rename = "podname")]
    pub pod_name: String,
    #[serde(rename = "podip", default)]
    pub pod_ip: String,
    #[serde(rename = "poduid")]
    pub pod_uid: String,
    #[serde(rename = "podkey")]
    pub pod_key: PrimaryKey,
}

impl DerivedPayload {
    pub fn from_object(key: &PrimaryKey, obj: &PrimaryObject) -> Self {
        Self {
            pod_name: obj.name.clone(),
            pod_ip: obj.address.clone().unwrap_or_default(),
            pod_uid: obj.uid.clone(),
            pod_key: key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedResource {
    pub id: DerivedKey,
    pub payload: DerivedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PrimaryObject),
    Removed(PrimaryObject),
    /// Full relist after the transport lost its position.
    Restarted(Vec<PrimaryObject>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty key")]
    Empty,
    #[error("malformed key {0:?} (expect namespace/name or name)")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("object cache lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

/// Keyed store of last-seen primary objects, written by the watch path and read by reconcilers.
pub trait ObjectCache: Send + Sync {
    fn upsert(&self, key: PrimaryKey, obj: PrimaryObject) -> Result<(), CacheError>;
    fn remove(&self, key: &PrimaryKey) -> Result<Option<Arc<PrimaryObject>>, CacheError>;
    fn get(&self, key: &PrimaryKey) -> Result<Option<Arc<PrimaryObject>>, CacheError>;
}

/// List-then-watch source of primary objects.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<PrimaryObject>>;

    /// Lazy, unbounded event stream. Not restartable; call `list` again to recover.
    fn watch(&self) -> BoxStream<'static, anyhow::Result<WatchEvent>>;
}

/// Generic create/delete/list over the derived resource type.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn create(&self, id: &DerivedKey, payload: &DerivedPayload) -> Result<(), StoreError>;
    async fn delete(&self, id: &DerivedKey) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<DerivedResource>, StoreError>;
}

pub mod prelude {
    pub use super::{
        CacheError, DerivedKey, DerivedPayload, DerivedResource, KeyError, ObjectCache, PrimaryKey,
        PrimaryObject, ResourceStore, StoreError, WatchEvent, WatchSource,
    };
}
