#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use tether_core::{
    DerivedKey, DerivedPayload, DerivedResource, PrimaryObject, ResourceStore, StoreError, WatchEvent, WatchSource,
};

pub fn pod(name: &str, uid: &str, ip: &str) -> PrimaryObject {
    PrimaryObject {
        namespace: Some("default".into()),
        name: name.into(),
        uid: uid.into(),
        address: Some(ip.into()),
        phase: Some("Running".into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(DerivedKey, DerivedPayload),
    Delete(DerivedKey),
}

/// In-memory store with the idempotency errors a real API server returns,
/// plus knobs for injected failures, panics and latency.
#[derive(Default)]
pub struct FakeStore {
    pub objects: Mutex<BTreeMap<DerivedKey, DerivedPayload>>,
    pub calls: Mutex<Vec<Call>>,
    pub fail_creates: AtomicUsize,
    pub fail_list: AtomicBool,
    pub panic_next_create: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
    pub in_progress: Mutex<BTreeSet<DerivedKey>>,
    pub overlaps: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    pub fn creates(&self) -> usize { self.calls().iter().filter(|c| matches!(c, Call::Create(..))).count() }

    pub fn contains(&self, id: &DerivedKey) -> bool { self.objects.lock().unwrap().contains_key(id) }

    async fn enter(&self, id: &DerivedKey) {
        let fresh = self.in_progress.lock().unwrap().insert(id.clone());
        if !fresh { self.overlaps.fetch_add(1, Ordering::SeqCst); }
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay { tokio::time::sleep(d).await; }
    }

    fn leave(&self, id: &DerivedKey) { self.in_progress.lock().unwrap().remove(id); }
}

#[async_trait::async_trait]
impl ResourceStore for FakeStore {
    async fn create(&self, id: &DerivedKey, payload: &DerivedPayload) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(Call::Create(id.clone(), payload.clone()));
        if self.panic_next_create.swap(false, Ordering::SeqCst) {
            panic!("store exploded");
        }
        self.enter(id).await;
        let res = if self.fail_creates.load(Ordering::SeqCst) > 0 {
            self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            Err(StoreError::Api { code: 500, message: "internal error".into() })
        } else {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(id) {
                Err(StoreError::AlreadyExists(id.to_string()))
            } else {
                objects.insert(id.clone(), payload.clone());
                Ok(())
            }
        };
        self.leave(id);
        res
    }

    async fn delete(&self, id: &DerivedKey) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(Call::Delete(id.clone()));
        self.enter(id).await;
        let res = match self.objects.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(id.to_string())),
        };
        self.leave(id);
        res
    }

    async fn list(&self) -> Result<Vec<DerivedResource>, StoreError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("connection reset".into()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(id, payload)| DerivedResource { id: id.clone(), payload: payload.clone() })
            .collect())
    }
}

pub type EventTx = mpsc::UnboundedSender<anyhow::Result<WatchEvent>>;

pub struct FakeSource {
    pub listing: Mutex<Vec<PrimaryObject>>,
    pub fail_list: bool,
    pub list_delay: Option<Duration>,
    pub list_calls: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Result<WatchEvent>>>>,
}

impl FakeSource {
    pub fn new(listing: Vec<PrimaryObject>) -> (Self, EventTx) {
        let (tx, rx) = mpsc::unbounded();
        let source = Self {
            listing: Mutex::new(listing),
            fail_list: false,
            list_delay: None,
            list_calls: AtomicUsize::new(0),
            events: Mutex::new(Some(rx)),
        };
        (source, tx)
    }
}

#[async_trait::async_trait]
impl WatchSource for FakeSource {
    async fn list(&self) -> anyhow::Result<Vec<PrimaryObject>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.list_delay { tokio::time::sleep(d).await; }
        if self.fail_list { anyhow::bail!("cluster unreachable"); }
        Ok(self.listing.lock().unwrap().clone())
    }

    /// The first call drains the event channel; later calls never yield.
    fn watch(&self) -> BoxStream<'static, anyhow::Result<WatchEvent>> {
        let rx = self.events.lock().unwrap().take();
        Box::pin(async_stream::stream! {
            let Some(mut rx) = rx else {
                futures::future::pending::<()>().await;
                return;
            };
            while let Some(ev) = rx.next().await {
                yield ev;
            }
        })
    }
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() { return true; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
