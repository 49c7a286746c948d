#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use xposer_apply::{ApplyError, Created, DependentRef, ResourceApplier};
use xposer_controller::{Context, ControllerConfig};
use xposer_core::{CacheSyncError, DesiredIngress, DesiredService, WorkloadCache, WorkloadRef, WorkloadSnapshot};

pub fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn snapshot(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> WorkloadSnapshot {
    WorkloadSnapshot { labels: map(labels), annotations: map(annotations) }
}

/// In-memory cache with a controllable sync gate.
pub struct FakeCache {
    objects: Mutex<BTreeMap<WorkloadRef, WorkloadSnapshot>>,
    synced: watch::Sender<Option<Result<(), CacheSyncError>>>,
}

impl FakeCache {
    pub fn synced() -> Arc<Self> {
        let c = Self::unsynced();
        c.mark_synced();
        c
    }

    pub fn unsynced() -> Arc<Self> {
        let (synced, _) = watch::channel(None);
        Arc::new(Self { objects: Mutex::new(BTreeMap::new()), synced })
    }

    pub fn mark_synced(&self) { self.synced.send_replace(Some(Ok(()))); }

    pub fn fail_sync(&self, why: &str) { self.synced.send_replace(Some(Err(CacheSyncError(why.to_string())))); }

    pub fn put(&self, ns: &str, name: &str, snap: WorkloadSnapshot) {
        self.objects.lock().unwrap().insert(WorkloadRef::new(ns, name), snap);
    }

    pub fn remove(&self, ns: &str, name: &str) { self.objects.lock().unwrap().remove(&WorkloadRef::new(ns, name)); }
}

#[async_trait::async_trait]
impl WorkloadCache for FakeCache {
    fn get(&self, workload: &WorkloadRef) -> Option<WorkloadSnapshot> { self.objects.lock().unwrap().get(workload).cloned() }

    fn keys(&self) -> Vec<WorkloadRef> { self.objects.lock().unwrap().keys().cloned().collect() }

    async fn wait_until_synced(&self) -> Result<(), CacheSyncError> {
        let mut rx = self.synced.subscribe();
        loop {
            if let Some(res) = rx.borrow_and_update().clone() {
                return res;
            }
            if rx.changed().await.is_err() {
                return Err(CacheSyncError("gate dropped".into()));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Service(DesiredService),
    Ingress(DesiredIngress),
}

/// Applier that remembers what it created, answers `AlreadyExists` for
/// repeats and can be scripted to fail.
#[derive(Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<Call>>,
    existing: Mutex<HashSet<DependentRef>>,
    service_failures: Mutex<VecDeque<Failure>>,
    ingress_failures: Mutex<VecDeque<Failure>>,
    delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transient,
    Permanent,
}

impl RecordingApplier {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    pub fn service_calls(&self) -> Vec<DesiredService> {
        self.calls().into_iter().filter_map(|c| match c { Call::Service(s) => Some(s), _ => None }).collect()
    }

    pub fn ingress_calls(&self) -> Vec<DesiredIngress> {
        self.calls().into_iter().filter_map(|c| match c { Call::Ingress(i) => Some(i), _ => None }).collect()
    }

    pub fn fail_service(&self, f: Failure) { self.service_failures.lock().unwrap().push_back(f); }
    pub fn fail_ingress(&self, f: Failure) { self.ingress_failures.lock().unwrap().push_back(f); }
    pub fn respond_after(&self, d: Duration) { *self.delay.lock().unwrap() = Some(d); }

    async fn create(&self, target: DependentRef, call: Call, failures: &Mutex<VecDeque<Failure>>) -> Result<Created, ApplyError> {
        self.calls.lock().unwrap().push(call);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let failure = failures.lock().unwrap().pop_front();
        match failure {
            Some(Failure::Transient) => {
                return Err(ApplyError::Transient { target, message: "503 ServiceUnavailable".into() })
            }
            Some(Failure::Permanent) => return Err(ApplyError::Permanent { target, message: "403 Forbidden".into() }),
            None => {}
        }
        if !self.existing.lock().unwrap().insert(target.clone()) {
            return Err(ApplyError::AlreadyExists(target));
        }
        Ok(Created { target, uid: None })
    }
}

#[async_trait::async_trait]
impl ResourceApplier for RecordingApplier {
    async fn create_service(&self, spec: &DesiredService) -> Result<Created, ApplyError> {
        self.create(DependentRef::service(spec), Call::Service(spec.clone()), &self.service_failures).await
    }

    async fn create_ingress(&self, spec: &DesiredIngress) -> Result<Created, ApplyError> {
        self.create(DependentRef::ingress(spec), Call::Ingress(spec.clone()), &self.ingress_failures).await
    }
}

pub fn fast_config() -> ControllerConfig {
    let mut cfg = ControllerConfig::default();
    cfg.queue.backoff_base = Duration::from_millis(10);
    cfg.queue.backoff_max = Duration::from_millis(200);
    cfg.sync_timeout = Duration::from_secs(2);
    cfg.apply_timeout = Duration::from_secs(1);
    cfg
}

pub fn context(cache: &Arc<FakeCache>, applier: &Arc<RecordingApplier>, cfg: ControllerConfig) -> Arc<Context> {
    Context::new(cache.clone(), applier.clone(), cfg)
}

/// Poll until `cond` holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
