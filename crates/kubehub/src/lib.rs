//! xposer kubehub: client config loading, Deployment watch and the reflector
//! backed workload cache.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use xposer_core::{CacheSyncError, Identity, IdentityError, Notification, WorkloadCache, WorkloadRef, WorkloadSnapshot};

/// Build a client. An explicit kubeconfig wins; if it cannot be loaded we fall
/// back to the in-cluster service account. Without a path the usual inference
/// (`KUBECONFIG`, `~/.kube/config`, in-cluster) applies.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => match from_kubeconfig(path).await {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load kubeconfig; trying in-cluster config");
                Config::incluster().context("loading in-cluster config")?
            }
        },
        None => Config::infer().await.context("inferring kube config")?,
    };
    info!(cluster_url = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

async fn from_kubeconfig(path: &Path) -> Result<Config> {
    let kc = Kubeconfig::read_from(path).context("reading kubeconfig")?;
    Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.context("loading kubeconfig")
}

pub fn identity_of(d: &Deployment) -> Identity {
    let name = d.metadata.name.as_deref().filter(|n| !n.is_empty()).ok_or(IdentityError::MissingName)?;
    let ns = d
        .metadata
        .namespace
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| IdentityError::MissingNamespace(name.to_string()))?;
    Ok(WorkloadRef::new(ns, name))
}

pub fn snapshot_of(d: &Deployment) -> WorkloadSnapshot {
    WorkloadSnapshot {
        labels: d.metadata.labels.clone().unwrap_or_default(),
        annotations: d.metadata.annotations.clone().unwrap_or_default(),
    }
}

/// Turns raw watcher events into add/update/delete notifications by
/// remembering which keys have been seen.
#[derive(Debug, Default)]
pub struct NotificationTranslator {
    seen: FxHashSet<WorkloadRef>,
}

impl NotificationTranslator {
    pub fn translate(&mut self, ev: Event<Deployment>) -> Vec<Notification> {
        match ev {
            Event::Applied(d) => vec![self.applied(identity_of(&d))],
            Event::Deleted(d) => {
                let id = identity_of(&d);
                if let Ok(r) = &id {
                    self.seen.remove(r);
                }
                vec![Notification::Deleted(id)]
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let previous = std::mem::take(&mut self.seen);
                let mut out: Vec<Notification> = Vec::with_capacity(list.len());
                for d in list.iter() {
                    let id = identity_of(d);
                    out.push(match &id {
                        Ok(r) if previous.contains(r) => {
                            self.seen.insert(r.clone());
                            Notification::Updated { old: Some(Ok(r.clone())), new: id }
                        }
                        _ => self.applied(id),
                    });
                }
                let mut gone: Vec<_> = previous.into_iter().filter(|r| !self.seen.contains(r)).collect();
                gone.sort();
                out.extend(gone.into_iter().map(|r| Notification::Deleted(Ok(r))));
                out
            }
        }
    }

    fn applied(&mut self, id: Identity) -> Notification {
        match &id {
            Ok(r) if !self.seen.insert(r.clone()) => Notification::Updated { old: Some(Ok(r.clone())), new: id },
            _ => Notification::Added(id),
        }
    }
}

/// Workload cache backed by a kube-rs reflector store.
#[derive(Clone)]
pub struct ReflectorCache {
    store: Store<Deployment>,
}

impl ReflectorCache {
    pub fn new(store: Store<Deployment>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl WorkloadCache for ReflectorCache {
    fn get(&self, workload: &WorkloadRef) -> Option<WorkloadSnapshot> {
        let key = ObjectRef::new(&workload.name).within(&workload.namespace);
        self.store.get(&key).map(|d| snapshot_of(&d))
    }

    fn keys(&self) -> Vec<WorkloadRef> {
        self.store.state().iter().filter_map(|d| identity_of(d).ok()).collect()
    }

    async fn wait_until_synced(&self) -> Result<(), CacheSyncError> {
        self.store.wait_until_ready().await.map_err(|e| CacheSyncError(e.to_string()))
    }
}

/// Start list+watch for Deployments, feeding the reflector and sending
/// notifications into the provided channel. The task ends when the receiver
/// is dropped or the stream terminates.
pub fn start_watcher(
    client: Client,
    namespace: Option<&str>,
    tx: mpsc::Sender<Notification>,
) -> (ReflectorCache, JoinHandle<()>) {
    let api: Api<Deployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let ns = namespace.map(str::to_string);
    let (reader, writer) = reflector::store();

    let handle = tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff().reflect(writer);
        futures::pin_mut!(stream);
        let mut translator = NotificationTranslator::default();
        info!(ns = ?ns, "deployment watcher started");
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(ev) => {
                    for n in translator.translate(ev) {
                        if tx.send(n).await.is_err() {
                            debug!("notification receiver dropped; stopping watcher");
                            return;
                        }
                    }
                }
                Err(e) => {
                    counter!("watch_errors", 1);
                    warn!(error = %e, "deployment watch error");
                }
            }
        }
        warn!("deployment watcher stream ended");
    });

    (ReflectorCache::new(reader), handle)
}
