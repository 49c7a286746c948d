//! xposer core: workload identity, snapshots, desired dependents and the
//! collaborator traits the controller is written against.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod derivation;

pub use derivation::{derive, parse_port, Derived, DerivationError};

/// Label holding the cluster-internal port to expose.
pub const PORT_LABEL: &str = "expose/port";
/// Annotation holding the external host for the Ingress rule.
pub const HOST_ANNOTATION: &str = "expose/host";
/// Annotation holding the path prefix for the Ingress rule.
pub const PATH_ANNOTATION: &str = "expose/path";

/// Label stamped on every dependent object we create.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "xposer";

pub const SERVICE_SUFFIX: &str = "-svc";
pub const INGRESS_SUFFIX: &str = "-ingress";

/// Identity of a watched workload. Doubles as the work queue key via its
/// `namespace/name` string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Queue key, `namespace/name`.
    pub fn key(&self) -> String { self.to_string() }

    pub fn service_name(&self) -> String { format!("{}{}", self.name, SERVICE_SUFFIX) }
    pub fn ingress_name(&self) -> String { format!("{}{}", self.name, INGRESS_SUFFIX) }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for WorkloadRef {
    type Err = IdentityError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => Ok(Self::new(ns, name)),
            (Some(_), None, None) => Err(IdentityError::MissingNamespace(key.to_string())),
            _ => Err(IdentityError::MalformedKey(key.to_string())),
        }
    }
}

/// Failure to derive a workload identity from a notification or queue key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("object or key has no namespace: {0:?}")]
    MissingNamespace(String),
    #[error("malformed workload key: {0:?}")]
    MalformedKey(String),
}

/// Read-only view of a workload as held by the local cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl WorkloadSnapshot {
    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(String::as_str) }
    pub fn annotation(&self, key: &str) -> Option<&str> { self.annotations.get(key).map(String::as_str) }
}

/// Kind of dependent object xposer creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependentKind {
    Service,
    Ingress,
}

impl DependentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DependentKind::Service => "Service",
            DependentKind::Ingress => "Ingress",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredService {
    pub name: String,
    pub namespace: String,
    pub selector_labels: BTreeMap<String, String>,
    pub port: i32,
}

/// Desired Ingress. Path matching is always prefix based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredIngress {
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub path_prefix: String,
    pub backend_service_name: String,
    pub backend_port: i32,
}

/// Watch notification as seen by the event bridge.
///
/// Identity extraction happens at the adapter boundary; a failed extraction
/// travels with the notification instead of being discovered later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Added(Identity),
    Updated { old: Option<Identity>, new: Identity },
    Deleted(Identity),
}

pub type Identity = Result<WorkloadRef, IdentityError>;

/// Local read cache of workloads, owned by the watch subsystem.
#[async_trait::async_trait]
pub trait WorkloadCache: Send + Sync {
    /// Point lookup. `None` when the object is not (or no longer) cached.
    fn get(&self, workload: &WorkloadRef) -> Option<WorkloadSnapshot>;

    /// Every workload currently cached that has a usable identity.
    fn keys(&self) -> Vec<WorkloadRef>;

    /// Resolves once the cache holds an initial full listing. Errors when the
    /// underlying watch went away before that happened.
    async fn wait_until_synced(&self) -> Result<(), CacheSyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache sync failed: {0}")]
pub struct CacheSyncError(pub String);

pub mod prelude {
    pub use super::{
        derive, CacheSyncError, DependentKind, Derived, DerivationError, DesiredIngress, DesiredService, Identity,
        IdentityError, Notification, WorkloadCache, WorkloadRef, WorkloadSnapshot,
    };
}
