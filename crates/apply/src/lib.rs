//! xposer apply: single-shot creation of dependent Services/Ingresses and
//! classification of the API outcome.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{api::{Api, PostParams}, Client};
use metrics::{counter, histogram};
use tracing::{debug, warn};
use xposer_core::{DependentKind, DesiredIngress, DesiredService, MANAGED_BY_LABEL, MANAGER_NAME};

/// Ingress path type used for every rule we create.
pub const PATH_TYPE_PREFIX: &str = "Prefix";

/// Identity of a dependent object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependentRef {
    pub kind: DependentKind,
    pub namespace: String,
    pub name: String,
}

impl DependentRef {
    pub fn service(spec: &DesiredService) -> Self {
        Self { kind: DependentKind::Service, namespace: spec.namespace.clone(), name: spec.name.clone() }
    }

    pub fn ingress(spec: &DesiredIngress) -> Self {
        Self { kind: DependentKind::Ingress, namespace: spec.namespace.clone(), name: spec.name.clone() }
    }
}

impl fmt::Display for DependentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub target: DependentRef,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The object is already there. Callers treat this as success.
    #[error("{0} already exists")]
    AlreadyExists(DependentRef),
    #[error("creating {target} failed (transient): {message}")]
    Transient { target: DependentRef, message: String },
    #[error("creating {target} failed: {message}")]
    Permanent { target: DependentRef, message: String },
}

impl ApplyError {
    pub fn target(&self) -> &DependentRef {
        match self {
            ApplyError::AlreadyExists(t) => t,
            ApplyError::Transient { target, .. } | ApplyError::Permanent { target, .. } => target,
        }
    }

    pub fn is_transient(&self) -> bool { matches!(self, ApplyError::Transient { .. }) }
}

/// Create operations for dependent objects. One attempt per call; no
/// update-if-exists.
#[async_trait::async_trait]
pub trait ResourceApplier: Send + Sync {
    async fn create_service(&self, spec: &DesiredService) -> Result<Created, ApplyError>;
    async fn create_ingress(&self, spec: &DesiredIngress) -> Result<Created, ApplyError>;
}

/// Applier talking to the API server through kube-rs.
#[derive(Clone)]
pub struct KubeApplier {
    client: Client,
}

impl KubeApplier {
    pub fn new(client: Client) -> Self { Self { client } }

    fn post_params() -> PostParams {
        PostParams { field_manager: Some(MANAGER_NAME.to_string()), ..Default::default() }
    }
}

#[async_trait::async_trait]
impl ResourceApplier for KubeApplier {
    async fn create_service(&self, spec: &DesiredService) -> Result<Created, ApplyError> {
        let target = DependentRef::service(spec);
        let t0 = Instant::now();
        counter!("apply_attempts", 1, "kind" => target.kind.as_str());
        let api: Api<Service> = Api::namespaced(self.client.clone(), &spec.namespace);
        let res = api.create(&Self::post_params(), &service_from(spec)).await.map(|s| s.metadata.uid);
        record(target, t0, res)
    }

    async fn create_ingress(&self, spec: &DesiredIngress) -> Result<Created, ApplyError> {
        let target = DependentRef::ingress(spec);
        let t0 = Instant::now();
        counter!("apply_attempts", 1, "kind" => target.kind.as_str());
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &spec.namespace);
        let res = api.create(&Self::post_params(), &ingress_from(spec)).await.map(|i| i.metadata.uid);
        record(target, t0, res)
    }
}

fn record(target: DependentRef, t0: Instant, res: Result<Option<String>, kube::Error>) -> Result<Created, ApplyError> {
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => target.kind.as_str());
    match res {
        Ok(uid) => {
            counter!("apply_ok", 1, "kind" => target.kind.as_str());
            debug!(dependent = %target, "created");
            Ok(Created { target, uid })
        }
        Err(e) => {
            let err = classify(target, &e);
            match &err {
                ApplyError::AlreadyExists(_) => {
                    counter!("apply_exists", 1, "kind" => err.target().kind.as_str());
                }
                _ => {
                    counter!("apply_err", 1, "kind" => err.target().kind.as_str());
                    warn!(dependent = %err.target(), error = %e, transient = err.is_transient(), "create failed");
                }
            }
            Err(err)
        }
    }
}

/// Map a kube error onto the apply taxonomy.
pub fn classify(target: DependentRef, e: &kube::Error) -> ApplyError {
    match e {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => ApplyError::AlreadyExists(target),
        kube::Error::Api(resp) => {
            let transient = resp.code == 429
                || resp.code >= 500
                || matches!(
                    resp.reason.as_str(),
                    "ServerTimeout" | "Timeout" | "TooManyRequests" | "InternalError" | "ServiceUnavailable"
                );
            let message = format!("{} ({}): {}", resp.reason, resp.code, resp.message);
            if transient {
                ApplyError::Transient { target, message }
            } else {
                ApplyError::Permanent { target, message }
            }
        }
        kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) | kube::Error::HttpError(_) => {
            ApplyError::Permanent { target, message: e.to_string() }
        }
        // Connection, TLS and service-layer failures.
        _ => ApplyError::Transient { target, message: e.to_string() },
    }
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string())])
}

pub fn service_from(spec: &DesiredService) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(spec.selector_labels.clone()),
            ports: Some(vec![ServicePort { port: spec.port, ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ingress_from(spec: &DesiredIngress) -> Ingress {
    let path = HTTPIngressPath {
        path: Some(spec.path_prefix.clone()),
        path_type: PATH_TYPE_PREFIX.to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: spec.backend_service_name.clone(),
                port: Some(ServiceBackendPort { number: Some(spec.backend_port), name: None }),
            }),
            resource: None,
        },
    };
    Ingress {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(spec.host.clone()),
                http: Some(HTTPIngressRuleValue { paths: vec![path] }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
