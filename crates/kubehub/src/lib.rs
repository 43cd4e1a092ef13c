//! Longhall kubehub: the narrow cluster surface the provisioner talks to.
//!
//! Everything above this crate speaks [`ClusterApi`]. [`KubeCluster`] is the
//! kube-rs implementation bound to a single namespace; [`mock::MockCluster`]
//! is an in-memory stand-in for tests.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::PersistentVolumeClaim};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod ingress;
pub mod mock;

pub use ingress::{EchoIngress, IngressSource, StaticIngress};

/// The two object kinds the provisioner manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Deployment,
    PersistentVolumeClaim,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Deployment => "deployment",
            Kind::PersistentVolumeClaim => "persistentvolumeclaim",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: Kind, name: String },
    #[error("{kind} {name}: {message}")]
    Api { kind: Kind, name: String, code: Option<u16>, message: String },
    #[error("{kind} {name}: cluster call timed out after {}ms", .after.as_millis())]
    Timeout { kind: Kind, name: String, after: Duration },
    #[error("ingress lookup failed: {0}")]
    Ingress(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound { .. }) }

    fn from_kube(kind: Kind, name: &str, e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound { kind, name: name.to_string() },
            kube::Error::Api(ae) => ClusterError::Api { kind, name: name.to_string(), code: Some(ae.code), message: ae.message },
            other => ClusterError::Api { kind, name: name.to_string(), code: None, message: other.to_string() },
        }
    }
}

/// Cluster operations used by provisioning. All calls are scoped to one namespace.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    fn namespace(&self) -> &str;

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError>;
    async fn get_pvc(&self, name: &str) -> Result<PersistentVolumeClaim, ClusterError>;
    async fn delete_pvc(&self, name: &str) -> Result<(), ClusterError>;
    /// Empty `metadata.finalizers` so a terminating claim can go away.
    async fn clear_pvc_finalizers(&self, name: &str) -> Result<(), ClusterError>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError>;
    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError>;
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError>;
    async fn delete_deployment(&self, name: &str) -> Result<(), ClusterError>;
    /// Set replicas through the scale subresource.
    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError>;
}

/// Build a client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await.context("creating kube client from default config")?;
    Ok(client)
}

/// kube-rs backed [`ClusterApi`]. Every call is bounded by `call_timeout`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    call_timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>, call_timeout: Duration) -> Self {
        Self { client, namespace: namespace.into(), call_timeout }
    }

    pub async fn try_default(namespace: &str, call_timeout: Duration) -> Result<Self> {
        let client = get_kube_client().await?;
        info!(ns = %namespace, timeout_ms = %call_timeout.as_millis(), "kube cluster ready");
        Ok(Self::new(client, namespace, call_timeout))
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> { Api::namespaced(self.client.clone(), &self.namespace) }

    fn deployments(&self) -> Api<Deployment> { Api::namespaced(self.client.clone(), &self.namespace) }

    async fn bounded<T, F>(&self, kind: Kind, name: &str, op: &'static str, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        debug!(%kind, name = %name, op, "cluster call");
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                counter!("cluster_call_err", 1u64);
                Err(ClusterError::from_kube(kind, name, e))
            }
            Err(_) => {
                counter!("cluster_call_timeout", 1u64);
                Err(ClusterError::Timeout { kind, name: name.to_string(), after: self.call_timeout })
            }
        }
    }
}

fn object_name(kind: Kind, name: Option<&String>) -> Result<String, ClusterError> {
    name.cloned().ok_or_else(|| ClusterError::Api {
        kind,
        name: String::new(),
        code: None,
        message: "descriptor missing metadata.name".into(),
    })
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    fn namespace(&self) -> &str { &self.namespace }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        let kind = Kind::PersistentVolumeClaim;
        let name = object_name(kind, pvc.metadata.name.as_ref())?;
        let api = self.pvcs();
        self.bounded(kind, &name, "create", api.create(&PostParams::default(), pvc)).await.map(|_| ())
    }

    async fn get_pvc(&self, name: &str) -> Result<PersistentVolumeClaim, ClusterError> {
        let api = self.pvcs();
        self.bounded(Kind::PersistentVolumeClaim, name, "get", api.get(name)).await
    }

    async fn delete_pvc(&self, name: &str) -> Result<(), ClusterError> {
        let api = self.pvcs();
        self.bounded(Kind::PersistentVolumeClaim, name, "delete", api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }

    async fn clear_pvc_finalizers(&self, name: &str) -> Result<(), ClusterError> {
        let api = self.pvcs();
        let patch = serde_json::json!({"metadata": {"finalizers": null}});
        let pp = PatchParams::default();
        self.bounded(Kind::PersistentVolumeClaim, name, "clear-finalizers", api.patch(name, &pp, &Patch::Merge(&patch)))
            .await
            .map(|_| ())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let kind = Kind::Deployment;
        let name = object_name(kind, deployment.metadata.name.as_ref())?;
        let api = self.deployments();
        self.bounded(kind, &name, "create", api.create(&PostParams::default(), deployment)).await.map(|_| ())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        let api = self.deployments();
        self.bounded(Kind::Deployment, name, "get", api.get(name)).await
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let kind = Kind::Deployment;
        let name = object_name(kind, deployment.metadata.name.as_ref())?;
        let api = self.deployments();
        self.bounded(kind, &name, "replace", api.replace(&name, &PostParams::default(), deployment))
            .await
            .map(|_| ())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), ClusterError> {
        let api = self.deployments();
        self.bounded(Kind::Deployment, name, "delete", api.delete(name, &DeleteParams::background()))
            .await
            .map(|_| ())
    }

    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError> {
        let api = self.deployments();
        let payload = serde_json::json!({"spec": {"replicas": replicas}});
        let pp = PatchParams::default();
        self.bounded(Kind::Deployment, name, "scale", api.patch_scale(name, &pp, &Patch::Merge(&payload)))
            .await
            .map(|_| ())
    }
}
