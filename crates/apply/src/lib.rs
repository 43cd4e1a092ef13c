//! Longhall apply: reversible cluster actions and the provisioner that
//! applies them as a unit.
//!
//! A [`ResourceAction`] wraps one desired object and knows how to create it
//! and how to undo that creation. The [`Provisioner`] queues actions and
//! applies them strictly in order; on the first failure it rolls back the
//! whole queue. Rolling back an action that never applied is a delete of a
//! missing object, which counts as success, so the whole-queue rollback is
//! safe.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::{apps::v1::Deployment, core::v1::PersistentVolumeClaim};
use longhall_kubehub::{ClusterApi, ClusterError, IngressSource, Kind};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod manifests;

/// One cluster object the provisioner can create and delete.
#[derive(Debug, Clone)]
pub enum ResourceAction {
    Deployment(Box<Deployment>),
    Pvc(Box<PersistentVolumeClaim>),
}

impl ResourceAction {
    pub fn deployment(d: Deployment) -> Self { ResourceAction::Deployment(Box::new(d)) }

    pub fn pvc(p: PersistentVolumeClaim) -> Self { ResourceAction::Pvc(Box::new(p)) }

    pub fn kind(&self) -> Kind {
        match self {
            ResourceAction::Deployment(_) => Kind::Deployment,
            ResourceAction::Pvc(_) => Kind::PersistentVolumeClaim,
        }
    }

    /// Object name; stable whatever the outcome of apply/rollback.
    pub fn name(&self) -> &str {
        let n = match self {
            ResourceAction::Deployment(d) => d.metadata.name.as_deref(),
            ResourceAction::Pvc(p) => p.metadata.name.as_deref(),
        };
        n.unwrap_or_default()
    }

    /// Create the wrapped object.
    pub async fn apply(&self, cluster: &dyn ClusterApi) -> Result<String, ClusterError> {
        match self {
            ResourceAction::Deployment(d) => cluster.create_deployment(d).await?,
            ResourceAction::Pvc(p) => cluster.create_pvc(p).await?,
        }
        Ok(self.name().to_string())
    }

    /// Delete the object by name. Not found is success.
    pub async fn rollback(&self, cluster: &dyn ClusterApi) -> Result<String, ClusterError> {
        let res = match self {
            ResourceAction::Deployment(_) => cluster.delete_deployment(self.name()).await,
            ResourceAction::Pvc(_) => cluster.delete_pvc(self.name()).await,
        };
        match res {
            Ok(()) => Ok(self.name().to_string()),
            Err(e) if e.is_not_found() => {
                debug!(kind = %self.kind(), name = %self.name(), "already absent");
                Ok(self.name().to_string())
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// An action failed to apply; `applied` lists what went through before it.
    #[error("applying {name} failed: {source}")]
    Action {
        name: String,
        applied: Vec<String>,
        #[source]
        source: ClusterError,
    },
    #[error("rollback incomplete: {}", .failed.join("; "))]
    Rollback { deleted: Vec<String>, failed: Vec<String> },
    #[error("{name} still present after {}s", .after.as_secs())]
    SettleTimeout { name: String, after: Duration },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Stand-in deadline for timeouts too large to add to an instant.
const FOREVER: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Bounded polling used while waiting for a deleted claim to disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlePolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(60), initial_backoff: Duration::from_millis(250), max_backoff: Duration::from_secs(5) }
    }
}

/// Queue of pending actions over one cluster. Meant to live for a single
/// lifecycle operation; the queue is emptied by every apply or rollback.
pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    ingress: Arc<dyn IngressSource>,
    pending: Vec<ResourceAction>,
}

impl Provisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, ingress: Arc<dyn IngressSource>) -> Self {
        Self { cluster, ingress, pending: Vec::new() }
    }

    pub fn cluster(&self) -> &dyn ClusterApi { self.cluster.as_ref() }

    pub fn add_action(&mut self, action: ResourceAction) { self.pending.push(action); }

    pub fn pending(&self) -> &[ResourceAction] { &self.pending }

    /// Apply every pending action in enqueue order. On the first failure the
    /// whole queue is rolled back (newest first) and the original error is
    /// returned; rollback problems are only logged.
    pub async fn apply_resources(&mut self) -> Result<Vec<String>, ApplyError> {
        let t0 = Instant::now();
        let pending = std::mem::take(&mut self.pending);
        let mut applied = Vec::with_capacity(pending.len());
        for action in &pending {
            match action.apply(self.cluster.as_ref()).await {
                Ok(name) => {
                    info!(kind = %action.kind(), name = %name, "applied");
                    applied.push(name);
                }
                Err(source) => {
                    counter!("provision_apply_err", 1u64);
                    warn!(kind = %action.kind(), name = %action.name(), error = %source, "apply failed; rolling back");
                    for undo in pending.iter().rev() {
                        counter!("provision_rollback_total", 1u64);
                        if let Err(e) = undo.rollback(self.cluster.as_ref()).await {
                            warn!(kind = %undo.kind(), name = %undo.name(), error = %e, "rollback failed");
                        }
                    }
                    return Err(ApplyError::Action { name: action.name().to_string(), applied, source });
                }
            }
        }
        histogram!("provision_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("provision_apply_ok", 1u64);
        Ok(applied)
    }

    /// Delete every pending action by name, continuing past failures.
    pub async fn rollback(&mut self) -> Result<Vec<String>, ApplyError> {
        let pending = std::mem::take(&mut self.pending);
        let mut deleted = Vec::with_capacity(pending.len());
        let mut failed = Vec::new();
        for action in &pending {
            counter!("provision_rollback_total", 1u64);
            match action.rollback(self.cluster.as_ref()).await {
                Ok(name) => {
                    info!(kind = %action.kind(), name = %name, "deleted");
                    deleted.push(name);
                }
                Err(e) => {
                    warn!(kind = %action.kind(), name = %action.name(), error = %e, "delete failed");
                    failed.push(e.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(deleted)
        } else {
            Err(ApplyError::Rollback { deleted, failed })
        }
    }

    /// Whether a claim named `name` exists. Lookup errors read as absent.
    pub async fn does_exist(&self, name: &str) -> bool {
        match self.cluster.get_pvc(name).await {
            Ok(_) => true,
            Err(e) => {
                if !e.is_not_found() {
                    debug!(name = %name, error = %e, "claim lookup failed; treating as absent");
                }
                false
            }
        }
    }

    /// Strip finalizers from a claim stuck terminating, then delete it.
    /// A missing claim is a no-op.
    pub async fn remove_finalizers_and_delete_stuck(&self, name: &str) -> Result<(), ApplyError> {
        match self.cluster.clear_pvc_finalizers(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match self.cluster.delete_pvc(name).await {
            Ok(()) => {
                info!(name = %name, "stuck claim deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the claim is gone, doubling the pause up to `max_backoff`.
    pub async fn wait_until_absent(&self, name: &str, policy: &SettlePolicy) -> Result<(), ApplyError> {
        let started = tokio::time::Instant::now();
        // An unrepresentable deadline means waiting without limit.
        let deadline = started.checked_add(policy.timeout).unwrap_or_else(|| started + FOREVER);
        let mut backoff = policy.initial_backoff;
        loop {
            if !self.does_exist(name).await {
                debug!(name = %name, waited_ms = %started.elapsed().as_millis(), "claim settled");
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ApplyError::SettleTimeout { name: name.to_string(), after: policy.timeout });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = backoff.saturating_mul(2).min(policy.max_backoff);
        }
    }

    /// Address players use to reach the server.
    pub async fn cluster_ingress_address(&self) -> Result<String, ApplyError> {
        Ok(self.ingress.address().await?)
    }
}
