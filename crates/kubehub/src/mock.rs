//! In-memory cluster for tests. Records every call in order, supports
//! failure injection per (operation, name) and models finalizers: deleting
//! a claim that still has finalizers leaves it terminating until they are
//! cleared.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use k8s_openapi::api::{apps::v1::Deployment, core::v1::PersistentVolumeClaim};

use crate::{ClusterApi, ClusterError, Kind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreatePvc,
    GetPvc,
    DeletePvc,
    ClearFinalizers,
    CreateDeployment,
    GetDeployment,
    ReplaceDeployment,
    DeleteDeployment,
    ScaleDeployment,
}

impl Op {
    pub fn is_mutation(&self) -> bool { !matches!(self, Op::GetPvc | Op::GetDeployment) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub name: String,
}

#[derive(Default)]
struct State {
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    deployments: BTreeMap<String, Deployment>,
    terminating: HashSet<String>,
    /// Claims that keep answering `get` for this many more calls after deletion.
    lingering: HashMap<String, usize>,
    failures: HashSet<(Op, String)>,
    calls: Vec<Call>,
}

pub struct MockCluster {
    namespace: String,
    state: Mutex<State>,
}

impl Default for MockCluster {
    fn default() -> Self { Self::new("test") }
}

impl MockCluster {
    pub fn new(namespace: &str) -> Self { Self { namespace: namespace.to_string(), state: Mutex::new(State::default()) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded calls from others.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make every `op` on `name` fail with a 500 until cleared.
    pub fn fail_on(&self, op: Op, name: &str) { self.lock().failures.insert((op, name.to_string())); }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }

    /// Seed a claim directly, bypassing the call log.
    pub fn insert_pvc(&self, pvc: PersistentVolumeClaim) {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.lock().pvcs.insert(name, pvc);
    }

    pub fn insert_deployment(&self, d: Deployment) {
        let name = d.metadata.name.clone().unwrap_or_default();
        self.lock().deployments.insert(name, d);
    }

    /// Keep a deleted claim visible to `get` for `polls` more lookups.
    pub fn linger(&self, name: &str, polls: usize) { self.lock().lingering.insert(name.to_string(), polls); }

    pub fn has_pvc(&self, name: &str) -> bool { self.lock().pvcs.contains_key(name) }

    pub fn has_deployment(&self, name: &str) -> bool { self.lock().deployments.contains_key(name) }

    pub fn deployment(&self, name: &str) -> Option<Deployment> { self.lock().deployments.get(name).cloned() }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> { self.lock().pvcs.get(name).cloned() }

    pub fn is_terminating(&self, name: &str) -> bool { self.lock().terminating.contains(name) }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn mutations(&self) -> Vec<Call> { self.calls().into_iter().filter(|c| c.op.is_mutation()).collect() }

    pub fn reset_calls(&self) { self.lock().calls.clear(); }

    fn record(st: &mut State, op: Op, name: &str, kind: Kind) -> Result<(), ClusterError> {
        st.calls.push(Call { op, name: name.to_string() });
        if st.failures.contains(&(op, name.to_string())) {
            return Err(ClusterError::Api { kind, name: name.to_string(), code: Some(500), message: "injected failure".into() });
        }
        Ok(())
    }

    fn not_found(kind: Kind, name: &str) -> ClusterError { ClusterError::NotFound { kind, name: name.to_string() } }

    fn conflict(kind: Kind, name: &str) -> ClusterError {
        ClusterError::Api { kind, name: name.to_string(), code: Some(409), message: "already exists".into() }
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockCluster {
    fn namespace(&self) -> &str { &self.namespace }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        let kind = Kind::PersistentVolumeClaim;
        let name = pvc.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        Self::record(&mut st, Op::CreatePvc, &name, kind)?;
        if st.pvcs.contains_key(&name) {
            return Err(Self::conflict(kind, &name));
        }
        st.pvcs.insert(name, pvc.clone());
        Ok(())
    }

    async fn get_pvc(&self, name: &str) -> Result<PersistentVolumeClaim, ClusterError> {
        let kind = Kind::PersistentVolumeClaim;
        let mut st = self.lock();
        Self::record(&mut st, Op::GetPvc, name, kind)?;
        if let Some(pvc) = st.pvcs.get(name).cloned() {
            return Ok(pvc);
        }
        if let Some(left) = st.lingering.get_mut(name) {
            if *left > 0 {
                *left -= 1;
                let mut ghost = PersistentVolumeClaim::default();
                ghost.metadata.name = Some(name.to_string());
                return Ok(ghost);
            }
        }
        Err(Self::not_found(kind, name))
    }

    async fn delete_pvc(&self, name: &str) -> Result<(), ClusterError> {
        let kind = Kind::PersistentVolumeClaim;
        let mut st = self.lock();
        Self::record(&mut st, Op::DeletePvc, name, kind)?;
        let has_finalizers = match st.pvcs.get(name) {
            None => return Err(Self::not_found(kind, name)),
            Some(p) => p.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()),
        };
        if has_finalizers {
            st.terminating.insert(name.to_string());
        } else {
            st.pvcs.remove(name);
        }
        Ok(())
    }

    async fn clear_pvc_finalizers(&self, name: &str) -> Result<(), ClusterError> {
        let kind = Kind::PersistentVolumeClaim;
        let mut st = self.lock();
        Self::record(&mut st, Op::ClearFinalizers, name, kind)?;
        match st.pvcs.get_mut(name) {
            None => return Err(Self::not_found(kind, name)),
            Some(p) => p.metadata.finalizers = None,
        }
        if st.terminating.remove(name) {
            st.pvcs.remove(name);
        }
        Ok(())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let kind = Kind::Deployment;
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        Self::record(&mut st, Op::CreateDeployment, &name, kind)?;
        if st.deployments.contains_key(&name) {
            return Err(Self::conflict(kind, &name));
        }
        st.deployments.insert(name, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        let kind = Kind::Deployment;
        let mut st = self.lock();
        Self::record(&mut st, Op::GetDeployment, name, kind)?;
        st.deployments.get(name).cloned().ok_or_else(|| Self::not_found(kind, name))
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let kind = Kind::Deployment;
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut st = self.lock();
        Self::record(&mut st, Op::ReplaceDeployment, &name, kind)?;
        match st.deployments.get_mut(&name) {
            None => Err(Self::not_found(kind, &name)),
            Some(d) => {
                *d = deployment.clone();
                Ok(())
            }
        }
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), ClusterError> {
        let kind = Kind::Deployment;
        let mut st = self.lock();
        Self::record(&mut st, Op::DeleteDeployment, name, kind)?;
        st.deployments.remove(name).map(|_| ()).ok_or_else(|| Self::not_found(kind, name))
    }

    async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError> {
        let kind = Kind::Deployment;
        let mut st = self.lock();
        Self::record(&mut st, Op::ScaleDeployment, name, kind)?;
        let d = st.deployments.get_mut(name).ok_or_else(|| Self::not_found(kind, name))?;
        d.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        Ok(())
    }
}
