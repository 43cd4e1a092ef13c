//! Server lifecycle: Absent -> Running <-> Terminated -> Absent.
//!
//! Every operation takes the tenant lock first, so at most one operation per
//! tenant touches the cluster and the store at a time. Requests are validated
//! before anything is read, and preconditions are checked before any cluster
//! call. Each operation gets its own [`Provisioner`], so pending actions never
//! leak between calls.

use std::sync::Arc;
use std::time::Instant;

use longhall_apply::manifests::{self, ManifestConfig};
use longhall_apply::{Provisioner, ResourceAction, SettlePolicy};
use longhall_core::{Server, ServerRequest, ServerState, Tenant, TenantId, WorldDetails};
use longhall_kubehub::{ClusterApi, IngressSource};
use longhall_persist::{ServerRecord, Store};
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::plans::EntitlementProvider;
use crate::{ApiError, ApiResult, ScaleRequest, ServerView, TenantLocks};

pub struct ServerController {
    cluster: Arc<dyn ClusterApi>,
    ingress: Arc<dyn IngressSource>,
    store: Arc<dyn Store>,
    plans: Arc<dyn EntitlementProvider>,
    manifests: ManifestConfig,
    settle: SettlePolicy,
    locks: TenantLocks,
}

fn now_ts() -> i64 { chrono::Utc::now().timestamp() }

fn observe<T>(op: &'static str, t0: Instant, res: &ApiResult<T>) {
    let ms = t0.elapsed().as_secs_f64() * 1000.0;
    match op {
        "create" => histogram!("lifecycle_create_ms", ms),
        "patch" => histogram!("lifecycle_patch_ms", ms),
        "scale" => histogram!("lifecycle_scale_ms", ms),
        _ => histogram!("lifecycle_delete_ms", ms),
    }
    if res.is_err() {
        counter!("lifecycle_errors_total", 1u64, "op" => op);
    }
}

impl ServerController {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        ingress: Arc<dyn IngressSource>,
        store: Arc<dyn Store>,
        plans: Arc<dyn EntitlementProvider>,
        manifests: ManifestConfig,
    ) -> Self {
        Self { cluster, ingress, store, plans, manifests, settle: SettlePolicy::default(), locks: TenantLocks::new() }
    }

    pub fn with_settle(mut self, settle: SettlePolicy) -> Self {
        self.settle = settle;
        self
    }

    fn provisioner(&self) -> Provisioner { Provisioner::new(self.cluster.clone(), self.ingress.clone()) }

    fn find(&self, tenant: &TenantId) -> ApiResult<Option<ServerRecord>> {
        self.store.find_server(tenant).map_err(ApiError::persistence)
    }

    fn require(&self, tenant: &TenantId) -> ApiResult<ServerRecord> {
        self.find(tenant)?.ok_or_else(|| ApiError::NotFound(format!("no server for tenant {}", tenant)))
    }

    /// Current server for `tenant`, world details redacted.
    pub fn show(&self, tenant: &Tenant) -> ApiResult<ServerView> { ServerView::lookup(self.store.as_ref(), &tenant.id) }

    pub async fn create(&self, req: &ServerRequest, tenant: &Tenant) -> ApiResult<ServerView> {
        let t0 = Instant::now();
        let res = self.create_locked(req, tenant).await;
        observe("create", t0, &res);
        match &res {
            Ok(v) => info!(tenant = %tenant.id, cpu = v.server.cpu_requests, memory_gi = v.server.memory_requests, took_ms = %t0.elapsed().as_millis(), "create ok"),
            Err(e) => warn!(tenant = %tenant.id, error = %e, "create failed"),
        }
        res
    }

    async fn create_locked(&self, req: &ServerRequest, tenant: &Tenant) -> ApiResult<ServerView> {
        let _guard = self.locks.lock(&tenant.id).await;
        req.validate()?;
        if self.find(&tenant.id)?.is_some() {
            return Err(ApiError::Precondition(format!("server already exists for tenant {}", tenant.id)));
        }
        let ent = self.plans.entitlements(&tenant.subscription).await?;
        let world = WorldDetails::from_request(req, &ent, WorldDetails::new_instance_id())?;

        let mut prov = self.provisioner();
        let pvc_name = tenant.id.pvc_name();
        let deployment_name = tenant.id.deployment_name();
        if prov.does_exist(&pvc_name).await {
            warn!(tenant = %tenant.id, name = %pvc_name, "claim left over from an earlier server; recreating");
            prov.remove_finalizers_and_delete_stuck(&pvc_name).await?;
            prov.wait_until_absent(&pvc_name, &self.settle).await?;
        }

        prov.add_action(ResourceAction::pvc(manifests::pvc(&self.manifests, &tenant.id)));
        prov.add_action(ResourceAction::deployment(manifests::deployment(&self.manifests, &tenant.id, &world)));
        prov.apply_resources().await?;

        let server_ip = match prov.cluster_ingress_address().await {
            Ok(ip) => ip,
            Err(e) => {
                // Nothing is persisted yet, so a server nobody can reach is removed again.
                let ns = self.cluster.namespace();
                prov.add_action(ResourceAction::deployment(manifests::deployment_ref(ns, &deployment_name)));
                prov.add_action(ResourceAction::pvc(manifests::pvc_ref(ns, &pvc_name)));
                if let Err(re) = prov.rollback().await {
                    warn!(tenant = %tenant.id, error = %re, "cleanup after ingress failure incomplete");
                }
                return Err(e.into());
            }
        };

        let now = now_ts();
        let server = Server {
            tenant: tenant.id.clone(),
            server_ip,
            port: world.port,
            cpu_requests: world.cpu_requests,
            memory_requests: world.memory_requests,
            cpu_limit: ent.cpu,
            memory_limit: ent.memory_gi,
            pvc_name,
            deployment_name,
            state: ServerState::Running,
            created_at: now,
            updated_at: now,
        };
        let record = ServerRecord { server, world };
        if let Err(e) = self.store.save_server(&record) {
            warn!(tenant = %tenant.id, error = %e, "cluster resources applied but record not saved");
            return Err(ApiError::persistence(e));
        }
        Ok(ServerView::new(record.server, &record.world))
    }

    pub async fn patch(&self, req: &ServerRequest, tenant: &Tenant) -> ApiResult<ServerView> {
        let t0 = Instant::now();
        let res = self.patch_locked(req, tenant).await;
        observe("patch", t0, &res);
        match &res {
            Ok(_) => info!(tenant = %tenant.id, took_ms = %t0.elapsed().as_millis(), "patch ok"),
            Err(e) => warn!(tenant = %tenant.id, error = %e, "patch failed"),
        }
        res
    }

    async fn patch_locked(&self, req: &ServerRequest, tenant: &Tenant) -> ApiResult<ServerView> {
        let _guard = self.locks.lock(&tenant.id).await;
        req.validate()?;
        let rec = self.require(&tenant.id)?;
        let ent = self.plans.entitlements(&tenant.subscription).await?;
        let world = WorldDetails::from_request(req, &ent, WorldDetails::new_instance_id())?;

        self.sync_game_args(&rec.server.deployment_name, &world).await?;

        let updated = self
            .store
            .update_world_details(&tenant.id, &rec.world.world, &rec.world.name, &world)
            .map_err(ApiError::persistence)?;
        if !updated {
            return Err(ApiError::Persistence(format!(
                "world {:?} of server {:?} not found for tenant {}",
                rec.world.world, rec.world.name, tenant.id
            )));
        }
        // Requests stay as granted on the deployment; only the args were replaced.
        let server = Server {
            port: world.port,
            cpu_limit: ent.cpu,
            memory_limit: ent.memory_gi,
            updated_at: now_ts(),
            ..rec.server
        };
        self.store.update_server(&server).map_err(ApiError::persistence)?;
        Ok(ServerView::new(server, &world))
    }

    pub async fn scale(&self, req: ScaleRequest, tenant: &Tenant) -> ApiResult<ServerView> {
        let t0 = Instant::now();
        let res = self.scale_locked(req, tenant).await;
        observe("scale", t0, &res);
        match &res {
            Ok(v) => info!(tenant = %tenant.id, state = %v.server.state, took_ms = %t0.elapsed().as_millis(), "scale ok"),
            Err(e) => warn!(tenant = %tenant.id, replicas = req.replicas, error = %e, "scale failed"),
        }
        res
    }

    async fn scale_locked(&self, req: ScaleRequest, tenant: &Tenant) -> ApiResult<ServerView> {
        let _guard = self.locks.lock(&tenant.id).await;
        let rec = self.require(&tenant.id)?;
        let target = rec.server.state.scale_target(req.replicas).ok_or_else(|| {
            ApiError::Precondition(format!("cannot scale a {} server to {} replicas", rec.server.state, req.replicas))
        })?;

        // The deployment may have drifted from the stored config; restore it first.
        self.sync_game_args(&rec.server.deployment_name, &rec.world).await?;
        self.cluster.scale_deployment(&rec.server.deployment_name, req.replicas).await?;

        let server = Server { state: target, updated_at: now_ts(), ..rec.server };
        self.store.update_server(&server).map_err(ApiError::persistence)?;
        Ok(ServerView::new(server, &rec.world))
    }

    pub async fn delete(&self, tenant: &Tenant) -> ApiResult<Vec<String>> {
        let t0 = Instant::now();
        let res = self.delete_locked(tenant).await;
        observe("delete", t0, &res);
        match &res {
            Ok(names) => info!(tenant = %tenant.id, deleted = ?names, took_ms = %t0.elapsed().as_millis(), "delete ok"),
            Err(e) => warn!(tenant = %tenant.id, error = %e, "delete failed"),
        }
        res
    }

    async fn delete_locked(&self, tenant: &Tenant) -> ApiResult<Vec<String>> {
        let _guard = self.locks.lock(&tenant.id).await;
        let (deployment_name, pvc_name) = match self.find(&tenant.id)? {
            Some(rec) => (rec.server.deployment_name, rec.server.pvc_name),
            None => {
                info!(tenant = %tenant.id, "no stored server; deleting by derived names");
                (tenant.id.deployment_name(), tenant.id.pvc_name())
            }
        };

        let ns = self.cluster.namespace();
        let mut prov = self.provisioner();
        prov.add_action(ResourceAction::deployment(manifests::deployment_ref(ns, &deployment_name)));
        prov.add_action(ResourceAction::pvc(manifests::pvc_ref(ns, &pvc_name)));
        // Rows go only once the cluster side is gone.
        let deleted = prov.rollback().await?;

        self.store.delete_server(&tenant.id).map_err(ApiError::persistence)?;
        Ok(deleted)
    }

    /// Point the game container of `deployment` at `world`'s launch args.
    async fn sync_game_args(&self, deployment: &str, world: &WorldDetails) -> ApiResult<()> {
        let mut d = self.cluster.get_deployment(deployment).await?;
        if !manifests::set_game_args(&mut d, world.launch_args()) {
            return Err(ApiError::Internal(format!("deployment {} has no game container", deployment)));
        }
        self.cluster.replace_deployment(&d).await?;
        Ok(())
    }
}
