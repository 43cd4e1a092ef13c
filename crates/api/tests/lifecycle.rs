use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use longhall_api::{
    ApiError, ScaleRequest, ServerController, ServerRequest, ServerState, ServerView, StaticPlans, Tenant, TenantId,
};
use longhall_apply::manifests::{self, ManifestConfig};
use longhall_apply::SettlePolicy;
use longhall_core::{Entitlements, Server, WorldDetails};
use longhall_kubehub::mock::{Call, MockCluster, Op};
use longhall_kubehub::{ClusterApi, ClusterError, IngressSource, StaticIngress};
use longhall_persist::{MemoryStore, ServerRecord, Store};

fn cfg() -> ManifestConfig {
    ManifestConfig {
        namespace: "test".into(),
        server_image: "valheim:test".into(),
        sidecar_image: "busybox:test".into(),
        storage_class: None,
        volume_gi: 5,
    }
}

fn plans() -> Arc<StaticPlans> {
    Arc::new(StaticPlans::default().with_plan(
        "sub-1",
        Entitlements { cpu: 4, memory_gi: 16, max_backups: 3, max_worlds: 1, world_upload: false },
    ))
}

fn tenant() -> Tenant { Tenant { id: TenantId::parse("acme").unwrap(), subscription: "sub-1".into() } }

fn request() -> ServerRequest {
    serde_json::from_value(serde_json::json!({
        "name": "Mead Hall",
        "world": "Midgard",
        "password": "skol123",
        "cpu_requests": 8,
        "memory_requests": 32,
        "backup_count": 9,
        "modifiers": [{"key": "combat", "value": "hard"}],
    }))
    .unwrap()
}

fn fast_settle() -> SettlePolicy {
    SettlePolicy { timeout: Duration::from_secs(2), initial_backoff: Duration::from_millis(1), max_backoff: Duration::from_millis(4) }
}

struct Harness {
    cluster: Arc<MockCluster>,
    store: Arc<MemoryStore>,
    ctl: ServerController,
}

fn harness() -> Harness {
    let cluster = Arc::new(MockCluster::default());
    let store = Arc::new(MemoryStore::new());
    let ctl = ServerController::new(
        cluster.clone(),
        Arc::new(StaticIngress("203.0.113.7".into())),
        store.clone(),
        plans(),
        cfg(),
    )
    .with_settle(fast_settle());
    Harness { cluster, store, ctl }
}

fn stored(h: &Harness) -> ServerRecord { h.store.find_server(&tenant().id).unwrap().unwrap() }

fn game_args(c: &MockCluster) -> String {
    let d = c.deployment("valheim-acme").unwrap();
    manifests::game_args(&d).unwrap()[0].clone()
}

#[tokio::test]
async fn create_clamps_to_plan_and_hides_instance_id() {
    let h = harness();
    let view = h.ctl.create(&request(), &tenant()).await.unwrap();

    assert_eq!((view.server.cpu_requests, view.server.memory_requests), (4, 16));
    assert_eq!((view.server.cpu_limit, view.server.memory_limit), (4, 16));
    assert_eq!(view.server.state, ServerState::Running);
    assert_eq!(view.server.server_ip, "203.0.113.7");
    assert!(view.world.instance_id.is_empty());

    let rec = stored(&h);
    assert_eq!((rec.server.cpu_requests, rec.server.memory_requests), (4, 16));
    assert_eq!(rec.world.backup_count, 3);
    assert!(!rec.world.instance_id.is_empty());
    assert_eq!(game_args(&h.cluster), rec.world.launch_args());
    assert_eq!(
        h.cluster.mutations(),
        vec![
            Call { op: Op::CreatePvc, name: "valheim-acme-data".into() },
            Call { op: Op::CreateDeployment, name: "valheim-acme".into() },
        ]
    );
}

#[tokio::test]
async fn second_create_is_a_precondition_failure() {
    let h = harness();
    h.ctl.create(&request(), &tenant()).await.unwrap();
    h.cluster.reset_calls();
    let e = h.ctl.create(&request(), &tenant()).await.unwrap_err();
    assert!(matches!(e, ApiError::Precondition(_)));
    assert!(h.cluster.calls().is_empty());
}

#[tokio::test]
async fn invalid_request_touches_nothing() {
    let h = harness();
    let mut req = request();
    req.modifiers[0].value = "nightmare".into();
    let e = h.ctl.create(&req, &tenant()).await.unwrap_err();
    assert!(matches!(e, ApiError::Validation(_)));
    assert!(h.cluster.calls().is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn unknown_subscription_is_rejected_before_the_cluster() {
    let h = harness();
    let t = Tenant { id: TenantId::parse("acme").unwrap(), subscription: "nope".into() };
    let e = h.ctl.create(&request(), &t).await.unwrap_err();
    assert!(matches!(e, ApiError::Precondition(_)));
    assert!(h.cluster.calls().is_empty());
}

#[tokio::test]
async fn failed_deployment_leaves_no_trace() {
    let h = harness();
    h.cluster.fail_on(Op::CreateDeployment, "valheim-acme");
    let e = h.ctl.create(&request(), &tenant()).await.unwrap_err();
    assert!(matches!(&e, ApiError::Cluster(m) if m.contains("valheim-acme")), "e={:?}", e);
    assert!(!h.cluster.has_pvc("valheim-acme-data"));
    assert!(!h.cluster.has_deployment("valheim-acme"));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn scale_rejects_illegal_transitions_without_cluster_calls() {
    let h = harness();
    h.ctl.create(&request(), &tenant()).await.unwrap();
    h.cluster.reset_calls();

    let e = h.ctl.scale(ScaleRequest { replicas: 1 }, &tenant()).await.unwrap_err();
    match e {
        ApiError::Precondition(m) => assert!(m.contains("running") && m.contains('1'), "m={}", m),
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.cluster.calls().is_empty());
    assert_eq!(stored(&h).server.state, ServerState::Running);
}

#[tokio::test]
async fn scale_round_trip_resyncs_args() {
    let h = harness();
    h.ctl.create(&request(), &tenant()).await.unwrap();

    // Someone edits the deployment behind our back.
    let mut d = h.cluster.deployment("valheim-acme").unwrap();
    manifests::set_game_args(&mut d, "-name \"drift\"".into());
    h.cluster.insert_deployment(d);

    let v = h.ctl.scale(ScaleRequest { replicas: 0 }, &tenant()).await.unwrap();
    assert_eq!(v.server.state, ServerState::Terminated);
    assert_eq!(stored(&h).server.state, ServerState::Terminated);
    assert_eq!(game_args(&h.cluster), stored(&h).world.launch_args());
    let replicas = h.cluster.deployment("valheim-acme").unwrap().spec.unwrap().replicas;
    assert_eq!(replicas, Some(0));

    let e = h.ctl.scale(ScaleRequest { replicas: 0 }, &tenant()).await.unwrap_err();
    assert!(matches!(e, ApiError::Precondition(_)));

    let v = h.ctl.scale(ScaleRequest { replicas: 1 }, &tenant()).await.unwrap();
    assert_eq!(v.server.state, ServerState::Running);
    assert_eq!(h.cluster.deployment("valheim-acme").unwrap().spec.unwrap().replicas, Some(1));
}

#[tokio::test]
async fn patch_rewrites_args_and_world_details() {
    let h = harness();
    h.ctl.create(&request(), &tenant()).await.unwrap();
    let before = stored(&h);

    let mut req = request();
    req.public = false;
    req.modifiers.clear();
    let v = h.ctl.patch(&req, &tenant()).await.unwrap();
    assert!(v.world.instance_id.is_empty());
    assert!(!v.world.public);

    let after = stored(&h);
    assert_ne!(after.world.instance_id, before.world.instance_id);
    assert!(after.world.modifiers.is_empty());
    let args = game_args(&h.cluster);
    assert_eq!(args, after.world.launch_args());
    assert!(args.contains(" -public 0 "));
    assert!(!args.contains("-modifier"));
}

#[tokio::test]
async fn patch_without_server_is_not_found() {
    let h = harness();
    let e = h.ctl.patch(&request(), &tenant()).await.unwrap_err();
    assert!(matches!(e, ApiError::NotFound(_)));
    assert!(h.cluster.calls().is_empty());
}

#[tokio::test]
async fn patch_moves_port_and_limits_together() {
    let cluster = Arc::new(MockCluster::default());
    let store = Arc::new(MemoryStore::new());
    let plans = StaticPlans::default()
        .with_plan("sub-1", Entitlements { cpu: 4, memory_gi: 16, max_backups: 3, max_worlds: 1, world_upload: false })
        .with_plan("sub-2", Entitlements { cpu: 6, memory_gi: 24, max_backups: 5, max_worlds: 1, world_upload: false });
    let ctl = ServerController::new(
        cluster.clone(),
        Arc::new(StaticIngress("203.0.113.7".into())),
        store.clone(),
        Arc::new(plans),
        cfg(),
    );
    ctl.create(&request(), &tenant()).await.unwrap();

    let upgraded = Tenant { id: TenantId::parse("acme").unwrap(), subscription: "sub-2".into() };
    let mut req = request();
    req.port = Some(2600);
    let v = ctl.patch(&req, &upgraded).await.unwrap();

    let rec = store.find_server(&upgraded.id).unwrap().unwrap();
    assert_eq!(v.server.port, 2600);
    assert_eq!(rec.server.port, 2600);
    assert_eq!(rec.world.port, 2600);
    assert!(game_args(&cluster).contains(" -port 2600 "));
    assert_eq!((v.server.cpu_limit, v.server.memory_limit), (6, 24));
    assert_eq!((rec.server.cpu_limit, rec.server.memory_limit), (6, 24));
    // Requests were not re-applied to the deployment.
    assert_eq!((rec.server.cpu_requests, rec.server.memory_requests), (4, 16));
    assert_eq!(rec.world.backup_count, 5);
}

#[tokio::test]
async fn patch_clamps_requests_to_plan() {
    let h = harness();
    h.ctl.create(&request(), &tenant()).await.unwrap();

    let mut req = request();
    req.cpu_requests = Some(9);
    req.memory_requests = Some(64);
    req.backup_count = Some(50);
    h.ctl.patch(&req, &tenant()).await.unwrap();

    let rec = stored(&h);
    assert_eq!(rec.world.cpu_requests, 4);
    assert_eq!(rec.world.memory_requests, 16);
    assert_eq!(rec.world.backup_count, 3);
    assert!(game_args(&h.cluster).contains(" -backups 3 "));
}

/// Accepts every call but refuses to save new servers.
struct UnsavableStore(MemoryStore);

impl Store for UnsavableStore {
    fn find_server(&self, tenant: &TenantId) -> anyhow::Result<Option<ServerRecord>> { self.0.find_server(tenant) }
    fn save_server(&self, _record: &ServerRecord) -> anyhow::Result<()> { Err(anyhow::anyhow!("disk full")) }
    fn update_server(&self, server: &Server) -> anyhow::Result<()> { self.0.update_server(server) }
    fn update_world_details(&self, t: &TenantId, w: &str, n: &str, d: &WorldDetails) -> anyhow::Result<bool> {
        self.0.update_world_details(t, w, n, d)
    }
    fn delete_server(&self, tenant: &TenantId) -> anyhow::Result<bool> { self.0.delete_server(tenant) }
}

#[tokio::test]
async fn failed_save_keeps_applied_resources() {
    let cluster = Arc::new(MockCluster::default());
    let ctl = ServerController::new(
        cluster.clone(),
        Arc::new(StaticIngress("203.0.113.7".into())),
        Arc::new(UnsavableStore(MemoryStore::new())),
        plans(),
        cfg(),
    );
    let e = ctl.create(&request(), &tenant()).await.unwrap_err();
    assert!(matches!(&e, ApiError::Persistence(m) if m.contains("disk full")), "e={:?}", e);
    assert!(cluster.has_pvc("valheim-acme-data"));
    assert!(cluster.has_deployment("valheim-acme"));
    assert!(!cluster.mutations().iter().any(|c| matches!(c.op, Op::DeletePvc | Op::DeleteDeployment)));
}

/// Checks, at the moment rows are removed, that the cluster side is gone.
struct OrderedStore {
    inner: MemoryStore,
    cluster: Arc<MockCluster>,
    checked: AtomicBool,
}

impl Store for OrderedStore {
    fn find_server(&self, tenant: &TenantId) -> anyhow::Result<Option<ServerRecord>> { self.inner.find_server(tenant) }
    fn save_server(&self, record: &ServerRecord) -> anyhow::Result<()> { self.inner.save_server(record) }
    fn update_server(&self, server: &Server) -> anyhow::Result<()> { self.inner.update_server(server) }
    fn update_world_details(&self, t: &TenantId, w: &str, n: &str, d: &WorldDetails) -> anyhow::Result<bool> {
        self.inner.update_world_details(t, w, n, d)
    }
    fn delete_server(&self, tenant: &TenantId) -> anyhow::Result<bool> {
        assert!(!self.cluster.has_deployment("valheim-acme"));
        assert!(!self.cluster.has_pvc("valheim-acme-data"));
        self.checked.store(true, Ordering::SeqCst);
        self.inner.delete_server(tenant)
    }
}

#[tokio::test]
async fn delete_with_claim_already_gone() {
    let cluster = Arc::new(MockCluster::default());
    let store = Arc::new(OrderedStore { inner: MemoryStore::new(), cluster: cluster.clone(), checked: AtomicBool::new(false) });
    let ctl = ServerController::new(
        cluster.clone(),
        Arc::new(StaticIngress("203.0.113.7".into())),
        store.clone(),
        plans(),
        cfg(),
    );
    ctl.create(&request(), &tenant()).await.unwrap();
    cluster.delete_pvc("valheim-acme-data").await.unwrap();

    let names = ctl.delete(&tenant()).await.unwrap();
    assert_eq!(names, vec!["valheim-acme", "valheim-acme-data"]);
    assert!(store.checked.load(Ordering::SeqCst));
    assert!(store.find_server(&tenant().id).unwrap().is_none());
    assert!(!cluster.has_deployment("valheim-acme"));
}

#[tokio::test]
async fn failed_cluster_delete_keeps_the_record() {
    let h = harness();
    h.ctl.create(&request(), &tenant()).await.unwrap();
    h.cluster.fail_on(Op::DeletePvc, "valheim-acme-data");
    let e = h.ctl.delete(&tenant()).await.unwrap_err();
    assert!(matches!(e, ApiError::Cluster(_)));
    assert!(h.store.find_server(&tenant().id).unwrap().is_some());
    assert!(!h.cluster.has_deployment("valheim-acme"));

    h.cluster.clear_failures();
    h.ctl.delete(&tenant()).await.unwrap();
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn delete_cleans_orphans_without_a_record() {
    let h = harness();
    h.cluster.insert_deployment(manifests::deployment_ref("test", "valheim-acme"));
    let names = h.ctl.delete(&tenant()).await.unwrap();
    assert_eq!(names, vec!["valheim-acme", "valheim-acme-data"]);
    assert!(!h.cluster.has_deployment("valheim-acme"));
}

#[tokio::test]
async fn stuck_claim_is_recreated() {
    let h = harness();
    let mut stuck = manifests::pvc_ref("test", "valheim-acme-data");
    stuck.metadata.finalizers = Some(vec!["kubernetes.io/pvc-protection".into()]);
    h.cluster.insert_pvc(stuck);
    h.cluster.linger("valheim-acme-data", 2);

    h.ctl.create(&request(), &tenant()).await.unwrap();

    let ops: Vec<Op> = h.cluster.mutations().into_iter().map(|c| c.op).collect();
    assert_eq!(ops, vec![Op::ClearFinalizers, Op::DeletePvc, Op::CreatePvc, Op::CreateDeployment]);
    let fresh = h.cluster.pvc("valheim-acme-data").unwrap();
    assert!(fresh.metadata.finalizers.is_none());
    assert!(fresh.spec.is_some());
}

struct DownIngress;

#[async_trait]
impl IngressSource for DownIngress {
    async fn address(&self) -> Result<String, ClusterError> { Err(ClusterError::Ingress("echo service unreachable".into())) }
}

#[tokio::test]
async fn ingress_failure_removes_fresh_resources() {
    let cluster = Arc::new(MockCluster::default());
    let store = Arc::new(MemoryStore::new());
    let ctl = ServerController::new(cluster.clone(), Arc::new(DownIngress), store.clone(), plans(), cfg());
    let e = ctl.create(&request(), &tenant()).await.unwrap_err();
    assert!(matches!(e, ApiError::Cluster(m) if m.contains("unreachable")));
    assert!(!cluster.has_pvc("valheim-acme-data"));
    assert!(!cluster.has_deployment("valheim-acme"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn concurrent_creates_for_one_tenant_yield_one_server() {
    let h = Arc::new(harness());
    let (req_a, ten_a, req_b, ten_b) = (request(), tenant(), request(), tenant());
    let (a, b) = tokio::join!(h.ctl.create(&req_a, &ten_a), h.ctl.create(&req_b, &ten_b));
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let creates = h.cluster.mutations().into_iter().filter(|c| c.op == Op::CreateDeployment).count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn show_redacts() {
    let h = harness();
    assert!(matches!(h.ctl.show(&tenant()), Err(ApiError::NotFound(_))));
    h.ctl.create(&request(), &tenant()).await.unwrap();
    let v = h.ctl.show(&tenant()).unwrap();
    assert!(v.world.instance_id.is_empty());
    assert_eq!(v.server.deployment_name, "valheim-acme");
}

#[tokio::test]
async fn stored_view_needs_no_cluster() {
    let h = harness();
    let store = MemoryStore::new();
    assert!(matches!(ServerView::lookup(&store, &tenant().id), Err(ApiError::NotFound(_))));

    h.ctl.create(&request(), &tenant()).await.unwrap();
    h.cluster.reset_calls();
    let v = ServerView::lookup(h.store.as_ref(), &tenant().id).unwrap();
    assert_eq!(v, h.ctl.show(&tenant()).unwrap());
    assert!(v.world.instance_id.is_empty());
    assert!(h.cluster.calls().is_empty());
}
