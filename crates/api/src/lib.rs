//! Longhall lifecycle API.
//!
//! This crate is what frontends (the CLI today) depend on: request/response
//! types, the typed error, and the [`ServerController`] that drives create,
//! patch, scale and delete for one tenant's server.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use longhall_apply::ApplyError;
use longhall_core::{Server, ValidationError, WorldDetails};
use longhall_kubehub::ClusterError;
use longhall_persist::Store;

pub mod controller;
pub mod locks;
pub mod plans;
pub mod settings;

pub use controller::ServerController;
pub use locks::TenantLocks;
pub use longhall_core::{ServerRequest, ServerState, Tenant, TenantId};
pub use plans::{EntitlementProvider, StaticPlans};
pub use settings::Settings;

/// API errors, serializable so they can cross a process boundary unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("precondition: {0}")]
    Precondition(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self { ApiError::Validation(e.to_string()) }
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self { ApiError::Cluster(e.to_string()) }
}

impl From<ApplyError> for ApiError {
    fn from(e: ApplyError) -> Self { ApiError::Cluster(e.to_string()) }
}

impl ApiError {
    pub(crate) fn persistence(e: anyhow::Error) -> Self { ApiError::Persistence(format!("{:#}", e)) }
}

/// Replica request for scale. Only 0 and 1 are ever legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub replicas: i32,
}

/// What callers get back: the server row and its redacted world details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerView {
    pub server: Server,
    pub world: WorldDetails,
}

impl ServerView {
    pub(crate) fn new(server: Server, world: &WorldDetails) -> Self { Self { server, world: world.redacted() } }

    /// Read the tenant's server straight from `store`, without any cluster access.
    pub fn lookup(store: &dyn Store, tenant: &TenantId) -> ApiResult<Self> {
        let rec = store
            .find_server(tenant)
            .map_err(ApiError::persistence)?
            .ok_or_else(|| ApiError::NotFound(format!("no server for tenant {}", tenant)))?;
        Ok(Self::new(rec.server, &rec.world))
    }
}
