//! Longhall core types: tenants, servers, entitlements and world configuration.

#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod modifiers;
pub mod world;

pub use modifiers::{Modifier, ModifierInput, ModifierKey, Modifiers};
pub use world::{ServerRequest, WorldDetails, LOG_DIR, LOG_FILE};

/// Request validation failures. Raised before any state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: {reason}")]
    Field { field: &'static str, reason: String },
    #[error("unknown modifier key: {0}")]
    UnknownModifier(String),
    #[error("modifier {key}: value {value:?} not one of {allowed}")]
    ModifierValue { key: &'static str, value: String, allowed: String },
    #[error("modifier {0} given more than once")]
    DuplicateModifier(&'static str),
}

impl ValidationError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::Field { field, reason: reason.into() }
    }
}

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Tenant identity as handed over by the authentication layer.
///
/// Doubles as the suffix of every cluster object owned by the tenant, so it
/// must be a DNS-1123 label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub const MAX_LEN: usize = 40;

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(ValidationError::field("tenant", format!("length must be 1..={}", Self::MAX_LEN)));
        }
        if !DNS_LABEL.is_match(raw) {
            return Err(ValidationError::field("tenant", "must be a lowercase DNS label"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn deployment_name(&self) -> String { format!("valheim-{}", self.0) }

    pub fn pvc_name(&self) -> String { format!("valheim-{}-data", self.0) }
}

impl TryFrom<String> for TenantId {
    type Error = ValidationError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::parse(&value) }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self { value.0 }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Caller identity threaded into every lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// Billing subscription used to look up entitlements.
    pub subscription: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Running,
    Terminated,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Running => "running",
            ServerState::Terminated => "terminated",
        }
    }

    /// State reached by scaling to `replicas`, if the move is legal.
    /// Running only goes to 0 replicas, Terminated only to 1.
    pub fn scale_target(self, replicas: i32) -> Option<ServerState> {
        match (self, replicas) {
            (ServerState::Running, 0) => Some(ServerState::Terminated),
            (ServerState::Terminated, 1) => Some(ServerState::Running),
            _ => None,
        }
    }
}

impl std::str::FromStr for ServerState {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ServerState::Running),
            "terminated" => Ok(ServerState::Terminated),
            other => Err(ValidationError::field("state", format!("unknown state {:?}", other))),
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// One provisioned server per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub tenant: TenantId,
    pub server_ip: String,
    pub port: u16,
    /// Granted cores/GiB, always within the ceiling below.
    pub cpu_requests: u32,
    pub memory_requests: u32,
    /// Plan ceiling at the time of the last create/patch.
    pub cpu_limit: u32,
    pub memory_limit: u32,
    pub pvc_name: String,
    pub deployment_name: String,
    pub state: ServerState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Plan limits supplied by the billing collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlements {
    pub cpu: u32,
    pub memory_gi: u32,
    pub max_backups: u32,
    pub max_worlds: u32,
    #[serde(default)]
    pub world_upload: bool,
}

/// Requested value clamped to `ceiling`; unspecified means the ceiling itself.
pub fn clamp_to_ceiling(requested: Option<u32>, ceiling: u32) -> u32 {
    match requested {
        Some(v) => v.min(ceiling),
        None => ceiling,
    }
}
