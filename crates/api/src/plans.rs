//! Entitlement lookup. The billing side is an external collaborator; this
//! module only defines the seam and a static plan table.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use longhall_core::Entitlements;
use serde::{Deserialize, Serialize};

use crate::{ApiError, ApiResult};

#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    async fn entitlements(&self, subscription: &str) -> ApiResult<Entitlements>;
}

/// Plan table keyed by subscription id, optionally with a catch-all plan.
///
/// ```yaml
/// plans:
///   basic:   { cpu: 2, memory_gi: 4,  max_backups: 2, max_worlds: 1 }
///   premium: { cpu: 8, memory_gi: 16, max_backups: 10, max_worlds: 5, world_upload: true }
/// fallback: { cpu: 1, memory_gi: 2, max_backups: 1, max_worlds: 1 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPlans {
    #[serde(default)]
    pub plans: BTreeMap<String, Entitlements>,
    #[serde(default)]
    pub fallback: Option<Entitlements>,
}

impl StaticPlans {
    pub fn from_yaml(text: &str) -> Result<Self> { serde_yaml::from_str(text).context("parsing plan table") }

    pub fn from_path(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading plan table {}", path))?;
        Self::from_yaml(&text)
    }

    pub fn with_plan(mut self, subscription: impl Into<String>, ent: Entitlements) -> Self {
        self.plans.insert(subscription.into(), ent);
        self
    }

    /// Plans shipped with the binary when no table is configured.
    pub fn builtin() -> Self {
        let plan = |cpu, memory_gi, max_backups, max_worlds, world_upload| Entitlements {
            cpu,
            memory_gi,
            max_backups,
            max_worlds,
            world_upload,
        };
        Self::default()
            .with_plan("basic", plan(2, 4, 2, 1, false))
            .with_plan("standard", plan(4, 8, 5, 3, false))
            .with_plan("premium", plan(8, 16, 10, 5, true))
    }
}

#[async_trait]
impl EntitlementProvider for StaticPlans {
    async fn entitlements(&self, subscription: &str) -> ApiResult<Entitlements> {
        self.plans
            .get(subscription)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| ApiError::Precondition(format!("no plan for subscription {:?}", subscription)))
    }
}
