//! Environment-driven settings (`LONGHALL_*`).

use std::time::Duration;

use longhall_apply::manifests::ManifestConfig;
use longhall_apply::SettlePolicy;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE: &str = "longhall";
pub const DEFAULT_SERVER_IMAGE: &str = "ghcr.io/longhall/valheim-server:latest";
pub const DEFAULT_SIDECAR_IMAGE: &str = "busybox:1.36";
pub const DEFAULT_INGRESS_URL: &str = "https://api.ipify.org";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub manifests: ManifestConfig,
    pub ingress_url: String,
    /// Deadline for each cluster call and the ingress lookup.
    pub call_timeout: Duration,
    pub settle: SettlePolicy,
    pub db_path: Option<String>,
    pub plans_path: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build settings from any key lookup; blank values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let text = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |k: &str, default: u64| text(k).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

        let backoff = Duration::from_millis(num("LONGHALL_SETTLE_BACKOFF_MS", 250).max(1));
        Self {
            manifests: ManifestConfig {
                namespace: text("LONGHALL_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                server_image: text("LONGHALL_SERVER_IMAGE").unwrap_or_else(|| DEFAULT_SERVER_IMAGE.to_string()),
                sidecar_image: text("LONGHALL_SIDECAR_IMAGE").unwrap_or_else(|| DEFAULT_SIDECAR_IMAGE.to_string()),
                storage_class: text("LONGHALL_STORAGE_CLASS"),
                volume_gi: u32::try_from(num("LONGHALL_VOLUME_GI", 10)).unwrap_or(10),
            },
            ingress_url: text("LONGHALL_INGRESS_URL").unwrap_or_else(|| DEFAULT_INGRESS_URL.to_string()),
            call_timeout: Duration::from_secs(num("LONGHALL_CALL_TIMEOUT_SECS", 30).max(1)),
            settle: SettlePolicy {
                timeout: Duration::from_secs(num("LONGHALL_SETTLE_TIMEOUT_SECS", 60)),
                initial_backoff: backoff,
                max_backoff: SettlePolicy::default().max_backoff.max(backoff),
            },
            db_path: text("LONGHALL_DB_PATH"),
            plans_path: text("LONGHALL_PLANS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let s = Settings::from_lookup(lookup(&[]));
        assert_eq!(s.manifests.namespace, "longhall");
        assert_eq!(s.manifests.volume_gi, 10);
        assert_eq!(s.manifests.storage_class, None);
        assert_eq!(s.ingress_url, DEFAULT_INGRESS_URL);
        assert_eq!(s.call_timeout, Duration::from_secs(30));
        assert_eq!(s.settle, SettlePolicy::default());
        assert!(s.db_path.is_none());
    }

    #[test]
    fn overrides_and_garbage() {
        let s = Settings::from_lookup(lookup(&[
            ("LONGHALL_NAMESPACE", "games"),
            ("LONGHALL_STORAGE_CLASS", "  "),
            ("LONGHALL_VOLUME_GI", "25"),
            ("LONGHALL_CALL_TIMEOUT_SECS", "soon"),
            ("LONGHALL_SETTLE_TIMEOUT_SECS", "5"),
            ("LONGHALL_PLANS", "/etc/longhall/plans.yaml"),
        ]));
        assert_eq!(s.manifests.namespace, "games");
        assert_eq!(s.manifests.storage_class, None);
        assert_eq!(s.manifests.volume_gi, 25);
        assert_eq!(s.call_timeout, Duration::from_secs(30));
        assert_eq!(s.settle.timeout, Duration::from_secs(5));
        assert_eq!(s.plans_path.as_deref(), Some("/etc/longhall/plans.yaml"));
    }
}
