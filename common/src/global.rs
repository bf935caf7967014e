use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_TTL_SECS: u64 = 30;
const DEFAULT_MOUNT_BASE: &str = "/mnt/ceph";

/// Cluster-wide settings, stored once under `<prefix>/global-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub debug: bool,
    /// Lifetime of a supervisor's per-volume ownership claim.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_mount_base")]
    pub mount_base: PathBuf,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_mount_base() -> PathBuf {
    PathBuf::from(DEFAULT_MOUNT_BASE)
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            debug: false,
            ttl_secs: DEFAULT_TTL_SECS,
            mount_base: default_mount_base(),
        }
    }
}
